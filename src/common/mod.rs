//! 公共工具模块

pub mod signal;

/// 日志中预览 payload 的默认字节上限
pub const PREVIEW_MAX_BYTES: usize = 256;

/// 安全地截断 UTF-8 字符串，确保不会在多字节字符中间截断
///
/// 返回不超过 `max_bytes` 字节的最长有效 UTF-8 子串
pub fn truncate_str_safe(s: &str, max_bytes: usize) -> &str {
    if s.len() <= max_bytes {
        return s;
    }

    let mut end = max_bytes;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }

    &s[..end]
}

/// 将任意字节转换为可读的日志预览
///
/// 非 UTF-8 内容做有损替换，超长内容截断并追加省略号
pub fn preview_bytes(bytes: &[u8], max_bytes: usize) -> String {
    let text = String::from_utf8_lossy(bytes);
    let text = text.trim();
    if text.len() <= max_bytes {
        return text.to_string();
    }

    // 为省略号预留空间
    let truncate_at = max_bytes.saturating_sub(3);
    format!("{}...", truncate_str_safe(text, truncate_at))
}
