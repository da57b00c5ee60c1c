//! multipart 事件流分帧
//!
//! 设备以 `multipart/mixed` 长连接推送事件，各部分由边界标记分隔。
//! 字节块可能在任意位置被切开，分帧器负责重组。

use bytes::{Buf, Bytes, BytesMut};
use memchr::memmem;

use crate::error::DeviceError;

/// 响应头未声明 boundary 时使用的默认边界
pub const DEFAULT_BOUNDARY: &str = "--MIME_boundary";

/// 一个边界分隔的原始帧（头部行 + 正文）
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    raw: Bytes,
}

impl Frame {
    pub fn new(raw: impl Into<Bytes>) -> Self {
        Self { raw: raw.into() }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.raw
    }

    /// 由两个边界之间的片段构造帧：去掉开头的换行，空白片段返回 None
    fn from_part(mut part: Bytes) -> Option<Self> {
        let leading = part
            .iter()
            .take_while(|b| **b == b'\r' || **b == b'\n')
            .count();
        part.advance(leading);

        if part.iter().all(|b| b.is_ascii_whitespace()) {
            return None;
        }
        Some(Self { raw: part })
    }
}

/// 从 `Content-Type` 响应头解析边界
///
/// 优先使用头中的 `boundary=` 参数，其次是 `fallback`，最后是 [`DEFAULT_BOUNDARY`]。
/// 结果总是以 `--` 开头。
pub fn resolve_boundary(content_type: Option<&str>, fallback: Option<&str>) -> Vec<u8> {
    let declared = content_type.and_then(|ct| {
        ct.split(';').find_map(|param| {
            let (key, value) = param.trim().split_once('=')?;
            if !key.trim().eq_ignore_ascii_case("boundary") {
                return None;
            }
            let value = value.trim().trim_matches('"');
            (!value.is_empty()).then(|| value.to_string())
        })
    });

    let boundary = declared
        .or_else(|| fallback.map(str::to_string))
        .unwrap_or_else(|| DEFAULT_BOUNDARY.to_string());

    if boundary.starts_with("--") {
        boundary.into_bytes()
    } else {
        format!("--{}", boundary).into_bytes()
    }
}

/// 增量分帧器
///
/// 只追加的缓冲区：每收到一个字节块就追加并反复查找边界，
/// 边界之前的内容作为候选帧切出；缓冲区超过上限仍未出现边界时报错。
#[derive(Debug)]
pub struct MultipartFramer {
    boundary: Vec<u8>,
    buffer: BytesMut,
    max_buffer: usize,
}

impl MultipartFramer {
    pub fn new(boundary: Vec<u8>, max_buffer: usize) -> Self {
        Self {
            boundary,
            buffer: BytesMut::new(),
            max_buffer,
        }
    }

    /// 当前缓冲的字节数
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// 追加一个字节块，将切出的帧按顺序写入 `out`
    ///
    /// 返回错误前，同一字节块中已完整的帧仍会写入 `out`。
    pub fn push<E>(&mut self, chunk: &[u8], out: &mut E) -> Result<(), DeviceError>
    where
        E: Extend<Frame>,
    {
        self.buffer.extend_from_slice(chunk);

        let finder = memmem::Finder::new(&self.boundary);
        while let Some(index) = finder.find(&self.buffer) {
            let part = self.buffer.split_to(index).freeze();
            self.buffer.advance(self.boundary.len());
            if let Some(frame) = Frame::from_part(part) {
                out.extend(std::iter::once(frame));
            }
        }

        if self.buffer.len() > self.max_buffer {
            let size = self.buffer.len();
            self.buffer.clear();
            return Err(DeviceError::BufferOverflow { size });
        }
        Ok(())
    }
}
