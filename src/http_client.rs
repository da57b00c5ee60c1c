//! HTTP Client 构建模块
//!
//! Input: 连接超时
//! Output: reqwest::Client
//! Pos: 设备事件流会话使用的 HTTP 客户端

use reqwest::Client;
use std::time::Duration;

/// TCP keepalive 间隔，用于发现静默断开的长连接
const TCP_KEEPALIVE_SECS: u64 = 30;

/// 构建设备事件流 HTTP Client
///
/// 只设置连接超时：事件流在两次事件之间可能长时间空闲，读取阶段不能超时。
///
/// # Arguments
/// * `connect_timeout` - 建立连接的超时时间
pub fn build_client(connect_timeout: Duration) -> anyhow::Result<Client> {
    let client = Client::builder()
        .connect_timeout(connect_timeout)
        .tcp_keepalive(Duration::from_secs(TCP_KEEPALIVE_SECS))
        .pool_max_idle_per_host(0)
        .build()?;
    tracing::debug!("设备 HTTP Client 已创建，连接超时 {:?}", connect_timeout);
    Ok(client)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_client() {
        let client = build_client(Duration::from_secs(5));
        assert!(client.is_ok());
    }

    #[test]
    fn test_build_client_with_short_timeout() {
        let client = build_client(Duration::from_millis(200));
        assert!(client.is_ok());
    }
}
