//! 设备事件流会话
//!
//! 一个会话对应一次经过 Digest 认证的长连接 GET。会话不可在中途恢复，
//! 断开后只能由监督器重新建立。

use std::collections::VecDeque;
use std::pin::Pin;

use async_trait::async_trait;
use bytes::Bytes;
use futures::{Stream, StreamExt};
use http::header::{AUTHORIZATION, CONTENT_TYPE, WWW_AUTHENTICATE};
use http::StatusCode;
use reqwest::Client;

use super::digest::DigestChallenge;
use super::framing::{Frame, MultipartFramer, resolve_boundary};
use crate::error::DeviceError;
use crate::model::config::DeviceConfig;

/// 按顺序产出帧的源；返回 `Ok(None)` 表示流正常结束
#[async_trait]
pub trait FrameSource: Send {
    async fn next_frame(&mut self) -> Result<Option<Frame>, DeviceError>;
}

/// 建立设备会话
#[async_trait]
pub trait DeviceConnector: Send + Sync {
    async fn connect(&self) -> Result<Box<dyn FrameSource>, DeviceError>;
}

type ChunkStream = Pin<Box<dyn Stream<Item = reqwest::Result<Bytes>> + Send>>;

/// HTTP 长连接上的帧源
///
/// drop 时释放底层响应，连接随之关闭
pub struct HttpFrameSource {
    device_id: String,
    chunks: ChunkStream,
    framer: MultipartFramer,
    pending: VecDeque<Frame>,
    deferred: Option<DeviceError>,
}

impl HttpFrameSource {
    fn new(device_id: String, chunks: ChunkStream, framer: MultipartFramer) -> Self {
        Self {
            device_id,
            chunks,
            framer,
            pending: VecDeque::new(),
            deferred: None,
        }
    }
}

#[async_trait]
impl FrameSource for HttpFrameSource {
    async fn next_frame(&mut self) -> Result<Option<Frame>, DeviceError> {
        loop {
            if let Some(frame) = self.pending.pop_front() {
                return Ok(Some(frame));
            }
            if let Some(err) = self.deferred.take() {
                return Err(err);
            }

            match self.chunks.next().await {
                Some(Ok(chunk)) => {
                    if let Err(e) = self.framer.push(&chunk, &mut self.pending) {
                        self.deferred = Some(e);
                    }
                }
                Some(Err(e)) => return Err(DeviceError::stream(e.to_string())),
                None => {
                    tracing::debug!(
                        device = %self.device_id,
                        buffered = self.framer.buffered(),
                        "事件流已结束"
                    );
                    return Ok(None);
                }
            }
        }
    }
}

/// 通过 HTTP 连接海康门禁设备的事件流
pub struct HttpDeviceConnector {
    client: Client,
    device: DeviceConfig,
    max_buffer: usize,
}

impl HttpDeviceConnector {
    pub fn new(client: Client, device: DeviceConfig, max_buffer: usize) -> Self {
        Self {
            client,
            device,
            max_buffer,
        }
    }

    async fn send(&self, url: &str, authorization: Option<&str>) -> Result<reqwest::Response, DeviceError> {
        let mut request = self.client.get(url);
        if let Some(value) = authorization {
            request = request.header(AUTHORIZATION, value);
        }
        request.send().await.map_err(|e| {
            if e.is_timeout() {
                DeviceError::connect(format!("连接超时: {}", e))
            } else {
                DeviceError::connect(e.to_string())
            }
        })
    }
}

#[async_trait]
impl DeviceConnector for HttpDeviceConnector {
    async fn connect(&self) -> Result<Box<dyn FrameSource>, DeviceError> {
        let (username, password) = self
            .device
            .credentials()
            .ok_or_else(|| DeviceError::Auth("未配置凭据".to_string()))?;
        let url = self.device.url();

        let mut response = self.send(&url, None).await?;
        if response.status() == StatusCode::UNAUTHORIZED {
            let challenge = response
                .headers()
                .get_all(WWW_AUTHENTICATE)
                .iter()
                .filter_map(|v| v.to_str().ok())
                .find_map(DigestChallenge::parse)
                .ok_or_else(|| DeviceError::Auth("设备未返回 Digest 质询".to_string()))?;

            let authorization = challenge.authorize("GET", &self.device.path, username, password);
            response = self.send(&url, Some(&authorization)).await?;
            if response.status() == StatusCode::UNAUTHORIZED {
                return Err(DeviceError::Auth("用户名或密码错误".to_string()));
            }
        }

        let status = response.status();
        if !status.is_success() {
            return Err(DeviceError::Status(status.as_u16()));
        }

        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok());
        let boundary = resolve_boundary(content_type, self.device.boundary.as_deref());
        tracing::debug!(
            device = %self.device.id,
            boundary = %String::from_utf8_lossy(&boundary),
            "已解析 multipart 边界"
        );

        let framer = MultipartFramer::new(boundary, self.max_buffer);
        let chunks: ChunkStream = Box::pin(response.bytes_stream());
        Ok(Box::new(HttpFrameSource::new(
            self.device.id.clone(),
            chunks,
            framer,
        )))
    }
}
