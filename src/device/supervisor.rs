//! 重连监督器
//!
//! 每台设备一个：Connecting → Streaming → Backoff → Connecting ...
//! 流正常结束同样视为需要重连，只有取消信号或事件队列关闭会让循环退出。

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::decoder::{Decoded, FrameDecoder};
use super::stream::{DeviceConnector, FrameSource};
use crate::common::{PREVIEW_MAX_BYTES, preview_bytes};
use crate::error::DeviceError;
use crate::model::config::BackoffConfig;
use crate::pipeline::queue::EventSender;
use crate::stats::DeviceStats;

/// 指数退避：从 base 开始每次失败翻倍，不超过 max；
/// 会话持续超过 stable 后重置
#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    stable: Duration,
    current: Duration,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration, stable: Duration) -> Self {
        let base = base.min(max);
        Self {
            base,
            max,
            stable,
            current: base,
        }
    }

    pub fn from_config(config: &BackoffConfig) -> Self {
        Self::new(
            Duration::from_millis(config.base_ms),
            Duration::from_millis(config.max_ms),
            Duration::from_secs(config.stable_secs),
        )
    }

    /// 返回本次等待时长，并把下一次翻倍
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = self.current.saturating_mul(2).min(self.max);
        delay
    }

    pub fn reset(&mut self) {
        self.current = self.base;
    }

    /// 记录一次会话的持续时间，足够稳定时重置退避
    pub fn record_session(&mut self, duration: Duration) {
        if duration >= self.stable {
            self.reset();
        }
    }
}

/// 一次会话的结束方式
#[derive(Debug)]
enum SessionEnd {
    Cancelled,
    QueueClosed,
    Ended,
    Failed(DeviceError),
}

pub struct DeviceSupervisor<C: DeviceConnector> {
    device_id: String,
    connector: C,
    decoder: FrameDecoder,
    sender: EventSender,
    backoff: Backoff,
    stats: Arc<DeviceStats>,
}

impl<C: DeviceConnector> DeviceSupervisor<C> {
    pub fn new(
        device_id: impl Into<String>,
        connector: C,
        decoder: FrameDecoder,
        sender: EventSender,
        backoff: Backoff,
        stats: Arc<DeviceStats>,
    ) -> Self {
        Self {
            device_id: device_id.into(),
            connector,
            decoder,
            sender,
            backoff,
            stats,
        }
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    /// 监督循环，直到取消或事件队列关闭
    pub async fn run(mut self, cancel: CancellationToken) {
        tracing::info!(device = %self.device_id, "设备监督器启动");

        loop {
            let connected = tokio::select! {
                _ = cancel.cancelled() => break,
                result = self.connector.connect() => result,
            };

            match connected {
                Ok(source) => {
                    self.stats.record_session();
                    tracing::info!(device = %self.device_id, "事件流已连接");
                    let started = Instant::now();

                    let end = self.stream(source, &cancel).await;
                    self.backoff.record_session(started.elapsed());
                    match end {
                        SessionEnd::Cancelled => break,
                        SessionEnd::QueueClosed => {
                            tracing::warn!(device = %self.device_id, "事件队列已关闭，停止读取");
                            break;
                        }
                        SessionEnd::Ended => {
                            tracing::warn!(device = %self.device_id, "事件流被设备关闭，准备重连");
                        }
                        SessionEnd::Failed(e) => {
                            tracing::warn!(device = %self.device_id, "事件流中断: {}", e);
                        }
                    }
                }
                Err(e) => {
                    tracing::warn!(device = %self.device_id, "连接设备失败: {}", e);
                }
            }

            self.stats.record_failure();
            let delay = self.backoff.next_delay();
            tracing::debug!(device = %self.device_id, delay_ms = delay.as_millis() as u64, "等待重连");
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        tracing::info!(device = %self.device_id, "设备监督器已停止");
    }

    /// 读取一个会话直到结束；返回时 source 被 drop，连接随之关闭
    async fn stream(
        &self,
        mut source: Box<dyn FrameSource>,
        cancel: &CancellationToken,
    ) -> SessionEnd {
        loop {
            let next = tokio::select! {
                _ = cancel.cancelled() => return SessionEnd::Cancelled,
                next = source.next_frame() => next,
            };

            let frame = match next {
                Ok(Some(frame)) => frame,
                Ok(None) => return SessionEnd::Ended,
                Err(e) => return SessionEnd::Failed(e),
            };
            self.stats.record_frame();

            match self.decoder.decode(&frame) {
                Decoded::Event(event) => {
                    self.stats.record_event();
                    tracing::debug!(
                        device = %self.device_id,
                        user_id = %event.user_id,
                        time = %event.timestamp,
                        "收到门禁事件"
                    );
                    // 队列满时在此等待，读帧随之暂停
                    let put = tokio::select! {
                        _ = cancel.cancelled() => return SessionEnd::Cancelled,
                        put = self.sender.put(event) => put,
                    };
                    if put.is_err() {
                        return SessionEnd::QueueClosed;
                    }
                }
                Decoded::Ignored(reason) => {
                    self.stats.record_ignored();
                    tracing::trace!(device = %self.device_id, ?reason, "忽略帧");
                }
                Decoded::Failed(e) => {
                    self.stats.record_parse_failure();
                    tracing::warn!(
                        device = %self.device_id,
                        frame = %preview_bytes(frame.as_bytes(), PREVIEW_MAX_BYTES),
                        "丢弃无法解析的帧: {}",
                        e
                    );
                }
            }
        }
    }
}
