//! 发布器
//!
//! 单一顺序消费者：从事件队列取出事件并发布到 broker。
//! 失败的事件在短暂等待后重试，超过最大尝试次数写入死信。
//! 投递语义为 at-least-once，下游需要容忍重复。

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use super::dead_letter::DeadLetterLog;
use super::queue::EventReceiver;
use crate::broker::Broker;
use crate::model::config::PublisherConfig;
use crate::model::event::{AccessEvent, BrokerMessage};
use crate::stats::PublisherStats;

/// 待发布事件及已尝试次数
#[derive(Debug)]
struct Pending {
    event: AccessEvent,
    attempts: u32,
}

pub struct Publisher<B: Broker> {
    broker: B,
    dead_letter: DeadLetterLog,
    max_attempts: u32,
    retry_delay: Duration,
    stats: Arc<PublisherStats>,
}

impl<B: Broker> Publisher<B> {
    pub fn new(
        broker: B,
        dead_letter: DeadLetterLog,
        config: &PublisherConfig,
        stats: Arc<PublisherStats>,
    ) -> Self {
        Self {
            broker,
            dead_letter,
            max_attempts: config.max_attempts.max(1),
            retry_delay: config.retry_delay(),
            stats,
        }
    }

    /// 发布循环，直到取消或所有写入端关闭且队列排空
    ///
    /// 退出时关闭 broker 连接；取消时尚未发布的事件会丢失。
    pub async fn run(self, mut receiver: EventReceiver, cancel: CancellationToken) {
        // 重试中的事件先于新事件处理，保证同一用户的进/出顺序不被打乱
        let mut retry: VecDeque<Pending> = VecDeque::new();
        // 取消时正在发布的事件
        let mut interrupted = 0;

        loop {
            let pending = match retry.pop_front() {
                Some(pending) => pending,
                None => {
                    let next = tokio::select! {
                        _ = cancel.cancelled() => break,
                        next = receiver.get() => next,
                    };
                    match next {
                        Some(event) => Pending { event, attempts: 0 },
                        None => break,
                    }
                }
            };

            let failed = tokio::select! {
                _ = cancel.cancelled() => {
                    interrupted = 1;
                    break;
                }
                failed = self.publish_one(pending) => failed,
            };
            if let Some(pending) = failed {
                retry.push_back(pending);
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(self.retry_delay) => {}
                }
            }
        }

        let unpublished = retry.len() + receiver.len() + interrupted;
        if unpublished > 0 {
            tracing::warn!(unpublished, "发布器退出，未发布的事件被丢弃");
        }
        self.broker.close().await;
        tracing::info!("发布器已停止");
    }

    /// 发布一个事件；需要重试时返回 Some
    async fn publish_one(&self, mut pending: Pending) -> Option<Pending> {
        let message = BrokerMessage::from(&pending.event);
        pending.attempts += 1;

        match self.broker.publish(&message).await {
            Ok(()) => {
                self.stats.record_published();
                tracing::debug!(
                    user_id = %pending.event.user_id,
                    role = %pending.event.camera_role,
                    device = %pending.event.device_id,
                    "事件已发布"
                );
                None
            }
            Err(e) if pending.attempts >= self.max_attempts => {
                tracing::error!(
                    user_id = %pending.event.user_id,
                    attempts = pending.attempts,
                    "发布失败次数达到上限，写入死信: {}",
                    e
                );
                self.stats.record_dead_letter();
                if let Err(write_err) = self
                    .dead_letter
                    .write(&pending.event, pending.attempts, &e.to_string())
                    .await
                {
                    tracing::error!(
                        path = %self.dead_letter.path().display(),
                        "写入死信失败，事件丢失: {}",
                        write_err
                    );
                }
                None
            }
            Err(e) => {
                tracing::warn!(
                    user_id = %pending.event.user_id,
                    attempt = pending.attempts,
                    max = self.max_attempts,
                    "发布失败，稍后重试: {}",
                    e
                );
                self.stats.record_retry();
                Some(pending)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::PublishError;
    use crate::model::event::CameraRole;
    use crate::pipeline::dead_letter::DeadLetterRecord;
    use crate::pipeline::queue::EventQueue;
    use async_trait::async_trait;
    use chrono::DateTime;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

    /// 模拟 broker：前 `fail_first` 次发布失败
    #[derive(Default)]
    struct MockBroker {
        fail_first: u32,
        always_fail: bool,
        /// 发布永不返回，模拟半开连接
        hang: bool,
        calls: AtomicU32,
        published: Mutex<Vec<BrokerMessage>>,
        closed: AtomicBool,
    }

    #[async_trait]
    impl Broker for Arc<MockBroker> {
        async fn publish(&self, message: &BrokerMessage) -> Result<(), PublishError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if self.hang {
                std::future::pending::<()>().await;
            }
            if self.always_fail || call < self.fail_first {
                return Err(PublishError::Unavailable("模拟断开".to_string()));
            }
            self.published.lock().push(message.clone());
            Ok(())
        }

        async fn close(&self) {
            self.closed.store(true, Ordering::SeqCst);
        }
    }

    fn event(user: &str, role: CameraRole) -> AccessEvent {
        AccessEvent {
            user_id: user.to_string(),
            timestamp: DateTime::parse_from_rfc3339("2026-03-02T08:00:00+08:00").unwrap(),
            camera_role: role,
            device_id: "gate".to_string(),
        }
    }

    fn config(max_attempts: u32) -> PublisherConfig {
        PublisherConfig {
            max_attempts,
            retry_delay_ms: 10,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_then_success_preserves_order() {
        let dir = tempfile::tempdir().unwrap();
        let broker = Arc::new(MockBroker {
            fail_first: 2,
            ..Default::default()
        });
        let stats = Arc::new(PublisherStats::default());
        let publisher = Publisher::new(
            broker.clone(),
            DeadLetterLog::new(dir.path().join("dead.jsonl")),
            &config(5),
            stats.clone(),
        );

        let (tx, rx) = EventQueue::bounded(8);
        tx.put(event("1", CameraRole::Enter)).await.unwrap();
        tx.put(event("1", CameraRole::Exit)).await.unwrap();
        drop(tx);

        publisher.run(rx, CancellationToken::new()).await;

        let published = broker.published.lock().clone();
        assert_eq!(published.len(), 2);
        assert_eq!(published[0].camera_type, CameraRole::Enter);
        assert_eq!(published[1].camera_type, CameraRole::Exit);
        assert!(broker.closed.load(Ordering::SeqCst));

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.published, 2);
        assert_eq!(snapshot.retried, 2);
        assert_eq!(snapshot.dead_lettered, 0);
    }

    /// broker 持续不可用时，每个事件最多尝试 max_attempts 次后进入死信
    #[tokio::test(start_paused = true)]
    async fn test_exhausted_retries_go_to_dead_letter() {
        let dir = tempfile::tempdir().unwrap();
        let dead_path = dir.path().join("dead.jsonl");
        let broker = Arc::new(MockBroker {
            always_fail: true,
            ..Default::default()
        });
        let stats = Arc::new(PublisherStats::default());
        let publisher = Publisher::new(
            broker.clone(),
            DeadLetterLog::new(&dead_path),
            &config(3),
            stats.clone(),
        );

        let (tx, rx) = EventQueue::bounded(8);
        tx.put(event("1", CameraRole::Enter)).await.unwrap();
        tx.put(event("2", CameraRole::Enter)).await.unwrap();
        drop(tx);

        publisher.run(rx, CancellationToken::new()).await;

        assert_eq!(broker.calls.load(Ordering::SeqCst), 6);
        assert_eq!(stats.snapshot().dead_lettered, 2);

        let content = std::fs::read_to_string(&dead_path).unwrap();
        let records: Vec<DeadLetterRecord> = content
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].user_id, "1");
        assert_eq!(records[0].attempts, 3);
        assert_eq!(records[1].user_id, "2");
    }

    #[tokio::test]
    async fn test_cancel_stops_idle_publisher() {
        let dir = tempfile::tempdir().unwrap();
        let broker = Arc::new(MockBroker::default());
        let publisher = Publisher::new(
            broker.clone(),
            DeadLetterLog::new(dir.path().join("dead.jsonl")),
            &config(3),
            Arc::new(PublisherStats::default()),
        );

        let (_tx, rx) = EventQueue::bounded(8);
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(publisher.run(rx, cancel.clone()));

        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("发布器应在取消后退出")
            .unwrap();
        assert!(broker.closed.load(Ordering::SeqCst));
    }

    /// 发布卡住时取消仍能退出并关闭 broker
    #[tokio::test]
    async fn test_cancel_interrupts_stuck_publish() {
        let dir = tempfile::tempdir().unwrap();
        let broker = Arc::new(MockBroker {
            hang: true,
            ..Default::default()
        });
        let publisher = Publisher::new(
            broker.clone(),
            DeadLetterLog::new(dir.path().join("dead.jsonl")),
            &config(3),
            Arc::new(PublisherStats::default()),
        );

        let (tx, rx) = EventQueue::bounded(8);
        tx.put(event("1", CameraRole::Enter)).await.unwrap();
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(publisher.run(rx, cancel.clone()));

        while broker.calls.load(Ordering::SeqCst) == 0 {
            tokio::task::yield_now().await;
        }
        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("发布器应在取消后退出")
            .unwrap();
        assert!(broker.closed.load(Ordering::SeqCst));
        assert!(broker.published.lock().is_empty());
    }
}
