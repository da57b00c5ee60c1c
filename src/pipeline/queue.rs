//! 有界事件队列
//!
//! 多个设备任务写入，唯一的发布器读取。队列满时写入方等待而不是丢弃：
//! 丢失门禁事件比短暂停止读帧更糟，设备连接本身会自然限速。

use tokio::sync::mpsc;

use crate::error::QueueClosed;
use crate::model::event::AccessEvent;

/// 有界多生产者单消费者事件队列
pub struct EventQueue;

impl EventQueue {
    /// 创建容量为 `capacity` 的队列
    ///
    /// # Panics
    /// `capacity` 为 0 时 panic（配置校验保证不会发生）
    pub fn bounded(capacity: usize) -> (EventSender, EventReceiver) {
        let (tx, rx) = mpsc::channel(capacity);
        (EventSender { inner: tx }, EventReceiver { inner: rx })
    }
}

/// 写入端（每个设备任务持有一个克隆）
#[derive(Debug, Clone)]
pub struct EventSender {
    inner: mpsc::Sender<AccessEvent>,
}

impl EventSender {
    /// 写入事件，队列满时等待
    pub async fn put(&self, event: AccessEvent) -> Result<(), QueueClosed> {
        self.inner.send(event).await.map_err(|_| QueueClosed)
    }

    /// 队列当前长度
    pub fn len(&self) -> usize {
        self.inner.max_capacity() - self.inner.capacity()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.inner.max_capacity()
    }
}

/// 读取端（仅发布器持有）
#[derive(Debug)]
pub struct EventReceiver {
    inner: mpsc::Receiver<AccessEvent>,
}

impl EventReceiver {
    /// 取出最早的事件，队列空时等待；所有写入端关闭且队列为空时返回 None
    pub async fn get(&mut self) -> Option<AccessEvent> {
        self.inner.recv().await
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}
