//! Broker 抽象
//!
//! 发布器只依赖 [`Broker`] trait；连接由调用方显式持有并在关闭时释放，
//! 不使用进程级全局连接。

pub mod amqp;

use async_trait::async_trait;

use crate::error::PublishError;
use crate::model::event::BrokerMessage;

pub use amqp::{AmqpBroker, AmqpConsumer};

/// 持久化消息 broker
#[async_trait]
pub trait Broker: Send + Sync {
    /// 以持久化投递标记发布一条消息，返回 Ok 表示 broker 已确认
    async fn publish(&self, message: &BrokerMessage) -> Result<(), PublishError>;

    /// 关闭连接（可重复调用）
    async fn close(&self);
}
