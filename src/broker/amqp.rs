//! AMQP (RabbitMQ) 客户端
//!
//! 发布端按需建立连接：首次发布或连接断开后的下一次发布时重新连接，
//! 队列声明为 durable，消息带持久化标记并等待 publisher confirm。

use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use lapin::message::Delivery;
use lapin::options::{
    BasicConsumeOptions, BasicPublishOptions, BasicQosOptions, ConfirmSelectOptions,
    QueueDeclareOptions,
};
use lapin::types::FieldTable;
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties, Consumer};
use tokio::sync::Mutex;

use super::Broker;
use crate::error::PublishError;
use crate::model::config::BrokerConfig;
use crate::model::event::BrokerMessage;

/// AMQP delivery_mode = 2 表示持久化消息
const PERSISTENT_DELIVERY: u8 = 2;

/// 关闭 channel/连接时等待对端响应的上限
const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

fn unavailable(e: lapin::Error) -> PublishError {
    PublishError::Unavailable(e.to_string())
}

/// 一个连接及其上的 channel
struct AmqpSession {
    connection: Connection,
    channel: Channel,
}

impl AmqpSession {
    async fn open(config: &BrokerConfig) -> Result<Self, PublishError> {
        let timeout = config.connect_timeout();
        let connection = tokio::time::timeout(
            timeout,
            Connection::connect(&config.url, ConnectionProperties::default()),
        )
        .await
        .map_err(|_| PublishError::Unavailable(format!("连接超时 ({:?})", timeout)))?
        .map_err(unavailable)?;

        let channel = connection.create_channel().await.map_err(unavailable)?;
        channel
            .queue_declare(
                &config.queue_name,
                QueueDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(unavailable)?;

        tracing::info!(queue = %config.queue_name, "AMQP 连接已建立");
        Ok(Self {
            connection,
            channel,
        })
    }

    fn is_connected(&self) -> bool {
        self.connection.status().connected() && self.channel.status().connected()
    }

    async fn close(self) {
        match tokio::time::timeout(CLOSE_TIMEOUT, self.channel.close(200, "OK")).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::debug!("关闭 AMQP channel 失败: {}", e),
            Err(_) => tracing::debug!("关闭 AMQP channel 超时"),
        }
        match tokio::time::timeout(CLOSE_TIMEOUT, self.connection.close(200, "OK")).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::debug!("关闭 AMQP 连接失败: {}", e),
            Err(_) => tracing::debug!("关闭 AMQP 连接超时"),
        }
    }
}

/// 发布端
pub struct AmqpBroker {
    config: BrokerConfig,
    session: Mutex<Option<AmqpSession>>,
}

impl AmqpBroker {
    /// 创建发布端（不立即连接）
    pub fn new(config: BrokerConfig) -> Self {
        Self {
            config,
            session: Mutex::new(None),
        }
    }
}

#[async_trait]
impl Broker for AmqpBroker {
    async fn publish(&self, message: &BrokerMessage) -> Result<(), PublishError> {
        let payload = serde_json::to_vec(message)?;

        let mut guard = self.session.lock().await;
        let stale = guard.as_ref().is_none_or(|s| !s.is_connected());
        if stale {
            if let Some(old) = guard.take() {
                old.close().await;
            }
            let session = AmqpSession::open(&self.config).await?;
            session
                .channel
                .confirm_select(ConfirmSelectOptions::default())
                .await
                .map_err(unavailable)?;
            *guard = Some(session);
        }
        let Some(session) = guard.as_ref() else {
            return Err(PublishError::Unavailable("AMQP 会话不可用".to_string()));
        };

        let properties = BasicProperties::default()
            .with_delivery_mode(PERSISTENT_DELIVERY)
            .with_content_type("application/json".into());

        // 半开连接上确认可能一直不到，超时后按连接断开处理
        let timeout = self.config.connect_timeout();
        let result = tokio::time::timeout(timeout, async {
            session
                .channel
                .basic_publish(
                    "",
                    &self.config.queue_name,
                    BasicPublishOptions::default(),
                    &payload,
                    properties,
                )
                .await?
                .await
        })
        .await;

        let error = match result {
            Ok(Ok(confirmation)) if confirmation.is_nack() => return Err(PublishError::Rejected),
            Ok(Ok(_)) => return Ok(()),
            Ok(Err(e)) => unavailable(e),
            Err(_) => PublishError::Unavailable(format!("等待确认超时 ({:?})", timeout)),
        };
        // 丢弃会话，下次发布时重连
        if let Some(old) = guard.take() {
            old.close().await;
        }
        Err(error)
    }

    async fn close(&self) {
        if let Some(session) = self.session.lock().await.take() {
            session.close().await;
            tracing::info!("AMQP 发布连接已关闭");
        }
    }
}

/// 消费端：durable 队列、手动确认、小预取
pub struct AmqpConsumer {
    session: AmqpSession,
    consumer: Consumer,
}

impl AmqpConsumer {
    pub async fn connect(config: &BrokerConfig) -> anyhow::Result<Self> {
        let session = AmqpSession::open(config).await?;
        session
            .channel
            .basic_qos(config.prefetch, BasicQosOptions::default())
            .await?;

        let tag = format!("accesslog-{}", uuid::Uuid::new_v4());
        let consumer = session
            .channel
            .basic_consume(
                &config.queue_name,
                &tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await?;

        tracing::info!(queue = %config.queue_name, prefetch = config.prefetch, "开始消费");
        Ok(Self { session, consumer })
    }

    /// 下一条投递；消费流结束时返回 None
    pub async fn next(&mut self) -> Option<anyhow::Result<Delivery>> {
        self.consumer
            .next()
            .await
            .map(|r| r.map_err(anyhow::Error::from))
    }

    pub async fn close(self) {
        self.session.close().await;
        tracing::info!("AMQP 消费连接已关闭");
    }
}
