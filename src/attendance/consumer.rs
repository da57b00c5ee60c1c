//! Broker 消费循环
//!
//! 只有在考勤结果提交之后才确认消息；存储失败时 nack 并重新入队，
//! 无法解析的消息确认后丢弃，避免反复投递。

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use lapin::message::Delivery;
use lapin::options::{BasicAckOptions, BasicNackOptions};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use super::correlator::{Correlator, UserTicket};
use crate::broker::AmqpConsumer;
use crate::common::{PREVIEW_MAX_BYTES, preview_bytes};
use crate::model::event::{AccessEvent, BrokerMessage};

/// 重新入队前的等待，避免存储故障期间空转
const REQUEUE_DELAY: Duration = Duration::from_secs(1);

/// 消息处理完成后的确认方式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Ack,
    Requeue,
}

/// 解析消息体
pub fn parse_delivery(body: &[u8]) -> anyhow::Result<AccessEvent> {
    let message: BrokerMessage = serde_json::from_slice(body).context("消息体不是有效的事件 JSON")?;
    if message.user_id.trim().is_empty() {
        anyhow::bail!("user_id 为空");
    }
    Ok(message.into())
}

/// 已解析并按接收顺序登记的消息
pub enum Prepared {
    /// 无法解析，已计数，直接确认
    Poison,
    Event { event: AccessEvent, ticket: UserTicket },
}

/// 解析消息并在用户锁上排队
///
/// 必须按投递顺序调用，同一用户的事件才会按同样顺序提交。
pub async fn prepare_delivery(correlator: &Correlator, body: &[u8]) -> Prepared {
    match parse_delivery(body) {
        Ok(event) => {
            let ticket = correlator.reserve(&event.user_id).await;
            Prepared::Event { event, ticket }
        }
        Err(e) => {
            correlator.stats().record_poison();
            tracing::warn!(
                body = %preview_bytes(body, PREVIEW_MAX_BYTES),
                "丢弃无法解析的消息: {:#}",
                e
            );
            Prepared::Poison
        }
    }
}

/// 应用已登记的消息并给出确认方式
pub async fn finish_delivery(correlator: &Correlator, prepared: Prepared) -> Disposition {
    let (event, ticket) = match prepared {
        Prepared::Poison => return Disposition::Ack,
        Prepared::Event { event, ticket } => (event, ticket),
    };

    let user_id = event.user_id.clone();
    match correlator.apply_reserved(ticket, event).await {
        Ok(_) => Disposition::Ack,
        Err(e) => {
            tracing::error!(user_id = %user_id, "写入考勤记录失败，消息将重新入队: {}", e);
            Disposition::Requeue
        }
    }
}

/// 处理一条消息并给出确认方式
pub async fn handle_delivery(correlator: &Correlator, body: &[u8]) -> Disposition {
    let prepared = prepare_delivery(correlator, body).await;
    finish_delivery(correlator, prepared).await
}

async fn settle(delivery: &Delivery, disposition: Disposition) -> Result<(), lapin::Error> {
    match disposition {
        Disposition::Ack => delivery.acker.ack(BasicAckOptions::default()).await,
        Disposition::Requeue => {
            tokio::time::sleep(REQUEUE_DELAY).await;
            delivery
                .acker
                .nack(BasicNackOptions {
                    requeue: true,
                    ..Default::default()
                })
                .await
        }
    }
}

/// 消费循环
///
/// 单条消息的错误不会终止循环。取消时等待处理中的消息确认完毕后返回 Ok；
/// 消费流结束或出错时返回 Err，由调用方重连。
pub async fn run_consumer(
    correlator: Arc<Correlator>,
    mut consumer: AmqpConsumer,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    // 未确认消息的数量由 prefetch 限制，这里不再额外限流
    let mut in_flight = JoinSet::new();

    let result = loop {
        while let Some(joined) = in_flight.try_join_next() {
            if let Err(e) = joined {
                tracing::error!("消息处理任务异常退出: {}", e);
            }
        }

        let next = tokio::select! {
            _ = cancel.cancelled() => break Ok(()),
            next = consumer.next() => next,
        };

        let delivery = match next {
            Some(Ok(delivery)) => delivery,
            Some(Err(e)) => break Err(e.context("接收消息失败")),
            None => break Err(anyhow::anyhow!("消费流已结束")),
        };

        // 在接收循环里排队，处理任务之间的调度顺序不影响同一用户的提交顺序
        let prepared = prepare_delivery(&correlator, &delivery.data).await;
        let correlator = correlator.clone();
        in_flight.spawn(async move {
            let disposition = finish_delivery(&correlator, prepared).await;
            if let Err(e) = settle(&delivery, disposition).await {
                // 连接断开时 broker 会自动重新投递未确认的消息
                tracing::warn!(?disposition, "确认消息失败: {}", e);
            }
        });
    };

    while let Some(joined) = in_flight.join_next().await {
        if let Err(e) = joined {
            tracing::error!("消息处理任务异常退出: {}", e);
        }
    }
    consumer.close().await;
    result
}
