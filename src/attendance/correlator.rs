//! 关联器
//!
//! 同一用户的事件串行执行"读取最新记录 → 判定 → 写入"，不同用户互不等待。

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::Poll;

use parking_lot::Mutex;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

use super::model::Outcome;
use super::store::AttendanceStore;
use crate::error::StoreError;
use crate::model::event::AccessEvent;
use crate::stats::CorrelatorStats;

type Acquire = Pin<Box<dyn Future<Output = OwnedMutexGuard<()>> + Send>>;

/// 按 user_id 分配的互斥锁；没有持有者和等待者的条目自动移除
#[derive(Default, Clone)]
struct UserLocks {
    inner: Arc<Mutex<HashMap<String, Arc<AsyncMutex<()>>>>>,
}

impl UserLocks {
    /// 在用户锁上排队并立即返回
    ///
    /// tokio 的 Mutex 按请求顺序分配，先登记的票据先拿到锁。
    async fn reserve(&self, user_id: &str) -> UserTicket {
        let lock = self
            .inner
            .lock()
            .entry(user_id.to_string())
            .or_default()
            .clone();

        // 轮询一次，把等待者挂进队列
        let mut acquire: Acquire = Box::pin(lock.lock_owned());
        let state = match futures::poll!(&mut acquire) {
            Poll::Ready(guard) => TicketState::Held(guard),
            Poll::Pending => TicketState::Waiting(acquire),
        };
        UserTicket {
            locks: self.clone(),
            user_id: user_id.to_string(),
            state: Some(state),
        }
    }

    #[cfg(test)]
    async fn lock(&self, user_id: &str) -> UserTicket {
        let mut ticket = self.reserve(user_id).await;
        ticket.wait().await;
        ticket
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.inner.lock().len()
    }
}

enum TicketState {
    Waiting(Acquire),
    Held(OwnedMutexGuard<()>),
}

/// 某个用户锁上的排队位置；持有期间同一用户的后续事件等待
pub struct UserTicket {
    locks: UserLocks,
    user_id: String,
    state: Option<TicketState>,
}

impl UserTicket {
    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    async fn wait(&mut self) {
        if let Some(TicketState::Waiting(acquire)) = &mut self.state {
            let guard = acquire.await;
            self.state = Some(TicketState::Held(guard));
        }
    }
}

impl Drop for UserTicket {
    fn drop(&mut self) {
        drop(self.state.take());
        let mut map = self.locks.inner.lock();
        // 计数为 1 说明只剩表内的引用
        if map
            .get(&self.user_id)
            .is_some_and(|lock| Arc::strong_count(lock) == 1)
        {
            map.remove(&self.user_id);
        }
    }
}

pub struct Correlator {
    store: Arc<AttendanceStore>,
    locks: UserLocks,
    stats: Arc<CorrelatorStats>,
}

impl Correlator {
    pub fn new(store: Arc<AttendanceStore>, stats: Arc<CorrelatorStats>) -> Self {
        Self {
            store,
            locks: UserLocks::default(),
            stats,
        }
    }

    pub fn store(&self) -> &Arc<AttendanceStore> {
        &self.store
    }

    pub fn stats(&self) -> &Arc<CorrelatorStats> {
        &self.stats
    }

    /// 为用户预留处理顺序
    ///
    /// 按接收顺序调用，之后即使在不同任务中执行 [`Correlator::apply_reserved`]，
    /// 同一用户的事件也按预留顺序提交。
    pub async fn reserve(&self, user_id: &str) -> UserTicket {
        self.locks.reserve(user_id).await
    }

    /// 应用一个事件；返回时结果已提交
    pub async fn apply(&self, event: AccessEvent) -> Result<Outcome, StoreError> {
        let ticket = self.reserve(&event.user_id).await;
        self.apply_reserved(ticket, event).await
    }

    /// 轮到该票据后应用事件
    pub async fn apply_reserved(
        &self,
        mut ticket: UserTicket,
        event: AccessEvent,
    ) -> Result<Outcome, StoreError> {
        debug_assert_eq!(ticket.user_id(), event.user_id);
        ticket.wait().await;

        let user_id = event.user_id.clone();
        let role = event.camera_role;
        let time = event.timestamp;
        let store = self.store.clone();
        let result = tokio::task::spawn_blocking(move || store.apply(&event))
            .await
            .map_err(|e| StoreError::Task(e.to_string()))?;

        let outcome = match result {
            Ok(outcome) => outcome,
            Err(e) => {
                self.stats.record_store_failure();
                return Err(e);
            }
        };

        match outcome {
            Outcome::Entered { log_id } => {
                self.stats.record_entered();
                tracing::info!(user_id = %user_id, log_id, time = %time, "进入已记录");
            }
            Outcome::Exited { log_id } => {
                self.stats.record_exited();
                tracing::info!(user_id = %user_id, log_id, time = %time, "离开已记录");
            }
            Outcome::Rejected { conflict } => {
                self.stats.record_rejected();
                tracing::info!(
                    user_id = %user_id,
                    role = %role,
                    time = %time,
                    conflict = %conflict,
                    "事件被拒绝"
                );
            }
        }
        Ok(outcome)
    }
}
