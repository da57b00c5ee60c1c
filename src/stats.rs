//! 运行统计
//!
//! 管道没有面向用户的界面，失败可见性依赖结构化日志和这里的计数器。

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;
use serde::Serialize;

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

fn read(counter: &AtomicU64) -> u64 {
    counter.load(Ordering::Relaxed)
}

/// 单台设备的计数
#[derive(Debug, Default)]
pub struct DeviceStats {
    sessions: AtomicU64,
    failures: AtomicU64,
    frames: AtomicU64,
    events: AtomicU64,
    ignored: AtomicU64,
    parse_failures: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DeviceStatsSnapshot {
    pub sessions: u64,
    pub failures: u64,
    pub frames: u64,
    pub events: u64,
    pub ignored: u64,
    pub parse_failures: u64,
}

impl DeviceStats {
    pub fn record_session(&self) {
        bump(&self.sessions);
    }

    pub fn record_failure(&self) {
        bump(&self.failures);
    }

    pub fn record_frame(&self) {
        bump(&self.frames);
    }

    pub fn record_event(&self) {
        bump(&self.events);
    }

    pub fn record_ignored(&self) {
        bump(&self.ignored);
    }

    pub fn record_parse_failure(&self) {
        bump(&self.parse_failures);
    }

    pub fn snapshot(&self) -> DeviceStatsSnapshot {
        DeviceStatsSnapshot {
            sessions: read(&self.sessions),
            failures: read(&self.failures),
            frames: read(&self.frames),
            events: read(&self.events),
            ignored: read(&self.ignored),
            parse_failures: read(&self.parse_failures),
        }
    }
}

/// 发布器计数
#[derive(Debug, Default)]
pub struct PublisherStats {
    published: AtomicU64,
    retried: AtomicU64,
    dead_lettered: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PublisherStatsSnapshot {
    pub published: u64,
    pub retried: u64,
    pub dead_lettered: u64,
}

impl PublisherStats {
    pub fn record_published(&self) {
        bump(&self.published);
    }

    pub fn record_retry(&self) {
        bump(&self.retried);
    }

    pub fn record_dead_letter(&self) {
        bump(&self.dead_lettered);
    }

    pub fn snapshot(&self) -> PublisherStatsSnapshot {
        PublisherStatsSnapshot {
            published: read(&self.published),
            retried: read(&self.retried),
            dead_lettered: read(&self.dead_lettered),
        }
    }
}

/// 考勤关联计数
#[derive(Debug, Default)]
pub struct CorrelatorStats {
    entered: AtomicU64,
    exited: AtomicU64,
    rejected: AtomicU64,
    poison: AtomicU64,
    store_failures: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CorrelatorStatsSnapshot {
    pub entered: u64,
    pub exited: u64,
    pub rejected: u64,
    pub poison: u64,
    pub store_failures: u64,
}

impl CorrelatorStats {
    pub fn record_entered(&self) {
        bump(&self.entered);
    }

    pub fn record_exited(&self) {
        bump(&self.exited);
    }

    pub fn record_rejected(&self) {
        bump(&self.rejected);
    }

    pub fn record_poison(&self) {
        bump(&self.poison);
    }

    pub fn record_store_failure(&self) {
        bump(&self.store_failures);
    }

    pub fn snapshot(&self) -> CorrelatorStatsSnapshot {
        CorrelatorStatsSnapshot {
            entered: read(&self.entered),
            exited: read(&self.exited),
            rejected: read(&self.rejected),
            poison: read(&self.poison),
            store_failures: read(&self.store_failures),
        }
    }
}

/// 全部计数的注册表
#[derive(Debug, Default)]
pub struct StatsRegistry {
    devices: RwLock<BTreeMap<String, Arc<DeviceStats>>>,
    pub publisher: Arc<PublisherStats>,
    pub correlator: Arc<CorrelatorStats>,
}

impl StatsRegistry {
    /// 获取或创建设备计数
    pub fn device(&self, device_id: &str) -> Arc<DeviceStats> {
        if let Some(stats) = self.devices.read().get(device_id) {
            return stats.clone();
        }
        self.devices
            .write()
            .entry(device_id.to_string())
            .or_default()
            .clone()
    }

    pub fn device_snapshots(&self) -> Vec<(String, DeviceStatsSnapshot)> {
        self.devices
            .read()
            .iter()
            .map(|(id, stats)| (id.clone(), stats.snapshot()))
            .collect()
    }

    /// 输出一次统计日志
    pub fn report(&self) {
        for (device, snapshot) in self.device_snapshots() {
            tracing::info!(
                device = %device,
                sessions = snapshot.sessions,
                failures = snapshot.failures,
                frames = snapshot.frames,
                events = snapshot.events,
                ignored = snapshot.ignored,
                parse_failures = snapshot.parse_failures,
                "设备统计"
            );
        }

        let publisher = self.publisher.snapshot();
        tracing::info!(
            published = publisher.published,
            retried = publisher.retried,
            dead_lettered = publisher.dead_lettered,
            "发布统计"
        );

        let correlator = self.correlator.snapshot();
        tracing::info!(
            entered = correlator.entered,
            exited = correlator.exited,
            rejected = correlator.rejected,
            poison = correlator.poison,
            store_failures = correlator.store_failures,
            "考勤统计"
        );
    }
}
