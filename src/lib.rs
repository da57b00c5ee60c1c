//! 门禁考勤采集
//!
//! 设备事件流 → 有界队列 → broker → 考勤关联 → SQLite

pub mod attendance;
pub mod broker;
pub mod common;
pub mod device;
pub mod error;
pub mod http_client;
pub mod model;
pub mod pipeline;
pub mod stats;
