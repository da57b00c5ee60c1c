//! 考勤记录与关联结果

use std::fmt;

use chrono::{DateTime, FixedOffset};
use serde::Serialize;

/// `user_logs` 表中的一行；一次进出对应一行
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AttendanceLog {
    pub id: i64,
    pub user_id: String,
    pub enter_time: Option<DateTime<FixedOffset>>,
    pub exit_time: Option<DateTime<FixedOffset>>,
}

impl AttendanceLog {
    pub fn is_open(&self) -> bool {
        self.exit_time.is_none()
    }
}

/// 业务规则拒绝的原因（不是错误）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Conflict {
    /// 当天已有未关闭的进入记录
    AlreadyEntered,
    /// 没有未关闭的进入记录
    NotEntered,
    /// 离开时间早于对应的进入时间
    ExitBeforeEnter,
    /// 事件日期早于现有记录的日期（时钟偏差或乱序投递）
    OutOfOrder,
    /// 重复投递的事件
    Duplicate,
}

impl Conflict {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AlreadyEntered => "already_entered",
            Self::NotEntered => "not_entered",
            Self::ExitBeforeEnter => "exit_before_enter",
            Self::OutOfOrder => "out_of_order",
            Self::Duplicate => "duplicate",
        }
    }
}

impl fmt::Display for Conflict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 一个事件的关联结果
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum Outcome {
    Entered { log_id: i64 },
    Exited { log_id: i64 },
    Rejected { conflict: Conflict },
}
