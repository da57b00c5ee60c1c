//! 进出关联规则
//!
//! 纯函数，不访问存储；调用方负责在同一事务内读取现有记录并执行决定。
//! "同一天"按配置的时区偏移计算。

use chrono::{DateTime, FixedOffset, NaiveDate};

use super::model::{AttendanceLog, Conflict};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnterDecision {
    /// 新建一行
    Insert,
    Reject(Conflict),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitDecision {
    /// 关闭指定行
    Close { log_id: i64 },
    Reject(Conflict),
}

/// 时间在给定偏移下的日历日
pub fn calendar_day(time: &DateTime<FixedOffset>, offset: FixedOffset) -> NaiveDate {
    time.with_timezone(&offset).date_naive()
}

/// 进入事件
///
/// `latest` 为该用户按 enter_time 倒序的第一行
pub fn decide_enter(
    latest: Option<&AttendanceLog>,
    time: DateTime<FixedOffset>,
    offset: FixedOffset,
) -> EnterDecision {
    let Some(latest) = latest else {
        return EnterDecision::Insert;
    };
    if latest.enter_time == Some(time) {
        return EnterDecision::Reject(Conflict::Duplicate);
    }
    if !latest.is_open() {
        return EnterDecision::Insert;
    }
    // 没有进入时间的未关闭行视为更早的日期
    let Some(open_since) = latest.enter_time else {
        return EnterDecision::Insert;
    };

    let open_day = calendar_day(&open_since, offset);
    let event_day = calendar_day(&time, offset);
    if open_day < event_day {
        // 前一天未关闭的记录保持原样
        EnterDecision::Insert
    } else if open_day == event_day {
        EnterDecision::Reject(Conflict::AlreadyEntered)
    } else {
        EnterDecision::Reject(Conflict::OutOfOrder)
    }
}

/// 离开事件
///
/// `open` 为该用户最新的未关闭行（不限日期），`latest` 为最新一行
pub fn decide_exit(
    latest: Option<&AttendanceLog>,
    open: Option<&AttendanceLog>,
    time: DateTime<FixedOffset>,
    offset: FixedOffset,
) -> ExitDecision {
    if latest.is_some_and(|row| row.exit_time == Some(time)) {
        return ExitDecision::Reject(Conflict::Duplicate);
    }
    let Some(open) = open else {
        return ExitDecision::Reject(Conflict::NotEntered);
    };

    if let Some(entered) = open.enter_time {
        if calendar_day(&entered, offset) > calendar_day(&time, offset) {
            return ExitDecision::Reject(Conflict::OutOfOrder);
        }
        if entered > time {
            return ExitDecision::Reject(Conflict::ExitBeforeEnter);
        }
    }
    ExitDecision::Close { log_id: open.id }
}
