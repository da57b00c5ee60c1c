//! 考勤记录的 SQLite 存储（同步）
//!
//! 时间统一以 UTC、固定微秒精度的 RFC 3339 文本保存，文本排序即时间排序；
//! 读出时转换到配置的时区偏移。

use std::path::Path;
use std::time::Duration;

use chrono::{DateTime, FixedOffset, SecondsFormat, Utc};
use parking_lot::Mutex;
use rusqlite::{Connection, OptionalExtension, TransactionBehavior, params};

use super::model::{AttendanceLog, Conflict, Outcome};
use super::rules::{EnterDecision, ExitDecision, decide_enter, decide_exit};
use crate::error::StoreError;
use crate::model::event::{AccessEvent, CameraRole};

const SCHEMA: &str = "CREATE TABLE IF NOT EXISTS user_logs (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        user_id TEXT NOT NULL,
        enter_time TEXT,
        exit_time TEXT
    );
    CREATE INDEX IF NOT EXISTS idx_user_logs_user_enter ON user_logs(user_id, enter_time);";

const SELECT_COLUMNS: &str = "SELECT id, user_id, enter_time, exit_time FROM user_logs";

/// 数据库中的原始行
struct RawLog {
    id: i64,
    user_id: String,
    enter_time: Option<String>,
    exit_time: Option<String>,
}

impl RawLog {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            user_id: row.get(1)?,
            enter_time: row.get(2)?,
            exit_time: row.get(3)?,
        })
    }

    fn into_log(self, offset: FixedOffset) -> Result<AttendanceLog, StoreError> {
        Ok(AttendanceLog {
            id: self.id,
            user_id: self.user_id,
            enter_time: self.enter_time.map(|s| decode_time(&s, offset)).transpose()?,
            exit_time: self.exit_time.map(|s| decode_time(&s, offset)).transpose()?,
        })
    }
}

fn encode_time(time: &DateTime<FixedOffset>) -> String {
    time.with_timezone(&Utc)
        .to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn decode_time(value: &str, offset: FixedOffset) -> Result<DateTime<FixedOffset>, StoreError> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&offset))
        .map_err(|_| StoreError::InvalidTimestamp(value.to_string()))
}

fn query_one(
    conn: &Connection,
    sql: &str,
    user_id: &str,
    offset: FixedOffset,
) -> Result<Option<AttendanceLog>, StoreError> {
    conn.query_row(sql, params![user_id], RawLog::from_row)
        .optional()?
        .map(|raw| raw.into_log(offset))
        .transpose()
}

fn latest_for_user(
    conn: &Connection,
    user_id: &str,
    offset: FixedOffset,
) -> Result<Option<AttendanceLog>, StoreError> {
    let sql = format!(
        "{} WHERE user_id = ?1 ORDER BY enter_time DESC, id DESC LIMIT 1",
        SELECT_COLUMNS
    );
    query_one(conn, &sql, user_id, offset)
}

fn latest_open_for_user(
    conn: &Connection,
    user_id: &str,
    offset: FixedOffset,
) -> Result<Option<AttendanceLog>, StoreError> {
    let sql = format!(
        "{} WHERE user_id = ?1 AND exit_time IS NULL ORDER BY enter_time DESC, id DESC LIMIT 1",
        SELECT_COLUMNS
    );
    query_one(conn, &sql, user_id, offset)
}

fn insert_enter(
    conn: &Connection,
    user_id: &str,
    time: &DateTime<FixedOffset>,
) -> Result<i64, StoreError> {
    conn.execute(
        "INSERT INTO user_logs (user_id, enter_time, exit_time) VALUES (?1, ?2, NULL)",
        params![user_id, encode_time(time)],
    )?;
    Ok(conn.last_insert_rowid())
}

/// 仅当该行仍未关闭时写入离开时间
fn close_open(
    conn: &Connection,
    log_id: i64,
    time: &DateTime<FixedOffset>,
) -> Result<bool, StoreError> {
    let updated = conn.execute(
        "UPDATE user_logs SET exit_time = ?1 WHERE id = ?2 AND exit_time IS NULL",
        params![encode_time(time), log_id],
    )?;
    Ok(updated == 1)
}

/// 考勤存储
pub struct AttendanceStore {
    conn: Mutex<Connection>,
    offset: FixedOffset,
}

impl AttendanceStore {
    /// 打开（必要时创建）数据库文件
    pub fn open(path: impl AsRef<Path>, offset: FixedOffset) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        conn.busy_timeout(Duration::from_secs(5))?;
        let mode: String =
            conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
        if !mode.eq_ignore_ascii_case("wal") {
            tracing::warn!(journal_mode = %mode, "数据库未能切换到 WAL 模式");
        }
        Self::init(conn, offset)
    }

    pub fn open_in_memory(offset: FixedOffset) -> Result<Self, StoreError> {
        Self::init(Connection::open_in_memory()?, offset)
    }

    fn init(conn: Connection, offset: FixedOffset) -> Result<Self, StoreError> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
            offset,
        })
    }

    /// 用户最新的一行（按 enter_time 倒序）
    pub fn latest_for_user(&self, user_id: &str) -> Result<Option<AttendanceLog>, StoreError> {
        latest_for_user(&self.conn.lock(), user_id, self.offset)
    }

    /// 用户最新的未关闭行，不限日期
    pub fn latest_open_for_user(
        &self,
        user_id: &str,
    ) -> Result<Option<AttendanceLog>, StoreError> {
        latest_open_for_user(&self.conn.lock(), user_id, self.offset)
    }

    pub fn insert_enter(
        &self,
        user_id: &str,
        time: &DateTime<FixedOffset>,
    ) -> Result<i64, StoreError> {
        insert_enter(&self.conn.lock(), user_id, time)
    }

    /// 关闭指定行；该行已关闭或不存在时返回 false
    pub fn close_open(&self, log_id: i64, time: &DateTime<FixedOffset>) -> Result<bool, StoreError> {
        close_open(&self.conn.lock(), log_id, time)
    }

    /// 分页列出记录，最新的在前
    pub fn list(
        &self,
        user_id: Option<&str>,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<AttendanceLog>, StoreError> {
        let conn = self.conn.lock();
        let sql = format!(
            "{} WHERE (?1 IS NULL OR user_id = ?1) ORDER BY enter_time DESC, id DESC LIMIT ?2 OFFSET ?3",
            SELECT_COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let raws = stmt
            .query_map(params![user_id, limit, offset], RawLog::from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        raws.into_iter().map(|raw| raw.into_log(self.offset)).collect()
    }

    /// 在一个 IMMEDIATE 事务内读取现有记录、判定并写入
    ///
    /// 写锁在事务开始时获取，多个进程共用同一数据库时也不会交错
    pub fn apply(&self, event: &AccessEvent) -> Result<Outcome, StoreError> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let user_id = event.user_id.as_str();
        let latest = latest_for_user(&tx, user_id, self.offset)?;

        let outcome = match event.camera_role {
            CameraRole::Enter => {
                match decide_enter(latest.as_ref(), event.timestamp, self.offset) {
                    EnterDecision::Insert => Outcome::Entered {
                        log_id: insert_enter(&tx, user_id, &event.timestamp)?,
                    },
                    EnterDecision::Reject(conflict) => Outcome::Rejected { conflict },
                }
            }
            CameraRole::Exit => {
                let open = latest_open_for_user(&tx, user_id, self.offset)?;
                match decide_exit(latest.as_ref(), open.as_ref(), event.timestamp, self.offset) {
                    ExitDecision::Close { log_id } => {
                        if close_open(&tx, log_id, &event.timestamp)? {
                            Outcome::Exited { log_id }
                        } else {
                            Outcome::Rejected {
                                conflict: Conflict::NotEntered,
                            }
                        }
                    }
                    ExitDecision::Reject(conflict) => Outcome::Rejected { conflict },
                }
            }
        };

        tx.commit()?;
        Ok(outcome)
    }

    #[cfg(test)]
    pub(crate) fn break_schema_for_test(&self) {
        self.conn
            .lock()
            .execute_batch("DROP TABLE user_logs;")
            .unwrap();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn offset() -> FixedOffset {
        FixedOffset::east_opt(8 * 3600).unwrap()
    }

    fn t(s: &str) -> DateTime<FixedOffset> {
        DateTime::parse_from_rfc3339(s).unwrap()
    }

    fn event(user: &str, role: CameraRole, time: &str) -> AccessEvent {
        AccessEvent {
            user_id: user.to_string(),
            timestamp: t(time),
            camera_role: role,
            device_id: "gate".to_string(),
        }
    }

    fn store() -> AttendanceStore {
        AttendanceStore::open_in_memory(offset()).unwrap()
    }

    #[test]
    fn test_first_enter_creates_open_row() {
        let store = store();
        let outcome = store
            .apply(&event("1", CameraRole::Enter, "2026-03-02T08:00:00+08:00"))
            .unwrap();
        let Outcome::Entered { log_id } = outcome else {
            panic!("应该新建记录: {:?}", outcome);
        };

        let rows = store.list(Some("1"), 10, 0).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].id, log_id);
        assert_eq!(rows[0].enter_time, Some(t("2026-03-02T08:00:00+08:00")));
        assert_eq!(rows[0].exit_time, None);
    }

    #[test]
    fn test_second_enter_same_day_rejected() {
        let store = store();
        store
            .apply(&event("1", CameraRole::Enter, "2026-03-02T08:00:00+08:00"))
            .unwrap();
        let outcome = store
            .apply(&event("1", CameraRole::Enter, "2026-03-02T09:00:00+08:00"))
            .unwrap();

        assert_eq!(
            outcome,
            Outcome::Rejected {
                conflict: Conflict::AlreadyEntered
            }
        );
        assert_eq!(store.list(Some("1"), 10, 0).unwrap().len(), 1);
    }

    #[test]
    fn test_enter_next_day_keeps_yesterday_open() {
        let store = store();
        store
            .apply(&event("1", CameraRole::Enter, "2026-03-01T08:00:00+08:00"))
            .unwrap();
        let outcome = store
            .apply(&event("1", CameraRole::Enter, "2026-03-02T08:00:00+08:00"))
            .unwrap();
        assert!(matches!(outcome, Outcome::Entered { .. }));

        let rows = store.list(Some("1"), 10, 0).unwrap();
        assert_eq!(rows.len(), 2);
        assert!(rows.iter().all(AttendanceLog::is_open));
    }

    #[test]
    fn test_exit_without_open_row_rejected() {
        let store = store();
        let outcome = store
            .apply(&event("1", CameraRole::Exit, "2026-03-02T18:00:00+08:00"))
            .unwrap();
        assert_eq!(
            outcome,
            Outcome::Rejected {
                conflict: Conflict::NotEntered
            }
        );
        assert!(store.list(None, 10, 0).unwrap().is_empty());
    }

    #[test]
    fn test_enter_exit_enter_cycle() {
        let store = store();
        let Outcome::Entered { log_id: first } = store
            .apply(&event("1", CameraRole::Enter, "2026-03-02T08:00:00+08:00"))
            .unwrap()
        else {
            panic!("应该新建记录");
        };
        assert_eq!(
            store
                .apply(&event("1", CameraRole::Exit, "2026-03-02T12:00:00+08:00"))
                .unwrap(),
            Outcome::Exited { log_id: first }
        );
        assert!(matches!(
            store
                .apply(&event("1", CameraRole::Enter, "2026-03-02T13:00:00+08:00"))
                .unwrap(),
            Outcome::Entered { .. }
        ));

        let latest = store.latest_for_user("1").unwrap().unwrap();
        assert_ne!(latest.id, first);
        assert!(latest.is_open());

        let closed = store
            .list(Some("1"), 10, 0)
            .unwrap()
            .into_iter()
            .find(|row| row.id == first)
            .unwrap();
        assert_eq!(closed.exit_time, Some(t("2026-03-02T12:00:00+08:00")));
        assert!(closed.enter_time <= closed.exit_time);
    }

    /// 重复投递的进出事件不产生新行
    #[test]
    fn test_redelivery_is_rejected() {
        let store = store();
        let enter = event("1", CameraRole::Enter, "2026-03-02T08:00:00+08:00");
        let exit = event("1", CameraRole::Exit, "2026-03-02T18:00:00+08:00");
        store.apply(&enter).unwrap();
        store.apply(&exit).unwrap();

        assert_eq!(
            store.apply(&enter).unwrap(),
            Outcome::Rejected {
                conflict: Conflict::Duplicate
            }
        );
        assert_eq!(
            store.apply(&exit).unwrap(),
            Outcome::Rejected {
                conflict: Conflict::Duplicate
            }
        );
        assert_eq!(store.list(Some("1"), 10, 0).unwrap().len(), 1);
    }

    #[test]
    fn test_close_open_is_conditional() {
        let store = store();
        let id = store
            .insert_enter("1", &t("2026-03-02T08:00:00+08:00"))
            .unwrap();
        assert!(store.close_open(id, &t("2026-03-02T18:00:00+08:00")).unwrap());
        assert!(!store.close_open(id, &t("2026-03-02T19:00:00+08:00")).unwrap());
        assert!(store.latest_open_for_user("1").unwrap().is_none());

        let row = store.latest_for_user("1").unwrap().unwrap();
        assert_eq!(row.exit_time, Some(t("2026-03-02T18:00:00+08:00")));
    }

    #[test]
    fn test_latest_open_ignores_day() {
        let store = store();
        let old = store
            .insert_enter("1", &t("2026-02-27T08:00:00+08:00"))
            .unwrap();
        let open = store.latest_open_for_user("1").unwrap().unwrap();
        assert_eq!(open.id, old);
    }

    #[test]
    fn test_list_filters_and_pages() {
        let store = store();
        for (user, time) in [
            ("1", "2026-03-01T08:00:00+08:00"),
            ("2", "2026-03-01T08:05:00+08:00"),
            ("1", "2026-03-02T08:00:00+08:00"),
            ("1", "2026-03-03T08:00:00+08:00"),
        ] {
            store.insert_enter(user, &t(time)).unwrap();
        }

        assert_eq!(store.list(None, 10, 0).unwrap().len(), 4);

        let page = store.list(Some("1"), 2, 0).unwrap();
        assert_eq!(page.len(), 2);
        assert_eq!(page[0].enter_time, Some(t("2026-03-03T08:00:00+08:00")));
        assert_eq!(page[1].enter_time, Some(t("2026-03-02T08:00:00+08:00")));

        let rest = store.list(Some("1"), 2, 2).unwrap();
        assert_eq!(rest.len(), 1);
        assert_eq!(rest[0].enter_time, Some(t("2026-03-01T08:00:00+08:00")));
    }

    /// 不同偏移的时间按绝对时刻排序，读出时转换到配置偏移
    #[test]
    fn test_times_normalized_to_offset() {
        let store = store();
        store.insert_enter("1", &t("2026-03-02T01:00:00Z")).unwrap();
        store
            .insert_enter("1", &t("2026-03-02T08:30:00+08:00"))
            .unwrap();

        let latest = store.latest_for_user("1").unwrap().unwrap();
        let enter = latest.enter_time.unwrap();
        assert_eq!(enter.to_rfc3339(), "2026-03-02T09:00:00+08:00");
    }

    #[test]
    fn test_file_store_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("attendance.db");

        {
            let store = AttendanceStore::open(&path, offset()).unwrap();
            store
                .apply(&event("1", CameraRole::Enter, "2026-03-02T08:00:00+08:00"))
                .unwrap();
        }

        let store = AttendanceStore::open(&path, offset()).unwrap();
        let row = store.latest_open_for_user("1").unwrap().unwrap();
        assert_eq!(row.enter_time, Some(t("2026-03-02T08:00:00+08:00")));
    }
}
