//! 死信记录
//!
//! 重试次数用尽的事件以 JSON Lines 追加到本地文件，供人工补录。

use std::path::{Path, PathBuf};

use chrono::{DateTime, FixedOffset, Utc};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;

use crate::model::event::{AccessEvent, CameraRole};

/// 死信文件中的一行
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetterRecord {
    pub user_id: String,
    pub time: DateTime<FixedOffset>,
    pub camera_type: CameraRole,
    pub device_id: String,
    pub attempts: u32,
    pub error: String,
    pub failed_at: DateTime<Utc>,
}

/// 追加写入的死信日志
#[derive(Debug, Clone)]
pub struct DeadLetterLog {
    path: PathBuf,
}

impl DeadLetterLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn write(&self, event: &AccessEvent, attempts: u32, error: &str) -> anyhow::Result<()> {
        let record = DeadLetterRecord {
            user_id: event.user_id.clone(),
            time: event.timestamp,
            camera_type: event.camera_role,
            device_id: event.device_id.clone(),
            attempts,
            error: error.to_string(),
            failed_at: Utc::now(),
        };
        let mut line = serde_json::to_vec(&record)?;
        line.push(b'\n');

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(&line).await?;
        file.flush().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_appends_json_lines() {
        let dir = tempfile::tempdir().unwrap();
        let log = DeadLetterLog::new(dir.path().join("dead.jsonl"));
        let event = AccessEvent {
            user_id: "42".to_string(),
            timestamp: DateTime::parse_from_rfc3339("2026-03-02T08:00:00+08:00").unwrap(),
            camera_role: CameraRole::Exit,
            device_id: "gate-out".to_string(),
        };

        log.write(&event, 5, "broker 不可达").await.unwrap();
        log.write(&event, 5, "broker 不可达").await.unwrap();

        let content = tokio::fs::read_to_string(log.path()).await.unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);

        let record: DeadLetterRecord = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(record.user_id, "42");
        assert_eq!(record.camera_type, CameraRole::Exit);
        assert_eq!(record.attempts, 5);
    }
}
