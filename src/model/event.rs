//! 门禁事件数据模型

use std::fmt;

use chrono::{DateTime, FixedOffset};
use serde::{Deserialize, Serialize};

/// 摄像头角色（由设备静态配置决定，不取自事件内容）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CameraRole {
    Enter,
    Exit,
}

impl CameraRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Enter => "enter",
            Self::Exit => "exit",
        }
    }
}

impl fmt::Display for CameraRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 标准化后的门禁事件
///
/// 由帧解码器产生，依次经过事件队列、发布器，最终序列化为 broker 消息
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessEvent {
    pub user_id: String,
    pub timestamp: DateTime<FixedOffset>,
    pub camera_role: CameraRole,
    pub device_id: String,
}

/// Broker 消息体
///
/// 线上格式: `{"user_id": "...", "time": "<RFC3339>", "camera_type": "enter|exit"}`，
/// `device_id` 为可选附加字段，仅用于日志追踪
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BrokerMessage {
    pub user_id: String,
    pub time: DateTime<FixedOffset>,
    pub camera_type: CameraRole,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_id: Option<String>,
}

impl From<&AccessEvent> for BrokerMessage {
    fn from(event: &AccessEvent) -> Self {
        Self {
            user_id: event.user_id.clone(),
            time: event.timestamp,
            camera_type: event.camera_role,
            device_id: Some(event.device_id.clone()),
        }
    }
}

impl From<BrokerMessage> for AccessEvent {
    fn from(message: BrokerMessage) -> Self {
        Self {
            user_id: message.user_id,
            timestamp: message.time,
            camera_role: message.camera_type,
            device_id: message.device_id.unwrap_or_default(),
        }
    }
}
