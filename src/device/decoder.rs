//! 帧解码
//!
//! 把一个原始帧解析为零个或一个 [`AccessEvent`]。单帧的任何问题都只会
//! 让该帧被丢弃，不会向上抛出。

use chrono::{DateTime, FixedOffset, NaiveDateTime, TimeZone};
use memchr::memmem;
use serde::Deserialize;

use super::framing::Frame;
use crate::error::DecodeError;
use crate::model::config::DeviceConfig;
use crate::model::event::{AccessEvent, CameraRole};

/// 设备用来表示未识别人员的占位值
const UNKNOWN_SUBJECT: &str = "unknown";

/// 帧解码结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decoded {
    /// 识别出的门禁事件
    Event(AccessEvent),
    /// 正常忽略的帧（心跳、图片、非门禁事件等）
    Ignored(IgnoreReason),
    /// 格式错误的帧
    Failed(DecodeError),
}

/// 忽略帧的原因
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IgnoreReason {
    /// 非 JSON 部分（图片、心跳）
    NotJson,
    /// `Non-AccessControllerEvent` 信息事件
    NonAccessControllerEvent,
    /// 未识别人员或缺少人员标识
    UnknownSubject,
    /// 未知的 eventType（缺失时为 None）
    Unrecognized(Option<String>),
}

/// 设备推送的 JSON 事件（只取用到的字段）
#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(rename = "eventType")]
    event_type: Option<String>,
    #[serde(rename = "dateTime")]
    date_time: Option<String>,
    #[serde(rename = "AccessControllerEvent")]
    access_controller: Option<AccessControllerDetail>,
}

#[derive(Debug, Default, Deserialize)]
struct AccessControllerDetail {
    #[serde(rename = "employeeNoString")]
    employee_no: Option<String>,
    name: Option<String>,
}

/// 按 eventType 区分的设备事件（封闭集合 + 兜底分支）
#[derive(Debug)]
enum DeviceEvent {
    AccessController {
        date_time: Option<String>,
        detail: AccessControllerDetail,
    },
    NonAccessController,
    Unrecognized(Option<String>),
}

impl From<Envelope> for DeviceEvent {
    fn from(envelope: Envelope) -> Self {
        match envelope.event_type.as_deref() {
            Some("AccessControllerEvent") => Self::AccessController {
                date_time: envelope.date_time,
                detail: envelope.access_controller.unwrap_or_default(),
            },
            Some("Non-AccessControllerEvent") => Self::NonAccessController,
            _ => Self::Unrecognized(envelope.event_type),
        }
    }
}

impl AccessControllerDetail {
    /// 人员标识：优先 employeeNoString，其次 name
    fn subject(&self) -> Option<&str> {
        [self.employee_no.as_deref(), self.name.as_deref()]
            .into_iter()
            .flatten()
            .map(str::trim)
            .find(|s| !s.is_empty())
    }
}

/// 单台设备的帧解码器
///
/// 事件的摄像头角色和设备 ID 来自设备静态配置，不取自 payload
#[derive(Debug, Clone)]
pub struct FrameDecoder {
    device_id: String,
    role: CameraRole,
    /// dateTime 不带时区时使用的偏移
    local_offset: FixedOffset,
}

impl FrameDecoder {
    pub fn new(device_id: impl Into<String>, role: CameraRole, local_offset: FixedOffset) -> Self {
        Self {
            device_id: device_id.into(),
            role,
            local_offset,
        }
    }

    pub fn for_device(device: &DeviceConfig, local_offset: FixedOffset) -> Self {
        Self::new(device.id.clone(), device.role, local_offset)
    }

    pub fn decode(&self, frame: &Frame) -> Decoded {
        let raw = frame.as_bytes();
        let Some(split) = memmem::find(raw, b"\r\n\r\n") else {
            return Decoded::Failed(DecodeError::MissingSeparator);
        };
        let headers = String::from_utf8_lossy(&raw[..split]);
        let body = &raw[split + 4..];

        if !is_json_part(&headers) {
            return Decoded::Ignored(IgnoreReason::NotJson);
        }

        let envelope: Envelope = match serde_json::from_slice(body) {
            Ok(envelope) => envelope,
            Err(e) => return Decoded::Failed(DecodeError::InvalidJson(e.to_string())),
        };

        match DeviceEvent::from(envelope) {
            DeviceEvent::AccessController { date_time, detail } => {
                let Some(subject) = detail.subject() else {
                    return Decoded::Ignored(IgnoreReason::UnknownSubject);
                };
                if subject.eq_ignore_ascii_case(UNKNOWN_SUBJECT) {
                    return Decoded::Ignored(IgnoreReason::UnknownSubject);
                }
                let Some(date_time) = date_time else {
                    return Decoded::Failed(DecodeError::MissingTimestamp);
                };
                match parse_device_time(&date_time, self.local_offset) {
                    Ok(timestamp) => Decoded::Event(AccessEvent {
                        user_id: subject.to_string(),
                        timestamp,
                        camera_role: self.role,
                        device_id: self.device_id.clone(),
                    }),
                    Err(e) => Decoded::Failed(e),
                }
            }
            DeviceEvent::NonAccessController => {
                Decoded::Ignored(IgnoreReason::NonAccessControllerEvent)
            }
            DeviceEvent::Unrecognized(event_type) => {
                Decoded::Ignored(IgnoreReason::Unrecognized(event_type))
            }
        }
    }
}

/// 头部是否声明了 JSON 内容类型
fn is_json_part(headers: &str) -> bool {
    headers.lines().any(|line| {
        line.split_once(':').is_some_and(|(name, value)| {
            name.trim().eq_ignore_ascii_case("content-type")
                && value.to_ascii_lowercase().contains("application/json")
        })
    })
}

/// 解析设备时间：RFC 3339，或不带时区的本地时间
pub fn parse_device_time(
    value: &str,
    local_offset: FixedOffset,
) -> Result<DateTime<FixedOffset>, DecodeError> {
    let value = value.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(value) {
        return Ok(dt);
    }
    NaiveDateTime::parse_from_str(value, "%Y-%m-%dT%H:%M:%S%.f")
        .ok()
        .and_then(|naive| local_offset.from_local_datetime(&naive).single())
        .ok_or_else(|| DecodeError::InvalidTimestamp(value.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn offset() -> FixedOffset {
        FixedOffset::east_opt(8 * 3600).unwrap()
    }

    fn decoder() -> FrameDecoder {
        FrameDecoder::new("gate-in", CameraRole::Enter, offset())
    }

    fn json_frame(body: &str) -> Frame {
        Frame::new(format!(
            "Content-Type: application/json; charset=\"UTF-8\"\r\nContent-Length: {}\r\n\r\n{}\r\n",
            body.len(),
            body
        ))
    }

    #[test]
    fn test_access_controller_event() {
        let frame = json_frame(
            r#"{"eventType":"AccessControllerEvent","dateTime":"2026-03-02T08:01:15+08:00",
                "AccessControllerEvent":{"employeeNoString":"1024","name":"Alice"}}"#,
        );

        let Decoded::Event(event) = decoder().decode(&frame) else {
            panic!("应该解析出门禁事件");
        };
        assert_eq!(event.user_id, "1024");
        assert_eq!(event.camera_role, CameraRole::Enter);
        assert_eq!(event.device_id, "gate-in");
        assert_eq!(event.timestamp.to_rfc3339(), "2026-03-02T08:01:15+08:00");
    }

    /// 角色取自设备配置，即使 payload 中有类似字段也不采用
    #[test]
    fn test_role_comes_from_device_config() {
        let decoder = FrameDecoder::new("gate-out", CameraRole::Exit, offset());
        let frame = json_frame(
            r#"{"eventType":"AccessControllerEvent","dateTime":"2026-03-02T17:01:15+08:00",
                "camera_type":"enter","AccessControllerEvent":{"employeeNoString":"7"}}"#,
        );
        let Decoded::Event(event) = decoder.decode(&frame) else {
            panic!("应该解析出门禁事件");
        };
        assert_eq!(event.camera_role, CameraRole::Exit);
        assert_eq!(event.device_id, "gate-out");
    }

    #[test]
    fn test_name_fallback() {
        let frame = json_frame(
            r#"{"eventType":"AccessControllerEvent","dateTime":"2026-03-02T08:01:15+08:00",
                "AccessControllerEvent":{"name":"Bob"}}"#,
        );
        let Decoded::Event(event) = decoder().decode(&frame) else {
            panic!("应该回退到 name 字段");
        };
        assert_eq!(event.user_id, "Bob");
    }

    #[test]
    fn test_unknown_subject_dropped() {
        let unknown = json_frame(
            r#"{"eventType":"AccessControllerEvent","dateTime":"2026-03-02T08:01:15+08:00",
                "AccessControllerEvent":{"employeeNoString":"unknown"}}"#,
        );
        assert_eq!(
            decoder().decode(&unknown),
            Decoded::Ignored(IgnoreReason::UnknownSubject)
        );

        let missing = json_frame(
            r#"{"eventType":"AccessControllerEvent","dateTime":"2026-03-02T08:01:15+08:00",
                "AccessControllerEvent":{"majorEventType":5}}"#,
        );
        assert_eq!(
            decoder().decode(&missing),
            Decoded::Ignored(IgnoreReason::UnknownSubject)
        );

        let no_detail = json_frame(
            r#"{"eventType":"AccessControllerEvent","dateTime":"2026-03-02T08:01:15+08:00"}"#,
        );
        assert_eq!(
            decoder().decode(&no_detail),
            Decoded::Ignored(IgnoreReason::UnknownSubject)
        );
    }

    #[test]
    fn test_unrecognized_or_missing_event_type() {
        let other = json_frame(r#"{"eventType":"videoloss","dateTime":"2026-03-02T08:01:15+08:00"}"#);
        assert_eq!(
            decoder().decode(&other),
            Decoded::Ignored(IgnoreReason::Unrecognized(Some("videoloss".to_string())))
        );

        let missing = json_frame(r#"{"dateTime":"2026-03-02T08:01:15+08:00"}"#);
        assert_eq!(
            decoder().decode(&missing),
            Decoded::Ignored(IgnoreReason::Unrecognized(None))
        );
    }

    #[test]
    fn test_non_access_controller_event() {
        let frame = json_frame(r#"{"eventType":"Non-AccessControllerEvent"}"#);
        assert_eq!(
            decoder().decode(&frame),
            Decoded::Ignored(IgnoreReason::NonAccessControllerEvent)
        );
    }

    #[test]
    fn test_non_json_part_ignored() {
        let frame = Frame::new(&b"Content-Type: image/jpeg\r\nContent-Length: 4\r\n\r\n\xff\xd8\xff\xe0"[..]);
        assert_eq!(decoder().decode(&frame), Decoded::Ignored(IgnoreReason::NotJson));
    }

    #[test]
    fn test_malformed_frames() {
        let no_separator = Frame::new("Content-Type: application/json\r\n{}");
        assert_eq!(
            decoder().decode(&no_separator),
            Decoded::Failed(DecodeError::MissingSeparator)
        );

        let bad_json = json_frame(r#"{"eventType": "#);
        assert!(matches!(
            decoder().decode(&bad_json),
            Decoded::Failed(DecodeError::InvalidJson(_))
        ));

        let no_time = json_frame(
            r#"{"eventType":"AccessControllerEvent","AccessControllerEvent":{"employeeNoString":"1"}}"#,
        );
        assert_eq!(
            decoder().decode(&no_time),
            Decoded::Failed(DecodeError::MissingTimestamp)
        );
    }

    #[test]
    fn test_parse_device_time_without_offset() {
        let dt = parse_device_time("2026-03-02T08:01:15", offset()).unwrap();
        assert_eq!(dt.to_rfc3339(), "2026-03-02T08:01:15+08:00");
        assert!(parse_device_time("yesterday", offset()).is_err());
    }
}
