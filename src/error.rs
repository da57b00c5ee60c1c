//! 错误类型
//!
//! 连接与流错误由各设备的重连监督器在本地恢复；解析错误只丢弃当前帧；
//! 发布错误触发有限次重试后进入死信；考勤冲突不是错误，见 `attendance::Outcome`。

use thiserror::Error;

/// 设备会话错误（ConnectFailure / StreamFailure）
#[derive(Error, Debug)]
pub enum DeviceError {
    /// 连接被拒绝、超时等
    #[error("连接失败: {0}")]
    Connect(String),

    /// 设备返回非成功状态码
    #[error("设备返回非成功状态: HTTP {0}")]
    Status(u16),

    /// Digest 认证失败（质询缺失或凭据被拒绝）
    #[error("认证失败: {0}")]
    Auth(String),

    /// 流读取过程中出错
    #[error("流读取失败: {0}")]
    Stream(String),

    /// 缓冲区超过上限仍未找到边界
    #[error("缓冲区溢出: {size} 字节内未找到边界")]
    BufferOverflow { size: usize },
}

impl DeviceError {
    /// 是否属于建立连接阶段的失败
    pub fn is_connect_failure(&self) -> bool {
        matches!(self, Self::Connect(_) | Self::Status(_) | Self::Auth(_))
    }

    pub fn connect(msg: impl Into<String>) -> Self {
        Self::Connect(msg.into())
    }

    pub fn stream(msg: impl Into<String>) -> Self {
        Self::Stream(msg.into())
    }
}

/// 单帧解析失败（ParseFailure），只影响当前帧
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("帧中缺少头部与正文的分隔空行")]
    MissingSeparator,

    #[error("JSON 解析失败: {0}")]
    InvalidJson(String),

    #[error("事件缺少 dateTime 字段")]
    MissingTimestamp,

    #[error("无法解析时间: {0}")]
    InvalidTimestamp(String),
}

/// 发布到 broker 失败（PublishFailure）
#[derive(Error, Debug)]
pub enum PublishError {
    #[error("broker 不可达: {0}")]
    Unavailable(String),

    #[error("broker 拒绝消息")]
    Rejected,

    #[error("消息序列化失败: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// 考勤存储错误
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("SQLite 错误: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("存储中的时间格式无效: {0}")]
    InvalidTimestamp(String),

    #[error("后台任务失败: {0}")]
    Task(String),
}

/// 事件队列已关闭（消费者已退出）
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("事件队列已关闭")]
pub struct QueueClosed;
