//! 配置与事件模型

pub mod config;
pub mod event;
