//! 门禁设备接入：认证长连接、multipart 分帧、事件解码与重连监督

pub mod decoder;
pub mod digest;
pub mod framing;
pub mod stream;
pub mod supervisor;

pub use decoder::{Decoded, FrameDecoder, IgnoreReason};
pub use framing::{Frame, MultipartFramer};
pub use stream::{DeviceConnector, FrameSource, HttpDeviceConnector};
pub use supervisor::{Backoff, DeviceSupervisor};
