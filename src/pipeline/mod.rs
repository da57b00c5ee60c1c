//! 设备任务与 broker 之间的有界队列和发布器

pub mod dead_letter;
pub mod publisher;
pub mod queue;

pub use dead_letter::DeadLetterLog;
pub use publisher::Publisher;
pub use queue::{EventQueue, EventReceiver, EventSender};
