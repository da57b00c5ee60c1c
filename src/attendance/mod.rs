//! 考勤关联：把 broker 上的进出事件整理为按天的进出记录

pub mod consumer;
pub mod correlator;
pub mod model;
pub mod rules;
pub mod store;

pub use consumer::{Disposition, Prepared, handle_delivery, run_consumer};
pub use correlator::{Correlator, UserTicket};
pub use model::{AttendanceLog, Conflict, Outcome};
pub use store::AttendanceStore;
