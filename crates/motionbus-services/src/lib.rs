//! motionbus-services — per-channel code scheduling on top of motionbus-core.
//!
//! The transport run loop drives a [`ChannelStore`]; clients queue codes and
//! wait for their results through a [`ControlHandle`].

pub mod channel;
pub mod completion;
pub mod control;
pub mod executor;
pub mod macro_file;
pub mod queued_code;
pub mod sink;
pub mod store;

pub use channel::{ChannelInformation, SchedulerSettings};
pub use control::{ControlHandle, SpecialRequests};
pub use executor::{CodeExecutor, Execution, FirmwareExecutor};
pub use macro_file::FileResolver;
pub use queued_code::{CodeError, CodeOutcome};
pub use sink::RequestSink;
pub use store::ChannelStore;
