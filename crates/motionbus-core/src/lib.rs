//! motionbus-core — wire format, framing, codes and configuration.
//! All other Motionbus crates depend on this one.

pub mod checksum;
pub mod code;
pub mod codec;
pub mod config;
pub mod message;
pub mod request;
pub mod status;
pub mod wire;

pub use code::{Code, CodeChannel, CodeType, ParseError};
pub use message::{CodeResult, Message, MessageType, MessageTypeFlags};
pub use request::FirmwareMessage;
