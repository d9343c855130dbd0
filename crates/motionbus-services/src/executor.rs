//! Execution of codes read from macro files.
//!
//! Each macro code runs as its own task so that several can be in flight
//! while the scheduler keeps reading ahead. The executor decides whether the
//! host handles a code itself or forwards it to the firmware.

use futures::future::BoxFuture;

use motionbus_core::{Code, CodeResult};

/// What became of a macro code.
#[derive(Debug, Clone, PartialEq)]
pub enum Execution {
    /// Handled on the host; nothing is sent to the firmware.
    Handled(CodeResult),
    /// Send this code to the firmware.
    Forward(Code),
    /// Execution failed. The macro is aborted.
    Failed(String),
}

pub trait CodeExecutor: Send + Sync {
    fn execute(&self, code: Code) -> BoxFuture<'static, Execution>;
}

/// Forwards every code to the firmware.
#[derive(Debug, Default, Clone, Copy)]
pub struct FirmwareExecutor;

impl CodeExecutor for FirmwareExecutor {
    fn execute(&self, code: Code) -> BoxFuture<'static, Execution> {
        Box::pin(async move { Execution::Forward(code) })
    }
}
