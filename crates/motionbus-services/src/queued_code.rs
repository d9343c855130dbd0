//! A code waiting in, or travelling through, a channel.

use motionbus_core::codec::packet_size;
use motionbus_core::request::encode_code;
use motionbus_core::wire::WireError;
use motionbus_core::{Code, CodeResult, Message, MessageTypeFlags};

use crate::completion::{completion, Completion, CompletionHandle};

/// Why a code produced no result.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CodeError {
    #[error("code cancelled: {0}")]
    Cancelled(String),

    #[error("code failed: {0}")]
    Failed(String),
}

pub type CodeOutcome = Result<CodeResult, CodeError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodeState {
    Pending,
    Buffered,
    Suspended,
    Finished,
    Cancelled,
    Errored,
}

#[derive(Debug)]
pub struct QueuedCode {
    /// Unique per channel, used to find a code again after it moved lists.
    pub id: u64,
    pub code: Code,
    pub state: CodeState,
    pub result: CodeResult,
    /// Bytes this code occupies in the firmware's buffer while in flight.
    pub binary_size: usize,
    /// The firmware is running a macro on behalf of this code, so replies
    /// must not be routed to it.
    pub doing_nested_macro: bool,
    last_push: bool,
    completion: Completion<CodeOutcome>,
}

impl QueuedCode {
    pub fn new(id: u64, code: Code) -> (Self, CompletionHandle<CodeOutcome>) {
        let (completion, handle) = completion();
        (Self::with_completion(id, code, completion), handle)
    }

    /// A code started by the firmware itself, e.g. from a macro file.
    /// Nobody awaits its result; it is logged when it finishes.
    pub fn internal(id: u64, code: Code) -> Self {
        Self::with_completion(id, code, Completion::detached())
    }

    fn with_completion(id: u64, code: Code, completion: Completion<CodeOutcome>) -> Self {
        Self {
            id,
            code,
            state: CodeState::Pending,
            result: CodeResult::new(),
            binary_size: 0,
            doing_nested_macro: false,
            last_push: false,
            completion,
        }
    }

    /// Serialize for transmission and record the in-flight size.
    pub fn encode(&mut self) -> Result<Vec<u8>, WireError> {
        let payload = encode_code(&self.code)?;
        self.binary_size = packet_size(payload.len());
        Ok(payload)
    }

    pub fn is_internal(&self) -> bool {
        self.completion.is_resolved()
    }

    /// Feed one reply fragment. Returns true when the code is complete.
    pub fn handle_reply(&mut self, flags: MessageTypeFlags, text: &str) -> bool {
        let text = if self.last_push { text } else { text.trim_start() };
        self.result.append_fragment(flags, text.trim_end_matches('\n'), self.last_push);
        self.last_push = flags.is_push();
        !self.last_push
    }

    /// Complete successfully with whatever replies were collected.
    pub fn finish(&mut self) {
        self.state = CodeState::Finished;
        if self.is_internal() {
            log_internal_result(&self.code, &self.result);
        }
        let result = std::mem::take(&mut self.result);
        self.completion.resolve(Ok(result));
    }

    pub fn finish_with(&mut self, message: Message) {
        self.result.push(message);
        self.finish();
    }

    pub fn cancel(&mut self, reason: &str) {
        self.state = CodeState::Cancelled;
        if !self.completion.resolve(Err(CodeError::Cancelled(reason.to_string()))) {
            tracing::debug!(code = %self.code, reason, "internal code cancelled");
        }
    }

    pub fn fail(&mut self, error: impl std::fmt::Display) {
        self.state = CodeState::Errored;
        let message = error.to_string();
        if !self.completion.resolve(Err(CodeError::Failed(message.clone()))) {
            tracing::error!(code = %self.code, error = %message, "internal code failed");
        }
    }
}

fn log_internal_result(code: &Code, result: &CodeResult) {
    for message in result.messages() {
        match message.kind {
            motionbus_core::MessageType::Error => {
                tracing::error!(code = %code, "{}", message.content)
            }
            motionbus_core::MessageType::Warning => {
                tracing::warn!(code = %code, "{}", message.content)
            }
            motionbus_core::MessageType::Success => {
                tracing::info!(code = %code, "{}", message.content)
            }
        }
    }
}
