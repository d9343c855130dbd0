//! Where the scheduler writes its outbound requests.
//!
//! The transport implements this over its current transmit buffer. Every
//! method returns false when the request does not fit, in which case the
//! scheduler keeps the request and retries after the next transfer.

use motionbus_core::CodeChannel;

pub trait RequestSink {
    /// Queue a serialized code.
    fn write_code(&mut self, payload: &[u8]) -> bool;

    fn write_macro_completed(&mut self, channel: CodeChannel, error: bool) -> bool;

    fn write_lock_movement(&mut self, channel: CodeChannel) -> bool;

    fn write_unlock(&mut self, channel: CodeChannel) -> bool;
}

/// Records requests instead of sending them. Test helper.
#[cfg(test)]
#[derive(Debug, Default)]
pub(crate) struct RecordingSink {
    pub codes: Vec<Vec<u8>>,
    pub macro_completions: Vec<(CodeChannel, bool)>,
    pub locks: Vec<CodeChannel>,
    pub unlocks: Vec<CodeChannel>,
    /// Remaining number of writes accepted before reporting a full buffer.
    pub capacity: Option<usize>,
}

#[cfg(test)]
impl RecordingSink {
    fn accept(&mut self) -> bool {
        match self.capacity.as_mut() {
            Some(0) => false,
            Some(n) => {
                *n -= 1;
                true
            }
            None => true,
        }
    }

    /// Letter and major number of each code written so far, e.g. `["G28", "G1"]`.
    pub fn code_names(&self) -> Vec<String> {
        self.codes
            .iter()
            .map(|c| {
                let major = i32::from_le_bytes([c[4], c[5], c[6], c[7]]);
                format!("{}{}", c[3] as char, major)
            })
            .collect()
    }
}

#[cfg(test)]
impl RequestSink for RecordingSink {
    fn write_code(&mut self, payload: &[u8]) -> bool {
        if !self.accept() {
            return false;
        }
        self.codes.push(payload.to_vec());
        true
    }

    fn write_macro_completed(&mut self, channel: CodeChannel, error: bool) -> bool {
        if !self.accept() {
            return false;
        }
        self.macro_completions.push((channel, error));
        true
    }

    fn write_lock_movement(&mut self, channel: CodeChannel) -> bool {
        if !self.accept() {
            return false;
        }
        self.locks.push(channel);
        true
    }

    fn write_unlock(&mut self, channel: CodeChannel) -> bool {
        if !self.accept() {
            return false;
        }
        self.unlocks.push(channel);
        true
    }
}
