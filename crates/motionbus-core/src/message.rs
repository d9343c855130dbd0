//! Messages and code results.
//!
//! Firmware replies arrive as text fragments tagged with [`MessageTypeFlags`].
//! The fragments belonging to one code are collected into a [`CodeResult`].

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::code::CodeChannel;

// ── Reply Flags ───────────────────────────────────────────────────────────────

/// Flags attached to every reply fragment.
///
/// Bits 0..12 name destination channels, one per `CodeChannel`. The upper
/// bits describe the kind of message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageTypeFlags(pub u32);

impl MessageTypeFlags {
    pub const CHANNEL_MASK: u32 = 0x0000_0FFF;
    pub const ERROR: Self = Self(0x0100_0000);
    pub const WARNING: Self = Self(0x0200_0000);
    pub const LOG: Self = Self(0x0400_0000);
    pub const RAW: Self = Self(0x0800_0000);
    pub const BINARY_CODE_REPLY: Self = Self(0x1000_0000);
    /// More fragments of the same message follow.
    pub const PUSH: Self = Self(0x2000_0000);

    pub const fn bits(self) -> u32 {
        self.0
    }

    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub const fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    pub fn for_channel(channel: CodeChannel) -> Self {
        Self(1 << channel as u32)
    }

    /// Destination channels named by this reply.
    pub fn channels(self) -> impl Iterator<Item = CodeChannel> {
        CodeChannel::ALL
            .into_iter()
            .filter(move |c| self.0 & (1 << *c as u32) != 0)
    }

    pub fn is_push(self) -> bool {
        self.contains(Self::PUSH)
    }

    /// Severity of a message carrying these flags.
    pub fn message_type(self) -> MessageType {
        if self.contains(Self::ERROR) {
            MessageType::Error
        } else if self.contains(Self::WARNING) {
            MessageType::Warning
        } else {
            MessageType::Success
        }
    }
}

impl std::ops::BitOr for MessageTypeFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        self.union(rhs)
    }
}

// ── Messages ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageType {
    Success,
    Warning,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    #[serde(rename = "type")]
    pub kind: MessageType,
    pub content: String,
}

impl Message {
    pub fn new(kind: MessageType, content: impl Into<String>) -> Self {
        Self {
            kind,
            content: content.into(),
        }
    }

    pub fn success(content: impl Into<String>) -> Self {
        Self::new(MessageType::Success, content)
    }

    pub fn warning(content: impl Into<String>) -> Self {
        Self::new(MessageType::Warning, content)
    }

    pub fn error(content: impl Into<String>) -> Self {
        Self::new(MessageType::Error, content)
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            MessageType::Success => f.write_str(&self.content),
            MessageType::Warning => write!(f, "Warning: {}", self.content),
            MessageType::Error => write!(f, "Error: {}", self.content),
        }
    }
}

// ── Code Results ──────────────────────────────────────────────────────────────

/// Messages produced while executing one code.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CodeResult(pub Vec<Message>);

impl CodeResult {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.0.iter().all(|m| m.content.is_empty())
    }

    pub fn is_successful(&self) -> bool {
        self.0.iter().all(|m| m.kind != MessageType::Error)
    }

    pub fn push(&mut self, message: Message) {
        self.0.push(message);
    }

    pub fn messages(&self) -> &[Message] {
        &self.0
    }

    /// Add one reply fragment. A fragment that follows a push fragment
    /// continues the previous message instead of starting a new one.
    pub fn append_fragment(&mut self, flags: MessageTypeFlags, text: &str, continues: bool) {
        match self.0.last_mut() {
            Some(last) if continues => last.content.push_str(text),
            _ => {
                if !text.is_empty() {
                    self.0.push(Message::new(flags.message_type(), text));
                }
            }
        }
    }
}

impl fmt::Display for CodeResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, message) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str("\n")?;
            }
            write!(f, "{message}")?;
        }
        Ok(())
    }
}
