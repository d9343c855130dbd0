//! Motionbus integration test harness.
//!
//! Tests drive the channel store the way the daemon's run loop does. The
//! firmware side is a [`FirmwareLink`]: requests land in a real transmit
//! buffer and are decoded again from the wire bytes at every transfer.
//!
//!   cargo test --test integration

mod invariants;
mod macros;
mod scheduling;

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use anyhow::{bail, Context, Result};

use motionbus_core::codec::{iterate_packets, PacketWriter};
use motionbus_core::request::{encode_channel, encode_macro_completed};
use motionbus_core::wire::HostRequest;
use motionbus_core::{Code, CodeChannel, MessageTypeFlags};
use motionbus_services::{
    ChannelStore, FileResolver, FirmwareExecutor, RequestSink, SchedulerSettings,
};

// ── Firmware stand-in ─────────────────────────────────────────────────────────

/// A request as the firmware sees it after decoding the transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Sent {
    /// Letter and major number, e.g. "G28".
    Code { channel: CodeChannel, name: String },
    MacroCompleted { channel: CodeChannel, error: bool },
    Lock(CodeChannel),
    Unlock(CodeChannel),
}

pub struct FirmwareLink {
    writer: PacketWriter,
}

impl FirmwareLink {
    pub fn new(capacity: usize) -> Self {
        Self {
            writer: PacketWriter::new(capacity),
        }
    }

    /// Hand the transmit buffer to the firmware and start a fresh one.
    pub fn transfer(&mut self) -> Result<Vec<Sent>> {
        let mut sent = Vec::new();
        for packet in iterate_packets(self.writer.as_bytes(), self.writer.packet_count()) {
            let packet = packet.context("transmit buffer does not parse")?;
            let payload = packet.payload;
            let channel = CodeChannel::try_from(payload[0])?;
            let request = HostRequest::try_from(packet.header.request())?;
            sent.push(match request {
                HostRequest::Code => {
                    let major = i32::from_le_bytes([payload[4], payload[5], payload[6], payload[7]]);
                    Sent::Code {
                        channel,
                        name: format!("{}{}", payload[3] as char, major),
                    }
                }
                HostRequest::MacroCompleted => Sent::MacroCompleted {
                    channel,
                    error: payload[1] != 0,
                },
                HostRequest::LockMovementAndWaitForStandstill => Sent::Lock(channel),
                HostRequest::Unlock => Sent::Unlock(channel),
                other => bail!("scheduler wrote {other:?}"),
            });
        }
        self.writer.reset();
        Ok(sent)
    }
}

impl RequestSink for FirmwareLink {
    fn write_code(&mut self, payload: &[u8]) -> bool {
        self.writer.write(HostRequest::Code as u16, payload).is_some()
    }

    fn write_macro_completed(&mut self, channel: CodeChannel, error: bool) -> bool {
        self.writer
            .write(
                HostRequest::MacroCompleted as u16,
                &encode_macro_completed(channel, error),
            )
            .is_some()
    }

    fn write_lock_movement(&mut self, channel: CodeChannel) -> bool {
        self.writer
            .write(
                HostRequest::LockMovementAndWaitForStandstill as u16,
                &encode_channel(channel),
            )
            .is_some()
    }

    fn write_unlock(&mut self, channel: CodeChannel) -> bool {
        self.writer
            .write(HostRequest::Unlock as u16, &encode_channel(channel))
            .is_some()
    }
}

/// Names of the codes in `sent`, in order.
pub fn code_names(sent: &[Sent]) -> Vec<String> {
    sent.iter()
        .filter_map(|s| match s {
            Sent::Code { name, .. } => Some(name.clone()),
            _ => None,
        })
        .collect()
}

// ── Store helpers ─────────────────────────────────────────────────────────────

pub fn store_at(base: &Path, settings: SchedulerSettings) -> Arc<ChannelStore> {
    Arc::new(ChannelStore::new(
        settings,
        Arc::new(FirmwareExecutor),
        FileResolver::new(base),
    ))
}

pub fn code(text: &str, channel: CodeChannel) -> Code {
    Code::parse(text, channel)
        .expect("test code parses")
        .expect("test line holds a code")
}

/// Flags of an ordinary, final code reply on `channel`.
pub fn reply_on(channel: CodeChannel) -> MessageTypeFlags {
    MessageTypeFlags::BINARY_CODE_REPLY | MessageTypeFlags::for_channel(channel)
}

/// Schedule until nothing moves, letting spawned macro code tasks finish.
pub async fn settle(store: &ChannelStore, link: &mut FirmwareLink) {
    let mut idle_rounds = 0;
    while idle_rounds < 8 {
        if store.process_all(link).await == 0 {
            idle_rounds += 1;
        } else {
            idle_rounds = 0;
        }
        tokio::task::yield_now().await;
    }
}

// ── Scratch directories ───────────────────────────────────────────────────────

static SCRATCH: AtomicUsize = AtomicUsize::new(0);

/// A virtual SD card for one test. Removed on drop.
pub struct ScratchCard {
    pub path: PathBuf,
}

impl ScratchCard {
    pub fn new() -> Self {
        let n = SCRATCH.fetch_add(1, Ordering::Relaxed);
        let path = std::env::temp_dir().join(format!("motionbus-it-{}-{n}", std::process::id()));
        std::fs::create_dir_all(path.join("sys")).expect("create scratch card");
        Self { path }
    }

    pub fn write_macro(&self, name: &str, body: &str) {
        std::fs::write(self.path.join("sys").join(name), body).expect("write macro");
    }
}

impl Drop for ScratchCard {
    fn drop(&mut self) {
        let _ = std::fs::remove_dir_all(&self.path);
    }
}
