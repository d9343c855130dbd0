//! Link status snapshot shared between the daemon, the HTTP API and the CLI.

use serde::{Deserialize, Serialize};

use crate::code::CodeChannel;

/// Counters describing the bus link since the daemon started.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TransferStats {
    pub full_transfers: u64,
    pub transfers_per_second: f64,
    pub max_rx_bytes: usize,
    pub max_tx_bytes: usize,
    /// Longest time between two completed full transfers.
    pub max_full_transfer_ms: f64,
    pub header_checksum_errors: u64,
    pub data_checksum_errors: u64,
    pub resends: u64,
    pub timeouts: u64,
    pub resets: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LinkStatus {
    pub connected: bool,
    /// Protocol version negotiated with the firmware.
    pub protocol_version: u16,
    pub machine_status: String,
    pub busy_channels: Vec<CodeChannel>,
    pub stats: TransferStats,
}

impl LinkStatus {
    pub fn busy_channels_from_bits(bits: u32) -> Vec<CodeChannel> {
        CodeChannel::ALL
            .into_iter()
            .filter(|c| bits & (1 << *c as u32) != 0)
            .collect()
    }
}
