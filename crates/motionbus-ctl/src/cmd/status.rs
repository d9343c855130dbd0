//! Link status, channel diagnostics, shutdown commands.

use anyhow::Result;
use serde::Deserialize;

use super::http::{base_url, get_json, post_json};

// ── Response types ────────────────────────────────────────────────────────────

#[derive(Deserialize)]
struct StatusResponse {
    connected: bool,
    protocol_version: u16,
    machine_status: String,
    busy_channels: Vec<String>,
    stats: TransferStats,
}

#[derive(Deserialize)]
#[allow(dead_code)]
struct TransferStats {
    full_transfers: u64,
    transfers_per_second: f64,
    max_rx_bytes: usize,
    max_tx_bytes: usize,
    max_full_transfer_ms: f64,
    header_checksum_errors: u64,
    data_checksum_errors: u64,
    resends: u64,
    timeouts: u64,
    resets: u64,
}

#[derive(Deserialize)]
struct DiagnosticsResponse {
    channels: Vec<String>,
}

// ── Commands ──────────────────────────────────────────────────────────────────

pub async fn cmd_status(port: u16) -> Result<()> {
    let resp: StatusResponse = get_json(&format!("{}/status", base_url(port))).await?;

    println!("═══════════════════════════════════════");
    println!("  Motionbus Link Status");
    println!("═══════════════════════════════════════");
    println!("  Connected        : {}", resp.connected);
    println!("  Protocol version : {}", resp.protocol_version);
    println!("  Machine status   : {}", resp.machine_status);
    println!("  Busy channels    : {}", busy_list(&resp.busy_channels));
    println!();
    println!("  Full transfers   : {}", resp.stats.full_transfers);
    println!("  Transfers/s      : {:.1}", resp.stats.transfers_per_second);
    println!("  Slowest transfer : {:.1} ms", resp.stats.max_full_transfer_ms);
    println!("  Max rx / tx      : {} / {} bytes", resp.stats.max_rx_bytes, resp.stats.max_tx_bytes);
    println!(
        "  Checksum errors  : {} header, {} data",
        resp.stats.header_checksum_errors, resp.stats.data_checksum_errors
    );
    println!("  Resends          : {}", resp.stats.resends);
    println!("  Timeouts         : {}", resp.stats.timeouts);
    println!("  Resets           : {}", resp.stats.resets);

    Ok(())
}

pub async fn cmd_diagnostics(port: u16) -> Result<()> {
    let resp: DiagnosticsResponse = get_json(&format!("{}/diagnostics", base_url(port))).await?;

    if resp.channels.is_empty() {
        println!("All channels idle.");
        return Ok(());
    }
    for line in &resp.channels {
        println!("  {}", line);
    }
    Ok(())
}

pub async fn cmd_shutdown(port: u16) -> Result<()> {
    #[derive(Deserialize)]
    struct ShutdownResponse {
        message: String,
    }

    let resp: ShutdownResponse = post_json(&format!("{}/daemon/shutdown", base_url(port))).await?;
    println!("{}", resp.message);
    Ok(())
}

fn busy_list(channels: &[String]) -> String {
    if channels.is_empty() {
        "none".to_string()
    } else {
        channels.join(", ")
    }
}
