//! Code execution and per-channel control commands.

use anyhow::Result;
use serde::{Deserialize, Serialize};

use super::http::{base_url, post_json, post_json_body};

#[derive(Serialize)]
struct CodeRequest<'a> {
    channel: &'a str,
    code: &'a str,
}

#[derive(Deserialize)]
struct CodeResponse {
    code: String,
    success: bool,
    messages: Vec<Message>,
}

#[derive(Deserialize)]
struct Message {
    #[serde(rename = "type")]
    kind: String,
    content: String,
}

#[derive(Deserialize)]
struct ChannelResponse {
    channel: String,
    success: bool,
}

#[derive(Deserialize)]
struct RequestedResponse {
    message: String,
}

// ── Commands ──────────────────────────────────────────────────────────────────

pub async fn cmd_code(port: u16, channel: &str, code: &str) -> Result<()> {
    let resp: CodeResponse = post_json_body(
        &format!("{}/code", base_url(port)),
        &CodeRequest { channel, code },
    )
    .await?;

    for message in &resp.messages {
        println!("{}", render_message(message));
    }
    if !resp.success {
        anyhow::bail!("{} reported an error", resp.code);
    }
    Ok(())
}

/// `action` is one of flush, lock, unlock.
pub async fn cmd_channel(port: u16, action: &str, channel: &str) -> Result<()> {
    let resp: ChannelResponse =
        post_json(&format!("{}/{}/{}", base_url(port), action, channel)).await?;
    if resp.success {
        println!("{} {}: ok", action, resp.channel);
        Ok(())
    } else {
        anyhow::bail!("{} {} failed", action, resp.channel)
    }
}

pub async fn cmd_emergency_stop(port: u16) -> Result<()> {
    let resp: RequestedResponse = post_json(&format!("{}/emergency-stop", base_url(port))).await?;
    println!("{}", resp.message);
    Ok(())
}

pub async fn cmd_reset(port: u16) -> Result<()> {
    let resp: RequestedResponse = post_json(&format!("{}/reset", base_url(port))).await?;
    println!("{}", resp.message);
    Ok(())
}

fn render_message(message: &Message) -> String {
    match message.kind.as_str() {
        "warning" => format!("Warning: {}", message.content),
        "error" => format!("Error: {}", message.content),
        _ => message.content.clone(),
    }
}
