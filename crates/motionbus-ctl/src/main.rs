//! motionbus-ctl — command-line interface for the Motionbus daemon.

mod cmd;

use anyhow::{Context, Result};

const DEFAULT_PORT: u16 = 9101;

fn print_usage() {
    println!("Usage: motionbus-ctl [--port <port>] <command>");
    println!();
    println!("Commands:");
    println!("  status                 Show link status and transfer statistics");
    println!("  diagnostics            Show what every channel is doing");
    println!("  code <channel> <code>  Run a code and print its reply");
    println!("  flush <channel>        Wait until a channel has no pending codes");
    println!("  lock <channel>         Lock movement and wait for standstill");
    println!("  unlock <channel>       Release the movement lock");
    println!("  estop                  Emergency stop");
    println!("  reset                  Reset the firmware");
    println!("  shutdown               Stop the daemon");
    println!();
    println!("Options:");
    println!("  --port <port>   API port (default: {})", DEFAULT_PORT);
}

// ── Entry point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<()> {
    let args: Vec<String> = std::env::args().skip(1).collect();

    // Parse --port option
    let mut port = DEFAULT_PORT;
    let mut remaining: Vec<&str> = Vec::new();
    let mut i = 0;
    while i < args.len() {
        if args[i] == "--port" {
            i += 1;
            port = args
                .get(i)
                .context("--port requires a value")?
                .parse()
                .context("--port must be a number")?;
        } else {
            remaining.push(&args[i]);
        }
        i += 1;
    }

    match remaining.as_slice() {
        ["status"] | [] => cmd::status::cmd_status(port).await,
        ["diagnostics"] => cmd::status::cmd_diagnostics(port).await,
        ["shutdown"] => cmd::status::cmd_shutdown(port).await,
        ["code", channel, code @ ..] if !code.is_empty() => {
            cmd::codes::cmd_code(port, channel, &code.join(" ")).await
        }
        [action @ ("flush" | "lock" | "unlock"), channel] => {
            cmd::codes::cmd_channel(port, action, channel).await
        }
        ["estop"] => cmd::codes::cmd_emergency_stop(port).await,
        ["reset"] => cmd::codes::cmd_reset(port).await,
        ["help"] | ["--help"] | ["-h"] => {
            print_usage();
            Ok(())
        }
        other => {
            eprintln!("Unknown command: {}", other.join(" "));
            eprintln!();
            print_usage();
            std::process::exit(1);
        }
    }
}
