//! Thin client subcommands: each one connects (auto-starting the daemon if
//! needed), issues a single request through the client library, and prints
//! the result.

use anyhow::{Context, Result};

use crate::client::Client;
use crate::config::TermcpConfig;
use crate::protocol::OutputMode;

async fn connect(config: &TermcpConfig) -> Result<Client> {
    Client::connect_or_spawn(config)
        .await
        .context("failed to reach or start the daemon")
}

pub async fn start_command(
    config: &TermcpConfig,
    command: &str,
    cols: Option<u16>,
    rows: Option<u16>,
    cwd: Option<String>,
) -> Result<()> {
    let client = connect(config).await?;
    let id = client.start(command, cols, rows, cwd).await?;
    println!("{}", id);
    Ok(())
}

pub async fn stop_command(config: &TermcpConfig, terminal: &str, force: bool) -> Result<()> {
    let client = connect(config).await?;
    client.stop(terminal, force).await?;
    Ok(())
}

pub async fn stdin_command(
    config: &TermcpConfig,
    terminal: &str,
    data: &str,
    is_key: bool,
) -> Result<()> {
    let client = connect(config).await?;
    client.stdin(terminal, data, is_key).await?;
    Ok(())
}

pub async fn stdout_command(
    config: &TermcpConfig,
    terminal: &str,
    stream: bool,
    lines: Option<usize>,
    bytes: Option<usize>,
) -> Result<()> {
    let client = connect(config).await?;
    let mode = if stream {
        OutputMode::Stream
    } else {
        OutputMode::Screen
    };
    let text = client.stdout(terminal, mode, lines, bytes).await?;
    println!("{}", text);
    Ok(())
}

pub async fn resize_command(
    config: &TermcpConfig,
    terminal: &str,
    cols: u16,
    rows: u16,
) -> Result<()> {
    let client = connect(config).await?;
    client.resize(terminal, cols, rows).await?;
    Ok(())
}

pub async fn list_command(config: &TermcpConfig, json: bool) -> Result<()> {
    let client = connect(config).await?;
    let terminals = client.list().await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&terminals)?);
    } else if terminals.is_empty() {
        println!("No terminals.");
    } else {
        println!("{:<10} {:<8} {:<9} {:<8} COMMAND", "ID", "STATUS", "SIZE", "PID");
        for entry in &terminals {
            let status = if entry.running { "running" } else { "exited" };
            let size = format!("{}x{}", entry.cols, entry.rows);
            let pid = entry
                .pid
                .map(|p| p.to_string())
                .unwrap_or_else(|| "-".to_string());
            println!(
                "{:<10} {:<8} {:<9} {:<8} {}",
                entry.id, status, size, pid, entry.command
            );
        }
    }

    Ok(())
}

pub async fn term_size_command(config: &TermcpConfig) -> Result<()> {
    let client = connect(config).await?;
    let size = client.term_size().await?;
    println!("{} {}", size.cols, size.rows);
    Ok(())
}

pub async fn kill_server_command(config: &TermcpConfig) -> Result<()> {
    // No auto-start here: killing a daemon that is not running is a no-op.
    let client = match Client::connect(&config.socket_path()).await {
        Ok(client) => client,
        Err(_) => {
            println!("No daemon running.");
            return Ok(());
        }
    };
    client.kill_server().await?;
    println!("Daemon stopped.");
    Ok(())
}
