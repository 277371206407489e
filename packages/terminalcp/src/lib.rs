//! terminalcp - drive interactive CLI programs in pseudo-terminals.
//!
//! A long-lived daemon owns a set of PTYs, emulates their screens, buffers
//! their raw output, and serves a line-delimited JSON request/event
//! protocol over a per-user Unix socket. The [`client`] module talks to it
//! (auto-starting one when needed); the `terminalcp` binary wraps both in
//! a small CLI.
//!
//! # Example
//!
//! ```no_run
//! use terminalcp::client::Client;
//! use terminalcp::config::TermcpConfig;
//! use terminalcp::protocol::OutputMode;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = TermcpConfig::new(None)?;
//!     let client = Client::connect_or_spawn(&config).await?;
//!
//!     let id = client.start("bash", Some(120), Some(40), None).await?;
//!     client.stdin(&id, "echo hello\r", false).await?;
//!     let screen = client.stdout(&id, OutputMode::Screen, None, None).await?;
//!     println!("{}", screen);
//!
//!     client.stop(&id, false).await?;
//!     Ok(())
//! }
//! ```

pub mod cli;
pub mod client;
pub mod config;
pub mod keys;
pub mod manager;
pub mod protocol;
pub mod screen;
pub mod server;
pub mod terminal;

#[cfg(test)]
mod e2e_tests;
