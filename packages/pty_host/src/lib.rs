//! PTY host - pseudo-terminal lifecycle management
//!
//! This crate spawns shell commands inside real PTYs and exposes a small
//! async API over each one: write input, resize, signal, watch for exit,
//! and subscribe to the raw output byte stream. It has no protocol or
//! screen-emulation knowledge; higher layers own those concerns.
//!
//! # Example
//!
//! ```no_run
//! use pty_host::{PtyActor, PtyConfig};
//!
//! #[tokio::main]
//! async fn main() {
//!     let config = PtyConfig {
//!         command: "echo hello".to_string(),
//!         ..Default::default()
//!     };
//!
//!     let handle = PtyActor::spawn(config).unwrap();
//!
//!     let mut rx = handle.subscribe();
//!     while let Ok(chunk) = rx.recv().await {
//!         print!("{}", String::from_utf8_lossy(&chunk.data));
//!     }
//! }
//! ```

mod error;
pub mod pty;

pub use error::PtyError;
pub use pty::{PtyActor, PtyConfig, PtyHandle, PtyOutput, PtyState};
