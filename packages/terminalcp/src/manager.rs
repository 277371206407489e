//! Terminal Manager
//!
//! The registry and lifecycle engine: spawns, tracks, resizes, signals and
//! reaps terminals, and serves read/write operations against them. Failures
//! on one terminal never affect another; only `stop_all` (shutdown) touches
//! more than one.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;
use tokio::sync::{RwLock, broadcast};
use tracing::{debug, info};

use crate::config::ServerConfig;
use crate::keys;
use crate::protocol::{ErrorCode, OutputMode, TerminalEntry};
use crate::terminal::{ManagedTerminal, TerminalEvent};

/// Operational failures, mapped one-to-one onto wire error codes.
#[derive(Debug, Error)]
pub enum ManagerError {
    #[error("unknown terminal: {0}")]
    UnknownTerminal(String),

    #[error("terminal {0} is no longer running")]
    Exited(String),

    #[error("invalid key token: {0:?}")]
    InvalidKey(String),

    #[error("failed to spawn command: {0}")]
    Spawn(String),

    #[error("failed to write to terminal: {0}")]
    Write(String),

    #[error("failed to read from terminal: {0}")]
    Read(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl ManagerError {
    pub fn code(&self) -> ErrorCode {
        match self {
            ManagerError::UnknownTerminal(_) => ErrorCode::UnknownTerminal,
            ManagerError::Exited(_) => ErrorCode::Exited,
            ManagerError::InvalidKey(_) => ErrorCode::InvalidKey,
            ManagerError::Spawn(_) => ErrorCode::SpawnError,
            ManagerError::Write(_) => ErrorCode::WriteError,
            ManagerError::Read(_) => ErrorCode::ReadError,
            ManagerError::Internal(_) => ErrorCode::InternalError,
        }
    }
}

/// Arguments for spawning a new terminal.
#[derive(Debug, Clone, Default)]
pub struct StartSpec {
    pub command: String,
    pub cols: Option<u16>,
    pub rows: Option<u16>,
    pub cwd: Option<String>,
    pub env: Vec<(String, String)>,
}

pub struct TerminalManager {
    terminals: RwLock<HashMap<String, Arc<ManagedTerminal>>>,
    next_seq: AtomicU64,
    config: ServerConfig,
}

impl TerminalManager {
    pub fn new(config: ServerConfig) -> Self {
        Self {
            terminals: RwLock::new(HashMap::new()),
            next_seq: AtomicU64::new(1),
            config,
        }
    }

    /// Spawn a command in a new terminal and return its id. Ids are unique
    /// for the daemon's lifetime.
    pub async fn start(&self, spec: StartSpec) -> Result<String, ManagerError> {
        let seq = self.next_seq.fetch_add(1, Ordering::SeqCst);
        let id = format!("term-{}", seq);

        info!("starting terminal {} with command {:?}", id, spec.command);

        let terminal = ManagedTerminal::spawn(id.clone(), seq, spec, &self.config)?;

        self.terminals.write().await.insert(id.clone(), terminal);
        Ok(id)
    }

    async fn get(&self, id: &str) -> Result<Arc<ManagedTerminal>, ManagerError> {
        self.terminals
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| ManagerError::UnknownTerminal(id.to_string()))
    }

    /// Write input. `is_key` routes the data through the key notation
    /// translator first.
    pub async fn stdin(&self, id: &str, data: &str, is_key: bool) -> Result<(), ManagerError> {
        let bytes = if is_key {
            keys::translate(data).map_err(|e| ManagerError::InvalidKey(e.0))?
        } else {
            data.as_bytes().to_vec()
        };
        self.get(id).await?.write_input(&bytes).await
    }

    /// Read output: the rendered screen, or a view of the raw stream.
    /// Works on exited terminals until they are reaped.
    pub async fn stdout(
        &self,
        id: &str,
        mode: OutputMode,
        lines: Option<usize>,
        bytes: Option<usize>,
    ) -> Result<String, ManagerError> {
        let terminal = self.get(id).await?;
        Ok(match mode {
            OutputMode::Screen => terminal.screen_snapshot().await,
            OutputMode::Stream => terminal.stream_text(lines, bytes).await,
        })
    }

    pub async fn resize(&self, id: &str, cols: u16, rows: u16) -> Result<(), ManagerError> {
        self.get(id).await?.resize(cols, rows).await
    }

    pub async fn subscribe(
        &self,
        id: &str,
    ) -> Result<broadcast::Receiver<TerminalEvent>, ManagerError> {
        Ok(self.get(id).await?.subscribe())
    }

    /// All known terminals in creation order.
    pub async fn list(&self) -> Vec<TerminalEntry> {
        let terminals = self.terminals.read().await;
        let mut with_seq = Vec::with_capacity(terminals.len());
        for terminal in terminals.values() {
            let info = terminal.info().await;
            with_seq.push((info.seq, terminal.entry().await));
        }
        with_seq.sort_by_key(|(seq, _)| *seq);
        with_seq.into_iter().map(|(_, entry)| entry).collect()
    }

    /// Terminate and remove a terminal. The record disappears immediately,
    /// so a second `stop` for the same id fails with `UnknownTerminal`.
    pub async fn stop(&self, id: &str, force: bool) -> Result<(), ManagerError> {
        let terminal = self
            .terminals
            .write()
            .await
            .remove(id)
            .ok_or_else(|| ManagerError::UnknownTerminal(id.to_string()))?;

        debug!("stopping terminal {} (force: {})", id, force);
        terminal.shutdown(force, self.config.stop_grace).await;
        Ok(())
    }

    /// Stop every terminal; used by daemon shutdown.
    pub async fn stop_all(&self) {
        let ids: Vec<String> = self.terminals.read().await.keys().cloned().collect();
        for id in ids {
            if let Err(e) = self.stop(&id, false).await {
                debug!("stop during shutdown: {}", e);
            }
        }
    }
}
