//! Managed Terminal
//!
//! One record per spawned process: the PTY handle, the raw-output ring and
//! screen emulator behind a single state lock, the input lock that orders
//! concurrent writes, the lifecycle record, and the per-terminal event
//! broadcast that the IPC server fans out to subscribers.

use nix::sys::signal::Signal;
use pty_host::{PtyActor, PtyConfig, PtyHandle};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock, broadcast};
use tracing::{debug, warn};

use crate::config::ServerConfig;
use crate::manager::{ManagerError, StartSpec};
use crate::protocol::TerminalEntry;
use crate::screen::{OutputRing, ScreenBuffer};

/// Lifecycle of a managed terminal. Exactly one state at a time.
///
/// Spawning is synchronous: a terminal enters the registry already
/// `Running`, and a spawn failure surfaces as an error before any record
/// exists, so there is no observable starting state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    Running,
    Exited,
    Reaped,
}

/// Metadata record for one terminal.
#[derive(Debug, Clone)]
pub struct TerminalInfo {
    pub id: String,
    pub command: String,
    pub cwd: Option<String>,
    /// Spawn sequence number; `list` reports terminals in this order.
    pub seq: u64,
    pub created_at: String,
    pub cols: u16,
    pub rows: u16,
    pub pid: Option<u32>,
    pub lifecycle: Lifecycle,
    pub exit_code: Option<i32>,
    pub exited_at: Option<String>,
}

/// Events broadcast to subscribers of one terminal.
#[derive(Debug, Clone)]
pub enum TerminalEvent {
    /// A chunk of output, in the exact order it was read from the PTY.
    Output(Vec<u8>),
    /// The child exited; emitted once, after the final output chunk.
    Exited { code: Option<i32> },
}

/// Raw ring and emulator, updated together under one lock so snapshot
/// readers never observe a half-applied chunk.
struct ScreenState {
    ring: OutputRing,
    screen: ScreenBuffer,
}

pub struct ManagedTerminal {
    info: RwLock<TerminalInfo>,
    pty: PtyHandle,
    state: Mutex<ScreenState>,
    input_lock: Mutex<()>,
    events: broadcast::Sender<TerminalEvent>,
    enter_delay: Duration,
}

impl ManagedTerminal {
    /// Spawn the command in a fresh PTY and wire up the forward task that
    /// drains it into the ring, the emulator, and the event broadcast.
    pub fn spawn(
        id: String,
        seq: u64,
        spec: StartSpec,
        config: &ServerConfig,
    ) -> Result<Arc<Self>, ManagerError> {
        let StartSpec {
            command,
            cols,
            rows,
            cwd,
            env,
        } = spec;
        let cols = cols.unwrap_or(80);
        let rows = rows.unwrap_or(24);

        let pty = PtyActor::spawn(PtyConfig {
            command: command.clone(),
            cwd: cwd.clone(),
            env,
            rows,
            cols,
        })
        .map_err(|e| ManagerError::Spawn(e.to_string()))?;

        let (events, _) = broadcast::channel(1024);

        let terminal = Arc::new(Self {
            info: RwLock::new(TerminalInfo {
                id: id.clone(),
                command,
                cwd,
                seq,
                created_at: chrono::Utc::now().to_rfc3339(),
                cols,
                rows,
                pid: pty.pid(),
                lifecycle: Lifecycle::Running,
                exit_code: None,
                exited_at: None,
            }),
            pty,
            state: Mutex::new(ScreenState {
                ring: OutputRing::new(config.max_buffer_bytes),
                screen: ScreenBuffer::new(rows, cols, config.scrollback_lines),
            }),
            input_lock: Mutex::new(()),
            events,
            enter_delay: config.enter_delay,
        });

        let forward = terminal.clone();
        tokio::spawn(async move {
            forward.run_forward().await;
        });

        Ok(terminal)
    }

    /// Drain the PTY output broadcast. Each chunk is appended to the ring
    /// and fed to the emulator under one lock acquisition, then re-broadcast
    /// as an output event, so event order equals read order and a snapshot
    /// taken after an observed event reflects that event's bytes.
    async fn run_forward(self: Arc<Self>) {
        let mut rx = self.pty.subscribe();
        loop {
            match rx.recv().await {
                Ok(chunk) => {
                    {
                        let mut state = self.state.lock().await;
                        state.ring.push(&chunk.data);
                        state.screen.feed(&chunk.data);
                    }
                    let _ = self.events.send(TerminalEvent::Output(chunk.data));
                }
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    warn!(
                        "terminal {} output reader lagged, {} chunks lost",
                        self.id().await,
                        missed
                    );
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }

        // Reader EOF. Give the waiter a moment to reap and report the code;
        // EOF alone is enough to call the terminal exited.
        let code = self.await_exit_code(Duration::from_secs(5)).await;

        {
            let mut info = self.info.write().await;
            if info.lifecycle == Lifecycle::Running {
                info.lifecycle = Lifecycle::Exited;
            }
            info.exit_code = code;
            info.exited_at = Some(chrono::Utc::now().to_rfc3339());
        }
        debug!("terminal {} exited with code {:?}", self.id().await, code);
        let _ = self.events.send(TerminalEvent::Exited { code });
    }

    async fn await_exit_code(&self, deadline: Duration) -> Option<i32> {
        let mut exit = self.pty.exit_watch();
        let waited = tokio::time::timeout(deadline, async {
            loop {
                if let Some(code) = *exit.borrow() {
                    return Some(code);
                }
                if exit.changed().await.is_err() {
                    return None;
                }
            }
        })
        .await;
        waited.unwrap_or(None)
    }

    pub async fn id(&self) -> String {
        self.info.read().await.id.clone()
    }

    pub async fn info(&self) -> TerminalInfo {
        self.info.read().await.clone()
    }

    pub async fn lifecycle(&self) -> Lifecycle {
        self.info.read().await.lifecycle
    }

    /// One row of the `list` result.
    pub async fn entry(&self) -> TerminalEntry {
        let info = self.info.read().await;
        TerminalEntry {
            id: info.id.clone(),
            command: info.command.clone(),
            running: info.lifecycle == Lifecycle::Running,
            cols: info.cols,
            rows: info.rows,
            pid: info.pid,
            exit_code: info.exit_code,
        }
    }

    /// Write bytes to the child's stdin. Writes are serialized by the input
    /// lock; a payload containing a carriage return keeps the lock through
    /// the enter delay, so queued writers inherit the input cadence that
    /// line-buffered programs need.
    pub async fn write_input(&self, bytes: &[u8]) -> Result<(), ManagerError> {
        if self.lifecycle().await != Lifecycle::Running {
            return Err(ManagerError::Exited(self.id().await));
        }

        let _guard = self.input_lock.lock().await;
        self.pty
            .write(bytes)
            .await
            .map_err(|e| ManagerError::Write(e.to_string()))?;
        if bytes.contains(&b'\r') {
            tokio::time::sleep(self.enter_delay).await;
        }
        Ok(())
    }

    /// The rendered screen as text.
    pub async fn screen_snapshot(&self) -> String {
        self.state.lock().await.screen.snapshot()
    }

    /// The raw stream, lossily decoded. `bytes` wins over `lines` when both
    /// are given; with neither, the whole buffer is returned.
    pub async fn stream_text(&self, lines: Option<usize>, bytes: Option<usize>) -> String {
        let state = self.state.lock().await;
        if let Some(n) = bytes {
            String::from_utf8_lossy(&state.ring.tail_bytes(n)).to_string()
        } else if let Some(n) = lines {
            state.ring.tail_lines(n)
        } else {
            state.ring.text()
        }
    }

    /// Resize PTY and emulator. TIOCSWINSZ on the master makes the kernel
    /// deliver SIGWINCH to the child's foreground process group.
    pub async fn resize(&self, cols: u16, rows: u16) -> Result<(), ManagerError> {
        if self.lifecycle().await != Lifecycle::Running {
            return Err(ManagerError::Exited(self.id().await));
        }
        self.pty
            .resize(rows, cols)
            .await
            .map_err(|e| ManagerError::Internal(e.to_string()))?;

        let mut state = self.state.lock().await;
        state.screen.resize(rows, cols);
        drop(state);

        let mut info = self.info.write().await;
        info.cols = cols;
        info.rows = rows;
        Ok(())
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TerminalEvent> {
        self.events.subscribe()
    }

    /// Terminate the child: SIGTERM (or SIGKILL when forced), a bounded
    /// grace period, then SIGKILL. Already-exited terminals are just
    /// reaped. Idempotent at this level; the manager enforces the
    /// one-stop-per-id rule by removing the record.
    pub async fn shutdown(&self, force: bool, grace: Duration) {
        if self.lifecycle().await == Lifecycle::Running {
            let first = if force {
                Signal::SIGKILL
            } else {
                Signal::SIGTERM
            };
            if let Err(e) = self.pty.signal(first).await {
                warn!("failed to signal terminal {}: {}", self.id().await, e);
            }

            if self.await_exit_code(grace).await.is_none() {
                debug!(
                    "terminal {} did not exit within grace, sending SIGKILL",
                    self.id().await
                );
                let _ = self.pty.signal(Signal::SIGKILL).await;
                let _ = self.await_exit_code(Duration::from_secs(2)).await;
            }
        }

        self.info.write().await.lifecycle = Lifecycle::Reaped;
    }
}
