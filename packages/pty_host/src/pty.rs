use anyhow::Context;
use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;
use portable_pty::{Child, CommandBuilder, MasterPty, PtySize, native_pty_system};
use std::io::{Read, Write};
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tracing::{debug, info, warn};

use crate::error::PtyError;

/// Configuration for spawning a command in a PTY.
///
/// `command` is a full shell command line; it is handed to a POSIX shell
/// (`$SHELL`, falling back to `/bin/sh`) with `-c`, so pipes, quoting and
/// `&&` chains all work.
#[derive(Clone, Debug)]
pub struct PtyConfig {
    pub command: String,
    pub cwd: Option<String>,
    pub env: Vec<(String, String)>,
    pub rows: u16,
    pub cols: u16,
}

impl Default for PtyConfig {
    fn default() -> Self {
        Self {
            command: "/bin/sh".to_string(),
            cwd: None,
            env: Vec::new(),
            rows: 24,
            cols: 80,
        }
    }
}

/// Point-in-time view of a PTY session.
#[derive(Clone, Debug)]
pub struct PtyState {
    pub pid: Option<u32>,
    pub rows: u16,
    pub cols: u16,
}

/// One chunk of output read from the PTY master.
#[derive(Clone, Debug)]
pub struct PtyOutput {
    pub data: Vec<u8>,
}

/// Messages that can be sent to the PTY actor
enum PtyMessage {
    Write {
        data: Vec<u8>,
        respond_to: oneshot::Sender<Result<(), PtyError>>,
    },
    Resize {
        rows: u16,
        cols: u16,
        respond_to: oneshot::Sender<Result<(), PtyError>>,
    },
    GetState {
        respond_to: oneshot::Sender<PtyState>,
    },
    Signal {
        signal: Signal,
        respond_to: oneshot::Sender<Result<(), PtyError>>,
    },
}

/// Handle to communicate with a PTY actor.
///
/// All writes and resizes funnel through the actor's message loop, so two
/// handles to the same PTY never interleave partial writes.
#[derive(Clone)]
pub struct PtyHandle {
    sender: mpsc::Sender<PtyMessage>,
    output_tx: broadcast::Sender<PtyOutput>,
    exit_rx: watch::Receiver<Option<i32>>,
    pid: Option<u32>,
}

impl PtyHandle {
    /// Write bytes to the PTY master.
    pub async fn write(&self, data: &[u8]) -> Result<(), PtyError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(PtyMessage::Write {
                data: data.to_vec(),
                respond_to: tx,
            })
            .await
            .map_err(|_| PtyError::ChannelClosed("write".into()))?;
        rx.await.map_err(|_| PtyError::ChannelClosed("write".into()))?
    }

    /// Resize the PTY. The kernel delivers SIGWINCH to the child's
    /// foreground process group as part of TIOCSWINSZ.
    pub async fn resize(&self, rows: u16, cols: u16) -> Result<(), PtyError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(PtyMessage::Resize {
                rows,
                cols,
                respond_to: tx,
            })
            .await
            .map_err(|_| PtyError::ChannelClosed("resize".into()))?;
        rx.await
            .map_err(|_| PtyError::ChannelClosed("resize".into()))?
    }

    /// Get the current state of the PTY.
    pub async fn state(&self) -> Result<PtyState, PtyError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(PtyMessage::GetState { respond_to: tx })
            .await
            .map_err(|_| PtyError::ChannelClosed("state".into()))?;
        rx.await.map_err(|_| PtyError::ChannelClosed("state".into()))
    }

    /// Deliver a signal to the child process.
    pub async fn signal(&self, signal: Signal) -> Result<(), PtyError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(PtyMessage::Signal {
                signal,
                respond_to: tx,
            })
            .await
            .map_err(|_| PtyError::ChannelClosed("signal".into()))?;
        rx.await
            .map_err(|_| PtyError::ChannelClosed("signal".into()))?
    }

    /// Subscribe to the raw output byte stream.
    pub fn subscribe(&self) -> broadcast::Receiver<PtyOutput> {
        self.output_tx.subscribe()
    }

    /// Watch channel that flips from `None` to `Some(exit_code)` when the
    /// child has been reaped.
    pub fn exit_watch(&self) -> watch::Receiver<Option<i32>> {
        self.exit_rx.clone()
    }

    /// Child process id, as observed at spawn time.
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }
}

/// The PTY actor that owns one master fd and serializes access to it.
pub struct PtyActor {
    master: Box<dyn MasterPty + Send>,
    writer: Box<dyn Write + Send>,
    state: PtyState,
    receiver: mpsc::Receiver<PtyMessage>,
}

impl PtyActor {
    /// Allocate a PTY, spawn `config.command` under a shell, and return a
    /// handle to the running session.
    pub fn spawn(config: PtyConfig) -> Result<PtyHandle, PtyError> {
        let pty_system = native_pty_system();

        let pair = pty_system
            .openpty(PtySize {
                rows: config.rows,
                cols: config.cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .context("failed to open PTY")
            .map_err(PtyError::from)?;

        let shell = std::env::var("SHELL").unwrap_or_else(|_| "/bin/sh".to_string());
        let mut cmd = CommandBuilder::new(&shell);
        cmd.arg("-c");
        cmd.arg(&config.command);

        if let Some(dir) = &config.cwd {
            cmd.cwd(dir);
        }

        // Interactive programs size themselves from the PTY; stale values
        // inherited from the daemon's own terminal would override that.
        cmd.env_remove("COLUMNS");
        cmd.env_remove("LINES");
        cmd.env("TERM", "xterm-256color");

        for (key, value) in &config.env {
            cmd.env(key, value);
        }

        debug!("spawning PTY command: {:?} via {}", config.command, shell);

        let mut child: Box<dyn Child + Send + Sync> =
            pair.slave.spawn_command(cmd).map_err(|e| {
                warn!("failed to spawn command {:?}: {}", config.command, e);
                PtyError::SpawnFailed(e.to_string())
            })?;

        let pid = child.process_id();
        info!("PTY child started with pid {:?}", pid);

        let writer = pair
            .master
            .take_writer()
            .context("failed to take PTY writer")
            .map_err(PtyError::from)?;

        let mut reader = pair
            .master
            .try_clone_reader()
            .context("failed to clone PTY reader")
            .map_err(PtyError::from)?;

        let (output_tx, _) = broadcast::channel(1024);
        let (msg_tx, msg_rx) = mpsc::channel(32);
        let (exit_tx, exit_rx) = watch::channel(None);

        // Blocking reader: drain the master until EOF, broadcasting chunks.
        let output_tx_reader = output_tx.clone();
        std::thread::spawn(move || {
            let mut buffer = vec![0u8; 4096];
            loop {
                match reader.read(&mut buffer) {
                    Ok(0) => {
                        debug!("PTY reader saw EOF");
                        break;
                    }
                    Ok(n) => {
                        let _ = output_tx_reader.send(PtyOutput {
                            data: buffer[..n].to_vec(),
                        });
                    }
                    Err(e) => {
                        // EIO is the normal master-side error once the
                        // child side closes; anything else is noteworthy.
                        if e.raw_os_error() != Some(nix::libc::EIO) {
                            warn!("error reading PTY output: {}", e);
                        }
                        break;
                    }
                }
            }
        });

        // Blocking waiter: reap the child and publish its exit code.
        std::thread::spawn(move || {
            let code = match child.wait() {
                Ok(status) => status.exit_code() as i32,
                Err(e) => {
                    warn!("failed to wait for PTY child: {}", e);
                    -1
                }
            };
            debug!("PTY child exited with code {}", code);
            let _ = exit_tx.send(Some(code));
        });

        let actor = Self {
            master: pair.master,
            writer,
            state: PtyState {
                pid,
                rows: config.rows,
                cols: config.cols,
            },
            receiver: msg_rx,
        };

        tokio::spawn(async move {
            actor.run().await;
        });

        Ok(PtyHandle {
            sender: msg_tx,
            output_tx,
            exit_rx,
            pid,
        })
    }

    async fn run(mut self) {
        while let Some(msg) = self.receiver.recv().await {
            match msg {
                PtyMessage::Write { data, respond_to } => {
                    let _ = respond_to.send(self.handle_write(&data));
                }
                PtyMessage::Resize {
                    rows,
                    cols,
                    respond_to,
                } => {
                    let _ = respond_to.send(self.handle_resize(rows, cols));
                }
                PtyMessage::GetState { respond_to } => {
                    let _ = respond_to.send(self.state.clone());
                }
                PtyMessage::Signal { signal, respond_to } => {
                    let _ = respond_to.send(self.handle_signal(signal));
                }
            }
        }
        debug!("PTY actor for pid {:?} shutting down", self.state.pid);
    }

    fn handle_write(&mut self, data: &[u8]) -> Result<(), PtyError> {
        self.writer
            .write_all(data)
            .map_err(|e| PtyError::WriteFailed(e.to_string()))?;
        self.writer
            .flush()
            .map_err(|e| PtyError::WriteFailed(e.to_string()))
    }

    fn handle_resize(&mut self, rows: u16, cols: u16) -> Result<(), PtyError> {
        self.master
            .resize(PtySize {
                rows,
                cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| PtyError::ResizeFailed(e.to_string()))?;
        self.state.rows = rows;
        self.state.cols = cols;
        Ok(())
    }

    fn handle_signal(&mut self, signal: Signal) -> Result<(), PtyError> {
        let Some(pid) = self.state.pid else {
            return Ok(());
        };
        match kill(Pid::from_raw(pid as i32), signal) {
            Ok(()) => Ok(()),
            // Already gone; signalling a dead child is not an error.
            Err(nix::errno::Errno::ESRCH) => Ok(()),
            Err(e) => Err(PtyError::SignalFailed(e.to_string())),
        }
    }
}
