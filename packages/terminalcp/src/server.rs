//! IPC Server
//!
//! Listens on the per-user Unix socket, speaks line-delimited JSON, routes
//! requests to the Terminal Manager and fans terminal output out to
//! subscribed connections. Handles single-instance semantics (bind, probe,
//! unlink stale sockets) and graceful shutdown.

use anyhow::{Context, Result};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::manager::{ManagerError, StartSpec, TerminalManager};
use crate::protocol::{
    Action, ErrorCode, EventKind, KNOWN_ACTIONS, Request, ServerMessage, TermSize,
};
use crate::terminal::TerminalEvent;

/// Result of trying to claim the socket.
pub enum BindOutcome {
    /// We own the socket and should serve on it.
    Bound(UnixListener),
    /// Another live daemon answered the probe; do not serve.
    AlreadyRunning,
}

/// Bind the Unix socket with single-instance semantics: on `AddrInUse`,
/// probe the socket with a benign `list` request. A live daemon means we
/// yield; a dead one means the socket file is stale and gets unlinked.
/// File presence alone is never trusted.
pub async fn bind_socket(path: &Path) -> Result<BindOutcome> {
    for attempt in 0..3 {
        match UnixListener::bind(path) {
            Ok(listener) => {
                #[cfg(unix)]
                {
                    use std::os::unix::fs::PermissionsExt;
                    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
                        .with_context(|| format!("failed to chmod socket {:?}", path))?;
                }
                return Ok(BindOutcome::Bound(listener));
            }
            Err(e) if e.kind() == std::io::ErrorKind::AddrInUse => {
                if probe_live(path).await {
                    return Ok(BindOutcome::AlreadyRunning);
                }
                debug!("removing stale socket {:?} (attempt {})", path, attempt);
                let _ = std::fs::remove_file(path);
            }
            Err(e) => {
                return Err(e).with_context(|| format!("failed to bind {:?}", path));
            }
        }
    }
    anyhow::bail!("failed to bind {:?} after stale-socket cleanup", path)
}

/// Connect and issue a no-op `list`; any response line means a live daemon.
async fn probe_live(path: &Path) -> bool {
    let stream = match tokio::time::timeout(Duration::from_secs(1), UnixStream::connect(path)).await
    {
        Ok(Ok(stream)) => stream,
        _ => return false,
    };

    let (read_half, mut write_half) = stream.into_split();
    let probe = match serde_json::to_string(&Request {
        id: "probe".to_string(),
        action: Action::List,
    }) {
        Ok(p) => p,
        Err(_) => return false,
    };
    if write_half
        .write_all(format!("{}\n", probe).as_bytes())
        .await
        .is_err()
    {
        return false;
    }

    let mut line = String::new();
    let mut reader = BufReader::new(read_half);
    matches!(
        tokio::time::timeout(Duration::from_secs(2), reader.read_line(&mut line)).await,
        Ok(Ok(n)) if n > 0
    )
}

/// Dimensions of the daemon's own controlling terminal, with the classic
/// fallback when it is detached from any TTY.
pub fn own_term_size() -> TermSize {
    #[cfg(unix)]
    {
        use nix::libc;
        let mut ws = libc::winsize {
            ws_row: 0,
            ws_col: 0,
            ws_xpixel: 0,
            ws_ypixel: 0,
        };
        let ret = unsafe { libc::ioctl(libc::STDOUT_FILENO, libc::TIOCGWINSZ, &mut ws) };
        if ret == 0 && ws.ws_col > 0 && ws.ws_row > 0 {
            return TermSize {
                cols: ws.ws_col,
                rows: ws.ws_row,
            };
        }
    }
    TermSize { cols: 80, rows: 24 }
}

pub struct IpcServer {
    manager: Arc<TerminalManager>,
    write_queue_frames: usize,
}

impl IpcServer {
    pub fn new(manager: Arc<TerminalManager>, write_queue_frames: usize) -> Self {
        Self {
            manager,
            write_queue_frames,
        }
    }

    /// Accept connections until `shutdown` fires, then stop all terminals
    /// and unlink the socket. Returns only after cleanup.
    pub async fn serve(
        self: Arc<Self>,
        listener: UnixListener,
        socket_path: PathBuf,
        shutdown: CancellationToken,
    ) -> Result<()> {
        info!("listening on {:?}", socket_path);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, _addr)) => {
                        let server = self.clone();
                        let shutdown = shutdown.clone();
                        tokio::spawn(async move {
                            server.handle_connection(stream, shutdown).await;
                        });
                    }
                    Err(e) => {
                        warn!("accept failed: {}", e);
                    }
                }
            }
        }

        info!("shutting down: stopping all terminals");
        self.manager.stop_all().await;
        drop(listener);
        let _ = std::fs::remove_file(&socket_path);
        info!("shutdown complete");
        Ok(())
    }

    /// One connection: a reader loop dispatching requests and a writer task
    /// draining the frame queue. Responses are awaited onto the queue;
    /// subscription events use `try_send` so a slow consumer is dropped
    /// instead of stalling the terminal's other subscribers.
    async fn handle_connection(&self, stream: UnixStream, shutdown: CancellationToken) {
        let (read_half, mut write_half) = stream.into_split();
        let (frame_tx, mut frame_rx) = mpsc::channel::<String>(self.write_queue_frames);
        let conn_token = shutdown.child_token();

        let writer = tokio::spawn(async move {
            while let Some(frame) = frame_rx.recv().await {
                if write_half.write_all(frame.as_bytes()).await.is_err() {
                    break;
                }
                if write_half.write_all(b"\n").await.is_err() {
                    break;
                }
            }
            let _ = write_half.shutdown().await;
        });

        let mut subscriptions: HashMap<String, JoinHandle<()>> = HashMap::new();
        let mut lines = BufReader::new(read_half).lines();

        loop {
            tokio::select! {
                _ = conn_token.cancelled() => break,
                line = lines.next_line() => match line {
                    Ok(Some(line)) => {
                        if line.trim().is_empty() {
                            continue;
                        }
                        let flow = self
                            .handle_line(&line, &frame_tx, &mut subscriptions, &conn_token, &shutdown)
                            .await;
                        if matches!(flow, Flow::Close) {
                            break;
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        debug!("connection read error: {}", e);
                        break;
                    }
                }
            }
        }

        for (_, task) in subscriptions.drain() {
            task.abort();
        }
        drop(frame_tx);
        // Let the writer drain whatever is already queued (final responses).
        let _ = writer.await;
    }

    async fn handle_line(
        &self,
        line: &str,
        frame_tx: &mpsc::Sender<String>,
        subscriptions: &mut HashMap<String, JoinHandle<()>>,
        conn_token: &CancellationToken,
        shutdown: &CancellationToken,
    ) -> Flow {
        // Malformed JSON: there is no id to answer to; drop the connection.
        let value: serde_json::Value = match serde_json::from_str(line) {
            Ok(v) => v,
            Err(e) => {
                debug!("malformed request frame ({}), closing connection", e);
                return Flow::Close;
            }
        };
        let Some(id) = value.get("id").and_then(|v| v.as_str()).map(String::from) else {
            debug!("request frame without id, closing connection");
            return Flow::Close;
        };

        let reply = match self
            .dispatch(&id, value, frame_tx, subscriptions, conn_token, shutdown)
            .await
        {
            Ok(result) => ServerMessage::ok(&id, result),
            Err(e) => {
                let code = e.code();
                ServerMessage::err(&id, code, e.to_string())
            }
        };

        if frame_tx.send(encode(&reply)).await.is_err() {
            return Flow::Close;
        }
        Flow::Continue
    }

    async fn dispatch(
        &self,
        id: &str,
        value: serde_json::Value,
        frame_tx: &mpsc::Sender<String>,
        subscriptions: &mut HashMap<String, JoinHandle<()>>,
        conn_token: &CancellationToken,
        shutdown: &CancellationToken,
    ) -> Result<serde_json::Value, DispatchError> {
        let action_name = value
            .get("action")
            .and_then(|v| v.as_str())
            .ok_or_else(|| DispatchError::bad_request("missing action field"))?
            .to_string();
        if !KNOWN_ACTIONS.contains(&action_name.as_str()) {
            return Err(DispatchError::unknown_action(&action_name));
        }

        let request: Request = serde_json::from_value(value)
            .map_err(|e| DispatchError::bad_request(format!("malformed arguments: {}", e)))?;

        debug!(request_id = %id, action = %action_name, "dispatching");

        match request.action {
            Action::Start {
                command,
                cols,
                rows,
                cwd,
                env,
            } => {
                let terminal_id = self
                    .manager
                    .start(StartSpec {
                        command,
                        cols,
                        rows,
                        cwd,
                        env: env.map(|m| m.into_iter().collect()).unwrap_or_default(),
                    })
                    .await?;
                Ok(serde_json::Value::String(terminal_id))
            }

            Action::Stop { terminal, force } => {
                self.manager.stop(&terminal, force).await?;
                Ok(serde_json::Value::Null)
            }

            Action::Stdin {
                terminal,
                data,
                is_key,
            } => {
                self.manager.stdin(&terminal, &data, is_key).await?;
                Ok(serde_json::Value::Null)
            }

            Action::Stdout {
                terminal,
                mode,
                lines,
                bytes,
            } => {
                let text = self.manager.stdout(&terminal, mode, lines, bytes).await?;
                Ok(serde_json::Value::String(text))
            }

            Action::Resize {
                terminal,
                cols,
                rows,
            } => {
                self.manager.resize(&terminal, cols, rows).await?;
                Ok(serde_json::Value::Null)
            }

            Action::Subscribe { terminal } => {
                let rx = self.manager.subscribe(&terminal).await?;
                if let Some(old) = subscriptions.remove(&terminal) {
                    old.abort();
                }
                let task = spawn_event_forwarder(
                    terminal.clone(),
                    rx,
                    frame_tx.clone(),
                    conn_token.clone(),
                );
                subscriptions.insert(terminal, task);
                Ok(serde_json::Value::Null)
            }

            Action::Unsubscribe { terminal } => {
                if let Some(task) = subscriptions.remove(&terminal) {
                    task.abort();
                }
                Ok(serde_json::Value::Null)
            }

            Action::List => {
                let entries = self.manager.list().await;
                serde_json::to_value(entries)
                    .map_err(|e| DispatchError::internal(e.to_string()))
            }

            Action::TermSize => serde_json::to_value(own_term_size())
                .map_err(|e| DispatchError::internal(e.to_string())),

            Action::KillServer => {
                info!("kill-server received, initiating shutdown");
                shutdown.cancel();
                Ok(serde_json::Value::Null)
            }
        }
    }
}

/// Forward a terminal's event broadcast into one connection's frame queue.
/// A full queue or a lagged broadcast both mean the subscriber cannot keep
/// up; the connection is cancelled so other terminals and clients are
/// unaffected.
fn spawn_event_forwarder(
    terminal: String,
    mut rx: broadcast::Receiver<TerminalEvent>,
    frame_tx: mpsc::Sender<String>,
    conn_token: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let message = match rx.recv().await {
                Ok(TerminalEvent::Output(data)) => ServerMessage::event(
                    &terminal,
                    EventKind::Output,
                    String::from_utf8_lossy(&data),
                ),
                Ok(TerminalEvent::Exited { code }) => ServerMessage::event(
                    &terminal,
                    EventKind::Exit,
                    code.map(|c| c.to_string()).unwrap_or_default(),
                ),
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    warn!(
                        "subscriber lagged {} events on {}, dropping connection",
                        missed, terminal
                    );
                    conn_token.cancel();
                    break;
                }
                Err(broadcast::error::RecvError::Closed) => break,
            };

            match frame_tx.try_send(encode(&message)) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!(
                        "subscriber write queue full on {}, dropping connection",
                        terminal
                    );
                    conn_token.cancel();
                    break;
                }
                Err(mpsc::error::TrySendError::Closed(_)) => break,
            }
        }
    })
}

fn encode(message: &ServerMessage) -> String {
    serde_json::to_string(message).expect("wire types always serialize")
}

enum Flow {
    Continue,
    Close,
}

/// Dispatch failures: either a manager error or a protocol-level one.
#[derive(Debug)]
enum DispatchError {
    Manager(ManagerError),
    Protocol { code: ErrorCode, message: String },
}

impl DispatchError {
    fn bad_request(message: impl Into<String>) -> Self {
        DispatchError::Protocol {
            code: ErrorCode::BadRequest,
            message: message.into(),
        }
    }

    fn unknown_action(action: &str) -> Self {
        DispatchError::Protocol {
            code: ErrorCode::UnknownAction,
            message: format!("unknown action: {:?}", action),
        }
    }

    fn internal(message: impl Into<String>) -> Self {
        DispatchError::Protocol {
            code: ErrorCode::InternalError,
            message: message.into(),
        }
    }

    fn code(&self) -> ErrorCode {
        match self {
            DispatchError::Manager(e) => e.code(),
            DispatchError::Protocol { code, .. } => *code,
        }
    }
}

impl From<ManagerError> for DispatchError {
    fn from(e: ManagerError) -> Self {
        DispatchError::Manager(e)
    }
}

impl std::fmt::Display for DispatchError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DispatchError::Manager(e) => write!(f, "{}", e),
            DispatchError::Protocol { message, .. } => write!(f, "{}", message),
        }
    }
}
