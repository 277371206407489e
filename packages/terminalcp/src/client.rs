//! IPC Client Library
//!
//! Connects to the daemon socket, auto-starting a daemon when none is
//! listening. Requests get monotonically increasing ids; responses resolve
//! the pending request keyed by id, events go to a registered callback,
//! and every request carries a timeout that fires without closing the
//! connection.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use tokio::net::unix::OwnedWriteHalf;
use tokio::sync::{Mutex, oneshot};
use tokio::task::JoinHandle;
use tracing::debug;

use crate::config::TermcpConfig;
use crate::protocol::{
    Action, ErrorCode, EventKind, OutputMode, Request, ServerMessage, TermSize, TerminalEntry,
};

/// How long the client polls for the socket after auto-starting a daemon.
const AUTOSTART_TIMEOUT: Duration = Duration::from_secs(5);
const AUTOSTART_POLL: Duration = Duration::from_millis(100);

#[derive(Debug, Error)]
pub enum ClientError {
    /// The request's timeout expired. The connection stays usable.
    #[error("request timed out")]
    Timeout,

    /// The connection dropped with the request in flight.
    #[error("disconnected from daemon")]
    Disconnected,

    /// The daemon reported an error.
    #[error("{code:?}: {message}")]
    Server { code: ErrorCode, message: String },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("protocol error: {0}")]
    Protocol(String),
}

/// An event pushed by the daemon for a subscribed terminal.
#[derive(Debug, Clone)]
pub struct Event {
    pub terminal: String,
    pub kind: EventKind,
    pub data: String,
}

pub type EventCallback = Box<dyn Fn(Event) + Send + Sync>;

type Pending = Arc<std::sync::Mutex<HashMap<u64, oneshot::Sender<Result<serde_json::Value, ClientError>>>>>;
type EventHandler = Arc<std::sync::Mutex<Option<EventCallback>>>;

pub struct Client {
    writer: Arc<Mutex<OwnedWriteHalf>>,
    pending: Pending,
    events: EventHandler,
    next_id: AtomicU64,
    timeout: Duration,
    reader: JoinHandle<()>,
}

impl Client {
    /// Connect to an already-running daemon.
    pub async fn connect(socket_path: &Path) -> Result<Self, ClientError> {
        let stream = UnixStream::connect(socket_path).await?;
        let (read_half, write_half) = stream.into_split();

        let pending: Pending = Arc::new(std::sync::Mutex::new(HashMap::new()));
        let events: EventHandler = Arc::new(std::sync::Mutex::new(None));

        let reader = tokio::spawn(read_loop(read_half, pending.clone(), events.clone()));

        Ok(Self {
            writer: Arc::new(Mutex::new(write_half)),
            pending,
            events,
            next_id: AtomicU64::new(1),
            timeout: Duration::from_secs(5),
            reader,
        })
    }

    /// Connect, auto-starting a detached daemon if nothing is listening.
    pub async fn connect_or_spawn(config: &TermcpConfig) -> Result<Self, ClientError> {
        let socket_path = config.socket_path();
        match Self::connect(&socket_path).await {
            Ok(client) => return Ok(client),
            Err(e) => debug!("no daemon at {:?} ({}), auto-starting", socket_path, e),
        }

        spawn_daemon(config)?;

        let deadline = tokio::time::Instant::now() + AUTOSTART_TIMEOUT;
        loop {
            tokio::time::sleep(AUTOSTART_POLL).await;
            match Self::connect(&socket_path).await {
                Ok(client) => return Ok(client),
                Err(_) if tokio::time::Instant::now() < deadline => continue,
                Err(e) => return Err(e),
            }
        }
    }

    /// Register the callback that receives subscription events. Replaces
    /// any previous callback.
    pub fn on_event(&self, callback: EventCallback) {
        *self.events.lock().expect("event handler lock") = Some(callback);
    }

    /// Override the default 5-second request timeout.
    pub fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }

    /// Issue one request and wait for its response.
    pub async fn request(&self, action: Action) -> Result<serde_json::Value, ClientError> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let frame = serde_json::to_string(&Request {
            id: id.to_string(),
            action,
        })
        .map_err(|e| ClientError::Protocol(e.to_string()))?;

        let (tx, rx) = oneshot::channel();
        self.pending.lock().expect("pending lock").insert(id, tx);

        {
            let mut writer = self.writer.lock().await;
            let write = async {
                writer.write_all(frame.as_bytes()).await?;
                writer.write_all(b"\n").await
            };
            if write.await.is_err() {
                self.pending.lock().expect("pending lock").remove(&id);
                return Err(ClientError::Disconnected);
            }
        }

        match tokio::time::timeout(self.timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(ClientError::Disconnected),
            Err(_) => {
                // Expired: forget the pending entry but keep the connection.
                self.pending.lock().expect("pending lock").remove(&id);
                Err(ClientError::Timeout)
            }
        }
    }

    // -- convenience wrappers, one per daemon action --

    pub async fn start(
        &self,
        command: &str,
        cols: Option<u16>,
        rows: Option<u16>,
        cwd: Option<String>,
    ) -> Result<String, ClientError> {
        let result = self
            .request(Action::Start {
                command: command.to_string(),
                cols,
                rows,
                cwd,
                env: None,
            })
            .await?;
        result
            .as_str()
            .map(String::from)
            .ok_or_else(|| ClientError::Protocol("start result was not a string".into()))
    }

    pub async fn stop(&self, terminal: &str, force: bool) -> Result<(), ClientError> {
        self.request(Action::Stop {
            terminal: terminal.to_string(),
            force,
        })
        .await
        .map(|_| ())
    }

    pub async fn stdin(&self, terminal: &str, data: &str, is_key: bool) -> Result<(), ClientError> {
        self.request(Action::Stdin {
            terminal: terminal.to_string(),
            data: data.to_string(),
            is_key,
        })
        .await
        .map(|_| ())
    }

    pub async fn stdout(
        &self,
        terminal: &str,
        mode: OutputMode,
        lines: Option<usize>,
        bytes: Option<usize>,
    ) -> Result<String, ClientError> {
        let result = self
            .request(Action::Stdout {
                terminal: terminal.to_string(),
                mode,
                lines,
                bytes,
            })
            .await?;
        result
            .as_str()
            .map(String::from)
            .ok_or_else(|| ClientError::Protocol("stdout result was not a string".into()))
    }

    pub async fn subscribe(&self, terminal: &str) -> Result<(), ClientError> {
        self.request(Action::Subscribe {
            terminal: terminal.to_string(),
        })
        .await
        .map(|_| ())
    }

    pub async fn unsubscribe(&self, terminal: &str) -> Result<(), ClientError> {
        self.request(Action::Unsubscribe {
            terminal: terminal.to_string(),
        })
        .await
        .map(|_| ())
    }

    pub async fn resize(&self, terminal: &str, cols: u16, rows: u16) -> Result<(), ClientError> {
        self.request(Action::Resize {
            terminal: terminal.to_string(),
            cols,
            rows,
        })
        .await
        .map(|_| ())
    }

    pub async fn list(&self) -> Result<Vec<TerminalEntry>, ClientError> {
        let result = self.request(Action::List).await?;
        serde_json::from_value(result).map_err(|e| ClientError::Protocol(e.to_string()))
    }

    pub async fn term_size(&self) -> Result<TermSize, ClientError> {
        let result = self.request(Action::TermSize).await?;
        serde_json::from_value(result).map_err(|e| ClientError::Protocol(e.to_string()))
    }

    pub async fn kill_server(&self) -> Result<(), ClientError> {
        self.request(Action::KillServer).await.map(|_| ())
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

/// Route incoming frames: responses to their pending request, events to
/// the callback. When the connection ends, every in-flight request fails
/// with `Disconnected`.
async fn read_loop(
    read_half: tokio::net::unix::OwnedReadHalf,
    pending: Pending,
    events: EventHandler,
) {
    let mut lines = BufReader::new(read_half).lines();

    while let Ok(Some(line)) = lines.next_line().await {
        let message: ServerMessage = match serde_json::from_str(&line) {
            Ok(m) => m,
            Err(e) => {
                debug!("unparseable frame from daemon: {}", e);
                continue;
            }
        };

        match message {
            ServerMessage::Response {
                id,
                ok,
                result,
                error,
            } => {
                let Ok(id) = id.parse::<u64>() else {
                    continue;
                };
                let Some(tx) = pending.lock().expect("pending lock").remove(&id) else {
                    // Timed out locally; late response is dropped.
                    continue;
                };
                let outcome = if ok {
                    Ok(result.unwrap_or(serde_json::Value::Null))
                } else {
                    let error = error.map(|e| (e.code, e.message)).unwrap_or((
                        ErrorCode::InternalError,
                        "error response without error body".to_string(),
                    ));
                    Err(ClientError::Server {
                        code: error.0,
                        message: error.1,
                    })
                };
                let _ = tx.send(outcome);
            }
            ServerMessage::Event {
                terminal,
                kind,
                data,
            } => {
                if let Some(callback) = events.lock().expect("event handler lock").as_ref() {
                    callback(Event {
                        terminal,
                        kind,
                        data,
                    });
                }
            }
        }
    }

    let mut pending = pending.lock().expect("pending lock");
    for (_, tx) in pending.drain() {
        let _ = tx.send(Err(ClientError::Disconnected));
    }
}

/// Spawn a detached daemon process: new session, stdio to the log files,
/// no inherited terminal.
fn spawn_daemon(config: &TermcpConfig) -> Result<(), ClientError> {
    let exe = std::env::current_exe()?;

    let log_file = std::fs::File::create(config.daemon_log_path())?;
    let err_file = std::fs::File::create(config.daemon_err_path())?;

    let mut cmd = std::process::Command::new(&exe);
    cmd.arg("server")
        .arg("--data-dir")
        .arg(&config.data_dir)
        .stdin(std::process::Stdio::null())
        .stdout(std::process::Stdio::from(log_file))
        .stderr(std::process::Stdio::from(err_file));

    // New session so the daemon survives this terminal.
    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        unsafe {
            cmd.pre_exec(|| {
                nix::libc::setsid();
                Ok(())
            });
        }
    }

    cmd.spawn()?;
    Ok(())
}
