use thiserror::Error;

/// Errors that can occur during PTY operations
#[derive(Debug, Error)]
pub enum PtyError {
    /// Failed to allocate the PTY pair or spawn the child
    #[error("failed to spawn PTY: {0}")]
    SpawnFailed(String),

    /// Failed to write to the PTY master
    #[error("failed to write to PTY: {0}")]
    WriteFailed(String),

    /// Failed to resize the PTY
    #[error("failed to resize PTY: {0}")]
    ResizeFailed(String),

    /// Failed to deliver a signal to the child
    #[error("failed to signal PTY child: {0}")]
    SignalFailed(String),

    /// The actor task is gone (channel closed)
    #[error("PTY actor is gone: {0}")]
    ChannelClosed(String),
}

impl From<anyhow::Error> for PtyError {
    fn from(err: anyhow::Error) -> Self {
        PtyError::SpawnFailed(err.to_string())
    }
}
