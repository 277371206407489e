use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

// =============================================================================
// Tunable config (figment-deserialized from defaults / config.toml / env vars)
// =============================================================================
//
// Two equivalent ways to configure:
//
//   config.toml:     [server]
//                    max_buffer_mb = 8
//
//   env var:         TERMINALCP_SERVER__MAX_BUFFER_MB=8   (double underscore
//                    = nesting; single underscores stay within field names)

/// Top-level tunable configuration, deserialized by figment.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct FileConfig {
    #[serde(default)]
    pub server: ServerFileConfig,
}

/// Server tuning knobs (lives under `[server]` in config.toml).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServerFileConfig {
    /// Raw output ring capacity per terminal, in MiB.
    #[serde(default = "default_max_buffer_mb")]
    pub max_buffer_mb: usize,
    /// Scrollback history per terminal, in lines.
    #[serde(default = "default_scrollback_lines")]
    pub scrollback_lines: usize,
    /// Per-connection outgoing frame queue; a subscriber that falls this
    /// far behind is dropped.
    #[serde(default = "default_write_queue_frames")]
    pub write_queue_frames: usize,
    /// How long `stop` waits after SIGTERM before escalating to SIGKILL.
    #[serde(default = "default_stop_grace_ms")]
    pub stop_grace_ms: u64,
    /// Pause after any stdin write containing a carriage return. Some
    /// line-buffered programs drop rapid successive inputs without it.
    #[serde(default = "default_enter_delay_ms")]
    pub enter_delay_ms: u64,
    /// Client-side request timeout in seconds.
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

impl Default for ServerFileConfig {
    fn default() -> Self {
        Self {
            max_buffer_mb: default_max_buffer_mb(),
            scrollback_lines: default_scrollback_lines(),
            write_queue_frames: default_write_queue_frames(),
            stop_grace_ms: default_stop_grace_ms(),
            enter_delay_ms: default_enter_delay_ms(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

fn default_max_buffer_mb() -> usize {
    4
}
fn default_scrollback_lines() -> usize {
    10_000
}
fn default_write_queue_frames() -> usize {
    256
}
fn default_stop_grace_ms() -> u64 {
    3000
}
fn default_enter_delay_ms() -> u64 {
    200
}
fn default_request_timeout_secs() -> u64 {
    5
}

/// Build a figment that layers: defaults → config.toml → TERMINALCP_* env vars.
///
/// Env vars use double-underscore for nesting into sections:
///   `TERMINALCP_SERVER__MAX_BUFFER_MB=8`  →  `server.max_buffer_mb = 8`
pub fn load_config(data_dir: &Path) -> figment::Figment {
    use figment::{
        Figment,
        providers::{Env, Format, Serialized, Toml},
    };

    Figment::from(Serialized::defaults(FileConfig::default()))
        .merge(Toml::file(data_dir.join("config.toml")))
        .merge(Env::prefixed("TERMINALCP_").split("__"))
}

// =============================================================================
// Runtime config (derived from FileConfig, used throughout the daemon)
// =============================================================================

#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub max_buffer_bytes: usize,
    pub scrollback_lines: usize,
    pub write_queue_frames: usize,
    pub stop_grace: Duration,
    pub enter_delay: Duration,
    pub request_timeout: Duration,
}

impl ServerConfig {
    pub fn from_file(fc: &ServerFileConfig) -> Self {
        Self {
            max_buffer_bytes: fc.max_buffer_mb * 1024 * 1024,
            scrollback_lines: fc.scrollback_lines,
            write_queue_frames: fc.write_queue_frames,
            stop_grace: Duration::from_millis(fc.stop_grace_ms),
            enter_delay: Duration::from_millis(fc.enter_delay_ms),
            request_timeout: Duration::from_secs(fc.request_timeout_secs),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self::from_file(&ServerFileConfig::default())
    }
}

// =============================================================================
// Directory layout config (not tunable via figment — derived from --data-dir)
// =============================================================================

#[derive(Clone, Debug)]
pub struct TermcpConfig {
    pub data_dir: PathBuf,
    pub logs_dir: PathBuf,
}

impl TermcpConfig {
    pub fn new(custom_dir: Option<PathBuf>) -> Result<Self> {
        let data_dir = custom_dir.unwrap_or_else(|| {
            dirs::home_dir()
                .expect("Could not find home directory")
                .join(".terminalcp")
        });

        std::fs::create_dir_all(&data_dir)
            .with_context(|| format!("Failed to create data directory: {:?}", data_dir))?;

        // The socket lives in here; keep the whole directory user-private.
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&data_dir, std::fs::Permissions::from_mode(0o700))
                .with_context(|| format!("Failed to chmod data directory: {:?}", data_dir))?;
        }

        let logs_dir = data_dir.join("logs");
        std::fs::create_dir_all(&logs_dir)
            .with_context(|| format!("Failed to create logs directory: {:?}", logs_dir))?;

        Ok(Self { data_dir, logs_dir })
    }

    pub fn socket_path(&self) -> PathBuf {
        self.data_dir.join("server.sock")
    }

    pub fn daemon_log_path(&self) -> PathBuf {
        self.logs_dir.join("daemon.log")
    }

    pub fn daemon_err_path(&self) -> PathBuf {
        self.logs_dir.join("daemon.err")
    }

    pub fn config_toml_path(&self) -> PathBuf {
        self.data_dir.join("config.toml")
    }
}
