use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::error;

const DEFAULT_PORT: u16 = 4310;

fn default_bind_address() -> String {
    "127.0.0.1".to_string()
}

// ─── SyncConfig ──────────────────────────────────────────────────────────────

/// Streaming channel tuning (`[sync]` in config.toml).
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Seconds between server heartbeat frames. Default: 15.
    pub heartbeat_secs: u64,
    /// Close a channel after this many seconds without any sent or received
    /// traffic (heartbeat or event). Default: 60.
    pub idle_timeout_secs: u64,
    /// Seconds a new connection has to send its `subscribe` frame. Default: 10.
    pub handshake_timeout_secs: u64,
    /// Bound on each subscriber's outbound queue; the oldest pending event
    /// is dropped when full. Default: 256.
    pub queue_capacity: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            heartbeat_secs: 15,
            idle_timeout_secs: 60,
            handshake_timeout_secs: 10,
            queue_capacity: 256,
        }
    }
}

// ─── ReconnectConfig ─────────────────────────────────────────────────────────

/// Client reconnect backoff (`[reconnect]` in config.toml).
///
/// Delay after the Nth consecutive failure is `min(base_ms * N, cap_ms)`.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ReconnectConfig {
    /// Base delay in milliseconds. Default: 3000.
    pub base_ms: u64,
    /// Delay ceiling in milliseconds. Default: 30000.
    pub cap_ms: u64,
    /// Give up (state `Failed`) after this many consecutive failed attempts.
    /// 0 = retry forever. Default: 0.
    pub max_attempts: u32,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            base_ms: 3_000,
            cap_ms: 30_000,
            max_attempts: 0,
        }
    }
}

// ─── TOML config file ────────────────────────────────────────────────────────

/// `{data_dir}/config.toml` — all fields are optional overrides.
/// Priority: CLI / env var  >  TOML  >  built-in default.
#[derive(Deserialize, Default)]
struct TomlConfig {
    /// WebSocket server port (default: 4310).
    port: Option<u16>,
    /// Bind address (default: "127.0.0.1"; use "0.0.0.0" for LAN access).
    bind_address: Option<String>,
    /// Log level filter string, e.g. "debug", "info,boardd=trace" (default: "info").
    log: Option<String>,
    /// Log output format: "pretty" (default) | "json" (structured for log aggregators).
    log_format: Option<String>,
    /// Streaming channel tuning (`[sync]`).
    sync: Option<SyncConfig>,
    /// Client reconnect backoff (`[reconnect]`).
    reconnect: Option<ReconnectConfig>,
}

fn load_toml(data_dir: &Path) -> Option<TomlConfig> {
    let path = data_dir.join("config.toml");
    let contents = std::fs::read_to_string(&path).ok()?;
    match toml::from_str::<TomlConfig>(&contents) {
        Ok(cfg) => Some(cfg),
        Err(e) => {
            error!(path = %path.display(), err = %e, "failed to parse config.toml — using defaults");
            None
        }
    }
}

// ─── DaemonConfig ────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct DaemonConfig {
    pub port: u16,
    /// Bind address for the WebSocket server (BOARDD_BIND env var).
    pub bind_address: String,
    pub data_dir: PathBuf,
    pub log: String,
    /// "pretty" (default) | "json".
    pub log_format: String,
    /// Streaming channel tuning: heartbeat, idle timeout, queue bound.
    pub sync: SyncConfig,
    /// Client reconnect backoff policy.
    pub reconnect: ReconnectConfig,
}

impl DaemonConfig {
    /// Build config from CLI/env args + optional TOML file.
    ///
    /// Priority (highest to lowest):
    ///   1. CLI / env — passed as `Some(value)` from clap
    ///   2. TOML file at `{data_dir}/config.toml`
    ///   3. Built-in defaults
    pub fn new(
        port: Option<u16>,
        data_dir: Option<PathBuf>,
        log: Option<String>,
        bind_address: Option<String>,
    ) -> Self {
        let data_dir = data_dir.unwrap_or_else(default_data_dir);

        // Load TOML as the lowest-priority override layer
        let toml = load_toml(&data_dir).unwrap_or_default();

        let port = port.or(toml.port).unwrap_or(DEFAULT_PORT);
        let log = log.or(toml.log).unwrap_or_else(|| "info".to_string());
        let bind_address = bind_address
            .or(toml.bind_address)
            .unwrap_or_else(default_bind_address);
        let log_format = std::env::var("BOARDD_LOG_FORMAT")
            .ok()
            .or(toml.log_format)
            .unwrap_or_else(|| "pretty".to_string());

        Self {
            port,
            bind_address,
            data_dir,
            log,
            log_format,
            sync: toml.sync.unwrap_or_default(),
            reconnect: toml.reconnect.unwrap_or_default(),
        }
    }

    /// WebSocket URL a local client uses to reach this server.
    pub fn ws_url(&self) -> String {
        format!("ws://{}:{}", self.bind_address, self.port)
    }
}

fn default_data_dir() -> PathBuf {
    #[cfg(target_os = "macos")]
    {
        // ~/Library/Application Support/boardd
        if let Ok(home) = std::env::var("HOME") {
            return PathBuf::from(home)
                .join("Library")
                .join("Application Support")
                .join("boardd");
        }
    }
    #[cfg(target_os = "linux")]
    {
        // $XDG_DATA_HOME/boardd or ~/.local/share/boardd
        if let Ok(xdg) = std::env::var("XDG_DATA_HOME") {
            return PathBuf::from(xdg).join("boardd");
        }
        if let Ok(home) = std::env::var("HOME") {
            return PathBuf::from(home).join(".local").join("share").join("boardd");
        }
    }
    #[cfg(target_os = "windows")]
    {
        if let Ok(appdata) = std::env::var("APPDATA") {
            return PathBuf::from(appdata).join("boardd");
        }
    }
    std::env::temp_dir().join("boardd")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_apply_without_toml() {
        let dir = tempfile::tempdir().unwrap();
        let config = DaemonConfig::new(None, Some(dir.path().to_path_buf()), None, None);
        assert_eq!(config.port, DEFAULT_PORT);
        assert_eq!(config.bind_address, "127.0.0.1");
        assert_eq!(config.sync.heartbeat_secs, 15);
        assert_eq!(config.reconnect.base_ms, 3_000);
        assert_eq!(config.reconnect.cap_ms, 30_000);
        assert_eq!(config.reconnect.max_attempts, 0);
    }

    #[test]
    fn cli_overrides_toml_overrides_default() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("config.toml"),
            r#"
port = 5000
log = "debug"

[sync]
heartbeat_secs = 5
queue_capacity = 32

[reconnect]
base_ms = 1000
max_attempts = 4
"#,
        )
        .unwrap();

        let config = DaemonConfig::new(
            Some(6000),
            Some(dir.path().to_path_buf()),
            None,
            None,
        );
        // CLI wins over TOML.
        assert_eq!(config.port, 6000);
        // TOML wins over defaults.
        assert_eq!(config.log, "debug");
        assert_eq!(config.sync.heartbeat_secs, 5);
        assert_eq!(config.sync.queue_capacity, 32);
        assert_eq!(config.reconnect.base_ms, 1_000);
        assert_eq!(config.reconnect.max_attempts, 4);
        // Unset TOML section fields fall back to their defaults.
        assert_eq!(config.sync.idle_timeout_secs, 60);
    }

    #[test]
    fn malformed_toml_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("config.toml"), "port = \"not a number").unwrap();
        let config = DaemonConfig::new(None, Some(dir.path().to_path_buf()), None, None);
        assert_eq!(config.port, DEFAULT_PORT);
    }
}
