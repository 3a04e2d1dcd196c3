use anyhow::Context;

use std::path::Path;
use std::time::Duration;

use crate::consts::{
    DEFAULT_CONNECT_TIMEOUT_MS, DEFAULT_FLUSH_TIMEOUT_MS, DEFAULT_READ_TIMEOUT_MS,
    DEFAULT_SERVER_URL, ENDPOINT_NAME,
};
use crate::coordinator::CoordinatorSettings;

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct LauncherConfig {
    #[serde(default = "default_server_url")]
    pub default_server_url: String,
    #[serde(default = "default_endpoint_name")]
    pub endpoint_name: String,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    #[serde(default = "default_read_timeout_ms")]
    pub read_timeout_ms: u64,
    #[serde(default = "default_flush_timeout_ms")]
    pub flush_timeout_ms: u64,
    #[serde(default = "default_max_frame_bytes")]
    pub max_frame_bytes: usize,
}

fn default_server_url() -> String {
    DEFAULT_SERVER_URL.to_string()
}

fn default_endpoint_name() -> String {
    ENDPOINT_NAME.to_string()
}

fn default_connect_timeout_ms() -> u64 {
    DEFAULT_CONNECT_TIMEOUT_MS
}

fn default_read_timeout_ms() -> u64 {
    DEFAULT_READ_TIMEOUT_MS
}

fn default_flush_timeout_ms() -> u64 {
    DEFAULT_FLUSH_TIMEOUT_MS
}

fn default_max_frame_bytes() -> usize {
    utils::DEFAULT_MAX_FRAME_BYTES
}

impl Default for LauncherConfig {
    fn default() -> Self {
        Self {
            default_server_url: default_server_url(),
            endpoint_name: default_endpoint_name(),
            connect_timeout_ms: default_connect_timeout_ms(),
            read_timeout_ms: default_read_timeout_ms(),
            flush_timeout_ms: default_flush_timeout_ms(),
            max_frame_bytes: default_max_frame_bytes(),
        }
    }
}

impl LauncherConfig {
    pub fn coordinator_settings(&self) -> CoordinatorSettings {
        // A zero timeout would turn every connect into an instant fallback.
        CoordinatorSettings {
            connect_timeout: Duration::from_millis(self.connect_timeout_ms.max(1)),
            read_timeout: Duration::from_millis(self.read_timeout_ms.max(1)),
            flush_timeout: Duration::from_millis(self.flush_timeout_ms.max(1)),
            max_frame_bytes: self.max_frame_bytes.max(1024),
        }
    }
}

/// Load the config at `path`. A missing file is not an error: defaults apply.
pub fn load_config(path: &Path) -> anyhow::Result<LauncherConfig> {
    let s = match std::fs::read_to_string(path) {
        Ok(s) => s,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            log::debug!("config: {} not found, using defaults", path.display());
            return Ok(LauncherConfig::default());
        }
        Err(e) => {
            return Err(e).with_context(|| format!("read config {}", path.display()));
        }
    };
    let cfg: LauncherConfig = toml::from_str(&s).context("parse config")?;
    Ok(cfg)
}
