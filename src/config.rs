use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

pub const DEFAULT_API_BASE: &str = "https://www.youtube.com/api/lounge";

pub type Result<T> = std::result::Result<T, ConfigError>;

/// Why the client config could not be loaded. File errors carry the path.
#[derive(Debug)]
pub enum ConfigError {
    Read { path: PathBuf, source: io::Error },
    Parse { path: PathBuf, source: serde_json::Error },
    /// The platform has no per-user config directory.
    NoConfigDir,
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Read { path, source } => {
                write!(f, "cannot read {}: {source}", path.display())
            }
            ConfigError::Parse { path, source } => {
                write!(f, "invalid client config in {}: {source}", path.display())
            }
            ConfigError::NoConfigDir => write!(f, "no config directory for ytlounge.json"),
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::Read { source, .. } => Some(source),
            ConfigError::Parse { source, .. } => Some(source),
            ConfigError::NoConfigDir => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

/// Client settings. Credentials are not part of this; see `AuthState`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Name shown on the screen for this remote.
    pub device_name: String,
    /// Stable id of this remote, sent as the channel's `id`.
    pub device_id: String,
    pub api_base: String,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    /// Consecutive failures tolerated before the channel gives up.
    pub max_attempts: u32,
    /// A long poll with no data for this long is restarted.
    pub poll_idle_timeout_secs: u64,
    pub request_timeout_secs: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            device_name: "ytlounge".into(),
            device_id: uuid::Uuid::new_v4().to_string(),
            api_base: DEFAULT_API_BASE.into(),
            backoff_base_ms: 500,
            backoff_max_ms: 30_000,
            max_attempts: 4,
            poll_idle_timeout_secs: 45,
            request_timeout_secs: 20,
        }
    }
}

impl ClientConfig {
    pub fn new(device_name: impl Into<String>) -> Self {
        Self {
            device_name: device_name.into(),
            ..Self::default()
        }
    }

    /// Load `~/.config/ytlounge.json` if it exists, defaults otherwise.
    /// `DEVICE_NAME` overrides the configured name.
    pub fn load() -> Result<Self> {
        let path = Self::path()?;
        let mut config = if path.exists() {
            Self::from_file(&path)?
        } else {
            tracing::debug!("no config at {}, using defaults", path.display());
            Self::default()
        };
        if let Ok(name) = std::env::var("DEVICE_NAME") {
            config.device_name = name;
        }
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_owned(),
            source,
        })?;
        let config: ClientConfig =
            serde_json::from_str(&data).map_err(|source| ConfigError::Parse {
                path: path.to_owned(),
                source,
            })?;
        tracing::info!("loaded config from {}", path.display());
        Ok(config)
    }

    fn path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir().ok_or(ConfigError::NoConfigDir)?;
        Ok(config_dir.join("ytlounge.json"))
    }

    pub(crate) fn bind_url(&self) -> String {
        format!("{}/bc/bind", self.api_base)
    }

    pub(crate) fn pairing_url(&self, endpoint: &str) -> String {
        format!("{}/pairing/{endpoint}", self.api_base)
    }
}
