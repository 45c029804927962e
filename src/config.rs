use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Top-level configuration loaded from opencode-watch.toml.
#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct WatchConfig {
    pub monitor: MonitorConfig,
    pub classifier: ClassifierConfig,
    pub backend: BackendConfig,
    pub notify: NotifyConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    pub max_no_change: u32,
    pub max_duration_secs: u64,
    pub retry_delay_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ClassifierConfig {
    pub long_form_threshold: usize,
    /// Replaces the built-in keyword set when present.
    pub keywords: Option<Vec<String>>,
    pub extra_keywords: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    pub base_url: String,
    pub directory: Option<String>,
    pub request_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NotifyConfig {
    pub chat_id: String,
    pub timeout_secs: u64,
    /// Bot API host; override for a self-hosted Bot API server.
    pub api_base: String,
}

// --- Default implementations ---

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            max_no_change: 15,
            max_duration_secs: 3600,
            retry_delay_secs: 30,
        }
    }
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            long_form_threshold: crate::classifier::DEFAULT_LONG_FORM_THRESHOLD,
            keywords: None,
            extra_keywords: Vec::new(),
        }
    }
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:4096".to_string(),
            directory: None,
            request_timeout_secs: 30,
        }
    }
}

impl Default for NotifyConfig {
    fn default() -> Self {
        Self {
            chat_id: "6186153489".to_string(),
            timeout_secs: 10,
            api_base: "https://api.telegram.org".to_string(),
        }
    }
}

/// Errors from loading the config file.
#[derive(Debug)]
pub enum ConfigError {
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Read { path, source } => {
                write!(f, "failed to read config {}: {}", path.display(), source)
            }
            ConfigError::Parse { path, source } => {
                write!(f, "failed to parse config {}: {}", path.display(), source)
            }
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::Read { source, .. } => Some(source),
            ConfigError::Parse { source, .. } => Some(source),
        }
    }
}

/// Load config from the given path.
///
/// A missing file yields the defaults; a file that exists but cannot be
/// read or parsed is an error.
pub fn load_config(path: &Path) -> Result<WatchConfig, ConfigError> {
    let contents = match std::fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            tracing::debug!(path = %path.display(), "no config file, using defaults");
            return Ok(WatchConfig::default());
        }
        Err(e) => {
            return Err(ConfigError::Read {
                path: path.to_path_buf(),
                source: e,
            })
        }
    };

    toml::from_str(&contents).map_err(|e| ConfigError::Parse {
        path: path.to_path_buf(),
        source: e,
    })
}
