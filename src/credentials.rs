/// Telegram credential discovery.
///
/// Sources are searched in priority order:
/// 1. process environment (`TELEGRAM_BOT_TOKEN`, `TELEGRAM_PROXY` / `HTTPS_PROXY` / `HTTP_PROXY`)
/// 2. `.env` in the current working directory
/// 3. fallback files under the user's config and home directories
///
/// Files are parsed as dotenv key-value files without touching the process
/// environment.
use std::path::{Path, PathBuf};

pub const TOKEN_KEY: &str = "TELEGRAM_BOT_TOKEN";
const PROXY_KEYS: &[&str] = &["TELEGRAM_PROXY", "HTTPS_PROXY", "HTTP_PROXY"];

/// Resolved delivery credential.
#[derive(Clone, PartialEq, Eq)]
pub struct TelegramCredentials {
    pub bot_token: String,
    pub proxy: Option<String>,
}

// Keep the token out of logs.
impl std::fmt::Debug for TelegramCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TelegramCredentials")
            .field("bot_token", &"<redacted>")
            .field("proxy", &self.proxy)
            .finish()
    }
}

/// Key-value pairs from one source, in the order they were searched.
#[derive(Default)]
pub struct CredentialSources {
    layers: Vec<(String, Vec<(String, String)>)>,
}

impl CredentialSources {
    /// Collect from the real process environment, `cwd/.env`, and the default fallback files.
    pub fn discover(cwd: &Path) -> Self {
        let mut sources = Self::default();

        let env: Vec<(String, String)> = std::iter::once(TOKEN_KEY)
            .chain(PROXY_KEYS.iter().copied())
            .filter_map(|k| std::env::var(k).ok().map(|v| (k.to_string(), v)))
            .collect();
        sources.push_layer("environment", env);

        sources.push_file(&cwd.join(".env"));
        for path in fallback_files() {
            sources.push_file(&path);
        }
        sources
    }

    /// Append a layer of already-known pairs (lowest priority so far).
    pub fn push_layer(&mut self, label: impl Into<String>, pairs: Vec<(String, String)>) {
        self.layers.push((label.into(), pairs));
    }

    /// Append a dotenv file. Missing or unreadable files are skipped.
    pub fn push_file(&mut self, path: &Path) {
        if !path.is_file() {
            return;
        }
        match read_env_file(path) {
            Ok(pairs) => self.push_layer(path.display().to_string(), pairs),
            Err(e) => {
                tracing::warn!(
                    path = %path.display(),
                    error = %e,
                    "skipping unreadable credential file"
                );
            }
        }
    }

    /// First non-empty value for any of `keys`, searching layers in order.
    fn lookup(&self, keys: &[&str]) -> Option<(&str, String)> {
        for (label, pairs) in &self.layers {
            for key in keys {
                let found = pairs
                    .iter()
                    .find(|(k, v)| k == key && !v.trim().is_empty())
                    .map(|(_, v)| v.trim().to_string());
                if let Some(value) = found {
                    return Some((label.as_str(), value));
                }
            }
        }
        None
    }
}

fn read_env_file(path: &Path) -> Result<Vec<(String, String)>, dotenvy::Error> {
    dotenvy::from_path_iter(path)?.collect()
}

/// Well-known fallback locations, lowest priority.
pub fn fallback_files() -> Vec<PathBuf> {
    let mut files = Vec::new();
    if let Some(dir) = dirs::config_dir() {
        files.push(dir.join("opencode-watch").join(".env"));
    }
    if let Some(home) = dirs::home_dir() {
        files.push(home.join(".opencode-watch.env"));
    }
    files
}

/// Resolve the bot token and optional proxy. `None` when no token is configured.
pub fn resolve_telegram_config(sources: &CredentialSources) -> Option<TelegramCredentials> {
    let (origin, bot_token) = sources.lookup(&[TOKEN_KEY])?;
    let proxy = sources.lookup(PROXY_KEYS).map(|(_, p)| p);
    tracing::debug!(origin, has_proxy = proxy.is_some(), "resolved telegram credentials");
    Some(TelegramCredentials { bot_token, proxy })
}
