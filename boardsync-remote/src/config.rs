/// Client configuration.
/// Reads config.json from ~/.config/boardsync/config.json (or platform equivalent),
/// then applies BOARDSYNC_* environment overrides.
use boardsync_core::config::SyncSettings;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

pub const ENV_URL: &str = "BOARDSYNC_URL";
pub const ENV_ANON_KEY: &str = "BOARDSYNC_ANON_KEY";
pub const ENV_USER_ID: &str = "BOARDSYNC_USER_ID";
pub const ENV_ACCESS_TOKEN: &str = "BOARDSYNC_ACCESS_TOKEN";
pub const ENV_LOG_FILE: &str = "BOARDSYNC_LOG_FILE";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientConfig {
    /// Project base URL, e.g. https://xyz.supabase.co
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub anon_key: String,
    /// Signed-in user's JWT. Requests fall back to the anon key without it.
    #[serde(default)]
    pub access_token: Option<String>,
    /// Recorded as `created_by` on new cards.
    #[serde(default)]
    pub user_id: String,
    #[serde(default)]
    pub sync: SyncSettings,
    /// Where log records are mirrored. Defaults to `default_log_path()`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_file: Option<PathBuf>,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing {field}: set it in {path} or via {env}")]
    Missing {
        field: &'static str,
        env: &'static str,
        path: String,
    },
}

/// Default config path: ~/.config/boardsync/config.json
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("boardsync")
        .join("config.json")
}

/// Default log file: ~/.config/boardsync/logs/client.log
pub fn default_log_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("boardsync")
        .join("logs")
        .join("client.log")
}

/// Load config from path. Returns default if the file doesn't exist or can't be parsed.
pub fn load_config(path: &Path) -> ClientConfig {
    match fs::read_to_string(path) {
        Ok(content) => serde_json::from_str(&content).unwrap_or_else(|e| {
            log::warn!("Failed to parse config {}: {}", path.display(), e);
            ClientConfig::default()
        }),
        Err(_) => {
            log::info!("No config at {}, using defaults", path.display());
            ClientConfig::default()
        }
    }
}

impl ClientConfig {
    /// Apply BOARDSYNC_* overrides from the process environment.
    pub fn apply_env(&mut self) {
        self.apply_overrides(|name| std::env::var(name).ok());
    }

    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let get = |name| lookup(name).filter(|v: &String| !v.trim().is_empty());
        if let Some(url) = get(ENV_URL) {
            self.url = url;
        }
        if let Some(key) = get(ENV_ANON_KEY) {
            self.anon_key = key;
        }
        if let Some(user_id) = get(ENV_USER_ID) {
            self.user_id = user_id;
        }
        if let Some(token) = get(ENV_ACCESS_TOKEN) {
            self.access_token = Some(token);
        }
        if let Some(path) = get(ENV_LOG_FILE) {
            self.log_file = Some(PathBuf::from(path));
        }
    }

    pub fn log_path(&self) -> PathBuf {
        self.log_file.clone().unwrap_or_else(default_log_path)
    }

    /// Everything a remote session needs is present.
    pub fn validate(&self, path: &Path) -> Result<(), ConfigError> {
        let required = [
            ("url", ENV_URL, &self.url),
            ("anonKey", ENV_ANON_KEY, &self.anon_key),
            ("userId", ENV_USER_ID, &self.user_id),
        ];
        for (field, env, value) in required {
            if value.trim().is_empty() {
                return Err(ConfigError::Missing {
                    field,
                    env,
                    path: path.display().to_string(),
                });
            }
        }
        Ok(())
    }
}
