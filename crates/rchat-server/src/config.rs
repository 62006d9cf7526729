//! Server configuration: TOML file + CLI overrides.

use rchat_core::{ChatError, ChatResult};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

/// Top-level config file structure.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub storage: StorageSection,
}

/// `[server]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_max_sessions")]
    pub max_sessions: usize,
    /// `0` means unbounded.
    #[serde(default)]
    pub max_queue: usize,
    #[serde(default = "default_promote_delay_ms")]
    pub promote_delay_ms: u64,
    #[serde(default = "default_outbound_queue")]
    pub outbound_queue: usize,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            max_sessions: default_max_sessions(),
            max_queue: 0,
            promote_delay_ms: default_promote_delay_ms(),
            outbound_queue: default_outbound_queue(),
        }
    }
}

/// `[storage]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct StorageSection {
    #[serde(default = "default_key_file")]
    pub key_file: String,
    #[serde(default = "default_users_file")]
    pub users_file: String,
    #[serde(default = "default_download_dir")]
    pub download_dir: String,
}

impl Default for StorageSection {
    fn default() -> Self {
        Self {
            key_file: default_key_file(),
            users_file: default_users_file(),
            download_dir: default_download_dir(),
        }
    }
}

fn default_host() -> String {
    "localhost".to_string()
}
fn default_port() -> u16 {
    1060
}
fn default_max_sessions() -> usize {
    3
}
fn default_promote_delay_ms() -> u64 {
    100
}
fn default_outbound_queue() -> usize {
    256
}
fn default_key_file() -> String {
    "~/.rchat/server.key".to_string()
}
fn default_users_file() -> String {
    "~/.rchat/users.json".to_string()
}
fn default_download_dir() -> String {
    "~/.rchat/server-downloads".to_string()
}

/// Values given on the command line; each one wins over the file.
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub max_sessions: Option<usize>,
    pub max_queue: Option<usize>,
    pub key_file: Option<String>,
    pub users_file: Option<String>,
    pub download_dir: Option<String>,
}

/// Resolved server configuration (all paths expanded, CLI overrides applied).
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Admission gate capacity.
    pub max_sessions: usize,
    /// Longest allowed admission queue; `None` queues without bound.
    pub max_queue: Option<usize>,
    /// Pause between `SERVER_CONNECTED` and the key line for promoted clients.
    pub promote_delay: Duration,
    /// Capacity of each session's outbound frame queue.
    pub outbound_queue: usize,
    pub key_path: PathBuf,
    pub users_path: PathBuf,
    pub download_dir: PathBuf,
}

impl ServerConfig {
    /// Load config from TOML file, then apply CLI overrides.
    pub fn load(config_path: Option<&Path>, overrides: ConfigOverrides) -> ChatResult<Self> {
        let file_config = match config_path {
            Some(path) => {
                let expanded = expand_tilde(path);
                if expanded.exists() {
                    info!(path = %expanded.display(), "loading config file");
                    let content = std::fs::read_to_string(&expanded)?;
                    toml::from_str::<ConfigFile>(&content)
                        .map_err(|e| ChatError::Other(format!("config parse error: {e}")))?
                } else {
                    info!(path = %expanded.display(), "config file not found, using defaults");
                    ConfigFile::default()
                }
            }
            None => ConfigFile::default(),
        };

        let server = file_config.server;
        let storage = file_config.storage;

        let max_sessions = overrides.max_sessions.unwrap_or(server.max_sessions);
        if max_sessions == 0 {
            return Err(ChatError::Other("max_sessions must be at least 1".into()));
        }
        let max_queue = match overrides.max_queue.unwrap_or(server.max_queue) {
            0 => None,
            n => Some(n),
        };

        Ok(Self {
            host: overrides.host.unwrap_or(server.host),
            port: overrides.port.unwrap_or(server.port),
            max_sessions,
            max_queue,
            promote_delay: Duration::from_millis(server.promote_delay_ms),
            outbound_queue: server.outbound_queue.max(1),
            key_path: expand_tilde_str(&overrides.key_file.unwrap_or(storage.key_file)),
            users_path: expand_tilde_str(&overrides.users_file.unwrap_or(storage.users_file)),
            download_dir: expand_tilde_str(
                &overrides.download_dir.unwrap_or(storage.download_dir),
            ),
        })
    }
}

/// Expand `~` to the user's home directory.
pub fn expand_tilde(path: &Path) -> PathBuf {
    let s = path.to_string_lossy();
    expand_tilde_str(&s)
}

fn expand_tilde_str(s: &str) -> PathBuf {
    if let Some(rest) = s.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(s)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_without_file() {
        let config = ServerConfig::load(None, ConfigOverrides::default()).unwrap();
        assert_eq!(config.port, 1060);
        assert_eq!(config.max_sessions, 3);
        assert_eq!(config.max_queue, None);
        assert_eq!(config.promote_delay, Duration::from_millis(100));
        assert_eq!(config.outbound_queue, 256);
    }

    #[test]
    fn file_then_overrides() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("server.toml");
        std::fs::write(
            &path,
            r#"
[server]
port = 2000
max_sessions = 5
max_queue = 10

[storage]
users_file = "/srv/rchat/users.json"
"#,
        )
        .unwrap();

        let config = ServerConfig::load(
            Some(&path),
            ConfigOverrides {
                port: Some(3000),
                ..Default::default()
            },
        )
        .unwrap();
        assert_eq!(config.port, 3000);
        assert_eq!(config.max_sessions, 5);
        assert_eq!(config.max_queue, Some(10));
        assert_eq!(config.users_path, PathBuf::from("/srv/rchat/users.json"));
    }

    #[test]
    fn missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = ServerConfig::load(
            Some(&dir.path().join("nope.toml")),
            ConfigOverrides::default(),
        )
        .unwrap();
        assert_eq!(config.host, "localhost");
    }

    #[test]
    fn zero_capacity_rejected() {
        let overrides = ConfigOverrides {
            max_sessions: Some(0),
            ..Default::default()
        };
        assert!(ServerConfig::load(None, overrides).is_err());
    }

    #[test]
    fn bad_toml_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("server.toml");
        std::fs::write(&path, "[server\nport = ").unwrap();
        assert!(ServerConfig::load(Some(&path), ConfigOverrides::default()).is_err());
    }

    #[test]
    fn tilde_expands_to_home() {
        if let Some(home) = dirs::home_dir() {
            assert_eq!(expand_tilde_str("~/x/y"), home.join("x/y"));
        }
        assert_eq!(expand_tilde_str("/abs"), PathBuf::from("/abs"));
    }
}
