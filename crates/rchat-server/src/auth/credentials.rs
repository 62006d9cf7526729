//! User credential store.
//!
//! Passwords are kept as `SHA-256(salt || password)` with a random 16-byte
//! salt per user, both hex-encoded, in a JSON map persisted after every
//! successful registration.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use rand::RngCore;
use rchat_core::{ChatError, ChatResult};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use tracing::{debug, info};

const SALT_LEN: usize = 16;

/// Looks up and records username/password pairs.
pub trait CredentialStore: Send + Sync {
    /// Create an account. `Ok(false)` if the name is taken or unusable.
    fn register(&self, username: &str, password: &str) -> ChatResult<bool>;

    /// `Ok(true)` only for a known user with the matching password.
    fn authenticate(&self, username: &str, password: &str) -> ChatResult<bool>;
}

/// Stored form of one user's password.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct CredentialRecord {
    salt: String,
    hash: String,
}

impl CredentialRecord {
    fn new(password: &str) -> Self {
        let mut salt = [0u8; SALT_LEN];
        rand::thread_rng().fill_bytes(&mut salt);
        Self {
            hash: hex::encode(hash_password(&salt, password)),
            salt: hex::encode(salt),
        }
    }

    /// Digest comparison takes the same time wherever the first differing
    /// byte is.
    fn matches(&self, password: &str) -> bool {
        let (Ok(salt), Ok(stored)) = (hex::decode(&self.salt), hex::decode(&self.hash)) else {
            return false;
        };
        hash_password(&salt, password).ct_eq(&stored).into()
    }
}

fn hash_password(salt: &[u8], password: &str) -> Vec<u8> {
    let mut hasher = Sha256::new();
    hasher.update(salt);
    hasher.update(password.as_bytes());
    hasher.finalize().to_vec()
}

/// Whether a name can be registered.
///
/// Names are colon-free (the auth frame separator) and usable as a single
/// directory component, since received files are stored per user.
pub fn is_valid_username(username: &str) -> bool {
    !username.is_empty()
        && username != "."
        && username != ".."
        && !username
            .chars()
            .any(|c| c == ':' || c == '/' || c == '\\' || c.is_control())
}

/// JSON-file backed store. Without a path it lives in memory only.
#[derive(Debug)]
pub struct FileCredentialStore {
    path: Option<PathBuf>,
    users: Mutex<HashMap<String, CredentialRecord>>,
}

impl FileCredentialStore {
    /// Open the store at `path`, starting empty if the file does not exist.
    pub fn open(path: impl Into<PathBuf>) -> ChatResult<Self> {
        let path = path.into();
        let users = if path.exists() {
            let content = std::fs::read_to_string(&path)?;
            if content.trim().is_empty() {
                HashMap::new()
            } else {
                serde_json::from_str(&content).map_err(|e| {
                    ChatError::Other(format!("cannot parse {}: {e}", path.display()))
                })?
            }
        } else {
            HashMap::new()
        };
        info!(path = %path.display(), users = users.len(), "credential store loaded");
        Ok(Self {
            path: Some(path),
            users: Mutex::new(users),
        })
    }

    pub fn in_memory() -> Self {
        Self {
            path: None,
            users: Mutex::new(HashMap::new()),
        }
    }

    pub fn len(&self) -> usize {
        self.users().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn users(&self) -> MutexGuard<'_, HashMap<String, CredentialRecord>> {
        self.users.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Write the whole map through a temp file so readers never see half of it.
    fn save(path: &Path, users: &HashMap<String, CredentialRecord>) -> ChatResult<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let json = serde_json::to_vec_pretty(users)
            .map_err(|e| ChatError::Other(format!("cannot encode credentials: {e}")))?;
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, json)?;
        std::fs::rename(&tmp, path)?;
        Ok(())
    }
}

impl CredentialStore for FileCredentialStore {
    fn register(&self, username: &str, password: &str) -> ChatResult<bool> {
        if !is_valid_username(username) || password.is_empty() {
            debug!(username, "rejecting unusable credentials");
            return Ok(false);
        }

        let mut users = self.users();
        if users.contains_key(username) {
            return Ok(false);
        }
        users.insert(username.to_string(), CredentialRecord::new(password));

        if let Some(path) = &self.path {
            if let Err(e) = Self::save(path, &users) {
                users.remove(username);
                return Err(e);
            }
        }
        info!(username, "user registered");
        Ok(true)
    }

    fn authenticate(&self, username: &str, password: &str) -> ChatResult<bool> {
        Ok(self
            .users()
            .get(username)
            .is_some_and(|record| record.matches(password)))
    }
}
