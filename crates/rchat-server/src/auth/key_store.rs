//! Persistence of the server's shared chat key.
//!
//! The file holds the base64 key string on one line. It is created with
//! owner-only permissions on first start and reused afterwards, so clients
//! and earlier transcripts stay compatible across restarts.

use std::path::Path;

use rchat_core::{ChatError, ChatResult, Cipher};
use tracing::info;

/// Load the key at `path`, generating and saving a fresh one if absent.
///
/// A present but unreadable or malformed file is an error; it is never
/// silently replaced.
pub fn load_or_create(path: &Path) -> ChatResult<Cipher> {
    if path.exists() {
        let content = std::fs::read_to_string(path)?;
        let cipher = Cipher::from_key_string(content.trim()).map_err(|e| {
            ChatError::Crypto(format!("key file {} is unusable: {e}", path.display()))
        })?;
        info!(path = %path.display(), "loaded chat key");
        return Ok(cipher);
    }

    let cipher = Cipher::generate()?;
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    write_private(path, &format!("{}\n", cipher.key_string()))?;
    info!(path = %path.display(), "generated new chat key");
    Ok(cipher)
}

#[cfg(unix)]
fn write_private(path: &Path, content: &str) -> ChatResult<()> {
    use std::io::Write;
    use std::os::unix::fs::OpenOptionsExt;

    let mut file = std::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .mode(0o600)
        .open(path)?;
    file.write_all(content.as_bytes())?;
    Ok(())
}

#[cfg(not(unix))]
fn write_private(path: &Path, content: &str) -> ChatResult<()> {
    std::fs::write(path, content)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generates_once_then_reuses() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("keys/server.key");

        let first = load_or_create(&path).unwrap();
        let second = load_or_create(&path).unwrap();
        assert_eq!(first.key_string(), second.key_string());

        let sealed = first.encrypt("hello").unwrap();
        assert_eq!(second.decrypt(&sealed).unwrap(), "hello");
    }

    #[cfg(unix)]
    #[test]
    fn key_file_is_owner_only() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("server.key");
        load_or_create(&path).unwrap();
        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn malformed_key_file_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("server.key");
        std::fs::write(&path, "not-a-key").unwrap();
        assert!(matches!(load_or_create(&path), Err(ChatError::Crypto(_))));
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "not-a-key");
    }
}
