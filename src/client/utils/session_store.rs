use std::fs;
use std::path::PathBuf;

use anyhow::Result;
use keyring::Entry;
use log::warn;

use crate::client::config::ClientConfig;

const SERVICE: &str = "workhub_sync";
const USER: &str = "workhub_session";

/// Opaque bearer-token provider behind the channel handshake and the REST
/// Authorization header. Tokens live in the OS keyring; headless machines
/// can opt into a plain-file fallback via `KEYRING_FALLBACK=true`.
pub struct SessionStore {
    use_keyring: bool,
    fallback_path: Option<PathBuf>,
}

impl SessionStore {
    pub fn new(config: &ClientConfig) -> Self {
        Self {
            use_keyring: true,
            fallback_path: config
                .keyring_fallback
                .then(|| PathBuf::from("data").join("session_token.txt")),
        }
    }

    #[cfg(test)]
    fn file_backed(dir: &std::path::Path) -> Self {
        Self {
            use_keyring: false,
            fallback_path: Some(dir.join("session_token.txt")),
        }
    }

    fn entry(&self) -> Entry {
        Entry::new(SERVICE, USER)
    }

    /// Persist the token for later runs.
    pub fn save(&self, token: &str) -> Result<()> {
        if self.use_keyring && self.entry().set_password(token).is_ok() {
            return Ok(());
        }
        match &self.fallback_path {
            Some(path) => {
                if let Some(parent) = path.parent() {
                    fs::create_dir_all(parent)?;
                }
                fs::write(path, token)?;
                // warn in logs but never print the token itself
                warn!("[SESSION_STORE] keyring unavailable, token persisted to fallback file");
                Ok(())
            }
            // do not persist to disk silently; the caller decides what to do
            None => Err(anyhow::anyhow!(
                "keyring unavailable and file fallback disabled"
            )),
        }
    }

    /// Last stored token, if any.
    pub fn load(&self) -> Option<String> {
        if self.use_keyring {
            if let Ok(token) = self.entry().get_password() {
                if !token.trim().is_empty() {
                    return Some(token);
                }
            }
        }
        let path = self.fallback_path.as_ref()?;
        let token = fs::read_to_string(path).ok()?.trim().to_string();
        if token.is_empty() {
            None
        } else {
            Some(token)
        }
    }

    /// Drop the stored token, e.g. after the server rejects it as expired.
    pub fn clear(&self) -> Result<()> {
        if self.use_keyring {
            let _ = self.entry().delete_password();
        }
        if let Some(path) = &self.fallback_path {
            if path.exists() {
                fs::remove_file(path)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{SystemTime, UNIX_EPOCH};

    fn temp_store() -> (SessionStore, PathBuf) {
        let suffix = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock")
            .as_nanos();
        let root = std::env::temp_dir().join(format!("workhub_session_test_{suffix}"));
        fs::create_dir_all(&root).expect("mkdir");
        (SessionStore::file_backed(&root), root)
    }

    #[test]
    fn save_load_clear_roundtrip_on_file_fallback() {
        let (store, root) = temp_store();
        assert!(store.load().is_none());

        store.save("tok-abc").unwrap();
        assert_eq!(store.load().as_deref(), Some("tok-abc"));

        store.clear().unwrap();
        assert!(store.load().is_none());
        fs::remove_dir_all(root).expect("cleanup");
    }

    #[test]
    fn save_fails_with_no_backend_available() {
        let store = SessionStore {
            use_keyring: false,
            fallback_path: None,
        };
        assert!(store.save("tok").is_err());
        assert!(store.load().is_none());
        store.clear().unwrap();
    }

    #[test]
    fn blank_fallback_contents_load_as_none() {
        let (store, root) = temp_store();
        fs::write(root.join("session_token.txt"), "  \n").unwrap();
        assert!(store.load().is_none());
        fs::remove_dir_all(root).expect("cleanup");
    }
}
