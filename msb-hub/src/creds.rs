//! Credential persistence
//!
//! OAuth tokens live in `CONFIG_DIR/currentCreds-<name>.json`, one file per
//! component, read at init and written only by the adapter that owns them.
//! Writes go through write-temp-then-rename so a crash never leaves a
//! half-written token file, and concurrent writers to the same file are
//! serialized by a per-name mutex.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::debug;

use msb_common::error::Result;

/// Credential files for every configured component.
pub struct CredentialsStore {
    dir: PathBuf,
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl CredentialsStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn path_for(&self, name: &str) -> PathBuf {
        self.dir.join(format!("currentCreds-{}.json", name))
    }

    async fn lock_for(&self, name: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().await;
        locks
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Read a component's credentials; `None` when no file exists yet.
    pub async fn read(&self, name: &str) -> Result<Option<serde_json::Value>> {
        let path = self.path_for(name);
        if !path.exists() {
            return Ok(None);
        }
        let raw = tokio::fs::read_to_string(&path).await?;
        Ok(Some(serde_json::from_str(&raw)?))
    }

    /// Write a component's credentials atomically.
    pub async fn write(&self, name: &str, creds: &serde_json::Value) -> Result<()> {
        let lock = self.lock_for(name).await;
        let _guard = lock.lock().await;

        tokio::fs::create_dir_all(&self.dir).await?;
        let path = self.path_for(name);
        let tmp = temp_path(&path);

        let raw = serde_json::to_string_pretty(creds)?;
        tokio::fs::write(&tmp, raw).await?;
        tokio::fs::rename(&tmp, &path).await?;

        debug!(component = name, path = %path.display(), "credentials written");
        Ok(())
    }

    /// Delete a component's credentials, if any.
    pub async fn remove(&self, name: &str) -> Result<bool> {
        let lock = self.lock_for(name).await;
        let _guard = lock.lock().await;

        let path = self.path_for(name);
        if !path.exists() {
            return Ok(false);
        }
        tokio::fs::remove_file(&path).await?;
        Ok(true)
    }
}

fn temp_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".tmp");
    path.with_file_name(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn write_then_read_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let store = CredentialsStore::new(dir.path());

        let creds = json!({"access_token": "abc", "refresh_token": "def"});
        store.write("spotify", &creds).await.unwrap();

        let read = store.read("spotify").await.unwrap().unwrap();
        assert_eq!(read, creds);

        // Per-component files do not collide
        assert!(store.read("lastfm").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn write_leaves_no_temp_file_behind() {
        let dir = tempfile::tempdir().unwrap();
        let store = CredentialsStore::new(dir.path());

        store.write("spotify", &json!({"t": 1})).await.unwrap();

        let entries: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(entries, vec!["currentCreds-spotify.json".to_string()]);
    }

    #[tokio::test]
    async fn rewrite_replaces_contents() {
        let dir = tempfile::tempdir().unwrap();
        let store = CredentialsStore::new(dir.path());

        store.write("spotify", &json!({"token": "old"})).await.unwrap();
        store.write("spotify", &json!({"token": "new"})).await.unwrap();

        let read = store.read("spotify").await.unwrap().unwrap();
        assert_eq!(read["token"], "new");
    }

    #[tokio::test]
    async fn concurrent_writes_serialize() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(CredentialsStore::new(dir.path()));

        let mut handles = Vec::new();
        for i in 0..8 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store.write("spotify", &json!({"round": i})).await.unwrap();
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        // Whichever write landed last, the file is complete valid JSON
        let read = store.read("spotify").await.unwrap().unwrap();
        assert!(read["round"].is_u64());
    }

    #[tokio::test]
    async fn remove_deletes_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = CredentialsStore::new(dir.path());

        store.write("spotify", &json!({"t": 1})).await.unwrap();
        assert!(store.remove("spotify").await.unwrap());
        assert!(!store.remove("spotify").await.unwrap());
        assert!(store.read("spotify").await.unwrap().is_none());
    }
}
