//! Directory-backed key-value store: one `<key>.json` file per top-level key.

use crate::error::StorageError;
use crate::host::KeyValueStore;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone)]
pub struct JsonFileStore {
    dir: PathBuf,
}

impl JsonFileStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, key: &str) -> Result<PathBuf, StorageError> {
        let valid = !key.is_empty()
            && key
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
        if !valid {
            return Err(StorageError::Write(format!("invalid storage key: {key:?}")));
        }
        Ok(self.dir.join(format!("{key}.json")))
    }
}

#[async_trait]
impl KeyValueStore for JsonFileStore {
    async fn get(&self, keys: &[&str]) -> Result<HashMap<String, Value>, StorageError> {
        let mut found = HashMap::new();
        for key in keys {
            let path = self.path_for(key)?;
            let bytes = match tokio::fs::read(&path).await {
                Ok(bytes) => bytes,
                Err(err) if err.kind() == ErrorKind::NotFound => continue,
                Err(err) => return Err(err.into()),
            };
            if bytes.is_empty() {
                continue;
            }
            let value = serde_json::from_slice(&bytes).map_err(|e| StorageError::Read {
                key: (*key).to_string(),
                reason: e.to_string(),
            })?;
            found.insert((*key).to_string(), value);
        }
        Ok(found)
    }

    async fn set(&self, items: HashMap<String, Value>) -> Result<(), StorageError> {
        tokio::fs::create_dir_all(&self.dir).await?;
        for (key, value) in items {
            let path = self.path_for(&key)?;
            let tmp_path = path.with_extension("json.tmp");
            let bytes = serde_json::to_vec_pretty(&value)
                .map_err(|e| StorageError::Write(e.to_string()))?;
            tokio::fs::write(&tmp_path, bytes).await?;
            tokio::fs::rename(&tmp_path, &path).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn keys_are_stored_independently() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileStore::new(dir.path().join("state"));
        store
            .set(HashMap::from([
                ("pinnedTabs".to_string(), json!({})),
                ("defaultRecentFilter".to_string(), json!(true)),
            ]))
            .await
            .unwrap();

        assert!(dir.path().join("state/pinnedTabs.json").exists());
        assert!(dir.path().join("state/defaultRecentFilter.json").exists());

        let got = store
            .get(&["defaultRecentFilter", "scrollPositions"])
            .await
            .unwrap();
        assert_eq!(got.get("defaultRecentFilter"), Some(&json!(true)));
        assert!(!got.contains_key("scrollPositions"));
    }

    #[tokio::test]
    async fn corrupt_file_reports_key() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("persistentTabTree.json"), b"{oops").unwrap();
        let store = JsonFileStore::new(dir.path());
        let err = store.get(&["persistentTabTree"]).await.unwrap_err();
        assert!(matches!(err, StorageError::Read { ref key, .. } if key == "persistentTabTree"));
    }

    #[tokio::test]
    async fn path_like_keys_are_refused() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileStore::new(dir.path());
        let err = store
            .set(HashMap::from([("../escape".to_string(), json!(1))]))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("invalid storage key"));
    }
}
