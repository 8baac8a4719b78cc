//! Plugin store
//!
//! Persists the latest code text of each plugin at
//! `<root>/<plugin_id>/<entry_file>`.

use std::path::{Path, PathBuf};

use tracing::debug;

use crate::error::{HostError, HostResult};

/// Code text together with the file it was persisted to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredCode {
    pub path: PathBuf,
    pub text: String,
}

/// On-disk plugin code store
#[derive(Debug, Clone)]
pub struct PluginStore {
    root: PathBuf,
    entry_file: String,
}

impl PluginStore {
    pub fn new(root: impl Into<PathBuf>, entry_file: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            entry_file: entry_file.into(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory holding a plugin's files
    pub fn plugin_dir(&self, plugin_id: &str) -> PathBuf {
        self.root.join(plugin_id)
    }

    /// Path of a plugin's entry file
    pub fn entry_path(&self, plugin_id: &str) -> PathBuf {
        self.plugin_dir(plugin_id).join(&self.entry_file)
    }

    /// Write `text` as the plugin's code, replacing any previous version
    pub async fn persist(&self, plugin_id: &str, text: &str) -> HostResult<StoredCode> {
        validate_plugin_id(plugin_id)?;
        let dir = self.plugin_dir(plugin_id);
        tokio::fs::create_dir_all(&dir).await?;

        let path = self.entry_path(plugin_id);
        tokio::fs::write(&path, text).await?;

        // The process runtime may execute the entry file directly
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            tokio::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).await?;
        }

        debug!(plugin_id = %plugin_id, path = %path.display(), "Persisted plugin code");
        Ok(StoredCode {
            path,
            text: text.to_string(),
        })
    }

    /// Read the code persisted by an earlier load, if any
    pub async fn load_existing(&self, plugin_id: &str) -> HostResult<Option<StoredCode>> {
        validate_plugin_id(plugin_id)?;
        let path = self.entry_path(plugin_id);
        match tokio::fs::read_to_string(&path).await {
            Ok(text) => Ok(Some(StoredCode { path, text })),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

/// A plugin id names a directory, so it must be a single plain path component
pub fn validate_plugin_id(plugin_id: &str) -> HostResult<()> {
    let invalid = plugin_id.is_empty()
        || plugin_id == "."
        || plugin_id == ".."
        || plugin_id.contains(['/', '\\', '\0']);
    if invalid {
        return Err(HostError::InvalidPluginId(plugin_id.to_string()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_plugin_id() {
        for ok in ["camera", "my-plugin_2", "v1.0"] {
            assert!(validate_plugin_id(ok).is_ok(), "{ok}");
        }
        for bad in ["", ".", "..", "a/b", "a\\b", "nul\0"] {
            assert!(
                matches!(validate_plugin_id(bad), Err(HostError::InvalidPluginId(_))),
                "{bad:?}"
            );
        }
    }

    #[tokio::test]
    async fn test_persist_then_load_existing() {
        let dir = tempfile::tempdir().unwrap();
        let store = PluginStore::new(dir.path(), "main.py");

        assert!(store.load_existing("cam").await.unwrap().is_none());

        let stored = store.persist("cam", "print('v1')").await.unwrap();
        assert_eq!(stored.path, dir.path().join("cam").join("main.py"));
        store.persist("cam", "print('v2')").await.unwrap();

        let existing = store.load_existing("cam").await.unwrap().unwrap();
        assert_eq!(existing.text, "print('v2')");
    }

    #[tokio::test]
    async fn test_persist_rejects_traversal() {
        let dir = tempfile::tempdir().unwrap();
        let store = PluginStore::new(dir.path(), "main.py");
        assert!(store.persist("..", "x").await.is_err());
    }
}
