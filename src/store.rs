//! Artifact object store addressed by `{reconstruction_id}/{artifact_name}`.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{anyhow, Context, Result};

pub fn artifact_key(reconstruction_id: &str, name: &str) -> String {
    format!("{}/{}", reconstruction_id, name)
}

/// Key-value blob store. `put` overwrites, and a stored object is readable immediately.
pub trait ArtifactStore: Send + Sync {
    fn put(&self, key: &str, body: &[u8]) -> Result<()>;
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;
}

/// `{file_name}.partial` next to `path`, unique per target file.
fn staging_path(path: &Path) -> Option<PathBuf> {
    let mut name = path.file_name()?.to_os_string();
    name.push(".partial");
    Some(path.with_file_name(name))
}

/// Store backed by a directory; keys map to relative paths.
pub struct FsArtifactStore {
    root: PathBuf,
}

impl FsArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl ArtifactStore for FsArtifactStore {
    fn put(&self, key: &str, body: &[u8]) -> Result<()> {
        let path = self.root.join(key);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
        }
        // Readers must never observe a partially written object.
        let staging = staging_path(&path).with_context(|| format!("Invalid artifact key {}", key))?;
        fs::write(&staging, body).with_context(|| format!("Failed to write {}", staging.display()))?;
        fs::rename(&staging, &path).with_context(|| format!("Failed to write {}", path.display()))?;
        Ok(())
    }

    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let path = self.root.join(key);
        if !path.is_file() {
            return Ok(None);
        }
        let bytes = fs::read(&path).with_context(|| format!("Failed to read {}", path.display()))?;
        Ok(Some(bytes))
    }
}

/// In-process store, used by tests and dry runs.
#[derive(Default)]
pub struct MemoryArtifactStore {
    objects: Mutex<BTreeMap<String, Vec<u8>>>,
}

impl MemoryArtifactStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn keys(&self) -> Vec<String> {
        match self.objects.lock() {
            Ok(objects) => objects.keys().cloned().collect(),
            Err(poisoned) => poisoned.into_inner().keys().cloned().collect(),
        }
    }
}

impl ArtifactStore for MemoryArtifactStore {
    fn put(&self, key: &str, body: &[u8]) -> Result<()> {
        self.objects
            .lock()
            .map_err(|_| anyhow!("artifact store lock poisoned"))?
            .insert(key.to_string(), body.to_vec());
        Ok(())
    }

    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self
            .objects
            .lock()
            .map_err(|_| anyhow!("artifact store lock poisoned"))?
            .get(key)
            .cloned())
    }
}
