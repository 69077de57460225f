//! Storage backends for the shared rate limit record

use crate::error::{ParleyError, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::io::Write;
use std::path::{Path, PathBuf};

/// Holds one serialized record
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Current record, `None` if nothing is stored
    async fn load(&self) -> Result<Option<String>>;

    /// Overwrite the record unconditionally
    async fn store(&self, value: &str) -> Result<()>;

    /// Write `value` only if the stored record still equals `expected`.
    /// Returns whether the write happened.
    async fn compare_and_swap(&self, expected: Option<&str>, value: &str) -> Result<bool>;

    /// Backend name for logs
    fn name(&self) -> &'static str;
}

/// Process-local store with exact compare-and-swap
#[derive(Debug, Default)]
pub struct MemoryStore {
    value: Mutex<Option<String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StateStore for MemoryStore {
    async fn load(&self) -> Result<Option<String>> {
        Ok(self.value.lock().clone())
    }

    async fn store(&self, value: &str) -> Result<()> {
        *self.value.lock() = Some(value.to_string());
        Ok(())
    }

    async fn compare_and_swap(&self, expected: Option<&str>, value: &str) -> Result<bool> {
        let mut current = self.value.lock();
        if current.as_deref() != expected {
            return Ok(false);
        }
        *current = Some(value.to_string());
        Ok(true)
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

/// JSON file shared by every process on the host.
///
/// Writes replace the file atomically. Compare-and-swap re-reads before
/// writing, so a writer can still slip in between the two steps.
#[derive(Debug, Clone)]
pub struct FileStore {
    path: PathBuf,
}

impl FileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn write_atomically(path: &Path, value: &str) -> std::io::Result<()> {
    let dir = match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir,
        _ => Path::new("."),
    };
    std::fs::create_dir_all(dir)?;

    let mut file = tempfile::NamedTempFile::new_in(dir)?;
    file.write_all(value.as_bytes())?;
    file.flush()?;
    file.persist(path).map_err(|e| e.error)?;
    Ok(())
}

#[async_trait]
impl StateStore for FileStore {
    async fn load(&self) -> Result<Option<String>> {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(content) => Ok(Some(content)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(ParleyError::Store(format!(
                "Failed to read {:?}: {}",
                self.path, e
            ))),
        }
    }

    async fn store(&self, value: &str) -> Result<()> {
        let path = self.path.clone();
        let value = value.to_string();
        tokio::task::spawn_blocking(move || write_atomically(&path, &value))
            .await
            .map_err(|e| ParleyError::Internal(format!("State writer task failed: {}", e)))?
            .map_err(|e| ParleyError::Store(format!("Failed to write {:?}: {}", self.path, e)))
    }

    async fn compare_and_swap(&self, expected: Option<&str>, value: &str) -> Result<bool> {
        let current = self.load().await?;
        if current.as_deref() != expected {
            return Ok(false);
        }
        self.store(value).await?;
        Ok(true)
    }

    fn name(&self) -> &'static str {
        "file"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_compare_and_swap() {
        let store = MemoryStore::new();
        assert_eq!(store.load().await.unwrap(), None);

        assert!(store.compare_and_swap(None, "a").await.unwrap());
        assert!(!store.compare_and_swap(None, "b").await.unwrap());
        assert!(!store.compare_and_swap(Some("x"), "b").await.unwrap());
        assert!(store.compare_and_swap(Some("a"), "b").await.unwrap());
        assert_eq!(store.load().await.unwrap().as_deref(), Some("b"));
    }

    #[tokio::test]
    async fn test_file_store_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::new(dir.path().join("nested").join("state.json"));

        assert_eq!(store.load().await.unwrap(), None);
        store.store("{\"a\":1}").await.unwrap();
        assert_eq!(store.load().await.unwrap().as_deref(), Some("{\"a\":1}"));

        assert!(!store.compare_and_swap(None, "{}").await.unwrap());
        assert!(store
            .compare_and_swap(Some("{\"a\":1}"), "{}")
            .await
            .unwrap());
        assert_eq!(store.load().await.unwrap().as_deref(), Some("{}"));
    }

    #[tokio::test]
    async fn test_file_stores_share_state() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        let first = FileStore::new(&path);
        let second = FileStore::new(&path);

        first.store("shared").await.unwrap();
        assert_eq!(second.load().await.unwrap().as_deref(), Some("shared"));
    }
}
