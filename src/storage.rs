//! Persistent-storage capability consumed by the core.
//!
//! The chunker and the assembler go through this trait so tests can
//! substitute their own backing store.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::TransferError;

#[async_trait]
pub trait Storage: Send + Sync {
    async fn exists(&self, path: &Path) -> bool;
    async fn read_dir(&self, path: &Path) -> Result<Vec<PathBuf>, TransferError>;
    async fn read_file(&self, path: &Path) -> Result<Bytes, TransferError>;
    async fn write_file(&self, path: &Path, data: &[u8]) -> Result<(), TransferError>;
}

/// Filesystem-backed storage used by the binary.
#[derive(Debug, Default, Clone)]
pub struct FsStorage;

#[async_trait]
impl Storage for FsStorage {
    async fn exists(&self, path: &Path) -> bool {
        tokio::fs::try_exists(path).await.unwrap_or(false)
    }

    async fn read_dir(&self, path: &Path) -> Result<Vec<PathBuf>, TransferError> {
        let mut entries = tokio::fs::read_dir(path).await?;
        let mut paths = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            paths.push(entry.path());
        }
        Ok(paths)
    }

    async fn read_file(&self, path: &Path) -> Result<Bytes, TransferError> {
        if !self.exists(path).await {
            return Err(TransferError::FileNotFound(path.to_path_buf()));
        }
        Ok(Bytes::from(tokio::fs::read(path).await?))
    }

    async fn write_file(&self, path: &Path, data: &[u8]) -> Result<(), TransferError> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(path, data).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_write_read_roundtrip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested/out.bin");
        let storage = FsStorage;

        storage.write_file(&path, b"payload").await.unwrap();
        assert!(storage.exists(&path).await);
        assert_eq!(storage.read_file(&path).await.unwrap(), &b"payload"[..]);
    }

    #[tokio::test]
    async fn test_read_missing_file() {
        let dir = TempDir::new().unwrap();
        let storage = FsStorage;
        let err = storage
            .read_file(&dir.path().join("missing.bin"))
            .await
            .unwrap_err();
        assert!(matches!(err, TransferError::FileNotFound(_)));
    }

    #[tokio::test]
    async fn test_read_dir_lists_entries() {
        let dir = TempDir::new().unwrap();
        let storage = FsStorage;
        storage
            .write_file(&dir.path().join("a.txt"), b"a")
            .await
            .unwrap();
        storage
            .write_file(&dir.path().join("b.txt"), b"b")
            .await
            .unwrap();

        let mut names: Vec<_> = storage
            .read_dir(dir.path())
            .await
            .unwrap()
            .into_iter()
            .filter_map(|p| p.file_name().map(|n| n.to_string_lossy().into_owned()))
            .collect();
        names.sort();
        assert_eq!(names, vec!["a.txt", "b.txt"]);
    }
}
