//! In-process storage backend. Nothing survives a restart.

use crate::{
    models::{metadata::Metadata, upload::Upload},
    services::storage_service::{StorageError, StorageResult, UploadStore},
};
use async_trait::async_trait;
use std::{
    collections::HashMap,
    path::PathBuf,
    sync::{Mutex, MutexGuard},
};

struct Entry {
    upload: Upload,
    data: Vec<u8>,
}

#[derive(Default)]
pub struct MemoryStore {
    uploads: Mutex<HashMap<String, Entry>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Entry>> {
        self.uploads
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl UploadStore for MemoryStore {
    async fn create_upload(
        &self,
        id: &str,
        length: u64,
        metadata: &Metadata,
    ) -> StorageResult<Upload> {
        let mut uploads = self.lock();
        if uploads.contains_key(id) {
            return Err(StorageError::UploadAlreadyExists(id.to_string()));
        }
        let upload = Upload::new(id, length, metadata.clone());
        uploads.insert(
            id.to_string(),
            Entry {
                upload: upload.clone(),
                data: Vec::new(),
            },
        );
        Ok(upload)
    }

    async fn get_upload(&self, id: &str) -> StorageResult<Option<Upload>> {
        Ok(self.lock().get(id).map(|entry| entry.upload.clone()))
    }

    async fn update_offset(&self, id: &str, offset: u64) -> StorageResult<()> {
        let mut uploads = self.lock();
        let entry = uploads
            .get_mut(id)
            .ok_or_else(|| StorageError::UploadNotFound(id.to_string()))?;
        entry.upload.offset = offset;
        Ok(())
    }

    async fn write_chunk(&self, id: &str, offset: u64, data: &[u8]) -> StorageResult<()> {
        let mut uploads = self.lock();
        let entry = uploads
            .get_mut(id)
            .ok_or_else(|| StorageError::UploadNotFound(id.to_string()))?;
        let start = usize::try_from(offset).map_err(|_| StorageError::OutOfRange(offset))?;
        let end = start + data.len();
        if entry.data.len() < end {
            entry.data.resize(end, 0);
        }
        entry.data[start..end].copy_from_slice(data);
        Ok(())
    }

    async fn read_all(&self, id: &str) -> StorageResult<Vec<u8>> {
        self.lock()
            .get(id)
            .map(|entry| entry.data.clone())
            .ok_or_else(|| StorageError::UploadNotFound(id.to_string()))
    }

    async fn delete_upload(&self, id: &str) -> StorageResult<()> {
        self.lock()
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| StorageError::UploadNotFound(id.to_string()))
    }

    fn file_path(&self, _id: &str) -> Option<PathBuf> {
        None
    }

    async fn ping(&self) -> StorageResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn overlapping_writes_overwrite_in_place() {
        let store = MemoryStore::new();
        store.create_upload("m", 6, &Metadata::new()).await.unwrap();
        store.write_chunk("m", 0, b"abcdef").await.unwrap();
        store.write_chunk("m", 2, b"XY").await.unwrap();
        assert_eq!(store.read_all("m").await.unwrap(), b"abXYef");
    }

    #[tokio::test]
    async fn delete_is_not_idempotent() {
        let store = MemoryStore::new();
        store.create_upload("d", 1, &Metadata::new()).await.unwrap();
        store.delete_upload("d").await.unwrap();
        assert!(store.is_empty());
        assert!(matches!(
            store.delete_upload("d").await,
            Err(StorageError::UploadNotFound(_))
        ));
        assert!(store.file_path("d").is_none());
    }
}
