//! Fingerprint → upload URL mapping used to resume across process restarts.
//!
//! Entries may go stale when the server forgets an upload; callers treat a
//! 404 on a stored URL as a miss.

use async_trait::async_trait;
use std::{
    collections::{BTreeMap, HashMap},
    io::{self, ErrorKind},
    path::PathBuf,
    sync::Mutex,
};
use thiserror::Error;
use tokio::{fs, sync::Mutex as AsyncMutex};
use tracing::{debug, warn};
use uuid::Uuid;

pub const DEFAULT_URL_STORE_PATH: &str = ".tus_urls.json";

#[derive(Debug, Error)]
pub enum UrlStoreError {
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Serde(#[from] serde_json::Error),
}

#[async_trait]
pub trait UrlStore: Send + Sync {
    async fn get(&self, fingerprint: &str) -> Result<Option<String>, UrlStoreError>;
    async fn set(&self, fingerprint: &str, url: &str) -> Result<(), UrlStoreError>;
    async fn remove(&self, fingerprint: &str) -> Result<(), UrlStoreError>;
}

/// JSON object file, rewritten on every change.
pub struct FileUrlStore {
    path: PathBuf,
    // Serializes read-modify-write cycles within this process.
    write_lock: AsyncMutex<()>,
}

impl FileUrlStore {
    /// Open (creating an empty map if needed) the store at `path`.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self, UrlStoreError> {
        let store = Self {
            path: path.into(),
            write_lock: AsyncMutex::new(()),
        };
        if fs::metadata(&store.path).await.is_err() {
            store.save(&BTreeMap::new()).await?;
        }
        Ok(store)
    }

    /// Missing or corrupt files read as an empty map.
    async fn load(&self) -> BTreeMap<String, String> {
        match fs::read(&self.path).await {
            Ok(bytes) => serde_json::from_slice(&bytes).unwrap_or_else(|err| {
                warn!("ignoring unreadable url store {}: {}", self.path.display(), err);
                BTreeMap::new()
            }),
            Err(err) if err.kind() == ErrorKind::NotFound => BTreeMap::new(),
            Err(err) => {
                warn!("could not read url store {}: {}", self.path.display(), err);
                BTreeMap::new()
            }
        }
    }

    async fn save(&self, data: &BTreeMap<String, String>) -> Result<(), UrlStoreError> {
        let json = serde_json::to_vec_pretty(data)?;
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).await?;
        }
        let file_name = self
            .path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let tmp_path = self
            .path
            .with_file_name(format!(".{}.tmp-{}", file_name, Uuid::new_v4()));
        fs::write(&tmp_path, json).await?;
        if let Err(err) = fs::rename(&tmp_path, &self.path).await {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(UrlStoreError::Io(err));
        }
        Ok(())
    }
}

#[async_trait]
impl UrlStore for FileUrlStore {
    async fn get(&self, fingerprint: &str) -> Result<Option<String>, UrlStoreError> {
        Ok(self.load().await.remove(fingerprint))
    }

    async fn set(&self, fingerprint: &str, url: &str) -> Result<(), UrlStoreError> {
        let _guard = self.write_lock.lock().await;
        let mut data = self.load().await;
        data.insert(fingerprint.to_string(), url.to_string());
        self.save(&data).await?;
        debug!("stored upload url for {}", fingerprint);
        Ok(())
    }

    async fn remove(&self, fingerprint: &str) -> Result<(), UrlStoreError> {
        let _guard = self.write_lock.lock().await;
        let mut data = self.load().await;
        if data.remove(fingerprint).is_some() {
            self.save(&data).await?;
        }
        Ok(())
    }
}

#[derive(Default)]
pub struct MemoryUrlStore {
    urls: Mutex<HashMap<String, String>>,
}

impl MemoryUrlStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn with<T>(&self, f: impl FnOnce(&mut HashMap<String, String>) -> T) -> T {
        let mut urls = self.urls.lock().unwrap_or_else(|p| p.into_inner());
        f(&mut urls)
    }
}

#[async_trait]
impl UrlStore for MemoryUrlStore {
    async fn get(&self, fingerprint: &str) -> Result<Option<String>, UrlStoreError> {
        Ok(self.with(|urls| urls.get(fingerprint).cloned()))
    }

    async fn set(&self, fingerprint: &str, url: &str) -> Result<(), UrlStoreError> {
        self.with(|urls| urls.insert(fingerprint.to_string(), url.to_string()));
        Ok(())
    }

    async fn remove(&self, fingerprint: &str) -> Result<(), UrlStoreError> {
        self.with(|urls| urls.remove(fingerprint));
        Ok(())
    }
}
