//! src/services/storage_service.rs
//!
//! Storage contract for upload records plus the SQLite-backed implementation:
//! durable metadata in SQLite, payload bytes on local disk sharded beneath
//! `base_path/{shard}/{shard}/{id}`.

use crate::models::{metadata::Metadata, upload::Upload};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{FromRow, SqlitePool};
use std::{
    io::{self, ErrorKind, SeekFrom},
    path::{Path, PathBuf},
    sync::Arc,
};
use thiserror::Error;
use tokio::{
    fs::{self, OpenOptions},
    io::{AsyncSeekExt, AsyncWriteExt},
};
use tracing::debug;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("upload `{0}` not found")]
    UploadNotFound(String),
    #[error("upload `{0}` already exists")]
    UploadAlreadyExists(String),
    #[error("invalid upload id")]
    InvalidUploadId,
    #[error("value {0} does not fit the storage column")]
    OutOfRange(u64),
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Serde(#[from] serde_json::Error),
}

pub type StorageResult<T> = Result<T, StorageError>;

/// What the protocol engine needs from a backend.
///
/// Implementations must isolate uploads from each other; the engine
/// serializes mutations of a single id.
#[async_trait]
pub trait UploadStore: Send + Sync {
    /// Create a record with offset 0 and an empty payload.
    async fn create_upload(
        &self,
        id: &str,
        length: u64,
        metadata: &Metadata,
    ) -> StorageResult<Upload>;

    async fn get_upload(&self, id: &str) -> StorageResult<Option<Upload>>;

    async fn update_offset(&self, id: &str, offset: u64) -> StorageResult<()>;

    /// Write `data` at `offset` of the payload.
    async fn write_chunk(&self, id: &str, offset: u64, data: &[u8]) -> StorageResult<()>;

    /// Read the whole payload written so far.
    async fn read_all(&self, id: &str) -> StorageResult<Vec<u8>>;

    /// Remove the record and its payload.
    async fn delete_upload(&self, id: &str) -> StorageResult<()>;

    /// Location of the payload on disk, when the backend has one.
    fn file_path(&self, id: &str) -> Option<PathBuf>;

    /// Cheap liveness check used by readiness reporting.
    async fn ping(&self) -> StorageResult<()>;
}

const SCHEMA: &str = include_str!("../../migrations/0001_init.sql");

#[derive(FromRow)]
struct UploadRow {
    id: String,
    upload_length: i64,
    upload_offset: i64,
    metadata: Option<String>,
    created_at: DateTime<Utc>,
}

impl TryFrom<UploadRow> for Upload {
    type Error = StorageError;

    fn try_from(row: UploadRow) -> StorageResult<Self> {
        let metadata = match row.metadata.as_deref() {
            Some(raw) if !raw.is_empty() => serde_json::from_str(raw)?,
            _ => Metadata::new(),
        };
        Ok(Upload {
            id: row.id,
            length: row.upload_length.max(0) as u64,
            offset: row.upload_offset.max(0) as u64,
            metadata,
            created_at: row.created_at,
        })
    }
}

/// SQLite metadata + on-disk payloads.
#[derive(Clone)]
pub struct SqliteStore {
    /// Shared SQLite connection pool used for metadata operations.
    pub db: Arc<SqlitePool>,

    /// Base directory on disk where upload payloads are stored.
    pub base_path: PathBuf,
}

impl SqliteStore {
    pub fn new(db: Arc<SqlitePool>, base_path: impl Into<PathBuf>) -> Self {
        Self {
            db,
            base_path: base_path.into(),
        }
    }

    /// Apply the embedded schema. Safe to run repeatedly.
    pub async fn migrate(&self) -> StorageResult<()> {
        let statements = SCHEMA
            .split(';')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .collect::<Vec<_>>();

        debug!("running {} migration statements", statements.len());
        for stmt in statements {
            sqlx::query(stmt).execute(&*self.db).await?;
        }
        Ok(())
    }

    /// Ids are generated server side, so anything path-like is refused.
    fn ensure_id_safe(id: &str) -> StorageResult<()> {
        if id.is_empty()
            || id.len() > 128
            || !id
                .bytes()
                .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
        {
            return Err(StorageError::InvalidUploadId);
        }
        Ok(())
    }

    /// Two-level shard directories from MD5(id), lowercase hex.
    fn upload_shards(id: &str) -> (String, String) {
        let digest = md5::compute(id);
        (format!("{:02x}", digest[0]), format!("{:02x}", digest[1]))
    }

    fn payload_path(&self, id: &str) -> PathBuf {
        let (shard_a, shard_b) = Self::upload_shards(id);
        let mut path = self.base_path.clone();
        path.push(shard_a);
        path.push(shard_b);
        path.push(id);
        path
    }

    /// Remove empty shard directories up to `base_path`.
    async fn prune_empty_dirs(&self, start: &Path) {
        let mut current = start.to_path_buf();
        while current.starts_with(&self.base_path) && current != self.base_path {
            match fs::remove_dir(&current).await {
                Ok(_) => match current.parent() {
                    Some(parent) => current = parent.to_path_buf(),
                    None => break,
                },
                Err(err) if err.kind() == ErrorKind::NotFound => break,
                Err(err) if err.kind() == ErrorKind::DirectoryNotEmpty => break,
                Err(err) => {
                    debug!("failed to prune directory {}: {}", current.display(), err);
                    break;
                }
            }
        }
    }
}

fn to_column(value: u64) -> StorageResult<i64> {
    i64::try_from(value).map_err(|_| StorageError::OutOfRange(value))
}

#[async_trait]
impl UploadStore for SqliteStore {
    async fn create_upload(
        &self,
        id: &str,
        length: u64,
        metadata: &Metadata,
    ) -> StorageResult<Upload> {
        Self::ensure_id_safe(id)?;
        let upload = Upload::new(id, length, metadata.clone());
        let metadata_json = serde_json::to_string(metadata)?;

        let file_path = self.payload_path(id);
        if let Some(parent) = file_path.parent() {
            fs::create_dir_all(parent).await?;
        }

        let inserted = sqlx::query(
            "INSERT INTO uploads (id, upload_length, upload_offset, metadata, completed, created_at)
             VALUES (?, ?, 0, ?, ?, ?)",
        )
        .bind(id)
        .bind(to_column(length)?)
        .bind(&metadata_json)
        .bind(upload.is_complete())
        .bind(upload.created_at)
        .execute(&*self.db)
        .await;

        match inserted {
            Ok(_) => {}
            Err(err) if is_unique_violation(&err) => {
                return Err(StorageError::UploadAlreadyExists(id.to_string()));
            }
            Err(err) => return Err(StorageError::Sqlx(err)),
        }

        if let Err(err) = fs::File::create(&file_path).await {
            let _ = sqlx::query("DELETE FROM uploads WHERE id = ?")
                .bind(id)
                .execute(&*self.db)
                .await;
            return Err(StorageError::Io(err));
        }

        debug!("created payload file {}", file_path.display());
        Ok(upload)
    }

    async fn get_upload(&self, id: &str) -> StorageResult<Option<Upload>> {
        if Self::ensure_id_safe(id).is_err() {
            return Ok(None);
        }
        let row = sqlx::query_as::<_, UploadRow>(
            "SELECT id, upload_length, upload_offset, metadata, created_at
             FROM uploads WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&*self.db)
        .await?;

        row.map(Upload::try_from).transpose()
    }

    async fn update_offset(&self, id: &str, offset: u64) -> StorageResult<()> {
        let offset = to_column(offset)?;
        let result = sqlx::query(
            "UPDATE uploads
             SET upload_offset = ?, completed = (? >= upload_length)
             WHERE id = ?",
        )
        .bind(offset)
        .bind(offset)
        .bind(id)
        .execute(&*self.db)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StorageError::UploadNotFound(id.to_string()));
        }
        Ok(())
    }

    async fn write_chunk(&self, id: &str, offset: u64, data: &[u8]) -> StorageResult<()> {
        Self::ensure_id_safe(id)?;
        let file_path = self.payload_path(id);
        if let Some(parent) = file_path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .open(&file_path)
            .await?;
        file.seek(SeekFrom::Start(offset)).await?;
        file.write_all(data).await?;
        file.flush().await?;
        file.sync_data().await?;
        Ok(())
    }

    async fn read_all(&self, id: &str) -> StorageResult<Vec<u8>> {
        Self::ensure_id_safe(id)?;
        let file_path = self.payload_path(id);
        fs::read(&file_path).await.map_err(|err| {
            if err.kind() == ErrorKind::NotFound {
                StorageError::UploadNotFound(id.to_string())
            } else {
                StorageError::Io(err)
            }
        })
    }

    async fn delete_upload(&self, id: &str) -> StorageResult<()> {
        Self::ensure_id_safe(id)?;
        let result = sqlx::query("DELETE FROM uploads WHERE id = ?")
            .bind(id)
            .execute(&*self.db)
            .await?;

        if result.rows_affected() == 0 {
            return Err(StorageError::UploadNotFound(id.to_string()));
        }

        let file_path = self.payload_path(id);
        match fs::remove_file(&file_path).await {
            Ok(_) => debug!("removed payload file {}", file_path.display()),
            Err(err) if err.kind() == ErrorKind::NotFound => {
                debug!("file {} already missing", file_path.display());
            }
            Err(err) => return Err(StorageError::Io(err)),
        }

        if let Some(parent) = file_path.parent() {
            self.prune_empty_dirs(parent).await;
        }
        Ok(())
    }

    fn file_path(&self, id: &str) -> Option<PathBuf> {
        Self::ensure_id_safe(id).ok()?;
        Some(self.payload_path(id))
    }

    async fn ping(&self) -> StorageResult<()> {
        sqlx::query_scalar::<_, i64>("SELECT 1")
            .fetch_one(&*self.db)
            .await?;
        fs::metadata(&self.base_path).await?;
        Ok(())
    }
}

/// Return true if SQLx error indicates a unique constraint violation.
fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(
        err,
        sqlx::Error::Database(db_err) if db_err.message().to_ascii_lowercase().contains("unique")
    )
}
