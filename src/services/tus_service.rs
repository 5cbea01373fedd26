//! Protocol engine: one request in, one state transition on an upload out.
//!
//! Routing (base path `B`):
//! - `OPTIONS *`       capabilities, no state change
//! - `POST   B`        create upload
//! - `HEAD   B/{id}`   report offset and length
//! - `PATCH  B/{id}`   append bytes at the current offset
//! - `DELETE B/{id}`   terminate upload
//!
//! Every method except OPTIONS must carry the supported `Tus-Resumable`
//! version. Storage failures become 500 responses; nothing here panics on
//! bad input.

use crate::{
    models::metadata::{Metadata, MetadataEncoding},
    protocol::{
        self, CHECKSUM_ALGORITHMS, OFFSET_OCTET_STREAM, TUS_CHECKSUM_ALGORITHM, TUS_EXTENSION,
        TUS_EXTENSIONS, TUS_MAX_SIZE, TUS_RESUMABLE, TUS_VERSION, TUS_VERSION_HEADER,
        TusRequest, TusResponse, UPLOAD_CHECKSUM, UPLOAD_LENGTH, UPLOAD_METADATA, UPLOAD_OFFSET,
    },
    services::storage_service::{StorageError, UploadStore},
};
use axum::http::{Method, StatusCode, header};
use base64::{Engine as _, engine::general_purpose};
use sha1::{Digest, Sha1};
use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Immutable engine settings.
#[derive(Clone, Debug)]
pub struct ServerOptions {
    pub base_path: String,
    /// Largest accepted `Upload-Length`; `None` means unlimited.
    pub max_size: Option<u64>,
    pub version: String,
    pub extensions: Vec<String>,
    pub checksum_algorithms: Vec<String>,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            base_path: "/files".into(),
            max_size: None,
            version: TUS_VERSION.into(),
            extensions: TUS_EXTENSIONS.iter().map(|s| s.to_string()).collect(),
            checksum_algorithms: CHECKSUM_ALGORITHMS.iter().map(|s| s.to_string()).collect(),
        }
    }
}

impl ServerOptions {
    pub fn with_base_path(mut self, base_path: impl Into<String>) -> Self {
        self.base_path = base_path.into();
        self
    }

    /// Zero disables the limit.
    pub fn with_max_size(mut self, max_size: u64) -> Self {
        self.max_size = (max_size > 0).then_some(max_size);
        self
    }
}

/// Largest `Upload-Length` any backend can record (SQLite integer columns).
pub const MAX_UPLOAD_LENGTH: u64 = i64::MAX as u64;

type LockMap = Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>;

/// One request's claim on the lock of an upload id. Dropping it, whether
/// the request finished or its future was abandoned, removes the map entry
/// once no other request refers to it.
struct IdLock<'a> {
    locks: &'a LockMap,
    id: &'a str,
    lock: Arc<tokio::sync::Mutex<()>>,
}

impl Drop for IdLock<'_> {
    fn drop(&mut self) {
        let mut locks = self.locks.lock().unwrap_or_else(|p| p.into_inner());
        // The map and this claim hold the only two references.
        if Arc::strong_count(&self.lock) == 2 {
            locks.remove(self.id);
        }
    }
}

/// Target of an incoming request once the path has been resolved.
enum Route<'a> {
    Options,
    Create,
    Head(&'a str),
    Patch(&'a str),
    Delete(&'a str),
    NotFound,
}

#[derive(Clone)]
pub struct TusService {
    store: Arc<dyn UploadStore>,
    options: Arc<ServerOptions>,
    // One async lock per upload id; PATCH and DELETE hold it for their whole
    // read-check-write sequence.
    locks: Arc<LockMap>,
}

impl TusService {
    pub fn new(store: Arc<dyn UploadStore>, mut options: ServerOptions) -> Self {
        let trimmed = options.base_path.trim_end_matches('/').to_string();
        options.base_path = trimmed;
        Self {
            store,
            options: Arc::new(options),
            locks: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn store(&self) -> &Arc<dyn UploadStore> {
        &self.store
    }

    pub fn options(&self) -> &ServerOptions {
        &self.options
    }

    /// Handle one already-parsed request.
    pub async fn handle_request(&self, req: TusRequest) -> TusResponse {
        info!("received {} request for {}", req.method, req.path);

        if req.method != Method::OPTIONS {
            let version = req.header_str(&TUS_RESUMABLE);
            if version != Some(self.options.version.as_str()) {
                warn!(
                    "invalid Tus-Resumable {:?}, expected {}",
                    version, self.options.version
                );
                return self
                    .tus_response(StatusCode::PRECONDITION_FAILED)
                    .header(TUS_VERSION_HEADER, &self.options.version)
                    .body("Precondition Failed: unsupported TUS version");
            }
        }

        match self.route(&req) {
            Route::Options => self.handle_options(),
            Route::Create => self.handle_create(&req).await,
            Route::Head(id) => self.handle_head(id).await,
            Route::Patch(id) => self.handle_patch(id, &req).await,
            Route::Delete(id) => self.handle_delete(id).await,
            Route::NotFound => {
                warn!("route not found: {} {}", req.method, req.path);
                TusResponse::new(StatusCode::NOT_FOUND).body("Not Found")
            }
        }
    }

    fn route<'a>(&self, req: &'a TusRequest) -> Route<'a> {
        if req.method == Method::OPTIONS {
            return Route::Options;
        }
        let base = self.options.base_path.as_str();
        let path = req.path.split('?').next().unwrap_or_default();

        if path == base || path.strip_suffix('/') == Some(base) {
            return if req.method == Method::POST {
                Route::Create
            } else {
                Route::NotFound
            };
        }

        let Some(id) = path
            .strip_prefix(base)
            .and_then(|rest| rest.strip_prefix('/'))
        else {
            return Route::NotFound;
        };
        if !is_valid_upload_id(id) {
            return Route::NotFound;
        }

        match req.method {
            Method::HEAD => Route::Head(id),
            Method::PATCH => Route::Patch(id),
            Method::DELETE => Route::Delete(id),
            _ => Route::NotFound,
        }
    }

    fn tus_response(&self, status: StatusCode) -> TusResponse {
        TusResponse::new(status).header(TUS_RESUMABLE, &self.options.version)
    }

    fn handle_options(&self) -> TusResponse {
        debug!("handling OPTIONS request");
        let mut resp = self
            .tus_response(StatusCode::NO_CONTENT)
            .header(TUS_VERSION_HEADER, &self.options.version)
            .header(TUS_EXTENSION, self.options.extensions.join(","));
        if let Some(max) = self.options.max_size {
            resp = resp.header(TUS_MAX_SIZE, max.to_string());
        }
        if !self.options.checksum_algorithms.is_empty() {
            resp = resp.header(
                TUS_CHECKSUM_ALGORITHM,
                self.options.checksum_algorithms.join(","),
            );
        }
        resp
    }

    async fn handle_create(&self, req: &TusRequest) -> TusResponse {
        let Some(raw_length) = req.header_str(&UPLOAD_LENGTH) else {
            warn!("missing Upload-Length header");
            return self.bad_request("Missing Upload-Length header");
        };
        let Ok(length) = raw_length.trim().parse::<u64>() else {
            warn!("invalid Upload-Length header: {}", raw_length);
            return self.bad_request("Invalid Upload-Length header");
        };

        let max = self
            .options
            .max_size
            .map_or(MAX_UPLOAD_LENGTH, |max| max.min(MAX_UPLOAD_LENGTH));
        if length > max {
            warn!("upload size {} exceeds maximum {}", length, max);
            return self
                .tus_response(StatusCode::PAYLOAD_TOO_LARGE)
                .body("Upload exceeds maximum size");
        }

        let metadata = req
            .header_str(&UPLOAD_METADATA)
            .map(|raw| Metadata::decode(raw, MetadataEncoding::Utf8))
            .unwrap_or_default();

        let id = Uuid::new_v4().to_string();
        if let Err(err) = self.store.create_upload(&id, length, &metadata).await {
            return self.storage_failure("create", &id, err);
        }
        info!(
            "created upload {} with length {}, {} metadata entries",
            id,
            length,
            metadata.len()
        );

        self.tus_response(StatusCode::CREATED)
            .header(header::LOCATION, format!("{}/{}", self.options.base_path, id))
            .header(UPLOAD_OFFSET, "0")
    }

    async fn handle_head(&self, id: &str) -> TusResponse {
        let upload = match self.store.get_upload(id).await {
            Ok(Some(upload)) => upload,
            Ok(None) => return self.upload_not_found(id),
            Err(err) => return self.storage_failure("head", id, err),
        };
        debug!(
            "HEAD upload {}: offset={}, length={}",
            id, upload.offset, upload.length
        );

        let mut resp = self
            .tus_response(StatusCode::OK)
            .header(UPLOAD_OFFSET, upload.offset.to_string())
            .header(UPLOAD_LENGTH, upload.length.to_string())
            .header(header::CACHE_CONTROL, "no-store");
        // Keys were validated on the way in, so encoding cannot fail here.
        if let Ok(Some(encoded)) = upload.metadata.encode(MetadataEncoding::Utf8) {
            resp = resp.header(UPLOAD_METADATA, encoded);
        }
        resp
    }

    async fn handle_patch(&self, id: &str, req: &TusRequest) -> TusResponse {
        let claim = self.lock_for(id);
        let _guard = claim.lock.lock().await;
        self.apply_patch(id, req).await
    }

    async fn apply_patch(&self, id: &str, req: &TusRequest) -> TusResponse {
        let upload = match self.store.get_upload(id).await {
            Ok(Some(upload)) => upload,
            Ok(None) => return self.upload_not_found(id),
            Err(err) => return self.storage_failure("patch", id, err),
        };

        let content_type = req.header_str(&header::CONTENT_TYPE).unwrap_or_default();
        if content_type != OFFSET_OCTET_STREAM {
            warn!("invalid Content-Type for upload {}: {:?}", id, content_type);
            return self.bad_request("Invalid Content-Type");
        }

        let Some(raw_offset) = req.header_str(&UPLOAD_OFFSET) else {
            warn!("missing Upload-Offset header for upload {}", id);
            return self.bad_request("Missing Upload-Offset header");
        };
        let Ok(offset) = raw_offset.trim().parse::<u64>() else {
            warn!("invalid Upload-Offset header: {}", raw_offset);
            return self.bad_request("Invalid Upload-Offset header");
        };

        if offset != upload.offset {
            warn!(
                "Upload-Offset mismatch for {}: expected {}, got {}",
                id, upload.offset, offset
            );
            return self
                .tus_response(StatusCode::CONFLICT)
                .header(UPLOAD_OFFSET, upload.offset.to_string())
                .body("Upload-Offset mismatch");
        }

        let new_offset = offset + req.body.len() as u64;
        if new_offset > upload.length {
            warn!(
                "chunk for {} would end at {} past Upload-Length {}",
                id, new_offset, upload.length
            );
            return self.bad_request("Chunk exceeds Upload-Length");
        }

        if let Some(raw) = req.header_str(&UPLOAD_CHECKSUM) {
            match self.verify_checksum(raw, &req.body) {
                Ok(true) => {}
                Ok(false) => {
                    warn!("checksum mismatch for upload {} at offset {}", id, offset);
                    return self
                        .tus_response(protocol::checksum_mismatch_status())
                        .body("Checksum mismatch");
                }
                Err(reason) => {
                    warn!("invalid Upload-Checksum header for {}: {}", id, reason);
                    return self.bad_request("Invalid Upload-Checksum header");
                }
            }
        }

        if !req.body.is_empty() {
            if let Err(err) = self.store.write_chunk(id, offset, &req.body).await {
                return self.storage_failure("write", id, err);
            }
            if let Err(err) = self.store.update_offset(id, new_offset).await {
                return self.storage_failure("offset update", id, err);
            }
        }

        info!(
            "PATCH upload {}: wrote {} bytes, new offset {}/{}",
            id,
            req.body.len(),
            new_offset,
            upload.length
        );
        self.tus_response(StatusCode::NO_CONTENT)
            .header(UPLOAD_OFFSET, new_offset.to_string())
    }

    async fn handle_delete(&self, id: &str) -> TusResponse {
        let claim = self.lock_for(id);
        let _guard = claim.lock.lock().await;

        match self.store.get_upload(id).await {
            Ok(Some(_)) => match self.store.delete_upload(id).await {
                Ok(()) | Err(StorageError::UploadNotFound(_)) => {
                    info!("deleted upload {}", id);
                    self.tus_response(StatusCode::NO_CONTENT)
                }
                Err(err) => self.storage_failure("delete", id, err),
            },
            Ok(None) => self.upload_not_found(id),
            Err(err) => self.storage_failure("delete", id, err),
        }
    }

    /// `Ok(false)` on digest mismatch, `Err` for a malformed header.
    fn verify_checksum(&self, header: &str, body: &[u8]) -> Result<bool, String> {
        let (algorithm, encoded) = header
            .trim()
            .split_once(' ')
            .ok_or_else(|| "expected `<algorithm> <base64>`".to_string())?;
        if !self
            .options
            .checksum_algorithms
            .iter()
            .any(|a| a.eq_ignore_ascii_case(algorithm))
        {
            return Err(format!("unsupported algorithm `{}`", algorithm));
        }
        let provided = general_purpose::STANDARD
            .decode(encoded.trim())
            .map_err(|err| format!("bad base64: {}", err))?;
        let computed = Sha1::digest(body);
        Ok(computed.as_slice() == provided.as_slice())
    }

    fn lock_for<'a>(&'a self, id: &'a str) -> IdLock<'a> {
        let mut locks = self.locks.lock().unwrap_or_else(|p| p.into_inner());
        let lock = locks.entry(id.to_string()).or_default().clone();
        IdLock {
            locks: &self.locks,
            id,
            lock,
        }
    }

    fn bad_request(&self, message: &'static str) -> TusResponse {
        self.tus_response(StatusCode::BAD_REQUEST).body(message)
    }

    fn upload_not_found(&self, id: &str) -> TusResponse {
        warn!("upload not found: {}", id);
        self.tus_response(StatusCode::NOT_FOUND)
            .body("Upload not found")
    }

    fn storage_failure(&self, op: &str, id: &str, err: StorageError) -> TusResponse {
        error!("storage failure during {} of upload {}: {}", op, id, err);
        self.tus_response(StatusCode::INTERNAL_SERVER_ERROR)
            .body("Storage failure")
    }
}

/// Ids are generated as UUIDs; anything outside `[A-Za-z0-9_-]` is unknown.
fn is_valid_upload_id(id: &str) -> bool {
    !id.is_empty()
        && id.len() <= 128
        && id
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
}
