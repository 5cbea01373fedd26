//! Upload engine: creates uploads and drives whole-file transfers.
//!
//! The server is the source of truth for offsets. Every transfer starts
//! with a HEAD, and the `Upload-Offset` echoed by each PATCH wins over
//! local arithmetic.

use crate::{
    client::{
        retry::RetryPolicy,
        source::{SourceHandle, UploadSource},
        transport::{HttpRequest, HttpTransport, Transport},
        uploader::Uploader,
    },
    errors::UploadError,
    models::{
        metadata::{Metadata, MetadataEncoding},
        stats::UploadStats,
    },
    protocol::{
        self, OFFSET_OCTET_STREAM, TUS_EXTENSION, TUS_MAX_SIZE, TUS_RESUMABLE, TUS_VERSION,
        TUS_VERSION_HEADER, TusResponse, UPLOAD_CHECKSUM, UPLOAD_LENGTH, UPLOAD_METADATA,
        UPLOAD_OFFSET,
    },
    services::url_store::UrlStore,
};
use axum::http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode, header};
use base64::{Engine as _, engine::general_purpose};
use bytes::Bytes;
use reqwest::Url;
use sha1::{Digest, Sha1};
use std::{
    sync::{Arc, RwLock},
    time::Duration,
};
use tracing::{debug, info, warn};

/// Default chunk size: 1 MiB.
pub const DEFAULT_CHUNK_SIZE: usize = 1024 * 1024;

/// Progress hook invoked with a stats snapshot after every chunk.
pub type ProgressFn = dyn Fn(UploadStats) + Send + Sync;

#[derive(Clone, Debug)]
pub struct ClientConfig {
    /// Creation endpoint, e.g. `http://localhost:8080/files`.
    pub base_url: Url,
    pub chunk_size: usize,
    /// Send `Upload-Checksum: sha1 ...` with every chunk.
    pub checksum: bool,
    pub metadata_encoding: MetadataEncoding,
    /// Extra headers sent with every request (e.g. `Authorization`).
    pub headers: HeaderMap,
    /// Remember fingerprint → URL mappings for resuming.
    pub store_url: bool,
    pub retry: RetryPolicy,
    pub timeout: Option<Duration>,
    pub verify_tls: bool,
}

impl ClientConfig {
    pub fn new(base_url: &str) -> Result<Self, UploadError> {
        let mut url = Url::parse(base_url).map_err(|err| {
            UploadError::InvalidConfig(format!("base url `{}`: {}", base_url, err))
        })?;
        let trimmed = url.path().trim_end_matches('/').to_string();
        url.set_path(&trimmed);
        Ok(Self {
            base_url: url,
            chunk_size: DEFAULT_CHUNK_SIZE,
            checksum: true,
            metadata_encoding: MetadataEncoding::Utf8,
            headers: HeaderMap::new(),
            store_url: false,
            retry: RetryPolicy::none(),
            timeout: None,
            verify_tls: true,
        })
    }

    pub fn chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size;
        self
    }

    pub fn checksum(mut self, enabled: bool) -> Self {
        self.checksum = enabled;
        self
    }

    pub fn metadata_encoding(mut self, encoding: MetadataEncoding) -> Self {
        self.metadata_encoding = encoding;
        self
    }

    pub fn header(mut self, name: &str, value: &str) -> Result<Self, UploadError> {
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|err| UploadError::InvalidConfig(format!("header `{}`: {}", name, err)))?;
        let value = HeaderValue::from_str(value)
            .map_err(|err| UploadError::InvalidConfig(format!("header `{}`: {}", name, err)))?;
        self.headers.insert(name, value);
        Ok(self)
    }

    pub fn store_url(mut self, enabled: bool) -> Self {
        self.store_url = enabled;
        self
    }

    pub fn retry(mut self, policy: RetryPolicy) -> Self {
        self.retry = policy;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn verify_tls(mut self, verify: bool) -> Self {
        self.verify_tls = verify;
        self
    }

    fn validate(&self) -> Result<(), UploadError> {
        if self.chunk_size < 1 {
            return Err(UploadError::InvalidConfig(format!(
                "chunk_size must be at least 1 byte, got {}",
                self.chunk_size
            )));
        }
        Ok(())
    }
}

/// Per-call knobs for [`TusClient::upload_file`].
#[derive(Default)]
pub struct UploadOptions {
    pub metadata: Metadata,
    /// Stop once this offset is reached (partial upload).
    pub stop_at: Option<u64>,
    pub progress: Option<Box<ProgressFn>>,
}

impl UploadOptions {
    pub fn metadata(mut self, metadata: Metadata) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn stop_at(mut self, offset: u64) -> Self {
        self.stop_at = Some(offset);
        self
    }

    pub fn progress(mut self, progress: impl Fn(UploadStats) + Send + Sync + 'static) -> Self {
        self.progress = Some(Box::new(progress));
        self
    }
}

#[derive(Clone, Debug)]
pub struct UploadOutcome {
    pub url: String,
    /// Server-confirmed offset when the transfer loop stopped.
    pub offset: u64,
    pub stats: UploadStats,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UploadInfo {
    pub offset: u64,
    pub length: Option<u64>,
    pub complete: bool,
    pub metadata: Metadata,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ServerInfo {
    pub version: String,
    pub extensions: Vec<String>,
    pub max_size: Option<u64>,
}

#[derive(Clone)]
pub struct TusClient {
    transport: Arc<dyn Transport>,
    config: Arc<ClientConfig>,
    url_store: Option<Arc<dyn UrlStore>>,
    headers: Arc<RwLock<HeaderMap>>,
}

impl TusClient {
    /// Client speaking HTTP through reqwest.
    pub fn new(config: ClientConfig) -> Result<Self, UploadError> {
        let transport = HttpTransport::new(config.timeout, config.verify_tls)?;
        Self::with_transport(config, Arc::new(transport))
    }

    pub fn with_transport(
        config: ClientConfig,
        transport: Arc<dyn Transport>,
    ) -> Result<Self, UploadError> {
        config.validate()?;
        let headers = Arc::new(RwLock::new(config.headers.clone()));
        Ok(Self {
            transport,
            config: Arc::new(config),
            url_store: None,
            headers,
        })
    }

    pub fn with_url_store(mut self, store: Arc<dyn UrlStore>) -> Self {
        self.url_store = Some(store);
        self
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Merge `headers` into the passthrough headers of every later request.
    pub fn update_headers(&self, headers: HeaderMap) {
        let mut current = self.headers.write().unwrap_or_else(|p| p.into_inner());
        current.extend(headers);
    }

    pub fn headers(&self) -> HeaderMap {
        self.headers
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }

    /// Upload a whole source, resuming through the URL store when enabled.
    pub async fn upload_file(
        &self,
        source: UploadSource<'_>,
        options: UploadOptions,
    ) -> Result<UploadOutcome, UploadError> {
        let file_name = source.file_name();
        let mut handle = source.open().await?;
        let size = handle.size();

        let mut metadata = options.metadata;
        if let Some(name) = file_name {
            if !metadata.contains_key("filename") {
                metadata.insert("filename", name);
            }
        }
        // Reject bad keys before anything goes over the wire.
        self.encode_metadata(&metadata)?;

        let store = self.url_store.as_ref().filter(|_| self.config.store_url);
        let fingerprint = match store {
            Some(_) => Some(handle.fingerprint().await?),
            None => None,
        };

        let mut url = None;
        if let (Some(store), Some(fp)) = (store, fingerprint.as_deref()) {
            url = self.stored_url(&**store, fp).await?;
        }

        let url = match url {
            Some(url) => {
                info!("resuming stored upload {}", url);
                url
            }
            None => {
                let url = self.create_upload(size, &metadata).await?;
                if let (Some(store), Some(fp)) = (store, fingerprint.as_deref()) {
                    store.set(fp, &url).await?;
                }
                url
            }
        };

        self.transfer(handle, &url, options.stop_at, options.progress.as_deref())
            .await
    }

    /// Continue an existing upload from the offset the server reports.
    pub async fn resume_upload(
        &self,
        source: UploadSource<'_>,
        upload_url: &str,
        progress: Option<&ProgressFn>,
    ) -> Result<UploadOutcome, UploadError> {
        let handle = source.open().await?;
        self.transfer(handle, upload_url, None, progress).await
    }

    /// Manual, chunk-by-chunk control over an existing upload.
    pub async fn create_uploader<'a>(
        &self,
        source: UploadSource<'a>,
        upload_url: &str,
    ) -> Result<Uploader<'a>, UploadError> {
        Uploader::new(self.clone(), source, upload_url).await
    }

    async fn transfer(
        &self,
        handle: SourceHandle<'_>,
        upload_url: &str,
        stop_at: Option<u64>,
        progress: Option<&ProgressFn>,
    ) -> Result<UploadOutcome, UploadError> {
        info!(
            "uploading {} bytes to {} in chunks of {}",
            handle.size(),
            upload_url,
            self.config.chunk_size
        );
        let mut uploader = Uploader::from_handle(self.clone(), handle, upload_url).await?;
        uploader.drive_to_completion(progress, stop_at).await?;

        let stats = uploader.stats();
        info!(
            "upload {} stopped at {}/{} after {:.2}s ({:.2} MiB/s)",
            upload_url,
            uploader.offset(),
            uploader.size(),
            stats.elapsed().as_secs_f64(),
            stats.throughput_mib()
        );
        Ok(UploadOutcome {
            url: uploader.url().to_string(),
            offset: uploader.offset(),
            stats,
        })
    }

    /// Look up a stored URL, dropping it when the server no longer knows it.
    async fn stored_url(
        &self,
        store: &dyn UrlStore,
        fingerprint: &str,
    ) -> Result<Option<String>, UploadError> {
        let Some(url) = store.get(fingerprint).await? else {
            return Ok(None);
        };
        match self.get_offset(&url).await {
            Ok(_) => Ok(Some(url)),
            Err(UploadError::NotFound { .. }) => {
                warn!("stored upload {} is gone, creating a new one", url);
                store.remove(fingerprint).await?;
                Ok(None)
            }
            Err(err) => Err(err),
        }
    }

    /// POST a new upload and return its absolute URL.
    pub async fn create_upload(
        &self,
        length: u64,
        metadata: &Metadata,
    ) -> Result<String, UploadError> {
        let mut headers = self.request_headers();
        insert_header(&mut headers, UPLOAD_LENGTH, &length.to_string())?;
        if let Some(encoded) = self.encode_metadata(metadata)? {
            insert_header(&mut headers, UPLOAD_METADATA, &encoded)?;
        }

        let base = self.config.base_url.clone();
        let resp = self.send(Method::POST, base.clone(), headers, Bytes::new()).await?;
        let resp = check_response(resp, "create upload", base.as_str(), 0)?;
        if resp.status != StatusCode::CREATED {
            return Err(UploadError::Communication(format!(
                "create upload answered {} instead of 201",
                resp.status
            )));
        }

        let location = resp.header_str(&header::LOCATION).ok_or_else(|| {
            UploadError::Communication("server did not return Location header".into())
        })?;
        let url = base.join(location).map_err(|err| {
            UploadError::Communication(format!("invalid Location `{}`: {}", location, err))
        })?;
        info!("created upload {} ({} bytes)", url, length);
        Ok(url.to_string())
    }

    /// Terminate an upload. A 404 means it is already gone and is not an error.
    pub async fn delete_upload(&self, upload_url: &str) -> Result<(), UploadError> {
        let url = self.resolve(upload_url)?;
        let resp = self
            .send(Method::DELETE, url, self.request_headers(), Bytes::new())
            .await?;
        match check_response(resp, "delete upload", upload_url, 0) {
            Ok(_) | Err(UploadError::NotFound { .. }) => Ok(()),
            Err(err) => Err(err),
        }
    }

    /// Current server-side offset of an upload.
    pub async fn get_offset(&self, upload_url: &str) -> Result<u64, UploadError> {
        let url = self.resolve(upload_url)?;
        self.head_offset(&url).await
    }

    pub async fn get_upload_info(&self, upload_url: &str) -> Result<UploadInfo, UploadError> {
        let url = self.resolve(upload_url)?;
        let resp = self.head(&url).await?;
        let offset = resp.header_u64(&UPLOAD_OFFSET).unwrap_or(0);
        let length = resp.header_u64(&UPLOAD_LENGTH);
        let metadata = resp
            .header_str(&UPLOAD_METADATA)
            .map(|raw| Metadata::decode(raw, self.config.metadata_encoding))
            .unwrap_or_default();
        Ok(UploadInfo {
            offset,
            length,
            complete: length.is_some_and(|len| offset >= len),
            metadata,
        })
    }

    pub async fn get_metadata(&self, upload_url: &str) -> Result<Metadata, UploadError> {
        Ok(self.get_upload_info(upload_url).await?.metadata)
    }

    /// Capability discovery via OPTIONS on the creation endpoint.
    pub async fn get_server_info(&self) -> Result<ServerInfo, UploadError> {
        let base = self.config.base_url.clone();
        let resp = self
            .send(Method::OPTIONS, base.clone(), self.headers(), Bytes::new())
            .await?;
        let resp = check_response(resp, "server info", base.as_str(), 0)?;

        let version = resp
            .header_str(&TUS_VERSION_HEADER)
            .unwrap_or(TUS_VERSION)
            .to_string();
        let extensions = resp
            .header_str(&TUS_EXTENSION)
            .map(|raw| {
                raw.split(',')
                    .map(str::trim)
                    .filter(|ext| !ext.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();
        Ok(ServerInfo {
            version,
            extensions,
            max_size: resp.header_u64(&TUS_MAX_SIZE),
        })
    }

    /// `Upload-Metadata` header value, `None` for empty metadata.
    pub fn encode_metadata(&self, metadata: &Metadata) -> Result<Option<String>, UploadError> {
        Ok(metadata.encode(self.config.metadata_encoding)?)
    }

    pub(crate) async fn head_offset(&self, url: &Url) -> Result<u64, UploadError> {
        let resp = self.head(url).await?;
        resp.header_u64(&UPLOAD_OFFSET).ok_or_else(|| {
            UploadError::Communication("server did not return Upload-Offset header".into())
        })
    }

    async fn head(&self, url: &Url) -> Result<TusResponse, UploadError> {
        let resp = self
            .send(Method::HEAD, url.clone(), self.request_headers(), Bytes::new())
            .await?;
        check_response(resp, "head", url.as_str(), 0)
    }

    /// One PATCH at `offset`; returns the offset the server now reports.
    pub(crate) async fn upload_chunk_at(
        &self,
        url: &Url,
        offset: u64,
        data: Vec<u8>,
    ) -> Result<u64, UploadError> {
        let len = data.len() as u64;
        let mut headers = self.request_headers();
        insert_header(&mut headers, UPLOAD_OFFSET, &offset.to_string())?;
        headers.insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static(OFFSET_OCTET_STREAM),
        );
        if self.config.checksum {
            let digest = Sha1::digest(&data);
            let value = format!("sha1 {}", general_purpose::STANDARD.encode(digest));
            insert_header(&mut headers, UPLOAD_CHECKSUM, &value)?;
        }

        let resp = self
            .send(Method::PATCH, url.clone(), headers, Bytes::from(data))
            .await?;
        let resp = check_response(resp, "upload chunk", url.as_str(), offset)?;

        let confirmed = resp.header_u64(&UPLOAD_OFFSET).unwrap_or(offset + len);
        if len > 0 && confirmed <= offset {
            return Err(UploadError::Communication(format!(
                "server reported offset {} after accepting {} bytes at {}",
                confirmed, len, offset
            )));
        }
        debug!("chunk at {} accepted, server offset {}", offset, confirmed);
        Ok(confirmed)
    }

    /// Absolute upload URLs pass through; relative ones resolve against the base.
    pub(crate) fn resolve(&self, upload_url: &str) -> Result<Url, UploadError> {
        Url::parse(upload_url)
            .or_else(|_| self.config.base_url.join(upload_url))
            .map_err(|err| {
                UploadError::InvalidConfig(format!("upload url `{}`: {}", upload_url, err))
            })
    }

    fn request_headers(&self) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(TUS_RESUMABLE, HeaderValue::from_static(TUS_VERSION));
        headers.extend(self.headers());
        headers
    }

    async fn send(
        &self,
        method: Method,
        url: Url,
        headers: HeaderMap,
        body: Bytes,
    ) -> Result<TusResponse, UploadError> {
        let request = HttpRequest {
            method,
            url,
            headers,
            body,
        };
        Ok(self.transport.send(request).await?)
    }
}

fn insert_header(
    headers: &mut HeaderMap,
    name: HeaderName,
    value: &str,
) -> Result<(), UploadError> {
    let value = HeaderValue::from_str(value)
        .map_err(|err| UploadError::Communication(format!("header {}: {}", name, err)))?;
    headers.insert(name, value);
    Ok(())
}

/// Map a non-success response onto the client error taxonomy.
fn check_response(
    resp: TusResponse,
    context: &str,
    url: &str,
    offset: u64,
) -> Result<TusResponse, UploadError> {
    if resp.status.is_success() {
        return Ok(resp);
    }
    let err = match resp.status {
        StatusCode::NOT_FOUND => UploadError::NotFound {
            url: url.to_string(),
        },
        StatusCode::CONFLICT => UploadError::OffsetConflict {
            offset,
            server_offset: resp.header_u64(&UPLOAD_OFFSET),
        },
        StatusCode::PRECONDITION_FAILED => UploadError::VersionMismatch,
        StatusCode::PAYLOAD_TOO_LARGE => UploadError::TooLarge,
        status if status == protocol::checksum_mismatch_status() => {
            UploadError::ChecksumMismatch { offset }
        }
        status => UploadError::Status {
            context: context.to_string(),
            status,
            message: String::from_utf8_lossy(&resp.body).chars().take(200).collect(),
        },
    };
    Err(err)
}
