#![allow(dead_code)]

use async_trait::async_trait;
use axum::http::Method;
use resumable_upload::{
    client::{
        ClientConfig, LocalTransport, TusClient,
        transport::{HttpRequest, Transport},
    },
    errors::TransportError,
    models::{metadata::Metadata, upload::Upload},
    protocol::{TUS_RESUMABLE, TUS_VERSION, TusRequest, TusResponse},
    services::{
        memory_store::MemoryStore,
        storage_service::{StorageResult, UploadStore},
        tus_service::{ServerOptions, TusService},
    },
};
use std::{
    path::PathBuf,
    sync::{
        Arc, Mutex,
        atomic::{AtomicUsize, Ordering},
    },
};

pub const BASE_URL: &str = "http://tus.test/files";
pub const HELLO: &[u8] = b"Hello, World!";

pub fn memory_service() -> (TusService, Arc<MemoryStore>) {
    memory_service_with(ServerOptions::default())
}

pub fn memory_service_with(options: ServerOptions) -> (TusService, Arc<MemoryStore>) {
    let store = Arc::new(MemoryStore::new());
    let service = TusService::new(store.clone(), options);
    (service, store)
}

/// Engine over a [`YieldingStore`], so concurrent requests interleave at
/// every storage call.
pub fn yielding_service() -> (TusService, Arc<MemoryStore>) {
    let inner = Arc::new(MemoryStore::new());
    let store = Arc::new(YieldingStore {
        inner: inner.clone(),
    });
    (TusService::new(store, ServerOptions::default()), inner)
}

/// [`MemoryStore`] that hands control back to the scheduler in the middle of
/// reads and writes.
pub struct YieldingStore {
    inner: Arc<MemoryStore>,
}

async fn yield_a_few() {
    for _ in 0..3 {
        tokio::task::yield_now().await;
    }
}

#[async_trait]
impl UploadStore for YieldingStore {
    async fn create_upload(
        &self,
        id: &str,
        length: u64,
        metadata: &Metadata,
    ) -> StorageResult<Upload> {
        self.inner.create_upload(id, length, metadata).await
    }

    async fn get_upload(&self, id: &str) -> StorageResult<Option<Upload>> {
        let upload = self.inner.get_upload(id).await;
        yield_a_few().await;
        upload
    }

    async fn update_offset(&self, id: &str, offset: u64) -> StorageResult<()> {
        yield_a_few().await;
        self.inner.update_offset(id, offset).await
    }

    async fn write_chunk(&self, id: &str, offset: u64, data: &[u8]) -> StorageResult<()> {
        yield_a_few().await;
        self.inner.write_chunk(id, offset, data).await?;
        yield_a_few().await;
        Ok(())
    }

    async fn read_all(&self, id: &str) -> StorageResult<Vec<u8>> {
        self.inner.read_all(id).await
    }

    async fn delete_upload(&self, id: &str) -> StorageResult<()> {
        yield_a_few().await;
        self.inner.delete_upload(id).await
    }

    fn file_path(&self, id: &str) -> Option<PathBuf> {
        self.inner.file_path(id)
    }

    async fn ping(&self) -> StorageResult<()> {
        self.inner.ping().await
    }
}

pub fn config() -> ClientConfig {
    ClientConfig::new(BASE_URL).unwrap()
}

pub fn local_client(service: &TusService, config: ClientConfig) -> TusClient {
    TusClient::with_transport(config, Arc::new(LocalTransport::new(service.clone()))).unwrap()
}

/// Request carrying the supported protocol version.
pub fn tus(method: Method, path: &str) -> TusRequest {
    TusRequest::new(method, path).header(TUS_RESUMABLE, TUS_VERSION)
}

/// Last path segment of an upload URL or Location.
pub fn upload_id(url: &str) -> String {
    url.rsplit('/').next().unwrap_or_default().to_string()
}

pub async fn stored_bytes(store: &dyn UploadStore, url: &str) -> Vec<u8> {
    store.read_all(&upload_id(url)).await.unwrap()
}

pub async fn stored_offset(store: &dyn UploadStore, url: &str) -> u64 {
    store
        .get_upload(&upload_id(url))
        .await
        .unwrap()
        .map(|upload| upload.offset)
        .unwrap()
}

/// How [`FaultyTransport`] misbehaves on a PATCH it has been told to break.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Fault {
    /// Connection drops before the server sees the request.
    DropRequest,
    /// Server applies the request, the response is lost.
    DropResponse,
    /// One body byte is flipped in flight.
    CorruptBody,
}

/// Wraps a [`LocalTransport`], breaking the first `remaining` PATCH requests
/// and recording every request it is handed.
pub struct FaultyTransport {
    inner: LocalTransport,
    fault: Fault,
    remaining: AtomicUsize,
    seen: Mutex<Vec<HttpRequest>>,
}

impl FaultyTransport {
    pub fn new(service: &TusService, fault: Fault, failures: usize) -> Arc<Self> {
        Arc::new(Self {
            inner: LocalTransport::new(service.clone()),
            fault,
            remaining: AtomicUsize::new(failures),
            seen: Mutex::new(Vec::new()),
        })
    }

    pub fn requests(&self) -> Vec<HttpRequest> {
        self.seen.lock().unwrap().clone()
    }

    pub fn count(&self, method: Method) -> usize {
        self.seen
            .lock()
            .unwrap()
            .iter()
            .filter(|req| req.method == method)
            .count()
    }

    fn take_failure(&self) -> bool {
        self.remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl Transport for FaultyTransport {
    async fn send(&self, mut request: HttpRequest) -> Result<TusResponse, TransportError> {
        self.seen.lock().unwrap().push(request.clone());
        if request.method != Method::PATCH || !self.take_failure() {
            return self.inner.send(request).await;
        }
        match self.fault {
            Fault::DropRequest => Err(TransportError::Disconnected("connection reset".into())),
            Fault::DropResponse => {
                self.inner.send(request).await?;
                Err(TransportError::Disconnected("response lost".into()))
            }
            Fault::CorruptBody => {
                let mut body = request.body.to_vec();
                if let Some(first) = body.first_mut() {
                    *first ^= 0xff;
                }
                request.body = body.into();
                self.inner.send(request).await
            }
        }
    }
}
