mod common;

use axum::http::{HeaderMap, HeaderValue, Method};
use common::{
    BASE_URL, Fault, FaultyTransport, HELLO, config, local_client, memory_service,
    memory_service_with, stored_bytes, stored_offset,
};
use resumable_upload::{
    client::{RetryPolicy, TusClient, UploadOptions, UploadSource},
    errors::UploadError,
    models::{metadata::Metadata, stats::UploadStats},
    services::{
        fingerprint,
        tus_service::ServerOptions,
        url_store::{MemoryUrlStore, UrlStore},
    },
};
use std::{
    io::Cursor,
    sync::{Arc, Mutex},
    time::Duration,
};

fn write_file(dir: &tempfile::TempDir, name: &str, data: &[u8]) -> std::path::PathBuf {
    let path = dir.path().join(name);
    std::fs::write(&path, data).unwrap();
    path
}

fn patterned(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

#[tokio::test]
async fn hello_world_uploads_in_three_chunks() {
    let (service, store) = memory_service();
    let client = local_client(&service, config().chunk_size(5));
    let dir = tempfile::tempdir().unwrap();
    let path = write_file(&dir, "hello.txt", HELLO);

    let seen: Arc<Mutex<Vec<UploadStats>>> = Arc::default();
    let sink = seen.clone();
    let options = UploadOptions::default().progress(move |stats| sink.lock().unwrap().push(stats));
    let outcome = client
        .upload_file(UploadSource::path(&path), options)
        .await
        .unwrap();

    assert!(outcome.url.starts_with("http://tus.test/files/"));
    assert_eq!(outcome.offset, 13);
    assert_eq!(outcome.stats.chunks_completed, 3);
    assert_eq!(outcome.stats.uploaded_bytes, 13);
    assert_eq!(outcome.stats.chunks_failed, 0);
    assert_eq!(stored_bytes(store.as_ref(), &outcome.url).await, HELLO);

    let offsets: Vec<u64> = seen.lock().unwrap().iter().map(|s| s.uploaded_bytes).collect();
    assert_eq!(offsets, vec![5, 10, 13]);

    let metadata = client.get_metadata(&outcome.url).await.unwrap();
    assert_eq!(metadata.get("filename"), Some("hello.txt"));
    let info = client.get_upload_info(&outcome.url).await.unwrap();
    assert!(info.complete);
    assert_eq!(info.length, Some(13));
}

#[tokio::test]
async fn caller_metadata_is_sent_and_filename_kept() {
    let (service, _) = memory_service();
    let client = local_client(&service, config());
    let dir = tempfile::tempdir().unwrap();
    let path = write_file(&dir, "report.pdf", b"pdf");

    let metadata: Metadata = [("filename", "custom.pdf"), ("owner", "ops")]
        .into_iter()
        .collect();
    let outcome = client
        .upload_file(UploadSource::path(&path), UploadOptions::default().metadata(metadata))
        .await
        .unwrap();

    let stored = client.get_metadata(&outcome.url).await.unwrap();
    assert_eq!(stored.get("filename"), Some("custom.pdf"));
    assert_eq!(stored.get("owner"), Some("ops"));
}

#[tokio::test]
async fn invalid_metadata_fails_before_any_request() {
    let (service, store) = memory_service();
    let transport = FaultyTransport::new(&service, Fault::DropRequest, 0);
    let client = TusClient::with_transport(config(), transport.clone()).unwrap();

    let metadata: Metadata = [("bad key", "v")].into_iter().collect();
    let mut cursor = Cursor::new(HELLO.to_vec());
    let err = client
        .upload_file(
            UploadSource::stream(&mut cursor),
            UploadOptions::default().metadata(metadata),
        )
        .await
        .unwrap_err();

    assert!(matches!(err, UploadError::InvalidMetadata(_)));
    assert!(transport.requests().is_empty());
    assert!(store.is_empty());
}

#[tokio::test]
async fn missing_source_is_reported_without_network() {
    let (service, _) = memory_service();
    let transport = FaultyTransport::new(&service, Fault::DropRequest, 0);
    let client = TusClient::with_transport(config(), transport.clone()).unwrap();

    let err = client
        .upload_file(
            UploadSource::path("/no/such/file.bin"),
            UploadOptions::default(),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, UploadError::SourceNotFound(_)));
    assert!(transport.requests().is_empty());
}

#[tokio::test]
async fn zero_chunk_size_is_rejected() {
    let (service, _) = memory_service();
    let err = TusClient::with_transport(
        config().chunk_size(0),
        Arc::new(resumable_upload::client::LocalTransport::new(service)),
    )
    .err()
    .unwrap();
    assert!(matches!(err, UploadError::InvalidConfig(_)));
}

#[tokio::test]
async fn partial_upload_then_resume_is_byte_exact() {
    let (service, store) = memory_service();
    let client = local_client(&service, config().chunk_size(1000));
    let data = patterned(4500);

    let mut cursor = Cursor::new(data.clone());
    let partial = client
        .upload_file(
            UploadSource::stream(&mut cursor),
            UploadOptions::default().stop_at(2000),
        )
        .await
        .unwrap();
    assert_eq!(partial.offset, 2000);
    assert_eq!(stored_offset(store.as_ref(), &partial.url).await, 2000);

    let mut cursor = Cursor::new(data.clone());
    let resumed = client
        .resume_upload(UploadSource::stream(&mut cursor), &partial.url, None)
        .await
        .unwrap();
    assert_eq!(resumed.url, partial.url);
    assert_eq!(resumed.offset, 4500);
    // Only the remaining 2500 bytes were sent: 1000 + 1000 + 500.
    assert_eq!(resumed.stats.chunks_completed, 3);
    assert_eq!(stored_bytes(store.as_ref(), &partial.url).await, data);
}

#[tokio::test]
async fn two_transport_failures_then_success() {
    let (service, store) = memory_service();
    let transport = FaultyTransport::new(&service, Fault::DropRequest, 2);
    let base_delay = Duration::from_millis(10);
    let client = TusClient::with_transport(
        config().chunk_size(1024).retry(RetryPolicy::new(3, base_delay)),
        transport.clone(),
    )
    .unwrap();

    let mut cursor = Cursor::new(HELLO.to_vec());
    let outcome = client
        .upload_file(UploadSource::stream(&mut cursor), UploadOptions::default())
        .await
        .unwrap();

    assert_eq!(outcome.offset, 13);
    assert_eq!(outcome.stats.chunks_completed, 1);
    assert_eq!(outcome.stats.chunks_retried, 1);
    assert_eq!(outcome.stats.chunks_failed, 0);
    // 10ms before the first retry, 20ms before the second.
    assert!(outcome.stats.elapsed() >= base_delay * 3);
    assert_eq!(transport.count(Method::PATCH), 3);
    assert_eq!(stored_bytes(store.as_ref(), &outcome.url).await, HELLO);
}

#[tokio::test]
async fn lost_acknowledgment_is_detected_by_resync() {
    let (service, store) = memory_service();
    let transport = FaultyTransport::new(&service, Fault::DropResponse, 1);
    let client = TusClient::with_transport(
        config()
            .chunk_size(5)
            .retry(RetryPolicy::new(2, Duration::from_millis(1))),
        transport.clone(),
    )
    .unwrap();

    let mut cursor = Cursor::new(HELLO.to_vec());
    let outcome = client
        .upload_file(UploadSource::stream(&mut cursor), UploadOptions::default())
        .await
        .unwrap();

    assert_eq!(outcome.offset, 13);
    assert_eq!(outcome.stats.chunks_retried, 1);
    // The first chunk landed on its first attempt; it is not resent.
    assert_eq!(transport.count(Method::PATCH), 3);
    assert_eq!(stored_bytes(store.as_ref(), &outcome.url).await, HELLO);
}

#[tokio::test]
async fn retries_exhausted_yield_terminal_error() {
    let (service, _) = memory_service();
    let transport = FaultyTransport::new(&service, Fault::DropRequest, usize::MAX);
    let client = TusClient::with_transport(
        config().retry(RetryPolicy::new(2, Duration::from_millis(1))),
        transport.clone(),
    )
    .unwrap();
    let url = client.create_upload(13, &Metadata::new()).await.unwrap();

    let mut cursor = Cursor::new(HELLO.to_vec());
    let mut uploader = client
        .create_uploader(UploadSource::stream(&mut cursor), &url)
        .await
        .unwrap();
    let err = uploader.advance_one_chunk().await.unwrap_err();

    match &err {
        UploadError::Failed {
            offset, attempts, ..
        } => {
            assert_eq!(*offset, 0);
            assert_eq!(*attempts, 3);
        }
        other => panic!("unexpected error {other}"),
    }
    assert_eq!(uploader.stats().chunks_failed, 1);
    assert_eq!(uploader.offset(), 0);
    assert_eq!(transport.count(Method::PATCH), 3);
}

#[tokio::test]
async fn without_retries_the_raw_error_surfaces() {
    let (service, _) = memory_service();
    let transport = FaultyTransport::new(&service, Fault::DropRequest, 1);
    let client = TusClient::with_transport(config(), transport.clone()).unwrap();

    let mut cursor = Cursor::new(HELLO.to_vec());
    let err = client
        .upload_file(UploadSource::stream(&mut cursor), UploadOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, UploadError::Transport(_)));
    assert_eq!(transport.count(Method::PATCH), 1);
}

#[tokio::test]
async fn checksum_mismatch_is_not_retried() {
    let (service, store) = memory_service();
    let transport = FaultyTransport::new(&service, Fault::CorruptBody, 1);
    let client = TusClient::with_transport(
        config().retry(RetryPolicy::new(3, Duration::from_millis(1))),
        transport.clone(),
    )
    .unwrap();

    let mut cursor = Cursor::new(HELLO.to_vec());
    let err = client
        .upload_file(UploadSource::stream(&mut cursor), UploadOptions::default())
        .await
        .unwrap_err();

    assert!(matches!(err, UploadError::ChecksumMismatch { offset: 0 }));
    assert_eq!(err.status().map(|s| s.as_u16()), Some(460));
    assert_eq!(transport.count(Method::PATCH), 1);
    let url = transport
        .requests()
        .into_iter()
        .find(|req| req.method == Method::PATCH)
        .map(|req| req.url.to_string())
        .unwrap();
    assert_eq!(stored_offset(store.as_ref(), &url).await, 0);
}

#[tokio::test]
async fn corrupted_chunk_passes_when_checksums_are_off() {
    let (service, store) = memory_service();
    let transport = FaultyTransport::new(&service, Fault::CorruptBody, 1);
    let client = TusClient::with_transport(config().checksum(false), transport.clone()).unwrap();

    let mut cursor = Cursor::new(HELLO.to_vec());
    let outcome = client
        .upload_file(UploadSource::stream(&mut cursor), UploadOptions::default())
        .await
        .unwrap();

    let bytes = stored_bytes(store.as_ref(), &outcome.url).await;
    assert_eq!(bytes.len(), 13);
    assert_ne!(bytes, HELLO);
    let patch = transport
        .requests()
        .into_iter()
        .find(|req| req.method == Method::PATCH)
        .unwrap();
    assert!(!patch.headers.contains_key("upload-checksum"));
}

#[tokio::test]
async fn stored_url_resumes_same_upload() {
    let (service, store) = memory_service();
    let url_store = Arc::new(MemoryUrlStore::new());
    let client = local_client(&service, config().chunk_size(4).store_url(true))
        .with_url_store(url_store.clone());
    let dir = tempfile::tempdir().unwrap();
    let path = write_file(&dir, "hello.txt", HELLO);

    let first = client
        .upload_file(UploadSource::path(&path), UploadOptions::default().stop_at(8))
        .await
        .unwrap();
    assert_eq!(first.offset, 8);

    let fp = fingerprint::fingerprint_path(&path).await.unwrap();
    assert_eq!(url_store.get(&fp).await.unwrap(), Some(first.url.clone()));

    let second = client
        .upload_file(UploadSource::path(&path), UploadOptions::default())
        .await
        .unwrap();
    assert_eq!(second.url, first.url);
    assert_eq!(second.offset, 13);
    assert_eq!(store.len(), 1);
    assert_eq!(stored_bytes(store.as_ref(), &second.url).await, HELLO);
}

#[tokio::test]
async fn stale_stored_url_falls_back_to_creation() {
    let (service, store) = memory_service();
    let url_store = Arc::new(MemoryUrlStore::new());
    let client = local_client(&service, config().store_url(true)).with_url_store(url_store.clone());

    let mut cursor = Cursor::new(HELLO.to_vec());
    let fp = fingerprint::fingerprint(&mut cursor).await.unwrap();
    let stale = format!("{}/00000000-0000-4000-8000-000000000000", BASE_URL);
    url_store.set(&fp, &stale).await.unwrap();

    let outcome = client
        .upload_file(UploadSource::stream(&mut cursor), UploadOptions::default())
        .await
        .unwrap();

    assert_ne!(outcome.url, stale);
    assert_eq!(url_store.get(&fp).await.unwrap(), Some(outcome.url.clone()));
    assert_eq!(stored_bytes(store.as_ref(), &outcome.url).await, HELLO);
}

#[tokio::test]
async fn uploader_steps_one_chunk_at_a_time() {
    let (service, store) = memory_service();
    let client = local_client(&service, config().chunk_size(5));
    let url = client.create_upload(13, &Metadata::new()).await.unwrap();

    let mut cursor = Cursor::new(HELLO.to_vec());
    {
        let mut uploader = client
            .create_uploader(UploadSource::stream(&mut cursor), &url)
            .await
            .unwrap();
        assert_eq!(uploader.progress(), (0, 13));

        assert!(uploader.advance_one_chunk().await.unwrap());
        assert_eq!(uploader.progress(), (5, 13));
        assert_eq!(uploader.stats().uploaded_bytes, 5);

        assert!(uploader.advance_one_chunk().await.unwrap());
        assert!(!uploader.advance_one_chunk().await.unwrap());
        assert!(uploader.is_complete());
        assert!(!uploader.advance_one_chunk().await.unwrap());

        let stats = uploader.close();
        assert_eq!(stats.chunks_completed, 3);
        assert_eq!(stats.uploaded_bytes, 13);
    }

    // The borrowed stream is still ours to use.
    assert_eq!(cursor.get_ref().as_slice(), HELLO);
    assert_eq!(stored_bytes(store.as_ref(), &url).await, HELLO);
}

#[tokio::test]
async fn uploader_starts_from_server_offset() {
    let (service, store) = memory_service();
    let client = local_client(&service, config().chunk_size(100));
    let url = client.create_upload(13, &Metadata::new()).await.unwrap();

    let mut head = Cursor::new(HELLO[..6].to_vec());
    client
        .resume_upload(UploadSource::stream(&mut head), &url, None)
        .await
        .unwrap();
    assert_eq!(client.get_offset(&url).await.unwrap(), 6);

    let mut full = Cursor::new(HELLO.to_vec());
    let mut uploader = client
        .create_uploader(UploadSource::stream(&mut full), &url)
        .await
        .unwrap();
    assert_eq!(uploader.offset(), 6);
    assert_eq!(uploader.stats().uploaded_bytes, 6);
    let returned = uploader.drive_to_completion(None, None).await.unwrap();
    assert_eq!(returned, url);
    assert_eq!(stored_bytes(store.as_ref(), &url).await, HELLO);
}

#[tokio::test]
async fn source_shorter_than_declared_length_leaves_upload_incomplete() {
    let (service, _) = memory_service();
    let client = local_client(&service, config().chunk_size(4));
    // The upload is declared longer than the source that is later supplied.
    let url = client.create_upload(20, &Metadata::new()).await.unwrap();

    let mut cursor = Cursor::new(HELLO.to_vec());
    let outcome = client
        .resume_upload(UploadSource::stream(&mut cursor), &url, None)
        .await
        .unwrap();
    assert_eq!(outcome.offset, 13);
    let info = client.get_upload_info(&url).await.unwrap();
    assert!(!info.complete);
}

#[tokio::test]
async fn file_truncated_mid_transfer_ends_loop_early() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_file(&dir, "shrinking.txt", HELLO);
    let (service, store) = memory_service();
    let client = local_client(&service, config().chunk_size(4));
    let url = client.create_upload(13, &Metadata::new()).await.unwrap();

    let mut uploader = client
        .create_uploader(UploadSource::path(path.clone()), &url)
        .await
        .unwrap();
    assert!(uploader.advance_one_chunk().await.unwrap());
    assert_eq!(uploader.offset(), 4);

    // The size was taken when the file was opened; the read past 6 comes back empty.
    std::fs::OpenOptions::new()
        .write(true)
        .open(&path)
        .unwrap()
        .set_len(6)
        .unwrap();

    let returned = uploader.drive_to_completion(None, None).await.unwrap();
    assert_eq!(returned, url);
    assert_eq!(uploader.offset(), 6);
    assert_eq!(uploader.size(), 13);
    assert!(!uploader.is_complete());
    assert!(!uploader.advance_one_chunk().await.unwrap());

    let stats = uploader.close();
    assert_eq!(stats.uploaded_bytes, 6);
    assert_eq!(stats.chunks_failed, 0);
    assert_eq!(stored_offset(store.as_ref(), &url).await, 6);
    assert_eq!(stored_bytes(store.as_ref(), &url).await, &HELLO[..6]);
}

#[tokio::test]
async fn uploader_sync_picks_up_progress_made_elsewhere() {
    let (service, store) = memory_service();
    let client = local_client(&service, config().chunk_size(4));
    let url = client.create_upload(13, &Metadata::new()).await.unwrap();

    let mut full = Cursor::new(HELLO.to_vec());
    let mut uploader = client
        .create_uploader(UploadSource::stream(&mut full), &url)
        .await
        .unwrap();
    assert_eq!(uploader.offset(), 0);

    let mut head = Cursor::new(HELLO[..8].to_vec());
    client
        .resume_upload(UploadSource::stream(&mut head), &url, None)
        .await
        .unwrap();

    // The stale offset would be refused with a 409.
    assert_eq!(uploader.sync().await.unwrap(), 8);
    assert_eq!(uploader.progress(), (8, 13));
    assert_eq!(uploader.stats().uploaded_bytes, 8);

    uploader.drive_to_completion(None, None).await.unwrap();
    assert!(uploader.is_complete());
    assert_eq!(stored_bytes(store.as_ref(), &url).await, HELLO);
}

#[tokio::test]
async fn delete_tolerates_missing_upload() {
    let (service, store) = memory_service();
    let client = local_client(&service, config());
    let url = client.create_upload(13, &Metadata::new()).await.unwrap();

    client.delete_upload(&url).await.unwrap();
    assert!(store.is_empty());
    client.delete_upload(&url).await.unwrap();

    let err = client.get_offset(&url).await.unwrap_err();
    assert!(matches!(err, UploadError::NotFound { .. }));
}

#[tokio::test]
async fn server_info_reflects_options() {
    let (service, _) = memory_service_with(ServerOptions::default().with_max_size(4096));
    let client = local_client(&service, config());
    let info = client.get_server_info().await.unwrap();

    assert_eq!(info.version, "1.0.0");
    assert_eq!(info.extensions, vec!["creation", "termination", "checksum"]);
    assert_eq!(info.max_size, Some(4096));
}

#[tokio::test]
async fn oversized_upload_is_refused() {
    let (service, _) = memory_service_with(ServerOptions::default().with_max_size(10));
    let client = local_client(&service, config());
    let mut cursor = Cursor::new(HELLO.to_vec());
    let err = client
        .upload_file(UploadSource::stream(&mut cursor), UploadOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, UploadError::TooLarge));
}

#[tokio::test]
async fn version_mismatch_surfaces_immediately() {
    let mut options = ServerOptions::default();
    options.version = "2.0.0".into();
    let (service, _) = memory_service_with(options);
    let client = local_client(
        &service,
        config().retry(RetryPolicy::new(3, Duration::from_millis(1))),
    );

    let err = client.create_upload(13, &Metadata::new()).await.unwrap_err();
    assert!(matches!(err, UploadError::VersionMismatch));
}

#[tokio::test]
async fn passthrough_headers_reach_every_request() {
    let (service, _) = memory_service();
    let transport = FaultyTransport::new(&service, Fault::DropRequest, 0);
    let client = TusClient::with_transport(
        config().header("authorization", "Bearer one").unwrap(),
        transport.clone(),
    )
    .unwrap();

    let url = client.create_upload(13, &Metadata::new()).await.unwrap();
    let mut update = HeaderMap::new();
    update.insert("authorization", HeaderValue::from_static("Bearer two"));
    update.insert("x-trace", HeaderValue::from_static("abc"));
    client.update_headers(update);
    client.get_offset(&url).await.unwrap();

    let requests = transport.requests();
    assert_eq!(requests.len(), 2);
    assert_eq!(requests[0].headers["authorization"], "Bearer one");
    assert_eq!(requests[0].headers["tus-resumable"], "1.0.0");
    assert_eq!(requests[1].headers["authorization"], "Bearer two");
    assert_eq!(requests[1].headers["x-trace"], "abc");
}

#[tokio::test]
async fn empty_source_creates_complete_upload() {
    let (service, store) = memory_service();
    let client = local_client(&service, config());
    let mut cursor = Cursor::new(Vec::new());
    let outcome = client
        .upload_file(UploadSource::stream(&mut cursor), UploadOptions::default())
        .await
        .unwrap();

    assert_eq!(outcome.offset, 0);
    assert_eq!(outcome.stats.chunks_completed, 0);
    assert!(client.get_upload_info(&outcome.url).await.unwrap().complete);
    assert_eq!(store.len(), 1);
}
