use anyhow::{Context, Result};
use axum::Router;
use resumable_upload::{
    client::{ClientConfig, RetryPolicy, TusClient, UploadOptions, UploadSource},
    config::{AppConfig, InfoArgs, Mode, UploadArgs},
    routes,
    services::{
        storage_service::SqliteStore,
        tus_service::{ServerOptions, TusService},
        url_store::FileUrlStore,
    },
};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use std::{fs, io::ErrorKind, path::Path, str::FromStr, sync::Arc, time::Duration};
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    // --- Logging setup ---
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    // --- Parse config + run mode ---
    let (cfg, mode) = AppConfig::from_env_and_args()?;
    let migrate_only = mode == Mode::Migrate;

    match mode {
        Mode::Upload(args) => return run_upload(args).await,
        Mode::Info(args) => return run_info(args).await,
        Mode::Serve | Mode::Migrate => {}
    }

    tracing::info!("Starting resumable-upload with config: {:?}", cfg);

    // --- Ensure storage directory exists ---
    if !Path::new(&cfg.storage_dir).exists() {
        fs::create_dir_all(&cfg.storage_dir)?;
        tracing::info!("Created storage directory at {}", cfg.storage_dir);
    }

    // --- Initialize SQLite connection ---
    let db_url = &cfg.database_url;
    let db_path = db_url
        .trim_start_matches("sqlite://")
        .trim_start_matches("file:");
    tracing::debug!("Interpreted SQLite path => {}", db_path);

    // Create parent directory if needed
    if let Some(parent) = Path::new(db_path).parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            fs::create_dir_all(parent)?;
            tracing::info!("Created missing directory {:?}", parent);
        }
    }

    let connect_options = SqliteConnectOptions::from_str(db_url)
        .with_context(|| format!("parsing database url `{}`", db_url))?
        .create_if_missing(true);
    let db = Arc::new(
        SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(connect_options)
            .await
            .with_context(|| format!("connecting to {}", db_url))?,
    );

    let store = SqliteStore::new(db, cfg.storage_dir.clone());
    store.migrate().await.context("applying database schema")?;

    // --- Handle migration mode ---
    if migrate_only {
        tracing::info!("Database migration complete.");
        return Ok(()); // exit after migration
    }

    // --- Initialize protocol engine ---
    let options = ServerOptions::default()
        .with_base_path(cfg.base_path.clone())
        .with_max_size(cfg.max_size);
    let service = TusService::new(Arc::new(store), options);

    // --- Build router ---
    let app: Router = routes::routes::routes(cfg.max_chunk_size).with_state(service);

    // --- Start server ---
    let addr = cfg.addr();
    let listener = match TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(err)
            if err.kind() == ErrorKind::PermissionDenied
                && matches!(cfg.host.as_str(), "0.0.0.0" | "::") =>
        {
            let fallback_addr = format!("127.0.0.1:{}", cfg.port);
            tracing::warn!(
                "Permission denied binding to {} ({}). Falling back to {}",
                addr,
                err,
                fallback_addr
            );
            TcpListener::bind(&fallback_addr).await?
        }
        Err(err) => return Err(err.into()),
    };

    tracing::info!(
        "Server listening on http://{}{}",
        listener.local_addr()?,
        cfg.base_path
    );
    axum::serve(listener, app).await?;

    Ok(())
}

async fn run_upload(args: UploadArgs) -> Result<()> {
    let retry = RetryPolicy::new(args.max_retries, Duration::from_millis(args.retry_delay_ms));
    let config = ClientConfig::new(&args.endpoint)?
        .chunk_size(args.chunk_size)
        .checksum(!args.no_checksum)
        .retry(retry)
        .store_url(args.url_store.is_some());

    let mut client = TusClient::new(config)?;
    if let Some(path) = &args.url_store {
        let store = FileUrlStore::open(path)
            .await
            .with_context(|| format!("opening url store {}", path.display()))?;
        client = client.with_url_store(Arc::new(store));
    }

    let options = UploadOptions::default().progress(|stats| {
        tracing::info!(
            "{}/{} bytes ({:.1}%), {:.2} MiB/s, eta {:.0?}",
            stats.uploaded_bytes,
            stats.total_bytes,
            stats.progress_percent(),
            stats.throughput_mib(),
            stats.eta()
        );
    });
    let outcome = client
        .upload_file(UploadSource::path(&args.file), options)
        .await
        .with_context(|| format!("uploading {}", args.file.display()))?;

    println!("{}", outcome.url);
    tracing::info!(
        "{} chunks, {} retried, {:.2}s",
        outcome.stats.chunks_completed,
        outcome.stats.chunks_retried,
        outcome.stats.elapsed().as_secs_f64()
    );
    Ok(())
}

async fn run_info(args: InfoArgs) -> Result<()> {
    let client = TusClient::new(ClientConfig::new(&args.upload_url)?)?;
    let info = client
        .get_upload_info(&args.upload_url)
        .await
        .with_context(|| format!("querying {}", args.upload_url))?;

    println!("offset:   {}", info.offset);
    match info.length {
        Some(length) => println!("length:   {}", length),
        None => println!("length:   unknown"),
    }
    println!("complete: {}", info.complete);
    for (key, value) in info.metadata.iter() {
        println!("metadata: {} = {}", key, value);
    }
    Ok(())
}
