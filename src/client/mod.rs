//! Upload client: engine, transports, sources, retry and the steppable uploader.

pub mod client;
pub mod retry;
pub mod source;
pub mod transport;
pub mod uploader;

pub use client::{ClientConfig, ServerInfo, TusClient, UploadInfo, UploadOptions, UploadOutcome};
pub use retry::RetryPolicy;
pub use source::UploadSource;
pub use transport::{HttpTransport, LocalTransport, Transport};
pub use uploader::Uploader;
