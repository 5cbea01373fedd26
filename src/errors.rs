use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use std::{fmt, io};
use thiserror::Error;

use crate::{models::metadata::MetadataError, protocol, services::url_store::UrlStoreError};

/// A lightweight wrapper for general errors that keeps the message local.
#[derive(Debug)]
pub struct AppError {
    pub status: StatusCode,
    pub message: String,
}

impl AppError {
    /// Create a new AppError with a specific status and message.
    pub fn new(status: StatusCode, msg: impl Into<String>) -> Self {
        Self {
            status,
            message: msg.into(),
        }
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for AppError {}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = Json(json!({
            "error": self.message,
            "status": self.status.as_u16()
        }));

        (self.status, body).into_response()
    }
}

/// Failure to complete an HTTP exchange at all.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error(transparent)]
    Http(#[from] reqwest::Error),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error("connection lost: {0}")]
    Disconnected(String),
}

/// Everything the client can fail with.
///
/// Only transport faults, local read errors and 5xx answers are retried;
/// protocol and integrity errors surface on first occurrence.
#[derive(Debug, Error)]
pub enum UploadError {
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("source i/o error: {0}")]
    Io(#[from] io::Error),

    #[error("offset conflict at {offset}: server is at {server_offset:?}")]
    OffsetConflict {
        offset: u64,
        server_offset: Option<u64>,
    },

    #[error("server rejected protocol version (412)")]
    VersionMismatch,

    #[error("checksum mismatch for chunk at offset {offset}")]
    ChecksumMismatch { offset: u64 },

    #[error("upload not found at {url}")]
    NotFound { url: String },

    #[error("upload length exceeds the server maximum (413)")]
    TooLarge,

    #[error("{context} failed with status {status}: {message}")]
    Status {
        context: String,
        status: StatusCode,
        message: String,
    },

    #[error("unexpected server response: {0}")]
    Communication(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error(transparent)]
    InvalidMetadata(#[from] MetadataError),

    #[error("source file not found: {0}")]
    SourceNotFound(String),

    #[error("url store error: {0}")]
    UrlStore(#[from] UrlStoreError),

    #[error("upload failed at offset {offset} after {attempts} attempts: {source}")]
    Failed {
        offset: u64,
        attempts: u32,
        #[source]
        source: Box<UploadError>,
    },
}

impl UploadError {
    /// Whether a fresh attempt could plausibly succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            UploadError::Transport(_) | UploadError::Io(_) => true,
            UploadError::Status { status, .. } => status.is_server_error(),
            _ => false,
        }
    }

    /// HTTP status behind this error, when it came from a response.
    pub fn status(&self) -> Option<StatusCode> {
        match self {
            UploadError::OffsetConflict { .. } => Some(StatusCode::CONFLICT),
            UploadError::VersionMismatch => Some(StatusCode::PRECONDITION_FAILED),
            UploadError::ChecksumMismatch { .. } => Some(protocol::checksum_mismatch_status()),
            UploadError::NotFound { .. } => Some(StatusCode::NOT_FOUND),
            UploadError::TooLarge => Some(StatusCode::PAYLOAD_TOO_LARGE),
            UploadError::Status { status, .. } => Some(*status),
            UploadError::Failed { source, .. } => source.status(),
            _ => None,
        }
    }
}
