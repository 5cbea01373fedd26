//! Represents an upload tracked by the server.

use crate::models::metadata::Metadata;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A single resumable upload.
///
/// `length` is fixed at creation. `offset` counts the bytes durably
/// accepted and never decreases. The record stores metadata only; payload
/// bytes live wherever the backend keeps them.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct Upload {
    /// Opaque unique token, also the last path segment of the upload URL.
    pub id: String,

    /// Declared total size in bytes.
    pub length: u64,

    /// Bytes accepted so far.
    pub offset: u64,

    /// Client-supplied metadata, decoded.
    pub metadata: Metadata,

    /// When the upload was created.
    pub created_at: DateTime<Utc>,
}

impl Upload {
    pub fn new(id: impl Into<String>, length: u64, metadata: Metadata) -> Self {
        Self {
            id: id.into(),
            length,
            offset: 0,
            metadata,
            created_at: Utc::now(),
        }
    }

    pub fn is_complete(&self) -> bool {
        self.offset == self.length
    }

    pub fn remaining(&self) -> u64 {
        self.length.saturating_sub(self.offset)
    }
}
