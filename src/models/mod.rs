//! Core data models for the resumable upload service.
//!
//! `Upload` is the server-owned record persisted by a storage backend,
//! `Metadata` is the key/value map carried in `Upload-Metadata`, and
//! `UploadStats` is the client-side progress snapshot.

pub mod metadata;
pub mod stats;
pub mod upload;
