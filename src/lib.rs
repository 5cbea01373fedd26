//! Resumable uploads over the TUS 1.0.0 protocol.
//!
//! The server half is [`services::tus_service::TusService`], a transport
//! independent protocol engine over an [`services::storage_service::UploadStore`],
//! mounted into axum by [`routes::routes::routes`]. The client half is
//! [`client::TusClient`], which uploads files in sequential chunks and resumes
//! them from the offset the server reports.

pub mod client;
pub mod config;
pub mod errors;
pub mod handlers;
pub mod models;
pub mod protocol;
pub mod routes;
pub mod services;
