//! axum adapter for the protocol engine.
//!
//! Every request below the router's fallback is converted into a
//! [`TusRequest`], handed to [`TusService::handle_request`] and the
//! engine's answer is written back unchanged.

use crate::{errors::AppError, protocol::TusRequest, services::tus_service::TusService};
use axum::{
    body::Bytes,
    extract::{State, rejection::BytesRejection},
    http::{HeaderMap, Method, Uri},
    response::{IntoResponse, Response},
};
use tracing::warn;

/// Fallback handler for `OPTIONS`, `POST`, `HEAD`, `PATCH` and `DELETE`.
pub async fn tus_handler(
    State(service): State<TusService>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Result<Bytes, BytesRejection>,
) -> Result<Response, AppError> {
    let body = body.map_err(|rejection| {
        warn!("rejected {} {} body: {}", method, uri, rejection);
        AppError::new(rejection.status(), rejection.body_text())
    })?;

    let path = uri
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| uri.path().to_string());

    let request = TusRequest {
        method,
        path,
        headers,
        body,
    };
    let response = service.handle_request(request).await;
    Ok((response.status, response.headers, response.body).into_response())
}
