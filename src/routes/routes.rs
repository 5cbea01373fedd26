//! Router composition.
//!
//! - `GET /healthz`, `GET /readyz`: health checks
//! - everything else, other methods on the health paths included, falls
//!   through to the TUS engine, which matches its
//!   configured base path itself (`POST {base}`, `HEAD|PATCH|DELETE {base}/{id}`,
//!   `OPTIONS` anywhere)

use crate::{
    handlers::{
        health_handlers::{healthz, readyz},
        tus_handlers::tus_handler,
    },
    services::tus_service::TusService,
};
use axum::{Router, extract::DefaultBodyLimit, routing::get};

/// Build the router. `max_body` bounds a single PATCH body.
pub fn routes(max_body: usize) -> Router<TusService> {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .method_not_allowed_fallback(tus_handler)
        .fallback(tus_handler)
        .layer(DefaultBodyLimit::max(max_body))
}
