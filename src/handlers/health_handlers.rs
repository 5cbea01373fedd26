//! Health & readiness handlers.
//!
//! - GET /healthz  -> simple liveness ("ok")
//! - GET /readyz   -> readiness that pings the upload store

use crate::services::tus_service::TusService;
use axum::{Json, extract::State, http::StatusCode, response::IntoResponse};
use serde::Serialize;
use std::collections::HashMap;

/// `GET /healthz`
///
/// Liveness check. Always 200 and never touches storage.
pub async fn healthz() -> impl IntoResponse {
    (
        StatusCode::OK,
        Json(HealthResponse {
            status: "ok".into(),
        }),
    )
}

/// `GET /readyz`
///
/// Runs the store's `ping` (database round trip and payload directory for
/// the SQLite store). HTTP 200 when it passes, 503 otherwise.
pub async fn readyz(State(service): State<TusService>) -> impl IntoResponse {
    let store_check = match service.store().ping().await {
        Ok(()) => CheckStatus {
            ok: true,
            error: None,
        },
        Err(e) => CheckStatus {
            ok: false,
            error: Some(format!("error: {}", e)),
        },
    };

    let overall_ok = store_check.ok;
    let mut checks = HashMap::new();
    checks.insert("store", store_check);

    let body = ReadyResponse {
        status: if overall_ok {
            "ok".into()
        } else {
            "error".into()
        },
        checks,
    };

    let status = if overall_ok {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(body))
}

#[derive(Serialize)]
struct HealthResponse {
    status: String,
}

#[derive(Serialize)]
struct ReadyResponse {
    status: String,
    checks: HashMap<&'static str, CheckStatus>,
}

#[derive(Serialize)]
struct CheckStatus {
    ok: bool,
    error: Option<String>,
}
