//! How the client exchanges one request with a server.
//!
//! `HttpTransport` goes over the network with reqwest. `LocalTransport`
//! feeds requests straight into an in-process [`TusService`], which is what
//! the integration tests and embedding applications use.

use crate::{
    errors::TransportError,
    protocol::{TusRequest, TusResponse},
    services::tus_service::TusService,
};
use async_trait::async_trait;
use axum::http::{HeaderMap, Method};
use bytes::Bytes;
use reqwest::Url;
use std::time::Duration;

/// A client-side request addressed by absolute URL.
#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: Method,
    pub url: Url,
    pub headers: HeaderMap,
    pub body: Bytes,
}

#[async_trait]
pub trait Transport: Send + Sync {
    /// Perform the exchange. Any response, whatever its status, is `Ok`.
    async fn send(&self, request: HttpRequest) -> Result<TusResponse, TransportError>;
}

#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new(timeout: Option<Duration>, verify_tls: bool) -> Result<Self, TransportError> {
        let mut builder = reqwest::Client::builder().danger_accept_invalid_certs(!verify_tls);
        if let Some(timeout) = timeout {
            builder = builder.timeout(timeout);
        }
        Ok(Self {
            client: builder.build()?,
        })
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send(&self, request: HttpRequest) -> Result<TusResponse, TransportError> {
        let response = self
            .client
            .request(request.method, request.url)
            .headers(request.headers)
            .body(request.body)
            .send()
            .await?;

        let status = response.status();
        let headers = response.headers().clone();
        let body = response.bytes().await?;
        Ok(TusResponse {
            status,
            headers,
            body,
        })
    }
}

/// Routes requests to an in-process protocol engine by URL path.
#[derive(Clone)]
pub struct LocalTransport {
    service: TusService,
}

impl LocalTransport {
    pub fn new(service: TusService) -> Self {
        Self { service }
    }
}

#[async_trait]
impl Transport for LocalTransport {
    async fn send(&self, request: HttpRequest) -> Result<TusResponse, TransportError> {
        let mut path = request.url.path().to_string();
        if let Some(query) = request.url.query() {
            path.push('?');
            path.push_str(query);
        }
        let req = TusRequest {
            method: request.method,
            path,
            headers: request.headers,
            body: request.body,
        };
        Ok(self.service.handle_request(req).await)
    }
}
