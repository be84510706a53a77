use axum::{
    body::{Body, Bytes},
    http::{HeaderValue, Response, StatusCode, Uri},
};
use crate::error::GuardError;
use reqwest::{redirect, Client};
use std::str::FromStr;

/// Request headers that are connection-scoped or rewritten by the client
const SKIPPED_REQUEST_HEADERS: [&str; 5] = ["host", "connection", "content-length", "transfer-encoding", "keep-alive"];

/// Response headers the body re-framing makes stale
const SKIPPED_RESPONSE_HEADERS: [&str; 3] = ["connection", "content-length", "transfer-encoding"];

/// HTTP proxy trait for framework abstraction
///
/// Accepts pre-read request parts and body bytes so the guard can inspect
/// the request before it is forwarded.
#[allow(async_fn_in_trait)]
pub trait Proxy: Send + Sync {
    async fn forward(
        &self,
        parts: &axum::http::request::Parts,
        body_bytes: Bytes,
        upstream_url: &str,
    ) -> Result<Response<Body>, GuardError>;
}

/// Axum-based HTTP proxy implementation
///
/// Redirects are passed back to the client untouched.
#[derive(Clone)]
pub struct AxumProxy {
    client: Client,
}

impl AxumProxy {
    pub fn new() -> Result<Self, GuardError> {
        let client = Client::builder().redirect(redirect::Policy::none()).build()?;
        Ok(Self { client })
    }
}

impl Proxy for AxumProxy {
    async fn forward(
        &self,
        parts: &axum::http::request::Parts,
        body_bytes: Bytes,
        upstream_url: &str,
    ) -> Result<Response<Body>, GuardError> {
        let path = parts.uri.path();
        let upstream_uri = match parts.uri.query() {
            Some(query) if !query.is_empty() => format!("{}{}?{}", upstream_url, path, query),
            _ => format!("{}{}", upstream_url, path),
        };

        let uri = Uri::from_str(&upstream_uri)
            .map_err(|e| GuardError::ProxyError(format!("Invalid upstream URL: {}", e)))?;

        // reqwest 0.11 sits on http 0.2, so methods and headers cross as strings.
        let reqwest_method = reqwest::Method::from_bytes(parts.method.as_str().as_bytes())
            .map_err(|_| GuardError::ProxyError(format!("Unsupported HTTP method: {}", parts.method)))?;

        let mut reqwest_req = self.client.request(reqwest_method, uri.to_string()).body(body_bytes);

        for (name, value) in &parts.headers {
            if SKIPPED_REQUEST_HEADERS.contains(&name.as_str()) {
                continue;
            }
            if let Ok(value_str) = value.to_str() {
                reqwest_req = reqwest_req.header(name.as_str(), value_str);
            }
        }

        let response = reqwest_req
            .send()
            .await
            .map_err(|e| GuardError::ProxyError(format!("Upstream request failed: {}", e)))?;

        let status = StatusCode::from_u16(response.status().as_u16())
            .map_err(|_| GuardError::ProxyError("Invalid status code from upstream".to_string()))?;

        let mut axum_response = Response::builder().status(status);

        for (name, value) in response.headers() {
            if SKIPPED_RESPONSE_HEADERS.contains(&name.as_str()) {
                continue;
            }
            if let Ok(value_str) = value.to_str() {
                axum_response = axum_response.header(
                    name.as_str(),
                    HeaderValue::from_str(value_str)
                        .map_err(|e| GuardError::ProxyError(format!("Invalid header value: {}", e)))?,
                );
            }
        }

        let body_bytes = response
            .bytes()
            .await
            .map_err(|e| GuardError::ProxyError(format!("Failed to read response body: {}", e)))?;

        axum_response
            .body(Body::from(body_bytes))
            .map_err(|e| GuardError::ProxyError(format!("Failed to build response: {}", e)))
    }
}
