//! Sidecar HTTP surface
//!
//! Every request lands in one fallback handler that classifies it, runs the
//! guard where needed and forwards the rest to the storefront.

use axum::{
    body::Bytes,
    extract::{ConnectInfo, Request, State},
    http::{header, request::Parts, HeaderValue},
    response::Response,
    Router,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::{info_span, warn, Instrument};
use uuid::Uuid;

use crate::admin::{admin_router, GuardAdmin, ADMIN_PREFIX};
use crate::config::{Config, GuardSettings, SharedSettings};
use crate::error::GuardError;
use crate::guard::{CheckoutGuard, Verdict};
use crate::proxy::{AxumProxy, Proxy};
use crate::request::{ClientIdentity, RequestContext};
use crate::routes::{ProtectedRoutes, RouteKind};

/// Maximum request body size accepted for forwarding (10MB)
pub const MAX_REQUEST_BODY_SIZE: usize = 10 * 1024 * 1024;

/// Shared per-process state handed to every request
#[derive(Clone)]
pub struct AppState {
    pub guard: CheckoutGuard,
    pub settings: SharedSettings,
    pub routes: Arc<ProtectedRoutes>,
    pub proxy: AxumProxy,
    pub upstream_url: Arc<str>,
    pub session_cookie_prefix: Option<Arc<str>>,
}

impl AppState {
    pub fn new(config: &Config, guard: CheckoutGuard, settings: SharedSettings) -> Result<Self, GuardError> {
        Ok(Self {
            guard,
            settings,
            routes: Arc::new(ProtectedRoutes::default()),
            proxy: AxumProxy::new()?,
            upstream_url: Arc::from(config.upstream_url.as_str()),
            session_cookie_prefix: config.session_cookie_prefix.as_deref().map(Arc::from),
        })
    }
}

/// Build the sidecar router. The admin API is mounted only with a token.
pub fn build_router(state: AppState, admin_token: Option<String>) -> Router {
    let mut router = Router::new();

    if let Some(token) = admin_token {
        let admin = GuardAdmin::new(state.guard.audit().clone(), state.settings.clone());
        router = router.nest(ADMIN_PREFIX, admin_router(admin, token));
    }

    router
        .fallback(guard_layer)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn guard_layer(
    State(state): State<AppState>,
    connect_info: Option<ConnectInfo<SocketAddr>>,
    req: Request,
) -> Result<Response, GuardError> {
    let remote_addr = connect_info.map(|ConnectInfo(addr)| addr);
    let (parts, body) = req.into_parts();

    let span = info_span!(
        "request",
        request_id = %Uuid::new_v4(),
        method = %parts.method,
        path = %parts.uri.path(),
    );

    async move {
        let body_bytes = axum::body::to_bytes(body, MAX_REQUEST_BODY_SIZE)
            .await
            .map_err(|_| GuardError::InvalidInput("Request body too large".to_string()))?;

        let settings = state.settings.read().await.clone();
        let route = state
            .routes
            .classify(&parts.method, parts.uri.path(), parts.uri.query());

        match route {
            RouteKind::Protected { endpoint } => {
                handle_protected(&state, &settings, &parts, body_bytes, remote_addr, &endpoint).await
            }
            RouteKind::PageView => handle_page_view(&state, &settings, &parts, body_bytes, remote_addr).await,
            RouteKind::Passthrough => state.proxy.forward(&parts, body_bytes, &state.upstream_url).await,
        }
    }
    .instrument(span)
    .await
}

async fn handle_protected(
    state: &AppState,
    settings: &GuardSettings,
    parts: &Parts,
    body_bytes: Bytes,
    remote_addr: Option<SocketAddr>,
    endpoint: &str,
) -> Result<Response, GuardError> {
    let ctx = RequestContext::from_headers(
        &parts.headers,
        remote_addr,
        parts.method.as_str(),
        endpoint,
        state.session_cookie_prefix.as_deref(),
    );

    let verdict: Verdict = state.guard.check(&ctx, settings).await;
    if verdict.is_blocked() {
        return Err(GuardError::Blocked);
    }

    state.proxy.forward(parts, body_bytes, &state.upstream_url).await
}

async fn handle_page_view(
    state: &AppState,
    settings: &GuardSettings,
    parts: &Parts,
    body_bytes: Bytes,
    remote_addr: Option<SocketAddr>,
) -> Result<Response, GuardError> {
    let mut response = state.proxy.forward(parts, body_bytes, &state.upstream_url).await?;

    if !settings.enabled || !response.status().is_success() {
        return Ok(response);
    }

    let identity = ClientIdentity::from_headers(&parts.headers, remote_addr);
    match state.guard.issue_token(&identity) {
        Ok(token) => match HeaderValue::from_str(&token.cookie_header()) {
            Ok(value) => {
                response.headers_mut().append(header::SET_COOKIE, value);
            }
            Err(e) => warn!(error = %e, "Token cookie is not a valid header value"),
        },
        Err(e) => warn!(client_ip = %identity.ip, error = %e, "Failed to issue checkout token"),
    }

    Ok(response)
}
