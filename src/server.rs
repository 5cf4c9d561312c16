//! HTTP boundary: one catch-all route per variant.
//!
//! Successful rounds answer `200` with an empty body. Discovery, aggregate
//! and purge failures answer `500` with the error text; per-endpoint detail
//! only goes to the logs.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use axum::extract::{Request, State};
use axum::response::{IntoResponse, Response};
use http::header::ALLOW;
use http::{Method, StatusCode};
use tokio::net::TcpListener;

use crate::k8s::EndpointSource;
use crate::operation::{OperationRequest, PURGE};
use crate::proxy::{Proxy, Purger};

/// Largest inbound body buffered for replay.
pub const MAX_BODY_BYTES: usize = 16 * 1024 * 1024;

/// Methods the forward route accepts.
///
/// Membership checks use a set; the `Allow` header keeps the configured order.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AllowedMethods {
    set: HashSet<Method>,
    ordered: Vec<Method>,
}

impl AllowedMethods {
    /// Creates an allow-list, dropping repeated methods.
    #[must_use]
    pub fn new(methods: impl IntoIterator<Item = Method>) -> Self {
        let mut allowed = Self::default();

        for method in methods {
            if allowed.set.insert(method.clone()) {
                allowed.ordered.push(method);
            }
        }

        allowed
    }

    /// Returns `true` if `method` is allowed.
    #[must_use]
    pub fn contains(&self, method: &Method) -> bool {
        self.set.contains(method)
    }

    /// Value of the `Allow` header.
    #[must_use]
    pub fn allow_header(&self) -> String {
        self.ordered
            .iter()
            .map(Method::as_str)
            .collect::<Vec<_>>()
            .join(", ")
    }
}

struct ForwardState<S> {
    proxy: Arc<Proxy<S>>,
    methods: Arc<AllowedMethods>,
}

impl<S> Clone for ForwardState<S> {
    fn clone(&self) -> Self {
        Self {
            proxy: Arc::clone(&self.proxy),
            methods: Arc::clone(&self.methods),
        }
    }
}

/// Builds the router replaying every allowed request through `proxy`.
#[must_use]
pub fn forward_router<S>(proxy: Arc<Proxy<S>>, methods: AllowedMethods) -> Router
where
    S: EndpointSource + 'static,
{
    Router::new()
        .fallback(forward::<S>)
        .with_state(ForwardState {
            proxy,
            methods: Arc::new(methods),
        })
}

async fn forward<S: EndpointSource>(
    State(state): State<ForwardState<S>>,
    request: Request,
) -> Response {
    if !state.methods.contains(request.method()) {
        return method_not_allowed(state.methods.allow_header());
    }

    let (parts, body) = request.into_parts();
    let body = match axum::body::to_bytes(body, MAX_BODY_BYTES).await {
        Ok(body) => body,
        Err(e) => {
            tracing::warn!("failed to read request body: {e}");
            return (StatusCode::BAD_REQUEST, format!("failed to read request body: {e}"))
                .into_response();
        }
    };

    let op = OperationRequest::forward(parts.method, &parts.uri, &parts.headers, body);

    match state.proxy.forward(&op).await {
        Ok(_) => StatusCode::OK.into_response(),
        Err(e) => server_error(&e),
    }
}

/// Builds the router purging the request path on every instance.
#[must_use]
pub fn purge_router<S>(purger: Arc<Purger<S>>) -> Router
where
    S: EndpointSource + 'static,
{
    Router::new().fallback(purge::<S>).with_state(purger)
}

async fn purge<S: EndpointSource>(
    State(purger): State<Arc<Purger<S>>>,
    request: Request,
) -> Response {
    if *request.method() != *PURGE {
        return method_not_allowed(PURGE.to_string());
    }

    let path = request
        .uri()
        .path_and_query()
        .map_or("/", |pq| pq.as_str());

    match purger.purge(path).await {
        Ok(()) => StatusCode::OK.into_response(),
        Err(e) => server_error(&e),
    }
}

fn method_not_allowed(allow: String) -> Response {
    (
        StatusCode::METHOD_NOT_ALLOWED,
        [(ALLOW, allow)],
        "Method not allowed",
    )
        .into_response()
}

fn server_error(e: &dyn std::error::Error) -> Response {
    tracing::error!("[ERROR] {e}");
    (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response()
}

/// Serves `router` on all interfaces until Ctrl-C.
///
/// # Errors
///
/// Returns an error if the port cannot be bound or the server fails.
pub async fn serve(router: Router, port: u16) -> std::io::Result<()> {
    let listener = TcpListener::bind(SocketAddr::from(([0, 0, 0, 0], port))).await?;

    tracing::info!("Server started, listening in :{port}");

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!("failed to listen for shutdown signal: {e}");
        std::future::pending::<()>().await;
    }

    tracing::info!("Shutdown signal received");
}
