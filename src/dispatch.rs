//! Dispatch of one operation to every resolved endpoint.
//!
//! Two policies are provided, and they differ on purpose:
//!
//! - [`Dispatcher::broadcast`] runs one task per endpoint and waits for all of
//!   them. Every endpoint gets its request even when siblings fail.
//! - [`Dispatcher::purge_all`] walks the endpoints in order and stops at the
//!   first failure. Endpoints after it are never contacted; callers retry the
//!   whole purge.
//!
//! Each outcome is logged when it completes, so under `broadcast` the log
//! order follows completion order rather than resolution order.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use futures::stream::FuturesUnordered;
use http::StatusCode;

use crate::error::{AggregateError, DiscoveryError, EndpointError, PurgeError};
use crate::operation::OperationRequest;

/// Broadcast timeout of a [`Dispatcher::default`].
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// Timeout applied to every purge request.
pub const PURGE_TIMEOUT: Duration = Duration::from_secs(5);

/// Result of dispatching to one endpoint.
#[derive(Debug)]
pub struct Outcome {
    /// The endpoint the request was sent to.
    pub endpoint: SocketAddr,

    /// Response status, if a response was received.
    pub status: Option<StatusCode>,

    /// Why the endpoint failed, if it did.
    pub error: Option<EndpointError>,
}

impl Outcome {
    fn from_status(endpoint: SocketAddr, status: StatusCode) -> Self {
        let error = (!status.is_success()).then_some(EndpointError::Status(status));

        Self {
            endpoint,
            status: Some(status),
            error,
        }
    }

    fn from_error(endpoint: SocketAddr, error: EndpointError) -> Self {
        Self {
            endpoint,
            status: None,
            error: Some(error),
        }
    }

    /// Returns `true` if the endpoint answered with a 2xx status.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

/// Reduction of all outcomes of one dispatch round.
#[derive(Debug, Default)]
pub struct AggregateResult {
    /// Number of endpoints dispatched to.
    pub total: usize,

    /// Number of failed endpoints.
    pub failed: usize,

    /// Every failed endpoint with its error, in completion order.
    pub failures: Vec<(SocketAddr, EndpointError)>,
}

impl AggregateResult {
    /// Reduces outcomes into counts and failures. Performs no I/O.
    #[must_use]
    pub fn from_outcomes(outcomes: impl IntoIterator<Item = Outcome>) -> Self {
        let mut result = Self::default();

        for outcome in outcomes {
            result.total += 1;

            if let Some(error) = outcome.error {
                result.failed += 1;
                result.failures.push((outcome.endpoint, error));
            }
        }

        result
    }

    /// Returns `true` if no endpoint failed.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.failed == 0
    }

    /// Converts the result into its verdict.
    ///
    /// # Errors
    ///
    /// Returns an [`AggregateError`] carrying the counts if any endpoint failed.
    pub fn into_result(self) -> Result<Self, AggregateError> {
        if self.is_success() {
            Ok(self)
        } else {
            Err(AggregateError {
                failed: self.failed,
                total: self.total,
            })
        }
    }
}

/// Sends operations to endpoints over a shared HTTP client.
#[derive(Clone, Debug)]
pub struct Dispatcher {
    client: reqwest::Client,
    timeout: Duration,
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new(DEFAULT_TIMEOUT)
    }
}

impl Dispatcher {
    /// Creates a dispatcher whose broadcast requests time out after `timeout`.
    ///
    /// The timeout only bounds [`broadcast`](Self::broadcast); purges always
    /// use [`PURGE_TIMEOUT`].
    #[must_use]
    pub fn new(timeout: Duration) -> Self {
        Self::with_client(reqwest::Client::new(), timeout)
    }

    /// Creates a dispatcher over an existing client.
    #[must_use]
    pub fn with_client(client: reqwest::Client, timeout: Duration) -> Self {
        Self { client, timeout }
    }

    /// Sends `op` to every endpoint concurrently and waits for all outcomes.
    ///
    /// One task is spawned per endpoint. Failures never cancel siblings, so
    /// the round takes as long as the slowest endpoint, bounded by the
    /// timeout. The result holds exactly one outcome per endpoint.
    ///
    /// # Errors
    ///
    /// Returns [`DiscoveryError::NoEndpoints`] if `endpoints` is empty.
    pub async fn broadcast(
        &self,
        endpoints: &[SocketAddr],
        op: &OperationRequest,
    ) -> Result<AggregateResult, DiscoveryError> {
        if endpoints.is_empty() {
            return Err(DiscoveryError::NoEndpoints);
        }

        let op = Arc::new(op.clone());

        let mut pending: FuturesUnordered<_> = endpoints
            .iter()
            .map(|&endpoint| {
                let client = self.client.clone();
                let op = Arc::clone(&op);
                let timeout = self.timeout;

                let task =
                    tokio::spawn(async move { execute(&client, endpoint, &op, timeout).await });

                async move {
                    task.await.unwrap_or_else(|e| {
                        tracing::error!("{endpoint} request task failed: {e}");
                        Outcome::from_error(endpoint, EndpointError::Aborted(e.to_string()))
                    })
                }
            })
            .collect();

        let mut outcomes = Vec::with_capacity(endpoints.len());
        while let Some(outcome) = pending.next().await {
            outcomes.push(outcome);
        }

        let result = AggregateResult::from_outcomes(outcomes);

        tracing::info!(
            "broadcast {} {}: {}/{} succeeded",
            op.method(),
            op.path_and_query(),
            result.total - result.failed,
            result.total
        );

        Ok(result)
    }

    /// Purges `path` on each endpoint in order, stopping at the first failure.
    ///
    /// Every request uses [`PURGE_TIMEOUT`].
    ///
    /// # Errors
    ///
    /// Returns [`PurgeError::Discovery`] if `endpoints` is empty and
    /// [`PurgeError::Endpoint`] for the first endpoint that fails. No request
    /// is sent to endpoints after it.
    pub async fn purge_all(&self, endpoints: &[SocketAddr], path: &str) -> Result<(), PurgeError> {
        if endpoints.is_empty() {
            return Err(DiscoveryError::NoEndpoints.into());
        }

        let op = OperationRequest::purge(path);

        for &endpoint in endpoints {
            let outcome = execute(&self.client, endpoint, &op, PURGE_TIMEOUT).await;

            if let Some(source) = outcome.error {
                return Err(PurgeError::Endpoint { endpoint, source });
            }

            tracing::info!("endpoint {endpoint} purged");
        }

        Ok(())
    }
}

/// Runs one request to completion and logs its outcome.
async fn execute(
    client: &reqwest::Client,
    endpoint: SocketAddr,
    op: &OperationRequest,
    timeout: Duration,
) -> Outcome {
    let outcome = match send(client, endpoint, op, timeout).await {
        Ok(status) => Outcome::from_status(endpoint, status),
        Err(e) => Outcome::from_error(endpoint, e.into()),
    };

    if let Some(error) = &outcome.error {
        tracing::error!("{endpoint} errored with: {error}");
    }

    outcome
}

/// Sends the request and drains the response body, even on error statuses.
async fn send(
    client: &reqwest::Client,
    endpoint: SocketAddr,
    op: &OperationRequest,
    timeout: Duration,
) -> Result<StatusCode, reqwest::Error> {
    let response = op.build(client, endpoint).timeout(timeout).send().await?;
    let status = response.status();
    let body = response.bytes().await?;

    tracing::info!(
        "{}, status: {}, body: {}",
        op.url(endpoint),
        status.as_u16(),
        String::from_utf8_lossy(&body)
    );

    Ok(status)
}

#[cfg(test)]
mod tests {
    use std::time::Instant;

    use bytes::Bytes;
    use http::header::{ACCEPT, HOST};
    use http::{HeaderMap, HeaderValue, Method, Uri};

    use super::*;
    use crate::testing::{closed_port, spawn_backend};

    fn make_op(body: &'static [u8]) -> OperationRequest {
        OperationRequest::forward(
            Method::POST,
            &Uri::from_static("/ban?all=1"),
            &HeaderMap::new(),
            Bytes::from_static(body),
        )
    }

    fn make_outcome(port: u16, error: Option<EndpointError>) -> Outcome {
        Outcome {
            endpoint: SocketAddr::new([10, 0, 0, 1].into(), port),
            status: Some(StatusCode::OK),
            error,
        }
    }

    // AggregateResult tests

    #[test]
    fn aggregate_all_success() {
        let result =
            AggregateResult::from_outcomes(vec![make_outcome(1, None), make_outcome(2, None)]);

        assert_eq!(result.total, 2);
        assert_eq!(result.failed, 0);
        assert!(result.into_result().is_ok());
    }

    #[test]
    fn aggregate_counts_failures() {
        let result = AggregateResult::from_outcomes(vec![
            make_outcome(1, None),
            make_outcome(2, Some(EndpointError::Status(StatusCode::BAD_GATEWAY))),
            make_outcome(3, None),
        ]);

        assert_eq!(result.failures.len(), 1);
        assert_eq!(result.failures[0].0.port(), 2);

        let err = result.into_result().unwrap_err();
        assert_eq!(err, AggregateError { failed: 1, total: 3 });
        assert!(err.to_string().starts_with("1/3 requests failed"));
    }

    #[test]
    fn outcome_non_2xx_is_failure() {
        let endpoint = "10.0.0.1:80".parse().unwrap();

        assert!(Outcome::from_status(endpoint, StatusCode::NO_CONTENT).is_success());
        assert!(!Outcome::from_status(endpoint, StatusCode::NOT_FOUND).is_success());
    }

    // broadcast tests

    #[tokio::test]
    async fn broadcast_rejects_empty_endpoints() {
        let dispatcher = Dispatcher::new(Duration::from_secs(1));
        let err = dispatcher.broadcast(&[], &make_op(b"")).await.unwrap_err();

        assert!(matches!(err, DiscoveryError::NoEndpoints));
    }

    #[tokio::test]
    async fn broadcast_all_success() {
        let a = spawn_backend(StatusCode::OK, Duration::ZERO).await;
        let b = spawn_backend(StatusCode::ACCEPTED, Duration::ZERO).await;
        let dispatcher = Dispatcher::new(Duration::from_secs(5));

        let result = dispatcher
            .broadcast(&[a.addr, b.addr], &make_op(b"payload"))
            .await
            .unwrap();

        assert_eq!(result.total, 2);
        assert!(result.is_success());

        for backend in [&a, &b] {
            let seen = backend.seen.lock().unwrap();
            assert_eq!(seen.len(), 1);
            assert_eq!(seen[0].0, Method::POST);
            assert_eq!(seen[0].1, "/ban?all=1");
            assert_eq!(seen[0].2, Bytes::from_static(b"payload"));
        }
    }

    #[tokio::test]
    async fn broadcast_replays_headers() {
        let backend = spawn_backend(StatusCode::OK, Duration::ZERO).await;
        let mut headers = HeaderMap::new();
        headers.insert("x-token", HeaderValue::from_static("s3cret"));
        headers.insert(HOST, HeaderValue::from_static("proxy.local"));
        headers.append(ACCEPT, HeaderValue::from_static("text/plain"));
        headers.append(ACCEPT, HeaderValue::from_static("application/json"));
        let op = OperationRequest::forward(
            Method::PUT,
            &Uri::from_static("/"),
            &headers,
            Bytes::new(),
        );
        let dispatcher = Dispatcher::new(Duration::from_secs(5));

        dispatcher.broadcast(&[backend.addr], &op).await.unwrap();

        let seen = backend.seen.lock().unwrap();
        let received = &seen[0].3;
        assert_eq!(received["x-token"], "s3cret");
        assert_eq!(received.get_all(ACCEPT).iter().count(), 2);
        assert_eq!(received[HOST], backend.addr.to_string().as_str());
    }

    #[tokio::test]
    async fn broadcast_waits_for_every_endpoint() {
        let ok = spawn_backend(StatusCode::OK, Duration::ZERO).await;
        let failing = spawn_backend(StatusCode::INTERNAL_SERVER_ERROR, Duration::ZERO).await;
        let slow = spawn_backend(StatusCode::OK, Duration::from_millis(200)).await;
        let dispatcher = Dispatcher::new(Duration::from_secs(5));

        let result = dispatcher
            .broadcast(&[failing.addr, ok.addr, slow.addr], &make_op(b""))
            .await
            .unwrap();

        assert_eq!(result.total, 3);
        assert_eq!(result.failed, 1);
        assert_eq!(result.failures[0].0, failing.addr);
        assert_eq!((ok.hits(), failing.hits(), slow.hits()), (1, 1, 1));
        assert!(
            result
                .into_result()
                .unwrap_err()
                .to_string()
                .starts_with("1/3 requests failed")
        );
    }

    #[tokio::test]
    async fn broadcast_records_transport_errors() {
        let ok = spawn_backend(StatusCode::OK, Duration::ZERO).await;
        let closed = closed_port().await;
        let dispatcher = Dispatcher::new(Duration::from_secs(5));

        let result = dispatcher
            .broadcast(&[closed, ok.addr], &make_op(b""))
            .await
            .unwrap();

        assert_eq!(result.total, 2);
        assert_eq!(result.failed, 1);
        assert_eq!(result.failures[0].0, closed);
        assert!(matches!(result.failures[0].1, EndpointError::Transport(_)));
    }

    #[tokio::test]
    async fn broadcast_times_out_slow_endpoints() {
        let ok = spawn_backend(StatusCode::OK, Duration::ZERO).await;
        let hung = spawn_backend(StatusCode::OK, Duration::from_secs(10)).await;
        let dispatcher = Dispatcher::new(Duration::from_millis(200));

        let started = Instant::now();
        let result = dispatcher
            .broadcast(&[ok.addr, hung.addr], &make_op(b""))
            .await
            .unwrap();

        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(result.total, 2);
        assert_eq!(result.failed, 1);
        assert_eq!(result.failures[0].0, hung.addr);
        assert!(matches!(
            &result.failures[0].1,
            EndpointError::Transport(e) if e.is_timeout()
        ));
    }

    #[tokio::test]
    async fn broadcast_runs_endpoints_concurrently() {
        let mut endpoints = Vec::new();
        for _ in 0..4 {
            let backend = spawn_backend(StatusCode::OK, Duration::from_millis(400)).await;
            endpoints.push(backend.addr);
        }
        let dispatcher = Dispatcher::new(Duration::from_secs(5));

        let started = Instant::now();
        let result = dispatcher.broadcast(&endpoints, &make_op(b"")).await.unwrap();

        assert!(result.is_success());
        assert!(started.elapsed() < Duration::from_millis(1600));
    }

    #[tokio::test]
    async fn broadcast_dispatches_duplicates_twice() {
        let backend = spawn_backend(StatusCode::OK, Duration::ZERO).await;
        let dispatcher = Dispatcher::new(Duration::from_secs(5));

        let result = dispatcher
            .broadcast(&[backend.addr, backend.addr], &make_op(b""))
            .await
            .unwrap();

        assert_eq!(result.total, 2);
        assert_eq!(backend.hits(), 2);
    }

    // purge_all tests

    #[tokio::test]
    async fn purge_all_rejects_empty_endpoints() {
        let dispatcher = Dispatcher::new(Duration::from_secs(1));
        let err = dispatcher.purge_all(&[], "/").await.unwrap_err();

        assert!(matches!(err, PurgeError::Discovery(DiscoveryError::NoEndpoints)));
    }

    #[tokio::test]
    async fn purge_all_sends_purge_to_every_endpoint() {
        let a = spawn_backend(StatusCode::OK, Duration::ZERO).await;
        let b = spawn_backend(StatusCode::OK, Duration::ZERO).await;
        let dispatcher = Dispatcher::new(Duration::from_secs(1));

        dispatcher.purge_all(&[a.addr, b.addr], "/articles/7").await.unwrap();

        for backend in [&a, &b] {
            let seen = backend.seen.lock().unwrap();
            assert_eq!(seen.len(), 1);
            assert_eq!(seen[0].0.as_str(), "PURGE");
            assert_eq!(seen[0].1, "/articles/7");
            assert!(seen[0].2.is_empty());
        }
    }

    #[tokio::test]
    async fn purge_all_halts_on_first_failure() {
        let e1 = spawn_backend(StatusCode::INTERNAL_SERVER_ERROR, Duration::ZERO).await;
        let e2 = spawn_backend(StatusCode::OK, Duration::ZERO).await;
        let e3 = spawn_backend(StatusCode::OK, Duration::ZERO).await;
        let dispatcher = Dispatcher::new(Duration::from_secs(1));

        let err = dispatcher
            .purge_all(&[e1.addr, e2.addr, e3.addr], "/")
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            PurgeError::Endpoint { endpoint, source: EndpointError::Status(status) }
                if endpoint == e1.addr && status == StatusCode::INTERNAL_SERVER_ERROR
        ));
        assert_eq!((e1.hits(), e2.hits(), e3.hits()), (1, 0, 0));
    }

    #[tokio::test]
    async fn purge_all_halts_on_transport_error() {
        let e1 = spawn_backend(StatusCode::OK, Duration::ZERO).await;
        let closed = closed_port().await;
        let e3 = spawn_backend(StatusCode::OK, Duration::ZERO).await;
        let dispatcher = Dispatcher::new(Duration::from_secs(1));

        let err = dispatcher
            .purge_all(&[e1.addr, closed, e3.addr], "/")
            .await
            .unwrap_err();

        assert!(matches!(err, PurgeError::Endpoint { endpoint, .. } if endpoint == closed));
        assert_eq!((e1.hits(), e3.hits()), (1, 0));
    }

    #[tokio::test]
    async fn purge_all_ignores_broadcast_timeout() {
        let slow = spawn_backend(StatusCode::OK, Duration::from_millis(300)).await;
        let dispatcher = Dispatcher::new(Duration::from_millis(50));

        dispatcher.purge_all(&[slow.addr], "/").await.unwrap();

        assert_eq!(slow.hits(), 1);
    }

    #[test]
    fn default_dispatcher_uses_default_timeout() {
        assert_eq!(Dispatcher::default().timeout, DEFAULT_TIMEOUT);
    }
}
