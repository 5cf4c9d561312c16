//! Error taxonomy for discovery and dispatch.

use std::net::SocketAddr;

use http::StatusCode;
use thiserror::Error;

/// Boxed error reported by the cluster-state capability.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Discovery failed before any endpoint was contacted.
#[derive(Debug, Error)]
pub enum DiscoveryError {
    /// The cluster query for one namespace failed; earlier results are discarded.
    #[error("query failed in namespace {namespace}: {source}")]
    QueryFailed {
        /// Namespace whose query failed.
        namespace: String,
        /// Underlying cluster client error.
        #[source]
        source: BoxError,
    },

    /// Resolution finished without a single address.
    #[error("no endpoints found")]
    NoEndpoints,

    /// The label query matched no endpoint objects at all.
    #[error("no instances found in namespace {namespace} with labels {labels}")]
    NoInstances {
        /// Namespace that was queried.
        namespace: String,
        /// Label selector used for the query.
        labels: String,
    },
}

/// Failure talking to a single endpoint.
#[derive(Debug, Error)]
pub enum EndpointError {
    /// Connection, timeout or protocol failure.
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    /// The endpoint answered with a non-2xx status.
    #[error("expecting 2xx, found: {0}")]
    Status(StatusCode),

    /// The task driving the request did not run to completion.
    #[error("request task aborted: {0}")]
    Aborted(String),
}

/// Summary of a broadcast round in which at least one endpoint failed.
///
/// Carries counts only; per-endpoint detail lives in the logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("{failed}/{total} requests failed, check logs for more information")]
pub struct AggregateError {
    /// Number of failed endpoints.
    pub failed: usize,
    /// Number of endpoints dispatched to.
    pub total: usize,
}

/// Failure of a forward broadcast.
#[derive(Debug, Error)]
pub enum ForwardError {
    /// Endpoint discovery failed; nothing was dispatched.
    #[error(transparent)]
    Discovery(#[from] DiscoveryError),

    /// At least one endpoint failed.
    #[error(transparent)]
    Aggregate(#[from] AggregateError),
}

/// Failure of a purge round.
#[derive(Debug, Error)]
pub enum PurgeError {
    /// Endpoint discovery failed; nothing was purged.
    #[error(transparent)]
    Discovery(#[from] DiscoveryError),

    /// The first failing endpoint; later endpoints were not attempted.
    #[error("purge failed for {endpoint}: {source}")]
    Endpoint {
        /// Endpoint that failed.
        endpoint: SocketAddr,
        /// What went wrong.
        #[source]
        source: EndpointError,
    },
}
