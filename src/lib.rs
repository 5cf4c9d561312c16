#![deny(missing_docs)]
#![deny(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

//! Broadcast HTTP requests to every Kubernetes endpoint of a service.
//!
//! Some operations have to reach every replica of a service rather than one
//! load-balanced instance: cache invalidation, configuration reloads, local
//! state flushes. This crate discovers the live endpoints of a service from
//! the Kubernetes `Endpoints` API and sends the same HTTP request to each of
//! them, reporting a single verdict.
//!
//! # Features
//!
//! - **Fresh discovery**: Endpoints are listed on every call, across several
//!   namespaces, filtered by label selector and named port
//! - **Broadcast**: Replays an inbound request against all endpoints
//!   concurrently and waits for every outcome
//! - **Purge**: Sends a `PURGE` to each cache instance in turn, stopping at
//!   the first failure
//!
//! # Usage
//!
//! ```ignore
//! use std::sync::Arc;
//! use std::time::Duration;
//! use http::Method;
//! use k8s_proxy::{
//!     AllowedMethods, ForwardConfig, KubeEndpointSource, Proxy, Selector, connect, forward_router,
//! };
//!
//! let config = ForwardConfig {
//!     selector: Selector::new(["default"], ["app=cache"], ["http"]),
//!     timeout: Duration::from_secs(5),
//!     methods: AllowedMethods::new([Method::POST]),
//! };
//!
//! let client = connect(None, None).await?;
//! let proxy = Arc::new(Proxy::new(KubeEndpointSource::new(client), &config));
//!
//! let router = forward_router(proxy, config.methods.clone());
//! k8s_proxy::serve(router, 8080).await?;
//! ```

mod config;
mod dispatch;
mod error;
mod k8s;
mod operation;
mod proxy;
mod server;

#[cfg(test)]
mod testing;

pub use config::{Cli, Command, ForwardArgs, ForwardConfig, PurgeArgs, PurgeConfig};
pub use dispatch::{AggregateResult, DEFAULT_TIMEOUT, Dispatcher, Outcome, PURGE_TIMEOUT};
pub use error::{
    AggregateError, BoxError, DiscoveryError, EndpointError, ForwardError, PurgeError,
};
pub use k8s::{EndpointSource, InstanceSelector, KubeEndpointSource, Resolver, Selector, connect};
pub use operation::{OperationRequest, PURGE};
pub use proxy::{Proxy, Purger};
pub use server::{AllowedMethods, MAX_BODY_BYTES, forward_router, purge_router, serve};
