//! Call-site services tying discovery to dispatch.

use crate::config::{ForwardConfig, PurgeConfig};
use crate::dispatch::{AggregateResult, Dispatcher};
use crate::error::{DiscoveryError, ForwardError, PurgeError};
use crate::k8s::{EndpointSource, InstanceSelector, Resolver, Selector};
use crate::operation::OperationRequest;

/// Replays requests against every endpoint matching a [`Selector`].
pub struct Proxy<S> {
    resolver: Resolver<S>,
    selector: Selector,
    dispatcher: Dispatcher,
}

impl<S: EndpointSource> Proxy<S> {
    /// Creates a proxy over `source` using the given configuration.
    #[must_use]
    pub fn new(source: S, config: &ForwardConfig) -> Self {
        Self {
            resolver: Resolver::new(source),
            selector: config.selector.clone(),
            dispatcher: Dispatcher::new(config.timeout),
        }
    }

    /// Resolves the endpoints afresh and broadcasts `op` to all of them.
    ///
    /// # Errors
    ///
    /// Returns [`ForwardError::Discovery`] if resolution fails, in which case
    /// nothing is sent, and [`ForwardError::Aggregate`] if any endpoint failed.
    pub async fn forward(&self, op: &OperationRequest) -> Result<AggregateResult, ForwardError> {
        let endpoints = self.resolver.resolve(&self.selector).await?;
        let result = self.dispatcher.broadcast(&endpoints, op).await?;

        Ok(result.into_result()?)
    }

    /// Verifies the cluster can be queried with the configured selector.
    ///
    /// # Errors
    ///
    /// Returns [`DiscoveryError::QueryFailed`] if any namespace query fails.
    pub async fn check(&self) -> Result<usize, DiscoveryError> {
        self.resolver.check(&self.selector).await
    }
}

/// Purges a path on every instance of one cache service.
pub struct Purger<S> {
    resolver: Resolver<S>,
    selector: InstanceSelector,
    dispatcher: Dispatcher,
}

impl<S: EndpointSource> Purger<S> {
    /// Creates a purger over `source` using the given configuration.
    #[must_use]
    pub fn new(source: S, config: &PurgeConfig) -> Self {
        Self {
            resolver: Resolver::new(source),
            selector: config.selector.clone(),
            dispatcher: Dispatcher::default(),
        }
    }

    /// Resolves the instances afresh and purges `path` on each, in order.
    ///
    /// # Errors
    ///
    /// Returns [`PurgeError::Discovery`] if resolution fails and
    /// [`PurgeError::Endpoint`] for the first instance that fails.
    pub async fn purge(&self, path: &str) -> Result<(), PurgeError> {
        let endpoints = self.resolver.resolve_instances(&self.selector).await?;

        tracing::info!(
            "purging {path} on {} instances in namespace {}",
            endpoints.len(),
            self.selector.namespace
        );

        self.dispatcher.purge_all(&endpoints, path).await
    }

    /// Verifies the configured namespace can be listed.
    ///
    /// # Errors
    ///
    /// Returns [`DiscoveryError::QueryFailed`] if the query fails.
    pub async fn check(&self) -> Result<(), DiscoveryError> {
        self.resolver.check_namespace(&self.selector.namespace).await
    }
}
