//! Kubernetes endpoint discovery using `Endpoints` list queries.
//!
//! This module resolves the full set of backend addresses for a logical
//! service. Nothing is cached: every call lists the cluster state afresh.
//!
//! # How It Works
//!
//! 1. Lists `Endpoints` objects matching a label selector in each namespace
//! 2. Walks every subset of every returned object
//! 3. Keeps subset ports whose name is one of the configured port names
//! 4. Pairs every subset address with each kept port number
//!
//! Addresses are not deduplicated. An address that appears in several
//! subsets (or under several eligible ports) is dispatched to once per
//! appearance.
//!
//! # Example
//!
//! ```ignore
//! use k8s_proxy::{KubeEndpointSource, Resolver, Selector, connect};
//!
//! let client = connect(None, None).await?;
//! let resolver = Resolver::new(KubeEndpointSource::new(client));
//!
//! let selector = Selector::new(["default"], ["app=cache"], ["http"]);
//! let endpoints = resolver.resolve(&selector).await?;
//! ```

use std::collections::HashSet;
use std::future::Future;
use std::net::{IpAddr, SocketAddr};
use std::path::Path;

use k8s_openapi::api::core::v1::{EndpointPort, Endpoints};
use kube::api::ListParams;
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Api, Client, Config};

use crate::error::{BoxError, DiscoveryError};

/// Selects the endpoints of a service across one or more namespaces.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Selector {
    /// Namespaces to query, in order.
    pub namespaces: Vec<String>,

    /// `key=value` label terms, joined with `,` into a single query.
    pub labels: Vec<String>,

    /// Port names eligible for dispatch.
    pub port_names: HashSet<String>,
}

impl Selector {
    /// Creates a new selector.
    #[must_use]
    pub fn new<N, L, P>(namespaces: N, labels: L, port_names: P) -> Self
    where
        N: IntoIterator,
        N::Item: Into<String>,
        L: IntoIterator,
        L::Item: Into<String>,
        P: IntoIterator,
        P::Item: Into<String>,
    {
        Self {
            namespaces: namespaces.into_iter().map(Into::into).collect(),
            labels: labels.into_iter().map(Into::into).collect(),
            port_names: port_names.into_iter().map(Into::into).collect(),
        }
    }

    /// Returns the label selector sent to the cluster.
    #[must_use]
    pub fn label_query(&self) -> String {
        self.labels.join(",")
    }
}

/// Selects the instances of one service in a single namespace, on a single
/// required port name.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InstanceSelector {
    /// Namespace to query.
    pub namespace: String,

    /// `key=value` label terms.
    pub labels: Vec<String>,

    /// The port name every instance must expose.
    pub port_name: String,
}

impl InstanceSelector {
    /// Creates a new instance selector.
    #[must_use]
    pub fn new<L>(namespace: impl Into<String>, labels: L, port_name: impl Into<String>) -> Self
    where
        L: IntoIterator,
        L::Item: Into<String>,
    {
        Self {
            namespace: namespace.into(),
            labels: labels.into_iter().map(Into::into).collect(),
            port_name: port_name.into(),
        }
    }

    /// Returns the label selector sent to the cluster.
    #[must_use]
    pub fn label_query(&self) -> String {
        self.labels.join(",")
    }
}

/// Cluster-state capability: lists `Endpoints` objects by label selector.
pub trait EndpointSource: Send + Sync {
    /// Lists the `Endpoints` objects in `namespace` matching `label_selector`.
    ///
    /// An empty selector matches every object in the namespace.
    fn list_endpoints(
        &self,
        namespace: &str,
        label_selector: &str,
    ) -> impl Future<Output = Result<Vec<Endpoints>, BoxError>> + Send;
}

/// [`EndpointSource`] backed by the Kubernetes API.
#[derive(Clone)]
pub struct KubeEndpointSource {
    client: Client,
}

impl KubeEndpointSource {
    /// Wraps a connected kube client.
    #[must_use]
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

impl EndpointSource for KubeEndpointSource {
    async fn list_endpoints(
        &self,
        namespace: &str,
        label_selector: &str,
    ) -> Result<Vec<Endpoints>, BoxError> {
        let api: Api<Endpoints> = Api::namespaced(self.client.clone(), namespace);

        let mut params = ListParams::default();
        if !label_selector.is_empty() {
            params = params.labels(label_selector);
        }

        Ok(api.list(&params).await?.items)
    }
}

/// Connects to the Kubernetes API.
///
/// With an explicit kubeconfig path, that file is loaded (using `context` if
/// given). With only a context, the default kubeconfig is loaded with that
/// context. Otherwise the configuration is inferred: local kubeconfig first,
/// then the in-cluster service account.
///
/// # Errors
///
/// Returns an error if the kubeconfig cannot be read or the client cannot be
/// built from it.
pub async fn connect(
    kube_config: Option<&Path>,
    context: Option<&str>,
) -> Result<Client, BoxError> {
    let options = KubeConfigOptions {
        context: context.map(str::to_string),
        ..KubeConfigOptions::default()
    };

    let config = match (kube_config, context) {
        (Some(path), _) => {
            let kubeconfig = Kubeconfig::read_from(path)?;
            Config::from_custom_kubeconfig(kubeconfig, &options).await?
        }
        (None, Some(_)) => Config::from_kubeconfig(&options).await?,
        (None, None) => Config::infer().await?,
    };

    tracing::debug!("Connecting to Kubernetes API at {}", config.cluster_url);

    Ok(Client::try_from(config)?)
}

/// Resolves selectors into endpoint addresses against an [`EndpointSource`].
pub struct Resolver<S> {
    source: S,
}

impl<S: EndpointSource> Resolver<S> {
    /// Creates a resolver over the given cluster-state source.
    #[must_use]
    pub fn new(source: S) -> Self {
        Self { source }
    }

    /// The underlying cluster-state source.
    #[must_use]
    pub fn source(&self) -> &S {
        &self.source
    }

    /// Resolves every address matching `selector`.
    ///
    /// Namespaces are queried in order; the first failing query aborts the
    /// whole resolution.
    ///
    /// # Errors
    ///
    /// Returns [`DiscoveryError::QueryFailed`] if any namespace query fails and
    /// [`DiscoveryError::NoEndpoints`] if nothing matched.
    pub async fn resolve(&self, selector: &Selector) -> Result<Vec<SocketAddr>, DiscoveryError> {
        let endpoints = self.collect(selector).await?;

        if endpoints.is_empty() {
            return Err(DiscoveryError::NoEndpoints);
        }

        Ok(endpoints)
    }

    /// Runs one resolution pass to verify cluster access.
    ///
    /// Unlike [`Resolver::resolve`], finding zero endpoints is not an error.
    ///
    /// # Errors
    ///
    /// Returns [`DiscoveryError::QueryFailed`] if any namespace query fails.
    pub async fn check(&self, selector: &Selector) -> Result<usize, DiscoveryError> {
        let endpoints = self.collect(selector).await?;

        if endpoints.is_empty() {
            tracing::warn!(
                "no endpoints currently match labels {} in namespaces {}",
                selector.label_query(),
                selector.namespaces.join(",")
            );
        }

        Ok(endpoints.len())
    }

    /// Resolves the instances of a single service.
    ///
    /// Endpoint objects without the required port contribute nothing.
    ///
    /// # Errors
    ///
    /// Returns [`DiscoveryError::QueryFailed`] if the query fails,
    /// [`DiscoveryError::NoInstances`] if no endpoint object matched the labels
    /// and [`DiscoveryError::NoEndpoints`] if objects matched but none exposed
    /// an address on the required port.
    pub async fn resolve_instances(
        &self,
        selector: &InstanceSelector,
    ) -> Result<Vec<SocketAddr>, DiscoveryError> {
        let labels = selector.label_query();
        let objects = self.list(&selector.namespace, &labels).await?;

        if objects.is_empty() {
            return Err(DiscoveryError::NoInstances {
                namespace: selector.namespace.clone(),
                labels,
            });
        }

        let endpoints: Vec<SocketAddr> = objects
            .iter()
            .flat_map(|object| extract_instance_endpoints(object, &selector.port_name))
            .collect();

        if endpoints.is_empty() {
            return Err(DiscoveryError::NoEndpoints);
        }

        tracing::info!(
            "{} endpoints found in namespace {} with labels {labels}",
            endpoints.len(),
            selector.namespace
        );

        Ok(endpoints)
    }

    /// Lists every endpoint object of `namespace` to verify cluster access.
    ///
    /// # Errors
    ///
    /// Returns [`DiscoveryError::QueryFailed`] if the query fails.
    pub async fn check_namespace(&self, namespace: &str) -> Result<(), DiscoveryError> {
        self.list(namespace, "").await.map(|_| ())
    }

    async fn collect(&self, selector: &Selector) -> Result<Vec<SocketAddr>, DiscoveryError> {
        let labels = selector.label_query();
        let mut endpoints = Vec::new();

        for namespace in &selector.namespaces {
            for object in self.list(namespace, &labels).await? {
                for addr in extract_endpoints(&object, &selector.port_names) {
                    tracing::debug!(
                        "{addr} endpoint found in namespace {namespace} with labels {labels}"
                    );
                    endpoints.push(addr);
                }
            }
        }

        tracing::info!(
            "{} endpoints found in namespaces {} with labels {labels}",
            endpoints.len(),
            selector.namespaces.join(",")
        );

        Ok(endpoints)
    }

    async fn list(&self, namespace: &str, labels: &str) -> Result<Vec<Endpoints>, DiscoveryError> {
        self.source
            .list_endpoints(namespace, labels)
            .await
            .map_err(|source| DiscoveryError::QueryFailed {
                namespace: namespace.to_string(),
                source,
            })
    }
}

/// Extracts addresses for every subset port whose name is in `port_names`.
fn extract_endpoints(object: &Endpoints, port_names: &HashSet<String>) -> Vec<SocketAddr> {
    let mut addrs = Vec::new();

    for subset in object.subsets.iter().flatten() {
        let addresses = subset.addresses.as_deref().unwrap_or_default();

        for port in subset.ports.iter().flatten() {
            let eligible = port
                .name
                .as_deref()
                .is_some_and(|name| port_names.contains(name));

            if !eligible {
                continue;
            }

            let Some(number) = port_number(port) else {
                continue;
            };

            addrs.extend(addresses.iter().filter_map(|a| parse_address(&a.ip, number)));
        }
    }

    addrs
}

/// Extracts addresses of subsets exposing the port named `port_name`.
fn extract_instance_endpoints(object: &Endpoints, port_name: &str) -> Vec<SocketAddr> {
    let mut addrs = Vec::new();

    for subset in object.subsets.iter().flatten() {
        // Last declaration wins if a subset repeats the name
        let Some(number) = subset
            .ports
            .iter()
            .flatten()
            .filter(|p| p.name.as_deref() == Some(port_name))
            .filter_map(port_number)
            .last()
        else {
            continue;
        };

        let addresses = subset.addresses.as_deref().unwrap_or_default();
        addrs.extend(addresses.iter().filter_map(|a| parse_address(&a.ip, number)));
    }

    addrs
}

fn port_number(port: &EndpointPort) -> Option<u16> {
    let number = u16::try_from(port.port).ok();
    if number.is_none() {
        tracing::warn!("skipping port {:?} with invalid number {}", port.name, port.port);
    }

    number
}

fn parse_address(ip: &str, port: u16) -> Option<SocketAddr> {
    match ip.parse::<IpAddr>() {
        Ok(ip) => Some(SocketAddr::new(ip, port)),
        Err(_) => {
            tracing::warn!("skipping invalid endpoint address {ip:?}");
            None
        }
    }
}
