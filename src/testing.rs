//! Shared fixtures for unit tests.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::Router;
use bytes::Bytes;
use http::{HeaderMap, Method, StatusCode, Uri};
use k8s_openapi::api::core::v1::{EndpointAddress, EndpointPort, EndpointSubset, Endpoints};
use tokio::net::TcpListener;

use crate::error::BoxError;
use crate::k8s::EndpointSource;

/// In-memory cluster state that records every query.
#[derive(Default)]
pub(crate) struct FakeSource {
    objects: HashMap<String, Vec<Endpoints>>,
    failing: HashSet<String>,
    pub(crate) queries: Mutex<Vec<(String, String)>>,
}

impl FakeSource {
    pub(crate) fn with(mut self, namespace: &str, objects: Vec<Endpoints>) -> Self {
        self.objects.insert(namespace.to_string(), objects);
        self
    }

    pub(crate) fn failing(mut self, namespace: &str) -> Self {
        self.failing.insert(namespace.to_string());
        self
    }

    pub(crate) fn queried_namespaces(&self) -> Vec<String> {
        self.queries
            .lock()
            .unwrap()
            .iter()
            .map(|(ns, _)| ns.clone())
            .collect()
    }

    pub(crate) fn query_count(&self) -> usize {
        self.queries.lock().unwrap().len()
    }
}

impl EndpointSource for FakeSource {
    async fn list_endpoints(
        &self,
        namespace: &str,
        label_selector: &str,
    ) -> Result<Vec<Endpoints>, BoxError> {
        self.queries
            .lock()
            .unwrap()
            .push((namespace.to_string(), label_selector.to_string()));

        if self.failing.contains(namespace) {
            return Err("endpoints is forbidden".into());
        }

        Ok(self.objects.get(namespace).cloned().unwrap_or_default())
    }
}

// Helper to create an endpoint port
pub(crate) fn make_port(name: Option<&str>, port: i32) -> EndpointPort {
    EndpointPort {
        name: name.map(String::from),
        port,
        ..Default::default()
    }
}

// Helper to create a subset with addresses and ports
pub(crate) fn make_subset(addresses: Vec<&str>, ports: Vec<EndpointPort>) -> EndpointSubset {
    EndpointSubset {
        addresses: Some(
            addresses
                .into_iter()
                .map(|ip| EndpointAddress {
                    ip: ip.to_string(),
                    ..Default::default()
                })
                .collect(),
        ),
        ports: Some(ports),
        ..Default::default()
    }
}

pub(crate) fn make_object(subsets: Vec<EndpointSubset>) -> Endpoints {
    Endpoints {
        subsets: Some(subsets),
        ..Default::default()
    }
}

// One subset per address, each exposing its own port under `port_name`
pub(crate) fn object_for(addrs: &[SocketAddr], port_name: &str) -> Endpoints {
    let subsets = addrs
        .iter()
        .map(|addr| {
            let ip = addr.ip().to_string();
            make_subset(
                vec![ip.as_str()],
                vec![make_port(Some(port_name), i32::from(addr.port()))],
            )
        })
        .collect();

    make_object(subsets)
}

pub(crate) fn addr(s: &str) -> SocketAddr {
    s.parse().unwrap()
}

/// Local HTTP backend answering every request with a fixed status.
pub(crate) struct Backend {
    pub(crate) addr: SocketAddr,
    hits: Arc<AtomicUsize>,
    pub(crate) seen: Arc<Mutex<Vec<(Method, String, Bytes, HeaderMap)>>>,
}

impl Backend {
    pub(crate) fn hits(&self) -> usize {
        self.hits.load(Ordering::SeqCst)
    }
}

pub(crate) async fn spawn_backend(status: StatusCode, delay: Duration) -> Backend {
    let hits = Arc::new(AtomicUsize::new(0));
    let seen = Arc::new(Mutex::new(Vec::new()));

    let app = Router::new().fallback({
        let hits = Arc::clone(&hits);
        let seen = Arc::clone(&seen);
        move |method: Method, uri: Uri, headers: HeaderMap, body: Bytes| async move {
            hits.fetch_add(1, Ordering::SeqCst);
            seen.lock().unwrap().push((method, uri.to_string(), body, headers));
            tokio::time::sleep(delay).await;
            (status, "backend says hi")
        }
    });

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });

    Backend { addr, hits, seen }
}

// Address with nothing listening on it
pub(crate) async fn closed_port() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap()
}
