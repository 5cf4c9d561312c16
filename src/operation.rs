//! Per-target HTTP requests built from a single template.
//!
//! A template is built once per invocation and replayed against every
//! resolved endpoint. The body is buffered up front so each target gets its
//! own copy without re-reading the inbound stream.

use std::net::SocketAddr;
use std::sync::LazyLock;

use bytes::Bytes;
use http::{HeaderMap, Method, Uri};

/// The cache invalidation verb.
pub static PURGE: LazyLock<Method> =
    LazyLock::new(|| Method::from_bytes(b"PURGE").expect("PURGE is a valid method token"));

/// Headers describing the inbound connection rather than the request.
///
/// `host` is included: the client derives it from each target URL.
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "host",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "proxy-connection",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Template for the request sent to every endpoint.
#[derive(Clone, Debug)]
pub struct OperationRequest {
    method: Method,
    path_and_query: String,
    headers: HeaderMap,
    body: Option<Bytes>,
}

impl OperationRequest {
    /// Builds a template replaying an inbound request.
    ///
    /// Method, path, query, headers and body are copied; connection-scoped
    /// headers are dropped. An empty body is sent as no body.
    #[must_use]
    pub fn forward(method: Method, uri: &Uri, headers: &HeaderMap, body: Bytes) -> Self {
        let mut headers = headers.clone();
        for name in HOP_BY_HOP {
            headers.remove(*name);
        }

        Self {
            method,
            path_and_query: uri
                .path_and_query()
                .map_or_else(|| "/".to_string(), ToString::to_string),
            headers,
            body: (!body.is_empty()).then_some(body),
        }
    }

    /// Builds a bodiless `PURGE` template for `path`.
    #[must_use]
    pub fn purge(path: &str) -> Self {
        let path_and_query = if path.starts_with('/') {
            path.to_string()
        } else {
            format!("/{path}")
        };

        Self {
            method: PURGE.clone(),
            path_and_query,
            headers: HeaderMap::new(),
            body: None,
        }
    }

    /// The request method.
    #[must_use]
    pub fn method(&self) -> &Method {
        &self.method
    }

    /// The request path and query string.
    #[must_use]
    pub fn path_and_query(&self) -> &str {
        &self.path_and_query
    }

    /// Headers sent to every target.
    #[must_use]
    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// The buffered body, if any.
    #[must_use]
    pub fn body(&self) -> Option<&Bytes> {
        self.body.as_ref()
    }

    /// The full URL of this request on `target`.
    #[must_use]
    pub fn url(&self, target: SocketAddr) -> String {
        format!("http://{target}{}", self.path_and_query)
    }

    /// Builds the request for one target. The body is shared, not copied.
    pub(crate) fn build(
        &self,
        client: &reqwest::Client,
        target: SocketAddr,
    ) -> reqwest::RequestBuilder {
        let builder = client
            .request(self.method.clone(), self.url(target))
            .headers(self.headers.clone());

        match &self.body {
            Some(body) => builder.body(body.clone()),
            None => builder,
        }
    }
}
