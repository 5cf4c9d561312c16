//! Command line and environment configuration.
//!
//! Every flag can also be set through a `K8S_PROXY_*` environment variable.
//! List-valued flags accept repeated use or comma separated values. The
//! parsed command line is turned into [`ForwardConfig`] or [`PurgeConfig`]
//! once at startup.

use std::path::PathBuf;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use http::Method;

use crate::k8s::{InstanceSelector, Selector};
use crate::server::AllowedMethods;

/// Top-level command line.
#[derive(Parser, Debug)]
#[command(name = "k8s-proxy")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Allows to proxy an HTTP request to all matching endpoints", long_about = None)]
pub struct Cli {
    /// HTTP port to listen on.
    #[arg(long, env = "K8S_PROXY_HTTP_PORT", default_value_t = 8080, global = true)]
    pub http_port: u16,

    /// Path to a kubeconfig file.
    #[arg(long, env = "K8S_PROXY_KUBE_CONFIG", global = true)]
    pub kube_config: Option<PathBuf>,

    /// Kubeconfig context to use.
    #[arg(long, env = "K8S_PROXY_KUBE_CONTEXT", global = true)]
    pub kube_context: Option<String>,

    /// Enable verbose logging.
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// What to serve.
    #[command(subcommand)]
    pub command: Command,
}

/// Serving mode.
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Replay every allowed request against all matching endpoints
    Forward(ForwardArgs),

    /// Purge the requested path on every cache instance
    Purge(PurgeArgs),
}

/// Flags of the `forward` subcommand.
#[derive(Args, Debug)]
pub struct ForwardArgs {
    /// Kubernetes namespaces to search, in order.
    #[arg(
        short = 'n',
        long = "namespace",
        env = "K8S_PROXY_NAMESPACE",
        value_delimiter = ',',
        required = true
    )]
    pub namespaces: Vec<String>,

    /// Endpoint labels to match (`key=value`).
    #[arg(short = 'l', long = "label", env = "K8S_PROXY_LABEL", value_delimiter = ',')]
    pub labels: Vec<String>,

    /// Endpoint port names to target.
    #[arg(
        short = 'p',
        long = "port-name",
        env = "K8S_PROXY_PORT_NAME",
        value_delimiter = ',',
        required = true
    )]
    pub port_names: Vec<String>,

    /// Per-endpoint request timeout (`500ms`, `5s`, `1m`; bare numbers are seconds).
    #[arg(long, env = "K8S_PROXY_TIMEOUT", default_value = "5s", value_parser = parse_timeout)]
    pub timeout: Duration,

    /// HTTP methods allowed.
    #[arg(
        short = 'm',
        long = "method",
        env = "K8S_PROXY_METHOD",
        value_delimiter = ',',
        value_parser = parse_method,
        required = true
    )]
    pub methods: Vec<Method>,
}

/// Flags of the `purge` subcommand.
#[derive(Args, Debug)]
pub struct PurgeArgs {
    /// Kubernetes namespace of the cache service.
    #[arg(short = 'n', long, env = "K8S_PROXY_NAMESPACE")]
    pub namespace: String,

    /// Endpoint labels to match (`key=value`).
    #[arg(short = 'l', long = "label", env = "K8S_PROXY_LABEL", value_delimiter = ',')]
    pub labels: Vec<String>,

    /// Port name the cache listens on.
    #[arg(short = 'p', long = "port-name", env = "K8S_PROXY_PORT_NAME")]
    pub port_name: String,
}

/// Settings of the forward service.
#[derive(Clone, Debug)]
pub struct ForwardConfig {
    /// Which endpoints to broadcast to.
    pub selector: Selector,

    /// Per-endpoint request timeout.
    pub timeout: Duration,

    /// Methods the route accepts.
    pub methods: AllowedMethods,
}

impl From<ForwardArgs> for ForwardConfig {
    fn from(args: ForwardArgs) -> Self {
        Self {
            selector: Selector::new(args.namespaces, args.labels, args.port_names),
            timeout: args.timeout,
            methods: AllowedMethods::new(args.methods),
        }
    }
}

/// Settings of the purge service.
#[derive(Clone, Debug)]
pub struct PurgeConfig {
    /// Which cache instances to purge.
    pub selector: InstanceSelector,
}

impl From<PurgeArgs> for PurgeConfig {
    fn from(args: PurgeArgs) -> Self {
        Self {
            selector: InstanceSelector::new(args.namespace, args.labels, args.port_name),
        }
    }
}

fn parse_timeout(s: &str) -> Result<Duration, String> {
    let s = s.trim();
    let (num, unit_ms) = if let Some(num) = s.strip_suffix("ms") {
        (num, 1)
    } else if let Some(num) = s.strip_suffix('s') {
        (num, 1000)
    } else if let Some(num) = s.strip_suffix('m') {
        (num, 60_000)
    } else if let Some(num) = s.strip_suffix('h') {
        (num, 3_600_000)
    } else {
        (s, 1000)
    };

    let value: u64 = num
        .trim()
        .parse()
        .map_err(|_| format!("invalid timeout {s:?}, use e.g. 500ms, 5s, 1m"))?;

    match value.checked_mul(unit_ms) {
        Some(0) => Err("timeout must be greater than zero".to_string()),
        Some(ms) => Ok(Duration::from_millis(ms)),
        None => Err(format!("timeout {s:?} is too large")),
    }
}

fn parse_method(s: &str) -> Result<Method, String> {
    Method::from_bytes(s.trim().to_ascii_uppercase().as_bytes())
        .map_err(|e| format!("invalid method {s:?}: {e}"))
}
