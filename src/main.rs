//! k8s-proxy - broadcast HTTP requests to every matching Kubernetes endpoint
//!
//! Runs in one of two modes:
//! - `forward` replays every allowed request against all matching endpoints
//! - `purge` sends `PURGE <path>` to each instance of a cache service

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use k8s_proxy::{
    Cli, Command, ForwardConfig, KubeEndpointSource, Proxy, PurgeConfig, Purger, connect,
    forward_router, purge_router, serve,
};
use tracing::{Level, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(log_level.into()))
        .init();

    info!("Starting k8s-proxy v{}", env!("CARGO_PKG_VERSION"));

    let client = connect(cli.kube_config.as_deref(), cli.kube_context.as_deref())
        .await
        .map_err(|e| anyhow::anyhow!(e))
        .context("failed to create Kubernetes client")?;
    let source = KubeEndpointSource::new(client);

    let router = match cli.command {
        Command::Forward(args) => {
            let config = ForwardConfig::from(args);
            let proxy = Proxy::new(source, &config);

            let found = proxy
                .check()
                .await
                .context("failed to query Kubernetes endpoints")?;
            info!("{found} endpoints currently match");

            forward_router(Arc::new(proxy), config.methods)
        }

        Command::Purge(args) => {
            let config = PurgeConfig::from(args);
            let purger = Purger::new(source, &config);

            purger
                .check()
                .await
                .context("failed to query Kubernetes endpoints")?;

            purge_router(Arc::new(purger))
        }
    };

    serve(router, cli.http_port).await.context("server failed")?;

    info!("k8s-proxy stopped");
    Ok(())
}
