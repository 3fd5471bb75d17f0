mod children;
mod config;
mod crd;
mod error;
mod gateway;
mod harvester;
mod metrics;
mod monitor;
mod reconciler;
mod selector;
mod topology;

use clap::Parser;
use tracing::info;

use crate::config::{load_client, Cli};
use crate::gateway::ApiGateway;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let cli = Cli::parse();

    if cli.print_crds {
        crd::print_crds_without_formats()?;
        return Ok(());
    }

    let client = load_client().await?;
    let gateway = ApiGateway::new(client.clone());

    let metrics_addr = cli.metrics_addr.clone();
    tokio::spawn(async move {
        if let Err(e) = serve_metrics(&metrics_addr).await {
            tracing::error!(error = %e, "metrics server exited");
        }
    });

    let monitor_namespace = cli.watch_namespace.clone();
    let monitor_gateway = gateway.clone();
    tokio::spawn(async move {
        monitor::run(monitor_gateway, monitor_namespace).await;
    });

    info!("starting nico-operator reconciler");
    reconciler::run(client).await
}

async fn serve_metrics(addr: &str) -> anyhow::Result<()> {
    use axum::{routing::get, Router};
    use prometheus::{Encoder, TextEncoder};

    async fn handler() -> String {
        let encoder = TextEncoder::new();
        let metric_families = metrics::REGISTRY.gather();
        let mut buf = Vec::new();
        encoder.encode(&metric_families, &mut buf).expect("encode metrics");
        String::from_utf8(buf).expect("metrics are valid utf8")
    }

    let app = Router::new().route("/metrics", get(handler));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(addr, "metrics endpoint listening");
    axum::serve(listener, app).await?;
    Ok(())
}
