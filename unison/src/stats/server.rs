use std::net::SocketAddr;

use axum::routing::get;
use axum::Router;
use structopt::StructOpt;
use thiserror::Error;

use crate::stats;

#[derive(StructOpt, Clone)]
pub struct MetricsOpt {
    /// Address for the Prometheus metrics listener; omit to disable
    #[structopt(long, env = "UNISON_METRICS_LISTEN")]
    metrics_listen: Option<SocketAddr>,
}

#[derive(Debug, Error)]
#[error("starting metrics server: {0}")]
pub struct StartError(#[from] tokio::io::Error);

/// Bind the metrics endpoint and serve it in the background. A missing
/// listen address disables the endpoint entirely.
pub async fn start(opt: &MetricsOpt) -> Result<(), StartError> {
    let Some(addr) = opt.metrics_listen else {
        return Ok(());
    };

    let app = Router::new().route("/metrics", get(metrics));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    log::info!("metrics listening on {addr}");

    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            log::error!("metrics server: {e}");
        }
    });

    Ok(())
}

async fn metrics() -> String {
    stats::get().to_string()
}
