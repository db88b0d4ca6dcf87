use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::net::TcpListener;
use tokio::signal;
use tracing::info;
use tracing_subscriber::EnvFilter;

use gqlgate::config::{GateConfig, GateMode};
use gqlgate::pipeline::{AdmissionGate, Pipeline};
use gqlgate::proxy::HttpOrigin;
use gqlgate::registry::OperationRegistry;
use gqlgate::server::{router, GateState};
use gqlgate::signature::SignatureGate;

#[derive(Parser, Debug)]
#[command(
    name = "gqlgate",
    about = "Edge reverse proxy enforcing signature or catalog admission in front of a GraphQL origin"
)]
struct Cli {
    /// Path of the JSON configuration file
    #[arg(long)]
    config: PathBuf,
    /// Override the configured listen address
    #[arg(long)]
    listen: Option<SocketAddr>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = GateConfig::from_file(&cli.config).context("loading configuration")?;
    let listen = cli.listen.unwrap_or(config.listen);

    let gate = match config.mode {
        GateMode::Signature => AdmissionGate::Signature(SignatureGate::new(
            config.pass_through_hash.clone(),
            config.sign_secret.clone(),
            config.max_tokens,
        )),
        GateMode::Store => {
            let path = config
                .operations
                .as_ref()
                .context("store mode requires an operations manifest path")?;
            let registry =
                OperationRegistry::from_manifest_file(path).context("loading operation manifest")?;
            info!(operations = registry.len(), "operation manifest loaded");
            AdmissionGate::Store(Arc::new(registry))
        }
    };

    let origin = HttpOrigin::new(config.origin_url.clone()).context("building origin client")?;
    let pipeline = Pipeline::new(
        gate,
        Arc::new(origin),
        config.origin_url.clone(),
        config.response_rules.clone(),
    );
    let app = router(GateState::new(Arc::new(pipeline)));

    let listener = TcpListener::bind(listen)
        .await
        .with_context(|| format!("failed to bind {listen}"))?;
    info!(%listen, mode = ?config.mode, origin = %config.origin_url, "gqlgate listening");
    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server exited unexpectedly")?;
    Ok(())
}

async fn shutdown_signal() {
    let _ = signal::ctrl_c().await;
}
