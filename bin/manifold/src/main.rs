//! The manifold gateway binary: loads configuration, assembles the
//! [`App`](manifold_network::App) and serves the JSON-RPC surface.

mod server;

use clap::Parser;
use manifold_config::GatewayConfig;
use manifold_network::App;
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "manifold", about = "Fault-tolerant JSON-RPC gateway")]
struct Cli {
    /// Path to the gateway configuration file.
    #[arg(long, short, default_value = "manifold.toml")]
    config: PathBuf,

    /// Override the configured HTTP port.
    #[arg(long)]
    http_port: Option<u16>,

    /// Log filter, e.g. `info,network=debug`.
    #[arg(long, default_value = "info")]
    log: String,
}

fn main() -> eyre::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_new(&cli.log)?)
        .init();

    let raw = std::fs::read_to_string(&cli.config)
        .map_err(|err| eyre::eyre!("cannot read {}: {err}", cli.config.display()))?;
    let mut config: GatewayConfig = toml::from_str(&raw)?;
    if let Some(port) = cli.http_port {
        config.server.http_port = port;
    }

    let runtime = tokio::runtime::Builder::new_multi_thread().enable_all().build()?;
    runtime.block_on(run(config))
}

async fn run(config: GatewayConfig) -> eyre::Result<()> {
    if config.metrics.enabled {
        let addr = std::net::SocketAddr::from(([0, 0, 0, 0], config.metrics.port));
        metrics_exporter_prometheus::PrometheusBuilder::new()
            .with_http_listener(addr)
            .install()?;
        info!(target: "manifold", %addr, "metrics exporter listening");
    }

    let server_config = config.server.clone();
    let app = App::from_config(config).map_err(|err| eyre::eyre!(err.to_string()))?;

    server::serve(app, server_config).await
}
