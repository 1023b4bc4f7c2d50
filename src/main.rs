//! Binary entry-point for the L4 reverse proxy with transport security.
//! Wires together CLI flags, config loading, logging, the metrics sink,
//! and the supervisor; everything else lives in the library crate.

use clap::Parser;
use metrics_exporter_prometheus::PrometheusBuilder;
use tracing::{error, info};
use tracing_subscriber::{filter::LevelFilter, fmt, EnvFilter};

use l4_mtls_proxy::cli::Cli;
use l4_mtls_proxy::config::Config;
use l4_mtls_proxy::metrics::Registry;
use l4_mtls_proxy::supervisor::Supervisor;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let default_level = if cli.debug { LevelFilter::DEBUG } else { LevelFilter::INFO };
    fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(default_level.into()))
        .init();

    if let Err(e) = run(cli).await {
        error!("fatal: {e:?}");
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let (config, config_path) = if cli.is_ad_hoc() {
        let targets = cli
            .target
            .as_deref()
            .ok_or_else(|| anyhow::anyhow!("--target is required in ad-hoc mode"))?;
        let listener = cli.listener.as_deref().expect("checked by is_ad_hoc");
        let config = Config::from_cli_flags(listener, targets, cli.metrics.as_deref())?;
        (config, None)
    } else {
        let config = Config::load(&cli.config)?;
        (config, Some(cli.config.clone()))
    };

    if let Some(m) = &config.metrics {
        let addr: std::net::SocketAddr = m
            .addr()
            .parse()
            .map_err(|e| anyhow::anyhow!("invalid metrics address {}: {e}", m.addr()))?;
        PrometheusBuilder::new()
            .with_http_listener(addr)
            .install()
            .map_err(|e| anyhow::anyhow!("failed to start metrics endpoint: {e}"))?;
        info!(%addr, "metrics endpoint listening");
    }

    let metrics = Registry::sink();
    let supervisor = Supervisor::new(config_path, metrics);
    supervisor.start(&config).await?;
    supervisor.run_until_shutdown().await?;

    Ok(())
}
