use anyhow::Result;
use clap::Parser;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use proxypool::lb::LoadBalancer;
use proxypool::{config, control, proxy};

#[derive(Parser)]
#[command(name = "proxypool")]
#[command(version, about = "Dynamically reconfigurable HTTP reverse-proxy load balancer", long_about = None)]
struct Cli {
    /// Data-plane listen address (overrides config)
    #[arg(long)]
    listen: Option<String>,

    /// Control-plane listen address (overrides config)
    #[arg(long)]
    control_listen: Option<String>,

    /// Config file path
    #[arg(long)]
    config: Option<String>,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| cli.log_level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    runtime.block_on(async_main(cli))
}

async fn async_main(cli: Cli) -> Result<()> {
    let mut config = config::load_config(cli.config.as_deref())?;
    if let Some(listen) = cli.listen {
        config.listen = listen;
    }
    if let Some(listen) = cli.control_listen {
        config.control_listen = listen;
    }

    let balancer = LoadBalancer::start(&config.balancer);
    for url in &config.backends {
        if let Err(e) = balancer.register_backend(url) {
            warn!(backend = %url, error = %e, "skipping configured backend");
        }
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let proxy_task = tokio::spawn(proxy::run_server(
        Arc::clone(&balancer),
        config.listen.clone(),
        shutdown_rx.clone(),
    ));
    let control_task = tokio::spawn(control::run_server(
        Arc::clone(&balancer),
        config.control_listen.clone(),
        shutdown_rx,
    ));

    wait_for_signal().await;
    info!("shutdown signal received");
    shutdown_tx.send_replace(true);

    // Each listener drains its in-flight connections within the grace
    // window before returning.
    let (proxy_res, control_res) = tokio::join!(proxy_task, control_task);
    proxy_res??;
    control_res??;

    info!("shutdown complete");
    Ok(())
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(sigterm) => sigterm,
        Err(e) => {
            warn!("failed to install SIGTERM handler: {}", e);
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = sigterm.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
