//! sniproute ingress
//!
//! Protocol-sniffing L4 proxy.
//!
//! This service:
//! - Loads host routing from a TOML file
//! - Accepts HTTP and HTTPS on TCP, QUIC on UDP
//! - Reads the Host header, TLS SNI or QUIC Initial SNI without terminating TLS
//! - Relays each connection to the backend its hostname resolves to
//! - Optionally prefixes backend traffic with a PROXY protocol v2 header

use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use tokio::net::TcpListener;
use tokio::task::JoinSet;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use sniproute_ingress::{server, Config, Ingress, IngressMetrics, RoutingFile};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;

    // Initialize tracing (prefer RUST_LOG, fallback to SNIPROUTE_LOG_LEVEL)
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.log_level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting sniproute ingress");
    info!(
        config_file = %config.config_file.display(),
        verbose = config.verbose,
        udp_idle_timeout_secs = config.udp_idle_timeout.as_secs(),
        "Configuration loaded"
    );

    let routing = RoutingFile::load(&config.config_file)
        .with_context(|| format!("Failed to load {}", config.config_file.display()))?;
    let directory = Arc::new(routing.directory().context("Invalid host configuration")?);
    let ingress_addrs = routing.ingress_addrs()?;
    let metrics_addr = routing.metrics_addr()?;

    if ingress_addrs.is_empty() {
        bail!("No listeners configured; set listeners.http, listeners.https or listeners.quic");
    }

    let metrics = IngressMetrics::new().context("Failed to register metrics")?;

    // Bind everything before serving anything
    let mut listeners = Vec::new();
    for (protocol, bind_addr) in ingress_addrs {
        match Ingress::bind(
            protocol,
            bind_addr,
            config.udp_idle_timeout,
            Arc::clone(&directory),
            metrics.clone(),
        )
        .await
        {
            Ok(ingress) => listeners.push(ingress),
            Err(e) => {
                error!(
                    protocol = %protocol,
                    bind_addr = %bind_addr,
                    error = %e,
                    "Failed to bind listener"
                );
                return Err(e)
                    .with_context(|| format!("Failed to bind {protocol} listener on {bind_addr}"));
            }
        }
    }

    let metrics_listener = match metrics_addr {
        Some(addr) => Some(
            TcpListener::bind(addr)
                .await
                .with_context(|| format!("Failed to bind metrics listener on {addr}"))?,
        ),
        None => None,
    };

    let mut tasks = JoinSet::new();
    for ingress in listeners {
        let name = format!("{} {}", ingress.protocol(), ingress.local_addr());
        tasks.spawn(async move { (name, ingress.run().await) });
    }
    if let Some(listener) = metrics_listener {
        tasks.spawn(async move {
            ("metrics".to_string(), server::serve_metrics(listener, metrics).await)
        });
    }

    tokio::select! {
        signal = shutdown_signal() => {
            let signal = signal?;
            info!(signal, "Received shutdown signal");
            Ok(())
        }
        Some(joined) = tasks.join_next() => {
            let (name, result) = joined.map_err(|e| anyhow!("Listener task failed: {e}"))?;
            match result {
                Ok(()) => {
                    error!(listener = %name, "Listener stopped");
                    bail!("{name} listener stopped")
                }
                Err(e) => {
                    error!(listener = %name, error = %e, "Listener failed");
                    Err(e).with_context(|| format!("{name} listener failed"))
                }
            }
        }
    }
}

async fn shutdown_signal() -> Result<&'static str> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut sigterm =
            signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;
        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                result.context("Failed to listen for SIGINT")?;
                Ok("SIGINT")
            }
            _ = sigterm.recv() => Ok("SIGTERM"),
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c()
            .await
            .context("Failed to listen for ctrl-c")?;
        Ok("ctrl-c")
    }
}
