//! labelgate
//!
//! Watches container declarations and keeps Cloudflare DNS records, Tunnel
//! ingress rules and Access applications in sync with them.

use anyhow::{Context, Result};
use clap::Parser;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use labelgate::api::{self, AppState};
use labelgate::clock::{Clock, SystemClock};
use labelgate::cloudflare::{ApiRouter, CredentialRouter};
use labelgate::config::{Cli, Config, LogConfig};
use labelgate::ledger::{Ledger, MemoryLedger};
use labelgate::operator::{AccessOperator, DnsOperator, HttpIpResolver, TunnelOperator};
use labelgate::reconciler::{Operators, Reconciler};
use labelgate::source::FileSource;

fn init_logging(config: &LogConfig) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));
    let builder = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false);

    if config.format == "json" {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = Config::load(&cli)?;
    init_logging(&config.log);

    info!(version = env!("CARGO_PKG_VERSION"), "Starting labelgate");

    let shutdown = CancellationToken::new();
    let signal = shutdown.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Shutdown signal received");
                signal.cancel();
            }
            Err(e) => error!(error = %e, "Failed to listen for shutdown signal"),
        }
    });

    // Cloudflare
    let credentials = Arc::new(CredentialRouter::from_config(
        &config.cloudflare,
        shutdown.clone(),
    )?);
    if config.skip_credential_validation {
        warn!("Skipping credential validation");
    } else {
        credentials
            .validate()
            .await
            .context("Credential validation failed")?;
    }
    info!(tunnels = ?credentials.tunnel_names(), "Cloudflare credentials loaded");
    let router: Arc<dyn ApiRouter> = credentials.clone();

    // Ledger
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let ledger: Arc<dyn Ledger> = match &config.ledger.path {
        Some(path) => Arc::new(
            MemoryLedger::open(path, clock.clone())
                .await
                .with_context(|| format!("Failed to open ledger {}", path.display()))?,
        ),
        None => {
            warn!("No ledger path configured, managed resources are forgotten on restart");
            Arc::new(MemoryLedger::with_clock(clock.clone()))
        }
    };

    // Operators
    let public_ip = Arc::new(HttpIpResolver::new(&config.public_ip)?);
    let access = AccessOperator::new(router.clone(), ledger.clone());
    let access = match access.check_permissions().await {
        Ok(()) => Some(access),
        Err(e) => {
            warn!(error = %format!("{:#}", e), "Access operator disabled");
            None
        }
    };
    let operators = Operators {
        dns: Some(DnsOperator::new(router.clone(), ledger.clone(), public_ip)),
        tunnel: Some(TunnelOperator::new(router.clone(), ledger.clone())),
        access,
    };

    let source = Arc::new(FileSource::new(
        &config.source.path,
        Duration::from_secs(config.source.poll_secs),
    ));
    let reconciler = Arc::new(Reconciler::new(
        source,
        ledger,
        operators,
        clock,
        &config.sync,
    ));

    // Health API
    let api_task = config.api.enabled.then(|| {
        let state = AppState {
            reconciler: reconciler.clone(),
            cloudflare: Some(credentials.clone()),
        };
        let address = config.api.address.clone();
        let token = shutdown.clone();
        tokio::spawn(async move { api::serve(&address, state, token).await })
    });

    reconciler.run(shutdown.clone()).await?;
    shutdown.cancel();

    if let Some(task) = api_task {
        match task.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!(error = %format!("{:#}", e), "API server stopped with error"),
            Err(e) => error!(error = %e, "API task panicked"),
        }
    }

    info!("labelgate stopped");
    Ok(())
}
