//! stasiumd — the stasium service-management daemon.
//!
//! # Usage
//!
//! ```text
//! stasiumd [--socket /tmp/stasium.sock] [--manifest stasium.yaml] [--poll-interval 1]
//! ```
//!
//! Serves the NDJSON protocol on a Unix socket, supervises the manifest's
//! processes, and polls all providers on a fixed cadence.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;

use stasium_core::{Kind, LogProvider, Provider};
use stasium_daemon::bootstrap::apply_manifest;
use stasium_daemon::providers::{
    ContainerProvider, FiletailProvider, OsUnitProvider, ProcfsProvider, SupervisedProvider,
};
use stasium_daemon::{Daemon, Supervisor};
use stasium_manifest::validate;

#[derive(Parser, Debug)]
#[command(
    name = "stasiumd",
    version,
    about = "Stasium daemon — service monitor for development environments",
    long_about = None,
)]
struct Cli {
    /// Unix socket path to serve the protocol on.
    #[arg(long, default_value = "/tmp/stasium.sock")]
    socket: PathBuf,

    /// Manifest to load at startup; missing file is not an error.
    #[arg(long, default_value = "stasium.yaml")]
    manifest: PathBuf,

    /// Seconds between provider polls.
    #[arg(long, default_value_t = 1)]
    poll_interval: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    let cancel = CancellationToken::new();
    spawn_signal_handler(cancel.clone())?;

    let supervisor = Arc::new(Supervisor::new(cancel.child_token()));
    let supervised = Arc::new(SupervisedProvider::new(Arc::clone(&supervisor)));
    let containers = Arc::new(ContainerProvider::detect().await);
    let filetail = Arc::new(FiletailProvider::new());

    let mut os_units = Vec::new();
    let mut manifest = None;
    match stasium_manifest::load(&cli.manifest) {
        Ok(loaded) => {
            let errors = validate(&loaded);
            if errors.is_empty() {
                tracing::info!(path = %cli.manifest.display(), items = loaded.items.len(), "manifest loaded");
                let bootstrap = apply_manifest(&loaded, &supervisor, &containers);
                os_units = bootstrap.os_units;
                manifest = Some(loaded);
            } else {
                for error in &errors {
                    tracing::warn!(error = %error, "manifest validation");
                }
            }
        }
        Err(err) => {
            tracing::info!(path = %cli.manifest.display(), error = %err, "no manifest loaded");
        }
    }

    let os_unit_provider = Arc::new(OsUnitProvider::new(os_units.clone()));
    let mut providers: Vec<Arc<dyn Provider>> = Vec::new();
    if !os_units.is_empty() {
        providers.push(Arc::clone(&os_unit_provider) as Arc<dyn Provider>);
    }
    providers.push(Arc::clone(&supervised) as Arc<dyn Provider>);
    providers.push(Arc::clone(&containers) as Arc<dyn Provider>);
    providers.push(Arc::new(ProcfsProvider::new()));

    let log_providers: HashMap<&'static str, Arc<dyn LogProvider>> = HashMap::from([
        (
            Kind::SupervisedProcess.as_str(),
            Arc::clone(&supervised) as Arc<dyn LogProvider>,
        ),
        (
            Kind::Container.as_str(),
            Arc::clone(&containers) as Arc<dyn LogProvider>,
        ),
        (
            Kind::OsUnit.as_str(),
            Arc::clone(&os_unit_provider) as Arc<dyn LogProvider>,
        ),
        (Kind::LogSource.as_str(), filetail as Arc<dyn LogProvider>),
    ]);

    let daemon = Daemon::new(
        &cli.socket,
        cancel.clone(),
        Arc::clone(&supervisor),
        providers,
        log_providers,
    );
    if let Some(manifest) = manifest {
        daemon.install_manifest(manifest).await;
    }

    supervisor.start_all().await;

    let poll = daemon.poll_loop(Duration::from_secs(cli.poll_interval.max(1)));
    let poll_cancel = cancel.child_token();
    tokio::spawn(async move { poll.run(poll_cancel).await });

    tracing::info!(socket = %cli.socket.display(), "starting stasiumd");
    let served = daemon.run().await;

    supervisor.stop_all().await;
    daemon.shutdown();
    served.context("daemon exited with error")?;
    tracing::info!("stasiumd stopped");
    Ok(())
}

fn spawn_signal_handler(cancel: CancellationToken) -> Result<()> {
    let mut sigterm = signal(SignalKind::terminate()).context("install SIGTERM handler")?;
    let mut sigint = signal(SignalKind::interrupt()).context("install SIGINT handler")?;
    tokio::spawn(async move {
        tokio::select! {
            _ = sigterm.recv() => tracing::info!("received SIGTERM, shutting down"),
            _ = sigint.recv() => tracing::info!("received SIGINT, shutting down"),
        }
        cancel.cancel();
    });
    Ok(())
}

fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt().with_env_filter(filter).with_target(false).try_init();
}
