//! Fleet controller
//!
//! Runs the fleet reconciliation loop against the in-process platform,
//! seeded from `FLEET_SEED_FILE`. With `FLEET_DEV` set, a stand-in scheduler
//! starts pending instances so fleets can be watched converging end to end.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use fleet_controller::{
    config::{self, Config},
    controller::lifecycle::MemoryReleases,
    platform::memory::MemoryPlatform,
    Controller, FleetReconciler,
};
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// How often the stand-in scheduler starts pending instances.
const SCHEDULING_INTERVAL: Duration = Duration::from_secs(2);

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;

    // Initialize tracing (prefer RUST_LOG, fallback to FLEET_LOG_LEVEL)
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting fleet controller");
    info!(
        concurrency = config.concurrency,
        dev_mode = config.dev_mode,
        seed_file = ?config.seed_file,
        "Configuration loaded"
    );

    let platform = Arc::new(MemoryPlatform::new());
    let releases = Arc::new(MemoryReleases::new());

    if let Some(path) = &config.seed_file {
        let manifests = config::load_seed_file(path).await?;
        for manifest in manifests {
            let fleet = platform.apply_fleet(manifest).await;
            releases.install(fleet.key()).await;
            info!(fleet = %fleet.key(), replicas = fleet.spec.replicas, "Seeded fleet");
        }
    }

    // Create shutdown channel for graceful shutdown
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let reconciler = FleetReconciler::new(platform.clone(), releases)
        .with_settings(config.reconciler_settings());
    let controller = Controller::new(reconciler, config.controller_config()).owns_instances();
    let mut controller_handle = tokio::spawn({
        let shutdown_rx = shutdown_rx.clone();
        async move { controller.run(shutdown_rx).await }
    });

    let scheduler_handle = config.dev_mode.then(|| {
        info!("Simulating scheduling of pending instances (dev mode)");
        tokio::spawn(run_scheduling_simulator(platform.clone(), shutdown_rx.clone()))
    });

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
        result = &mut controller_handle => {
            if let Err(e) = result {
                error!(error = %e, "Controller task panicked");
            }
        }
    }

    // Signal shutdown to all workers
    let _ = shutdown_tx.send(true);

    info!("Waiting for workers to shut down...");
    let shutdown_timeout = Duration::from_secs(10);

    if !controller_handle.is_finished() {
        if let Err(e) = tokio::time::timeout(shutdown_timeout, controller_handle).await {
            warn!(error = %e, "Controller did not shut down in time");
        }
    }

    if let Some(handle) = scheduler_handle {
        if let Err(e) = tokio::time::timeout(shutdown_timeout, handle).await {
            warn!(error = %e, "Scheduling simulator did not shut down in time");
        }
    }

    info!("Fleet controller shutdown complete");
    Ok(())
}

async fn run_scheduling_simulator(
    platform: Arc<MemoryPlatform>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut interval = tokio::time::interval(SCHEDULING_INTERVAL);

    loop {
        tokio::select! {
            _ = interval.tick() => {
                let started = platform.simulate_scheduling().await;
                if started > 0 {
                    info!(started, "Started pending instances");
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
            }
        }
    }
}
