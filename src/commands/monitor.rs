//! Monitor command handler.
//!
//! Runs the monitoring scheduler and the health endpoint until Ctrl-C.

use std::sync::Arc;
use tokio::sync::watch;
use tracing::{info, warn};

use super::Engine;
use crate::config::EngineConfig;
use crate::health::{create_health_state, run_health_server};
use crate::scheduler::MonitorScheduler;

/// Run the monitoring loop over every account in the store.
///
/// # Arguments
/// * `config` - Loaded engine configuration
/// * `health_port` - Overrides `config.health_port`
/// * `paper` - Execute every trade on the simulated gateway
///
/// # Errors
/// Returns error if the store cannot be opened or the scheduler stops with an error.
pub async fn run_monitor(
    config: EngineConfig,
    health_port: Option<u16>,
    paper: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    info!("--- pairtrader: Monitoring Mode ---");
    if paper {
        warn!("Paper mode: every trade executes on the simulated gateway");
    }

    let engine = Engine::build(config, paper, None).await?;

    let health = create_health_state();
    let port = health_port.unwrap_or(engine.config.health_port);
    tokio::spawn(run_health_server(port, health.clone()));

    let scheduler = Arc::new(
        MonitorScheduler::new(
            engine.config.scheduler.clone(),
            engine.manager.clone(),
            engine.registry.clone(),
        )
        .with_health(health),
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut handle = tokio::spawn(scheduler.run(shutdown_rx));

    tokio::select! {
        result = &mut handle => {
            result??;
            return Ok(());
        }
        signal = tokio::signal::ctrl_c() => {
            signal?;
            info!("Shutdown requested");
        }
    }

    let _ = shutdown_tx.send(true);
    handle.await??;
    info!("pairtrader stopped");
    Ok(())
}
