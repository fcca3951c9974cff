//! Per-volume background loops: TTL sweep, pendent pump and state refresh.
//!
//! Every loop watches a shared shutdown flag and exits at the next tick once
//! it flips to `true` or its sender is dropped.

use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::volume::LocalVolume;

/// Interval between TTL sweeps.
pub const TTL_INTERVAL: Duration = Duration::from_secs(1);
/// Sleep of the pendent pump when its queue is empty.
pub const PENDENT_IDLE: Duration = Duration::from_secs(1);
/// Interval between filesystem usage refreshes.
pub const STATE_INTERVAL: Duration = Duration::from_secs(10);

/// Returns true once shutdown was requested or its sender is gone.
pub fn is_shutting_down(shutdown: &watch::Receiver<bool>) -> bool {
    let requested = *shutdown.borrow();
    requested || shutdown.has_changed().is_err()
}

/// Sweeps expired files every [`TTL_INTERVAL`].
pub async fn run_ttl_loop(volume: LocalVolume, mut shutdown: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval(TTL_INTERVAL);
    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = shutdown.changed() => {}
        }
        if is_shutting_down(&shutdown) {
            break;
        }
        if let Err(e) = volume.sweep_expired(Utc::now()).await {
            warn!(volume = %volume.id(), error = %e, "ttl sweep failed");
        }
    }
    debug!(volume = %volume.id(), "ttl loop stopped");
}

/// Drains the pendent queue, sleeping [`PENDENT_IDLE`] whenever it is empty.
pub async fn run_pendent_loop(volume: LocalVolume, mut shutdown: watch::Receiver<bool>) {
    loop {
        if is_shutting_down(&shutdown) {
            break;
        }
        match volume.pop_pendent().await {
            Ok(Some(_)) => continue,
            Ok(None) => {}
            Err(e) => warn!(volume = %volume.id(), error = %e, "pendent pop failed"),
        }
        tokio::select! {
            _ = tokio::time::sleep(PENDENT_IDLE) => {}
            _ = volume.pendent_queued() => {}
            _ = shutdown.changed() => {}
        }
    }
    debug!(volume = %volume.id(), "pendent loop stopped");
}

/// Refreshes filesystem usage every [`STATE_INTERVAL`].
pub async fn run_state_loop(volume: LocalVolume, mut shutdown: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval(STATE_INTERVAL);
    // the first tick fires immediately and open() already refreshed
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = shutdown.changed() => {}
        }
        if is_shutting_down(&shutdown) {
            break;
        }
        if let Err(e) = volume.refresh_state().await {
            warn!(volume = %volume.id(), error = %e, "state refresh failed");
        }
    }
    debug!(volume = %volume.id(), "state loop stopped");
}

/// Spawns every background loop of `volume`.
pub fn spawn_volume_loops(volume: &LocalVolume, shutdown: &watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
    vec![
        tokio::spawn(run_ttl_loop(volume.clone(), shutdown.clone())),
        tokio::spawn(run_pendent_loop(volume.clone(), shutdown.clone())),
        tokio::spawn(run_state_loop(volume.clone(), shutdown.clone())),
    ]
}
