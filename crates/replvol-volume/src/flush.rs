//! Background flusher: re-drives write-back entries whose replica fan-out
//! ended short of the write level, catches up replicas that missed writes
//! which did reach it, and keeps the attach lease alive.

use std::sync::{Arc, Weak};
use std::time::Duration;

use tokio::sync::{Notify, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::coordinator::VolumeCoordinator;

/// Start the flusher for a session
///
/// The task holds only a weak reference and exits once the session is
/// dropped or `shutdown` flips to `true`.
pub(crate) fn spawn(
    coordinator: &Arc<VolumeCoordinator>,
    interval: Duration,
    pressure: Arc<Notify>,
    shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(flush_loop(
        Arc::downgrade(coordinator),
        interval,
        pressure,
        shutdown,
    ))
}

async fn flush_loop(
    session: Weak<VolumeCoordinator>,
    interval: Duration,
    pressure: Arc<Notify>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // The first tick completes immediately
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            () = pressure.notified() => {
                debug!("write cache pressure, re-driving stalled writes");
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }

        let Some(coordinator) = session.upgrade() else {
            break;
        };
        let redriven = coordinator.redrive_stalled();
        // Nobody waits on catch-up; the set tracks its progress
        let caught_up = coordinator.drive_catch_up().len();
        if redriven > 0 || caught_up > 0 {
            debug!(volume = %coordinator.name(), redriven, caught_up, "flusher pass");
        }
        coordinator.renew_lease_if_due().await;
    }

    info!("flusher stopped");
}
