use std::sync::Arc;

use chrono::Utc;
use tokio::sync::mpsc;
use tokio::time::{MissedTickBehavior, interval};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::engine::lifecycle::Actor;
use crate::error::AppError;
use crate::state::AppState;

/// Background matcher for bookings left without a driver.
///
/// Queued booking ids are attempted as they arrive. On every sweep tick, due
/// scheduled bookings are activated, every unmatched pending booking is
/// attempted again, reservations left behind by finished bookings are
/// released and expired positions are purged.
pub async fn run_dispatcher(state: Arc<AppState>, mut dispatch_rx: mpsc::Receiver<Uuid>) {
    info!("dispatcher started");

    let mut ticker = interval(state.dispatch_config.sweep_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            received = dispatch_rx.recv() => {
                let Some(booking_id) = received else {
                    break;
                };
                state.metrics.bookings_in_queue.dec();
                attempt(&state, booking_id).await;
            }
            _ = ticker.tick() => {
                if let Err(err) = sweep(&state).await {
                    error!(error = %err, "dispatch sweep failed");
                }
            }
        }
    }

    warn!("dispatcher stopped: queue channel closed");
}

async fn attempt(state: &AppState, booking_id: Uuid) {
    match state.bookings.assign_pending(booking_id, Actor::System).await {
        Ok(view) => info!(
            booking_id = %booking_id,
            driver_id = ?view.booking.driver_id(),
            "deferred booking matched"
        ),
        Err(AppError::NoMatch) => debug!(booking_id = %booking_id, "still no driver available"),
        Err(
            AppError::InvalidTransition { .. } | AppError::Conflict(_) | AppError::NotFound(_),
        ) => {
            debug!(booking_id = %booking_id, "booking no longer awaits a match");
        }
        Err(err) => error!(booking_id = %booking_id, error = %err, "failed to match booking"),
    }
}

async fn sweep(state: &AppState) -> Result<(), AppError> {
    let activated = state.bookings.activate_due(Utc::now()).await?;
    if !activated.is_empty() {
        info!(count = activated.len(), "scheduled bookings activated");
    }

    for booking_id in state.bookings.unmatched_bookings().await? {
        attempt(state, booking_id).await;
    }

    state.bookings.release_finished().await?;

    let purged = state.locations.purge_expired().await?;
    if purged > 0 {
        debug!(purged, "expired positions purged");
    }

    Ok(())
}
