use uuid::Uuid;

use crate::error::AppError;
use crate::state::AppState;

/// Asks the background dispatcher to try matching `booking_id` soon.
pub async fn enqueue_booking(state: &AppState, booking_id: Uuid) -> Result<(), AppError> {
    state.metrics.bookings_in_queue.inc();

    if let Err(err) = state.dispatch_tx.send(booking_id).await {
        state.metrics.bookings_in_queue.dec();
        return Err(AppError::Internal(format!(
            "dispatch queue send failed: {err}"
        )));
    }

    Ok(())
}
