//! Background storage refresher
//!
//! Periodically schedules a storage refresh for every connection that has
//! no telemetry yet. Each refresh runs as its own detached task; failures
//! are swallowed and the connection is simply picked up again next tick.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use super::LifecycleManager;

/// Run the refresher until `cancel` fires
pub async fn run_storage_refresher(
    manager: Arc<LifecycleManager>,
    interval: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    tracing::info!("Starting storage refresher (interval: {:?})", interval);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let scheduled = manager.schedule_missing_storage();
                if scheduled > 0 {
                    tracing::debug!("Scheduled {} storage refreshes", scheduled);
                }
            }
            _ = cancel.cancelled() => {
                tracing::info!("Storage refresher shutting down");
                break;
            }
        }
    }
}
