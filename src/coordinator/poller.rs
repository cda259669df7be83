// Status poller - One independent refresh timer per unit

use super::Inner;
use crate::config::MAX_POLL_INTERVAL_SECS;
use crate::error::SidecarError;
use crate::unit::UnitName;
use std::sync::Weak;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Spawn the poller for `name`
///
/// The task ends when `token` is cancelled, when the unit leaves the active
/// set, or when the coordinator is dropped. A hung status query is abandoned
/// on cancellation.
pub(super) fn spawn(
    inner: Weak<Inner>,
    name: UnitName,
    token: CancellationToken,
    every: Duration,
) -> JoinHandle<()> {
    let every = every.min(Duration::from_secs(MAX_POLL_INTERVAL_SECS));

    tokio::spawn(async move {
        // First refresh happens one interval in; GetStatus fills the cache on demand
        let mut interval = interval_at(Instant::now() + every, every);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = interval.tick() => {}
            }

            let Some(coordinator) = inner.upgrade() else {
                break;
            };

            debug!(unit = %name, "Polling unit status");
            let result = tokio::select! {
                _ = token.cancelled() => break,
                result = coordinator.refresh_status(name.as_str()) => result,
            };
            drop(coordinator);

            match result {
                Ok(status) => debug!(unit = %name, running = status.running, "Polled unit status"),
                Err(SidecarError::NotFound(_)) => break,
                Err(e) => warn!(unit = %name, "Status poll failed, keeping last snapshot: {}", e),
            }
        }

        debug!(unit = %name, "Status poller stopped");
    })
}
