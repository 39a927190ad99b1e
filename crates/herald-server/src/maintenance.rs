//! Periodic background loops that survive their own failures.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::time::Duration;

use futures::FutureExt;
use metrics::counter;
use tokio::time::{self, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use crate::metrics::MAINTENANCE_PANICS_TOTAL;

/// Run `task` every `period` until `cancel` fires.
///
/// The first run happens one period after start. A panicking iteration is
/// logged, followed by a `backoff` pause, and the loop carries on.
pub async fn run_periodic<F, Fut>(
    name: &'static str,
    period: Duration,
    backoff: Duration,
    cancel: CancellationToken,
    mut task: F,
) where
    F: FnMut() -> Fut,
    Fut: Future<Output = ()>,
{
    let mut ticker = time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    debug!(task = name, period_ms = period.as_millis(), "maintenance loop started");

    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        if AssertUnwindSafe(task()).catch_unwind().await.is_err() {
            error!(task = name, "maintenance iteration panicked, backing off");
            counter!(MAINTENANCE_PANICS_TOTAL, "task" => name).increment(1);
            tokio::select! {
                () = cancel.cancelled() => break,
                () = time::sleep(backoff) => {}
            }
        }
    }
    debug!(task = name, "maintenance loop stopped");
}
