use crate::{
    manager::{BroadcastOutcome, SessionManager},
    market_hours::{Clock, in_maintenance_window},
};
use std::{sync::Arc, time::Duration};
use tokio::{
    task::JoinHandle,
    time::{Interval, MissedTickBehavior},
};
use tracing::{debug, error, info};

/// Drives the periodic snapshot broadcast of the shared instrument.
///
/// The period is re-evaluated every cycle, so entering or leaving the daily maintenance window
/// takes effect on the next tick. An instrument change triggers an immediate cycle.
pub struct BroadcastScheduler {
    manager: Arc<SessionManager>,
    clock: Arc<dyn Clock>,
    normal: Duration,
    maintenance: Duration,
}

impl std::fmt::Debug for BroadcastScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BroadcastScheduler")
            .field("normal", &self.normal)
            .field("maintenance", &self.maintenance)
            .finish()
    }
}

impl BroadcastScheduler {
    pub fn new(manager: Arc<SessionManager>, clock: Arc<dyn Clock>) -> Self {
        let config = manager.config();
        Self {
            normal: config.broadcast_period,
            maintenance: config.maintenance_period,
            manager,
            clock,
        }
    }

    /// Period that applies right now.
    pub fn current_period(&self) -> Duration {
        if in_maintenance_window(self.clock.now()) {
            self.maintenance
        } else {
            self.normal
        }
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    pub async fn run(self) {
        let mut changes = self.manager.context().changes();
        let mut period = self.current_period();
        let mut interval = broadcast_interval(period);
        let mut paused = false;

        info!(period_ms = period.as_millis() as u64, "broadcast scheduler started");

        loop {
            tokio::select! {
                _ = interval.tick() => {}
                changed = changes.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let viewed = changes.borrow_and_update().clone();
                    debug!(instrument = %viewed, "instrument changed, broadcasting immediately");
                    interval.reset();
                }
            }

            let outcome = self.cycle().await;
            match (paused, outcome) {
                (false, Some(BroadcastOutcome::Paused)) => {
                    paused = true;
                    info!("broadcasts paused");
                }
                (true, Some(outcome)) if outcome != BroadcastOutcome::Paused => {
                    paused = false;
                    info!("broadcasts resumed");
                }
                _ => {}
            }

            let next = self.current_period();
            if next != period {
                info!(
                    from_ms = period.as_millis() as u64,
                    to_ms = next.as_millis() as u64,
                    "broadcast period changed"
                );
                period = next;
                interval = broadcast_interval(period);
                interval.reset();
            }
        }

        info!("broadcast scheduler stopped");
    }

    /// Run one broadcast on its own task; a panic is logged and the loop carries on.
    async fn cycle(&self) -> Option<BroadcastOutcome> {
        let manager = Arc::clone(&self.manager);
        match tokio::spawn(async move { manager.broadcast_snapshot().await }).await {
            Ok(outcome) => {
                debug!(?outcome, "broadcast cycle");
                Some(outcome)
            }
            Err(error) => {
                error!(%error, "broadcast cycle panicked");
                None
            }
        }
    }
}

fn broadcast_interval(period: Duration) -> Interval {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval
}
