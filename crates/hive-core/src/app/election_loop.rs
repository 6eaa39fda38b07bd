//! ElectionLoop - drives the election cycle timer.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::MissedTickBehavior;

use crate::election::ElectionCoordinator;

pub struct ElectionLoop {
    election: Arc<ElectionCoordinator>,
    cycle: Duration,
}

impl ElectionLoop {
    pub fn new(election: Arc<ElectionCoordinator>, cycle: Duration) -> Self {
        Self { election, cycle }
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.cycle);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // the first tick completes immediately; cycles start one period in
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = shutdown.changed() => {}
                _ = ticker.tick() => {
                    if let Err(e) = self.election.tick().await {
                        tracing::error!(error = %e, "election announcement failed");
                    }
                }
            }
            if *shutdown.borrow() || shutdown.has_changed().is_err() {
                break;
            }
        }
        tracing::debug!("election loop stopped");
    }
}
