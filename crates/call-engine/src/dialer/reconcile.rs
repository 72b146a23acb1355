//! Release of leads left in DIALING
//!
//! A claim is written before the originate is sent. If the process dies in
//! between, or the switch never answers the job, nothing moves the lead out
//! of DIALING again. This sweep runs beside the dialer and puts such leads
//! back to NEW once they are older than a grace period.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::error::Result;
use crate::store::LeadStore;

pub struct ReconcileSweep {
    leads: Arc<dyn LeadStore>,
    interval: Duration,
    grace: Duration,
}

impl ReconcileSweep {
    pub fn new(leads: Arc<dyn LeadStore>, interval: Duration, grace: Duration) -> Self {
        Self { leads, interval, grace }
    }

    /// Sweep once, returning how many leads were released
    pub async fn run_once(&self) -> Result<u64> {
        let reverted = self.leads.revert_stale_dialing(self.grace).await?;
        if reverted > 0 {
            warn!(
                "🧹 Released {} lead(s) stuck in DIALING for more than {}s",
                reverted,
                self.grace.as_secs()
            );
        } else {
            debug!("no stale DIALING leads");
        }
        Ok(reverted)
    }

    pub async fn run(&self, mut stop: watch::Receiver<bool>) {
        info!(
            "Reconcile sweep every {}s (grace {}s)",
            self.interval.as_secs(),
            self.grace.as_secs()
        );
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.run_once().await {
                        error!("Reconcile sweep failed: {}", e);
                    }
                }
                _ = stop.changed() => break,
            }
        }
    }
}
