use crate::account::now_ms;
use crate::error::ScheduleError;
use crate::scheduler::Scheduler;
use crate::store::Store;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

#[derive(Debug, Clone)]
pub struct RecoveryConfig {
    pub interval: Duration,
    pub batch: u32,
    pub max_retries: u32,
    /// Failed rows with a client timestamp older than this are abandoned.
    pub age_limit: Duration,
    pub pending_stale: Duration,
    /// `sent` rows with no receipt after this age are failed so this loop
    /// resubmits them.
    pub sent_stale: Duration,
    pub retention: Duration,
}

/// Re-drains the durable queue for `failed` rows under a retry/age budget.
///
/// Scheduling uses the same rules as the live path, but against the recovery
/// pool, whose keys are configurationally disjoint from the live pool; the
/// recovery senders refresh their nonce from the chain before every
/// submission since this pool may idle for long stretches.
pub struct Recovery {
    scheduler: Scheduler,
    store: Arc<dyn Store>,
    cfg: RecoveryConfig,
}

impl Recovery {
    pub fn new(scheduler: Scheduler, store: Arc<dyn Store>, cfg: RecoveryConfig) -> Self {
        Self {
            scheduler,
            store,
            cfg,
        }
    }

    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) {
        let mut tick = tokio::time::interval(self.cfg.interval);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first interval tick fires immediately; skip it so a restart
        // does not race the live pickup loop over freshly admitted rows.
        tick.tick().await;
        loop {
            tokio::select! {
                _ = tick.tick() => {}
                _ = shutdown.recv() => break,
            }
            self.cycle_once().await;
        }
        tracing::debug!("recovery dispatcher stopped");
    }

    /// One maintenance pass: housekeeping first, then batch pickup. Returns
    /// the number of rows handed to the recovery pool.
    pub async fn cycle_once(&self) -> usize {
        match self
            .store
            .housekeeping(self.cfg.pending_stale, self.cfg.sent_stale, self.cfg.retention)
            .await
        {
            Ok(report) if report.promoted > 0 || report.evicted > 0 || report.deleted > 0 => {
                tracing::info!(
                    promoted = report.promoted,
                    evicted = report.evicted,
                    deleted = report.deleted,
                    "housekeeping applied"
                );
            }
            Ok(_) => {}
            Err(e) => {
                tracing::warn!(error = %e, "housekeeping failed");
            }
        }

        let cutoff = now_ms().saturating_sub(self.cfg.age_limit.as_millis() as u64);
        let batch = match self
            .store
            .next_recovery_batch(self.cfg.batch, self.cfg.max_retries, cutoff)
            .await
        {
            Ok(batch) => batch,
            Err(e) => {
                tracing::warn!(error = %e, "recovery batch read failed");
                return 0;
            }
        };

        let mut scheduled = 0;
        for intent in batch {
            if self.scheduler.pool().is_tracked(intent.id) {
                continue;
            }
            let id = intent.id;
            match self.scheduler.schedule(intent) {
                Ok(_) => scheduled += 1,
                Err(ScheduleError::AlreadyQueued) => {}
                Err(ScheduleError::NoAvailableAccount) => {
                    tracing::warn!(intent = id, "recovery pool exhausted; batch truncated");
                    break;
                }
            }
        }
        if scheduled > 0 {
            tracing::info!(scheduled, "recovery batch scheduled");
        }
        scheduled
    }
}
