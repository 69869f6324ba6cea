use crate::account::{Account, AccountPool};
use crate::error::ScheduleError;
use crate::intent::Intent;
use crate::store::Store;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

/// Rows fetched per pickup tick when re-draining deferred or restarted work.
const PICKUP_PAGE: u32 = 100;

/// Picks an account for each admitted intent.
///
/// Selection is deterministic: non-quarantined accounts only, idle before
/// busy, then shortest queue, ties broken by lowest index. Favouring idle
/// accounts maximizes concurrent in-flight submissions; the quarantine filter
/// keeps one bad account (an empty balance, say) from absorbing traffic.
#[derive(Clone)]
pub struct Scheduler {
    pool: Arc<AccountPool>,
}

impl Scheduler {
    pub fn new(pool: Arc<AccountPool>) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &Arc<AccountPool> {
        &self.pool
    }

    pub fn select(&self) -> Result<Arc<Account>, ScheduleError> {
        let threshold = self.pool.fault_threshold();
        let mut idle: Option<(usize, u32, Arc<Account>)> = None;
        let mut busy: Option<(usize, u32, Arc<Account>)> = None;

        for account in self.pool.accounts() {
            let snap = account.snapshot(threshold);
            if snap.quarantined {
                continue;
            }
            let slot = if snap.sending { &mut busy } else { &mut idle };
            let better = match slot {
                Some((len, index, _)) => {
                    (snap.queue_length, snap.index) < (*len, *index)
                }
                None => true,
            };
            if better {
                *slot = Some((snap.queue_length, snap.index, account.clone()));
            }
        }

        idle.or(busy)
            .map(|(_, _, account)| account)
            .ok_or(ScheduleError::NoAvailableAccount)
    }

    /// Enqueue `intent` on the best account. Registers the id first so an
    /// intent can never sit in two queues at once.
    pub fn schedule(&self, intent: Intent) -> Result<u32, ScheduleError> {
        let account = self.select()?;
        if !self.pool.track(intent.id) {
            return Err(ScheduleError::AlreadyQueued);
        }
        let index = account.index;
        tracing::debug!(intent = intent.id, kind = %intent.kind, account = index, "scheduled");
        account.enqueue(intent);
        Ok(index)
    }
}

/// Periodic pickup tick: re-drains `pending` store rows that are not in any
/// queue. Covers admissions deferred by `NoAvailableAccount` and everything
/// left behind by a previous process.
pub async fn run_pickup(
    scheduler: Scheduler,
    store: Arc<dyn Store>,
    interval: Duration,
    mut shutdown: broadcast::Receiver<()>,
) {
    let mut tick = tokio::time::interval(interval);
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = tick.tick() => {}
            _ = shutdown.recv() => break,
        }

        let page = match store.pending_page(PICKUP_PAGE).await {
            Ok(page) => page,
            Err(e) => {
                tracing::warn!(error = %e, "pickup: pending page read failed; backing off");
                continue;
            }
        };

        for intent in page {
            if scheduler.pool().is_tracked(intent.id) {
                continue;
            }
            match scheduler.schedule(intent) {
                Ok(_) => {}
                Err(ScheduleError::AlreadyQueued) => {}
                Err(ScheduleError::NoAvailableAccount) => {
                    // Nothing to do until an account recovers.
                    break;
                }
            }
        }
    }
}
