use crate::account::{now_ms, Account, AccountPool};
use crate::chain::Chain;
use crate::error::SubmitError;
use crate::intent::{IntentStatus, IntentUpdate};
use crate::notifier::Notifier;
use crate::store::Store;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

/// Attempts to persist `mark_sent` after the chain already accepted the
/// transaction. The submission itself is never repeated.
const MARK_SENT_ATTEMPTS: u32 = 3;
const MARK_SENT_RETRY_DELAY: Duration = Duration::from_millis(200);

#[derive(Debug, Clone)]
pub struct SenderConfig {
    /// Per-account spacing held after each successful submission.
    pub cooldown: Duration,
    /// Re-query the pending nonce before every submission. Set for the
    /// recovery pool, which is off the hot path and may have gone idle.
    pub refresh_nonce: bool,
    /// Permit the `failed -> sent` store transition.
    pub via_recovery: bool,
    pub dry_run: bool,
}

impl SenderConfig {
    pub fn live(cooldown: Duration, dry_run: bool) -> Self {
        Self {
            cooldown,
            refresh_nonce: false,
            via_recovery: false,
            dry_run,
        }
    }

    pub fn recovery(cooldown: Duration, dry_run: bool) -> Self {
        Self {
            cooldown,
            refresh_nonce: true,
            via_recovery: true,
            dry_run,
        }
    }
}

/// One timer for a whole pool: wakes every account each tick so a lost
/// enqueue wake-up can only ever stall an account for one interval.
pub async fn run_ticker(
    pool: Arc<AccountPool>,
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
        for account in pool.accounts() {
            account.wake.notify_one();
        }
    }
}

/// Drains one account's FIFO while preserving that account's nonce order.
/// One sender task per account; accounts never share state, so a stuck RPC on
/// one account cannot block another.
pub struct Sender {
    account: Arc<Account>,
    pool: Arc<AccountPool>,
    chain: Arc<dyn Chain>,
    store: Arc<dyn Store>,
    notifier: Arc<dyn Notifier>,
    cfg: SenderConfig,
}

impl Sender {
    pub fn new(
        account: Arc<Account>,
        pool: Arc<AccountPool>,
        chain: Arc<dyn Chain>,
        store: Arc<dyn Store>,
        notifier: Arc<dyn Notifier>,
        cfg: SenderConfig,
    ) -> Self {
        Self {
            account,
            pool,
            chain,
            store,
            notifier,
            cfg,
        }
    }

    /// Waits for wake-ups (enqueue, pool ticker, or its own progress) and
    /// drives one submission attempt per wake-up.
    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) {
        loop {
            tokio::select! {
                _ = self.account.wake.notified() => {}
                _ = shutdown.recv() => break,
            }
            if self.tick_once().await {
                // More may be queued; don't wait out the next pool tick.
                self.account.wake.notify_one();
            }
        }
        tracing::debug!(account = self.account.index, "sender stopped");
    }

    /// One submission attempt for the queue head. Returns true when an intent
    /// left the head (submitted or failed), false when the account was idle,
    /// busy, quarantined, or is retrying the same head.
    pub async fn tick_once(&self) -> bool {
        self.reconcile_deferred().await;

        let Some(head) = self.account.try_begin(self.pool.fault_threshold()) else {
            return false;
        };
        let index = self.account.index;

        if self.cfg.dry_run {
            tracing::trace!(intent = head.id, account = index, "dry run: holding submission");
            self.account.release();
            return false;
        }

        let cached = if self.cfg.refresh_nonce {
            None
        } else {
            self.account.nonce()
        };
        let nonce = match cached {
            Some(n) => n,
            None => match self.chain.pending_nonce(index).await {
                Ok(n) => {
                    self.account.set_nonce(n);
                    n
                }
                Err(e) => {
                    let streak = self.account.note_transient();
                    tracing::warn!(account = index, error = %e, "nonce query failed; head retried next tick");
                    self.log_quarantine(streak);
                    self.account.release();
                    return false;
                }
            },
        };

        match self.chain.submit(index, nonce, &head).await {
            Ok(hash) => {
                let persisted = self.persist_sent(head.id, hash, index).await;
                self.account.complete_success(hash, now_ms());
                if persisted {
                    self.pool.untrack(head.id);
                } else {
                    // The chain accepted the tx; the row must never re-enter
                    // the pickup path on a fresh nonce. The id stays tracked
                    // and the write is retried on later ticks.
                    self.account.defer_mark(head.id, hash);
                }
                self.notifier
                    .notify(&IntentUpdate::new(&head, IntentStatus::Sent).with_hash(hash));
                tracing::info!(
                    intent = head.id,
                    kind = %head.kind,
                    account = index,
                    nonce,
                    hash = ?hash,
                    "submitted"
                );
                if !self.cfg.cooldown.is_zero() {
                    tokio::time::sleep(self.cfg.cooldown).await;
                }
                self.account.release();
                true
            }
            Err(SubmitError::NonceMismatch(msg)) => {
                tracing::warn!(account = index, nonce, error = %msg, "nonce mismatch; resyncing from chain");
                match self.chain.pending_nonce(index).await {
                    Ok(fresh) => self.account.set_nonce(fresh),
                    Err(e) => {
                        tracing::warn!(account = index, error = %e, "nonce resync failed; will retry next tick");
                    }
                }
                self.account.release();
                false
            }
            Err(err) => {
                // Rejection or surfaced transport failure: hand the intent to
                // the recovery loop, which owns the retry budget.
                if let Err(e) = self.store.mark_failed(head.id).await {
                    tracing::warn!(intent = head.id, error = %e, "mark_failed did not persist");
                }
                let (_, streak) = self.account.complete_rejected();
                self.pool.untrack(head.id);
                self.notifier
                    .notify(&IntentUpdate::new(&head, IntentStatus::Failed));
                tracing::warn!(
                    intent = head.id,
                    kind = %head.kind,
                    account = index,
                    nonce,
                    error = %err,
                    "submission failed"
                );
                self.log_quarantine(streak);
                self.account.release();
                true
            }
        }
    }

    /// Re-attempt the store writes owed for submissions the chain already
    /// accepted. Runs ahead of every submission attempt, so a store outage
    /// clears as soon as the store is back, and while it lasts the affected
    /// ids stay tracked and cannot be dispatched a second time.
    async fn reconcile_deferred(&self) {
        for mark in self.account.take_unreconciled() {
            match self
                .store
                .mark_sent(mark.intent_id, mark.hash, self.account.index, self.cfg.via_recovery)
                .await
            {
                Ok(_) => {
                    self.pool.untrack(mark.intent_id);
                    tracing::info!(
                        intent = mark.intent_id,
                        hash = ?mark.hash,
                        "deferred mark_sent reconciled"
                    );
                }
                Err(e) => {
                    tracing::warn!(
                        intent = mark.intent_id,
                        error = %e,
                        "mark_sent still failing; will retry next tick"
                    );
                    self.account.defer_mark(mark.intent_id, mark.hash);
                }
            }
        }
    }

    /// Returns whether the write landed; a false return means the caller must
    /// defer the mark instead of releasing the id back to the pickup path.
    async fn persist_sent(&self, id: i64, hash: ethers::types::H256, index: u32) -> bool {
        for attempt in 1..=MARK_SENT_ATTEMPTS {
            match self
                .store
                .mark_sent(id, hash, index, self.cfg.via_recovery)
                .await
            {
                Ok(_) => return true,
                Err(e) if attempt < MARK_SENT_ATTEMPTS => {
                    tracing::warn!(intent = id, attempt, error = %e, "mark_sent failed; retrying");
                    tokio::time::sleep(MARK_SENT_RETRY_DELAY).await;
                }
                Err(e) => {
                    tracing::error!(
                        intent = id,
                        hash = ?hash,
                        error = %e,
                        "mark_sent did not persist; deferring reconciliation"
                    );
                }
            }
        }
        false
    }

    fn log_quarantine(&self, streak: u32) {
        if streak == self.pool.fault_threshold() {
            tracing::warn!(
                account = self.account.index,
                streak,
                "account quarantined until operator reset"
            );
        }
    }
}
