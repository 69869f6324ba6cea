use crate::chain::Chain;
use crate::intent::{Intent, IntentKind, IntentStatus, IntentUpdate};
use crate::notifier::Notifier;
use crate::store::Store;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

/// Advances `sent` rows to a terminal state by matching receipts on each new
/// block. The watcher never resubmits; a transaction the chain dropped stays
/// `sent` until housekeeping hands it to recovery.
pub struct Watcher {
    chain: Arc<dyn Chain>,
    store: Arc<dyn Store>,
    notifier: Arc<dyn Notifier>,
    page: u32,
}

impl Watcher {
    pub fn new(
        chain: Arc<dyn Chain>,
        store: Arc<dyn Store>,
        notifier: Arc<dyn Notifier>,
        page: u32,
    ) -> Self {
        Self {
            chain,
            store,
            notifier,
            page,
        }
    }

    pub async fn run(self, poll: Duration, mut shutdown: broadcast::Receiver<()>) {
        let mut tick = tokio::time::interval(poll);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut last_seen = 0u64;
        loop {
            tokio::select! {
                _ = tick.tick() => {}
                _ = shutdown.recv() => break,
            }
            match self.chain.latest_block().await {
                Ok(block) if block != last_seen => {
                    last_seen = block;
                    self.scan_once(block).await;
                }
                Ok(_) => {}
                Err(e) => {
                    tracing::warn!(error = %e, "block number query failed");
                }
            }
        }
        tracing::debug!("watcher stopped");
    }

    /// Inspect one bounded page of `sent` rows against the chain. Returns the
    /// number of rows finalized.
    pub async fn scan_once(&self, block: u64) -> usize {
        let rows = match self.store.sent_page(self.page).await {
            Ok(rows) => rows,
            Err(e) => {
                tracing::warn!(error = %e, "sent page read failed");
                return 0;
            }
        };

        let mut finalized = 0;
        for row in rows {
            let Some(hash) = row.hash else {
                tracing::warn!(intent = row.id, "sent row without hash; leaving to housekeeping");
                continue;
            };
            match self.chain.receipt(hash).await {
                Ok(Some(receipt)) => {
                    match self.store.mark_confirmed(row.id, receipt.success).await {
                        Ok(true) => {
                            finalized += 1;
                            let status = if receipt.success {
                                IntentStatus::Confirmed
                            } else {
                                IntentStatus::Failed
                            };
                            tracing::info!(
                                intent = row.id,
                                kind = %row.kind,
                                hash = ?hash,
                                block = receipt.block_number,
                                status = %status,
                                "receipt finalized"
                            );
                            self.notifier.notify(
                                &IntentUpdate::new(&row, status).with_block(receipt.block_number),
                            );
                            if receipt.success {
                                self.apply_side_effects(&row).await;
                            }
                        }
                        // Another watcher finalized it first.
                        Ok(false) => {}
                        Err(e) => {
                            tracing::warn!(intent = row.id, error = %e, "mark_confirmed failed");
                        }
                    }
                }
                // No receipt yet; check again on a later block.
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!(intent = row.id, hash = ?hash, error = %e, "receipt fetch failed");
                }
            }
        }
        if finalized > 0 {
            tracing::debug!(block, finalized, "confirmation scan complete");
        }
        finalized
    }

    async fn apply_side_effects(&self, row: &Intent) {
        let result = match row.kind {
            IntentKind::Gameover => {
                self.store
                    .update_leaderboard(row.player, None, row.score)
                    .await
            }
            IntentKind::Setplayer => {
                self.store
                    .update_leaderboard(row.player, row.username.as_deref(), 0)
                    .await
            }
            IntentKind::Jump => return,
        };
        if let Err(e) = result {
            tracing::warn!(intent = row.id, error = %e, "leaderboard update failed");
        }
    }
}
