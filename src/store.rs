use crate::error::StoreError;
use crate::intent::{Intent, IntentDraft, IntentKind, IntentStatus};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ethers::types::{Address, H256};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Row};
use std::future::Future;
use std::str::FromStr;
use std::time::Duration;

/// Per-operation deadline; bounds client-visible latency on a sick store.
const STORE_OP_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HousekeepingReport {
    /// `pending` rows promoted to `failed` because they exceeded the stale threshold.
    pub promoted: u64,
    /// `sent` rows with no receipt inside the stale window, failed so the
    /// recovery dispatcher resubmits them. This is how a transaction the
    /// chain dropped leaves `sent`.
    pub evicted: u64,
    /// Terminal rows deleted past the retention window.
    pub deleted: u64,
}

/// The durable queue: the only cross-process source of truth for intent state.
///
/// All operations are idempotent on replay. Transition guards live in the
/// implementation (for Postgres, in status-guarded UPDATEs); the `mark_*`
/// methods return `false` when the guard matched nothing, i.e. a replay or a
/// transition already taken by another worker.
#[async_trait]
pub trait Store: Send + Sync {
    async fn insert(&self, draft: &IntentDraft) -> Result<Intent, StoreError>;

    /// `pending -> sent`; recovery may also take `failed -> sent`.
    async fn mark_sent(
        &self,
        id: i64,
        hash: H256,
        account_index: u32,
        via_recovery: bool,
    ) -> Result<bool, StoreError>;

    /// Any non-confirmed status -> `failed`, incrementing `retries`. On an
    /// already-failed row this records another spent recovery attempt.
    async fn mark_failed(&self, id: i64) -> Result<bool, StoreError>;

    /// `sent -> confirmed` or `sent -> failed` based on the receipt.
    async fn mark_confirmed(&self, id: i64, success: bool) -> Result<bool, StoreError>;

    async fn count_pending(&self) -> Result<u64, StoreError>;

    /// Oldest `pending` rows, for the scheduler pickup tick (re-drain after a
    /// deferred admission or a restart).
    async fn pending_page(&self, limit: u32) -> Result<Vec<Intent>, StoreError>;

    /// Oldest `sent` rows, for the confirmation watcher.
    async fn sent_page(&self, limit: u32) -> Result<Vec<Intent>, StoreError>;

    /// `failed` rows eligible for another attempt, oldest client timestamp
    /// first, selected with a skip-locked read so concurrent recovery workers
    /// do not collide.
    async fn next_recovery_batch(
        &self,
        limit: u32,
        max_retries: u32,
        age_cutoff_ms: u64,
    ) -> Result<Vec<Intent>, StoreError>;

    async fn housekeeping(
        &self,
        pending_stale: Duration,
        sent_stale: Duration,
        retention: Duration,
    ) -> Result<HousekeepingReport, StoreError>;

    // Side-effect tables. Failures here never fail an admission.
    async fn touch_session(&self, game_id: &str, player: Address) -> Result<(), StoreError>;
    async fn record_game_event(&self, draft: &IntentDraft) -> Result<(), StoreError>;
    async fn update_leaderboard(
        &self,
        player: Address,
        username: Option<&str>,
        score: u64,
    ) -> Result<(), StoreError>;
}

pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub async fn connect(url: &str, max_connections: u32) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(STORE_OP_TIMEOUT)
            .connect(url)
            .await
            .map_err(|e| StoreError::Unavailable(format!("connect failed: {e}")))?;
        Ok(Self { pool })
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| StoreError::Unavailable(format!("migrate failed: {e}")))?;
        Ok(())
    }

    async fn op<T, F>(&self, fut: F) -> Result<T, StoreError>
    where
        F: Future<Output = Result<T, sqlx::Error>> + Send,
    {
        match tokio::time::timeout(STORE_OP_TIMEOUT, fut).await {
            Ok(Ok(v)) => Ok(v),
            Ok(Err(e)) => Err(StoreError::Unavailable(e.to_string())),
            Err(_) => Err(StoreError::Unavailable(
                "store operation deadline exceeded".into(),
            )),
        }
    }
}

const INTENT_COLUMNS: &str =
    "id, player, game_id, kind, score, height, username, client_ts_ms, status, hash, account_index, retries, created_at";

fn addr_text(a: &Address) -> String {
    format!("{a:?}")
}

fn hash_text(h: &H256) -> String {
    format!("{h:?}")
}

fn intent_from_row(row: &PgRow) -> Result<Intent, StoreError> {
    let decode = |field: &str, err: String| StoreError::Unavailable(format!("bad row ({field}): {err}"));

    let player_raw: String = row
        .try_get("player")
        .map_err(|e| decode("player", e.to_string()))?;
    let player = Address::from_str(&player_raw).map_err(|e| decode("player", e.to_string()))?;

    let kind_raw: String = row
        .try_get("kind")
        .map_err(|e| decode("kind", e.to_string()))?;
    let kind =
        IntentKind::parse(&kind_raw).ok_or_else(|| decode("kind", format!("unknown '{kind_raw}'")))?;

    let status_raw: String = row
        .try_get("status")
        .map_err(|e| decode("status", e.to_string()))?;
    let status = IntentStatus::parse(&status_raw)
        .ok_or_else(|| decode("status", format!("unknown '{status_raw}'")))?;

    let hash_raw: Option<String> = row
        .try_get("hash")
        .map_err(|e| decode("hash", e.to_string()))?;
    let hash = match hash_raw {
        Some(s) => Some(H256::from_str(&s).map_err(|e| decode("hash", e.to_string()))?),
        None => None,
    };

    let get_i64 = |field: &str| -> Result<i64, StoreError> {
        row.try_get::<i64, _>(field)
            .map_err(|e| decode(field, e.to_string()))
    };

    Ok(Intent {
        id: get_i64("id")?,
        player,
        game_id: row
            .try_get("game_id")
            .map_err(|e| decode("game_id", e.to_string()))?,
        kind,
        score: get_i64("score")?.max(0) as u64,
        height: row
            .try_get::<Option<i64>, _>("height")
            .map_err(|e| decode("height", e.to_string()))?
            .map(|h| h.max(0) as u64),
        username: row
            .try_get("username")
            .map_err(|e| decode("username", e.to_string()))?,
        client_ts_ms: get_i64("client_ts_ms")?.max(0) as u64,
        status,
        hash,
        account_index: row
            .try_get::<Option<i32>, _>("account_index")
            .map_err(|e| decode("account_index", e.to_string()))?
            .map(|i| i.max(0) as u32),
        retries: row
            .try_get::<i32, _>("retries")
            .map_err(|e| decode("retries", e.to_string()))?
            .max(0) as u32,
        created_at: row
            .try_get::<DateTime<Utc>, _>("created_at")
            .map_err(|e| decode("created_at", e.to_string()))?,
    })
}

#[async_trait]
impl Store for PgStore {
    async fn insert(&self, draft: &IntentDraft) -> Result<Intent, StoreError> {
        let row = self
            .op(
                sqlx::query(
                    "INSERT INTO queue (player, game_id, kind, score, height, username, client_ts_ms) \
                     VALUES ($1, $2, $3, $4, $5, $6, $7) \
                     RETURNING id, created_at",
                )
                .bind(addr_text(&draft.player))
                .bind(&draft.game_id)
                .bind(draft.kind.as_str())
                .bind(draft.score as i64)
                .bind(draft.height.map(|h| h as i64))
                .bind(&draft.username)
                .bind(draft.client_ts_ms as i64)
                .fetch_one(&self.pool),
            )
            .await?;

        let id: i64 = row
            .try_get("id")
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        let created_at: DateTime<Utc> = row
            .try_get("created_at")
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;

        Ok(Intent {
            id,
            player: draft.player,
            game_id: draft.game_id.clone(),
            kind: draft.kind,
            score: draft.score,
            height: draft.height,
            username: draft.username.clone(),
            client_ts_ms: draft.client_ts_ms,
            status: IntentStatus::Pending,
            hash: None,
            account_index: None,
            retries: 0,
            created_at,
        })
    }

    async fn mark_sent(
        &self,
        id: i64,
        hash: H256,
        account_index: u32,
        via_recovery: bool,
    ) -> Result<bool, StoreError> {
        let sql = if via_recovery {
            "UPDATE queue SET status = 'sent', hash = $2, account_index = $3, updated_at = now() \
             WHERE id = $1 AND status IN ('pending', 'failed')"
        } else {
            "UPDATE queue SET status = 'sent', hash = $2, account_index = $3, updated_at = now() \
             WHERE id = $1 AND status = 'pending'"
        };
        let result = self
            .op(
                sqlx::query(sql)
                    .bind(id)
                    .bind(hash_text(&hash))
                    .bind(account_index as i32)
                    .execute(&self.pool),
            )
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn mark_failed(&self, id: i64) -> Result<bool, StoreError> {
        let result = self
            .op(
                sqlx::query(
                    "UPDATE queue SET status = 'failed', retries = retries + 1, updated_at = now() \
                     WHERE id = $1 AND status <> 'confirmed'",
                )
                .bind(id)
                .execute(&self.pool),
            )
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn mark_confirmed(&self, id: i64, success: bool) -> Result<bool, StoreError> {
        let status = if success { "confirmed" } else { "failed" };
        let result = self
            .op(
                sqlx::query(
                    "UPDATE queue SET status = $2, updated_at = now() \
                     WHERE id = $1 AND status = 'sent'",
                )
                    .bind(id)
                    .bind(status)
                    .execute(&self.pool),
            )
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn count_pending(&self) -> Result<u64, StoreError> {
        let row = self
            .op(
                sqlx::query("SELECT COUNT(*) AS n FROM queue WHERE status = 'pending'")
                    .fetch_one(&self.pool),
            )
            .await?;
        let n: i64 = row
            .try_get("n")
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        Ok(n.max(0) as u64)
    }

    async fn pending_page(&self, limit: u32) -> Result<Vec<Intent>, StoreError> {
        let rows = self
            .op(
                sqlx::query(&format!(
                    "SELECT {INTENT_COLUMNS} FROM queue WHERE status = 'pending' ORDER BY id ASC LIMIT $1"
                ))
                .bind(limit as i64)
                .fetch_all(&self.pool),
            )
            .await?;
        rows.iter().map(intent_from_row).collect()
    }

    async fn sent_page(&self, limit: u32) -> Result<Vec<Intent>, StoreError> {
        let rows = self
            .op(
                sqlx::query(&format!(
                    "SELECT {INTENT_COLUMNS} FROM queue WHERE status = 'sent' ORDER BY id ASC LIMIT $1"
                ))
                .bind(limit as i64)
                .fetch_all(&self.pool),
            )
            .await?;
        rows.iter().map(intent_from_row).collect()
    }

    async fn next_recovery_batch(
        &self,
        limit: u32,
        max_retries: u32,
        age_cutoff_ms: u64,
    ) -> Result<Vec<Intent>, StoreError> {
        // Row-level lock held for the duration of the selection transaction;
        // SKIP LOCKED keeps concurrent recovery workers from handing out the
        // same rows.
        let pool = self.pool.clone();
        let sql = format!(
            "SELECT {INTENT_COLUMNS} FROM queue \
             WHERE status = 'failed' AND retries < $2 AND client_ts_ms > $3 \
             ORDER BY client_ts_ms ASC \
             LIMIT $1 \
             FOR UPDATE SKIP LOCKED"
        );
        let rows = self
            .op(async move {
                let mut tx = pool.begin().await?;
                let rows = sqlx::query(&sql)
                    .bind(limit as i64)
                    .bind(max_retries as i32)
                    .bind(age_cutoff_ms as i64)
                    .fetch_all(&mut *tx)
                    .await?;
                tx.commit().await?;
                Ok(rows)
            })
            .await?;
        rows.iter().map(intent_from_row).collect()
    }

    async fn housekeeping(
        &self,
        pending_stale: Duration,
        sent_stale: Duration,
        retention: Duration,
    ) -> Result<HousekeepingReport, StoreError> {
        let stale_cutoff = Utc::now()
            - chrono::Duration::from_std(pending_stale)
                .unwrap_or_else(|_| chrono::Duration::hours(1));
        let sent_cutoff = Utc::now()
            - chrono::Duration::from_std(sent_stale).unwrap_or_else(|_| chrono::Duration::hours(1));
        let retention_cutoff = Utc::now()
            - chrono::Duration::from_std(retention).unwrap_or_else(|_| chrono::Duration::hours(24));

        let promoted = self
            .op(
                sqlx::query(
                    "UPDATE queue SET status = 'failed', updated_at = now() \
                     WHERE status = 'pending' AND created_at < $1",
                )
                .bind(stale_cutoff)
                .execute(&self.pool),
            )
            .await?
            .rows_affected();

        // A transaction the chain dropped never gets a receipt; fail the row
        // so recovery resubmits it with a new nonce and hash.
        let evicted = self
            .op(
                sqlx::query(
                    "UPDATE queue SET status = 'failed', retries = retries + 1, updated_at = now() \
                     WHERE status = 'sent' AND updated_at < $1",
                )
                .bind(sent_cutoff)
                .execute(&self.pool),
            )
            .await?
            .rows_affected();

        let deleted = self
            .op(
                sqlx::query(
                    "DELETE FROM queue \
                     WHERE status IN ('confirmed', 'failed') AND created_at < $1",
                )
                .bind(retention_cutoff)
                .execute(&self.pool),
            )
            .await?
            .rows_affected();

        Ok(HousekeepingReport {
            promoted,
            evicted,
            deleted,
        })
    }

    async fn touch_session(&self, game_id: &str, player: Address) -> Result<(), StoreError> {
        self.op(
            sqlx::query(
                "INSERT INTO sessions (game_id, player, last_seen) VALUES ($1, $2, now()) \
                 ON CONFLICT (game_id) \
                 DO UPDATE SET last_seen = now(), player = EXCLUDED.player",
            )
            .bind(game_id)
            .bind(addr_text(&player))
            .execute(&self.pool),
        )
        .await?;
        Ok(())
    }

    async fn record_game_event(&self, draft: &IntentDraft) -> Result<(), StoreError> {
        self.op(
            sqlx::query(
                "INSERT INTO game_events (player, game_id, kind, score, client_ts_ms) \
                 VALUES ($1, $2, $3, $4, $5)",
            )
            .bind(addr_text(&draft.player))
            .bind(&draft.game_id)
            .bind(draft.kind.as_str())
            .bind(draft.score as i64)
            .bind(draft.client_ts_ms as i64)
            .execute(&self.pool),
        )
        .await?;
        Ok(())
    }

    async fn update_leaderboard(
        &self,
        player: Address,
        username: Option<&str>,
        score: u64,
    ) -> Result<(), StoreError> {
        self.op(
            sqlx::query(
                "INSERT INTO leaderboard (player, username, best_score, updated_at) \
                 VALUES ($1, $2, $3, now()) \
                 ON CONFLICT (player) DO UPDATE SET \
                   best_score = GREATEST(leaderboard.best_score, EXCLUDED.best_score), \
                   username = COALESCE(EXCLUDED.username, leaderboard.username), \
                   updated_at = now()",
            )
            .bind(addr_text(&player))
            .bind(username)
            .bind(score as i64)
            .execute(&self.pool),
        )
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::intent::{IntentKind, IntentStatus};
    use crate::store::Store;
    use crate::testutil::{draft, FakeStore};
    use ethers::types::H256;

    // The trait contract exercised against the in-memory fake; the Postgres
    // implementation enforces the same guards in status-guarded UPDATEs.

    #[tokio::test]
    async fn insert_then_mark_sent_transitions_pending_row() {
        let store = FakeStore::new();
        let intent = store.insert(&draft(IntentKind::Jump, 42)).await.unwrap();
        assert_eq!(intent.status, IntentStatus::Pending);

        let moved = store
            .mark_sent(intent.id, H256::repeat_byte(1), 0, false)
            .await
            .unwrap();
        assert!(moved);
        let row = store.get(intent.id).unwrap();
        assert_eq!(row.status, IntentStatus::Sent);
        assert_eq!(row.account_index, Some(0));
        assert!(row.hash.is_some());
    }

    #[tokio::test]
    async fn mark_sent_is_a_noop_on_replay() {
        let store = FakeStore::new();
        let intent = store.insert(&draft(IntentKind::Jump, 42)).await.unwrap();
        assert!(store
            .mark_sent(intent.id, H256::repeat_byte(1), 0, false)
            .await
            .unwrap());
        assert!(!store
            .mark_sent(intent.id, H256::repeat_byte(2), 1, false)
            .await
            .unwrap());
        // First write wins.
        assert_eq!(store.get(intent.id).unwrap().hash, Some(H256::repeat_byte(1)));
    }

    #[tokio::test]
    async fn failed_to_sent_requires_recovery() {
        let store = FakeStore::new();
        let intent = store.insert(&draft(IntentKind::Gameover, 7)).await.unwrap();
        store.mark_failed(intent.id).await.unwrap();

        assert!(!store
            .mark_sent(intent.id, H256::repeat_byte(3), 0, false)
            .await
            .unwrap());
        assert!(store
            .mark_sent(intent.id, H256::repeat_byte(3), 0, true)
            .await
            .unwrap());
        assert_eq!(store.get(intent.id).unwrap().status, IntentStatus::Sent);
    }

    #[tokio::test]
    async fn mark_failed_increments_retries_and_respects_terminal_confirmed() {
        let store = FakeStore::new();
        let intent = store.insert(&draft(IntentKind::Jump, 1)).await.unwrap();
        store.mark_failed(intent.id).await.unwrap();
        store.mark_failed(intent.id).await.unwrap();
        assert_eq!(store.get(intent.id).unwrap().retries, 2);

        let ok = store.insert(&draft(IntentKind::Jump, 2)).await.unwrap();
        store.mark_sent(ok.id, H256::repeat_byte(4), 0, false).await.unwrap();
        store.mark_confirmed(ok.id, true).await.unwrap();
        assert!(!store.mark_failed(ok.id).await.unwrap());
        assert_eq!(store.get(ok.id).unwrap().status, IntentStatus::Confirmed);
    }

    #[tokio::test]
    async fn mark_confirmed_only_from_sent() {
        let store = FakeStore::new();
        let intent = store.insert(&draft(IntentKind::Jump, 1)).await.unwrap();
        assert!(!store.mark_confirmed(intent.id, true).await.unwrap());

        store
            .mark_sent(intent.id, H256::repeat_byte(5), 0, false)
            .await
            .unwrap();
        assert!(store.mark_confirmed(intent.id, false).await.unwrap());
        assert_eq!(store.get(intent.id).unwrap().status, IntentStatus::Failed);
    }

    #[tokio::test]
    async fn recovery_batch_filters_by_budget_and_age() {
        let store = FakeStore::new();

        let mut young = draft(IntentKind::Jump, 1);
        young.client_ts_ms = 10_000;
        let mut old = draft(IntentKind::Jump, 2);
        old.client_ts_ms = 1_000;
        let mut exhausted = draft(IntentKind::Jump, 3);
        exhausted.client_ts_ms = 10_000;

        let young = store.insert(&young).await.unwrap();
        let old = store.insert(&old).await.unwrap();
        let exhausted = store.insert(&exhausted).await.unwrap();

        store.mark_failed(young.id).await.unwrap();
        store.mark_failed(old.id).await.unwrap();
        for _ in 0..5 {
            store.mark_failed(exhausted.id).await.unwrap();
        }

        // Cutoff excludes `old`; budget excludes `exhausted`.
        let batch = store.next_recovery_batch(10, 5, 5_000).await.unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].id, young.id);
    }

    #[tokio::test]
    async fn recovery_batch_orders_by_client_timestamp() {
        let store = FakeStore::new();
        for ts in [5_000u64, 3_000, 4_000] {
            let mut d = draft(IntentKind::Jump, 1);
            d.client_ts_ms = ts;
            let intent = store.insert(&d).await.unwrap();
            store.mark_failed(intent.id).await.unwrap();
        }
        let batch = store.next_recovery_batch(10, 5, 0).await.unwrap();
        let got: Vec<u64> = batch.iter().map(|i| i.client_ts_ms).collect();
        assert_eq!(got, vec![3_000, 4_000, 5_000]);
    }

    #[tokio::test]
    async fn housekeeping_evicts_dropped_sent_rows() {
        use std::time::Duration;

        let store = FakeStore::new();
        let stuck = store.insert(&draft(IntentKind::Jump, 1)).await.unwrap();
        store
            .mark_sent(stuck.id, H256::repeat_byte(8), 0, false)
            .await
            .unwrap();
        store.age_row(stuck.id, chrono::Duration::hours(2)).unwrap();

        let fresh = store.insert(&draft(IntentKind::Jump, 2)).await.unwrap();
        store
            .mark_sent(fresh.id, H256::repeat_byte(9), 0, false)
            .await
            .unwrap();

        let report = store
            .housekeeping(
                Duration::from_secs(3_600),
                Duration::from_secs(3_600),
                Duration::from_secs(86_400),
            )
            .await
            .unwrap();
        assert_eq!(report.evicted, 1);

        let row = store.get(stuck.id).unwrap();
        assert_eq!(row.status, IntentStatus::Failed);
        assert_eq!(row.retries, 1, "a dropped submission spends a retry");
        // A recently sent row keeps waiting for its receipt.
        assert_eq!(store.get(fresh.id).unwrap().status, IntentStatus::Sent);
    }

    #[tokio::test]
    async fn count_and_pages_track_status() {
        let store = FakeStore::new();
        let a = store.insert(&draft(IntentKind::Jump, 1)).await.unwrap();
        let b = store.insert(&draft(IntentKind::Jump, 2)).await.unwrap();
        assert_eq!(store.count_pending().await.unwrap(), 2);

        store.mark_sent(a.id, H256::repeat_byte(6), 0, false).await.unwrap();
        assert_eq!(store.count_pending().await.unwrap(), 1);
        assert_eq!(store.pending_page(10).await.unwrap()[0].id, b.id);
        assert_eq!(store.sent_page(10).await.unwrap()[0].id, a.id);
    }
}
