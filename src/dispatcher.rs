use crate::account::AccountStatus;
use crate::error::{AdmitError, ScheduleError, StoreError};
use crate::intent::{IntentDraft, IntentKind};
use crate::scheduler::Scheduler;
use crate::store::Store;
use ethers::types::Address;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

const MAX_USERNAME_LEN: usize = 64;
const MAX_GAME_ID_LEN: usize = 128;

/// The admission surface. Transport-agnostic: the client-facing layer calls
/// these methods, the caller observes outcomes through update notifications.
///
/// Each admission inserts the intent as `pending` (durable, may fail the
/// call), then hands it to the scheduler (best-effort; a deferred intent is
/// picked up by the next scheduler tick).
pub struct Dispatcher {
    store: Arc<dyn Store>,
    scheduler: Scheduler,
    accepting: AtomicBool,
}

impl Dispatcher {
    pub fn new(store: Arc<dyn Store>, scheduler: Scheduler) -> Self {
        Self {
            store,
            scheduler,
            accepting: AtomicBool::new(true),
        }
    }

    /// First step of graceful shutdown: refuse new admissions while in-flight
    /// submissions finish.
    pub fn stop_accepting(&self) {
        self.accepting.store(false, Ordering::SeqCst);
    }

    pub async fn submit_jump(
        &self,
        player: Address,
        game_id: &str,
        height: u64,
        score: u64,
        client_ts_ms: u64,
    ) -> Result<i64, AdmitError> {
        self.admit(IntentDraft {
            player,
            game_id: game_id.to_string(),
            kind: IntentKind::Jump,
            score,
            height: Some(height),
            username: None,
            client_ts_ms,
        })
        .await
    }

    pub async fn submit_gameover(
        &self,
        player: Address,
        game_id: &str,
        final_score: u64,
        client_ts_ms: u64,
    ) -> Result<i64, AdmitError> {
        self.admit(IntentDraft {
            player,
            game_id: game_id.to_string(),
            kind: IntentKind::Gameover,
            score: final_score,
            height: None,
            username: None,
            client_ts_ms,
        })
        .await
    }

    pub async fn submit_setplayer(
        &self,
        player: Address,
        username: &str,
        client_ts_ms: u64,
    ) -> Result<i64, AdmitError> {
        self.admit(IntentDraft {
            player,
            game_id: String::new(),
            kind: IntentKind::Setplayer,
            score: 0,
            height: None,
            username: Some(username.to_string()),
            client_ts_ms,
        })
        .await
    }

    pub async fn pending_count(&self) -> Result<u64, StoreError> {
        self.store.count_pending().await
    }

    pub fn account_status(&self) -> Vec<AccountStatus> {
        self.scheduler.pool().statuses()
    }

    /// Operator action: return a quarantined account to the rotation.
    pub fn reset(&self, index: u32) -> bool {
        self.scheduler.pool().reset(index)
    }

    async fn admit(&self, draft: IntentDraft) -> Result<i64, AdmitError> {
        if !self.accepting.load(Ordering::SeqCst) {
            return Err(AdmitError::ShuttingDown);
        }
        validate(&draft)?;

        // Heartbeat and event log are observability side effects; they never
        // fail an admission.
        if !draft.game_id.is_empty() {
            if let Err(e) = self.store.touch_session(&draft.game_id, draft.player).await {
                tracing::debug!(error = %e, "session heartbeat skipped");
            }
        }
        if let Err(e) = self.store.record_game_event(&draft).await {
            tracing::debug!(error = %e, "game event log skipped");
        }

        let intent = self.store.insert(&draft).await?;
        let id = intent.id;

        match self.scheduler.schedule(intent) {
            Ok(index) => {
                tracing::debug!(intent = id, account = index, "admitted");
            }
            Err(ScheduleError::NoAvailableAccount) => {
                tracing::warn!(intent = id, "no account available; deferred to pickup tick");
            }
            Err(ScheduleError::AlreadyQueued) => {}
        }
        Ok(id)
    }
}

fn validate(draft: &IntentDraft) -> Result<(), AdmitError> {
    let invalid = |msg: &str| Err(AdmitError::Invalid(msg.to_string()));

    // Scores, heights, and timestamps are unbounded non-negative on the chain
    // side but ride a signed 64-bit column in the store.
    if draft.score > i64::MAX as u64 {
        return invalid("score out of range");
    }
    if draft.height.is_some_and(|h| h > i64::MAX as u64) {
        return invalid("height out of range");
    }
    if draft.client_ts_ms > i64::MAX as u64 {
        return invalid("client timestamp out of range");
    }
    if draft.game_id.len() > MAX_GAME_ID_LEN {
        return invalid("game id too long");
    }

    match draft.kind {
        IntentKind::Jump | IntentKind::Gameover => {
            if draft.game_id.is_empty() {
                return invalid("game id required");
            }
        }
        IntentKind::Setplayer => match draft.username.as_deref() {
            None | Some("") => return invalid("username required"),
            Some(name) if name.len() > MAX_USERNAME_LEN => {
                return invalid("username too long");
            }
            Some(_) => {}
        },
    }
    Ok(())
}
