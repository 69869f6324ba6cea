//! Deterministic fakes for the constructor-injected collaborators, plus small
//! fixture builders shared across the unit tests.

use crate::chain::{Chain, ReceiptInfo};
use crate::error::{ChainError, StoreError, SubmitError};
use crate::intent::{Intent, IntentDraft, IntentKind, IntentStatus, IntentUpdate};
use crate::notifier::Notifier;
use crate::store::{HousekeepingReport, Store};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ethers::types::{Address, H256};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicI64, AtomicU32, Ordering};
use std::sync::Mutex;
use std::time::Duration;

pub fn draft(kind: IntentKind, score: u64) -> IntentDraft {
    IntentDraft {
        player: Address::from_low_u64_be(0xabc),
        game_id: "G1".to_string(),
        kind,
        score,
        height: matches!(kind, IntentKind::Jump).then_some(1_800),
        username: matches!(kind, IntentKind::Setplayer).then(|| "ace".to_string()),
        client_ts_ms: 1_000,
    }
}

pub fn intent_with_id(id: i64, kind: IntentKind) -> Intent {
    let d = draft(kind, 42);
    Intent {
        id,
        player: d.player,
        game_id: d.game_id,
        kind,
        score: d.score,
        height: d.height,
        username: d.username,
        client_ts_ms: d.client_ts_ms,
        status: IntentStatus::Pending,
        hash: None,
        account_index: None,
        retries: 0,
        created_at: Utc::now(),
    }
}

fn consume(counter: &AtomicU32) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |c| c.checked_sub(1))
        .is_ok()
}

/// In-memory stand-in for the Postgres store. Enforces the same transition
/// guards the SQL does, so the trait contract is testable without a database.
#[derive(Default)]
pub struct FakeStore {
    rows: Mutex<Vec<Intent>>,
    next_id: AtomicI64,
    fail_inserts: AtomicU32,
    fail_marks: AtomicU32,
    /// Last transition time per row, mirroring the `updated_at` column.
    marked_at: Mutex<HashMap<i64, DateTime<Utc>>>,
    events: Mutex<Vec<IntentDraft>>,
    sessions: Mutex<HashMap<String, Address>>,
    leaderboard: Mutex<HashMap<Address, (Option<String>, u64)>>,
}

impl FakeStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: i64) -> Option<Intent> {
        self.rows
            .lock()
            .unwrap()
            .iter()
            .find(|r| r.id == id)
            .cloned()
    }

    /// Fail the next `n` inserts with `StoreError::Unavailable`.
    pub fn fail_next_inserts(&self, n: u32) {
        self.fail_inserts.store(n, Ordering::SeqCst);
    }

    /// Fail the next `n` `mark_sent` calls with `StoreError::Unavailable`.
    pub fn fail_next_marks(&self, n: u32) {
        self.fail_marks.store(n, Ordering::SeqCst);
    }

    /// Shift a row's insert and transition times into the past, for
    /// housekeeping tests.
    pub fn age_row(&self, id: i64, by: chrono::Duration) -> Option<()> {
        let mut rows = self.rows.lock().unwrap();
        let row = rows.iter_mut().find(|r| r.id == id)?;
        row.created_at -= by;
        if let Some(ts) = self.marked_at.lock().unwrap().get_mut(&id) {
            *ts -= by;
        }
        Some(())
    }

    pub fn events(&self) -> Vec<IntentDraft> {
        self.events.lock().unwrap().clone()
    }

    pub fn sessions(&self) -> HashMap<String, Address> {
        self.sessions.lock().unwrap().clone()
    }

    pub fn leaderboard(&self) -> HashMap<Address, (Option<String>, u64)> {
        self.leaderboard.lock().unwrap().clone()
    }
}

#[async_trait]
impl Store for FakeStore {
    async fn insert(&self, draft: &IntentDraft) -> Result<Intent, StoreError> {
        if consume(&self.fail_inserts) {
            return Err(StoreError::Unavailable("injected insert failure".into()));
        }
        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let intent = Intent {
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
            created_at: Utc::now(),
        };
        self.rows.lock().unwrap().push(intent.clone());
        Ok(intent)
    }

    async fn mark_sent(
        &self,
        id: i64,
        hash: H256,
        account_index: u32,
        via_recovery: bool,
    ) -> Result<bool, StoreError> {
        if consume(&self.fail_marks) {
            return Err(StoreError::Unavailable("injected mark failure".into()));
        }
        let mut rows = self.rows.lock().unwrap();
        let Some(row) = rows.iter_mut().find(|r| r.id == id) else {
            return Ok(false);
        };
        if !row.status.allows(IntentStatus::Sent, via_recovery) {
            return Ok(false);
        }
        row.status = IntentStatus::Sent;
        row.hash = Some(hash);
        row.account_index = Some(account_index);
        let id = row.id;
        drop(rows);
        self.marked_at.lock().unwrap().insert(id, Utc::now());
        Ok(true)
    }

    async fn mark_failed(&self, id: i64) -> Result<bool, StoreError> {
        let mut rows = self.rows.lock().unwrap();
        let Some(row) = rows.iter_mut().find(|r| r.id == id) else {
            return Ok(false);
        };
        if row.status == IntentStatus::Confirmed {
            return Ok(false);
        }
        row.status = IntentStatus::Failed;
        row.retries += 1;
        let id = row.id;
        drop(rows);
        self.marked_at.lock().unwrap().insert(id, Utc::now());
        Ok(true)
    }

    async fn mark_confirmed(&self, id: i64, success: bool) -> Result<bool, StoreError> {
        let mut rows = self.rows.lock().unwrap();
        let Some(row) = rows.iter_mut().find(|r| r.id == id) else {
            return Ok(false);
        };
        if row.status != IntentStatus::Sent {
            return Ok(false);
        }
        row.status = if success {
            IntentStatus::Confirmed
        } else {
            IntentStatus::Failed
        };
        let id = row.id;
        drop(rows);
        self.marked_at.lock().unwrap().insert(id, Utc::now());
        Ok(true)
    }

    async fn count_pending(&self) -> Result<u64, StoreError> {
        Ok(self
            .rows
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.status == IntentStatus::Pending)
            .count() as u64)
    }

    async fn pending_page(&self, limit: u32) -> Result<Vec<Intent>, StoreError> {
        let mut page: Vec<Intent> = self
            .rows
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.status == IntentStatus::Pending)
            .cloned()
            .collect();
        page.sort_by_key(|r| r.id);
        page.truncate(limit as usize);
        Ok(page)
    }

    async fn sent_page(&self, limit: u32) -> Result<Vec<Intent>, StoreError> {
        let mut page: Vec<Intent> = self
            .rows
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.status == IntentStatus::Sent)
            .cloned()
            .collect();
        page.sort_by_key(|r| r.id);
        page.truncate(limit as usize);
        Ok(page)
    }

    async fn next_recovery_batch(
        &self,
        limit: u32,
        max_retries: u32,
        age_cutoff_ms: u64,
    ) -> Result<Vec<Intent>, StoreError> {
        let mut batch: Vec<Intent> = self
            .rows
            .lock()
            .unwrap()
            .iter()
            .filter(|r| {
                r.status == IntentStatus::Failed
                    && r.retries < max_retries
                    && r.client_ts_ms > age_cutoff_ms
            })
            .cloned()
            .collect();
        batch.sort_by_key(|r| r.client_ts_ms);
        batch.truncate(limit as usize);
        Ok(batch)
    }

    async fn housekeeping(
        &self,
        pending_stale: Duration,
        sent_stale: Duration,
        retention: Duration,
    ) -> Result<HousekeepingReport, StoreError> {
        let stale_cutoff = Utc::now()
            - chrono::Duration::from_std(pending_stale).unwrap_or_else(|_| chrono::Duration::hours(1));
        let sent_cutoff = Utc::now()
            - chrono::Duration::from_std(sent_stale).unwrap_or_else(|_| chrono::Duration::hours(1));
        let retention_cutoff = Utc::now()
            - chrono::Duration::from_std(retention).unwrap_or_else(|_| chrono::Duration::hours(24));

        let marked_at = self.marked_at.lock().unwrap().clone();
        let mut rows = self.rows.lock().unwrap();
        let mut report = HousekeepingReport::default();
        for row in rows.iter_mut() {
            if row.status == IntentStatus::Pending && row.created_at < stale_cutoff {
                row.status = IntentStatus::Failed;
                report.promoted += 1;
            } else if row.status == IntentStatus::Sent {
                let last = marked_at.get(&row.id).copied().unwrap_or(row.created_at);
                if last < sent_cutoff {
                    row.status = IntentStatus::Failed;
                    row.retries += 1;
                    report.evicted += 1;
                }
            }
        }
        rows.retain(|r| {
            let prune = r.status.is_terminal() && r.created_at < retention_cutoff;
            if prune {
                report.deleted += 1;
            }
            !prune
        });
        Ok(report)
    }

    async fn touch_session(&self, game_id: &str, player: Address) -> Result<(), StoreError> {
        self.sessions
            .lock()
            .unwrap()
            .insert(game_id.to_string(), player);
        Ok(())
    }

    async fn record_game_event(&self, draft: &IntentDraft) -> Result<(), StoreError> {
        self.events.lock().unwrap().push(draft.clone());
        Ok(())
    }

    async fn update_leaderboard(
        &self,
        player: Address,
        username: Option<&str>,
        score: u64,
    ) -> Result<(), StoreError> {
        let mut board = self.leaderboard.lock().unwrap();
        let entry = board.entry(player).or_insert((None, 0));
        if let Some(name) = username {
            entry.0 = Some(name.to_string());
        }
        entry.1 = entry.1.max(score);
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmittedTx {
    pub account: u32,
    pub nonce: u64,
    pub intent_id: i64,
    pub kind: IntentKind,
}

struct ChainState {
    /// Chain-side next nonce per account; a submission must match exactly.
    nonces: Vec<u64>,
    /// Scripted failures consumed before the nonce check, per account.
    scripted: Vec<VecDeque<SubmitError>>,
    submissions: Vec<SubmittedTx>,
    receipts: HashMap<H256, ReceiptInfo>,
    block: u64,
    failing_nonce_reads: u32,
}

/// Scriptable chain fake. Accepts a submission only when its nonce equals the
/// chain-side counter, which makes nonce-ordering violations loud.
pub struct FakeChain {
    state: Mutex<ChainState>,
}

impl FakeChain {
    pub fn new(accounts: usize) -> Self {
        Self {
            state: Mutex::new(ChainState {
                nonces: vec![0; accounts],
                scripted: (0..accounts).map(|_| VecDeque::new()).collect(),
                submissions: Vec::new(),
                receipts: HashMap::new(),
                block: 1,
                failing_nonce_reads: 0,
            }),
        }
    }

    pub fn tx_hash(intent_id: i64, nonce: u64) -> H256 {
        let mut bytes = [0u8; 32];
        bytes[..8].copy_from_slice(&(intent_id as u64).to_be_bytes());
        bytes[8..16].copy_from_slice(&nonce.to_be_bytes());
        H256::from(bytes)
    }

    pub fn set_chain_nonce(&self, index: u32, nonce: u64) {
        self.state.lock().unwrap().nonces[index as usize] = nonce;
    }

    pub fn script_failure(&self, index: u32, err: SubmitError) {
        self.state.lock().unwrap().scripted[index as usize].push_back(err);
    }

    pub fn fail_next_nonce_reads(&self, n: u32) {
        self.state.lock().unwrap().failing_nonce_reads = n;
    }

    pub fn set_receipt(&self, hash: H256, success: bool, block_number: u64) {
        self.state.lock().unwrap().receipts.insert(
            hash,
            ReceiptInfo {
                success,
                block_number,
            },
        );
    }

    pub fn submissions(&self) -> Vec<SubmittedTx> {
        self.state.lock().unwrap().submissions.clone()
    }
}

#[async_trait]
impl Chain for FakeChain {
    fn accounts(&self) -> usize {
        self.state.lock().unwrap().nonces.len()
    }

    fn address(&self, index: u32) -> Address {
        Address::from_low_u64_be(u64::from(index) + 1)
    }

    async fn pending_nonce(&self, index: u32) -> Result<u64, ChainError> {
        let mut state = self.state.lock().unwrap();
        if state.failing_nonce_reads > 0 {
            state.failing_nonce_reads -= 1;
            return Err(ChainError::Transport("injected nonce read failure".into()));
        }
        Ok(state.nonces[index as usize])
    }

    async fn submit(&self, index: u32, nonce: u64, intent: &Intent) -> Result<H256, SubmitError> {
        let mut state = self.state.lock().unwrap();
        if let Some(err) = state.scripted[index as usize].pop_front() {
            return Err(err);
        }
        let expected = state.nonces[index as usize];
        if nonce != expected {
            return Err(SubmitError::NonceMismatch(format!(
                "nonce too low: expected {expected}, got {nonce}"
            )));
        }
        state.nonces[index as usize] = expected + 1;
        let hash = Self::tx_hash(intent.id, nonce);
        state.submissions.push(SubmittedTx {
            account: index,
            nonce,
            intent_id: intent.id,
            kind: intent.kind,
        });
        Ok(hash)
    }

    async fn receipt(&self, hash: H256) -> Result<Option<ReceiptInfo>, ChainError> {
        Ok(self.state.lock().unwrap().receipts.get(&hash).copied())
    }

    async fn latest_block(&self) -> Result<u64, ChainError> {
        Ok(self.state.lock().unwrap().block)
    }
}

#[derive(Default)]
pub struct CollectingNotifier {
    updates: Mutex<Vec<IntentUpdate>>,
}

impl CollectingNotifier {
    pub fn updates(&self) -> Vec<IntentUpdate> {
        self.updates.lock().unwrap().clone()
    }
}

impl Notifier for CollectingNotifier {
    fn notify(&self, update: &IntentUpdate) {
        self.updates.lock().unwrap().push(update.clone());
    }
}
