use crate::intent::Intent;
use ethers::types::{Address, H256};
use serde::Serialize;
use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::Notify;

pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_else(|_| Duration::from_secs(0))
        .as_millis() as u64
}

/// Point-in-time view of one account, for the `account_status` surface.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountStatus {
    pub index: u32,
    pub address: Address,
    pub sending: bool,
    pub queue_length: usize,
    pub processed: u64,
    pub consecutive_errors: u32,
    pub quarantined: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_nonce: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_hash: Option<H256>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_submit_ms: Option<u64>,
}

/// A submission the chain accepted whose `mark_sent` write is still owed to
/// the store. Held on the account until the write lands; the intent id stays
/// in the pool's tracked set the whole time so the pickup tick cannot hand
/// the still-`pending` row to another account.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnreconciledMark {
    pub intent_id: i64,
    pub hash: H256,
}

#[derive(Default)]
struct Inner {
    queue: VecDeque<Intent>,
    next_nonce: Option<u64>,
    sending: bool,
    consecutive_errors: u32,
    total_processed: u64,
    last_submit_ms: Option<u64>,
    last_hash: Option<H256>,
    unreconciled: Vec<UnreconciledMark>,
}

/// One signing identity in a pool. All fields are owned by the account's
/// sender loop; everyone else takes a snapshot under a short lock.
pub struct Account {
    pub index: u32,
    pub address: Address,
    /// Woken on enqueue so the sender does not wait out a full tick.
    pub wake: Notify,
    inner: Mutex<Inner>,
}

impl Account {
    pub fn new(index: u32, address: Address) -> Self {
        Self {
            index,
            address,
            wake: Notify::new(),
            inner: Mutex::new(Inner::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn enqueue(&self, intent: Intent) {
        self.lock().queue.push_back(intent);
        self.wake.notify_one();
    }

    pub fn queue_len(&self) -> usize {
        self.lock().queue.len()
    }

    pub fn is_quarantined(&self, fault_threshold: u32) -> bool {
        self.lock().consecutive_errors >= fault_threshold
    }

    /// Claim the account for one submission. Returns the queue head (without
    /// popping it) and flips `sending`; `None` when the account is busy,
    /// quarantined, or idle. `sending` acts as the per-account mutex: at most
    /// one submission is ever in flight.
    pub fn try_begin(&self, fault_threshold: u32) -> Option<Intent> {
        let mut inner = self.lock();
        if inner.sending || inner.consecutive_errors >= fault_threshold {
            return None;
        }
        let head = inner.queue.front()?.clone();
        inner.sending = true;
        Some(head)
    }

    pub fn nonce(&self) -> Option<u64> {
        self.lock().next_nonce
    }

    /// Seed or resync the nonce cursor. The only path that may move it
    /// backwards; used exclusively after a chain query.
    pub fn set_nonce(&self, nonce: u64) {
        self.lock().next_nonce = Some(nonce);
    }

    /// Record a successful submission: advance the nonce cursor, pop the
    /// head, clear the error streak.
    pub fn complete_success(&self, hash: H256, submitted_at_ms: u64) -> Option<Intent> {
        let mut inner = self.lock();
        inner.next_nonce = inner.next_nonce.map(|n| n + 1);
        let popped = inner.queue.pop_front();
        inner.consecutive_errors = 0;
        inner.total_processed += 1;
        inner.last_hash = Some(hash);
        inner.last_submit_ms = Some(submitted_at_ms);
        popped
    }

    /// Record a rejected submission: pop the head, extend the error streak.
    /// Returns the popped intent and the new streak length.
    pub fn complete_rejected(&self) -> (Option<Intent>, u32) {
        let mut inner = self.lock();
        let popped = inner.queue.pop_front();
        inner.consecutive_errors = inner.consecutive_errors.saturating_add(1);
        (popped, inner.consecutive_errors)
    }

    /// A failure not attributable to the head intent (e.g. the nonce seed
    /// query). The head stays queued for the next tick.
    pub fn note_transient(&self) -> u32 {
        let mut inner = self.lock();
        inner.consecutive_errors = inner.consecutive_errors.saturating_add(1);
        inner.consecutive_errors
    }

    pub fn release(&self) {
        self.lock().sending = false;
    }

    /// Remember a submission whose store write has not landed yet.
    pub fn defer_mark(&self, intent_id: i64, hash: H256) {
        self.lock().unreconciled.push(UnreconciledMark { intent_id, hash });
    }

    /// Drain the owed store writes. Callers re-defer whatever still fails.
    pub fn take_unreconciled(&self) -> Vec<UnreconciledMark> {
        std::mem::take(&mut self.lock().unreconciled)
    }

    /// Operator action: return a quarantined account to the rotation.
    pub fn reset(&self) {
        self.lock().consecutive_errors = 0;
        self.wake.notify_one();
    }

    pub fn snapshot(&self, fault_threshold: u32) -> AccountStatus {
        let inner = self.lock();
        AccountStatus {
            index: self.index,
            address: self.address,
            sending: inner.sending,
            queue_length: inner.queue.len(),
            processed: inner.total_processed,
            consecutive_errors: inner.consecutive_errors,
            quarantined: inner.consecutive_errors >= fault_threshold,
            next_nonce: inner.next_nonce,
            last_hash: inner.last_hash,
            last_submit_ms: inner.last_submit_ms,
        }
    }
}

/// A fixed set of accounts plus the registry of queued intent ids. The set is
/// immutable for the lifetime of a run; individual accounts may only be
/// quarantined, never removed.
pub struct AccountPool {
    accounts: Vec<Arc<Account>>,
    fault_threshold: u32,
    tracked: Mutex<HashSet<i64>>,
}

impl AccountPool {
    pub fn new(addresses: Vec<Address>, fault_threshold: u32) -> Self {
        let accounts = addresses
            .into_iter()
            .enumerate()
            .map(|(i, addr)| Arc::new(Account::new(i as u32, addr)))
            .collect();
        Self {
            accounts,
            fault_threshold,
            tracked: Mutex::new(HashSet::new()),
        }
    }

    pub fn len(&self) -> usize {
        self.accounts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.accounts.is_empty()
    }

    pub fn fault_threshold(&self) -> u32 {
        self.fault_threshold
    }

    pub fn get(&self, index: u32) -> Option<&Arc<Account>> {
        self.accounts.get(index as usize)
    }

    pub fn accounts(&self) -> &[Arc<Account>] {
        &self.accounts
    }

    pub fn statuses(&self) -> Vec<AccountStatus> {
        self.accounts
            .iter()
            .map(|a| a.snapshot(self.fault_threshold))
            .collect()
    }

    pub fn reset(&self, index: u32) -> bool {
        match self.get(index) {
            Some(account) => {
                account.reset();
                true
            }
            None => false,
        }
    }

    /// Register an intent id as queued. Returns false when it already is,
    /// which keeps one intent from entering two queues.
    pub fn track(&self, id: i64) -> bool {
        self.tracked
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id)
    }

    pub fn untrack(&self, id: i64) {
        self.tracked
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&id);
    }

    pub fn is_tracked(&self, id: i64) -> bool {
        self.tracked
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(&id)
    }
}
