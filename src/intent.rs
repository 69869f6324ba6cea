use chrono::{DateTime, Utc};
use ethers::types::{Address, H256};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IntentKind {
    Jump,
    Gameover,
    Setplayer,
}

impl IntentKind {
    pub fn as_str(self) -> &'static str {
        match self {
            IntentKind::Jump => "jump",
            IntentKind::Gameover => "gameover",
            IntentKind::Setplayer => "setplayer",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "jump" => Some(IntentKind::Jump),
            "gameover" => Some(IntentKind::Gameover),
            "setplayer" => Some(IntentKind::Setplayer),
            _ => None,
        }
    }
}

impl fmt::Display for IntentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IntentStatus {
    Pending,
    Sent,
    Confirmed,
    Failed,
}

impl IntentStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            IntentStatus::Pending => "pending",
            IntentStatus::Sent => "sent",
            IntentStatus::Confirmed => "confirmed",
            IntentStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(IntentStatus::Pending),
            "sent" => Some(IntentStatus::Sent),
            "confirmed" => Some(IntentStatus::Confirmed),
            "failed" => Some(IntentStatus::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, IntentStatus::Confirmed | IntentStatus::Failed)
    }

    /// Whether `self -> next` is a legal lifecycle transition.
    ///
    /// `failed -> sent` is reserved for the recovery dispatcher, and
    /// `failed -> failed` is how recovery records another spent retry.
    pub fn allows(self, next: IntentStatus, via_recovery: bool) -> bool {
        use IntentStatus::*;
        match (self, next) {
            (Pending, Sent) => true,
            (Pending, Failed) => true,
            (Sent, Confirmed) => true,
            (Sent, Failed) => true,
            (Failed, Sent) => via_recovery,
            (Failed, Failed) => via_recovery,
            _ => false,
        }
    }
}

impl fmt::Display for IntentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An admission request before it has a durable identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IntentDraft {
    pub player: Address,
    pub game_id: String,
    pub kind: IntentKind,
    pub score: u64,
    /// Only meaningful for `jump`.
    pub height: Option<u64>,
    /// Only meaningful for `setplayer`.
    pub username: Option<String>,
    pub client_ts_ms: u64,
}

/// A durable submission request bound for the chain. One row in the queue
/// table; mutated only by the sender loops and the confirmation watcher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Intent {
    pub id: i64,
    pub player: Address,
    pub game_id: String,
    pub kind: IntentKind,
    pub score: u64,
    pub height: Option<u64>,
    pub username: Option<String>,
    pub client_ts_ms: u64,
    pub status: IntentStatus,
    pub hash: Option<H256>,
    pub account_index: Option<u32>,
    pub retries: u32,
    pub created_at: DateTime<Utc>,
}

/// Update event delivered to subscribers whenever an intent transitions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IntentUpdate {
    pub id: i64,
    pub player: Address,
    pub game_id: String,
    pub kind: IntentKind,
    pub status: IntentStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hash: Option<H256>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub score: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub block_number: Option<u64>,
}

impl IntentUpdate {
    pub fn new(intent: &Intent, status: IntentStatus) -> Self {
        Self {
            id: intent.id,
            player: intent.player,
            game_id: intent.game_id.clone(),
            kind: intent.kind,
            status,
            hash: intent.hash,
            score: match intent.kind {
                IntentKind::Setplayer => None,
                _ => Some(intent.score),
            },
            block_number: None,
        }
    }

    pub fn with_hash(mut self, hash: H256) -> Self {
        self.hash = Some(hash);
        self
    }

    pub fn with_block(mut self, block: u64) -> Self {
        self.block_number = Some(block);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_round_trips_through_text() {
        for kind in [IntentKind::Jump, IntentKind::Gameover, IntentKind::Setplayer] {
            assert_eq!(IntentKind::parse(kind.as_str()), Some(kind));
        }
        assert_eq!(IntentKind::parse("teleport"), None);
    }

    #[test]
    fn live_path_transitions() {
        use IntentStatus::*;
        assert!(Pending.allows(Sent, false));
        assert!(Pending.allows(Failed, false));
        assert!(Sent.allows(Confirmed, false));
        assert!(Sent.allows(Failed, false));
    }

    #[test]
    fn terminal_states_never_regress() {
        use IntentStatus::*;
        assert!(!Confirmed.allows(Sent, false));
        assert!(!Confirmed.allows(Sent, true));
        assert!(!Confirmed.allows(Pending, true));
        assert!(!Sent.allows(Pending, false));
        assert!(!Sent.allows(Pending, true));
    }

    #[test]
    fn failed_resend_is_recovery_only() {
        use IntentStatus::*;
        assert!(!Failed.allows(Sent, false));
        assert!(Failed.allows(Sent, true));
        assert!(Failed.allows(Failed, true));
        assert!(!Failed.allows(Confirmed, true));
    }

    #[test]
    fn update_wire_shape_is_camel_case_and_sparse() {
        let update = IntentUpdate {
            id: 7,
            player: Address::from_low_u64_be(0xabc),
            game_id: "G1".into(),
            kind: IntentKind::Jump,
            status: IntentStatus::Confirmed,
            hash: Some(H256::repeat_byte(1)),
            score: Some(42),
            block_number: Some(120),
        };
        let value = serde_json::to_value(&update).unwrap();
        assert_eq!(value["gameId"], "G1");
        assert_eq!(value["kind"], "jump");
        assert_eq!(value["status"], "confirmed");
        assert_eq!(value["blockNumber"], 120);

        // Absent fields are omitted, not null.
        let sparse = IntentUpdate {
            hash: None,
            score: None,
            block_number: None,
            ..update
        };
        let value = serde_json::to_value(&sparse).unwrap();
        assert!(value.get("hash").is_none());
        assert!(value.get("score").is_none());
        assert!(value.get("blockNumber").is_none());
    }

    #[test]
    fn update_omits_score_for_setplayer() {
        let intent = Intent {
            id: 9,
            player: Address::zero(),
            game_id: "G1".into(),
            kind: IntentKind::Setplayer,
            score: 0,
            height: None,
            username: Some("ace".into()),
            client_ts_ms: 1_000,
            status: IntentStatus::Pending,
            hash: None,
            account_index: None,
            retries: 0,
            created_at: Utc::now(),
        };
        let update = IntentUpdate::new(&intent, IntentStatus::Sent);
        assert_eq!(update.score, None);
        assert_eq!(update.block_number, None);
    }
}
