use thiserror::Error;

/// Failures surfaced by the durable queue store.
///
/// Connectivity loss, pool exhaustion, and per-operation deadline overruns all
/// collapse into `Unavailable`; callers treat it as transient and back off.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("queue store unavailable: {0}")]
    Unavailable(String),
}

/// Failures from read-side chain RPCs (nonce, receipt, block number).
#[derive(Debug, Error)]
pub enum ChainError {
    #[error("rpc failure: {0}")]
    Transport(String),
}

/// Classified outcome of a failed submission attempt.
#[derive(Debug, Error)]
pub enum SubmitError {
    /// The provider rejected our nonce (too low / already used). The sender
    /// resyncs from the chain and retries the same intent in place.
    #[error("nonce mismatch: {0}")]
    NonceMismatch(String),

    /// Simulation revert or argument rejection. The intent is marked failed;
    /// only the recovery dispatcher may try it again.
    #[error("submission rejected: {0}")]
    Rejected(String),

    /// Transport-level failure after the transport adapter's own retries.
    /// Counts as one submission failure on the live path.
    #[error("transport failure: {0}")]
    Transport(String),
}

#[derive(Debug, Error)]
pub enum ScheduleError {
    #[error("no account available for scheduling")]
    NoAvailableAccount,

    /// The intent already sits in an account queue. Enforces the
    /// single-queue-membership rule when admission and the pickup tick race.
    #[error("intent is already queued")]
    AlreadyQueued,
}

/// Admission-call failures. A successful admission means the durable insert
/// succeeded; scheduling afterwards is best-effort.
#[derive(Debug, Error)]
pub enum AdmitError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("invalid submission: {0}")]
    Invalid(String),

    #[error("dispatcher is shutting down")]
    ShuttingDown,
}

#[derive(Debug, Error)]
#[error("invalid configuration: {0}")]
pub struct ConfigError(pub String);

/// Nonce-mismatch markers seen across providers (geth, erigon, nethermind).
const NONCE_MARKERS: &[&str] = &[
    "nonce too low",
    "nonce is too low",
    "invalid nonce",
    "already known",
    "already imported",
    "replacement transaction underpriced",
];

const TRANSPORT_MARKERS: &[&str] = &[
    "timed out",
    "timeout",
    "connection",
    "tcp connect",
    "dns error",
    "error sending request",
];

/// Map a raw provider error message to a [`SubmitError`] class.
///
/// Providers disagree on wording, so this is substring matching over the
/// lower-cased message. Anything unrecognized counts as a rejection: the
/// recovery dispatcher owns the retry budget for those.
pub fn classify_submit_error(message: &str) -> SubmitError {
    let lower = message.to_lowercase();
    if NONCE_MARKERS.iter().any(|m| lower.contains(m)) {
        return SubmitError::NonceMismatch(message.to_string());
    }
    if TRANSPORT_MARKERS.iter().any(|m| lower.contains(m)) {
        return SubmitError::Transport(message.to_string());
    }
    SubmitError::Rejected(message.to_string())
}
