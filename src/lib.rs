//! Dispatcher core for the LeapChain game contract.
//!
//! Accepts a stream of small game events (jumps, game-over records, player
//! names) and commits them to the contract through a pool of funded recorder
//! accounts: durable queueing in Postgres, deterministic account selection,
//! per-account nonce-ordered senders, a confirmation watcher, and a
//! low-cadence recovery dispatcher with its own disjoint account pool.

pub mod account;
pub mod chain;
pub mod config;
pub mod contract;
pub mod dispatcher;
pub mod error;
pub mod intent;
pub mod notifier;
pub mod recovery;
pub mod scheduler;
pub mod sender;
pub mod store;
pub mod watcher;

#[cfg(test)]
pub(crate) mod testutil;
