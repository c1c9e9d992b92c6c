//! Produce and finalize blocks for a single shard without external consensus.
//!
//! # Design
//!
//! The [Actor] owns the pending store, producer, duplicate window, and aggregator, and handles
//! every [Message] from a single mailbox in arrival order. While started, a ticker task only
//! enqueues [Message::Tick] every interval; production itself always happens on the actor.
//!
//! Each produced (or externally delivered) block is added to the pending store, which executes
//! it and persists its predecessor. Executed blocks of this shard are folded into the duplicate
//! window, and their cross-shard messages are dispatched before the activity is forwarded to
//! the configured [crate::Reporter].
//!
//! Stopping aborts the ticker and clears the duplicate window. A block that fails to execute or
//! persist halts the store until [Mailbox::reload] resynchronizes it with the ledger.

use crate::{store, types::ShardId};
use std::time::Duration;
use thiserror::Error;

mod actor;
pub use actor::Actor;
mod ingress;
pub use ingress::{Mailbox, Message};
mod metrics;

/// Errors returned by the [Mailbox].
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("actor closed")]
    Closed,
    #[error(transparent)]
    Store(#[from] store::Error),
}

/// Configuration for the [Actor].
pub struct Config<L, P, K, B, R> {
    pub ledger: L,
    pub pool: P,
    pub keystore: K,
    pub broadcaster: B,

    /// Receives every executed and persisted block.
    pub reporter: R,

    /// Shard this node produces blocks for.
    pub shard: ShardId,

    /// Prefix for block and message signatures.
    pub namespace: Vec<u8>,

    /// Number of messages buffered before senders block.
    pub mailbox_size: usize,

    /// Time between produced blocks.
    pub interval: Duration,

    /// Number of heights checked for duplicate transactions.
    pub window_capacity: usize,

    /// Number of heights the pending store may hold ahead of execution.
    pub pending_capacity: usize,
}
