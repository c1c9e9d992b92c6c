//! Produce, execute, and durably commit the blocks of a single shard.
//!
//! # Overview
//!
//! A shard node turns agreed-upon blocks into durable chain state. This crate contains the
//! pipeline that sits between agreement and storage:
//!
//! * [store::Store] buffers executed-but-not-yet-durable blocks and submits them to the
//!   [Ledger] strictly in height order, one height behind execution.
//! * [producer::Producer] assembles and signs a candidate block from the [Pool], skipping
//!   transactions already committed within the recent duplicate [window::Window].
//! * [aggregator::Aggregator] groups the outbound messages of an executed block by destination
//!   shard, signs each group, commits to all groups of a height with a merkle root, and chains
//!   every envelope to the previous one sent to the same destination.
//! * [solo::Actor] serializes all of the above behind a single mailbox and drives periodic
//!   production from a timer.
//!
//! Everything external (execution, durable storage, the transaction pool, key management,
//! transport) is reached through the traits defined here so that callers can wire in their own
//! implementations. [memory] provides in-process versions of each.
//!
//! # Status
//!
//! `shardchain` is **ALPHA** software and is not yet recommended for production use. Developers
//! should expect breaking changes and occasional instability.

use commonware_cryptography::{ed25519, sha256, Signer};
use futures::channel::mpsc;
use thiserror::Error;

pub mod aggregator;
pub mod export;
pub mod memory;
pub mod merkle;
pub mod producer;
pub mod solo;
pub mod store;
pub mod types;
pub mod window;

use types::{Block, Envelope, ExecutionResult, ShardId, ShardTx, Transaction};

/// Position of a block in the canonical chain.
pub type Height = u64;

/// Digest used for blocks, transactions, and cross-shard message groups.
pub type Digest = sha256::Digest;

/// Public key of a block producer.
pub type PublicKey = ed25519::PublicKey;

/// Signature over a block or cross-shard message group.
pub type Signature = ed25519::Signature;

/// Errors returned by a [Ledger].
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LedgerError {
    #[error("not found")]
    NotFound,
    #[error("height {0} already persisted")]
    AlreadyPersisted(Height),
    #[error("height {0} does not extend the ledger")]
    OutOfOrder(Height),
    #[error("execution failed: {0}")]
    Execution(String),
    #[error("storage failure: {0}")]
    Storage(String),
}

/// Errors returned by a [Keystore].
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SignError {
    #[error("signing key unavailable")]
    Unavailable,
    #[error("signer rejected message: {0}")]
    Rejected(String),
}

/// Errors returned by a [Pool].
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PoolError {
    #[error("pool unavailable: {0}")]
    Unavailable(String),
}

/// Durable chain state.
///
/// The [store::Store] is the only component that calls [Ledger::submit].
pub trait Ledger: Clone + Send + 'static {
    /// Height of the last durably persisted block.
    fn height(&self) -> Height;

    /// Fetch a persisted block.
    fn block(&self, height: Height) -> Result<Block, LedgerError>;

    /// Fetch the committed state root of a persisted block.
    fn state_root(&self, height: Height) -> Result<Digest, LedgerError>;

    /// Execute a block against durable state without persisting the outcome.
    fn execute(&mut self, block: &Block) -> Result<ExecutionResult, LedgerError>;

    /// Persist a block and the result of executing it.
    ///
    /// Inbound cross-shard transactions included in the block are consumed.
    fn submit(&mut self, block: &Block, result: &ExecutionResult) -> Result<(), LedgerError>;

    /// Last parent-shard height known to the ledger.
    fn parent_height(&self) -> Height;

    /// Whether the parent-shard block at `height` is already cached locally.
    fn has_parent_block(&self, height: Height) -> bool;

    /// Inbound cross-shard transactions ready to be included by `shard`.
    fn shard_txs(&self, shard: ShardId) -> Result<Vec<ShardTx>, LedgerError>;

    /// Hash of the last message group sent to `target`, if any.
    fn shard_message_hash(&self, target: ShardId) -> Result<Option<Digest>, LedgerError>;

    /// Record the hash of the last message group sent to `target`.
    fn record_shard_message_hash(
        &mut self,
        target: ShardId,
        hash: Digest,
    ) -> Result<(), LedgerError>;
}

/// Source of pooled transactions.
pub trait Pool: Send + 'static {
    /// Return pooled transactions in arrival order.
    ///
    /// `since` is the lowest height the caller will check for duplicates.
    fn snapshot(&mut self, include_pending: bool, since: Height)
        -> Result<Vec<Transaction>, PoolError>;
}

/// Signing identity of the node.
pub trait Keystore: Clone + Send + 'static {
    /// Public key attached to produced blocks.
    fn public_key(&self) -> PublicKey;

    /// Sign `message` under `namespace`.
    fn sign(&self, namespace: &[u8], message: &[u8]) -> Result<Signature, SignError>;
}

impl Keystore for ed25519::PrivateKey {
    fn public_key(&self) -> PublicKey {
        Signer::public_key(self)
    }

    fn sign(&self, namespace: &[u8], message: &[u8]) -> Result<Signature, SignError> {
        Ok(Signer::sign(self, Some(namespace), message))
    }
}

/// Outbound transport for cross-shard envelopes.
///
/// Delivery is fire-and-forget.
pub trait Broadcaster: Clone + Send + 'static {
    fn broadcast(&mut self, envelope: Envelope);
}

/// Events emitted as blocks move through the [store::Store].
#[derive(Clone, Debug)]
pub enum Activity {
    /// A block was executed and the chained height advanced to it.
    Executed {
        block: Block,
        result: ExecutionResult,
    },
    /// A block was durably persisted.
    Persisted(Block),
}

/// Receives [Activity] from the [store::Store].
pub trait Reporter: Send + 'static {
    fn report(&mut self, activity: Activity);
}

impl Reporter for mpsc::UnboundedSender<Activity> {
    fn report(&mut self, activity: Activity) {
        // The receiver may have been dropped
        let _ = self.unbounded_send(activity);
    }
}

impl Reporter for () {
    fn report(&mut self, _: Activity) {}
}
