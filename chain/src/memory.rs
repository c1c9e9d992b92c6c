//! In-memory implementations of the collaborator traits.
//!
//! Every type here is a cheaply cloneable handle over shared state, so a test (or the solo
//! binary) can keep a copy to inspect or drive what the engine sees.

use crate::{
    types::{Block, Change, Envelope, ExecutionResult, ShardId, ShardMessage, ShardTx, Transaction},
    Activity, Broadcaster, Digest, Height, LedgerError, PoolError, Reporter,
};
use bytes::Bytes;
use commonware_cryptography::{Hasher, Sha256};
use std::{
    collections::{BTreeMap, BTreeSet, HashSet},
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

struct State {
    shard: ShardId,
    blocks: BTreeMap<Height, (Block, Digest)>,
    values: BTreeMap<Bytes, Bytes>,

    parent_height: Height,
    parent_blocks: BTreeSet<Height>,
    inbound: Vec<ShardTx>,
    outbound: BTreeMap<Height, Vec<ShardMessage>>,
    heads: BTreeMap<ShardId, Digest>,

    executed: Vec<Height>,
    submitted: Vec<Height>,
    failing_execution: BTreeSet<Height>,
    failing_submission: BTreeSet<Height>,
    failing_lookups: BTreeSet<ShardId>,
    failing_records: BTreeSet<ShardId>,
}

impl State {
    fn height(&self) -> Height {
        self.blocks.keys().next_back().copied().unwrap_or_default()
    }
}

/// A ledger that keeps every persisted block and key in memory.
///
/// Executing a block hashes its transactions into the previous state root and writes each
/// payload under its transaction id. Outbound messages are whatever was registered with
/// [Ledger::schedule_messages] for the executed height.
#[derive(Clone)]
pub struct Ledger {
    state: Arc<Mutex<State>>,
}

impl Ledger {
    /// Create a ledger holding only the genesis block of `shard`.
    pub fn new(shard: ShardId) -> Self {
        let genesis = Block::genesis(shard);
        let root = genesis.header.block_root;
        let mut blocks = BTreeMap::new();
        blocks.insert(0, (genesis, root));
        Self {
            state: Arc::new(Mutex::new(State {
                shard,
                blocks,
                values: BTreeMap::new(),
                parent_height: 0,
                parent_blocks: BTreeSet::new(),
                inbound: Vec::new(),
                outbound: BTreeMap::new(),
                heads: BTreeMap::new(),
                executed: Vec::new(),
                submitted: Vec::new(),
                failing_execution: BTreeSet::new(),
                failing_submission: BTreeSet::new(),
                failing_lookups: BTreeSet::new(),
                failing_records: BTreeSet::new(),
            })),
        }
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn set_parent_height(&self, height: Height) {
        self.state().parent_height = height;
    }

    pub fn cache_parent_block(&self, height: Height) {
        self.state().parent_blocks.insert(height);
    }

    /// Queue an inbound cross-shard transaction for inclusion.
    pub fn push_shard_tx(&self, tx: ShardTx) {
        self.state().inbound.push(tx);
    }

    /// Messages emitted when the block at `height` executes.
    pub fn schedule_messages(&self, height: Height, messages: Vec<ShardMessage>) {
        self.state().outbound.insert(height, messages);
    }

    pub fn fail_execution(&self, height: Height) {
        self.state().failing_execution.insert(height);
    }

    pub fn fail_submission(&self, height: Height) {
        self.state().failing_submission.insert(height);
    }

    /// Fail lookups of the last message hash sent to `target`.
    pub fn fail_lookup(&self, target: ShardId) {
        self.state().failing_lookups.insert(target);
    }

    /// Fail recording the last message hash sent to `target`.
    pub fn fail_record(&self, target: ShardId) {
        self.state().failing_records.insert(target);
    }

    pub fn clear_faults(&self) {
        let mut state = self.state();
        state.failing_execution.clear();
        state.failing_submission.clear();
        state.failing_lookups.clear();
        state.failing_records.clear();
    }

    /// Heights successfully executed, in call order.
    pub fn executed(&self) -> Vec<Height> {
        self.state().executed.clone()
    }

    /// Heights persisted, in call order.
    pub fn submitted(&self) -> Vec<Height> {
        self.state().submitted.clone()
    }

    /// Inbound cross-shard transactions not yet consumed by a persisted block.
    pub fn inbound(&self) -> Vec<ShardTx> {
        self.state().inbound.clone()
    }

    pub fn value(&self, key: &[u8]) -> Option<Bytes> {
        self.state().values.get(key).cloned()
    }
}

impl crate::Ledger for Ledger {
    fn height(&self) -> Height {
        self.state().height()
    }

    fn block(&self, height: Height) -> Result<Block, LedgerError> {
        self.state()
            .blocks
            .get(&height)
            .map(|(block, _)| block.clone())
            .ok_or(LedgerError::NotFound)
    }

    fn state_root(&self, height: Height) -> Result<Digest, LedgerError> {
        self.state()
            .blocks
            .get(&height)
            .map(|(_, root)| *root)
            .ok_or(LedgerError::NotFound)
    }

    fn execute(&mut self, block: &Block) -> Result<ExecutionResult, LedgerError> {
        let mut state = self.state();
        let height = block.height();
        if state.failing_execution.contains(&height) {
            return Err(LedgerError::Execution(format!("rejected height {height}")));
        }
        let current = state.height();
        if height != current + 1 {
            return Err(LedgerError::OutOfOrder(height));
        }
        let (_, parent_root) = state.blocks.get(&current).ok_or(LedgerError::NotFound)?;

        let mut hasher = Sha256::new();
        hasher.update(parent_root.as_ref());
        let write_set: Vec<Change> = block
            .transactions
            .iter()
            .map(|tx| Change {
                key: Bytes::copy_from_slice(tx.id().as_ref()),
                value: Some(tx.payload.clone()),
            })
            .collect();
        for change in &write_set {
            hasher.update(&change.key);
            if let Some(value) = &change.value {
                hasher.update(value);
            }
        }
        let messages = state.outbound.get(&height).cloned().unwrap_or_default();
        state.executed.push(height);
        Ok(ExecutionResult {
            state_root: hasher.finalize(),
            write_set,
            messages,
        })
    }

    fn submit(&mut self, block: &Block, result: &ExecutionResult) -> Result<(), LedgerError> {
        let mut state = self.state();
        let height = block.height();
        let current = state.height();
        if height <= current {
            return Err(LedgerError::AlreadyPersisted(height));
        }
        if state.failing_submission.contains(&height) {
            return Err(LedgerError::Storage(format!("rejected height {height}")));
        }
        if height != current + 1 {
            return Err(LedgerError::OutOfOrder(height));
        }
        for change in &result.write_set {
            match &change.value {
                Some(value) => state.values.insert(change.key.clone(), value.clone()),
                None => state.values.remove(&change.key),
            };
        }
        state.inbound.retain(|tx| !block.shard_txs.contains(tx));
        state.blocks.insert(height, (block.clone(), result.state_root));
        state.submitted.push(height);
        Ok(())
    }

    fn parent_height(&self) -> Height {
        self.state().parent_height
    }

    fn has_parent_block(&self, height: Height) -> bool {
        self.state().parent_blocks.contains(&height)
    }

    fn shard_txs(&self, shard: ShardId) -> Result<Vec<ShardTx>, LedgerError> {
        let state = self.state();
        if state.shard != shard {
            return Ok(Vec::new());
        }
        Ok(state.inbound.clone())
    }

    fn shard_message_hash(&self, target: ShardId) -> Result<Option<Digest>, LedgerError> {
        let state = self.state();
        if state.failing_lookups.contains(&target) {
            return Err(LedgerError::Storage(format!("rejected lookup for shard {target}")));
        }
        Ok(state.heads.get(&target).copied())
    }

    fn record_shard_message_hash(
        &mut self,
        target: ShardId,
        hash: Digest,
    ) -> Result<(), LedgerError> {
        let mut state = self.state();
        if state.failing_records.contains(&target) {
            return Err(LedgerError::Storage(format!("rejected record for shard {target}")));
        }
        state.heads.insert(target, hash);
        Ok(())
    }
}

/// A transaction pool that forgets transactions once a block including them is persisted.
#[derive(Clone, Default)]
pub struct Pool {
    transactions: Arc<Mutex<Vec<Transaction>>>,
}

impl Pool {
    pub fn new() -> Self {
        Self::default()
    }

    fn transactions(&self) -> MutexGuard<'_, Vec<Transaction>> {
        self.transactions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub fn submit(&self, tx: Transaction) {
        self.transactions().push(tx);
    }

    pub fn len(&self) -> usize {
        self.transactions().len()
    }

    pub fn is_empty(&self) -> bool {
        self.transactions().is_empty()
    }
}

impl crate::Pool for Pool {
    fn snapshot(&mut self, _: bool, _: Height) -> Result<Vec<Transaction>, PoolError> {
        Ok(self.transactions().clone())
    }
}

impl Reporter for Pool {
    fn report(&mut self, activity: Activity) {
        let Activity::Persisted(block) = activity else {
            return;
        };
        let included: HashSet<Digest> = block.transactions.iter().map(Transaction::id).collect();
        self.transactions()
            .retain(|tx| !included.contains(&tx.id()));
    }
}

/// Records every broadcast envelope.
#[derive(Clone, Default)]
pub struct Relay {
    envelopes: Arc<Mutex<Vec<Envelope>>>,
}

impl Relay {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn envelopes(&self) -> Vec<Envelope> {
        self.envelopes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl Broadcaster for Relay {
    fn broadcast(&mut self, envelope: Envelope) {
        self.envelopes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(envelope);
    }
}
