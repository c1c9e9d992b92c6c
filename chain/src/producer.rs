//! Assemble and sign candidate blocks.

use crate::{
    merkle,
    store::{self, Store},
    types::{block_namespace, Block, Header, ShardId, BLOCK_VERSION},
    window::Window,
    Digest, Height, Keystore, Ledger, Pool, PoolError, Reporter, SignError,
};
use commonware_codec::Encode;
use commonware_cryptography::{sha256, Digestible, Sha256};
use std::collections::HashSet;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Errors returned by [Producer::produce].
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("previous block unavailable: {0}")]
    Previous(#[from] store::Error),
    #[error("pool failure: {0}")]
    Pool(#[from] PoolError),
    #[error("parent height regressed from {last} to {current}")]
    ParentHeightRegressed { last: Height, current: Height },
    #[error("signing failed: {0}")]
    Signing(#[from] SignError),
}

/// Configuration for the [Producer].
pub struct Config<L: Ledger, P: Pool, K: Keystore> {
    pub ledger: L,
    pub pool: P,
    pub keystore: K,

    /// Shard the produced blocks belong to.
    pub shard: ShardId,

    /// Namespace for block signatures.
    pub namespace: Vec<u8>,
}

/// Builds the next block on top of the chained height of a [Store].
pub struct Producer<L: Ledger, P: Pool, K: Keystore> {
    ledger: L,
    pool: P,
    keystore: K,

    shard: ShardId,
    namespace: Vec<u8>,
    bookkeeper: Digest,
    parent_height: Height,
}

impl<L: Ledger, P: Pool, K: Keystore> Producer<L, P, K> {
    pub fn new(cfg: Config<L, P, K>) -> Self {
        let bookkeeper = sha256::hash(&cfg.keystore.public_key().encode());
        Self {
            ledger: cfg.ledger,
            pool: cfg.pool,
            keystore: cfg.keystore,
            shard: cfg.shard,
            namespace: block_namespace(&cfg.namespace),
            bookkeeper,
            parent_height: 0,
        }
    }

    /// Parent-shard height of the last accepted block.
    pub fn parent_height(&self) -> Height {
        self.parent_height
    }

    /// Record that `block` was executed by the store.
    ///
    /// Produced blocks never lower the parent height of an accepted block. Blocks that were
    /// produced but rejected do not count.
    pub fn accepted(&mut self, block: &Block) {
        if block.header.shard == self.shard {
            self.parent_height = self.parent_height.max(block.header.parent_height);
        }
    }

    /// Produce a signed block at `store.chained() + 1`.
    ///
    /// If `window` does not end right after the chained height it is cleared and duplicate
    /// detection only covers transactions seen from the chained height on.
    pub fn produce<R: Reporter>(
        &mut self,
        store: &Store<L, R>,
        window: &mut Window,
        now: u64,
        nonce: u64,
    ) -> Result<Block, Error> {
        let height = store.chained();
        let previous = store.get_block(height)?.block;

        // Pick the lowest height we can check duplicates against
        let (start, end) = window.range();
        let bound = if end == height + 1 {
            start
        } else {
            if !window.is_empty() {
                info!(height, start, end, "duplicate window out of sync with chain");
            }
            window.clean();
            height
        };
        debug!(height, start, end, bound, "selecting transactions");

        let mut seen = HashSet::new();
        let mut ids = Vec::new();
        let mut transactions = Vec::new();
        for tx in self.pool.snapshot(true, bound)? {
            let id = tx.id();
            if !seen.insert(id) {
                continue;
            }
            if let Err(err) = window.verify(&id, bound) {
                debug!(?id, ?err, "skipping transaction");
                continue;
            }
            ids.push(id);
            transactions.push(tx);
        }
        let transactions_root = merkle::root::<Sha256>(&ids);
        let block_root =
            merkle::root::<Sha256>(&[previous.header.block_root, transactions_root]);

        let mut parent_height = self.ledger.parent_height();
        if self.ledger.has_parent_block(parent_height + 1) {
            parent_height += 1;
        }
        if parent_height < self.parent_height {
            return Err(Error::ParentHeightRegressed {
                last: self.parent_height,
                current: parent_height,
            });
        }

        let shard_txs = self.ledger.shard_txs(self.shard).unwrap_or_else(|err| {
            warn!(?err, shard = %self.shard, "failed to fetch cross-shard transactions");
            Vec::new()
        });

        let mut block = Block {
            header: Header {
                version: BLOCK_VERSION,
                shard: self.shard,
                parent_height,
                height: height + 1,
                prev_hash: previous.digest(),
                transactions_root,
                block_root,
                timestamp: now.max(previous.header.timestamp),
                consensus_data: nonce,
                next_bookkeeper: self.bookkeeper,
            },
            bookkeepers: Vec::new(),
            signatures: Vec::new(),
            shard_txs,
            transactions,
        };
        let digest = block.digest();
        let signature = self.keystore.sign(&self.namespace, &digest)?;
        block.bookkeepers.push(self.keystore.public_key());
        block.signatures.push(signature);

        info!(
            height = height + 1,
            ?digest,
            txs = block.transactions.len(),
            shard_txs = block.shard_txs.len(),
            parent_height,
            "produced block"
        );
        Ok(block)
    }
}
