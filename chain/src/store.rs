//! Buffer executed blocks and commit them to the [Ledger] one height behind execution.
//!
//! # Commit Discipline
//!
//! Blocks may arrive in any order. Whenever the block at `chained + 1` is present, the store:
//!
//! 1. Submits the block at `chained` (if it was executed but not yet persisted).
//! 2. Executes the block at `chained + 1` and records its result.
//! 3. Advances `chained` and repeats.
//!
//! The most recently executed block is therefore never durable until its successor arrives. A
//! rejected execution or submission halts the store: every later [Store::add_block] returns
//! [Error::Halted] until [Store::reload_from_ledger] is called.
//!
//! # Memory
//!
//! Pending entries live in a fixed table indexed by `height % capacity`. The store retains at
//! most `capacity` heights, starting at the chained height, and rejects blocks beyond that.

use crate::{
    types::{Block, ExecutionResult},
    Activity, Height, Ledger, LedgerError, Reporter,
};
use commonware_cryptography::Digestible;
use thiserror::Error;
use tracing::{debug, error, info, warn};

/// Number of heights retained unless configured otherwise.
pub const DEFAULT_CAPACITY: usize = 64;

/// Errors returned by the [Store].
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("height {height} beyond retention limit {limit}")]
    BeyondWindow { height: Height, limit: Height },
    #[error("halted after a ledger failure")]
    Halted,
    #[error("execution of height {0} failed: {1}")]
    Execution(Height, LedgerError),
    #[error("submission of height {0} failed: {1}")]
    Submission(Height, LedgerError),
    #[error("height {0} unavailable: {1}")]
    Unavailable(Height, LedgerError),
}

/// A block and, once executed, its result.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PendingEntry {
    pub block: Block,
    pub result: Option<ExecutionResult>,
}

impl PendingEntry {
    pub fn new(block: Block) -> Self {
        Self {
            block,
            result: None,
        }
    }

    pub fn height(&self) -> Height {
        self.block.height()
    }
}

/// Executes blocks in height order and persists each one after its successor executes.
pub struct Store<L: Ledger, R: Reporter> {
    ledger: L,
    reporter: R,

    entries: Vec<Option<PendingEntry>>,
    chained: Height,
    ready: bool,
    halted: bool,
}

impl<L: Ledger, R: Reporter> Store<L, R> {
    /// Create a store that continues from the ledger's current height.
    pub fn new(ledger: L, reporter: R, capacity: usize) -> Self {
        let chained = ledger.height();
        let capacity = capacity.max(2);
        Self {
            ledger,
            reporter,
            entries: (0..capacity).map(|_| None).collect(),
            chained,
            ready: false,
            halted: false,
        }
    }

    /// Highest executed height.
    pub fn chained(&self) -> Height {
        self.chained
    }

    pub fn is_halted(&self) -> bool {
        self.halted
    }

    /// Pending entry at `height`, if retained.
    pub fn pending(&self, height: Height) -> Option<&PendingEntry> {
        self.entries[self.slot(height)]
            .as_ref()
            .filter(|entry| entry.height() == height)
    }

    /// Insert a block and advance as far as contiguous heights allow.
    ///
    /// Blocks at or below the chained height are ignored.
    pub fn add_block(&mut self, entry: PendingEntry) -> Result<(), Error> {
        let height = entry.height();
        if height <= self.chained {
            warn!(height, chained = self.chained, "ignoring chained block");
            return Ok(());
        }
        if self.halted {
            return Err(Error::Halted);
        }
        let limit = self.chained + self.entries.len() as u64 - 1;
        if height > limit {
            return Err(Error::BeyondWindow { height, limit });
        }
        let slot = self.slot(height);
        self.entries[slot] = Some(entry);
        self.advance()
    }

    /// Return the pending entry at `height` or rebuild it from the ledger.
    ///
    /// Entries rebuilt from the ledger carry the committed state root and no write set.
    pub fn get_block(&self, height: Height) -> Result<PendingEntry, Error> {
        if let Some(entry) = self.pending(height) {
            return Ok(entry.clone());
        }
        let block = self
            .ledger
            .block(height)
            .map_err(|err| Error::Unavailable(height, err))?;
        let state_root = self
            .ledger
            .state_root(height)
            .map_err(|err| Error::Unavailable(height, err))?;
        Ok(PendingEntry {
            block,
            result: Some(ExecutionResult {
                state_root,
                write_set: Vec::new(),
                messages: Vec::new(),
            }),
        })
    }

    /// Resynchronize with the ledger after it was changed externally and resume after a halt.
    pub fn reload_from_ledger(&mut self) {
        let height = self.ledger.height();
        if height >= self.chained {
            self.ready = false;
        }
        if height > self.chained {
            info!(from = self.chained, to = height, "reloaded chained height from ledger");
            self.chained = height;
            self.evict_through(height);
        }
        self.halted = false;
    }

    fn slot(&self, height: Height) -> usize {
        (height % self.entries.len() as u64) as usize
    }

    fn evict_through(&mut self, height: Height) {
        for entry in self.entries.iter_mut() {
            if entry.as_ref().is_some_and(|entry| entry.height() <= height) {
                *entry = None;
            }
        }
    }

    fn advance(&mut self) -> Result<(), Error> {
        loop {
            let next = self.chained + 1;
            if self.pending(next).is_none() {
                return Ok(());
            }
            if self.ready {
                self.submit(self.chained)?;
            }

            let slot = self.slot(next);
            let Some(entry) = self.entries[slot].as_mut() else {
                return Ok(());
            };
            let result = match self.ledger.execute(&entry.block) {
                Ok(result) => result,
                Err(err) => {
                    error!(height = next, ?err, "failed to execute block");
                    self.halted = true;
                    return Err(Error::Execution(next, err));
                }
            };
            entry.result = Some(result.clone());
            let block = entry.block.clone();
            self.ready = true;
            self.chained = next;
            info!(
                height = next,
                digest = ?block.digest(),
                txs = block.transactions.len(),
                "executed block"
            );
            self.reporter.report(Activity::Executed { block, result });
        }
    }

    fn submit(&mut self, height: Height) -> Result<(), Error> {
        let slot = self.slot(height);
        let Some((block, Some(result))) = self.entries[slot]
            .as_ref()
            .filter(|entry| entry.height() == height)
            .map(|entry| (&entry.block, entry.result.as_ref()))
        else {
            error!(height, "executed block missing from pending entries");
            self.halted = true;
            return Err(Error::Submission(height, LedgerError::NotFound));
        };
        match self.ledger.submit(block, result) {
            Ok(()) => {}
            Err(LedgerError::AlreadyPersisted(_)) => {
                warn!(height, "block already persisted");
            }
            Err(err) => {
                error!(height, ?err, "failed to submit block");
                self.halted = true;
                return Err(Error::Submission(height, err));
            }
        }
        let block = block.clone();
        self.ready = false;
        self.evict_through(height);
        debug!(height, "persisted block");
        self.reporter.report(Activity::Persisted(block));
        Ok(())
    }
}
