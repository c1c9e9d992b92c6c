//! Reject transactions already committed within a bounded range of recent heights.

use crate::{types::Block, types::Transaction, Digest, Height};
use std::collections::{HashMap, VecDeque};
use thiserror::Error;
use tracing::debug;

/// Number of heights tracked unless configured otherwise.
pub const DEFAULT_CAPACITY: usize = 20;

/// Errors returned by [Window::verify].
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("transaction already committed at height {0}")]
    Duplicate(Height),
    #[error("lower bound {0} precedes window start {1}")]
    OutOfRange(Height, Height),
}

/// Transaction identifiers of the blocks in `[start, end)`.
///
/// `end` is always one past the last added block. Adding a block that does not extend `end`
/// discards everything tracked so far.
pub struct Window {
    capacity: usize,
    start: Height,
    end: Height,
    heights: VecDeque<Vec<Digest>>,
    seen: HashMap<Digest, Height>,
}

impl Default for Window {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl Window {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            start: 0,
            end: 0,
            heights: VecDeque::with_capacity(capacity),
            seen: HashMap::new(),
        }
    }

    /// Tracked heights as `(start, end)`. Both are zero when nothing is tracked.
    pub fn range(&self) -> (Height, Height) {
        (self.start, self.end)
    }

    pub fn is_empty(&self) -> bool {
        self.heights.is_empty()
    }

    /// Fold the transactions of a committed block into the window.
    pub fn add_block(&mut self, block: &Block) {
        let height = block.height();
        if !self.heights.is_empty() && height != self.end {
            debug!(height, end = self.end, "duplicate window out of sync, resetting");
            self.clean();
        }
        if self.heights.is_empty() {
            self.start = height;
        }
        while self.heights.len() >= self.capacity {
            if let Some(ids) = self.heights.pop_front() {
                for id in ids {
                    if self.seen.get(&id) == Some(&self.start) {
                        self.seen.remove(&id);
                    }
                }
            }
            self.start += 1;
        }

        let ids: Vec<Digest> = block.transactions.iter().map(Transaction::id).collect();
        for id in &ids {
            self.seen.insert(*id, height);
        }
        self.heights.push_back(ids);
        self.end = height + 1;
    }

    /// Fail if `id` was committed at or above `lower`.
    pub fn verify(&self, id: &Digest, lower: Height) -> Result<(), Error> {
        if self.heights.is_empty() {
            return Ok(());
        }
        if lower < self.start {
            return Err(Error::OutOfRange(lower, self.start));
        }
        match self.seen.get(id) {
            Some(&height) if height >= lower => Err(Error::Duplicate(height)),
            _ => Ok(()),
        }
    }

    /// Discard all tracked state.
    pub fn clean(&mut self) {
        self.heights.clear();
        self.seen.clear();
        self.start = 0;
        self.end = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ShardId;

    fn block(height: Height, transactions: Vec<Transaction>) -> Block {
        let mut block = Block::genesis(ShardId::new(1));
        block.header.height = height;
        block.transactions = transactions;
        block
    }

    fn tx(nonce: u64) -> Transaction {
        Transaction::new(nonce, &b"transfer"[..])
    }

    #[test]
    fn test_rejects_committed() {
        let mut window = Window::default();
        window.add_block(&block(1, vec![tx(1)]));
        window.add_block(&block(2, vec![tx(2)]));
        assert_eq!(window.range(), (1, 3));
        assert_eq!(window.verify(&tx(1).id(), 1), Err(Error::Duplicate(1)));
        assert_eq!(window.verify(&tx(2).id(), 1), Err(Error::Duplicate(2)));
        assert_eq!(window.verify(&tx(3).id(), 1), Ok(()));
    }

    #[test]
    fn test_accepts_below_lower_bound() {
        let mut window = Window::default();
        window.add_block(&block(1, vec![tx(1)]));
        window.add_block(&block(2, vec![tx(2)]));
        assert_eq!(window.verify(&tx(1).id(), 2), Ok(()));
        assert_eq!(window.verify(&tx(2).id(), 2), Err(Error::Duplicate(2)));
    }

    #[test]
    fn test_lower_bound_before_start() {
        let mut window = Window::default();
        window.add_block(&block(5, vec![tx(1)]));
        assert_eq!(window.verify(&tx(9).id(), 4), Err(Error::OutOfRange(4, 5)));
    }

    #[test]
    fn test_clean() {
        let mut window = Window::default();
        window.add_block(&block(1, vec![tx(1)]));
        assert!(window.verify(&tx(1).id(), 1).is_err());
        window.clean();
        assert!(window.is_empty());
        assert_eq!(window.range(), (0, 0));
        assert_eq!(window.verify(&tx(1).id(), 1), Ok(()));
    }

    #[test]
    fn test_evicts_oldest() {
        let mut window = Window::new(3);
        for height in 1..=4 {
            window.add_block(&block(height, vec![tx(height)]));
        }
        assert_eq!(window.range(), (2, 5));
        assert_eq!(window.verify(&tx(1).id(), 2), Ok(()));
        assert_eq!(window.verify(&tx(2).id(), 2), Err(Error::Duplicate(2)));
        assert_eq!(window.verify(&tx(4).id(), 2), Err(Error::Duplicate(4)));
    }

    #[test]
    fn test_eviction_keeps_recommitted() {
        let mut window = Window::new(2);
        window.add_block(&block(1, vec![tx(1)]));
        window.add_block(&block(2, vec![tx(1)]));
        window.add_block(&block(3, vec![]));
        assert_eq!(window.range(), (2, 4));
        assert_eq!(window.verify(&tx(1).id(), 2), Err(Error::Duplicate(2)));
    }

    #[test]
    fn test_gap_resets() {
        let mut window = Window::default();
        window.add_block(&block(1, vec![tx(1)]));
        window.add_block(&block(3, vec![tx(3)]));
        assert_eq!(window.range(), (3, 4));
        assert_eq!(window.verify(&tx(1).id(), 3), Ok(()));
        assert_eq!(window.verify(&tx(3).id(), 3), Err(Error::Duplicate(3)));
    }
}
