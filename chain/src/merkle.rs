//! Merkle roots over ordered digests.
//!
//! Roots are those of a [commonware_storage::bmt] tree built over the leaves in order, so any
//! leaf can later be proven against a block's roots. The root of no leaves is [Hasher::empty].

use commonware_cryptography::Hasher;
use commonware_storage::bmt::Builder;

/// Compute the root over `leaves`.
pub fn root<H: Hasher>(leaves: &[H::Digest]) -> H::Digest {
    if leaves.is_empty() {
        return H::empty();
    }
    let mut builder = Builder::<H>::new(leaves.len());
    for leaf in leaves {
        builder.add(leaf);
    }
    builder.build().root()
}

/// Collects leaves and computes their root on demand.
#[derive(Clone)]
pub struct Accumulator<H: Hasher> {
    leaves: Vec<H::Digest>,
}

impl<H: Hasher> Default for Accumulator<H> {
    fn default() -> Self {
        Self { leaves: Vec::new() }
    }
}

impl<H: Hasher> Accumulator<H> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, leaf: H::Digest) {
        self.leaves.push(leaf);
    }

    pub fn len(&self) -> usize {
        self.leaves.len()
    }

    pub fn is_empty(&self) -> bool {
        self.leaves.is_empty()
    }

    /// Compute the root over all leaves added so far.
    pub fn root(&self) -> H::Digest {
        root::<H>(&self.leaves)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use commonware_cryptography::{sha256::Digest, Sha256};

    fn leaf(i: u8) -> Digest {
        commonware_cryptography::sha256::hash(&[i])
    }

    fn tree_root(leaves: &[Digest]) -> Digest {
        let mut builder = Builder::<Sha256>::new(leaves.len());
        for leaf in leaves {
            builder.add(leaf);
        }
        builder.build().root()
    }

    #[test]
    fn test_empty() {
        assert_eq!(root::<Sha256>(&[]), Sha256::empty());
        assert_eq!(Accumulator::<Sha256>::new().root(), Sha256::empty());
    }

    #[test]
    fn test_matches_tree() {
        for n in 1..=9 {
            let leaves: Vec<_> = (0..n).map(leaf).collect();
            assert_eq!(root::<Sha256>(&leaves), tree_root(&leaves));
        }
    }

    #[test]
    fn test_order_matters() {
        let (a, b) = (leaf(1), leaf(2));
        assert_ne!(root::<Sha256>(&[a, b]), root::<Sha256>(&[b, a]));
    }

    #[test]
    fn test_every_leaf_committed() {
        let leaves: Vec<_> = (0..5).map(leaf).collect();
        let expected = root::<Sha256>(&leaves);
        for i in 0..leaves.len() {
            let mut changed = leaves.clone();
            changed[i] = leaf(100);
            assert_ne!(root::<Sha256>(&changed), expected);
        }
        assert_ne!(root::<Sha256>(&leaves[..4]), expected);
    }

    #[test]
    fn test_accumulator_matches_root() {
        let leaves: Vec<_> = (0..7).map(leaf).collect();
        let mut accumulator = Accumulator::<Sha256>::new();
        for (i, leaf) in leaves.iter().enumerate() {
            accumulator.add(*leaf);
            assert_eq!(accumulator.len(), i + 1);
            assert_eq!(accumulator.root(), root::<Sha256>(&leaves[..=i]));
        }
    }
}
