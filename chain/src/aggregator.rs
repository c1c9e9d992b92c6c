//! Sign, chain, and broadcast the cross-shard messages of executed blocks.
//!
//! Messages emitted at one height are grouped by destination shard. Each group is hashed and
//! signed, and a merkle root over every group hash commits to the height as a whole. Each
//! destination then receives its own [Envelope] that also links to the hash of the previous
//! group sent to it, forming an append-only chain per destination.

use crate::{
    merkle,
    types::{message_namespace, Envelope, ShardId, ShardMessage, ShardMessageHash},
    Broadcaster, Digest, Height, Keystore, Ledger, LedgerError, SignError,
};
use commonware_cryptography::Sha256;
use std::collections::{BTreeMap, BTreeSet};
use thiserror::Error;
use tracing::{debug, info};

/// Errors returned by [Aggregator::dispatch].
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("failed to sign messages for shard {shard}: {source}")]
    Signing { shard: ShardId, source: SignError },
    #[error("ledger failure for shard {shard}: {source}")]
    Ledger { shard: ShardId, source: LedgerError },
}

/// Configuration for the [Aggregator].
pub struct Config<L: Ledger, K: Keystore, B: Broadcaster> {
    pub ledger: L,
    pub keystore: K,
    pub broadcaster: B,

    /// Shard the messages originate from.
    pub shard: ShardId,

    /// Namespace for message group signatures.
    pub namespace: Vec<u8>,
}

pub struct Aggregator<L: Ledger, K: Keystore, B: Broadcaster> {
    ledger: L,
    keystore: K,
    broadcaster: B,

    shard: ShardId,
    namespace: Vec<u8>,

    /// Destinations already sent to for a height whose dispatch failed part way.
    partial: Option<(Height, BTreeSet<ShardId>)>,
}

impl<L: Ledger, K: Keystore, B: Broadcaster> Aggregator<L, K, B> {
    pub fn new(cfg: Config<L, K, B>) -> Self {
        Self {
            ledger: cfg.ledger,
            keystore: cfg.keystore,
            broadcaster: cfg.broadcaster,
            shard: cfg.shard,
            namespace: message_namespace(&cfg.namespace),
            partial: None,
        }
    }

    fn previous(&self, target: ShardId) -> Result<Option<Digest>, Error> {
        match self.ledger.shard_message_hash(target) {
            Ok(previous) => Ok(previous),
            Err(LedgerError::NotFound) => Ok(None),
            Err(source) => Err(Error::Ledger {
                shard: target,
                source,
            }),
        }
    }

    /// Broadcast the messages emitted at `height`, returning the number of envelopes sent.
    ///
    /// Every group is signed and every previous hash is resolved before anything is broadcast,
    /// so those failures send nothing. A destination is only sent to once its new hash is
    /// recorded. If recording fails, the destinations already sent to are skipped when the same
    /// height is dispatched again.
    pub fn dispatch(&mut self, height: Height, messages: &[ShardMessage]) -> Result<usize, Error> {
        if messages.is_empty() {
            return Ok(0);
        }
        let mut groups: BTreeMap<ShardId, Vec<ShardMessage>> = BTreeMap::new();
        for message in messages {
            groups
                .entry(message.target)
                .or_default()
                .push(message.clone());
        }

        let signer = self.keystore.public_key();
        let mut hashes = Vec::with_capacity(groups.len());
        for (&shard, group) in &groups {
            let hash = ShardMessage::group_digest(group);
            let signature = self
                .keystore
                .sign(&self.namespace, &hash)
                .map_err(|source| Error::Signing { shard, source })?;
            hashes.push(ShardMessageHash {
                shard,
                hash,
                signer: signer.clone(),
                signature,
            });
        }
        let leaves: Vec<_> = hashes.iter().map(|hash| hash.hash).collect();
        let root = merkle::root::<Sha256>(&leaves);

        let mut sent = match self.partial.take() {
            Some((partial, sent)) if partial == height => sent,
            _ => BTreeSet::new(),
        };
        let mut pending = Vec::with_capacity(groups.len());
        for (hash, (target, group)) in leaves.into_iter().zip(groups) {
            if sent.contains(&target) {
                debug!(%target, height, "skipping destination already sent to");
                continue;
            }
            let previous = match self.previous(target) {
                Ok(previous) => previous,
                Err(err) => {
                    self.partial = Some((height, sent));
                    return Err(err);
                }
            };
            pending.push((target, group, hash, previous));
        }

        let mut count = 0;
        for (target, group, hash, previous) in pending {
            if let Err(source) = self.ledger.record_shard_message_hash(target, hash) {
                self.partial = Some((height, sent));
                return Err(Error::Ledger {
                    shard: target,
                    source,
                });
            }
            self.broadcaster.broadcast(Envelope {
                source: self.shard,
                target,
                height,
                root,
                previous,
                hashes: hashes.clone(),
                messages: group,
            });
            sent.insert(target);
            count += 1;
            debug!(%target, height, ?hash, ?previous, "broadcast cross-shard messages");
        }
        info!(height, envelopes = count, "dispatched cross-shard messages");
        Ok(count)
    }
}
