//! Blocks, transactions, and cross-shard envelopes.

use crate::{Digest, Height, PublicKey, Signature};
use bytes::{Buf, BufMut, Bytes};
use commonware_codec::{Encode, EncodeSize, Error, FixedSize, Read, ReadExt, Write};
use commonware_cryptography::{sha256, Digestible, Hasher, Sha256, Verifier};
use commonware_utils::union;
use std::fmt;

/// Version written into every produced [Header].
pub const BLOCK_VERSION: u8 = 0;

/// Suffix appended to the namespace when signing blocks.
pub const BLOCK_SUFFIX: &[u8] = b"_BLOCK";

/// Suffix appended to the namespace when signing cross-shard message groups.
pub const MESSAGE_SUFFIX: &[u8] = b"_SHARD_MESSAGE";

/// Namespace under which block digests are signed.
pub fn block_namespace(namespace: &[u8]) -> Vec<u8> {
    union(namespace, BLOCK_SUFFIX)
}

/// Namespace under which cross-shard message group digests are signed.
pub fn message_namespace(namespace: &[u8]) -> Vec<u8> {
    union(namespace, MESSAGE_SUFFIX)
}

/// Identifier of a shard.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ShardId(u64);

impl ShardId {
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    pub const fn get(self) -> u64 {
        self.0
    }
}

impl From<u64> for ShardId {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

impl fmt::Display for ShardId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Write for ShardId {
    fn write(&self, buf: &mut impl BufMut) {
        self.0.write(buf);
    }
}

impl EncodeSize for ShardId {
    fn encode_size(&self) -> usize {
        self.0.encode_size()
    }
}

impl Read for ShardId {
    type Cfg = ();

    fn read_cfg(buf: &mut impl Buf, _: &()) -> Result<Self, Error> {
        Ok(Self(u64::read(buf)?))
    }
}

/// An intra-shard transaction.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Transaction {
    pub nonce: u64,
    pub payload: Bytes,
}

impl Transaction {
    pub fn new(nonce: u64, payload: impl Into<Bytes>) -> Self {
        Self {
            nonce,
            payload: payload.into(),
        }
    }

    /// Identifier used for duplicate detection and the transactions root.
    pub fn id(&self) -> Digest {
        sha256::hash(&self.encode())
    }
}

impl Write for Transaction {
    fn write(&self, buf: &mut impl BufMut) {
        self.nonce.write(buf);
        self.payload.write(buf);
    }
}

impl EncodeSize for Transaction {
    fn encode_size(&self) -> usize {
        self.nonce.encode_size() + self.payload.encode_size()
    }
}

impl Read for Transaction {
    /// Maximum payload length.
    type Cfg = usize;

    fn read_cfg(buf: &mut impl Buf, max_payload: &usize) -> Result<Self, Error> {
        let nonce = u64::read(buf)?;
        let payload = Bytes::read_cfg(buf, &(0..=*max_payload).into())?;
        Ok(Self { nonce, payload })
    }
}

/// An inbound cross-shard transaction included in a block of its target shard.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ShardTx {
    pub source: ShardId,
    pub height: Height,
    pub payload: Bytes,
}

impl Write for ShardTx {
    fn write(&self, buf: &mut impl BufMut) {
        self.source.write(buf);
        self.height.write(buf);
        self.payload.write(buf);
    }
}

impl EncodeSize for ShardTx {
    fn encode_size(&self) -> usize {
        self.source.encode_size() + self.height.encode_size() + self.payload.encode_size()
    }
}

impl Read for ShardTx {
    /// Maximum payload length.
    type Cfg = usize;

    fn read_cfg(buf: &mut impl Buf, max_payload: &usize) -> Result<Self, Error> {
        let source = ShardId::read(buf)?;
        let height = Height::read(buf)?;
        let payload = Bytes::read_cfg(buf, &(0..=*max_payload).into())?;
        Ok(Self {
            source,
            height,
            payload,
        })
    }
}

/// An outbound notification produced by executing a block.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ShardMessage {
    pub target: ShardId,
    pub payload: Bytes,
}

impl ShardMessage {
    pub fn new(target: ShardId, payload: impl Into<Bytes>) -> Self {
        Self {
            target,
            payload: payload.into(),
        }
    }

    /// Digest committing to an ordered group of messages for the same target.
    pub fn group_digest(messages: &[ShardMessage]) -> Digest {
        let mut hasher = Sha256::new();
        for message in messages {
            hasher.update(&message.encode());
        }
        hasher.finalize()
    }
}

impl Write for ShardMessage {
    fn write(&self, buf: &mut impl BufMut) {
        self.target.write(buf);
        self.payload.write(buf);
    }
}

impl EncodeSize for ShardMessage {
    fn encode_size(&self) -> usize {
        self.target.encode_size() + self.payload.encode_size()
    }
}

impl Read for ShardMessage {
    /// Maximum payload length.
    type Cfg = usize;

    fn read_cfg(buf: &mut impl Buf, max_payload: &usize) -> Result<Self, Error> {
        let target = ShardId::read(buf)?;
        let payload = Bytes::read_cfg(buf, &(0..=*max_payload).into())?;
        Ok(Self { target, payload })
    }
}

/// Block header. The block digest covers only the header.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Header {
    pub version: u8,
    pub shard: ShardId,
    /// Height of the parent shard this block builds on.
    pub parent_height: Height,
    pub height: Height,
    pub prev_hash: Digest,
    pub transactions_root: Digest,
    /// Root over the previous block root and this block's transactions root.
    pub block_root: Digest,
    /// Milliseconds since the unix epoch. Never decreases along the chain.
    pub timestamp: u64,
    pub consensus_data: u64,
    /// Digest of the producer's public key.
    pub next_bookkeeper: Digest,
}

impl Write for Header {
    fn write(&self, buf: &mut impl BufMut) {
        self.version.write(buf);
        self.shard.write(buf);
        self.parent_height.write(buf);
        self.height.write(buf);
        self.prev_hash.write(buf);
        self.transactions_root.write(buf);
        self.block_root.write(buf);
        self.timestamp.write(buf);
        self.consensus_data.write(buf);
        self.next_bookkeeper.write(buf);
    }
}

impl EncodeSize for Header {
    fn encode_size(&self) -> usize {
        self.version.encode_size()
            + self.shard.encode_size()
            + self.parent_height.encode_size()
            + self.height.encode_size()
            + self.prev_hash.encode_size()
            + self.transactions_root.encode_size()
            + self.block_root.encode_size()
            + self.timestamp.encode_size()
            + self.consensus_data.encode_size()
            + self.next_bookkeeper.encode_size()
    }
}

impl Read for Header {
    type Cfg = ();

    fn read_cfg(buf: &mut impl Buf, _: &()) -> Result<Self, Error> {
        let version = u8::read(buf)?;
        if version != BLOCK_VERSION {
            return Err(Error::Invalid("Header", "unsupported version"));
        }
        Ok(Self {
            version,
            shard: ShardId::read(buf)?,
            parent_height: Height::read(buf)?,
            height: Height::read(buf)?,
            prev_hash: Digest::read(buf)?,
            transactions_root: Digest::read(buf)?,
            block_root: Digest::read(buf)?,
            timestamp: u64::read(buf)?,
            consensus_data: u64::read(buf)?,
            next_bookkeeper: Digest::read(buf)?,
        })
    }
}

/// Bounds applied when decoding a [Block].
#[derive(Clone, Copy, Debug)]
pub struct BlockCfg {
    pub max_transactions: usize,
    pub max_shard_txs: usize,
    pub max_signers: usize,
    pub max_payload: usize,
}

impl BlockCfg {
    /// Largest encoding of a [Block] within these bounds.
    pub fn max_size(&self) -> usize {
        // Upper bound of a varint length prefix
        const PREFIX: usize = 10;
        let header = Block::genesis(ShardId::default()).header.encode_size();
        let payload = PREFIX.saturating_add(self.max_payload);
        let signers = self
            .max_signers
            .saturating_mul(PublicKey::SIZE + Signature::SIZE);
        let shard_txs = self.max_shard_txs.saturating_mul(16usize.saturating_add(payload));
        let transactions = self.max_transactions.saturating_mul(8usize.saturating_add(payload));
        header
            .saturating_add(4 * PREFIX)
            .saturating_add(signers)
            .saturating_add(shard_txs)
            .saturating_add(transactions)
    }
}

impl Default for BlockCfg {
    fn default() -> Self {
        Self {
            max_transactions: 10_000,
            max_shard_txs: 1_024,
            max_signers: 16,
            max_payload: 64 * 1024,
        }
    }
}

/// A signed shard block.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Block {
    pub header: Header,
    pub bookkeepers: Vec<PublicKey>,
    pub signatures: Vec<Signature>,
    pub shard_txs: Vec<ShardTx>,
    pub transactions: Vec<Transaction>,
}

impl Block {
    /// The block every shard chain starts from.
    pub fn genesis(shard: ShardId) -> Self {
        let zero = Digest::from([0u8; 32]);
        Self {
            header: Header {
                version: BLOCK_VERSION,
                shard,
                parent_height: 0,
                height: 0,
                prev_hash: zero,
                transactions_root: zero,
                block_root: zero,
                timestamp: 0,
                consensus_data: 0,
                next_bookkeeper: zero,
            },
            bookkeepers: Vec::new(),
            signatures: Vec::new(),
            shard_txs: Vec::new(),
            transactions: Vec::new(),
        }
    }

    pub fn height(&self) -> Height {
        self.header.height
    }

    /// Copy of the block with signer data removed.
    pub fn unsigned(&self) -> Self {
        Self {
            bookkeepers: Vec::new(),
            signatures: Vec::new(),
            ..self.clone()
        }
    }

    /// Check that every bookkeeper signed the block digest.
    pub fn verify(&self, namespace: &[u8]) -> bool {
        if self.bookkeepers.is_empty() || self.bookkeepers.len() != self.signatures.len() {
            return false;
        }
        let namespace = block_namespace(namespace);
        let digest = self.digest();
        self.bookkeepers
            .iter()
            .zip(self.signatures.iter())
            .all(|(signer, signature)| {
                signer.verify(Some(namespace.as_slice()), &digest, signature)
            })
    }
}

impl Digestible for Block {
    type Digest = Digest;

    fn digest(&self) -> Digest {
        sha256::hash(&self.header.encode())
    }
}

impl Write for Block {
    fn write(&self, buf: &mut impl BufMut) {
        self.header.write(buf);
        self.bookkeepers.write(buf);
        self.signatures.write(buf);
        self.shard_txs.write(buf);
        self.transactions.write(buf);
    }
}

impl EncodeSize for Block {
    fn encode_size(&self) -> usize {
        self.header.encode_size()
            + self.bookkeepers.encode_size()
            + self.signatures.encode_size()
            + self.shard_txs.encode_size()
            + self.transactions.encode_size()
    }
}

impl Read for Block {
    type Cfg = BlockCfg;

    fn read_cfg(buf: &mut impl Buf, cfg: &BlockCfg) -> Result<Self, Error> {
        let header = Header::read(buf)?;
        let bookkeepers = Vec::<PublicKey>::read_cfg(buf, &((0..=cfg.max_signers).into(), ()))?;
        let signatures = Vec::<Signature>::read_cfg(buf, &((0..=cfg.max_signers).into(), ()))?;
        if bookkeepers.len() != signatures.len() {
            return Err(Error::Invalid("Block", "signer count mismatch"));
        }
        let shard_txs =
            Vec::<ShardTx>::read_cfg(buf, &((0..=cfg.max_shard_txs).into(), cfg.max_payload))?;
        let transactions = Vec::<Transaction>::read_cfg(
            buf,
            &((0..=cfg.max_transactions).into(), cfg.max_payload),
        )?;
        Ok(Self {
            header,
            bookkeepers,
            signatures,
            shard_txs,
            transactions,
        })
    }
}

/// A single key update in a write set. `None` deletes the key.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Change {
    pub key: Bytes,
    pub value: Option<Bytes>,
}

/// Outcome of executing a block against durable state.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExecutionResult {
    pub state_root: Digest,
    pub write_set: Vec<Change>,
    /// Outbound cross-shard messages, in emission order.
    pub messages: Vec<ShardMessage>,
}

/// Signed digest of the messages a height sends to one shard.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ShardMessageHash {
    pub shard: ShardId,
    pub hash: Digest,
    pub signer: PublicKey,
    pub signature: Signature,
}

impl ShardMessageHash {
    pub fn verify(&self, namespace: &[u8]) -> bool {
        self.signer.verify(
            Some(message_namespace(namespace).as_slice()),
            &self.hash,
            &self.signature,
        )
    }
}

impl Write for ShardMessageHash {
    fn write(&self, buf: &mut impl BufMut) {
        self.shard.write(buf);
        self.hash.write(buf);
        self.signer.write(buf);
        self.signature.write(buf);
    }
}

impl EncodeSize for ShardMessageHash {
    fn encode_size(&self) -> usize {
        self.shard.encode_size()
            + self.hash.encode_size()
            + self.signer.encode_size()
            + self.signature.encode_size()
    }
}

impl Read for ShardMessageHash {
    type Cfg = ();

    fn read_cfg(buf: &mut impl Buf, _: &()) -> Result<Self, Error> {
        Ok(Self {
            shard: ShardId::read(buf)?,
            hash: Digest::read(buf)?,
            signer: PublicKey::read(buf)?,
            signature: Signature::read(buf)?,
        })
    }
}

/// Bounds applied when decoding an [Envelope].
#[derive(Clone, Copy, Debug)]
pub struct EnvelopeCfg {
    pub max_shards: usize,
    pub max_messages: usize,
    pub max_payload: usize,
}

impl Default for EnvelopeCfg {
    fn default() -> Self {
        Self {
            max_shards: 1_024,
            max_messages: 10_000,
            max_payload: 64 * 1024,
        }
    }
}

/// Messages sent from one shard to another for a single height.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Envelope {
    pub source: ShardId,
    pub target: ShardId,
    pub height: Height,
    /// Merkle root over every entry of `hashes`.
    pub root: Digest,
    /// Hash of the previous group sent from `source` to `target`.
    pub previous: Option<Digest>,
    /// Signed group hashes for every target of this height.
    pub hashes: Vec<ShardMessageHash>,
    pub messages: Vec<ShardMessage>,
}

impl Envelope {
    /// The signed hash covering [Envelope::messages].
    pub fn own_hash(&self) -> Option<&ShardMessageHash> {
        self.hashes.iter().find(|hash| hash.shard == self.target)
    }
}

impl Write for Envelope {
    fn write(&self, buf: &mut impl BufMut) {
        self.source.write(buf);
        self.target.write(buf);
        self.height.write(buf);
        self.root.write(buf);
        self.previous.write(buf);
        self.hashes.write(buf);
        self.messages.write(buf);
    }
}

impl EncodeSize for Envelope {
    fn encode_size(&self) -> usize {
        self.source.encode_size()
            + self.target.encode_size()
            + self.height.encode_size()
            + self.root.encode_size()
            + self.previous.encode_size()
            + self.hashes.encode_size()
            + self.messages.encode_size()
    }
}

impl Read for Envelope {
    type Cfg = EnvelopeCfg;

    fn read_cfg(buf: &mut impl Buf, cfg: &EnvelopeCfg) -> Result<Self, Error> {
        let source = ShardId::read(buf)?;
        let target = ShardId::read(buf)?;
        let height = Height::read(buf)?;
        let root = Digest::read(buf)?;
        let previous = Option::<Digest>::read(buf)?;
        let hashes =
            Vec::<ShardMessageHash>::read_cfg(buf, &((1..=cfg.max_shards).into(), ()))?;
        let messages = Vec::<ShardMessage>::read_cfg(
            buf,
            &((1..=cfg.max_messages).into(), cfg.max_payload),
        )?;
        Ok(Self {
            source,
            target,
            height,
            root,
            previous,
            hashes,
            messages,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Keystore;
    use commonware_codec::{Decode, DecodeExt};
    use commonware_cryptography::{ed25519::PrivateKey, PrivateKeyExt};

    const NAMESPACE: &[u8] = b"_SHARDCHAIN_TEST";

    fn signed_block(key: &PrivateKey) -> Block {
        let mut block = Block::genesis(ShardId::new(3));
        block.header.height = 7;
        block.header.timestamp = 1_000;
        block.transactions = vec![Transaction::new(1, &b"hello"[..])];
        block.shard_txs = vec![ShardTx {
            source: ShardId::new(1),
            height: 4,
            payload: Bytes::from_static(b"inbound"),
        }];
        let signature = key
            .sign(&block_namespace(NAMESPACE), &block.digest())
            .unwrap();
        block.bookkeepers.push(key.public_key());
        block.signatures.push(signature);
        block
    }

    #[test]
    fn test_block_codec() {
        let key = PrivateKey::from_seed(0);
        let block = signed_block(&key);
        let encoded = block.encode();
        assert_eq!(encoded.len(), block.encode_size());
        let decoded = Block::decode_cfg(encoded, &BlockCfg::default()).unwrap();
        assert_eq!(decoded, block);
        assert!(decoded.verify(NAMESPACE));
    }

    #[test]
    fn test_block_truncated() {
        let key = PrivateKey::from_seed(0);
        let encoded = signed_block(&key).encode();
        for len in [0, 1, 40, encoded.len() - 1] {
            let result = Block::decode_cfg(&encoded[..len], &BlockCfg::default());
            assert!(result.is_err(), "decoded truncated block of length {len}");
        }
    }

    #[test]
    fn test_block_exceeds_bounds() {
        let key = PrivateKey::from_seed(0);
        let encoded = signed_block(&key).encode();
        let cfg = BlockCfg {
            max_transactions: 0,
            ..BlockCfg::default()
        };
        assert!(Block::decode_cfg(encoded, &cfg).is_err());
    }

    #[test]
    fn test_header_rejects_unknown_version() {
        let mut header = Block::genesis(ShardId::new(1)).header;
        header.version = BLOCK_VERSION + 1;
        assert!(matches!(
            Header::decode(header.encode()),
            Err(Error::Invalid("Header", _))
        ));
    }

    #[test]
    fn test_unsigned_keeps_digest() {
        let key = PrivateKey::from_seed(1);
        let block = signed_block(&key);
        let unsigned = block.unsigned();
        assert!(unsigned.bookkeepers.is_empty());
        assert!(unsigned.signatures.is_empty());
        assert_eq!(unsigned.digest(), block.digest());
        assert!(!unsigned.verify(NAMESPACE));
    }

    #[test]
    fn test_verify_wrong_namespace() {
        let key = PrivateKey::from_seed(2);
        let block = signed_block(&key);
        assert!(block.verify(NAMESPACE));
        assert!(!block.verify(b"_OTHER"));
    }

    #[test]
    fn test_transaction_id() {
        let a = Transaction::new(1, &b"payload"[..]);
        let b = Transaction::new(2, &b"payload"[..]);
        assert_ne!(a.id(), b.id());
        assert_eq!(a.id(), Transaction::new(1, &b"payload"[..]).id());
    }

    #[test]
    fn test_group_digest_order() {
        let first = ShardMessage::new(ShardId::new(1), &b"a"[..]);
        let second = ShardMessage::new(ShardId::new(1), &b"b"[..]);
        let forward = ShardMessage::group_digest(&[first.clone(), second.clone()]);
        let reverse = ShardMessage::group_digest(&[second, first]);
        assert_ne!(forward, reverse);
    }

    #[test]
    fn test_envelope_truncated() {
        let key = PrivateKey::from_seed(3);
        let messages = vec![ShardMessage::new(ShardId::new(2), &b"notify"[..])];
        let hash = ShardMessage::group_digest(&messages);
        let envelope = Envelope {
            source: ShardId::new(1),
            target: ShardId::new(2),
            height: 5,
            root: hash,
            previous: None,
            hashes: vec![ShardMessageHash {
                shard: ShardId::new(2),
                hash,
                signer: key.public_key(),
                signature: key.sign(&message_namespace(NAMESPACE), &hash).unwrap(),
            }],
            messages,
        };
        let encoded = envelope.encode();
        let decoded = Envelope::decode_cfg(encoded.clone(), &EnvelopeCfg::default()).unwrap();
        assert_eq!(decoded, envelope);
        assert!(decoded.own_hash().unwrap().verify(NAMESPACE));
        assert!(Envelope::decode_cfg(&encoded[..encoded.len() - 1], &EnvelopeCfg::default())
            .is_err());
    }

    #[test]
    fn test_envelope_invalid_option_tag() {
        let mut buf = Vec::new();
        ShardId::new(1).write(&mut buf);
        ShardId::new(2).write(&mut buf);
        5u64.write(&mut buf);
        Digest::from([1u8; 32]).write(&mut buf);
        buf.push(7);
        assert!(Envelope::decode_cfg(&buf[..], &EnvelopeCfg::default()).is_err());
    }

    #[test]
    fn test_block_max_size() {
        let key = PrivateKey::from_seed(0);
        let mut block = signed_block(&key);
        let cfg = BlockCfg {
            max_transactions: 2,
            max_shard_txs: 1,
            max_signers: 1,
            max_payload: 8,
        };
        block.transactions.push(Transaction::new(2, &b"12345678"[..]));
        block.shard_txs[0].payload = Bytes::from_static(b"12345678");
        assert!(Block::decode_cfg(block.encode(), &cfg).is_ok());
        assert!(block.encode_size() <= cfg.max_size());
        assert!(BlockCfg::default().max_size() > cfg.max_size());
    }
}
