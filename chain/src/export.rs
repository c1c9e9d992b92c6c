//! Export persisted blocks to a portable stream and read them back.
//!
//! # Format
//!
//! The stream starts with [Metadata] (magic, format version, compression flag, and the inclusive
//! height range) followed by one record per height. Each record is the big-endian `u32` length of
//! the block encoding and the encoding itself, compressed with `zstd` if the metadata says so.
//!
//! Signer data can be stripped on export. The block digest only covers the header, so stripped
//! blocks keep their identity.

use crate::{
    types::{Block, BlockCfg},
    Height, Ledger, LedgerError,
};
use bytes::{Buf, BufMut};
use commonware_codec::{
    Decode, DecodeExt, Encode, EncodeSize, Error as CodecError, Read, ReadExt, Write,
};
use std::io::{self, Read as _, Write as _};
use thiserror::Error;
use tracing::{debug, info, warn};
use zstd::bulk::{compress, decompress};

/// Leading bytes of every export.
pub const MAGIC: [u8; 4] = *b"SHDX";

/// Format version written by [export].
pub const VERSION: u8 = 1;

/// Encoded length of [Metadata].
pub const METADATA_SIZE: usize = 4 + 1 + 1 + 8 + 8;

/// Errors returned while exporting or reading an export.
#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid range: start {start} > end {end}")]
    InvalidRange { start: Height, end: Height },
    #[error("nothing to export: start {start} beyond ledger height {height}")]
    NothingToExport { start: Height, height: Height },
    #[error("failed to load height {0}: {1}")]
    Ledger(Height, LedgerError),
    #[error("block too large: {0}")]
    BlockTooLarge(usize),
    #[error("compression failed")]
    CompressionFailed,
    #[error("decompression failed")]
    DecompressionFailed,
    #[error("expected height {expected}, found {found}")]
    UnexpectedHeight { expected: Height, found: Height },
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

/// Configuration for [export].
#[derive(Clone, Debug, Default)]
pub struct Config {
    /// First height to export.
    pub start: Height,

    /// Last height to export, defaulting to (and capped at) the ledger height.
    pub end: Option<Height>,

    /// Optional compression level (using `zstd`) applied to each block.
    pub compression: Option<u8>,

    /// Drop bookkeepers and signatures from exported blocks.
    pub strip_signatures: bool,
}

/// Header of an export.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Metadata {
    pub start: Height,
    pub end: Height,
    pub compressed: bool,
}

impl Write for Metadata {
    fn write(&self, buf: &mut impl BufMut) {
        MAGIC.write(buf);
        VERSION.write(buf);
        self.compressed.write(buf);
        self.start.write(buf);
        self.end.write(buf);
    }
}

impl EncodeSize for Metadata {
    fn encode_size(&self) -> usize {
        METADATA_SIZE
    }
}

impl Read for Metadata {
    type Cfg = ();

    fn read_cfg(buf: &mut impl Buf, _: &()) -> Result<Self, CodecError> {
        if <[u8; 4]>::read(buf)? != MAGIC {
            return Err(CodecError::Invalid("Metadata", "magic"));
        }
        if u8::read(buf)? != VERSION {
            return Err(CodecError::Invalid("Metadata", "version"));
        }
        let compressed = bool::read(buf)?;
        let start = Height::read(buf)?;
        let end = Height::read(buf)?;
        if start > end {
            return Err(CodecError::Invalid("Metadata", "range"));
        }
        Ok(Self {
            start,
            end,
            compressed,
        })
    }
}

/// Write the blocks selected by `cfg` to `writer`.
pub fn export<L: Ledger, W: io::Write>(
    ledger: &L,
    writer: &mut W,
    cfg: &Config,
) -> Result<Metadata, Error> {
    let height = ledger.height();
    let start = cfg.start;
    let requested = cfg.end.unwrap_or(height);
    if start > requested {
        return Err(Error::InvalidRange {
            start,
            end: requested,
        });
    }
    if start > height {
        return Err(Error::NothingToExport { start, height });
    }
    if requested > height {
        warn!(requested, height, "export end beyond ledger height, truncating");
    }
    let metadata = Metadata {
        start,
        end: requested.min(height),
        compressed: cfg.compression.is_some(),
    };
    writer.write_all(&metadata.encode())?;

    for height in metadata.start..=metadata.end {
        let mut block = ledger
            .block(height)
            .map_err(|err| Error::Ledger(height, err))?;
        if cfg.strip_signatures {
            block = block.unsigned();
        }
        let encoded = block.encode();
        let data = match cfg.compression {
            Some(level) => {
                compress(&encoded, level as i32).map_err(|_| Error::CompressionFailed)?
            }
            None => encoded.to_vec(),
        };
        let len: u32 = data
            .len()
            .try_into()
            .map_err(|_| Error::BlockTooLarge(data.len()))?;
        writer.write_all(&len.to_be_bytes())?;
        writer.write_all(&data)?;
        debug!(height, len, "exported block");
    }
    info!(
        start = metadata.start,
        end = metadata.end,
        compressed = metadata.compressed,
        "export complete"
    );
    Ok(metadata)
}

/// Configuration for a [Reader].
#[derive(Clone, Copy, Debug)]
pub struct ReaderConfig {
    /// Bounds applied when decoding each block.
    pub block: BlockCfg,

    /// Largest record (compressed or not) accepted before it is read.
    pub max_record: usize,
}

impl From<BlockCfg> for ReaderConfig {
    fn from(block: BlockCfg) -> Self {
        Self {
            block,
            max_record: block.max_size(),
        }
    }
}

/// Iterates over the blocks of an export, in height order.
pub struct Reader<R: io::Read> {
    reader: R,
    cfg: ReaderConfig,
    metadata: Metadata,
    next: Option<Height>,
}

impl<R: io::Read> Reader<R> {
    pub fn new(mut reader: R, cfg: ReaderConfig) -> Result<Self, Error> {
        let mut header = [0u8; METADATA_SIZE];
        reader.read_exact(&mut header)?;
        let metadata = Metadata::decode(&header[..])?;
        Ok(Self {
            reader,
            cfg,
            metadata,
            next: Some(metadata.start),
        })
    }

    pub fn metadata(&self) -> Metadata {
        self.metadata
    }

    fn read_block(&mut self, height: Height) -> Result<Block, Error> {
        let mut len = [0u8; 4];
        self.reader.read_exact(&mut len)?;
        let len = u32::from_be_bytes(len) as usize;
        if len > self.cfg.max_record {
            return Err(Error::BlockTooLarge(len));
        }
        let mut data = vec![0u8; len];
        self.reader.read_exact(&mut data)?;
        if self.metadata.compressed {
            data = decompress(&data, self.cfg.max_record)
                .map_err(|_| Error::DecompressionFailed)?;
        }
        let block = Block::decode_cfg(&data[..], &self.cfg.block)?;
        if block.height() != height {
            return Err(Error::UnexpectedHeight {
                expected: height,
                found: block.height(),
            });
        }
        Ok(block)
    }
}

impl<R: io::Read> Iterator for Reader<R> {
    type Item = Result<Block, Error>;

    fn next(&mut self) -> Option<Self::Item> {
        let height = self.next?;
        let result = self.read_block(height);
        // Stop after the last height or the first failure
        self.next = match result {
            Ok(_) if height < self.metadata.end => Some(height + 1),
            _ => None,
        };
        Some(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{memory, types::ShardId, Keystore};
    use commonware_cryptography::{ed25519::PrivateKey, Digestible, PrivateKeyExt};

    const NAMESPACE: &[u8] = b"_SHARDCHAIN_TEST";

    /// A ledger holding signed blocks through `height`.
    fn ledger(height: Height) -> memory::Ledger {
        let key = PrivateKey::from_seed(0);
        let mut ledger = memory::Ledger::new(ShardId::new(1));
        for h in 1..=height {
            let mut block = Block::genesis(ShardId::new(1));
            block.header.height = h;
            let signature = key
                .sign(&crate::types::block_namespace(NAMESPACE), &block.digest())
                .unwrap();
            block.bookkeepers.push(key.public_key());
            block.signatures.push(signature);
            let result = ledger.execute(&block).unwrap();
            ledger.submit(&block, &result).unwrap();
        }
        ledger
    }

    fn read(data: &[u8]) -> (Metadata, Vec<Block>) {
        let reader = Reader::new(data, BlockCfg::default().into()).unwrap();
        let metadata = reader.metadata();
        let blocks = reader.collect::<Result<Vec<_>, _>>().unwrap();
        (metadata, blocks)
    }

    #[test]
    fn test_export_range() {
        let ledger = ledger(5);
        let mut out = Vec::new();
        let cfg = Config {
            start: 2,
            end: Some(4),
            ..Config::default()
        };
        let metadata = export(&ledger, &mut out, &cfg).unwrap();
        assert_eq!(
            metadata,
            Metadata {
                start: 2,
                end: 4,
                compressed: false
            }
        );

        let (read_metadata, blocks) = read(&out);
        assert_eq!(read_metadata, metadata);
        assert_eq!(blocks.len(), 3);
        for (block, height) in blocks.iter().zip(2..=4) {
            assert_eq!(block, &ledger.block(height).unwrap());
            assert!(block.verify(NAMESPACE));
        }
    }

    #[test]
    fn test_export_compressed_and_stripped() {
        let ledger = ledger(3);
        let mut out = Vec::new();
        let cfg = Config {
            start: 1,
            end: None,
            compression: Some(3),
            strip_signatures: true,
        };
        export(&ledger, &mut out, &cfg).unwrap();

        let (metadata, blocks) = read(&out);
        assert!(metadata.compressed);
        assert_eq!(metadata.end, 3);
        for block in &blocks {
            let original = ledger.block(block.height()).unwrap();
            assert!(block.signatures.is_empty());
            assert!(block.bookkeepers.is_empty());
            assert_eq!(block.digest(), original.digest());
        }
    }

    #[test]
    fn test_end_capped_at_ledger_height() {
        let ledger = ledger(2);
        let mut out = Vec::new();
        let cfg = Config {
            start: 1,
            end: Some(10),
            ..Config::default()
        };
        assert_eq!(export(&ledger, &mut out, &cfg).unwrap().end, 2);
        assert_eq!(read(&out).1.len(), 2);
    }

    #[test]
    fn test_invalid_range() {
        let ledger = ledger(5);
        let cfg = Config {
            start: 4,
            end: Some(3),
            ..Config::default()
        };
        assert!(matches!(
            export(&ledger, &mut Vec::new(), &cfg),
            Err(Error::InvalidRange { start: 4, end: 3 })
        ));
    }

    #[test]
    fn test_start_beyond_height() {
        let ledger = ledger(2);
        let mut out = Vec::new();
        let cfg = Config {
            start: 3,
            ..Config::default()
        };
        // The default end is the ledger height, so the range itself is invalid
        assert!(matches!(
            export(&ledger, &mut out, &cfg),
            Err(Error::InvalidRange { start: 3, end: 2 })
        ));
        let cfg = Config {
            start: 3,
            end: Some(5),
            ..Config::default()
        };
        assert!(matches!(
            export(&ledger, &mut out, &cfg),
            Err(Error::NothingToExport {
                start: 3,
                height: 2
            })
        ));
        assert!(out.is_empty());
    }

    #[test]
    fn test_truncated_export() {
        let ledger = ledger(2);
        let mut out = Vec::new();
        export(&ledger, &mut out, &Config::default()).unwrap();
        out.truncate(out.len() - 1);

        let reader = Reader::new(&out[..], BlockCfg::default().into()).unwrap();
        let results: Vec<_> = reader.collect();
        assert_eq!(results.len(), 3);
        assert!(results[0].is_ok());
        assert!(results[1].is_ok());
        assert!(matches!(results[2], Err(Error::Io(_))));
    }

    #[test]
    fn test_invalid_magic() {
        let mut out = Vec::new();
        export(&ledger(1), &mut out, &Config::default()).unwrap();
        out[0] ^= 0xFF;
        assert!(matches!(
            Reader::new(&out[..], BlockCfg::default().into()),
            Err(Error::Codec(CodecError::Invalid("Metadata", "magic")))
        ));
    }

    #[test]
    fn test_oversized_record() {
        let mut out = Vec::new();
        export(&ledger(2), &mut out, &Config::default()).unwrap();

        // A corrupt length prefix is rejected before anything is allocated
        let mut corrupt = out.clone();
        corrupt[METADATA_SIZE..METADATA_SIZE + 4].copy_from_slice(&u32::MAX.to_be_bytes());
        let mut reader = Reader::new(&corrupt[..], BlockCfg::default().into()).unwrap();
        assert!(matches!(
            reader.next(),
            Some(Err(Error::BlockTooLarge(len))) if len == u32::MAX as usize
        ));
        assert!(reader.next().is_none());

        // Records beyond a configured limit are rejected too
        let cfg = ReaderConfig {
            block: BlockCfg::default(),
            max_record: 8,
        };
        let mut reader = Reader::new(&out[..], cfg).unwrap();
        assert!(matches!(reader.next(), Some(Err(Error::BlockTooLarge(_)))));
    }
}
