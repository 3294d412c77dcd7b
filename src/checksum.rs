//! Block checksum index over a seekable source.
//!
//! The source is cut into blocks of a fixed size, and every complete block is
//! recorded under its weak checksum. Colliding blocks are all kept, in block
//! order. A [`ChecksumTable`] holds one index, or two independent ones when
//! duplicate-checksum mode is on, behind a single query interface.

use std::io::{self, Read, Write};

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use rustc_hash::FxHashMap;

use crate::error::{DeltaError, Result};
use crate::rolling::{PRIMARY_SEED, SECONDARY_SEED, WeakChecksum};
use crate::source::SeekableSource;

/// Longest collision chain kept per checksum in duplicate-checksum mode.
pub const DUPLICATE_CHAIN_LIMIT: usize = 32;

/// Minimum read size used while scanning the source.
const SCAN_BUFFER_SIZE: usize = 64 * 1024;

/// Block offsets sharing one checksum.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Chain {
    Single(u64),
    Multiple(Vec<u64>),
}

impl Chain {
    fn push(&mut self, offset: u64, limit: Option<usize>) {
        if let Some(limit) = limit {
            if self.as_slice().len() >= limit {
                return;
            }
        }
        match self {
            Chain::Single(first) => {
                let first = *first;
                *self = Chain::Multiple(vec![first, offset]);
            }
            Chain::Multiple(list) => list.push(offset),
        }
    }

    fn as_slice(&self) -> &[u64] {
        match self {
            Chain::Single(offset) => std::slice::from_ref(offset),
            Chain::Multiple(list) => list,
        }
    }
}

/// Mapping from one weak checksum to the source blocks that produce it.
#[derive(Debug, Clone)]
pub struct ChecksumIndex {
    checksum: WeakChecksum,
    chains: FxHashMap<u32, Chain>,
    chain_limit: Option<usize>,
    blocks: u64,
    scanned: u64,
}

impl ChecksumIndex {
    /// Creates an empty index hashing with `checksum`.
    pub fn new(checksum: WeakChecksum, chain_limit: Option<usize>) -> Self {
        Self {
            checksum,
            chains: FxHashMap::default(),
            chain_limit,
            blocks: 0,
            scanned: 0,
        }
    }

    /// Returns the checksum function of this index.
    #[inline]
    pub fn checksum(&self) -> &WeakChecksum {
        &self.checksum
    }

    /// Records that the block starting at `offset` hashes to `hash`.
    pub fn insert(&mut self, hash: u32, offset: u64) {
        self.blocks += 1;
        match self.chains.get_mut(&hash) {
            Some(chain) => chain.push(offset, self.chain_limit),
            None => {
                self.chains.insert(hash, Chain::Single(offset));
            }
        }
    }

    /// Returns every recorded block offset for `hash`, in block order.
    #[inline]
    pub fn lookup(&self, hash: u32) -> &[u64] {
        self.chains.get(&hash).map_or(&[][..], Chain::as_slice)
    }

    /// Returns the first block offset recorded for `hash`.
    #[inline]
    pub fn find(&self, hash: u32) -> Option<u64> {
        self.lookup(hash).first().copied()
    }

    /// Number of distinct checksums.
    pub fn len(&self) -> usize {
        self.chains.len()
    }

    /// Returns true if no block has been recorded.
    pub fn is_empty(&self) -> bool {
        self.chains.is_empty()
    }

    /// Number of blocks inserted, including those dropped by the chain limit.
    pub fn block_count(&self) -> u64 {
        self.blocks
    }

    /// Number of source bytes scanned while building.
    pub fn scanned(&self) -> u64 {
        self.scanned
    }

    /// Empties the index in place.
    pub fn clear(&mut self) {
        self.chains.clear();
        self.blocks = 0;
        self.scanned = 0;
    }

    fn write_to<W: Write>(&self, writer: &mut W) -> io::Result<()> {
        writer.write_u64::<BigEndian>(self.checksum.seed())?;
        writer.write_u64::<BigEndian>(self.scanned)?;
        writer.write_u32::<BigEndian>(self.chain_limit.unwrap_or(0) as u32)?;
        writer.write_u32::<BigEndian>(self.chains.len() as u32)?;

        // Sorted so the same index always serializes to the same bytes.
        let mut hashes: Vec<&u32> = self.chains.keys().collect();
        hashes.sort_unstable();
        for hash in hashes {
            let chain = self.chains[hash].as_slice();
            writer.write_u32::<BigEndian>(*hash)?;
            writer.write_u32::<BigEndian>(chain.len() as u32)?;
            for &offset in chain {
                writer.write_u64::<BigEndian>(offset)?;
            }
        }
        Ok(())
    }

    fn read_from<R: Read>(reader: &mut R) -> io::Result<Self> {
        let seed = reader.read_u64::<BigEndian>()?;
        let scanned = reader.read_u64::<BigEndian>()?;
        let chain_limit = match reader.read_u32::<BigEndian>()? {
            0 => None,
            limit => Some(limit as usize),
        };
        let count = reader.read_u32::<BigEndian>()?;

        let mut index = Self::new(WeakChecksum::new(seed), chain_limit);
        index.scanned = scanned;
        for _ in 0..count {
            let hash = reader.read_u32::<BigEndian>()?;
            let len = reader.read_u32::<BigEndian>()?;
            for _ in 0..len {
                let offset = reader.read_u64::<BigEndian>()?;
                index.insert(hash, offset);
            }
        }
        Ok(index)
    }
}

/// Checksum value(s) of one window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowHash {
    /// Hash under the primary checksum.
    pub primary: u32,
    /// Hash under the secondary checksum, in duplicate-checksum mode.
    pub secondary: Option<u32>,
}

/// One or two checksum indexes over the blocks of a source.
#[derive(Debug, Clone)]
pub struct ChecksumTable {
    block_size: usize,
    primary: ChecksumIndex,
    secondary: Option<ChecksumIndex>,
    built: bool,
}

impl ChecksumTable {
    /// Creates an empty table for blocks of `block_size` bytes.
    ///
    /// With `duplicate`, a second index with an independent seed is kept and
    /// a lookup only succeeds when both indexes agree on the block.
    pub fn new(block_size: usize, duplicate: bool) -> Result<Self> {
        if block_size == 0 {
            return Err(DeltaError::InvalidConfig(
                "block size must be positive".to_string(),
            ));
        }
        let chain_limit = duplicate.then_some(DUPLICATE_CHAIN_LIMIT);
        Ok(Self {
            block_size,
            primary: ChecksumIndex::new(WeakChecksum::new(PRIMARY_SEED), chain_limit),
            secondary: duplicate
                .then(|| ChecksumIndex::new(WeakChecksum::new(SECONDARY_SEED), chain_limit)),
            built: false,
        })
    }

    /// Returns the block size.
    #[inline]
    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// Returns true if a second, independent index is kept.
    #[inline]
    pub fn is_duplicate(&self) -> bool {
        self.secondary.is_some()
    }

    /// Returns true until [`build`](Self::build) has run.
    #[inline]
    pub fn is_empty(&self) -> bool {
        !self.built
    }

    /// Number of source bytes scanned by the last build.
    pub fn scanned(&self) -> u64 {
        self.primary.scanned()
    }

    /// Returns the primary index.
    pub fn primary(&self) -> &ChecksumIndex {
        &self.primary
    }

    /// Returns the secondary index, in duplicate-checksum mode.
    pub fn secondary(&self) -> Option<&ChecksumIndex> {
        self.secondary.as_ref()
    }

    /// Empties the table in place.
    pub fn clear(&mut self) {
        self.primary.clear();
        if let Some(secondary) = self.secondary.as_mut() {
            secondary.clear();
        }
        self.built = false;
    }

    /// Changes the block size, clearing the table if it differs.
    pub fn set_block_size(&mut self, block_size: usize) -> Result<()> {
        if block_size == 0 {
            return Err(DeltaError::InvalidConfig(
                "block size must be positive".to_string(),
            ));
        }
        if block_size != self.block_size {
            self.block_size = block_size;
            self.clear();
        }
        Ok(())
    }

    /// Scans `source` from offset 0 and indexes every complete block.
    ///
    /// A trailing partial block is not indexed. Short reads are continued;
    /// only a zero-length read ends the scan.
    pub fn build<S: SeekableSource + ?Sized>(&mut self, source: &mut S) -> Result<()> {
        self.clear();
        tracing::debug!(
            block_size = self.block_size,
            source_len = source.len(),
            duplicate = self.is_duplicate(),
            "checksum table: building"
        );

        let block = self.block_size;
        let capacity = (SCAN_BUFFER_SIZE / block).max(2) * block;
        let mut buf = vec![0u8; capacity];
        let mut filled = 0usize;
        let mut read_pos = 0u64;
        let mut block_offset = 0u64;

        loop {
            let n = match source.read_at(read_pos, &mut buf[filled..]) {
                Ok(n) => n,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(err.into()),
            };
            if n == 0 {
                break;
            }
            filled += n;
            read_pos += n as u64;

            let complete = filled / block * block;
            for chunk in buf[..complete].chunks_exact(block) {
                self.primary
                    .insert(self.primary.checksum.compute(chunk), block_offset);
                if let Some(secondary) = self.secondary.as_mut() {
                    secondary.insert(secondary.checksum.compute(chunk), block_offset);
                }
                block_offset += block as u64;
            }
            buf.copy_within(complete..filled, 0);
            filled -= complete;
        }

        self.primary.scanned = read_pos;
        if let Some(secondary) = self.secondary.as_mut() {
            secondary.scanned = read_pos;
        }
        self.built = true;

        tracing::debug!(
            blocks = self.primary.block_count(),
            distinct = self.primary.len(),
            scanned = read_pos,
            "checksum table: built"
        );
        Ok(())
    }

    /// Computes the checksum(s) of a full window from scratch.
    #[inline]
    pub fn hash(&self, window: &[u8]) -> WindowHash {
        WindowHash {
            primary: self.primary.checksum.compute(window),
            secondary: self
                .secondary
                .as_ref()
                .map(|index| index.checksum.compute(window)),
        }
    }

    /// Slides the window hash forward by one byte.
    #[inline]
    pub fn roll(&self, hash: WindowHash, outgoing: u8, incoming: u8) -> WindowHash {
        let block = self.block_size;
        WindowHash {
            primary: self
                .primary
                .checksum
                .roll(hash.primary, outgoing, incoming, block),
            secondary: match (self.secondary.as_ref(), hash.secondary) {
                (Some(index), Some(value)) => {
                    Some(index.checksum.roll(value, outgoing, incoming, block))
                }
                _ => None,
            },
        }
    }

    /// Returns the first block offset matching `hash`.
    pub fn find(&self, hash: WindowHash) -> Option<u64> {
        self.candidates(hash).next()
    }

    /// Returns every block offset matching `hash`, in block order.
    ///
    /// In duplicate-checksum mode only offsets recorded under both hashes are
    /// returned.
    pub fn candidates(&self, hash: WindowHash) -> impl Iterator<Item = u64> + '_ {
        let confirm: Option<&[u64]> = match (self.secondary.as_ref(), hash.secondary) {
            (Some(index), Some(value)) => Some(index.lookup(value)),
            (Some(_), None) => Some(&[][..]),
            (None, _) => None,
        };
        self.primary
            .lookup(hash.primary)
            .iter()
            .copied()
            .filter(move |offset| confirm.is_none_or(|list| list.binary_search(offset).is_ok()))
    }

    /// Returns true if the block at `offset` is recorded under `hash`.
    ///
    /// Chains are in block order, so this is a binary search per index.
    pub fn contains(&self, hash: WindowHash, offset: u64) -> bool {
        let in_primary = self.primary.lookup(hash.primary).binary_search(&offset).is_ok();
        in_primary
            && match (self.secondary.as_ref(), hash.secondary) {
                (Some(index), Some(value)) => index.lookup(value).binary_search(&offset).is_ok(),
                (Some(_), None) => false,
                (None, _) => true,
            }
    }

    /// Persists the table: block size, table count, then each index.
    pub fn write_snapshot<W: Write>(&self, writer: &mut W) -> Result<()> {
        writer.write_i32::<BigEndian>(self.block_size as i32)?;
        writer.write_u8(if self.is_duplicate() { 2 } else { 1 })?;
        self.primary.write_to(writer)?;
        if let Some(secondary) = self.secondary.as_ref() {
            secondary.write_to(writer)?;
        }
        Ok(())
    }

    /// Reloads a table written by [`write_snapshot`](Self::write_snapshot).
    ///
    /// Nothing checks that the source later used with the table holds the
    /// bytes the table was built from.
    pub fn read_snapshot<R: Read>(reader: &mut R) -> Result<Self> {
        let truncated = |err: io::Error| {
            if err.kind() == io::ErrorKind::UnexpectedEof {
                DeltaError::InvalidSnapshot("truncated snapshot".to_string())
            } else {
                DeltaError::Io(err)
            }
        };

        let block_size = reader.read_i32::<BigEndian>().map_err(truncated)?;
        if block_size <= 0 {
            return Err(DeltaError::InvalidSnapshot(format!(
                "invalid block size {block_size}"
            )));
        }
        let count = reader.read_u8().map_err(truncated)?;
        if count != 1 && count != 2 {
            return Err(DeltaError::InvalidSnapshot(format!(
                "invalid table count {count}"
            )));
        }

        let primary = ChecksumIndex::read_from(reader).map_err(truncated)?;
        let secondary = if count == 2 {
            Some(ChecksumIndex::read_from(reader).map_err(truncated)?)
        } else {
            None
        };

        Ok(Self {
            block_size: block_size as usize,
            primary,
            secondary,
            built: true,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::SliceSource;

    /// Serves at most `max` bytes per read.
    struct Trickle<'a> {
        inner: SliceSource<&'a [u8]>,
        max: usize,
    }

    impl SeekableSource for Trickle<'_> {
        fn len(&self) -> u64 {
            self.inner.len()
        }

        fn seek(&mut self, pos: u64) -> io::Result<()> {
            self.inner.seek(pos)
        }

        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            let n = buf.len().min(self.max);
            self.inner.read(&mut buf[..n])
        }
    }

    fn build(data: &[u8], block: usize, duplicate: bool) -> ChecksumTable {
        let mut table = ChecksumTable::new(block, duplicate).unwrap();
        table.build(&mut SliceSource::new(data)).unwrap();
        table
    }

    #[test]
    fn test_build_indexes_complete_blocks_only() {
        let data: Vec<u8> = (0..=255u8).cycle().take(100).collect();
        let table = build(&data, 16, false);

        assert!(!table.is_empty());
        assert_eq!(table.scanned(), 100);
        assert_eq!(table.primary().block_count(), 6);

        for block in 0..6u64 {
            let start = (block * 16) as usize;
            let hash = table.hash(&data[start..start + 16]);
            assert!(table.candidates(hash).any(|offset| offset == block * 16));
        }

        // Bytes 96..100 form a partial block and are never indexed.
        let mut padded = data[96..100].to_vec();
        padded.resize(16, 0);
        assert_eq!(table.find(table.hash(&padded)), None);
    }

    #[test]
    fn test_collisions_are_all_kept() {
        let data = vec![7u8; 64];
        let table = build(&data, 16, false);
        let hash = table.hash(&data[..16]);
        let offsets: Vec<u64> = table.candidates(hash).collect();
        assert_eq!(offsets, vec![0, 16, 32, 48]);
        assert_eq!(table.find(hash), Some(0));
    }

    #[test]
    fn test_short_reads_are_continued() {
        let data: Vec<u8> = (0..200u32).map(|i| (i * 7 % 251) as u8).collect();
        let mut table = ChecksumTable::new(8, false).unwrap();
        let mut source = Trickle {
            inner: SliceSource::new(&data[..]),
            max: 3,
        };
        table.build(&mut source).unwrap();

        assert_eq!(table.scanned(), 200);
        assert_eq!(table.primary().block_count(), 25);
        assert_eq!(
            table.primary().lookup(table.hash(&data[..8]).primary).to_vec(),
            build(&data, 8, false)
                .primary()
                .lookup(table.hash(&data[..8]).primary)
                .to_vec()
        );
    }

    #[test]
    fn test_duplicate_mode_requires_agreement() {
        let data: Vec<u8> = (0..64u8).collect();
        let table = build(&data, 16, true);
        let hash = table.hash(&data[16..32]);
        assert!(hash.secondary.is_some());
        assert_eq!(table.find(hash), Some(16));

        // Same primary value, secondary pointing elsewhere: a miss.
        let forged = WindowHash {
            primary: hash.primary,
            secondary: Some(table.hash(&data[32..48]).secondary.unwrap()),
        };
        assert_eq!(table.find(forged), None);
    }

    #[test]
    fn test_contains_checks_every_index() {
        let data = vec![7u8; 64];
        let table = build(&data, 16, false);
        let hash = table.hash(&data[..16]);
        assert!(table.contains(hash, 0));
        assert!(table.contains(hash, 48));
        assert!(!table.contains(hash, 8));
        assert!(!table.contains(hash, 64));

        let data: Vec<u8> = (0..64u8).collect();
        let table = build(&data, 16, true);
        let hash = table.hash(&data[16..32]);
        assert!(table.contains(hash, 16));
        let forged = WindowHash {
            primary: hash.primary,
            secondary: Some(table.hash(&data[32..48]).secondary.unwrap()),
        };
        assert!(!table.contains(forged, 16));
        assert!(!table.contains(WindowHash { secondary: None, ..hash }, 16));
    }

    #[test]
    fn test_duplicate_mode_caps_chains() {
        let data = vec![0u8; 16 * (DUPLICATE_CHAIN_LIMIT + 10)];
        let table = build(&data, 16, true);
        let hash = table.hash(&data[..16]);
        assert_eq!(table.candidates(hash).count(), DUPLICATE_CHAIN_LIMIT);
    }

    #[test]
    fn test_roll_tracks_window() {
        let data = b"abcdefghijklmnopqrstuvwxyz0123456789";
        let table = build(data, 8, true);
        let mut hash = table.hash(&data[..8]);
        for start in 1..=data.len() - 8 {
            hash = table.roll(hash, data[start - 1], data[start + 7]);
            assert_eq!(hash, table.hash(&data[start..start + 8]));
        }
    }

    #[test]
    fn test_set_block_size_clears() {
        let mut table = build(&[1u8; 64], 16, false);
        table.set_block_size(16).unwrap();
        assert!(!table.is_empty());
        table.set_block_size(32).unwrap();
        assert!(table.is_empty());
        assert!(table.primary().is_empty());
        assert!(table.set_block_size(0).is_err());
    }

    #[test]
    fn test_snapshot_reload() {
        let data: Vec<u8> = (0..500u32).map(|i| (i % 97) as u8).collect();
        let table = build(&data, 16, true);

        let mut bytes = Vec::new();
        table.write_snapshot(&mut bytes).unwrap();
        assert_eq!(&bytes[..4], &16i32.to_be_bytes());
        assert_eq!(bytes[4], 2);

        let reloaded = ChecksumTable::read_snapshot(&mut &bytes[..]).unwrap();
        assert_eq!(reloaded.block_size(), 16);
        assert!(reloaded.is_duplicate());
        assert!(!reloaded.is_empty());
        assert_eq!(reloaded.scanned(), 500);

        let hash = table.hash(&data[48..64]);
        assert_eq!(
            reloaded.candidates(hash).collect::<Vec<_>>(),
            table.candidates(hash).collect::<Vec<_>>()
        );

        let mut again = Vec::new();
        reloaded.write_snapshot(&mut again).unwrap();
        assert_eq!(again, bytes);
    }

    #[test]
    fn test_snapshot_rejects_garbage() {
        assert!(matches!(
            ChecksumTable::read_snapshot(&mut &[0u8, 0, 0, 0, 1][..]),
            Err(DeltaError::InvalidSnapshot(_))
        ));
        assert!(matches!(
            ChecksumTable::read_snapshot(&mut &[0u8, 0, 0, 16, 3][..]),
            Err(DeltaError::InvalidSnapshot(_))
        ));
        assert!(matches!(
            ChecksumTable::read_snapshot(&mut &[0u8, 0, 0, 16, 1, 0][..]),
            Err(DeltaError::InvalidSnapshot(_))
        ));
    }
}
