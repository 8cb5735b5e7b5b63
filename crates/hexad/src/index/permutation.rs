//! The six sorted permutations of the triple store and their on-disk block
//! format.
//!
//! A permutation file is a small header, a run of flate2-compressed blocks
//! of fixed-width id triples, a bincode-encoded block-metadata table, and a
//! footer pointing at that table. Blocks are the unit of prefilter pruning;
//! their metadata carries the first and last triple so scans and prefilters
//! never touch payload bytes they can rule out.

use std::fs::File;
use std::io::{BufWriter, Read, Seek, SeekFrom, Write};
use std::mem::size_of;
use std::path::{Path, PathBuf};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use memmap2::Mmap;
use serde::{Deserialize, Serialize};

use crate::{IdTriple, InternalError, Result, ValueId};

const MAGIC: u32 = 0x4845_5850;
const FORMAT_VERSION: u32 = 2;
const HEADER_LEN: u64 = 9;
const FOOTER_LEN: u64 = 16;

/// One of the six sort orders of the triple store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Permutation {
    Spo,
    Sop,
    Pso,
    Pos,
    Osp,
    Ops,
}

pub const ALL_PERMUTATIONS: [Permutation; 6] = [
    Permutation::Spo,
    Permutation::Sop,
    Permutation::Pso,
    Permutation::Pos,
    Permutation::Osp,
    Permutation::Ops,
];

impl Permutation {
    /// Positions of (subject, predicate, object) in this permutation's
    /// column order.
    fn order(self) -> [usize; 3] {
        match self {
            Permutation::Spo => [0, 1, 2],
            Permutation::Sop => [0, 2, 1],
            Permutation::Pso => [1, 0, 2],
            Permutation::Pos => [1, 2, 0],
            Permutation::Osp => [2, 0, 1],
            Permutation::Ops => [2, 1, 0],
        }
    }

    /// Permutes an `(s, p, o)` triple into this permutation's column order.
    pub fn apply(self, [s, p, o]: IdTriple) -> IdTriple {
        let spo = [s, p, o];
        let order = self.order();
        [spo[order[0]], spo[order[1]], spo[order[2]]]
    }

    /// Inverse of [`Permutation::apply`].
    pub fn restore(self, columns: IdTriple) -> IdTriple {
        let order = self.order();
        let mut spo = [ValueId::UNDEFINED; 3];
        for (position, &source) in order.iter().enumerate() {
            spo[source] = columns[position];
        }
        spo
    }

    pub fn file_name(self) -> &'static str {
        match self {
            Permutation::Spo => "permutation.spo",
            Permutation::Sop => "permutation.sop",
            Permutation::Pso => "permutation.pso",
            Permutation::Pos => "permutation.pos",
            Permutation::Osp => "permutation.osp",
            Permutation::Ops => "permutation.ops",
        }
    }

    fn tag(self) -> u8 {
        match self {
            Permutation::Spo => 0,
            Permutation::Sop => 1,
            Permutation::Pso => 2,
            Permutation::Pos => 3,
            Permutation::Osp => 4,
            Permutation::Ops => 5,
        }
    }
}

/// Metadata of one compressed block, kept in memory for the whole life of
/// the index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockMetadata {
    pub block_index: u64,
    pub first_triple: IdTriple,
    pub last_triple: IdTriple,
    pub byte_offset: u64,
    pub byte_length: u64,
}

/// Writes one permutation file; triples must arrive deduplicated and in
/// ascending order of this permutation.
pub struct PermutationWriter {
    file: BufWriter<File>,
    metadata: Vec<BlockMetadata>,
    pending: Vec<IdTriple>,
    block_size: usize,
    bytes_written: u64,
    triple_count: u64,
    last: Option<IdTriple>,
}

impl PermutationWriter {
    pub fn create(path: &Path, permutation: Permutation, block_size: u32) -> Result<Self> {
        debug_assert!(block_size > 0);
        let mut file = BufWriter::new(File::create(path)?);
        file.write_u32::<LittleEndian>(MAGIC)?;
        file.write_u32::<LittleEndian>(FORMAT_VERSION)?;
        file.write_u8(permutation.tag())?;
        Ok(PermutationWriter {
            file,
            metadata: Vec::new(),
            pending: Vec::with_capacity(block_size as usize),
            block_size: block_size as usize,
            bytes_written: HEADER_LEN,
            triple_count: 0,
            last: None,
        })
    }

    pub fn push(&mut self, triple: IdTriple) -> Result<()> {
        debug_assert!(
            self.last.map_or(true, |last| last < triple),
            "triples must arrive strictly sorted: {:?} then {triple:?}",
            self.last
        );
        self.last = Some(triple);
        self.pending.push(triple);
        self.triple_count += 1;
        if self.pending.len() == self.block_size {
            self.flush_block()?;
        }
        Ok(())
    }

    fn flush_block(&mut self) -> Result<()> {
        let first_triple = self.pending[0];
        let last_triple = *self.pending.last().expect("flush_block needs pending triples");
        let raw: &[u8] = bytemuck::cast_slice(&self.pending);
        let mut encoder = ZlibEncoder::new(Vec::new(), Compression::fast());
        encoder.write_all(raw)?;
        let compressed = encoder.finish()?;
        self.file.write_all(&compressed)?;
        self.metadata.push(BlockMetadata {
            block_index: self.metadata.len() as u64,
            first_triple,
            last_triple,
            byte_offset: self.bytes_written,
            byte_length: compressed.len() as u64,
        });
        self.bytes_written += compressed.len() as u64;
        self.pending.clear();
        Ok(())
    }

    pub fn finish(mut self) -> Result<u64> {
        if !self.pending.is_empty() {
            self.flush_block()?;
        }
        let metadata_offset = self.bytes_written;
        let encoded = bincode::serialize(&self.metadata).map_err(InternalError::Bincode)?;
        self.file.write_all(&encoded)?;
        self.file.write_u64::<LittleEndian>(metadata_offset)?;
        self.file.write_u64::<LittleEndian>(self.triple_count)?;
        self.file.flush()?;
        Ok(self.triple_count)
    }
}

/// Memory-mapped reader over one permutation file.
#[derive(Debug)]
pub struct PermutationIndex {
    permutation: Permutation,
    mmap: Option<Mmap>,
    metadata: Vec<BlockMetadata>,
    triple_count: u64,
    path: PathBuf,
}

impl PermutationIndex {
    pub fn open(path: &Path, permutation: Permutation) -> Result<PermutationIndex> {
        let corrupt = |reason: String| {
            crate::Error::from(InternalError::CorruptIndex {
                path: path.display().to_string(),
                reason,
            })
        };
        let mut file = File::open(path)?;
        let file_len = file.metadata()?.len();
        if file_len < HEADER_LEN + FOOTER_LEN {
            return Err(corrupt("file too short".to_owned()));
        }
        let magic = file.read_u32::<LittleEndian>()?;
        if magic != MAGIC {
            return Err(corrupt("bad magic number".to_owned()));
        }
        let version = file.read_u32::<LittleEndian>()?;
        if version != FORMAT_VERSION {
            return Err(InternalError::IndexVersionMismatch {
                found: version,
                required: FORMAT_VERSION,
            }
            .into());
        }
        let tag = file.read_u8()?;
        if tag != permutation.tag() {
            return Err(corrupt(format!(
                "file holds permutation tag {tag}, expected {:?}",
                permutation
            )));
        }
        file.seek(SeekFrom::End(-(FOOTER_LEN as i64)))?;
        let metadata_offset = file.read_u64::<LittleEndian>()?;
        let triple_count = file.read_u64::<LittleEndian>()?;
        if metadata_offset < HEADER_LEN || metadata_offset > file_len - FOOTER_LEN {
            return Err(corrupt("metadata offset out of range".to_owned()));
        }
        let mmap = unsafe { Mmap::map(&file)? };
        let metadata: Vec<BlockMetadata> = bincode::deserialize(
            &mmap[metadata_offset as usize..(file_len - FOOTER_LEN) as usize],
        )
        .map_err(InternalError::Bincode)?;
        validate_metadata(&metadata).map_err(corrupt)?;
        Ok(PermutationIndex {
            permutation,
            mmap: Some(mmap),
            metadata,
            triple_count,
            path: path.to_owned(),
        })
    }

    /// An empty permutation, used before any triples exist.
    pub fn empty(permutation: Permutation) -> PermutationIndex {
        PermutationIndex {
            permutation,
            mmap: None,
            metadata: Vec::new(),
            triple_count: 0,
            path: PathBuf::new(),
        }
    }

    pub fn permutation(&self) -> Permutation {
        self.permutation
    }

    pub fn metadata(&self) -> &[BlockMetadata] {
        &self.metadata
    }

    pub fn triple_count(&self) -> u64 {
        self.triple_count
    }

    /// The contiguous metadata slice of blocks that may hold triples whose
    /// first column is `col0` (and, if given, second column `col1`).
    pub fn blocks_for_prefix(
        &self,
        col0: Option<ValueId>,
        col1: Option<ValueId>,
    ) -> &[BlockMetadata] {
        debug_assert!(col0.is_some() || col1.is_none());
        let lower = [
            col0.unwrap_or(ValueId::UNDEFINED),
            col1.unwrap_or(ValueId::UNDEFINED),
            ValueId::UNDEFINED,
        ];
        let upper = [
            col0.unwrap_or(ValueId::MAX),
            col1.unwrap_or(ValueId::MAX),
            ValueId::MAX,
        ];
        let start = self.metadata.partition_point(|block| block.last_triple < lower);
        let end = self.metadata.partition_point(|block| block.first_triple <= upper);
        &self.metadata[start.min(end)..end]
    }

    pub fn read_block(&self, block: &BlockMetadata) -> Result<Vec<IdTriple>> {
        let corrupt = |reason: &str| InternalError::CorruptIndex {
            path: self.path.display().to_string(),
            reason: reason.to_owned(),
        };
        let mmap = self.mmap.as_ref().ok_or_else(|| corrupt("block read on empty index"))?;
        let compressed = mmap
            .get(block.byte_offset as usize..(block.byte_offset + block.byte_length) as usize)
            .ok_or_else(|| corrupt("block range out of bounds"))?;
        let mut raw = Vec::new();
        ZlibDecoder::new(compressed).read_to_end(&mut raw)?;
        if raw.len() % size_of::<IdTriple>() != 0 {
            return Err(corrupt("block payload is not a whole number of triples").into());
        }
        Ok(bytemuck::pod_collect_to_vec(&raw))
    }
}

fn validate_metadata(metadata: &[BlockMetadata]) -> std::result::Result<(), String> {
    for (position, block) in metadata.iter().enumerate() {
        if block.block_index != position as u64 {
            return Err(format!("block {position} carries index {}", block.block_index));
        }
        if block.last_triple < block.first_triple {
            return Err(format!("block {position} has lastTriple < firstTriple"));
        }
    }
    for pair in metadata.windows(2) {
        if pair[0].last_triple >= pair[1].first_triple {
            return Err(format!(
                "blocks {} and {} overlap",
                pair[0].block_index, pair[1].block_index
            ));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;

    fn triple(s: u64, p: u64, o: u64) -> IdTriple {
        [
            ValueId::from_vocab_index(s),
            ValueId::from_vocab_index(p),
            ValueId::from_vocab_index(o),
        ]
    }

    fn build(triples: &[IdTriple], block_size: u32) -> (TempDir, PermutationIndex) {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(Permutation::Spo.file_name());
        let mut writer = PermutationWriter::create(&path, Permutation::Spo, block_size).unwrap();
        for &t in triples {
            writer.push(t).unwrap();
        }
        assert_eq!(writer.finish().unwrap(), triples.len() as u64);
        (dir, PermutationIndex::open(&path, Permutation::Spo).unwrap())
    }

    #[test]
    fn apply_and_restore_are_inverse() {
        let t = triple(1, 2, 3);
        for permutation in ALL_PERMUTATIONS {
            assert_eq!(permutation.restore(permutation.apply(t)), t);
        }
        assert_eq!(
            Permutation::Pos.apply(t),
            [t[1], t[2], t[0]],
        );
    }

    #[test]
    fn blocks_roundtrip_and_metadata_invariants() {
        let triples: Vec<IdTriple> =
            (0..95).map(|i| triple(i / 10, i % 10, i)).collect();
        let (_dir, index) = build(&triples, 10);
        assert_eq!(index.triple_count(), 95);
        assert_eq!(index.metadata().len(), 10);
        for pair in index.metadata().windows(2) {
            assert!(pair[0].last_triple < pair[1].first_triple);
            assert!(pair[0].block_index < pair[1].block_index);
        }
        let mut read_back = Vec::new();
        for block in index.metadata() {
            read_back.extend(index.read_block(block).unwrap());
        }
        assert_eq!(read_back, triples);
    }

    #[test]
    fn blocks_for_prefix_narrows_the_scan() {
        let triples: Vec<IdTriple> =
            (0..100).map(|i| triple(i / 10, i % 10, i)).collect();
        let (_dir, index) = build(&triples, 10);
        // Subject 3 occupies exactly one of the ten blocks.
        let blocks = index.blocks_for_prefix(Some(ValueId::from_vocab_index(3)), None);
        assert_eq!(blocks.len(), 1);
        let rows = index.read_block(&blocks[0]).unwrap();
        assert!(rows.iter().all(|r| r[0] == ValueId::from_vocab_index(3)));
        // An absent subject selects no blocks.
        let blocks = index.blocks_for_prefix(Some(ValueId::from_vocab_index(999)), None);
        assert!(blocks.is_empty());
    }

    #[test]
    fn version_gate_refuses_other_formats() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("permutation.spo");
        let mut writer = PermutationWriter::create(&path, Permutation::Spo, 4).unwrap();
        writer.push(triple(0, 0, 0)).unwrap();
        writer.finish().unwrap();
        let mut bytes = std::fs::read(&path).unwrap();
        bytes[4] = 0xff;
        std::fs::write(&path, bytes).unwrap();
        let err = PermutationIndex::open(&path, Permutation::Spo).unwrap_err();
        assert!(err.to_string().contains("rebuild"));
    }
}
