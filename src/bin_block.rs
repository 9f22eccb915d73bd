//! In-memory representation of a packed bin block: four parallel byte
//! streams plus per-sub-bin descriptors. Blocks travel between the pipeline
//! stages and are the unit written to and read from the bin file.

use std::collections::BTreeMap;

use crate::headers::HeaderStats;
use crate::quality::QualityStats;
use crate::records::RecordStats;

/// Sizes and counts of one sub-bin inside a block.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BinDescriptor {
    pub meta_size: u64,
    pub dna_size: u64,
    pub qua_size: u64,
    pub head_size: u64,
    pub records_count: u64,
    pub raw_dna_size: u64,
    pub raw_head_size: u64,
}

/// Aggregated statistics carried next to the packed data so the writer can
/// assemble the global footer sections.
#[derive(Clone, Debug, Default)]
pub struct BlockStats {
    pub records: RecordStats,
    pub headers: HeaderStats,
    pub quality: QualityStats,
}

impl BlockStats {
    pub fn merge(&mut self, other: &BlockStats) -> crate::error::FastoreResult<()> {
        self.records.merge(&other.records);
        self.headers.merge(&other.headers)?;
        self.quality.merge(&other.quality);
        Ok(())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BlockType {
    /// Several bins from one input batch, keyed by signature.
    MultiSignature,
    /// One full bin read back for compression, identified by `signature`.
    SingleSignature,
}

/// A packed block: metadata plus the four parallel streams.
#[derive(Debug)]
pub struct BinaryBinBlock {
    pub block_type: BlockType,
    pub signature: u32,
    pub descriptors: BTreeMap<u32, BinDescriptor>,
    pub aux_descriptors: Vec<BinDescriptor>,
    pub meta: Vec<u8>,
    pub dna: Vec<u8>,
    pub qua: Vec<u8>,
    pub head: Vec<u8>,
    pub raw_dna_size: u64,
    pub raw_head_size: u64,
    pub stats: BlockStats,
    /// Monotonic batch id used by the pipeline.
    pub part_id: u64,
}

impl Default for BinaryBinBlock {
    fn default() -> Self {
        BinaryBinBlock {
            block_type: BlockType::MultiSignature,
            signature: 0,
            descriptors: BTreeMap::new(),
            aux_descriptors: Vec::new(),
            meta: Vec::new(),
            dna: Vec::new(),
            qua: Vec::new(),
            head: Vec::new(),
            raw_dna_size: 0,
            raw_head_size: 0,
            stats: BlockStats::default(),
            part_id: 0,
        }
    }
}

impl BinaryBinBlock {
    pub fn reset(&mut self) {
        self.block_type = BlockType::MultiSignature;
        self.signature = 0;
        self.descriptors.clear();
        self.aux_descriptors.clear();
        self.meta.clear();
        self.dna.clear();
        self.qua.clear();
        self.head.clear();
        self.raw_dna_size = 0;
        self.raw_head_size = 0;
        self.stats = BlockStats::default();
        self.part_id = 0;
    }

    /// Total records across all sub-bins.
    pub fn records_count(&self) -> u64 {
        match self.block_type {
            BlockType::MultiSignature => {
                self.descriptors.values().map(|d| d.records_count).sum()
            },
            BlockType::SingleSignature => {
                self.aux_descriptors.iter().map(|d| d.records_count).sum()
            },
        }
    }

    /// The descriptor-sum invariant: per-stream sizes must add up to the
    /// stream buffer lengths.
    pub fn check_consistency(&self) -> bool {
        let (meta, dna, qua, head) = match self.block_type {
            BlockType::MultiSignature => self.descriptors.values().fold(
                (0u64, 0u64, 0u64, 0u64),
                |acc, d| {
                    (acc.0 + d.meta_size,
                     acc.1 + d.dna_size,
                     acc.2 + d.qua_size,
                     acc.3 + d.head_size)
                },
            ),
            BlockType::SingleSignature => self.aux_descriptors.iter().fold(
                (0u64, 0u64, 0u64, 0u64),
                |acc, d| {
                    (acc.0 + d.meta_size,
                     acc.1 + d.dna_size,
                     acc.2 + d.qua_size,
                     acc.3 + d.head_size)
                },
            ),
        };
        meta == self.meta.len() as u64
            && dna == self.dna.len() as u64
            && qua == self.qua.len() as u64
            && head == self.head.len() as u64
    }
}
