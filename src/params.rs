//! Parameter blocks shared across the binning, rebinning and packing stages.
//!
//! The configuration structs are serde-derived so that they can be embedded
//! verbatim (via bincode) into the bin-file and archive footers.

use serde::{Deserialize, Serialize};

/// Maximum supported read length (sequence and quality).
pub const MAX_SEQ_LEN: usize = 255;
/// Maximum supported identifier length.
pub const MAX_HEAD_LEN: usize = 255;
/// Bits used to store read lengths and signature positions in bin streams.
pub const LEN_BITS: u32 = 8;

/// Signature (minimizer) selection parameters.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct MinimizerParams {
    pub signature_len: u8,
    pub skip_zone_len: u8,
    pub mask_cutoff_bits: u8,
}

impl Default for MinimizerParams {
    fn default() -> Self {
        MinimizerParams {
            signature_len: 8,
            skip_zone_len: 0,
            mask_cutoff_bits: 0,
        }
    }
}

impl MinimizerParams {
    /// Total number of distinct signatures, i.e. `4^signature_len`.
    pub fn total_signatures(&self) -> u32 {
        1u32 << (2 * self.signature_len as u32)
    }

    /// The reserved id of the N-bin.
    pub fn n_bin_id(&self) -> u32 {
        self.total_signatures()
    }

    /// Decode a signature id back into its DNA k-mer; the N-bin id yields `N^L`.
    pub fn signature_string(&self, mut id: u32) -> Vec<u8> {
        const SYMBOLS: [u8; 4] = [b'A', b'C', b'G', b'T'];
        let len = self.signature_len as usize;
        if id == self.n_bin_id() {
            return vec![b'N'; len];
        }
        let mut buf = vec![0u8; len];
        for i in (0..len).rev() {
            buf[i] = SYMBOLS[(id & 0x3) as usize];
            id >>= 2;
        }
        buf
    }

    /// Signature of the reverse complement: complement each symbol and
    /// reverse the symbol order.
    pub fn reverse_signature(&self, mut sig: u32) -> u32 {
        let mut rev = 0u32;
        for _ in 0..self.signature_len {
            rev <<= 2;
            rev |= 3 - (sig & 0x3);
            sig >>= 2;
        }
        rev
    }
}

/// Quality-stream compression method, selected once per archive.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub enum QualityMethod {
    /// Lossless 6-bit pass-through.
    None,
    /// One bit per base against a threshold.
    Binary,
    /// Illumina 8-bucket lookup table, 3 bits per base.
    Illumina8,
    /// Columnar adaptive quantizer with shared RNG state.
    Qvz,
}

impl QualityMethod {
    pub fn from_cli(v: u32) -> Option<QualityMethod> {
        match v {
            0 => Some(QualityMethod::None),
            1 => Some(QualityMethod::Binary),
            2 => Some(QualityMethod::Illumina8),
            3 => Some(QualityMethod::Qvz),
            _ => None,
        }
    }

    /// Bits per base used by the bin-file packer for this method.
    pub fn bits_per_base(&self) -> u32 {
        match *self {
            QualityMethod::None => 6,
            QualityMethod::Binary => 1,
            QualityMethod::Illumina8 => 3,
            QualityMethod::Qvz => 6,
        }
    }
}

/// Quality compression parameters.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct QualityParams {
    pub method: QualityMethod,
    /// Threshold for [`QualityMethod::Binary`], in the 0..64 scale.
    pub binary_threshold: u8,
}

/// Reconstruction values used when decoding binary-thresholded qualities.
pub const BINARY_QUALITY_LOW: u8 = 1;
pub const BINARY_QUALITY_HIGH: u8 = 40;

impl Default for QualityParams {
    fn default() -> Self {
        QualityParams {
            method: QualityMethod::None,
            binary_threshold: 20,
        }
    }
}

/// Global archive shape: single- vs paired-end, quality scale, headers.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct ArchiveType {
    pub paired_end: bool,
    pub quality_offset: u8,
    pub has_headers: bool,
}

impl Default for ArchiveType {
    fn default() -> Self {
        ArchiveType {
            paired_end: false,
            quality_offset: 33,
            has_headers: false,
        }
    }
}

/// Identifier handling parameters.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct HeadersParams {
    pub preserve_comments: bool,
}

impl Default for HeadersParams {
    fn default() -> Self {
        HeadersParams { preserve_comments: true }
    }
}

/// Categorizer parameters.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct CategorizerParams {
    /// Bins smaller than this per batch are held back and merged into later
    /// batches; leftovers are demoted to the N-bin on flush.
    pub min_bin_size: u32,
}

impl Default for CategorizerParams {
    fn default() -> Self {
        CategorizerParams { min_bin_size: 8 }
    }
}

/// Configuration of the binning stage, stored verbatim in the bin-file footer.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct BinModuleConfig {
    pub archive_type: ArchiveType,
    pub categorizer: CategorizerParams,
    pub minimizer: MinimizerParams,
    pub quality: QualityParams,
    pub headers: HeadersParams,
    /// FASTQ input batch size in bytes.
    pub fastq_block_size: u64,
    /// Binning level l: valid signatures are the multiples of 2^l.
    pub binning_level: u32,
}

impl Default for BinModuleConfig {
    fn default() -> Self {
        BinModuleConfig {
            archive_type: ArchiveType::default(),
            categorizer: CategorizerParams::default(),
            minimizer: MinimizerParams::default(),
            quality: QualityParams::default(),
            headers: HeadersParams::default(),
            fastq_block_size: 1 << 28,
            binning_level: 0,
        }
    }
}

/// LZ read-classifier parameters.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct ClassifierParams {
    /// 0 selects the automatic threshold `seq_len / 2`.
    pub encode_threshold: i32,
    pub shift_cost: i32,
    pub mismatch_cost: i32,
    pub lz_window: usize,
    pub pair_lz_window: usize,
    pub extra_reduce_hard_reads: bool,
    pub extra_reduce_expensive_lz: bool,
}

impl Default for ClassifierParams {
    fn default() -> Self {
        ClassifierParams {
            encode_threshold: 0,
            shift_cost: 1,
            mismatch_cost: 2,
            lz_window: 255,
            pair_lz_window: 4096,
            extra_reduce_hard_reads: false,
            extra_reduce_expensive_lz: false,
        }
    }
}

/// Consensus-contig builder parameters.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct ContigParams {
    pub begin_cut: u32,
    pub end_cut: u32,
    pub max_new_variants_per_read: u32,
    /// 0 selects the automatic limit `seq_len / 2`.
    pub max_record_shift_difference: u32,
    pub max_hamming_distance: u32,
    pub min_consensus_size: usize,
}

impl Default for ContigParams {
    fn default() -> Self {
        ContigParams {
            begin_cut: 2,
            end_cut: 2,
            max_new_variants_per_read: 1,
            max_record_shift_difference: 0,
            max_hamming_distance: 8,
            min_consensus_size: 10,
        }
    }
}

/// Configuration of the packing stage.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct CompressorParams {
    pub archive_type: ArchiveType,
    pub minimizer: MinimizerParams,
    pub quality: QualityParams,
    pub classifier: ClassifierParams,
    pub contig: ContigParams,
    /// Bins with fewer records go through the raw store together with the N-bin.
    pub min_bin_size: u64,
    /// LZ matches with more mismatches use the plain binary match stream
    /// instead of the RLE one.
    pub max_mismatches_low_cost: u32,
}

impl Default for CompressorParams {
    fn default() -> Self {
        CompressorParams {
            archive_type: ArchiveType::default(),
            minimizer: MinimizerParams::default(),
            quality: QualityParams::default(),
            classifier: ClassifierParams::default(),
            contig: ContigParams::default(),
            min_bin_size: 256,
            max_mismatches_low_cost: 4,
        }
    }
}

/// Rebinning parameters.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct RebinParams {
    /// Target parity: reads move to bins whose signature is divisible by it.
    pub signature_parity: u32,
    /// Trees at most this big are dissolved into independent records.
    pub min_tree_size: u64,
    /// Pick the new root at the extreme signature position instead of
    /// keeping the current root.
    pub select_max_edge_read: bool,
    pub classifier: ClassifierParams,
}

impl Default for RebinParams {
    fn default() -> Self {
        RebinParams {
            signature_parity: 2,
            min_tree_size: 4,
            select_max_edge_read: true,
            classifier: ClassifierParams::default(),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn signature_strings() {
        let p = MinimizerParams { signature_len: 4, ..MinimizerParams::default() };
        assert_eq!(b"AAAA".to_vec(), p.signature_string(0));
        assert_eq!(b"AAAT".to_vec(), p.signature_string(3));
        assert_eq!(b"TTTT".to_vec(), p.signature_string(p.total_signatures() - 1));
        assert_eq!(b"NNNN".to_vec(), p.signature_string(p.n_bin_id()));
    }

    #[test]
    fn signature_reversal() {
        let p = MinimizerParams { signature_len: 4, ..MinimizerParams::default() };
        // ACGT -> ACGT (palindromic under reverse complement)
        let acgt = 0b00_01_10_11;
        assert_eq!(acgt, p.reverse_signature(acgt));
        // AAAA -> TTTT
        assert_eq!(0b11_11_11_11, p.reverse_signature(0));
        // applying it twice is the identity
        for sig in [0u32, 1, 17, 255, 128] {
            assert_eq!(sig, p.reverse_signature(p.reverse_signature(sig)));
        }
    }

    #[test]
    fn quality_bits() {
        assert_eq!(6, QualityMethod::None.bits_per_base());
        assert_eq!(1, QualityMethod::Binary.bits_per_base());
        assert_eq!(3, QualityMethod::Illumina8.bits_per_base());
    }
}
