//! Stage 2 packer: converts records to and from the four parallel bin
//! streams (meta/dna/qua/head).
//!
//! Per record the meta stream holds the reverse flag and signature position
//! (plus lengths and the pair-swap bit where applicable), the dna stream the
//! 2- or 3-bit packed bases with the signature bytes elided, the qua stream
//! the quality values in the width of the chosen method, and the head stream
//! the raw identifier at 7 bits per byte.
//!
//! Rebinned bins additionally carry *read groups*: a record may announce
//! that the following records form a tree transferred from another bin, in
//! which case those records are packed against the old bin's signature.

use std::collections::BTreeMap;

use crate::bin_block::{BinDescriptor, BinaryBinBlock, BlockType};
use crate::bitio::{BitReader, BitWriter};
use crate::categorizer::RecordBin;
use crate::error::*;
use crate::params::{BinModuleConfig, QualityMethod, BINARY_QUALITY_HIGH, BINARY_QUALITY_LOW,
                    LEN_BITS};
use crate::records::{FastqRecord, RecordStats};
use crate::util::bit_length;

/// Linkage of a tree carried over from a previous binning level: the next
/// `count` direct members belong to a tree rooted at the announcing record
/// and are packed against `signature`. A member announcing its own nested
/// group interposes that group's members without consuming extra slots
/// (see the rebinner).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ReadGroup {
    pub signature: u32,
    pub main_pos: u16,
    pub count: u32,
}

/// A record plus its group announcements (one per transferred tree). Each
/// group's members follow the announcing record, group by group, nested
/// groups included in their own counts only.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GroupedRecord {
    pub rec: FastqRecord,
    pub groups: Vec<ReadGroup>,
}

impl GroupedRecord {
    pub fn plain(rec: FastqRecord) -> Self {
        GroupedRecord { rec, groups: Vec::new() }
    }
}

/// Per-sub-bin packing settings, written as a small prelude in the meta
/// stream.
#[derive(Clone, Debug)]
struct PackSettings {
    min_len: u32,
    max_len: u32,
    has_const_len: bool,
    bits_per_len: u32,
    suffix_len: u32,
    uses_headers: bool,
    has_read_groups: bool,
}

struct StreamWriters {
    meta: BitWriter,
    dna: BitWriter,
    qua: BitWriter,
    head: BitWriter,
}

impl StreamWriters {
    fn new() -> Self {
        StreamWriters {
            meta: BitWriter::new(),
            dna: BitWriter::new(),
            qua: BitWriter::new(),
            head: BitWriter::new(),
        }
    }

    fn flush(&mut self) {
        self.meta.flush();
        self.dna.flush();
        self.qua.flush();
        self.head.flush();
    }

    fn positions(&self) -> (u64, u64, u64, u64) {
        (self.meta.position() as u64,
         self.dna.position() as u64,
         self.qua.position() as u64,
         self.head.position() as u64)
    }
}

fn dna_to_idx(base: u8) -> u64 {
    match base {
        b'A' => 0,
        b'C' => 1,
        b'G' => 2,
        b'T' => 3,
        _ => 4,
    }
}

const IDX_TO_DNA: [u8; 5] = [b'A', b'C', b'G', b'T', b'N'];

/// Packs records into bin streams and back.
pub struct RecordPacker {
    config: BinModuleConfig,
}

impl RecordPacker {
    pub fn new(config: BinModuleConfig) -> Self {
        RecordPacker { config }
    }

    pub fn config(&self) -> &BinModuleConfig {
        &self.config
    }

    /// Pack one batch of bins (the categorizer output) into a block.
    pub fn pack_bins(&self,
                     bins: BTreeMap<u32, RecordBin>,
                     block: &mut BinaryBinBlock)
                     -> FastoreResult<()> {
        block.reset();
        block.block_type = BlockType::MultiSignature;

        let n_bin = self.config.minimizer.n_bin_id();
        let mut writers = StreamWriters::new();

        for (sig, bin) in bins {
            debug_assert!(!bin.records.is_empty());
            let entries: Vec<GroupedRecord> =
                bin.records.into_iter().map(GroupedRecord::plain).collect();
            let mut desc = BinDescriptor::default();
            self.pack_sub_bin(&entries, &bin_stats(&entries), sig == n_bin,
                              &mut writers, &mut desc, &mut block.stats)?;
            block.raw_dna_size += desc.raw_dna_size;
            block.raw_head_size += desc.raw_head_size;
            block.descriptors.insert(sig, desc);
        }

        block.meta = std::mem::take(&mut writers.meta).into_inner();
        block.dna = std::mem::take(&mut writers.dna).into_inner();
        block.qua = std::mem::take(&mut writers.qua).into_inner();
        block.head = std::mem::take(&mut writers.head).into_inner();
        debug_assert!(block.check_consistency());
        Ok(())
    }

    /// Pack one batch of grouped-record bins (rebinner output and N-bin
    /// refills).
    pub fn pack_grouped_bins(&self,
                             bins: BTreeMap<u32, Vec<GroupedRecord>>,
                             block: &mut BinaryBinBlock)
                             -> FastoreResult<()> {
        block.reset();
        block.block_type = BlockType::MultiSignature;

        let n_bin = self.config.minimizer.n_bin_id();
        let mut writers = StreamWriters::new();

        for (sig, entries) in bins {
            debug_assert!(!entries.is_empty());
            let mut desc = BinDescriptor::default();
            self.pack_sub_bin(&entries, &bin_stats(&entries), sig == n_bin,
                              &mut writers, &mut desc, &mut block.stats)?;
            block.raw_dna_size += desc.raw_dna_size;
            block.raw_head_size += desc.raw_head_size;
            block.descriptors.insert(sig, desc);
        }

        block.meta = std::mem::take(&mut writers.meta).into_inner();
        block.dna = std::mem::take(&mut writers.dna).into_inner();
        block.qua = std::mem::take(&mut writers.qua).into_inner();
        block.head = std::mem::take(&mut writers.head).into_inner();
        debug_assert!(block.check_consistency());
        Ok(())
    }

    fn pack_sub_bin(&self,
                    entries: &[GroupedRecord],
                    stats: &RecordStats,
                    n_bin: bool,
                    writers: &mut StreamWriters,
                    desc: &mut BinDescriptor,
                    block_stats: &mut crate::bin_block::BlockStats)
                    -> FastoreResult<()> {
        let initial = writers.positions();

        let settings = PackSettings {
            min_len: stats.min_seq_len,
            max_len: stats.max_seq_len,
            has_const_len: stats.min_seq_len == stats.max_seq_len,
            bits_per_len: bit_length((stats.max_seq_len - stats.min_seq_len) as u64),
            suffix_len: if n_bin { 0 } else { self.config.minimizer.signature_len as u32 },
            uses_headers: self.config.archive_type.has_headers,
            has_read_groups: entries.iter().any(|e| !e.groups.is_empty()),
        };

        // sub-bin prelude
        writers.meta.put_bits(settings.min_len as u64, LEN_BITS);
        writers.meta.put_bits(settings.max_len as u64, LEN_BITS);
        writers.meta.put_bit(settings.has_read_groups);

        let paired = self.config.archive_type.paired_end;

        // group nesting depth bookkeeping (remaining member counts)
        let mut group_stack: Vec<u32> = Vec::new();

        for entry in entries {
            let rec = &entry.rec;
            debug_assert!(rec.seq_len() >= settings.min_len as usize);

            if !settings.has_const_len {
                writers.meta.put_bits((rec.seq_len() as u32 - settings.min_len) as u64,
                                      settings.bits_per_len);
                if paired {
                    writers.meta.put_bits((rec.aux_len as u32 - settings.min_len) as u64,
                                          settings.bits_per_len);
                }
            }
            if paired && settings.suffix_len != 0 {
                writers.meta.put_bit(rec.is_pair_swapped());
            }

            if settings.has_read_groups {
                for g in &entry.groups {
                    writers.meta.put_bit(true);
                    writers.meta.put_bits(g.signature as u64, 32);
                    writers.meta.put_bits(g.main_pos as u64, LEN_BITS);
                    writers.meta.put_bits(g.count as u64, 32);
                }
                writers.meta.put_bit(false);
            }

            let suffix = if n_bin { 0 } else { settings.suffix_len };

            self.store_half(writers, rec.seq_1(), rec.qua_1(), Some(&rec.head),
                            rec.minim_pos as usize, rec.is_reverse(), suffix,
                            settings.uses_headers);
            if paired {
                self.store_half(writers, rec.seq_2(), rec.qua_2(), None, 0, false, 0,
                                false);
            }

            desc.raw_dna_size += rec.full_len() as u64;
            desc.raw_head_size += rec.head.len() as u64;
            desc.records_count += 1;

            // collect global stats for the footer
            block_stats.records.update(rec);
            if settings.uses_headers {
                block_stats.headers.update(&rec.head)?;
            }
            if self.config.quality.method == QualityMethod::Qvz {
                let offset = self.config.archive_type.quality_offset;
                let normalized: Vec<u8> =
                    rec.qua.iter().map(|&q| q.wrapping_sub(offset)).collect();
                block_stats.quality.update(&normalized);
            }

            // a record consumes one slot of the innermost open group; its
            // own groups open on top of the stack (counts are direct members)
            if let Some(remaining) = group_stack.last_mut() {
                *remaining -= 1;
            }
            for g in entry.groups.iter().rev() {
                if g.count > 0 {
                    group_stack.push(g.count);
                }
            }
            while group_stack.last().map(|&r| r == 0).unwrap_or(false) {
                group_stack.pop();
            }
        }
        debug_assert!(group_stack.is_empty());

        writers.flush();
        let done = writers.positions();
        desc.meta_size = done.0 - initial.0;
        desc.dna_size = done.1 - initial.1;
        desc.qua_size = done.2 - initial.2;
        desc.head_size = done.3 - initial.3;
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn store_half(&self,
                  writers: &mut StreamWriters,
                  seq: &[u8],
                  qua: &[u8],
                  head: Option<&[u8]>,
                  minim_pos: usize,
                  is_reverse: bool,
                  suffix_len: u32,
                  uses_headers: bool) {
        let has_minimizer = suffix_len != 0;
        if has_minimizer {
            writers.meta.put_bit(is_reverse);
            writers.meta.put_bits(minim_pos as u64, LEN_BITS);
        } else {
            debug_assert!(!is_reverse);
            debug_assert_eq!(0, minim_pos);
        }

        // sequence: skip the signature bytes, implicit from the bin id
        let is_plain = !seq.contains(&b'N');
        writers.meta.put_bit(is_plain);
        let bits = if is_plain { 2 } else { 3 };
        let sig_end = minim_pos + suffix_len as usize;
        for (i, &base) in seq.iter().enumerate() {
            if has_minimizer && i >= minim_pos && i < sig_end {
                continue;
            }
            writers.dna.put_bits(dna_to_idx(base), bits);
        }

        // quality in the width of the archive's method
        let offset = self.config.archive_type.quality_offset;
        match self.config.quality.method {
            QualityMethod::Binary => {
                let threshold = self.config.quality.binary_threshold;
                for &q in qua {
                    writers.qua.put_bit(q.wrapping_sub(offset) >= threshold);
                }
            },
            method => {
                let qbits = method.bits_per_base();
                for &q in qua {
                    let v = q.wrapping_sub(offset);
                    let v = if method == QualityMethod::Illumina8 {
                        crate::quality::qua_to_idx_8bin(v)
                    } else {
                        v
                    };
                    writers.qua.put_bits(v as u64, qbits);
                }
            },
        }

        if uses_headers {
            let head = head.unwrap_or(&[]);
            debug_assert!(!head.is_empty() && head[0] == b'@');
            writers.head.put_bits(head.len() as u64, 8);
            for &b in &head[1..] {
                writers.head.put_bits(b as u64, 7);
            }
        }
    }

    /// Unpack a single-signature block back into records; group linkage is
    /// preserved on the returned entries.
    pub fn unpack_block(&self, block: &BinaryBinBlock) -> FastoreResult<Vec<GroupedRecord>> {
        debug_assert_eq!(BlockType::SingleSignature, block.block_type);

        let n_bin = block.signature == self.config.minimizer.n_bin_id();
        let bin_sig_str = self.config.minimizer.signature_string(block.signature);
        let paired = self.config.archive_type.paired_end;
        let uses_headers = self.config.archive_type.has_headers;

        let mut meta = BitReader::new(&block.meta);
        let mut dna = BitReader::new(&block.dna);
        let mut qua = BitReader::new(&block.qua);
        let mut head = BitReader::new(&block.head);

        let total: u64 = block.aux_descriptors.iter().map(|d| d.records_count).sum();
        let mut out = Vec::with_capacity(total as usize);

        for desc in &block.aux_descriptors {
            let initial = (meta.position(), dna.position(), qua.position(), head.position());

            let min_len = meta.get_bits(LEN_BITS) as u32;
            let max_len = meta.get_bits(LEN_BITS) as u32;
            let has_read_groups = meta.get_bit();
            if min_len == 0 || max_len < min_len {
                return Err(FastoreError::CorruptedFile(
                    "invalid sub-bin length prelude".to_string(),
                ));
            }
            let has_const_len = min_len == max_len;
            let bits_per_len = bit_length((max_len - min_len) as u64);
            let suffix_len =
                if n_bin { 0 } else { self.config.minimizer.signature_len as u32 };

            let mut group_stack: Vec<(u32, Vec<u8>)> = Vec::new();

            for _ in 0..desc.records_count {
                let (seq_len, aux_len) = if has_const_len {
                    (min_len, if paired { min_len } else { 0 })
                } else {
                    let s = meta.get_bits(bits_per_len) as u32 + min_len;
                    let a = if paired {
                        meta.get_bits(bits_per_len) as u32 + min_len
                    } else {
                        0
                    };
                    (s, a)
                };

                let mut rec = FastqRecord::default();
                rec.aux_len = aux_len as u16;

                if paired && suffix_len != 0 {
                    rec.set_pair_swapped(meta.get_bit());
                }

                let mut groups = Vec::new();
                if has_read_groups {
                    while meta.get_bit() {
                        groups.push(ReadGroup {
                            signature: meta.get_bits(32) as u32,
                            main_pos: meta.get_bits(LEN_BITS) as u16,
                            count: meta.get_bits(32) as u32,
                        });
                    }
                }

                let sig_str = group_stack
                    .last()
                    .map(|(_, s)| s.clone())
                    .unwrap_or_else(|| bin_sig_str.clone());

                let (seq1, qua1, head1, minim_pos, is_rev) = self.read_half(
                    &mut meta, &mut dna, &mut qua, &mut head,
                    seq_len as usize, suffix_len, uses_headers, &sig_str)?;
                rec.minim_pos = minim_pos;
                rec.set_reverse(is_rev);
                rec.seq = seq1;
                rec.qua = qua1;
                rec.head = head1;

                if paired {
                    let (seq2, qua2, _, _, _) = self.read_half(
                        &mut meta, &mut dna, &mut qua, &mut head,
                        aux_len as usize, 0, false, &sig_str)?;
                    rec.seq.extend_from_slice(&seq2);
                    rec.qua.extend_from_slice(&qua2);
                }

                if let Some((remaining, _)) = group_stack.last_mut() {
                    *remaining -= 1;
                }
                for g in groups.iter().rev() {
                    if g.count > 0 {
                        group_stack.push(
                            (g.count, self.config.minimizer.signature_string(g.signature)));
                    }
                }
                while group_stack.last().map(|&(r, _)| r == 0).unwrap_or(false) {
                    group_stack.pop();
                }

                out.push(GroupedRecord { rec, groups });
            }

            meta.align();
            dna.align();
            qua.align();
            head.align();

            let consumed = (meta.position() - initial.0,
                            dna.position() - initial.1,
                            qua.position() - initial.2,
                            head.position() - initial.3);
            if consumed
                != (desc.meta_size as usize,
                    desc.dna_size as usize,
                    desc.qua_size as usize,
                    desc.head_size as usize)
            {
                return Err(FastoreError::CorruptedFile(
                    "sub-bin stream sizes do not match its descriptor".to_string(),
                ));
            }
        }

        Ok(out)
    }

    #[allow(clippy::too_many_arguments, clippy::type_complexity)]
    fn read_half(&self,
                 meta: &mut BitReader,
                 dna: &mut BitReader,
                 qua: &mut BitReader,
                 head: &mut BitReader,
                 seq_len: usize,
                 suffix_len: u32,
                 uses_headers: bool,
                 sig_str: &[u8])
                 -> FastoreResult<(Vec<u8>, Vec<u8>, Vec<u8>, u16, bool)> {
        let has_minimizer = suffix_len != 0;
        let (is_rev, minim_pos) = if has_minimizer {
            let rev = meta.get_bit();
            let pos = meta.get_bits(LEN_BITS) as usize;
            (rev, pos)
        } else {
            (false, 0)
        };
        if minim_pos + suffix_len as usize > seq_len {
            return Err(FastoreError::CorruptedFile(
                "signature position beyond read end".to_string(),
            ));
        }

        let is_plain = meta.get_bit();
        let bits = if is_plain { 2 } else { 3 };
        let mut seq = vec![0u8; seq_len];
        let sig_end = minim_pos + suffix_len as usize;
        for (i, slot) in seq.iter_mut().enumerate() {
            if has_minimizer && i >= minim_pos && i < sig_end {
                *slot = sig_str[i - minim_pos];
            } else {
                let idx = dna.get_bits(bits) as usize;
                if idx > 4 {
                    return Err(FastoreError::CorruptedFile(
                        "invalid packed base".to_string(),
                    ));
                }
                *slot = IDX_TO_DNA[idx];
            }
        }

        let offset = self.config.archive_type.quality_offset;
        let mut quality = vec![0u8; seq_len];
        match self.config.quality.method {
            QualityMethod::Binary => {
                for slot in quality.iter_mut() {
                    let high = qua.get_bit();
                    *slot = offset
                        + if high { BINARY_QUALITY_HIGH } else { BINARY_QUALITY_LOW };
                }
            },
            QualityMethod::Illumina8 => {
                for slot in quality.iter_mut() {
                    let idx = qua.get_bits(3) as usize;
                    *slot = offset + crate::quality::IDX_TO_QUA_8BIN[idx];
                }
            },
            method => {
                let qbits = method.bits_per_base();
                for slot in quality.iter_mut() {
                    *slot = offset + qua.get_bits(qbits) as u8;
                }
            },
        }

        let mut header = Vec::new();
        if uses_headers {
            let head_len = head.get_bits(8) as usize;
            if head_len == 0 {
                return Err(FastoreError::CorruptedFile("empty identifier".to_string()));
            }
            header.resize(head_len, 0);
            header[0] = b'@';
            for slot in header.iter_mut().skip(1) {
                *slot = head.get_bits(7) as u8;
            }
        }

        Ok((seq, quality, header, minim_pos as u16, is_rev))
    }
}

fn bin_stats(entries: &[GroupedRecord]) -> RecordStats {
    let mut stats = RecordStats::default();
    for e in entries {
        stats.update(&e.rec);
    }
    stats
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::bin_block::BlockType;
    use crate::categorizer::Categorizer;
    use crate::params::{CategorizerParams, MinimizerParams};
    use crate::records::compare_records;

    fn config() -> BinModuleConfig {
        BinModuleConfig::default()
    }

    fn rec(seq: &[u8]) -> FastqRecord {
        FastqRecord::new(seq.to_vec(), vec![b'I'; seq.len()], Vec::new())
    }

    /// Convert a packed multi-signature block into per-signature
    /// single-signature blocks, the way the bin file reader would.
    fn split_block(block: &BinaryBinBlock) -> Vec<BinaryBinBlock> {
        let mut out = Vec::new();
        let mut offsets = (0usize, 0usize, 0usize, 0usize);
        for (&sig, desc) in &block.descriptors {
            let mut single = BinaryBinBlock {
                block_type: BlockType::SingleSignature,
                signature: sig,
                ..BinaryBinBlock::default()
            };
            single.meta =
                block.meta[offsets.0..offsets.0 + desc.meta_size as usize].to_vec();
            single.dna = block.dna[offsets.1..offsets.1 + desc.dna_size as usize].to_vec();
            single.qua = block.qua[offsets.2..offsets.2 + desc.qua_size as usize].to_vec();
            single.head =
                block.head[offsets.3..offsets.3 + desc.head_size as usize].to_vec();
            single.aux_descriptors.push(*desc);
            offsets.0 += desc.meta_size as usize;
            offsets.1 += desc.dna_size as usize;
            offsets.2 += desc.qua_size as usize;
            offsets.3 += desc.head_size as usize;
            out.push(single);
        }
        out
    }

    #[test]
    fn bin_conservation_roundtrip() {
        let categorizer =
            Categorizer::new(MinimizerParams::default(), CategorizerParams::default());
        let reads: Vec<FastqRecord> = vec![
            rec(b"ACGTACGTACGTACGTACGT"),
            rec(b"TTGCACGTACGTACGTAGGA"),
            rec(b"GGGGCCCCTTTTGGGGCCCC"),
            rec(b"CATCATCATCATCATCATCA"),
            rec(b"NNNNNNNNNNNNNNNNNNNN"),
        ];
        let originals: Vec<Vec<u8>> = reads.iter().map(|r| r.seq.clone()).collect();

        let bins = categorizer.categorize(reads);
        let packer = RecordPacker::new(config());
        let mut block = BinaryBinBlock::default();
        packer.pack_bins(bins, &mut block).unwrap();
        assert!(block.check_consistency());

        let mut decoded = Vec::new();
        for single in split_block(&block) {
            for entry in packer.unpack_block(&single).unwrap() {
                let mut r = entry.rec;
                if r.is_reverse() {
                    r.apply_rc();
                }
                decoded.push(r.seq);
            }
        }

        let mut expected = originals;
        expected.sort();
        decoded.sort();
        assert_eq!(expected, decoded);
    }

    #[test]
    fn variable_length_bins_roundtrip() {
        let packer = RecordPacker::new(config());
        let mut bins = BTreeMap::new();
        let mut bin = RecordBin::default();
        let mut a = rec(b"ACGTACGTCCAA");
        a.minim_pos = 0;
        let mut b = rec(b"ACGTACGTCCAATTGGCCAA");
        b.minim_pos = 0;
        bin.push(a.clone());
        bin.push(b.clone());
        bins.insert(1234u32, bin);

        let mut block = BinaryBinBlock::default();
        packer.pack_bins(bins, &mut block).unwrap();
        let singles = split_block(&block);
        let decoded = packer.unpack_block(&singles[0]).unwrap();
        // the signature bytes are reconstructed from the bin id, the rest of
        // the sequence byte-exact
        assert_eq!(2, decoded.len());
        assert_eq!(a.seq[8..], decoded[0].rec.seq[8..]);
        assert_eq!(b.seq[8..], decoded[1].rec.seq[8..]);
        assert_eq!(a.qua, decoded[0].rec.qua);
    }

    #[test]
    fn headers_roundtrip() {
        let mut cfg = config();
        cfg.archive_type.has_headers = true;
        let packer = RecordPacker::new(cfg);

        let mut bins = BTreeMap::new();
        let mut bin = RecordBin::default();
        let mut r = rec(b"CGCGTATACGCGTATA");
        r.head = b"@SRR001.1".to_vec();
        r.minim_pos = 2;
        bin.push(r.clone());
        bins.insert(77u32, bin);

        let mut block = BinaryBinBlock::default();
        packer.pack_bins(bins, &mut block).unwrap();
        let singles = split_block(&block);
        let decoded = packer.unpack_block(&singles[0]).unwrap();
        assert_eq!(r.head, decoded[0].rec.head);
    }

    #[test]
    fn paired_end_roundtrip_preserves_swap() {
        let mut cfg = config();
        cfg.archive_type.paired_end = true;
        let packer = RecordPacker::new(cfg);

        let mut bins = BTreeMap::new();
        let mut bin = RecordBin::default();
        let mut r = rec(b"ACGTACGTTTCCACGTACGTGGAA");
        r.aux_len = 12;
        r.minim_pos = 0;
        r.set_pair_swapped(true);
        bin.push(r.clone());
        bins.insert(99u32, bin);

        let mut block = BinaryBinBlock::default();
        packer.pack_bins(bins, &mut block).unwrap();
        let singles = split_block(&block);
        let decoded = packer.unpack_block(&singles[0]).unwrap();
        assert!(decoded[0].rec.is_pair_swapped());
        assert_eq!(r.seq_2(), decoded[0].rec.seq_2());
        assert_eq!(12, decoded[0].rec.aux_len);
    }

    #[test]
    fn read_groups_roundtrip() {
        let packer = RecordPacker::new(config());
        let minim = MinimizerParams::default();

        // root in the new bin, two members still packed against the old bin
        let old_sig = 0x1011u32;
        let old_str = minim.signature_string(old_sig);
        let mut root = rec(b"CGCGTATACGCGTATACGCG");
        root.minim_pos = 2;

        let mut m1 = rec(b"TTTTTTTTTTTTTTTTTTTT");
        m1.seq[4..12].copy_from_slice(&old_str);
        m1.minim_pos = 4;
        let mut m2 = rec(b"GGGGGGGGGGGGGGGGGGGG");
        m2.seq[6..14].copy_from_slice(&old_str);
        m2.minim_pos = 6;

        let entries = vec![
            GroupedRecord {
                rec: root.clone(),
                groups: vec![ReadGroup { signature: old_sig, main_pos: 4, count: 2 }],
            },
            GroupedRecord::plain(m1.clone()),
            GroupedRecord::plain(m2.clone()),
        ];

        let mut bins = BTreeMap::new();
        bins.insert(5060u32, entries);
        let mut block = BinaryBinBlock::default();
        packer.pack_grouped_bins(bins, &mut block).unwrap();

        let singles = split_block(&block);
        let decoded = packer.unpack_block(&singles[0]).unwrap();
        assert_eq!(3, decoded.len());
        assert_eq!(1, decoded[0].groups.len());
        let g = decoded[0].groups[0];
        assert_eq!(old_sig, g.signature);
        assert_eq!(4, g.main_pos);
        assert_eq!(2, g.count);
        // member sequences keep the old signature bytes
        assert_eq!(m1.seq, decoded[1].rec.seq);
        assert_eq!(m2.seq, decoded[2].rec.seq);
        assert!(decoded[1].groups.is_empty());
    }

    #[test]
    fn sorted_unpack_matches_comparator() {
        // packing order is bin order, comparator still applies to the output
        let packer = RecordPacker::new(config());
        let mut bins = BTreeMap::new();
        let mut bin = RecordBin::default();
        for seq in [&b"CGTATTTTACGCGTAT"[..], b"CGTAGGGGACGCGTAT"] {
            let mut r = rec(seq);
            r.minim_pos = 8;
            bin.push(r);
        }
        bins.insert(3000u32, bin);
        let mut block = BinaryBinBlock::default();
        packer.pack_bins(bins, &mut block).unwrap();
        let singles = split_block(&block);
        let mut decoded: Vec<FastqRecord> = packer
            .unpack_block(&singles[0])
            .unwrap()
            .into_iter()
            .map(|e| e.rec)
            .collect();
        decoded.sort_by(compare_records);
        assert_eq!(2, decoded.len());
    }
}
