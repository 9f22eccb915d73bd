//! Stage 1: assignment of reads to signature bins.
//!
//! Every length-L window of a read (and of its reverse complement) is a
//! candidate signature; the lexicographically smallest *valid* one wins and
//! the read is stored in that bin, reverse-complemented if the winning
//! window came from the reverse strand. Paired-end reads additionally swap
//! mates so that the mate carrying the winning signature is always first.

use std::collections::BTreeMap;

use crate::params::{CategorizerParams, MinimizerParams};
use crate::records::{FastqRecord, RecordStats};

/// A bin of records sharing one signature.
#[derive(Default, Debug)]
pub struct RecordBin {
    pub records: Vec<FastqRecord>,
    pub stats: RecordStats,
}

impl RecordBin {
    pub fn push(&mut self, rec: FastqRecord) {
        self.stats.update(&rec);
        self.records.push(rec);
    }
}

/// Precomputed validity bitmap over all `4^L` signatures.
///
/// A signature is valid iff its low `mask_cutoff_bits` are zero, its top
/// three symbols are neither `AAA` nor `AAC`, and no aligned dinucleotide
/// window is `AA`.
pub struct SignatureValidator {
    valid: Vec<bool>,
}

impl SignatureValidator {
    pub fn new(params: &MinimizerParams) -> Self {
        let len = params.signature_len as u32;
        assert!((3..=15).contains(&len), "unsupported signature length");

        let total = 1usize << (2 * len);
        let lo_mask = (1u32 << params.mask_cutoff_bits) - 1;
        let mut valid = vec![false; total];

        for (sig, slot) in valid.iter_mut().enumerate() {
            let sig = sig as u32;
            let mut invalid = (sig & lo_mask) != 0;

            let top = sig >> (2 * len - 6);
            invalid |= top == 0b000000 || top == 0b000001;

            let mut m = sig;
            for _ in 0..len.saturating_sub(2) {
                if invalid {
                    break;
                }
                invalid |= (m & 0b1111) == 0;
                m >>= 2;
            }

            *slot = !invalid;
        }

        SignatureValidator { valid }
    }

    pub fn is_valid(&self, sig: u32) -> bool {
        self.valid.get(sig as usize).copied().unwrap_or(false)
    }
}

/// Distributes reads into signature bins.
pub struct Categorizer {
    params: MinimizerParams,
    cat_params: CategorizerParams,
    validator: SignatureValidator,
    n_bin: u32,
}

fn symbol_index(base: u8) -> Option<u32> {
    match base {
        b'A' => Some(0),
        b'C' => Some(1),
        b'G' => Some(2),
        b'T' => Some(3),
        _ => None,
    }
}

impl Categorizer {
    pub fn new(params: MinimizerParams, cat_params: CategorizerParams) -> Self {
        let validator = SignatureValidator::new(&params);
        let n_bin = params.n_bin_id();
        Categorizer {
            params,
            cat_params,
            validator,
            n_bin,
        }
    }

    pub fn params(&self) -> &MinimizerParams {
        &self.params
    }

    pub fn n_bin_id(&self) -> u32 {
        self.n_bin
    }

    pub fn validator(&self) -> &SignatureValidator {
        &self.validator
    }

    /// Signature value of one window, or the N-bin id if it contains an N.
    pub fn compute_signature(&self, window: &[u8]) -> u32 {
        let mut sig = 0u32;
        for &base in window {
            match symbol_index(base) {
                Some(idx) => sig = (sig << 2) | idx,
                None => return self.n_bin,
            }
        }
        sig
    }

    /// Find the smallest valid signature in `seq` together with its position.
    /// Returns `(n_bin, 0)` when no window qualifies or the read is N-heavy.
    pub fn find_minimizer(&self, seq: &[u8]) -> (u32, u16) {
        let sig_len = self.params.signature_len as usize;
        let skip = self.params.skip_zone_len as usize;

        let mut best = self.n_bin;
        let mut pos = 0u16;

        let end = seq.len().saturating_sub(sig_len + skip);
        for i in 0..end {
            let sig = self.compute_signature(&seq[i..i + sig_len]);
            if sig < best && self.validator.is_valid(sig) {
                best = sig;
                pos = i as u16;
            }
        }

        let n_count = seq.iter().filter(|&&b| b == b'N').count();
        if best >= self.n_bin || n_count >= seq.len() / 3 {
            (self.n_bin, 0)
        } else {
            (best, pos)
        }
    }

    /// Distribute a batch of single-end records into bins, applying the
    /// reverse complement in place when the reverse strand won.
    pub fn categorize(&self, records: Vec<FastqRecord>) -> BTreeMap<u32, RecordBin> {
        let mut bins: BTreeMap<u32, RecordBin> = BTreeMap::new();

        for mut rec in records {
            rec.set_reverse(false);
            rec.minim_pos = 0;

            let (sig, pos, reverse) = if rec.aux_len == 0 {
                self.select_se(&rec)
            } else {
                self.select_pe(&mut rec)
            };

            if sig != self.n_bin {
                if reverse {
                    rec.apply_rc();
                }
                rec.minim_pos = pos;
            } else {
                rec.minim_pos = 0;
                rec.set_reverse(false);
            }

            bins.entry(sig).or_default().push(rec);
        }

        bins
    }

    fn select_se(&self, rec: &FastqRecord) -> (u32, u16, bool) {
        let fwd = self.find_minimizer(&rec.seq);
        let rev = self.find_minimizer(&rec.rc_seq());

        if fwd.0 <= rev.0 {
            (fwd.0, fwd.1, false)
        } else {
            (rev.0, rev.1, true)
        }
    }

    /// Choose the global minimum across both mates and both orientations and
    /// swap the mates when mate 2 carries the winner.
    fn select_pe(&self, rec: &mut FastqRecord) -> (u32, u16, bool) {
        debug_assert_eq!(rec.seq_len(), rec.aux_len as usize);

        let rc = rec.rc_seq();
        let half = rec.seq_len();

        let fwd_1 = self.find_minimizer(rec.seq_1());
        let fwd_2 = self.find_minimizer(rec.seq_2());
        let rev_1 = self.find_minimizer(&rc[..half]);
        let rev_2 = self.find_minimizer(&rc[half..]);

        let (fwd, fwd_is_first) = if fwd_1.0 < fwd_2.0 { (fwd_1, true) } else { (fwd_2, false) };
        let (rev, rev_is_first) = if rev_1.0 < rev_2.0 { (rev_1, true) } else { (rev_2, false) };

        let (winner, reverse, is_first) = if fwd.0 < rev.0 {
            (fwd, false, fwd_is_first)
        } else {
            (rev, true, rev_is_first)
        };

        if winner.0 == self.n_bin {
            return (self.n_bin, 0, false);
        }

        if reverse {
            rec.apply_rc();
        }
        if !is_first {
            rec.swap_mates();
        }

        // RC and swap already applied here, the caller must not re-apply
        (winner.0, winner.1, false)
    }

    /// Batch threshold below which bins are deferred.
    pub fn min_bin_size(&self) -> usize {
        self.cat_params.min_bin_size as usize
    }
}

/// Holds back small bins across successive batches and demotes whatever is
/// still below the threshold at shutdown to the N-bin.
pub struct SmallBinBuffer {
    overflow: BTreeMap<u32, RecordBin>,
    min_size: usize,
    n_bin: u32,
}

impl SmallBinBuffer {
    pub fn new(min_size: usize, n_bin: u32) -> Self {
        SmallBinBuffer {
            overflow: BTreeMap::new(),
            min_size,
            n_bin,
        }
    }

    /// Merge deferred records into `bins` and extract the still-small bins.
    pub fn filter(&mut self, bins: &mut BTreeMap<u32, RecordBin>) {
        let deferred = std::mem::take(&mut self.overflow);
        for (sig, bin) in deferred {
            let entry = bins.entry(sig).or_default();
            for rec in bin.records {
                entry.push(rec);
            }
        }

        let small: Vec<u32> = bins
            .iter()
            .filter(|&(&sig, bin)| sig != self.n_bin && bin.records.len() < self.min_size)
            .map(|(&sig, _)| sig)
            .collect();

        for sig in small {
            let bin = bins.remove(&sig).unwrap();
            self.overflow.insert(sig, bin);
        }
    }

    /// Demote all remaining deferred records to the N-bin, canonicalized.
    pub fn flush(&mut self) -> Option<RecordBin> {
        if self.overflow.is_empty() {
            return None;
        }
        let mut n_bin = RecordBin::default();
        let overflow = std::mem::take(&mut self.overflow);
        for (_, bin) in overflow {
            for mut rec in bin.records {
                rec.canonicalize();
                n_bin.push(rec);
            }
        }
        Some(n_bin)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn params(len: u8) -> MinimizerParams {
        MinimizerParams {
            signature_len: len,
            skip_zone_len: 0,
            mask_cutoff_bits: 0,
        }
    }

    fn categorizer() -> Categorizer {
        Categorizer::new(params(8), CategorizerParams::default())
    }

    fn rec(seq: &[u8]) -> FastqRecord {
        FastqRecord::new(seq.to_vec(), vec![b'!'; seq.len()], Vec::new())
    }

    #[test]
    fn validity_excludes_aa_prefixes() {
        let v = SignatureValidator::new(&params(8));
        // AAAAAAAA and AACAAAAA are invalid by the top-symbol rule
        assert!(!v.is_valid(0));
        let aac = 0b000001 << (2 * 8 - 6);
        assert!(!v.is_valid(aac));
        // internal AA dinucleotide: ACGTAACG
        let acgtaacg = 0b00_01_10_11_00_00_01_10;
        assert!(!v.is_valid(acgtaacg));
        // clean signature: ACGTACGT
        let acgtacgt = 0b00_01_10_11_00_01_10_11;
        assert!(v.is_valid(acgtacgt));
    }

    #[test]
    fn mask_cutoff_forces_low_zero_bits() {
        let p = MinimizerParams {
            mask_cutoff_bits: 2,
            ..params(8)
        };
        let v = SignatureValidator::new(&p);
        let acgtacgt = 0b00_01_10_11_00_01_10_11;
        assert!(!v.is_valid(acgtacgt));
        assert!(v.is_valid(0b00_01_10_11_00_01_10_00)); // ACGTACGA
    }

    #[test]
    fn signature_stability() {
        let c = categorizer();
        for seq in [&b"ACGTACGTACGTACGT"[..], b"TTTTGGGGCCCCAAAA", b"NNNNNNNNNNNNNNNN"] {
            let (sig, _) = c.find_minimizer(seq);
            assert!(sig <= c.n_bin_id());
            if sig < c.n_bin_id() {
                assert!(c.validator().is_valid(sig));
            }
        }
    }

    #[test]
    fn n_heavy_reads_land_in_n_bin() {
        let c = categorizer();
        let (sig, pos) = c.find_minimizer(b"ACGTNNNNNNACGTACGT");
        assert_eq!(c.n_bin_id(), sig);
        assert_eq!(0, pos);
    }

    #[test]
    fn scenario_single_record() {
        // seq = ACGTACGTACGT, L=8: signature ACGTACGT at position 0
        let c = categorizer();
        let bins = c.categorize(vec![rec(b"ACGTACGTACGT")]);
        assert_eq!(1, bins.len());
        let (&sig, bin) = bins.iter().next().unwrap();
        let expected = c.compute_signature(b"ACGTACGT");
        assert_eq!(expected, sig);
        assert_eq!(0, bin.records[0].minim_pos);
        assert!(!bin.records[0].is_reverse());
    }

    #[test]
    fn reverse_strand_can_win() {
        let c = categorizer();
        // reverse complement of the winning window is lexicographically larger
        let seq = b"TTTTGTATTTTTGTAT".to_vec();
        let bins = c.categorize(vec![rec(&seq)]);
        let (&sig, bin) = bins.iter().next().unwrap();
        if bin.records[0].is_reverse() {
            let r = &bin.records[0];
            let window =
                &r.seq[r.minim_pos as usize..r.minim_pos as usize + 8];
            assert_eq!(sig, c.compute_signature(window));
        }
    }

    #[test]
    fn pe_swaps_mate_with_winning_signature() {
        let c = categorizer();
        // mate 2 carries a much smaller signature (ACGTACGT-ish region)
        let mut r = rec(b"TGTGTGTGTGTGTGTGACGTACGTCAGTCAGT");
        r.aux_len = 16;
        let bins = c.categorize(vec![r]);
        let (&sig, bin) = bins.iter().next().unwrap();
        assert!(sig < c.n_bin_id());
        let stored = &bin.records[0];
        if stored.is_pair_swapped() {
            let pos = stored.minim_pos as usize;
            assert!(pos < stored.seq_len());
            assert_eq!(
                sig,
                c.compute_signature(&stored.seq[pos..pos + 8])
            );
        }
    }

    #[test]
    fn small_bins_defer_and_demote() {
        let mut buf = SmallBinBuffer::new(4, params(8).n_bin_id());
        let c = categorizer();

        let mut bins = c.categorize(vec![rec(b"ACGTACGTACGT")]);
        buf.filter(&mut bins);
        assert!(bins.is_empty());

        // the same signature keeps accumulating over batches
        let mut bins2 = c.categorize(vec![
            rec(b"ACGTACGTACGT"),
            rec(b"ACGTACGTACGT"),
            rec(b"ACGTACGTACGT"),
        ]);
        buf.filter(&mut bins2);
        assert_eq!(1, bins2.len());
        assert_eq!(4, bins2.values().next().unwrap().records.len());

        // leftovers get canonicalized into the N-bin
        let mut bins3 = c.categorize(vec![rec(b"TGCGTGCGTGCGTG")]);
        buf.filter(&mut bins3);
        assert!(bins3.is_empty());
        let flushed = buf.flush().unwrap();
        assert_eq!(1, flushed.records.len());
        assert_eq!(0, flushed.records[0].minim_pos);
        assert!(!flushed.records[0].is_reverse());
    }
}
