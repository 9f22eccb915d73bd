//! Stage 4.3: serialization of the match forest into independently coded
//! stream buffers, the per-block envelope, and the mirrored decoder.
//!
//! A bin is compressed by walking its trees breadth-first and dispatching
//! every node to one of the record shapes (hard read, LZ match, exact
//! duplicate, contig member, nested subtree). Each shape touches a fixed
//! subset of the stream buffers; the buffers are then either kept verbatim
//! (already entropy-coded) or squeezed through the DEFLATE block codec, and
//! concatenated behind a sizes table.
//!
//! Bins too small for LZ treatment and the N-bin go through the raw store,
//! which shares the envelope but keeps the DNA as plain bytes.

use std::collections::VecDeque;
use std::io::Write;

use flate2::write::{ZlibDecoder, ZlibEncoder};
use flate2::Compression;

use crate::classifier::ReadsClassifier;
use crate::contig::{ConsensusDefinition, ContigBuilder, ContigDefinition};
use crate::error::*;
use crate::graph::{Graph, MatchNode, NodeId, NodeType};
use crate::headers::{FieldsSpec, HeaderStats};
use crate::params::{CompressorParams, QualityMethod};
use crate::quality::{QualityCompressionData, QualityDecoder, QualityEncoder};
use crate::rc::{CoderDecoder, CoderEncoder};
use crate::records::FastqRecord;
use crate::rle::{BinaryRleDecoder, BinaryRleEncoder, Rle0Decoder, Rle0Encoder};

/// Record flags driving the decoder's dispatch.
mod flags {
    pub const READ_IDENTICAL: u8 = 0;
    pub const READ_DIFFICULT: u8 = 1;
    pub const READ_SHIFT_ONLY: u8 = 2;
    pub const READ_FULL_ENCODE: u8 = 3;
    pub const READ_FULL_EXPENSIVE: u8 = 4;
    pub const READ_TREE_GROUP_START: u8 = 5;
    pub const READ_CONTIG_GROUP_START: u8 = 6;
    pub const READ_CONTIG_GROUP_NEXT: u8 = 7;
    pub const READ_GROUP_END: u8 = 8;
}

/// Paired-end mate flags.
mod pe_flags {
    pub const DIFFICULT: usize = 0;
    pub const IDENTICAL: usize = 1;
    pub const FULL_ENCODE: usize = 2;
    pub const FULL_EXPENSIVE: usize = 3;
}

const SHIFT_OFFSET: i32 = 129;
const MINIM_POSITION_SYMBOL: u8 = b'.';

const SE_BUFFERS: usize = 15;
const PE_BUFFERS: usize = 23;
const RAW_BUFFERS: usize = 4;

fn dna_idx(base: u8) -> usize {
    match base {
        b'A' => 0,
        b'C' => 1,
        b'G' => 2,
        b'T' => 3,
        _ => 4,
    }
}

const IDX_DNA: [u8; 5] = [b'A', b'C', b'G', b'T', b'N'];

/// One compressed bin ready for the archive.
#[derive(Debug, Default)]
pub struct CompressedBlock {
    pub signature: u32,
    pub data: Vec<u8>,
    pub part_id: u64,
}

/// Fixed-layout block header (work/comp size tables follow it).
#[derive(Clone, Debug, Default)]
struct BlockHeader {
    signature: u32,
    records_count: u64,
    rec_min_len: u8,
    rec_max_len: u8,
    raw_dna_size: u64,
    raw_id_size: u64,
    buffers_count: u32,
    work_sizes: Vec<u64>,
    comp_sizes: Vec<u64>,
}

impl BlockHeader {
    const FIXED_SIZE: usize = 4 + 8 + 1 + 1 + 8 + 8 + 4;

    fn size(&self) -> usize {
        Self::FIXED_SIZE + 16 * self.buffers_count as usize
    }

    fn write(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.signature.to_le_bytes());
        out.extend_from_slice(&self.records_count.to_le_bytes());
        out.push(self.rec_min_len);
        out.push(self.rec_max_len);
        out.extend_from_slice(&self.raw_dna_size.to_le_bytes());
        out.extend_from_slice(&self.raw_id_size.to_le_bytes());
        out.extend_from_slice(&self.buffers_count.to_le_bytes());
        for &w in &self.work_sizes {
            out.extend_from_slice(&w.to_le_bytes());
        }
        for &c in &self.comp_sizes {
            out.extend_from_slice(&c.to_le_bytes());
        }
    }

    fn read(data: &[u8]) -> FastoreResult<BlockHeader> {
        if data.len() < Self::FIXED_SIZE {
            return Err(FastoreError::CorruptedFile(
                "compressed block shorter than its header".to_string(),
            ));
        }
        let mut header = BlockHeader {
            signature: u32::from_le_bytes(data[0..4].try_into().unwrap()),
            records_count: u64::from_le_bytes(data[4..12].try_into().unwrap()),
            rec_min_len: data[12],
            rec_max_len: data[13],
            raw_dna_size: u64::from_le_bytes(data[14..22].try_into().unwrap()),
            raw_id_size: u64::from_le_bytes(data[22..30].try_into().unwrap()),
            buffers_count: u32::from_le_bytes(data[30..34].try_into().unwrap()),
            work_sizes: Vec::new(),
            comp_sizes: Vec::new(),
        };
        let n = header.buffers_count as usize;
        if n == 0 || data.len() < Self::FIXED_SIZE + 16 * n {
            return Err(FastoreError::CorruptedFile(
                "compressed block sizes table truncated".to_string(),
            ));
        }
        let mut pos = Self::FIXED_SIZE;
        for _ in 0..n {
            header
                .work_sizes
                .push(u64::from_le_bytes(data[pos..pos + 8].try_into().unwrap()));
            pos += 8;
        }
        for _ in 0..n {
            header
                .comp_sizes
                .push(u64::from_le_bytes(data[pos..pos + 8].try_into().unwrap()));
            pos += 8;
        }
        Ok(header)
    }
}

fn backend_compress(buf: &[u8]) -> Vec<u8> {
    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::best());
    encoder.write_all(buf).expect("in-memory deflate cannot fail");
    encoder.finish().expect("in-memory deflate cannot fail")
}

fn backend_decompress(buf: &[u8], expected: usize) -> FastoreResult<Vec<u8>> {
    let mut decoder = ZlibDecoder::new(Vec::with_capacity(expected));
    decoder
        .write_all(buf)
        .map_err(|e| FastoreError::CorruptedFile(format!("block codec: {}", e)))?;
    let out = decoder
        .finish()
        .map_err(|e| FastoreError::CorruptedFile(format!("block codec: {}", e)))?;
    if out.len() != expected {
        return Err(FastoreError::CorruptedFile(
            "block buffer expands to the wrong size".to_string(),
        ));
    }
    Ok(out)
}

/// Assemble header + buffers into the block envelope, compressing the
/// buffers that are not already entropy-coded.
fn assemble_block(mut header: BlockHeader,
                  buffers: Vec<Vec<u8>>,
                  backend_mask: &[bool])
                  -> Vec<u8> {
    debug_assert_eq!(buffers.len(), backend_mask.len());
    header.buffers_count = buffers.len() as u32;
    header.work_sizes = buffers.iter().map(|b| b.len() as u64).collect();

    let mut payload = Vec::new();
    for (buf, &deflate) in buffers.iter().zip(backend_mask) {
        if buf.is_empty() {
            header.comp_sizes.push(0);
            continue;
        }
        if deflate {
            let comp = backend_compress(buf);
            header.comp_sizes.push(comp.len() as u64);
            payload.extend_from_slice(&comp);
        } else {
            header.comp_sizes.push(buf.len() as u64);
            payload.extend_from_slice(buf);
        }
    }

    let mut out = Vec::with_capacity(header.size() + payload.len());
    header.write(&mut out);
    out.extend_from_slice(&payload);
    out
}

/// Split a block envelope back into its expanded buffers.
fn disassemble_block(data: &[u8],
                     backend_mask_for: impl Fn(usize) -> Vec<bool>)
                     -> FastoreResult<(BlockHeader, Vec<Vec<u8>>)> {
    let header = BlockHeader::read(data)?;
    let mask = backend_mask_for(header.buffers_count as usize);
    if mask.len() != header.buffers_count as usize {
        return Err(FastoreError::CorruptedFile(
            "unexpected buffer count in block header".to_string(),
        ));
    }

    let mut pos = header.size();
    let mut buffers = Vec::with_capacity(mask.len());
    for (i, &deflate) in mask.iter().enumerate() {
        let work = header.work_sizes[i] as usize;
        let comp = header.comp_sizes[i] as usize;
        if work == 0 {
            buffers.push(Vec::new());
            continue;
        }
        if pos + comp > data.len() {
            return Err(FastoreError::CorruptedFile(
                "compressed block payload truncated".to_string(),
            ));
        }
        let raw = &data[pos..pos + comp];
        pos += comp;
        if deflate {
            buffers.push(backend_decompress(raw, work)?);
        } else {
            if comp != work {
                return Err(FastoreError::CorruptedFile(
                    "verbatim buffer size mismatch".to_string(),
                ));
            }
            buffers.push(raw.to_vec());
        }
    }
    Ok((header, buffers))
}

/// Which buffers pass through the DEFLATE back-end (`true`) rather than
/// verbatim; index order matches the buffer emission order.
fn se_backend_mask(quality_entropy_coded: bool) -> Vec<bool> {
    let mut mask = vec![true; SE_BUFFERS];
    mask[1] = false; // LetterX (range coded)
    mask[2] = false; // Rev
    mask[7] = false; // MatchBinary
    mask[11] = false; // ConsensusLetter
    if quality_entropy_coded {
        mask[12] = false;
    }
    mask[13] = false; // ReadIdToken
    mask[14] = false; // ReadIdValue
    mask
}

fn pe_backend_mask(quality_entropy_coded: bool) -> Vec<bool> {
    let mut mask = se_backend_mask(quality_entropy_coded);
    mask.resize(PE_BUFFERS, true);
    mask[15] = false; // PE flag (range coded)
    mask[16] = false; // PE letters
    mask[17] = false; // PE swap
    mask[22] = false; // PE match binary
    mask
}

fn raw_backend_mask(quality_entropy_coded: bool) -> Vec<bool> {
    // dna, quality, id token, id value
    vec![true, !quality_entropy_coded, false, false]
}

struct LzContext {
    /// Record ids of the sliding history, oldest first.
    history: Vec<usize>,
    /// The signature bytes implied for every read in this context.
    sig_str: Vec<u8>,
}

struct SeEncoders {
    flag: Vec<u8>,
    letters_x: CoderEncoder,
    rev: CoderEncoder,
    hard: Vec<u8>,
    lz_id: Rle0Encoder,
    shift: Vec<u8>,
    match_rle: BinaryRleEncoder,
    match_binary: CoderEncoder,
    tree_shift: Vec<u8>,
    cons_match: BinaryRleEncoder,
    cons_shift: Vec<u8>,
    cons_letters: CoderEncoder,
    quality: QualityEncoder,
    id_token: Option<CoderEncoder>,
    id_value: Option<CoderEncoder>,
}

struct PeEncoders {
    flag: CoderEncoder,
    letters: CoderEncoder,
    swap: CoderEncoder,
    hard: Vec<u8>,
    lz_id: Rle0Encoder,
    shift: Vec<u8>,
    match_rle: BinaryRleEncoder,
    match_binary: CoderEncoder,
    /// Previously encoded mate sequences, oldest first.
    history: Vec<Vec<u8>>,
    last_flag: usize,
}

/// The per-bin LZ compressor.
pub struct LzCompressor {
    params: CompressorParams,
    qua_data: QualityCompressionData,
    head_spec: Option<FieldsSpec>,
    classifier: ReadsClassifier,
    contig_builder: ContigBuilder,
}

struct EncodeState {
    enc: SeEncoders,
    pe: Option<PeEncoders>,
    lz_stack: Vec<LzContext>,
    contigs: Vec<ContigDefinition>,
    records_emitted: u64,
    raw_id_size: u64,
}

impl LzCompressor {
    pub fn new(params: CompressorParams,
               qua_data: QualityCompressionData,
               head_stats: Option<&HeaderStats>)
               -> Self {
        let head_spec = head_stats.map(FieldsSpec::new);
        let classifier = ReadsClassifier::new(params.minimizer, params.classifier);
        let contig_builder = ContigBuilder::new(params.contig, params.minimizer);
        LzCompressor {
            params,
            qua_data,
            head_spec,
            classifier,
            contig_builder,
        }
    }

    fn new_encoders(&self) -> SeEncoders {
        let (token_ctx, value_ctx) = self
            .head_spec
            .as_ref()
            .map(|s| (s.token_contexts(), s.value_contexts()))
            .unwrap_or((1, 1));
        let mut quality = QualityEncoder::new(&self.params.quality, &self.qua_data);
        quality.reset_rng(&self.qua_data);
        SeEncoders {
            flag: Vec::new(),
            letters_x: CoderEncoder::new(5, 5),
            rev: CoderEncoder::new(2, 1),
            hard: Vec::new(),
            lz_id: Rle0Encoder::new(),
            shift: Vec::new(),
            match_rle: BinaryRleEncoder::new(),
            match_binary: CoderEncoder::new(2, 1),
            tree_shift: Vec::new(),
            cons_match: BinaryRleEncoder::new(),
            cons_shift: Vec::new(),
            cons_letters: CoderEncoder::new(5, 5),
            quality,
            id_token: self
                .head_spec
                .as_ref()
                .map(|_| CoderEncoder::new(256, token_ctx)),
            id_value: self
                .head_spec
                .as_ref()
                .map(|_| CoderEncoder::new(256, value_ctx)),
        }
    }

    fn new_pe_encoders(&self) -> PeEncoders {
        PeEncoders {
            flag: CoderEncoder::new(8, 8),
            letters: CoderEncoder::new(5, 5),
            swap: CoderEncoder::new(2, 1),
            hard: Vec::new(),
            lz_id: Rle0Encoder::new(),
            shift: Vec::new(),
            match_rle: BinaryRleEncoder::new(),
            match_binary: CoderEncoder::new(2, 1),
            history: Vec::new(),
            last_flag: 0,
        }
    }

    /// Compress one bin whose match forest has not been built yet. The
    /// record vector gains temporary root copies while nested subtrees are
    /// walked; `records_count` must therefore be taken before the call.
    pub fn compress_bin(&self,
                        records: &mut Vec<FastqRecord>,
                        mut graph: Graph,
                        signature: u32,
                        raw_dna_size: u64,
                        part_id: u64)
                        -> FastoreResult<CompressedBlock> {
        debug_assert!(!records.is_empty());
        debug_assert_ne!(signature, self.params.minimizer.n_bin_id());

        let records_count = records.len() as u64;
        let (min_len, max_len) = records
            .iter()
            .fold((usize::MAX, 0), |acc, r| {
                (acc.0.min(r.seq_len()), acc.1.max(r.seq_len()))
            });
        if min_len != max_len {
            return Err(FastoreError::InvalidArgument(
                "LZ compression requires constant-length bins".to_string(),
            ));
        }

        graph.sort_nodes(records);
        let roots = self.classifier.construct_match_tree(records, &mut graph);

        let mut state = EncodeState {
            enc: self.new_encoders(),
            pe: if self.params.archive_type.paired_end {
                Some(self.new_pe_encoders())
            } else {
                None
            },
            lz_stack: vec![LzContext {
                history: Vec::new(),
                sig_str: self.params.minimizer.signature_string(signature),
            }],
            contigs: Vec::new(),
            records_emitted: 0,
            raw_id_size: 0,
        };

        for root in roots {
            if graph.nodes[root].has_children() {
                self.contig_builder
                    .build(root, &mut graph, records, &mut state.contigs);
            }

            let mut queue = VecDeque::from([root]);
            while let Some(node) = queue.pop_front() {
                self.compress_node(node, records, &mut graph, &mut state)?;
                queue.extend(graph.nodes[node].children.iter().copied());
            }
        }

        debug_assert_eq!(records_count, state.records_emitted);

        let header = BlockHeader {
            signature,
            records_count,
            rec_min_len: min_len as u8,
            rec_max_len: max_len as u8,
            raw_dna_size,
            raw_id_size: state.raw_id_size,
            ..BlockHeader::default()
        };

        let quality_entropy = state.enc.quality.is_entropy_coded();
        let mut buffers = finish_se_encoders(state.enc);
        let mask = if let Some(pe) = state.pe {
            buffers.extend(finish_pe_encoders(pe));
            pe_backend_mask(quality_entropy)
        } else {
            se_backend_mask(quality_entropy)
        };

        Ok(CompressedBlock {
            signature,
            data: assemble_block(header, buffers, &mask),
            part_id,
        })
    }

    fn compress_node(&self,
                     node: NodeId,
                     records: &mut Vec<FastqRecord>,
                     graph: &mut Graph,
                     state: &mut EncodeState)
                     -> FastoreResult<()> {
        if graph.aux_node == Some(node) {
            return Ok(());
        }
        match graph.nodes[node].node_type {
            NodeType::Hard => {
                state.lz_stack.last_mut().unwrap().history.clear();
                let rec_id = graph.nodes[node].record;
                self.compress_hard_read(rec_id, records, state)?;
                state.lz_stack.last_mut().unwrap().history.push(rec_id);

                self.compress_exact_children(node, records, graph, state)?;
                self.compress_sub_trees(node, records, graph, state)?;
            },
            NodeType::Lz => {
                self.compress_match(node, records, graph, state)?;
                self.compress_exact_children(node, records, graph, state)?;
                self.compress_sub_trees(node, records, graph, state)?;
                if graph.nodes[node].contig.is_some() {
                    self.compress_contig(node, records, graph, state)?;
                }
            },
            other => {
                debug_assert!(false, "unexpected node type in walk: {:?}", other);
            },
        }
        Ok(())
    }

    fn compress_read_tail(&self,
                          rec_id: usize,
                          records: &[FastqRecord],
                          state: &mut EncodeState)
                          -> FastoreResult<()> {
        // identifier, then quality, then the PE mate
        if let Some(spec) = &self.head_spec {
            let rec = &records[rec_id];
            spec.compress_read_id(&rec.head,
                                  state.enc.id_token.as_mut().unwrap(),
                                  state.enc.id_value.as_mut().unwrap())?;
            state.raw_id_size += rec.head.len() as u64;
        }
        state
            .enc
            .quality
            .encode_read(&records[rec_id], self.params.archive_type.quality_offset);
        if state.pe.is_some() {
            self.compress_pair(rec_id, records, state);
        }
        state.records_emitted += 1;
        Ok(())
    }

    fn compress_hard_read(&self,
                          rec_id: usize,
                          records: &[FastqRecord],
                          state: &mut EncodeState)
                          -> FastoreResult<()> {
        let rec = &records[rec_id];
        state.enc.rev.encode(rec.is_reverse() as usize, 0);
        state.enc.flag.push(flags::READ_DIFFICULT);

        let sig_len = self.params.minimizer.signature_len as usize;
        let min_pos = rec.minim_pos as usize;
        let mut i = 0;
        while i < rec.seq_len() {
            if i == min_pos {
                state.enc.hard.push(MINIM_POSITION_SYMBOL);
                i += sig_len;
                continue;
            }
            state.enc.hard.push(rec.seq[i]);
            i += 1;
        }

        self.compress_read_tail(rec_id, records, state)
    }

    fn compress_exact_read(&self,
                           rec_id: usize,
                           records: &[FastqRecord],
                           state: &mut EncodeState)
                           -> FastoreResult<()> {
        let rec = &records[rec_id];
        state.enc.rev.encode(rec.is_reverse() as usize, 0);
        state.enc.flag.push(flags::READ_IDENTICAL);
        self.compress_read_tail(rec_id, records, state)
    }

    fn compress_exact_children(&self,
                               node: NodeId,
                               records: &[FastqRecord],
                               graph: &Graph,
                               state: &mut EncodeState)
                               -> FastoreResult<()> {
        if let Some(group) = graph.nodes[node].exact_group {
            for i in 0..graph.exact_groups[group].len() {
                let rec_id = graph.exact_groups[group][i];
                self.compress_exact_read(rec_id, records, state)?;
            }
        }
        Ok(())
    }

    fn compress_match(&self,
                      node: NodeId,
                      records: &[FastqRecord],
                      graph: &Graph,
                      state: &mut EncodeState)
                      -> FastoreResult<()> {
        let n = &graph.nodes[node];
        debug_assert_eq!(NodeType::Lz, n.node_type);
        let rec_id = n.record;
        let lz_rec_id = n.lz_record.expect("LZ node without a parent record");

        let ctx = state.lz_stack.last_mut().unwrap();
        let lz_id = ctx
            .history
            .iter()
            .rev()
            .position(|&r| r == lz_rec_id)
            .expect("LZ parent must be in the history window") as u32;

        let mismatches = (n.encode_cost as i32
            - (n.shift as i32 * self.params.classifier.shift_cost).abs())
            / self.params.classifier.mismatch_cost;
        let expensive = mismatches > self.params.max_mismatches_low_cost as i32;

        let rec = &records[rec_id];
        let lz_rec = &records[lz_rec_id];

        state.enc.rev.encode(rec.is_reverse() as usize, 0);

        debug_assert!((n.shift as i32).abs() < SHIFT_OFFSET - 1);
        state.enc.shift.push((SHIFT_OFFSET + n.shift as i32) as u8);
        state.enc.lz_id.put(lz_id);

        let flag = if n.shift_only {
            flags::READ_SHIFT_ONLY
        } else if expensive {
            flags::READ_FULL_EXPENSIVE
        } else {
            flags::READ_FULL_ENCODE
        };
        state.enc.flag.push(flag);

        // align both reads on the signature
        let shift = n.shift as i32;
        let mut best_seq: &[u8] = &lz_rec.seq[..lz_rec.seq_len()];
        let mut best_pos = lz_rec.minim_pos as i32;
        let mut new_seq: &[u8] = &rec.seq[..rec.seq_len()];

        if shift >= 0 {
            best_seq = &best_seq[shift as usize..];
            best_pos -= shift;
        } else {
            for &b in &new_seq[..(-shift) as usize] {
                state.enc.letters_x.encode(dna_idx(b), dna_idx(b'N'));
            }
            new_seq = &new_seq[(-shift) as usize..];
        }
        let min_len = best_seq.len().min(new_seq.len());

        let sig_len = self.params.minimizer.signature_len as usize;
        if flag == flags::READ_FULL_ENCODE {
            let mut i = 0;
            while i < min_len {
                if i as i32 == best_pos {
                    i += sig_len;
                    continue;
                }
                if best_seq[i] == new_seq[i] {
                    state.enc.match_rle.put(true);
                } else {
                    state.enc.match_rle.put(false);
                    state
                        .enc
                        .letters_x
                        .encode(dna_idx(new_seq[i]), dna_idx(best_seq[i]));
                }
                i += 1;
            }
        } else if flag == flags::READ_FULL_EXPENSIVE {
            let mut i = 0;
            while i < min_len {
                if i as i32 == best_pos {
                    i += sig_len;
                    continue;
                }
                state
                    .enc
                    .match_binary
                    .encode((best_seq[i] == new_seq[i]) as usize, 0);
                if best_seq[i] != new_seq[i] {
                    state
                        .enc
                        .letters_x
                        .encode(dna_idx(new_seq[i]), dna_idx(best_seq[i]));
                }
                i += 1;
            }
        }

        // trailing insertion when the new read is longer than the overlap
        for &b in &new_seq[min_len..] {
            state.enc.letters_x.encode(dna_idx(b), dna_idx(b'N'));
        }

        state.lz_stack.last_mut().unwrap().history.push(rec_id);
        self.compress_read_tail(rec_id, records, state)
    }

    fn compress_contig(&self,
                       node: NodeId,
                       records: &mut Vec<FastqRecord>,
                       graph: &mut Graph,
                       state: &mut EncodeState)
                       -> FastoreResult<()> {
        let contig_id = graph.nodes[node].contig.expect("contig group expected");
        let contig = state.contigs[contig_id].clone();
        let main_rec_id = graph.nodes[node].record;

        state.enc.flag.push(flags::READ_CONTIG_GROUP_START);

        {
            let main_rec = &records[main_rec_id];
            self.store_contig_definition(&contig.consensus,
                                         &main_rec.seq[..main_rec.seq_len()],
                                         main_rec.minim_pos as usize,
                                         state);
        }

        let mut last_minim_pos = records[main_rec_id].minim_pos as i32;
        let mut first = true;
        for &member in &contig.nodes {
            if !first {
                state.enc.flag.push(flags::READ_CONTIG_GROUP_NEXT);
            }
            let rec_id = graph.nodes[member].record;
            self.compress_contig_read(rec_id, records, &contig.consensus,
                                      &mut last_minim_pos, first, state)?;
            first = false;

            state.lz_stack.last_mut().unwrap().history.push(rec_id);

            self.compress_exact_children(member, records, graph, state)?;
            self.compress_sub_trees(member, records, graph, state)?;
        }

        state.enc.flag.push(flags::READ_GROUP_END);
        Ok(())
    }

    fn store_contig_definition(&self,
                               consensus: &ConsensusDefinition,
                               main_seq: &[u8],
                               main_pos: usize,
                               state: &mut EncodeState) {
        let read_len = consensus.read_len;
        let begin_cut = self.params.contig.begin_cut as usize;
        let end_cut = self.params.contig.end_cut as usize;
        let sig_len = self.params.minimizer.signature_len as usize;

        // the stretch of the consensus covered by the main (LZ) record
        let lz_first = read_len - main_pos;
        let lz_second = lz_first + read_len;

        if read_len < 128 {
            let r1 = SHIFT_OFFSET - (read_len / 2) as i32;
            let r2 = SHIFT_OFFSET - (read_len * 3 / 2) as i32;
            state.enc.tree_shift.push((consensus.range.0 as i32 + r1) as u8);
            state.enc.tree_shift.push((consensus.range.1 as i32 + r2) as u8);
        } else {
            debug_assert!(consensus.range.0 < 256);
            state.enc.tree_shift.push(consensus.range.0 as u8);
            let rescale = (sig_len + begin_cut + end_cut) as i32;
            let delta = (consensus.range.1 as i32 - consensus.range.0 as i32)
                - read_len as i32
                + rescale;
            debug_assert!(delta > 0 && delta < 256);
            state.enc.tree_shift.push(delta as u8);
        }

        let mut i = consensus.range.0;
        while i < consensus.range.1 {
            if i == read_len {
                i += sig_len;
                continue;
            }
            state.enc.cons_match.put(!consensus.variant_positions[i]);

            if i < lz_first + begin_cut
                || i >= lz_second - end_cut
                || consensus.variant_positions[i]
            {
                state
                    .enc
                    .cons_letters
                    .encode(dna_idx(consensus.sequence[i]), dna_idx(b'N'));
            } else {
                debug_assert_eq!(consensus.sequence[i], main_seq[i - lz_first]);
            }
            i += 1;
        }
    }

    fn compress_contig_read(&self,
                            rec_id: usize,
                            records: &[FastqRecord],
                            consensus: &ConsensusDefinition,
                            last_minim_pos: &mut i32,
                            use_tree_shift: bool,
                            state: &mut EncodeState)
                            -> FastoreResult<()> {
        let rec = &records[rec_id];
        let read_len = rec.seq_len();
        let begin_cut = self.params.contig.begin_cut as usize;
        let end_cut = self.params.contig.end_cut as usize;
        let sig_len = self.params.minimizer.signature_len as usize;

        // delta-coded signature position; the first member uses the tree
        // shift buffer
        let dpos = rec.minim_pos as i32 - *last_minim_pos;
        *last_minim_pos = rec.minim_pos as i32;
        let byte = if read_len * 2 >= 256 {
            rec.minim_pos as u8
        } else {
            debug_assert!(SHIFT_OFFSET + dpos < 256);
            (SHIFT_OFFSET + dpos) as u8
        };
        if use_tree_shift {
            state.enc.tree_shift.push(byte);
        } else {
            state.enc.cons_shift.push(byte);
        }

        state.enc.rev.encode(rec.is_reverse() as usize, 0);

        let cons_start = consensus.read_len - rec.minim_pos as usize;
        let min_pos = rec.minim_pos as usize;

        let mut i = 0;
        while i < read_len {
            if i == min_pos {
                i += sig_len;
                continue;
            }
            let inside_body = i >= begin_cut && i < read_len - end_cut;
            if !inside_body || consensus.variant_positions[cons_start + i] {
                state.enc.cons_letters.encode(
                    dna_idx(rec.seq[i]),
                    dna_idx(consensus.sequence[cons_start + i]),
                );
            } else {
                debug_assert_eq!(rec.seq[i], consensus.sequence[cons_start + i]);
            }
            i += 1;
        }

        self.compress_read_tail(rec_id, records, state)
    }

    fn compress_sub_trees(&self,
                          node: NodeId,
                          records: &mut Vec<FastqRecord>,
                          graph: &mut Graph,
                          state: &mut EncodeState)
                          -> FastoreResult<()> {
        if graph.nodes[node].sub_trees.is_empty() {
            return Ok(());
        }
        let root_rec_id = graph.nodes[node].record;
        let tree_ids: Vec<usize> = graph.nodes[node].sub_trees.clone();

        for tree_id in tree_ids {
            let mut sub = std::mem::take(&mut graph.sub_trees[tree_id]);
            let root_rec = records[root_rec_id].clone();
            let read_len = root_rec.seq_len();
            let main_pos = sub.main_signature_pos as usize;
            debug_assert!(main_pos + self.params.minimizer.signature_len as usize
                          <= read_len);

            // synchronize the signature position of the nested context
            if read_len * 2 >= 256 {
                state.enc.tree_shift.push(main_pos as u8);
            } else {
                let shift = main_pos as i32 - root_rec.minim_pos as i32;
                state.enc.tree_shift.push((SHIFT_OFFSET + shift) as u8);
            }

            state.enc.flag.push(flags::READ_TREE_GROUP_START);

            // a local copy of the root with the altered signature position
            // seeds the nested window
            let mut local_root = root_rec.clone();
            local_root.minim_pos = main_pos as u16;
            let local_rec_id = records.len();
            records.push(local_root);

            let sig_len = self.params.minimizer.signature_len as usize;
            let sig_str =
                records[local_rec_id].seq[main_pos..main_pos + sig_len].to_vec();
            state.lz_stack.push(LzContext {
                history: vec![local_rec_id],
                sig_str,
            });

            sub.graph.sort_nodes(records);
            let aux_id = sub.graph.nodes.len();
            sub.graph.nodes.push(MatchNode::new(local_rec_id));
            sub.graph.aux_node = Some(aux_id);

            let roots = self
                .classifier
                .construct_match_tree(records, &mut sub.graph);

            let mut first_root = true;
            for root in roots {
                if sub.graph.nodes[root].has_children() {
                    self.contig_builder
                        .build(root, &mut sub.graph, records, &mut state.contigs);
                }

                let mut queue = VecDeque::new();
                if first_root {
                    debug_assert_eq!(Some(root), sub.graph.aux_node);
                    queue.extend(sub.graph.nodes[root].children.iter().copied());
                    first_root = false;
                } else {
                    queue.push_back(root);
                }

                while let Some(n) = queue.pop_front() {
                    self.compress_node(n, records, &mut sub.graph, state)?;
                    queue.extend(sub.graph.nodes[n].children.iter().copied());
                }
            }

            state.enc.flag.push(flags::READ_GROUP_END);
            state.lz_stack.pop();
        }
        Ok(())
    }

    /// Encode the second mate against the mate history window.
    fn compress_pair(&self,
                     rec_id: usize,
                     records: &[FastqRecord],
                     state: &mut EncodeState) {
        let rec = &records[rec_id];
        let pe = state.pe.as_mut().unwrap();

        pe.swap.encode(rec.is_pair_swapped() as usize, 0);

        let mate = rec.seq_2();
        let window = self.params.classifier.pair_lz_window.max(1);
        let threshold = (mate.len() / 2) as i32;

        let mut best_cost = threshold + 1;
        let mut best_id = 0usize;
        for (i, cand) in pe.history.iter().rev().enumerate().take(window) {
            let overlap = mate.len().min(cand.len());
            let mut cost = 0;
            for j in 0..overlap {
                if mate[j] != cand[j] {
                    cost += self.params.classifier.mismatch_cost;
                    if cost >= best_cost {
                        break;
                    }
                }
            }
            if cost < best_cost {
                best_cost = cost;
                best_id = i;
                if cost == 0 {
                    break;
                }
            }
        }

        let flag = if best_cost > threshold {
            pe_flags::DIFFICULT
        } else if best_cost == 0
            && pe.history[pe.history.len() - 1 - best_id].len() == mate.len()
        {
            pe_flags::IDENTICAL
        } else {
            let mismatches = best_cost / self.params.classifier.mismatch_cost;
            if mismatches > self.params.max_mismatches_low_cost as i32 {
                pe_flags::FULL_EXPENSIVE
            } else {
                pe_flags::FULL_ENCODE
            }
        };

        pe.flag.encode(flag, pe.last_flag);
        pe.last_flag = flag;

        match flag {
            pe_flags::DIFFICULT => {
                pe.hard.extend_from_slice(mate);
            },
            pe_flags::IDENTICAL => {
                pe.lz_id.put(best_id as u32);
            },
            _ => {
                pe.lz_id.put(best_id as u32);
                pe.shift.push(SHIFT_OFFSET as u8);
                let cand = &pe.history[pe.history.len() - 1 - best_id];
                let overlap = mate.len().min(cand.len());
                if flag == pe_flags::FULL_ENCODE {
                    for j in 0..overlap {
                        if mate[j] == cand[j] {
                            pe.match_rle.put(true);
                        } else {
                            pe.match_rle.put(false);
                            pe.letters.encode(dna_idx(mate[j]), dna_idx(cand[j]));
                        }
                    }
                } else {
                    for j in 0..overlap {
                        pe.match_binary.encode((mate[j] == cand[j]) as usize, 0);
                        if mate[j] != cand[j] {
                            pe.letters.encode(dna_idx(mate[j]), dna_idx(cand[j]));
                        }
                    }
                }
                for &b in &mate[overlap..] {
                    pe.letters.encode(dna_idx(b), dna_idx(b'N'));
                }
            },
        }

        pe.history.push(mate.to_vec());
        if pe.history.len() > window {
            pe.history.remove(0);
        }
    }
}

fn finish_se_encoders(enc: SeEncoders) -> Vec<Vec<u8>> {
    vec![
        enc.flag,
        enc.letters_x.finish(),
        enc.rev.finish(),
        enc.hard,
        enc.lz_id.finish(),
        enc.shift,
        enc.match_rle.finish(),
        enc.match_binary.finish(),
        enc.tree_shift,
        enc.cons_match.finish(),
        enc.cons_shift,
        enc.cons_letters.finish(),
        enc.quality.finish(),
        enc.id_token.map(|c| c.finish()).unwrap_or_default(),
        enc.id_value.map(|c| c.finish()).unwrap_or_default(),
    ]
}

fn finish_pe_encoders(pe: PeEncoders) -> Vec<Vec<u8>> {
    vec![
        pe.flag.finish(),
        pe.letters.finish(),
        pe.swap.finish(),
        pe.hard,
        pe.lz_id.finish(),
        pe.shift,
        pe.match_rle.finish(),
        pe.match_binary.finish(),
    ]
}

/// Raw store for the N-bin and for bins too small to LZ-compress: plain DNA
/// bytes plus the quality and identifier streams.
pub struct RawCompressor {
    params: CompressorParams,
    qua_data: QualityCompressionData,
    head_spec: Option<FieldsSpec>,
}

impl RawCompressor {
    pub fn new(params: CompressorParams,
               qua_data: QualityCompressionData,
               head_stats: Option<&HeaderStats>)
               -> Self {
        let head_spec = head_stats.map(FieldsSpec::new);
        RawCompressor {
            params,
            qua_data,
            head_spec,
        }
    }

    pub fn compress_bin(&self,
                        records: &[FastqRecord],
                        signature: u32,
                        raw_dna_size: u64,
                        part_id: u64)
                        -> FastoreResult<CompressedBlock> {
        debug_assert!(!records.is_empty());

        let (min_len, max_len) = records
            .iter()
            .fold((usize::MAX, 0), |acc, r| {
                (acc.0.min(r.seq_len()), acc.1.max(r.seq_len()))
            });
        let const_len = min_len == max_len;

        let mut dna = Vec::new();
        let mut quality = QualityEncoder::new(&self.params.quality, &self.qua_data);
        quality.reset_rng(&self.qua_data);
        let (token_ctx, value_ctx) = self
            .head_spec
            .as_ref()
            .map(|s| (s.token_contexts(), s.value_contexts()))
            .unwrap_or((1, 1));
        let mut id_token = CoderEncoder::new(256, token_ctx);
        let mut id_value = CoderEncoder::new(256, value_ctx);
        let mut raw_id_size = 0u64;

        for rec in records {
            debug_assert!(!rec.is_reverse() && !rec.is_pair_swapped());
            if !const_len {
                dna.push((rec.seq_len() - min_len) as u8);
                if self.params.archive_type.paired_end {
                    dna.push((rec.aux_len as usize - min_len) as u8);
                }
            }
            dna.extend_from_slice(&rec.seq);
            quality.encode_read(rec, self.params.archive_type.quality_offset);
            if let Some(spec) = &self.head_spec {
                spec.compress_read_id(&rec.head, &mut id_token, &mut id_value)?;
                raw_id_size += rec.head.len() as u64;
            }
        }

        let header = BlockHeader {
            signature,
            records_count: records.len() as u64,
            rec_min_len: min_len as u8,
            rec_max_len: max_len as u8,
            raw_dna_size,
            raw_id_size,
            ..BlockHeader::default()
        };

        let mask = raw_backend_mask(quality.is_entropy_coded());
        let buffers = vec![dna, quality.finish(), id_token.finish(), id_value.finish()];
        Ok(CompressedBlock {
            signature,
            data: assemble_block(header, buffers, &mask),
            part_id,
        })
    }
}

/// Mirror of [`LzCompressor`] and [`RawCompressor`].
pub struct Decompressor {
    params: CompressorParams,
    qua_data: QualityCompressionData,
    head_spec: Option<FieldsSpec>,
}

struct SeDecoders<'a> {
    flag: &'a [u8],
    flag_pos: usize,
    letters_x: CoderDecoder<'a>,
    rev: CoderDecoder<'a>,
    hard: &'a [u8],
    hard_pos: usize,
    lz_id: Rle0Decoder<'a>,
    shift: &'a [u8],
    shift_pos: usize,
    match_rle: BinaryRleDecoder<'a>,
    match_binary: CoderDecoder<'a>,
    tree_shift: &'a [u8],
    tree_shift_pos: usize,
    cons_match: BinaryRleDecoder<'a>,
    cons_shift: &'a [u8],
    cons_shift_pos: usize,
    cons_letters: CoderDecoder<'a>,
    quality: QualityDecoder<'a>,
    id_token: Option<CoderDecoder<'a>>,
    id_value: Option<CoderDecoder<'a>>,
}

impl<'a> SeDecoders<'a> {
    fn next_flag(&mut self) -> u8 {
        let f = self.flag.get(self.flag_pos).copied().unwrap_or(255);
        self.flag_pos += 1;
        f
    }

    fn peek_flag(&self) -> u8 {
        self.flag.get(self.flag_pos).copied().unwrap_or(255)
    }

    fn next_hard(&mut self) -> u8 {
        let b = self.hard.get(self.hard_pos).copied().unwrap_or(0);
        self.hard_pos += 1;
        b
    }

    fn next_shift(&mut self) -> i32 {
        let b = self.shift.get(self.shift_pos).copied().unwrap_or(0);
        self.shift_pos += 1;
        b as i32 - SHIFT_OFFSET
    }

    fn next_tree_shift(&mut self) -> u8 {
        let b = self.tree_shift.get(self.tree_shift_pos).copied().unwrap_or(0);
        self.tree_shift_pos += 1;
        b
    }

    fn next_cons_shift(&mut self) -> u8 {
        let b = self.cons_shift.get(self.cons_shift_pos).copied().unwrap_or(0);
        self.cons_shift_pos += 1;
        b
    }
}

struct PeDecoders<'a> {
    flag: CoderDecoder<'a>,
    letters: CoderDecoder<'a>,
    swap: CoderDecoder<'a>,
    hard: &'a [u8],
    hard_pos: usize,
    lz_id: Rle0Decoder<'a>,
    shift: &'a [u8],
    shift_pos: usize,
    match_rle: BinaryRleDecoder<'a>,
    match_binary: CoderDecoder<'a>,
    history: Vec<Vec<u8>>,
    last_flag: usize,
}

/// History entry of the decoder: enough of a record to serve as LZ parent.
#[derive(Clone)]
struct HistRead {
    seq: Vec<u8>,
    minim_pos: u16,
}

struct DecodeLzContext {
    history: Vec<HistRead>,
    sig_str: Vec<u8>,
}

struct DecodeState<'a> {
    dec: SeDecoders<'a>,
    pe: Option<PeDecoders<'a>>,
    lz_stack: Vec<DecodeLzContext>,
    out: Vec<FastqRecord>,
    seq_len: usize,
    aux_len: usize,
}

impl Decompressor {
    pub fn new(params: CompressorParams,
               qua_data: QualityCompressionData,
               head_stats: Option<&HeaderStats>)
               -> Self {
        Decompressor {
            params,
            qua_data,
            head_spec: head_stats.map(FieldsSpec::new),
        }
    }

    /// Expand one compressed block back into records (stored orientation).
    pub fn decompress_block(&self, data: &[u8]) -> FastoreResult<(u32, Vec<FastqRecord>)> {
        let quality_entropy = self.params.quality.method != QualityMethod::None;
        let (header, buffers) = disassemble_block(data, |count| match count {
            RAW_BUFFERS => raw_backend_mask(quality_entropy),
            SE_BUFFERS => se_backend_mask(quality_entropy),
            PE_BUFFERS => pe_backend_mask(quality_entropy),
            _ => Vec::new(),
        })?;

        match header.buffers_count as usize {
            RAW_BUFFERS => self.decompress_raw(&header, &buffers),
            SE_BUFFERS | PE_BUFFERS => self.decompress_lz(&header, &buffers),
            n => Err(FastoreError::CorruptedFile(format!(
                "unexpected buffer count {} in block",
                n
            ))),
        }
    }

    fn decompress_raw(&self,
                      header: &BlockHeader,
                      buffers: &[Vec<u8>])
                      -> FastoreResult<(u32, Vec<FastqRecord>)> {
        let const_len = header.rec_min_len == header.rec_max_len;
        let paired = self.params.archive_type.paired_end;
        let min_len = header.rec_min_len as usize;

        let mut dna_pos = 0usize;
        let dna = &buffers[0];
        let mut quality =
            QualityDecoder::new(&self.params.quality, &self.qua_data, &buffers[1]);
        quality.reset_rng(&self.qua_data);
        let (token_ctx, value_ctx) = self
            .head_spec
            .as_ref()
            .map(|s| (s.token_contexts(), s.value_contexts()))
            .unwrap_or((1, 1));
        let mut id_token = CoderDecoder::new(&buffers[2], 256, token_ctx);
        let mut id_value = CoderDecoder::new(&buffers[3], 256, value_ctx);

        let mut out = Vec::with_capacity(header.records_count as usize);
        for _ in 0..header.records_count {
            let (seq_len, aux_len) = if const_len {
                (min_len, if paired { min_len } else { 0 })
            } else {
                let s = *dna.get(dna_pos).ok_or_else(truncated)? as usize + min_len;
                dna_pos += 1;
                let a = if paired {
                    let a = *dna.get(dna_pos).ok_or_else(truncated)? as usize + min_len;
                    dna_pos += 1;
                    a
                } else {
                    0
                };
                (s, a)
            };

            let total = seq_len + aux_len;
            if dna_pos + total > dna.len() {
                return Err(truncated());
            }
            let mut rec = FastqRecord::new(dna[dna_pos..dna_pos + total].to_vec(),
                                           Vec::new(),
                                           Vec::new());
            dna_pos += total;
            rec.aux_len = aux_len as u16;

            quality.decode_read(&mut rec, self.params.archive_type.quality_offset);
            if let Some(spec) = &self.head_spec {
                rec.head = spec.decompress_read_id(&mut id_token, &mut id_value);
            }
            out.push(rec);
        }
        Ok((header.signature, out))
    }

    fn decompress_lz(&self,
                     header: &BlockHeader,
                     buffers: &[Vec<u8>])
                     -> FastoreResult<(u32, Vec<FastqRecord>)> {
        if header.rec_min_len != header.rec_max_len {
            return Err(FastoreError::CorruptedFile(
                "LZ block with variable record length".to_string(),
            ));
        }
        let (token_ctx, value_ctx) = self
            .head_spec
            .as_ref()
            .map(|s| (s.token_contexts(), s.value_contexts()))
            .unwrap_or((1, 1));

        let mut quality =
            QualityDecoder::new(&self.params.quality, &self.qua_data, &buffers[12]);
        quality.reset_rng(&self.qua_data);

        let dec = SeDecoders {
            flag: &buffers[0],
            flag_pos: 0,
            letters_x: CoderDecoder::new(&buffers[1], 5, 5),
            rev: CoderDecoder::new(&buffers[2], 2, 1),
            hard: &buffers[3],
            hard_pos: 0,
            lz_id: Rle0Decoder::new(&buffers[4]),
            shift: &buffers[5],
            shift_pos: 0,
            match_rle: BinaryRleDecoder::new(&buffers[6]),
            match_binary: CoderDecoder::new(&buffers[7], 2, 1),
            tree_shift: &buffers[8],
            tree_shift_pos: 0,
            cons_match: BinaryRleDecoder::new(&buffers[9]),
            cons_shift: &buffers[10],
            cons_shift_pos: 0,
            cons_letters: CoderDecoder::new(&buffers[11], 5, 5),
            quality,
            id_token: self
                .head_spec
                .as_ref()
                .map(|_| CoderDecoder::new(&buffers[13], 256, token_ctx)),
            id_value: self
                .head_spec
                .as_ref()
                .map(|_| CoderDecoder::new(&buffers[14], 256, value_ctx)),
        };

        let pe = if header.buffers_count as usize == PE_BUFFERS {
            Some(PeDecoders {
                flag: CoderDecoder::new(&buffers[15], 8, 8),
                letters: CoderDecoder::new(&buffers[16], 5, 5),
                swap: CoderDecoder::new(&buffers[17], 2, 1),
                hard: &buffers[18],
                hard_pos: 0,
                lz_id: Rle0Decoder::new(&buffers[19]),
                shift: &buffers[20],
                shift_pos: 0,
                match_rle: BinaryRleDecoder::new(&buffers[21]),
                match_binary: CoderDecoder::new(&buffers[22], 2, 1),
                history: Vec::new(),
                last_flag: 0,
            })
        } else {
            None
        };

        let seq_len = header.rec_min_len as usize;
        let mut state = DecodeState {
            dec,
            pe,
            lz_stack: vec![DecodeLzContext {
                history: Vec::new(),
                sig_str: self.params.minimizer.signature_string(header.signature),
            }],
            out: Vec::with_capacity(header.records_count as usize),
            seq_len,
            aux_len: if header.buffers_count as usize == PE_BUFFERS {
                seq_len
            } else {
                0
            },
        };

        while (state.out.len() as u64) < header.records_count {
            let flag = state.dec.next_flag();
            self.dispatch_flag(flag, &mut state)?;
        }

        Ok((header.signature, state.out))
    }

    fn dispatch_flag(&self, flag: u8, state: &mut DecodeState) -> FastoreResult<()> {
        match flag {
            flags::READ_CONTIG_GROUP_START => self.decompress_consensus(state),
            flags::READ_TREE_GROUP_START => {
                let root = state
                    .out
                    .last()
                    .cloned()
                    .ok_or_else(|| FastoreError::CorruptedFile(
                        "tree group before any record".to_string(),
                    ))?;
                self.decompress_tree(&root, state)
            },
            flags::READ_IDENTICAL => {
                let rec = self.decompress_exact_read(state)?;
                self.finish_record(rec, state)
            },
            flags::READ_DIFFICULT => {
                let rec = self.decompress_hard_read(state)?;
                self.finish_record(rec, state)
            },
            flags::READ_SHIFT_ONLY | flags::READ_FULL_ENCODE
            | flags::READ_FULL_EXPENSIVE => {
                let rec = self.decompress_lz_match(flag, state)?;
                self.finish_record(rec, state)
            },
            other => Err(FastoreError::CorruptedFile(format!(
                "invalid record flag {}",
                other
            ))),
        }
    }

    /// Decode identifier/quality/mate and append the finished record.
    fn finish_record(&self,
                     mut rec: FastqRecord,
                     state: &mut DecodeState)
                     -> FastoreResult<()> {
        if let Some(spec) = &self.head_spec {
            rec.head = spec.decompress_read_id(state.dec.id_token.as_mut().unwrap(),
                                               state.dec.id_value.as_mut().unwrap());
        }
        if state.pe.is_some() {
            self.decompress_pair(&mut rec, state)?;
        }
        rec.aux_len = state.aux_len as u16;
        state
            .dec
            .quality
            .decode_read(&mut rec, self.params.archive_type.quality_offset);
        state.out.push(rec);
        Ok(())
    }

    fn decompress_hard_read(&self, state: &mut DecodeState) -> FastoreResult<FastqRecord> {
        let is_rev = state.dec.rev.decode(0) != 0;
        let sig_len = self.params.minimizer.signature_len as usize;

        let mut rec = FastqRecord::default();
        rec.set_reverse(is_rev);
        rec.seq = vec![0u8; state.seq_len];
        rec.minim_pos = 0;

        let ctx_sig = state.lz_stack.last().unwrap().sig_str.clone();
        let mut i = 0;
        while i < state.seq_len {
            let b = state.dec.next_hard();
            if b == MINIM_POSITION_SYMBOL {
                rec.minim_pos = i as u16;
                rec.seq[i..i + sig_len].copy_from_slice(&ctx_sig);
                i += sig_len;
            } else {
                rec.seq[i] = b;
                i += 1;
            }
        }

        let ctx = state.lz_stack.last_mut().unwrap();
        ctx.history.clear();
        ctx.history.push(HistRead {
            seq: rec.seq.clone(),
            minim_pos: rec.minim_pos,
        });
        Ok(rec)
    }

    fn decompress_exact_read(&self, state: &mut DecodeState) -> FastoreResult<FastqRecord> {
        let is_rev = state.dec.rev.decode(0) != 0;
        let ctx = state.lz_stack.last().unwrap();
        let parent = ctx.history.last().ok_or_else(|| {
            FastoreError::CorruptedFile("exact match without a parent".to_string())
        })?;
        let mut rec = FastqRecord::default();
        rec.seq = parent.seq.clone();
        rec.minim_pos = parent.minim_pos;
        rec.set_reverse(is_rev);
        Ok(rec)
    }

    fn decompress_lz_match(&self,
                           flag: u8,
                           state: &mut DecodeState)
                           -> FastoreResult<FastqRecord> {
        let sig_len = self.params.minimizer.signature_len as usize;
        let shift = state.dec.next_shift();
        let prev_id = state.dec.lz_id.get() as usize;

        let (best_seq, best_min_pos) = {
            let ctx = state.lz_stack.last().unwrap();
            if prev_id >= ctx.history.len() {
                return Err(FastoreError::CorruptedFile(
                    "LZ id outside the history window".to_string(),
                ));
            }
            let e = &ctx.history[ctx.history.len() - 1 - prev_id];
            (e.seq.clone(), e.minim_pos as i32)
        };

        let mut rec = FastqRecord::default();
        rec.seq = vec![0u8; state.seq_len];

        let mut best: &[u8] = &best_seq;
        let mut best_pos = best_min_pos;
        let mut rec_off = 0usize;

        if shift >= 0 {
            if shift as usize > best.len() {
                return Err(FastoreError::CorruptedFile("bad LZ shift".to_string()));
            }
            best = &best[shift as usize..];
            best_pos -= shift;
        } else {
            for i in 0..(-shift) as usize {
                let c = state.dec.letters_x.decode(dna_idx(b'N'));
                rec.seq[i] = IDX_DNA[c.min(4)];
            }
            rec_off = (-shift) as usize;
            best_pos += -shift;
        }
        if best_pos < 0 || best_pos as usize >= state.seq_len {
            return Err(FastoreError::CorruptedFile(
                "LZ signature position out of range".to_string(),
            ));
        }
        rec.minim_pos = best_pos as u16;

        let rec_len = state.seq_len - rec_off;
        let min_len = best.len().min(rec_len);
        let ctx_sig = state.lz_stack.last().unwrap().sig_str.clone();

        // best_pos is relative to the aligned overlap on both sides
        let overlap_sig_pos = (best_pos - rec_off as i32) as usize;

        match flag {
            flags::READ_FULL_ENCODE => {
                let mut i = 0;
                while i < min_len {
                    if i == overlap_sig_pos {
                        rec.seq[rec_off + i..rec_off + i + sig_len]
                            .copy_from_slice(&ctx_sig);
                        i += sig_len;
                        continue;
                    }
                    if state.dec.match_rle.get() {
                        rec.seq[rec_off + i] = best[i];
                    } else {
                        let c = state.dec.letters_x.decode(dna_idx(best[i]));
                        rec.seq[rec_off + i] = IDX_DNA[c.min(4)];
                    }
                    i += 1;
                }
            },
            flags::READ_FULL_EXPENSIVE => {
                let mut i = 0;
                while i < min_len {
                    if i == overlap_sig_pos {
                        rec.seq[rec_off + i..rec_off + i + sig_len]
                            .copy_from_slice(&ctx_sig);
                        i += sig_len;
                        continue;
                    }
                    if state.dec.match_binary.decode(0) != 0 {
                        rec.seq[rec_off + i] = best[i];
                    } else {
                        let c = state.dec.letters_x.decode(dna_idx(best[i]));
                        rec.seq[rec_off + i] = IDX_DNA[c.min(4)];
                    }
                    i += 1;
                }
            },
            _ => {
                rec.seq[rec_off..rec_off + min_len].copy_from_slice(&best[..min_len]);
            },
        }

        for i in min_len..rec_len {
            let c = state.dec.letters_x.decode(dna_idx(b'N'));
            rec.seq[rec_off + i] = IDX_DNA[c.min(4)];
        }

        let is_rev = state.dec.rev.decode(0) != 0;
        rec.set_reverse(is_rev);

        state.lz_stack.last_mut().unwrap().history.push(HistRead {
            seq: rec.seq.clone(),
            minim_pos: rec.minim_pos,
        });
        Ok(rec)
    }

    fn decompress_consensus(&self, state: &mut DecodeState) -> FastoreResult<()> {
        let read_len = state.seq_len;
        let begin_cut = self.params.contig.begin_cut as usize;
        let end_cut = self.params.contig.end_cut as usize;
        let sig_len = self.params.minimizer.signature_len as usize;

        let (main_seq, main_pos) = {
            let ctx = state.lz_stack.last().unwrap();
            let main = ctx.history.last().ok_or_else(|| {
                FastoreError::CorruptedFile("contig group without a root".to_string())
            })?;
            (main.seq.clone(), main.minim_pos as usize)
        };
        let ctx_sig = state.lz_stack.last().unwrap().sig_str.clone();

        // read back the consensus range
        let (range_first, range_second) = if read_len < 128 {
            let r1 = SHIFT_OFFSET - (read_len / 2) as i32;
            let r2 = SHIFT_OFFSET - (read_len * 3 / 2) as i32;
            let a = state.dec.next_tree_shift() as i32 - r1;
            let b = state.dec.next_tree_shift() as i32 - r2;
            (a, b)
        } else {
            let a = state.dec.next_tree_shift() as i32;
            let rescale = (sig_len + begin_cut + end_cut) as i32;
            let delta = state.dec.next_tree_shift() as i32;
            (a, a + delta - rescale + read_len as i32)
        };
        if range_first < 0
            || range_second < range_first
            || range_second as usize > read_len * 2
        {
            return Err(FastoreError::CorruptedFile(
                "contig range out of bounds".to_string(),
            ));
        }
        let (range_first, range_second) = (range_first as usize, range_second as usize);

        let mut consensus = ConsensusDefinition {
            sequence: vec![b'N'; read_len * 2],
            variant_positions: vec![false; read_len * 2],
            range: (range_first, range_second),
            variants_count: 0,
            read_len,
        };

        let lz_first = read_len - main_pos;
        let lz_second = lz_first + read_len;

        let mut i = range_first;
        while i < range_second {
            if i == read_len {
                i += sig_len;
                continue;
            }
            let variant = !state.dec.cons_match.get();
            consensus.variant_positions[i] = variant;
            if i < lz_first + begin_cut || i >= lz_second - end_cut || variant {
                let c = state.dec.cons_letters.decode(dna_idx(b'N'));
                consensus.sequence[i] = IDX_DNA[c.min(4)];
            } else {
                consensus.sequence[i] = main_seq[i - lz_first];
            }
            i += 1;
        }

        // member records follow until the group ends; the first one carries
        // no explicit flag
        let mut last_minim_pos = main_pos as i32;
        let mut first = true;
        while state.dec.peek_flag() != flags::READ_GROUP_END {
            let flag = if first {
                flags::READ_CONTIG_GROUP_NEXT
            } else {
                state.dec.next_flag()
            };

            match flag {
                flags::READ_IDENTICAL => {
                    let rec = self.decompress_exact_read_from_output(state)?;
                    self.finish_record(rec, state)?;
                },
                flags::READ_TREE_GROUP_START => {
                    let root = state.out.last().cloned().ok_or_else(|| {
                        FastoreError::CorruptedFile(
                            "tree group before any record".to_string(),
                        )
                    })?;
                    self.decompress_tree(&root, state)?;
                },
                flags::READ_CONTIG_GROUP_NEXT => {
                    let rec = self.decompress_consensus_read(&consensus,
                                                            &ctx_sig,
                                                            &mut last_minim_pos,
                                                            first,
                                                            state)?;
                    first = false;
                    state.lz_stack.last_mut().unwrap().history.push(HistRead {
                        seq: rec.seq.clone(),
                        minim_pos: rec.minim_pos,
                    });
                    self.finish_record(rec, state)?;
                },
                other => {
                    return Err(FastoreError::CorruptedFile(format!(
                        "invalid flag {} inside a contig group",
                        other
                    )));
                },
            }
        }

        let end = state.dec.next_flag();
        debug_assert_eq!(flags::READ_GROUP_END, end);
        Ok(())
    }

    /// Exact matches inside groups copy the most recently emitted record.
    fn decompress_exact_read_from_output(&self,
                                         state: &mut DecodeState)
                                         -> FastoreResult<FastqRecord> {
        let is_rev = state.dec.rev.decode(0) != 0;
        let prev = state.out.last().ok_or_else(|| {
            FastoreError::CorruptedFile("exact match without a parent".to_string())
        })?;
        let mut rec = FastqRecord::default();
        rec.seq = prev.seq[..prev.seq_len()].to_vec();
        rec.minim_pos = prev.minim_pos;
        rec.set_reverse(is_rev);
        Ok(rec)
    }

    fn decompress_consensus_read(&self,
                                 consensus: &ConsensusDefinition,
                                 ctx_sig: &[u8],
                                 last_minim_pos: &mut i32,
                                 use_tree_shift: bool,
                                 state: &mut DecodeState)
                                 -> FastoreResult<FastqRecord> {
        let read_len = state.seq_len;
        let begin_cut = self.params.contig.begin_cut as usize;
        let end_cut = self.params.contig.end_cut as usize;
        let sig_len = self.params.minimizer.signature_len as usize;

        let byte = if use_tree_shift {
            state.dec.next_tree_shift()
        } else {
            state.dec.next_cons_shift()
        };
        let minim_pos = if read_len * 2 >= 256 {
            byte as i32
        } else {
            *last_minim_pos + (byte as i32 - SHIFT_OFFSET)
        };
        if minim_pos < 0 || minim_pos as usize + sig_len > read_len {
            return Err(FastoreError::CorruptedFile(
                "contig member signature position out of range".to_string(),
            ));
        }
        *last_minim_pos = minim_pos;
        let min_pos = minim_pos as usize;

        let is_rev = state.dec.rev.decode(0) != 0;

        let mut rec = FastqRecord::default();
        rec.seq = vec![0u8; read_len];
        rec.minim_pos = min_pos as u16;
        rec.set_reverse(is_rev);

        let cons_start = consensus.read_len - min_pos;
        let mut i = 0;
        while i < read_len {
            if i == min_pos {
                rec.seq[i..i + sig_len].copy_from_slice(ctx_sig);
                i += sig_len;
                continue;
            }
            let inside_body = i >= begin_cut && i < read_len - end_cut;
            if !inside_body || consensus.variant_positions[cons_start + i] {
                let c = state
                    .dec
                    .cons_letters
                    .decode(dna_idx(consensus.sequence[cons_start + i]));
                rec.seq[i] = IDX_DNA[c.min(4)];
            } else {
                rec.seq[i] = consensus.sequence[cons_start + i];
            }
            i += 1;
        }
        Ok(rec)
    }

    fn decompress_tree(&self,
                       root_rec: &FastqRecord,
                       state: &mut DecodeState)
                       -> FastoreResult<()> {
        let read_len = state.seq_len;
        let sig_len = self.params.minimizer.signature_len as usize;

        let alt_pos = if read_len * 2 >= 256 {
            state.dec.next_tree_shift() as i32
        } else {
            let shift = state.dec.next_tree_shift() as i32 - SHIFT_OFFSET;
            root_rec.minim_pos as i32 + shift
        };
        if alt_pos < 0 || alt_pos as usize + sig_len > read_len {
            return Err(FastoreError::CorruptedFile(
                "subtree signature position out of range".to_string(),
            ));
        }
        let alt_pos = alt_pos as usize;

        let sig_str = root_rec.seq[alt_pos..alt_pos + sig_len].to_vec();
        state.lz_stack.push(DecodeLzContext {
            history: vec![HistRead {
                seq: root_rec.seq[..root_rec.seq_len().min(read_len)].to_vec(),
                minim_pos: alt_pos as u16,
            }],
            sig_str,
        });

        while state.dec.peek_flag() != flags::READ_GROUP_END {
            let flag = state.dec.next_flag();
            self.dispatch_flag(flag, state)?;
        }
        let end = state.dec.next_flag();
        debug_assert_eq!(flags::READ_GROUP_END, end);

        state.lz_stack.pop();

        // several subtrees can hang off the same root
        if state.dec.peek_flag() == flags::READ_TREE_GROUP_START {
            state.dec.next_flag();
            self.decompress_tree(root_rec, state)?;
        }
        Ok(())
    }

    fn decompress_pair(&self,
                       rec: &mut FastqRecord,
                       state: &mut DecodeState)
                       -> FastoreResult<()> {
        let pe = state.pe.as_mut().unwrap();
        let swapped = pe.swap.decode(0) != 0;
        rec.set_pair_swapped(swapped);

        let mate_len = state.aux_len;
        let flag = pe.flag.decode(pe.last_flag);
        pe.last_flag = flag;

        let mate: Vec<u8> = match flag {
            pe_flags::DIFFICULT => {
                let start = pe.hard_pos;
                if start + mate_len > pe.hard.len() {
                    return Err(truncated());
                }
                pe.hard_pos += mate_len;
                pe.hard[start..start + mate_len].to_vec()
            },
            pe_flags::IDENTICAL => {
                let id = pe.lz_id.get() as usize;
                if id >= pe.history.len() {
                    return Err(truncated());
                }
                pe.history[pe.history.len() - 1 - id].clone()
            },
            pe_flags::FULL_ENCODE | pe_flags::FULL_EXPENSIVE => {
                let id = pe.lz_id.get() as usize;
                if id >= pe.history.len() {
                    return Err(truncated());
                }
                let _shift = {
                    let b = pe.shift.get(pe.shift_pos).copied().unwrap_or(0);
                    pe.shift_pos += 1;
                    b as i32 - SHIFT_OFFSET
                };
                let cand = pe.history[pe.history.len() - 1 - id].clone();
                let overlap = mate_len.min(cand.len());
                let mut mate = vec![0u8; mate_len];
                if flag == pe_flags::FULL_ENCODE {
                    for (j, slot) in mate.iter_mut().enumerate().take(overlap) {
                        if pe.match_rle.get() {
                            *slot = cand[j];
                        } else {
                            let c = pe.letters.decode(dna_idx(cand[j]));
                            *slot = IDX_DNA[c.min(4)];
                        }
                    }
                } else {
                    for (j, slot) in mate.iter_mut().enumerate().take(overlap) {
                        if pe.match_binary.decode(0) != 0 {
                            *slot = cand[j];
                        } else {
                            let c = pe.letters.decode(dna_idx(cand[j]));
                            *slot = IDX_DNA[c.min(4)];
                        }
                    }
                }
                for slot in mate.iter_mut().skip(overlap) {
                    let c = pe.letters.decode(dna_idx(b'N'));
                    *slot = IDX_DNA[c.min(4)];
                }
                mate
            },
            other => {
                return Err(FastoreError::CorruptedFile(format!(
                    "invalid pair flag {}",
                    other
                )));
            },
        };

        pe.history.push(mate.clone());
        let window = self.params.classifier.pair_lz_window.max(1);
        if pe.history.len() > window {
            pe.history.remove(0);
        }

        rec.seq.extend_from_slice(&mate);
        Ok(())
    }
}

fn truncated() -> FastoreError {
    FastoreError::CorruptedFile("compressed block stream truncated".to_string())
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::graph::SubTree;
    use crate::params::{ArchiveType, CompressorParams};
    use crate::quality::QualityCompressionData;

    fn params() -> CompressorParams {
        CompressorParams::default()
    }

    fn rec(seq: &[u8], min_pos: u16) -> FastqRecord {
        let mut r = FastqRecord::new(seq.to_vec(), vec![b'I'; seq.len()], Vec::new());
        r.minim_pos = min_pos;
        r
    }

    /// Pick the signature id matching the given record window so that the
    /// decoder reconstructs the identical bytes.
    fn signature_of(seq: &[u8], pos: usize) -> u32 {
        let mut sig = 0u32;
        for &b in &seq[pos..pos + 8] {
            sig = (sig << 2)
                | match b {
                    b'A' => 0,
                    b'C' => 1,
                    b'G' => 2,
                    b'T' => 3,
                    _ => 0,
                };
        }
        sig
    }

    fn roundtrip(records: Vec<FastqRecord>, signature: u32) -> Vec<FastqRecord> {
        let p = params();
        let qua = QualityCompressionData::default();
        let compressor = LzCompressor::new(p.clone(), qua.clone(), None);
        let raw_dna: u64 = records.iter().map(|r| r.full_len() as u64).sum();

        let mut recs = records;
        let graph = Graph::from_records(0..recs.len());
        let block = compressor
            .compress_bin(&mut recs, graph, signature, raw_dna, 0)
            .unwrap();

        let decompressor = Decompressor::new(p, qua, None);
        let (sig, out) = decompressor.decompress_block(&block.data).unwrap();
        assert_eq!(signature, sig);
        out
    }

    fn sorted_seqs(records: &[FastqRecord]) -> Vec<Vec<u8>> {
        let mut seqs: Vec<Vec<u8>> = records.iter().map(|r| r.seq.clone()).collect();
        seqs.sort();
        seqs
    }

    #[test]
    fn single_hard_read_roundtrip() {
        // scenario (a): one record, signature ACGTACGT at position 0
        let seq = b"ACGTACGTACGT";
        let sig = signature_of(seq, 0);
        let records = vec![rec(seq, 0)];
        let out = roundtrip(records.clone(), sig);
        assert_eq!(1, out.len());
        assert_eq!(records[0].seq, out[0].seq);
        assert_eq!(records[0].qua, out[0].qua);
        assert_eq!(0, out[0].minim_pos);
    }

    #[test]
    fn exact_duplicates_roundtrip_adjacent() {
        // scenario (b): identical reads decode adjacently
        let seq = b"TGCATGCAGGTTCCAA";
        let sig = signature_of(seq, 0);
        let mut records = vec![rec(seq, 0), rec(seq, 0)];
        // a third, different read in the same bin
        let mut other = seq.to_vec();
        other[12] = b'G';
        records.push(rec(&other, 0));

        let out = roundtrip(records.clone(), sig);
        assert_eq!(3, out.len());
        assert_eq!(sorted_seqs(&records), sorted_seqs(&out));

        let dup_positions: Vec<usize> = out
            .iter()
            .enumerate()
            .filter(|(_, r)| r.seq == seq.to_vec())
            .map(|(i, _)| i)
            .collect();
        assert_eq!(2, dup_positions.len());
        assert_eq!(dup_positions[0] + 1, dup_positions[1]);
    }

    #[test]
    fn lz_matches_roundtrip() {
        let base = b"CGCGTATACCGGTTAACCGGTTAA";
        let sig = signature_of(base, 0);
        let mut records = vec![rec(base, 0)];
        for i in 0..6 {
            let mut seq = base.to_vec();
            seq[10 + i] = b"ACGT"[(i + 1) % 4];
            records.push(rec(&seq, 0));
        }
        let out = roundtrip(records.clone(), sig);
        assert_eq!(records.len(), out.len());
        assert_eq!(sorted_seqs(&records), sorted_seqs(&out));
    }

    #[test]
    fn shifted_reads_roundtrip() {
        // overlapping genome samples with varying signature positions
        let mut genome = Vec::new();
        while genome.len() < 64 {
            genome.extend_from_slice(b"CGTTAGCATGCAGGTC");
        }
        let sig_pos = 20;
        let sig = signature_of(&genome, sig_pos);

        let mut records = Vec::new();
        for start in 0..8 {
            let mut r = rec(&genome[start..start + 32], (sig_pos - start) as u16);
            r.qua = (0..32).map(|i| 33 + ((start + i) % 40) as u8).collect();
            records.push(r);
        }
        let out = roundtrip(records.clone(), sig);
        assert_eq!(records.len(), out.len());
        assert_eq!(sorted_seqs(&records), sorted_seqs(&out));
        // qualities are byte-exact in lossless mode
        let mut in_quas: Vec<Vec<u8>> = records.iter().map(|r| r.qua.clone()).collect();
        let mut out_quas: Vec<Vec<u8>> = out.iter().map(|r| r.qua.clone()).collect();
        in_quas.sort();
        out_quas.sort();
        assert_eq!(in_quas, out_quas);
    }

    #[test]
    fn contig_group_roundtrip() {
        // scenario (c): a family large enough to trigger contig building
        let mut genome = Vec::new();
        while genome.len() < 80 {
            genome.extend_from_slice(b"ACGGTCCATGTTGACC");
        }
        let sig_pos = 20;
        let sig = signature_of(&genome, sig_pos);

        let mut records = Vec::new();
        for start in 0..16 {
            records.push(rec(&genome[start..start + 32], (sig_pos - start) as u16));
        }
        let out = roundtrip(records.clone(), sig);
        assert_eq!(records.len(), out.len());
        assert_eq!(sorted_seqs(&records), sorted_seqs(&out));
    }

    #[test]
    fn reverse_flag_survives() {
        let seq = b"GGCCTATAGCGCAATT";
        let sig = signature_of(seq, 2);
        let mut r = rec(seq, 2);
        r.set_reverse(true);
        let out = roundtrip(vec![r], sig);
        assert!(out[0].is_reverse());
    }

    #[test]
    fn subtree_group_roundtrip() {
        let p = params();
        let qua = QualityCompressionData::default();
        let compressor = LzCompressor::new(p.clone(), qua.clone(), None);

        // root record carries an old signature at position 10
        let root_seq = b"ACGTACGTCCTTGGCATAAGCCGGAATTCCGG";
        let sig = signature_of(root_seq, 0);

        let mut records = vec![rec(root_seq, 0)];
        // members matching the root around the old signature position
        for i in 0..3 {
            let mut seq = root_seq.to_vec();
            seq[28] = b"ACGT"[i];
            records.push(rec(&seq, 10));
        }

        let mut graph = Graph::from_records(0..1);
        graph.nodes[0].sub_trees.push(0);
        graph.sub_trees.push(SubTree {
            signature_id: signature_of(root_seq, 10),
            main_signature_pos: 10,
            graph: Graph::from_records(1..4),
        });

        let raw_dna: u64 = records.iter().map(|r| r.full_len() as u64).sum();
        let mut recs = records.clone();
        let block = compressor
            .compress_bin(&mut recs, graph, sig, raw_dna, 0)
            .unwrap();

        let decompressor = Decompressor::new(p, qua, None);
        let (_, out) = decompressor.decompress_block(&block.data).unwrap();
        assert_eq!(records.len(), out.len());
        assert_eq!(sorted_seqs(&records), sorted_seqs(&out));
    }

    #[test]
    fn raw_store_roundtrip() {
        let p = params();
        let qua = QualityCompressionData::default();
        let n_bin = p.minimizer.n_bin_id();
        let raw = RawCompressor::new(p.clone(), qua.clone(), None);

        let records = vec![
            rec(b"NNNNNNNNNNNN", 0),
            rec(b"ACGTNNNNACGTACGT", 0),
            rec(b"TTNNTT", 0),
        ];
        let raw_dna: u64 = records.iter().map(|r| r.full_len() as u64).sum();
        let block = raw.compress_bin(&records, n_bin, raw_dna, 0).unwrap();

        let decompressor = Decompressor::new(p, qua, None);
        let (sig, out) = decompressor.decompress_block(&block.data).unwrap();
        assert_eq!(n_bin, sig);
        assert_eq!(records.len(), out.len());
        for (a, b) in records.iter().zip(&out) {
            assert_eq!(a.seq, b.seq);
            assert_eq!(a.qua, b.qua);
        }
    }

    #[test]
    fn corrupt_block_is_rejected() {
        let p = params();
        let decompressor =
            Decompressor::new(p, QualityCompressionData::default(), None);
        assert!(matches!(decompressor.decompress_block(&[1, 2, 3]),
                         Err(FastoreError::CorruptedFile(_))));
    }

    #[test]
    fn paired_end_roundtrip() {
        let mut p = params();
        p.archive_type = ArchiveType {
            paired_end: true,
            ..ArchiveType::default()
        };
        let qua = QualityCompressionData::default();
        let compressor = LzCompressor::new(p.clone(), qua.clone(), None);

        let base1 = b"CGCGTATACCGGTTAA";
        let base2 = b"TTGGCCAATTGGCCAA";
        let sig = signature_of(base1, 0);

        let mut records = Vec::new();
        for i in 0..5 {
            let mut seq = Vec::new();
            let mut m1 = base1.to_vec();
            m1[12] = b"ACGT"[i % 4];
            seq.extend_from_slice(&m1);
            let mut m2 = base2.to_vec();
            m2[8] = b"ACGT"[(i + 2) % 4];
            seq.extend_from_slice(&m2);
            let mut r = FastqRecord::new(seq, vec![b'I'; 32], Vec::new());
            r.aux_len = 16;
            r.minim_pos = 0;
            if i == 2 {
                r.set_pair_swapped(true);
            }
            records.push(r);
        }

        let raw_dna: u64 = records.iter().map(|r| r.full_len() as u64).sum();
        let mut recs = records.clone();
        let graph = Graph::from_records(0..recs.len());
        let block = compressor
            .compress_bin(&mut recs, graph, sig, raw_dna, 0)
            .unwrap();

        let decompressor = Decompressor::new(p, qua, None);
        let (_, out) = decompressor.decompress_block(&block.data).unwrap();
        assert_eq!(records.len(), out.len());
        assert_eq!(sorted_seqs(&records), sorted_seqs(&out));
        assert_eq!(1, out.iter().filter(|r| r.is_pair_swapped()).count());
        for r in &out {
            assert_eq!(16, r.aux_len);
            assert_eq!(32, r.full_len());
        }
    }
}
