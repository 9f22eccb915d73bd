//! Stage 4.2: greedy consensus-contig construction over one match tree.
//!
//! A contig is a pseudo-reference twice as long as a read. Members are
//! accepted when they fit the running consensus within the variant and
//! Hamming budgets and when encoding against the consensus is estimated
//! cheaper than their normal LZ encoding. Records that introduced a variant
//! no other record shares are dropped again, variant columns are settled by
//! majority vote, and the tree is relinked so the cheapest member becomes
//! the contig's root.

use std::collections::VecDeque;

use crate::graph::{Graph, NodeId, NodeType};
use crate::params::{ContigParams, MinimizerParams};
use crate::records::FastqRecord;

const EMPTY: u8 = b'.';

/// The consensus sequence and its variant map.
#[derive(Clone, Debug, Default)]
pub struct ConsensusDefinition {
    pub sequence: Vec<u8>,
    pub variant_positions: Vec<bool>,
    /// Half-open interval of validly defined consensus positions.
    pub range: (usize, usize),
    pub variants_count: u32,
    pub read_len: usize,
}

/// A built contig: its consensus plus the member nodes (the relinked main
/// node excluded), sorted by signature position.
#[derive(Clone, Debug)]
pub struct ContigDefinition {
    pub consensus: ConsensusDefinition,
    pub nodes: Vec<NodeId>,
}

#[derive(Clone, Debug)]
struct WorkNode {
    node: NodeId,
    new_variant_positions: Vec<u16>,
}

struct BuildInfo {
    consensus: ConsensusDefinition,
    variant_freq: Vec<u16>,
    records_per_pos: Vec<u16>,
    nodes: Vec<WorkNode>,
    removed: Vec<NodeId>,
    main_node: Option<NodeId>,
}

impl BuildInfo {
    fn new(read_len: usize) -> Self {
        BuildInfo {
            consensus: ConsensusDefinition {
                sequence: vec![EMPTY; read_len * 2],
                variant_positions: vec![false; read_len * 2],
                range: (read_len, read_len),
                variants_count: 0,
                read_len,
            },
            variant_freq: vec![0; read_len * 2],
            records_per_pos: vec![0; read_len * 2],
            nodes: Vec::new(),
            removed: Vec::new(),
            main_node: None,
        }
    }

    fn reset(&mut self) {
        let read_len = self.consensus.read_len;
        self.consensus.sequence.fill(EMPTY);
        self.consensus.variant_positions.fill(false);
        self.consensus.range = (read_len, read_len);
        self.consensus.variants_count = 0;
        self.variant_freq.fill(0);
        self.records_per_pos.fill(0);
        self.nodes.clear();
        self.main_node = None;
    }
}

/// Enqueue a node's children, leaves first.
fn queue_children(queue: &mut VecDeque<NodeId>, graph: &Graph, node: NodeId) {
    let children = &graph.nodes[node].children;
    if children.len() > 1 {
        let mut inner = Vec::new();
        for &child in children {
            if graph.nodes[child].has_children() {
                inner.push(child);
            } else {
                queue.push_back(child);
            }
        }
        queue.extend(inner);
    } else if let Some(&only) = children.first() {
        queue.push_back(only);
    }
}

pub struct ContigBuilder {
    params: ContigParams,
    minimizer: MinimizerParams,
}

impl ContigBuilder {
    pub fn new(params: ContigParams, minimizer: MinimizerParams) -> Self {
        ContigBuilder { params, minimizer }
    }

    /// Estimated cost of keeping the node as a normal LZ match.
    fn normal_encode_cost(&self, graph: &Graph, node: NodeId) -> f32 {
        let n = &graph.nodes[node];
        let cost = n.encode_cost as f32;
        let rle_cost = if (n.shift as i32).abs() != n.encode_cost as i32 {
            1.0 + cost / 1.5
        } else {
            0.0
        };
        (1.0 + cost) + rle_cost + 2.0
    }

    /// Estimated cost of encoding the node as a consensus member.
    fn consensus_encode_cost(&self,
                             info: &BuildInfo,
                             work: &WorkNode,
                             mut hamming: u32)
                             -> f32 {
        let new_var_cost: u32 = work
            .new_variant_positions
            .iter()
            .map(|&p| info.records_per_pos[p as usize] as u32)
            .sum();
        if new_var_cost > 0 {
            hamming -= 1;
        }
        (1 + hamming + self.params.begin_cut + self.params.end_cut) as f32
            + new_var_cost as f32 * 0.9
    }

    fn range_first(&self, min_pos: usize, cons_begin: usize) -> usize {
        let begin_cut = self.params.begin_cut as usize;
        let sig_len = self.minimizer.signature_len as usize;
        if min_pos <= begin_cut {
            cons_begin + min_pos + sig_len
        } else {
            cons_begin + begin_cut
        }
    }

    fn range_second(&self, read_len: usize, min_pos: usize, cons_begin: usize) -> usize {
        let end_cut = self.params.end_cut as usize;
        let sig_len = self.minimizer.signature_len as usize;
        if read_len - min_pos - sig_len <= end_cut {
            cons_begin + min_pos
        } else {
            cons_begin + read_len - end_cut
        }
    }

    /// Try to merge one LZ node into the consensus.
    fn add_record(&self,
                  info: &mut BuildInfo,
                  graph: &Graph,
                  records: &[FastqRecord],
                  node: NodeId,
                  full_match_only: bool)
                  -> bool {
        debug_assert_eq!(NodeType::Lz, graph.nodes[node].node_type);

        // nested subtrees stay out of contigs
        if !graph.nodes[node].sub_trees.is_empty() {
            return false;
        }

        let rec = &records[graph.nodes[node].record];
        let read_len = info.consensus.read_len;
        debug_assert_eq!(read_len, rec.seq_len());

        let begin_cut = self.params.begin_cut as usize;
        let end_cut = self.params.end_cut as usize;
        let min_pos = rec.minim_pos as usize;
        let cons_begin = read_len - min_pos;

        if info.nodes.is_empty() {
            // the first member seeds the consensus verbatim; reads with N
            // do not qualify
            if rec.seq_1().contains(&b'N') {
                return false;
            }
            for i in begin_cut..read_len - end_cut {
                info.consensus.sequence[cons_begin + i] = rec.seq[i];
            }
            info.consensus.range.0 = self.range_first(min_pos, cons_begin);
            info.consensus.range.1 = self.range_second(read_len, min_pos, cons_begin);
            info.nodes.push(WorkNode {
                node,
                new_variant_positions: Vec::new(),
            });
            return true;
        }

        let mut work = WorkNode {
            node,
            new_variant_positions: Vec::new(),
        };
        let mut hamming = 0u32;
        for i in begin_cut..read_len - end_cut {
            let p = cons_begin + i;
            let cons = info.consensus.sequence[p];
            if cons != EMPTY && cons != rec.seq[i] {
                hamming += 1;
                if info.variant_freq[p] == 0 {
                    work.new_variant_positions.push(p as u16);
                }
            } else if cons == EMPTY && rec.seq[i] == b'N' {
                return false;
            }
        }

        if full_match_only {
            if !work.new_variant_positions.is_empty() {
                return false;
            }
        } else {
            let max_shift = if self.params.max_record_shift_difference == 0 {
                (read_len / 2) as i32
            } else {
                self.params.max_record_shift_difference as i32
            };
            let last = &records[graph.nodes[info.nodes.last().unwrap().node].record];
            let shift_diff = (last.minim_pos as i32 - rec.minim_pos as i32).abs();

            let acceptable = work.new_variant_positions.is_empty()
                || (hamming <= self.params.max_hamming_distance
                    && work.new_variant_positions.len()
                        <= self.params.max_new_variants_per_read as usize);
            if !acceptable
                || shift_diff > max_shift
                || self.consensus_encode_cost(info, &work, hamming)
                    > self.normal_encode_cost(graph, node)
            {
                return false;
            }
        }

        info.consensus.variants_count += work.new_variant_positions.len() as u32;
        for i in begin_cut..read_len - end_cut {
            let p = cons_begin + i;
            if info.consensus.sequence[p] == EMPTY {
                info.consensus.sequence[p] = rec.seq[i];
            } else if info.consensus.sequence[p] != rec.seq[i] {
                info.variant_freq[p] += 1;
            }
            info.records_per_pos[p] += 1;
        }

        info.consensus.range.0 = info
            .consensus
            .range
            .0
            .min(self.range_first(min_pos, cons_begin));
        info.consensus.range.1 = info
            .consensus
            .range
            .1
            .max(self.range_second(read_len, min_pos, cons_begin));

        info.nodes.push(work);
        true
    }

    /// Drop members whose variants nobody else shares, rebuilding the
    /// consensus from scratch. Returns the number of removed members.
    fn optimize(&self,
                info: &mut BuildInfo,
                graph: &Graph,
                records: &[FastqRecord])
                -> u32 {
        let to_remove: Vec<usize> = info
            .nodes
            .iter()
            .enumerate()
            .filter(|(_, n)| {
                n.new_variant_positions
                    .iter()
                    .any(|&p| info.variant_freq[p as usize] == 1)
            })
            .map(|(i, _)| i)
            .collect();

        if to_remove.is_empty() {
            return 0;
        }

        let old_nodes = std::mem::take(&mut info.nodes);
        let removed_before = info.removed.len();
        let mut keep = Vec::new();
        let mut removal = to_remove.iter().peekable();
        for (i, n) in old_nodes.into_iter().enumerate() {
            if removal.peek() == Some(&&i) {
                removal.next();
                info.removed.push(n.node);
            } else {
                keep.push(n);
            }
        }

        info.reset();

        for work in keep {
            let added = self.add_record_unchecked(info, graph, records, work.node);
            debug_assert!(added);
            let _ = added;
        }

        (info.removed.len() - removed_before) as u32
    }

    /// Re-insert a member while rebuilding, without admission checks.
    fn add_record_unchecked(&self,
                            info: &mut BuildInfo,
                            graph: &Graph,
                            records: &[FastqRecord],
                            node: NodeId)
                            -> bool {
        let rec = &records[graph.nodes[node].record];
        let read_len = info.consensus.read_len;
        let begin_cut = self.params.begin_cut as usize;
        let end_cut = self.params.end_cut as usize;
        let min_pos = rec.minim_pos as usize;
        let cons_begin = read_len - min_pos;

        let mut work = WorkNode {
            node,
            new_variant_positions: Vec::new(),
        };
        if !info.nodes.is_empty() {
            for i in begin_cut..read_len - end_cut {
                let p = cons_begin + i;
                let cons = info.consensus.sequence[p];
                if cons != EMPTY && cons != rec.seq[i] && info.variant_freq[p] == 0 {
                    work.new_variant_positions.push(p as u16);
                }
            }
            info.consensus.variants_count += work.new_variant_positions.len() as u32;
        }

        for i in begin_cut..read_len - end_cut {
            let p = cons_begin + i;
            if info.consensus.sequence[p] == EMPTY {
                info.consensus.sequence[p] = rec.seq[i];
            } else if info.consensus.sequence[p] != rec.seq[i] {
                info.variant_freq[p] += 1;
            }
            info.records_per_pos[p] += 1;
        }

        if info.nodes.is_empty() {
            info.consensus.range.0 = self.range_first(min_pos, cons_begin);
            info.consensus.range.1 = self.range_second(read_len, min_pos, cons_begin);
        } else {
            info.consensus.range.0 = info
                .consensus
                .range
                .0
                .min(self.range_first(min_pos, cons_begin));
            info.consensus.range.1 = info
                .consensus
                .range
                .1
                .max(self.range_second(read_len, min_pos, cons_begin));
        }

        info.nodes.push(work);
        true
    }

    /// Pick the cheapest member with a parent outside the contig as the
    /// contig's root and rewire every in/out edge through it.
    fn update_linkage(&self, info: &mut BuildInfo, graph: &mut Graph) -> bool {
        let mut cons_nodes: Vec<NodeId> = info.nodes.iter().map(|n| n.node).collect();
        cons_nodes.sort_unstable();

        let mut best_parent: Option<NodeId> = None;
        let mut min_cost = i32::MAX;

        let member_ids: Vec<NodeId> = info.nodes.iter().map(|w| w.node).collect();
        for node in member_ids {
            let parent = match graph.nodes[node].parent {
                Some(p) => p,
                None => continue,
            };
            if cons_nodes.binary_search(&parent).is_ok() {
                continue;
            }

            graph.remove_child(parent, node);

            if !info.removed.contains(&parent)
                && (info.main_node.is_none()
                    || min_cost > graph.nodes[node].encode_cost as i32)
            {
                best_parent = Some(parent);
                info.main_node = Some(node);
                min_cost = graph.nodes[node].encode_cost as i32;
            }
        }

        let (main, best_parent) = match (info.main_node, best_parent) {
            (Some(m), Some(p)) => (m, p),
            _ => return false,
        };

        graph.add_child(best_parent, main);

        info.nodes.retain(|w| w.node != main);
        let pos = cons_nodes.binary_search(&main).unwrap();
        cons_nodes.remove(pos);

        // the main node keeps only its non-member children
        let main_children: Vec<NodeId> = graph.nodes[main].children.clone();
        for child in main_children {
            if cons_nodes.binary_search(&child).is_ok() {
                graph.remove_child(main, child);
            }
        }

        // member children outside the contig hang off the main node instead
        for work in info.nodes.clone() {
            let children: Vec<NodeId> = graph.nodes[work.node].children.clone();
            for child in children {
                graph.remove_child(work.node, child);
                if cons_nodes.binary_search(&child).is_err() {
                    graph.add_child(main, child);
                }
            }
        }
        true
    }

    /// Majority-vote the variant columns, finalize the variant bitmap and
    /// order members by signature position.
    fn post_process(&self,
                    info: &mut BuildInfo,
                    graph: &Graph,
                    records: &[FastqRecord]) {
        let read_len = info.consensus.read_len;
        let begin_cut = self.params.begin_cut as usize;
        let end_cut = self.params.end_cut as usize;

        if info.consensus.variants_count != 0 {
            let mut votes: Vec<[u32; 5]> = vec![[0; 5]; read_len * 2];
            let mut has_votes = vec![false; read_len * 2];

            for work in &info.nodes {
                let rec = &records[graph.nodes[work.node].record];
                let cons_begin = read_len - rec.minim_pos as usize;
                for i in begin_cut..read_len - end_cut {
                    let p = cons_begin + i;
                    if info.variant_freq[p] > 0 {
                        votes[p][base_index(rec.seq[i])] += 1;
                        has_votes[p] = true;
                    }
                }
            }

            const BASES: [u8; 5] = [b'A', b'G', b'C', b'T', b'N'];
            for p in 0..read_len * 2 {
                if has_votes[p] {
                    let mut best = b'N';
                    let mut best_count = 0;
                    for (i, &count) in votes[p].iter().enumerate() {
                        if count > best_count {
                            best_count = count;
                            best = BASES[i];
                        }
                    }
                    info.consensus.sequence[p] = best;
                }
            }
        }

        let mut variants = 0;
        for (p, &freq) in info.variant_freq.iter().enumerate() {
            info.consensus.variant_positions[p] = freq != 0;
            variants += (freq != 0) as u32;
        }
        info.consensus.variants_count = variants;

        for b in info.consensus.sequence.iter_mut() {
            if *b == EMPTY {
                *b = b'N';
            }
        }

        let min_pos_of =
            |w: &WorkNode| records[graph.nodes[w.node].record].minim_pos;
        info.nodes.sort_by_key(min_pos_of);
    }

    /// Attempt contig construction over the tree rooted at `root`.
    /// Successful contigs are appended to `contigs` and wired into the
    /// graph; the member node types switch to [`NodeType::ContigRead`].
    pub fn build(&self,
                 root: NodeId,
                 graph: &mut Graph,
                 records: &[FastqRecord],
                 contigs: &mut Vec<ContigDefinition>)
                 -> bool {
        let read_len = records[graph.nodes[root].record].seq_len();
        let mut next_queue = VecDeque::new();

        // the root itself is never part of a consensus
        if graph.nodes[root].has_children() {
            queue_children(&mut next_queue, graph, root);
        }

        let mut info = BuildInfo::new(read_len);
        let mut built_any = false;

        while let Some(seed) = next_queue.pop_front() {
            info.reset();
            info.removed.clear();

            if !self.add_record(&mut info, graph, records, seed, false) {
                if graph.nodes[seed].has_children() {
                    queue_children(&mut next_queue, graph, seed);
                }
                continue;
            }

            let mut cur_queue = std::mem::take(&mut next_queue);
            if graph.nodes[seed].has_children() {
                queue_children(&mut cur_queue, graph, seed);
            }

            // first pass: perfect fits only
            while let Some(node) = cur_queue.pop_front() {
                if self.add_record(&mut info, graph, records, node, true) {
                    if graph.nodes[node].has_children() {
                        queue_children(&mut cur_queue, graph, node);
                    }
                } else {
                    next_queue.push_back(node);
                }
            }

            // second pass: allow new variants
            std::mem::swap(&mut cur_queue, &mut next_queue);
            while let Some(node) = cur_queue.pop_front() {
                if self.add_record(&mut info, graph, records, node, false) {
                    if graph.nodes[node].has_children() {
                        queue_children(&mut cur_queue, graph, node);
                    }
                } else {
                    next_queue.push_back(node);
                }
            }

            if info.nodes.len() < self.params.min_consensus_size {
                continue;
            }

            self.optimize(&mut info, graph, records);
            if info.nodes.len() < self.params.min_consensus_size {
                continue;
            }

            if !self.update_linkage(&mut info, graph) {
                continue;
            }
            self.post_process(&mut info, graph, records);

            // store: mark members and attach the definition to the main node
            let main = info.main_node.unwrap();
            for work in &info.nodes {
                graph.nodes[work.node].node_type = NodeType::ContigRead;
            }
            graph.nodes[main].node_type = NodeType::Lz;
            graph.nodes[main].contig = Some(contigs.len());
            contigs.push(ContigDefinition {
                consensus: std::mem::replace(&mut info.consensus,
                                             BuildInfo::new(read_len).consensus),
                nodes: info.nodes.iter().map(|w| w.node).collect(),
            });
            built_any = true;
        }

        built_any
    }
}

fn base_index(base: u8) -> usize {
    match base {
        b'A' => 0,
        b'G' => 1,
        b'C' => 2,
        b'T' => 3,
        _ => 4,
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::classifier::ReadsClassifier;
    use crate::params::{ClassifierParams, ContigParams};
    use crate::records::FastqRecord;

    const READ_LEN: usize = 32;
    const SIG_POS: usize = 20;

    /// Reads sampled from a synthetic genome so that they overlap with
    /// different shifts but share the signature window at genome position
    /// `SIG_POS`; classify them and run the contig builder over each root.
    fn build_family(count: usize,
                    mutate: bool)
                    -> (Vec<FastqRecord>, Graph, Vec<ContigDefinition>) {
        let mut genome = Vec::new();
        let pattern = b"ACGGTCCATGTTGACC";
        while genome.len() < READ_LEN + count {
            genome.extend_from_slice(pattern);
        }

        let mut reads = Vec::new();
        for start in 0..count {
            let mut seq = genome[start..start + READ_LEN].to_vec();
            if mutate && start % 5 == 2 {
                // one variant column, shared by every fifth read
                let col = SIG_POS + 10 - start;
                if col >= 2 && col < READ_LEN - 2 {
                    seq[col] = b'T';
                }
            }
            let mut r = FastqRecord::new(seq, vec![b'I'; READ_LEN], Vec::new());
            r.minim_pos = (SIG_POS - start) as u16;
            reads.push(r);
        }

        let classifier =
            ReadsClassifier::new(MinimizerParams::default(), ClassifierParams::default());
        let mut graph = Graph::from_records(0..reads.len());
        graph.sort_nodes(&reads);
        let roots = classifier.construct_match_tree(&reads, &mut graph);

        let builder =
            ContigBuilder::new(ContigParams::default(), MinimizerParams::default());
        let mut contigs = Vec::new();
        for root in roots {
            if graph.nodes[root].has_children() {
                builder.build(root, &mut graph, &reads, &mut contigs);
            }
        }
        (reads, graph, contigs)
    }

    #[test]
    fn contig_forms_over_overlapping_reads() {
        let (_, graph, contigs) = build_family(16, false);
        assert_eq!(1, contigs.len());
        let contig = &contigs[0];
        assert!(contig.nodes.len() >= ContigParams::default().min_consensus_size);

        // the main node carries the definition and stays an LZ node
        let main_id = graph
            .nodes
            .iter()
            .position(|n| n.contig == Some(0))
            .expect("main node must exist");
        assert_eq!(NodeType::Lz, graph.nodes[main_id].node_type);
        for &member in &contig.nodes {
            assert_ne!(member, main_id);
            assert_eq!(NodeType::ContigRead, graph.nodes[member].node_type);
            assert!(graph.nodes[member].parent.is_none());
        }
    }

    #[test]
    fn members_sorted_by_signature_position() {
        let (reads, graph, contigs) = build_family(16, false);
        let contig = contigs.first().expect("contig expected");
        let positions: Vec<u16> = contig
            .nodes
            .iter()
            .map(|&n| reads[graph.nodes[n].record].minim_pos)
            .collect();
        assert!(positions.windows(2).all(|w| w[0] <= w[1]));
    }

    #[test]
    fn variant_bitmap_matches_count(){
        let (_, _, contigs) = build_family(16, true);
        for contig in &contigs {
            let set_bits = contig
                .consensus
                .variant_positions
                .iter()
                .filter(|&&b| b)
                .count() as u32;
            assert_eq!(set_bits, contig.consensus.variants_count);
        }
    }

    #[test]
    fn small_families_build_nothing() {
        let (_, _, contigs) = build_family(4, false);
        assert!(contigs.is_empty());
    }

    #[test]
    fn consensus_range_is_inside_double_length() {
        let (_, _, contigs) = build_family(16, false);
        for contig in &contigs {
            let (a, b) = contig.consensus.range;
            assert!(a <= b);
            assert!(b <= contig.consensus.read_len * 2);
        }
    }

    #[test]
    fn consensus_matches_members_outside_variants() {
        let (reads, graph, contigs) = build_family(16, false);
        let contig = contigs.first().expect("contig expected");
        let cons = &contig.consensus;
        for &member in &contig.nodes {
            let rec = &reads[graph.nodes[member].record];
            let cons_begin = cons.read_len - rec.minim_pos as usize;
            for i in 2..cons.read_len - 2 {
                let p = cons_begin + i;
                if !cons.variant_positions[p] {
                    assert_eq!(cons.sequence[p], rec.seq[i]);
                }
            }
        }
    }
}
