//! Stage 4.1: the LZ read classifier.
//!
//! Reads arrive sorted by their signature suffix; each one is matched
//! against a sliding window of the most recent reads. The cheapest match
//! within the encode threshold links the read into the forest, zero-cost
//! same-length matches merge into the parent's exact-match group, and
//! everything else roots a new tree as a hard read.

use std::collections::BTreeSet;
use std::collections::VecDeque;

use crate::graph::{Graph, NodeId, NodeType};
use crate::params::{ClassifierParams, MinimizerParams};
use crate::records::FastqRecord;

/// Largest shift value representable in the shift stream.
pub const MAX_INSERT: i32 = 127;

/// Result of one window scan.
#[derive(Clone, Copy, Debug)]
pub struct MatchResult {
    pub cost: i32,
    pub no_mismatches: bool,
    pub shift: i32,
    pub prev_id: usize,
}

struct LzEntry {
    seq: Vec<u8>,
    min_pos: i32,
    node: Option<NodeId>,
}

/// Cost of aligning `seq` against one candidate so their signatures
/// coincide; updates `result` when the candidate is cheaper. Mirrors the
/// shift-plus-mismatch metric used throughout the pipeline.
pub fn update_lz_match(result: &mut MatchResult,
                       seq: &[u8],
                       min_pos: i32,
                       lz_seq: &[u8],
                       lz_min_pos: i32,
                       shift_cost: i32,
                       mismatch_cost: i32)
                       -> bool {
    let shift = lz_min_pos - min_pos;
    let insert_cost = shift.abs() * shift_cost;

    if insert_cost > result.cost || shift.abs() > MAX_INSERT {
        return false;
    }

    let rec_off = if shift < 0 { (-shift) as usize } else { 0 };
    let lz_off = if shift > 0 { shift as usize } else { 0 };
    let overlap = (seq.len() - rec_off).min(lz_seq.len() - lz_off);

    let mut cost = insert_cost;
    for i in 0..overlap {
        if cost >= result.cost {
            break;
        }
        if seq[rec_off + i] != lz_seq[lz_off + i] {
            cost += mismatch_cost;
        }
    }

    if cost < result.cost {
        result.cost = cost;
        result.no_mismatches = cost == insert_cost;
        result.shift = shift;
        true
    } else {
        false
    }
}

/// Reverse-prefix ordering key for the auxiliary prefix buffer: bytes
/// walking backwards from just before the signature.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord)]
struct PrefixKey {
    key: Vec<u8>,
    min_pos_neg: i32,
    node: NodeId,
}

const SIG_OFFSET: usize = 2;
const PREFIX_BUCKETS: usize = 5 * 5;

fn prefix_key(seq: &[u8], min_pos: usize, node: NodeId) -> PrefixKey {
    let mut key = Vec::with_capacity(min_pos.saturating_sub(SIG_OFFSET) + 1);
    let mut i = min_pos as i64 - SIG_OFFSET as i64;
    while i >= 0 {
        key.push(seq[i as usize]);
        i -= 1;
    }
    PrefixKey {
        key,
        min_pos_neg: -(min_pos as i32),
        node,
    }
}

fn dna_bucket(base: u8) -> usize {
    match base {
        b'A' => 0,
        b'C' => 1,
        b'G' => 2,
        b'T' => 3,
        _ => 4,
    }
}

/// The classifier itself; stateless between bins apart from parameters.
pub struct ReadsClassifier {
    params: ClassifierParams,
    minimizer: MinimizerParams,
}

impl ReadsClassifier {
    pub fn new(minimizer: MinimizerParams, params: ClassifierParams) -> Self {
        ReadsClassifier { params, minimizer }
    }

    pub fn params(&self) -> &ClassifierParams {
        &self.params
    }

    fn find_best(&self,
                 window: &VecDeque<LzEntry>,
                 seq: &[u8],
                 min_pos: i32,
                 max_cost: i32)
                 -> MatchResult {
        let mut result = MatchResult {
            cost: max_cost + 1,
            no_mismatches: false,
            shift: 0,
            prev_id: 0,
        };
        for (i, lz) in window.iter().enumerate() {
            if update_lz_match(&mut result, seq, min_pos, &lz.seq, lz.min_pos,
                               self.params.shift_cost, self.params.mismatch_cost)
            {
                result.prev_id = i;
                if result.cost == 0 {
                    break;
                }
            }
        }
        result
    }

    /// Build the match forest over the (sorted) nodes of `graph`, returning
    /// the roots in emission order. When an auxiliary root is present (see
    /// [`Graph::aux_node`]) it seeds the window and leads the root list.
    pub fn construct_match_tree(&self,
                                records: &[FastqRecord],
                                graph: &mut Graph)
                                -> Vec<NodeId> {
        let mut roots = Vec::new();
        let mut window: VecDeque<LzEntry> = VecDeque::new();
        let window_cap = self.params.lz_window.max(1);

        let use_prefix_buffer = self.params.extra_reduce_hard_reads
            || self.params.extra_reduce_expensive_lz;
        let mut prefix_buffers: Vec<BTreeSet<PrefixKey>> =
            (0..PREFIX_BUCKETS).map(|_| BTreeSet::new()).collect();

        if let Some(aux) = graph.aux_node {
            let rec = &records[graph.nodes[aux].record];
            window.push_front(LzEntry {
                seq: rec.seq[..rec.seq_len()].to_vec(),
                min_pos: rec.minim_pos as i32,
                node: Some(aux),
            });
            roots.push(aux);
        }

        for cur in 0..graph.nodes.len() {
            if graph.aux_node == Some(cur) {
                continue;
            }
            let rec_id = graph.nodes[cur].record;
            // the window carries mate-1 only; mates are matched separately
            let (seq, min_pos) = {
                let rec = &records[rec_id];
                (rec.seq[..rec.seq_len()].to_vec(), rec.minim_pos as i32)
            };

            let mut encode_threshold = if self.params.encode_threshold == 0 {
                (seq.len() / 2) as i32
            } else {
                self.params.encode_threshold
            };

            let mut result = self.find_best(&window, &seq, min_pos, encode_threshold);
            let mut is_hard = result.cost > encode_threshold;

            let identical = result.cost == 0
                && window
                    .get(result.prev_id)
                    .map(|lz| lz.seq.len() == seq.len())
                    .unwrap_or(false)
                && window[result.prev_id]
                    .node
                    .map(|n| graph.nodes[n].node_type != NodeType::None)
                    .unwrap_or(false);

            if identical {
                let parent = window[result.prev_id].node.unwrap();
                debug_assert_ne!(NodeType::None, graph.nodes[parent].node_type);

                graph.nodes[cur].node_type = NodeType::None;
                graph.nodes[cur].lz_record = None;
                graph.nodes[cur].parent = None;

                // duplicated reads contribute their own decorators and then
                // dissolve into the parent's exact-match group
                graph.migrate_decorators(cur, parent);
                graph.add_exact_match(parent, rec_id);
                continue;
            }

            // optionally consult the reverse-prefix buffer for a cheaper
            // parent before settling for a hard read or an expensive match
            let mut override_parent: Option<NodeId> = None;
            let mut bucket: Option<usize> = None;

            // deep-enough prefixes only; shallow signatures have nothing to sort by
            let min_signature_pos = self.minimizer.signature_len as usize;
            if use_prefix_buffer && min_pos as usize >= min_signature_pos {
                let b = dna_bucket(seq[min_pos as usize - 2]) * 5
                    + dna_bucket(seq[min_pos as usize - 1]);
                bucket = Some(b);

                let expensive_threshold = encode_threshold / 2;
                let search = is_hard
                    || (self.params.extra_reduce_expensive_lz
                        && result.cost > expensive_threshold);

                if !is_hard {
                    encode_threshold = expensive_threshold;
                }

                if search {
                    let probe = prefix_key(&seq, min_pos as usize, usize::MAX);
                    let scan = self.params.lz_window / 2 + 1;
                    let buffer = &prefix_buffers[b];

                    let mut best = MatchResult {
                        cost: encode_threshold + 1,
                        no_mismatches: false,
                        shift: 0,
                        prev_id: 0,
                    };
                    let mut best_node = None;

                    for key in buffer
                        .range(probe.clone()..)
                        .take(scan)
                        .chain(buffer.range(..probe).rev().take(scan))
                    {
                        let cand = &records[graph.nodes[key.node].record];
                        if update_lz_match(&mut best, &seq, min_pos,
                                           &cand.seq[..cand.seq_len()],
                                           cand.minim_pos as i32,
                                           self.params.shift_cost,
                                           self.params.mismatch_cost)
                        {
                            best_node = Some(key.node);
                        }
                    }

                    if let Some(node) = best_node {
                        if best.cost < encode_threshold && best.cost < result.cost {
                            override_parent = Some(node);
                            result = best;
                            is_hard = false;
                        }
                    }
                }
            }

            if is_hard {
                graph.nodes[cur].node_type = NodeType::Hard;
                graph.nodes[cur].lz_record = None;
                graph.nodes[cur].parent = None;
                roots.push(cur);
            } else {
                let parent =
                    override_parent.unwrap_or_else(|| window[result.prev_id].node.unwrap());
                let parent_rec = graph.nodes[parent].record;

                graph.nodes[cur].node_type = NodeType::Lz;
                graph.nodes[cur].lz_record = Some(parent_rec);
                graph.nodes[cur].shift = result.shift as i16;
                graph.nodes[cur].shift_only = result.no_mismatches;
                graph.nodes[cur].encode_cost = result.cost as i16;
                graph.add_child(parent, cur);
            }

            window.push_front(LzEntry {
                seq,
                min_pos,
                node: Some(cur),
            });
            if window.len() > window_cap {
                window.pop_back();
            }

            if let Some(b) = bucket {
                let rec = &records[rec_id];
                prefix_buffers[b].insert(prefix_key(&rec.seq, rec.minim_pos as usize, cur));
            }
        }

        roots
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::graph::Graph;
    use crate::params::{ClassifierParams, MinimizerParams};

    fn rec(seq: &[u8], min_pos: u16) -> FastqRecord {
        let mut r = FastqRecord::new(seq.to_vec(), vec![b'I'; seq.len()], Vec::new());
        r.minim_pos = min_pos;
        r
    }

    fn classify(records: &[FastqRecord]) -> (Graph, Vec<NodeId>) {
        let classifier =
            ReadsClassifier::new(MinimizerParams::default(), ClassifierParams::default());
        let mut graph = Graph::from_records(0..records.len());
        graph.sort_nodes(records);
        let roots = classifier.construct_match_tree(records, &mut graph);
        (graph, roots)
    }

    #[test]
    fn match_cost_favours_small_shift() {
        let mut result = MatchResult {
            cost: 100,
            no_mismatches: false,
            shift: 0,
            prev_id: 0,
        };
        let seq = b"AACCGGTTAACCGGTT";
        assert!(update_lz_match(&mut result, seq, 4, seq, 4, 1, 2));
        assert_eq!(0, result.cost);
        assert!(result.no_mismatches);
        assert_eq!(0, result.shift);
    }

    #[test]
    fn shifted_match_costs_shift_only() {
        let mut result = MatchResult {
            cost: 100,
            no_mismatches: false,
            shift: 0,
            prev_id: 0,
        };
        // same sequence shifted by two
        let a = b"GGACGTACGTACGTAC";
        let b = b"ACGTACGTACGTACTT";
        assert!(update_lz_match(&mut result, a, 4, b, 2, 1, 2));
        assert_eq!(-2, result.shift);
        assert_eq!(2, result.cost);
        assert!(result.no_mismatches);
    }

    #[test]
    fn excessive_shift_is_rejected() {
        let mut result = MatchResult {
            cost: 10_000,
            no_mismatches: false,
            shift: 0,
            prev_id: 0,
        };
        let seq = vec![b'A'; 200];
        assert!(!update_lz_match(&mut result, &seq, 0, &seq, 150, 1, 2));
    }

    #[test]
    fn identical_reads_merge_into_exact_group() {
        // scenario: two identical reads plus unrelated ones
        let reads = vec![
            rec(b"ACGTACGTACGTGGCC", 0),
            rec(b"ACGTACGTACGTGGCC", 0),
            rec(b"TTCCAAGGTTCCAAGG", 2),
        ];
        let (graph, roots) = classify(&reads);

        let exact_total: usize = graph.exact_groups.iter().map(|g| g.len()).sum();
        assert_eq!(1, exact_total);
        assert!(graph.check_soundness(&roots));

        // one of the identical pair dissolved, so only two typed nodes remain
        let typed = graph
            .nodes
            .iter()
            .filter(|n| n.node_type != NodeType::None)
            .count();
        assert_eq!(2, typed);
    }

    #[test]
    fn similar_reads_link_as_lz() {
        let mut base = b"ACGTACGTACGTGGCCTTAA".to_vec();
        let r1 = rec(&base, 0);
        base[12] = b'T';
        let r2 = rec(&base, 0);
        let (graph, roots) = classify(&[r1, r2]);

        assert_eq!(1, roots.len());
        assert!(graph.check_soundness(&roots));
        let lz = graph
            .nodes
            .iter()
            .find(|n| n.node_type == NodeType::Lz)
            .expect("one read should LZ-link");
        assert_eq!(0, lz.shift);
        assert!(!lz.shift_only);
        assert!(lz.encode_cost > 0);
    }

    #[test]
    fn unrelated_reads_stay_hard() {
        let reads = vec![
            rec(b"ACACACACACACACAC", 0),
            rec(b"GTGTGTGTGTGTGTGT", 0),
        ];
        let (graph, roots) = classify(&reads);
        assert_eq!(2, roots.len());
        assert!(graph.check_soundness(&roots));
        assert!(graph.nodes.iter().all(|n| n.node_type == NodeType::Hard));
    }
}
