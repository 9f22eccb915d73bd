//! Stage 3: rebinning. Reads from bins at one signature parity are
//! redistributed into bins of the next parity; whole match trees move as a
//! unit, re-rooted at the read carrying the best new signature, and a
//! transfer-tree group keeps the linkage to the old bin so the packing
//! stage can rebuild the nested encoding context.

use std::collections::BTreeMap;

use crate::categorizer::SignatureValidator;
use crate::classifier::ReadsClassifier;
use crate::graph::{Graph, MatchNode, NodeId, NodeType, SubTree};
use crate::packer::{GroupedRecord, ReadGroup};
use crate::params::{MinimizerParams, RebinParams};
use crate::records::FastqRecord;

/// Rebuild the encoding graph from the flattened grouped-record form the
/// packer produces: each announced group owns a nested subtree holding the
/// following `count` records (recursively).
pub fn build_graph(entries: Vec<GroupedRecord>) -> (Vec<FastqRecord>, Graph) {
    let mut records = Vec::with_capacity(entries.len());
    let mut iter = entries.into_iter();
    let graph = build_frame(&mut iter, None, &mut records);
    (records, graph)
}

fn build_frame(iter: &mut std::vec::IntoIter<GroupedRecord>,
               count: Option<u32>,
               records: &mut Vec<FastqRecord>)
               -> Graph {
    let mut graph = Graph::default();
    let mut taken = 0u32;

    while count.map_or(true, |c| taken < c) {
        let entry = match iter.next() {
            Some(e) => e,
            None => break,
        };
        taken += 1;

        let rec_id = records.len();
        records.push(entry.rec);
        let mut node = MatchNode::new(rec_id);

        // nested members interpose without consuming slots of this frame
        for g in entry.groups {
            let nested = build_frame(iter, Some(g.count), records);
            node.sub_trees.push(graph.sub_trees.len());
            graph.sub_trees.push(SubTree {
                signature_id: g.signature,
                main_signature_pos: g.main_pos,
                graph: nested,
            });
        }
        graph.nodes.push(node);
    }
    graph
}

/// Flatten one node (its record, nested subtrees and exact matches) back
/// into grouped-record form; returns the number of *direct* entries this
/// node contributes to its enclosing frame (itself plus its duplicates;
/// nested members count only inside their own groups).
fn flatten_node(node: NodeId,
                graph: &Graph,
                records: &[FastqRecord],
                out: &mut Vec<GroupedRecord>)
                -> u32 {
    let n = &graph.nodes[node];

    let self_idx = out.len();
    out.push(GroupedRecord {
        rec: records[n.record].clone(),
        groups: Vec::new(),
    });

    // nested subtree members directly follow their owner, group by group
    for &t in &n.sub_trees {
        let sub = &graph.sub_trees[t];
        let header_idx = out[self_idx].groups.len();
        out[self_idx].groups.push(ReadGroup {
            signature: sub.signature_id,
            main_pos: sub.main_signature_pos,
            count: 0,
        });
        let mut direct = 0u32;
        for id in 0..sub.graph.nodes.len() {
            direct += flatten_node(id, &sub.graph, records, out);
        }
        out[self_idx].groups[header_idx].count = direct;
    }

    // exact duplicates share the owner's signature and orientation
    let mut direct = 1u32;
    if let Some(g) = n.exact_group {
        for &rec_id in &graph.exact_groups[g] {
            out.push(GroupedRecord::plain(records[rec_id].clone()));
            direct += 1;
        }
    }
    direct
}

/// The rebinner proper.
pub struct Rebinner {
    params: RebinParams,
    minimizer: MinimizerParams,
    validator: SignatureValidator,
    classifier: ReadsClassifier,
    paired: bool,
}

impl Rebinner {
    pub fn new(minimizer: MinimizerParams, params: RebinParams, paired: bool) -> Self {
        let validator = SignatureValidator::new(&minimizer);
        let classifier = ReadsClassifier::new(minimizer, params.classifier);
        Rebinner {
            params,
            minimizer,
            validator,
            classifier,
            paired,
        }
    }

    pub fn signature_parity(&self) -> u32 {
        self.params.signature_parity
    }

    /// The best new-parity signature of `seq`, excluding the current one.
    fn find_minimizer_hr(&self, seq: &[u8], cur_signature: u32) -> (u32, u16) {
        let divisor = self.params.signature_parity;
        debug_assert!(divisor > 1 && divisor.is_power_of_two());

        let sig_len = self.minimizer.signature_len as usize;
        let skip = self.minimizer.skip_zone_len as usize;
        let n_bin = self.minimizer.n_bin_id();

        let mut best = n_bin;
        let mut pos = 0u16;
        let end = seq.len().saturating_sub(sig_len + skip);
        for i in 0..end {
            let mut sig = 0u32;
            let mut valid = true;
            for &b in &seq[i..i + sig_len] {
                match b {
                    b'A' => sig <<= 2,
                    b'C' => sig = (sig << 2) | 1,
                    b'G' => sig = (sig << 2) | 2,
                    b'T' => sig = (sig << 2) | 3,
                    _ => {
                        valid = false;
                        break;
                    },
                }
            }
            if valid
                && sig < best
                && sig != cur_signature
                && sig % divisor == 0
                && self.validator.is_valid(sig)
            {
                best = sig;
                pos = i as u16;
            }
        }

        let n_count = seq.iter().filter(|&&b| b == b'N').count();
        if best >= n_bin || n_count >= seq.len() / 3 {
            (n_bin, 0)
        } else {
            (best, pos)
        }
    }

    /// Redistribute one bin (at a parity-mismatched signature) into bins of
    /// the target parity. Returns the output bins in grouped-record form.
    pub fn rebin(&self,
                 records: &mut Vec<FastqRecord>,
                 mut graph: Graph,
                 signature: u32)
                 -> BTreeMap<u32, Vec<GroupedRecord>> {
        debug_assert!(signature % self.params.signature_parity != 0);

        graph.sort_nodes(records);
        let roots = self.classifier.construct_match_tree(records, &mut graph);

        let mut bins: BTreeMap<u32, Vec<GroupedRecord>> = BTreeMap::new();

        for root in roots {
            let big_enough = self.params.min_tree_size == 0
                || (graph.nodes[root].has_children()
                    && graph.tree_size(root) > self.params.min_tree_size);
            if big_enough {
                self.store_tree(root, records, &mut graph, signature, &mut bins);
            } else {
                // dissolve the tree into independent records
                for node in graph.tree_nodes(root) {
                    self.store_single(node, records, &graph, signature, &mut bins);
                }
            }
        }

        bins
    }

    fn store_tree(&self,
                  root: NodeId,
                  records: &mut Vec<FastqRecord>,
                  graph: &mut Graph,
                  signature: u32,
                  bins: &mut BTreeMap<u32, Vec<GroupedRecord>>) {
        debug_assert!(graph.nodes[root].contig.is_none());

        let n_bin = self.minimizer.n_bin_id();
        let sig_len = self.minimizer.signature_len as usize;

        let mut new_root = root;
        let mut minimizer = (n_bin, 0u16);
        let mut direction_change = false;

        if self.params.select_max_edge_read && graph.nodes[root].has_children() {
            // locate the nodes with the extreme signature positions
            let mut left = (records[graph.nodes[root].record].minim_pos, root);
            let mut right = left;
            for id in graph.tree_nodes(root) {
                let pos = records[graph.nodes[id].record].minim_pos;
                if pos > left.0 {
                    left = (pos, id);
                }
                if pos < right.0 {
                    right = (pos, id);
                }
            }

            let candidate_min = |node: NodeId| -> (u32, u16, bool) {
                if node == root {
                    return (n_bin, 0, false);
                }
                let rec = &records[graph.nodes[node].record];
                let fwd = self.find_minimizer_hr(&rec.seq, signature);
                if self.paired {
                    return (fwd.0, fwd.1, false);
                }
                let rev = self.find_minimizer_hr(&rec.rc_seq(), signature);
                if fwd.0 <= rev.0 {
                    (fwd.0, fwd.1, false)
                } else {
                    (rev.0, rev.1, true)
                }
            };

            let m1 = candidate_min(left.1);
            let m2 = candidate_min(right.1);

            if m1.0 < m2.0 {
                minimizer = (m1.0, m1.1);
                direction_change = m1.2;
                new_root = left.1;
            } else if m2.0 != n_bin {
                minimizer = (m2.0, m2.1);
                direction_change = m2.2;
                new_root = right.1;
            }

            if new_root != root {
                set_as_root(graph, new_root);
            }
        } else {
            let rec = &records[graph.nodes[root].record];
            let fwd = self.find_minimizer_hr(&rec.seq, signature);
            let rev = if self.paired {
                fwd
            } else {
                self.find_minimizer_hr(&rec.rc_seq(), signature)
            };
            if fwd.0 <= rev.0 {
                minimizer = fwd;
            } else {
                minimizer = rev;
                direction_change = true;
            }
        }

        debug_assert!(!direction_change || !self.paired);

        let main_rec_id = graph.nodes[new_root].record;
        let mut old_signature_pos = records[main_rec_id].minim_pos;

        let target_bin = if minimizer.0 != n_bin {
            minimizer.0
        } else {
            // no new signature found, keep the current one
            direction_change = false;
            signature
        };

        if direction_change {
            let rec = &mut records[main_rec_id];
            rec.apply_rc();
            old_signature_pos =
                (rec.seq_len() - old_signature_pos as usize - sig_len) as u16;
        }
        if minimizer.0 != n_bin {
            records[main_rec_id].minim_pos = minimizer.1;
            self.update_exact_matches(new_root, records, graph, direction_change);
            if direction_change {
                self.update_tree_reads(new_root, records, graph);
            }
        }

        // propagate the orientation change through the descendants
        let descendants: Vec<NodeId> = graph
            .tree_nodes(new_root)
            .into_iter()
            .filter(|&n| n != new_root)
            .collect();
        for &id in &descendants {
            if direction_change {
                let rec = &mut records[graph.nodes[id].record];
                rec.apply_rc();
                rec.minim_pos =
                    (rec.seq_len() - rec.minim_pos as usize - sig_len) as u16;
                self.update_exact_matches(id, records, graph, true);
                self.update_tree_reads(id, records, graph);
            }
        }

        let trans_signature = if direction_change {
            self.minimizer.reverse_signature(signature)
        } else {
            signature
        };

        // flatten: the re-rooted tree travels as one transfer group
        let out = bins.entry(target_bin).or_default();
        let root_idx = out.len();
        out.push(GroupedRecord {
            rec: records[main_rec_id].clone(),
            groups: vec![ReadGroup {
                signature: trans_signature,
                main_pos: old_signature_pos,
                count: 0,
            }],
        });

        let mut members = 0u32;
        for &id in &descendants {
            members += flatten_node(id, graph, records, out);
        }
        out[root_idx].groups[0].count = members;

        // the root's pre-existing subtrees become further groups of its own
        let root_trees = graph.nodes[new_root].sub_trees.clone();
        for t in root_trees {
            let sub = &graph.sub_trees[t];
            let header_idx = out[root_idx].groups.len();
            out[root_idx].groups.push(ReadGroup {
                signature: sub.signature_id,
                main_pos: sub.main_signature_pos,
                count: 0,
            });
            let mut nested = 0u32;
            for id in 0..sub.graph.nodes.len() {
                nested += flatten_node(id, &sub.graph, records, out);
            }
            out[root_idx].groups[header_idx].count = nested;
        }

        // the root's duplicates carry the new signature, outside any group
        if let Some(g) = graph.nodes[new_root].exact_group {
            for i in 0..graph.exact_groups[g].len() {
                let rec_id = graph.exact_groups[g][i];
                out.push(GroupedRecord::plain(records[rec_id].clone()));
            }
        }
    }

    fn store_single(&self,
                    node: NodeId,
                    records: &mut Vec<FastqRecord>,
                    graph: &Graph,
                    signature: u32,
                    bins: &mut BTreeMap<u32, Vec<GroupedRecord>>) {
        let n_bin = self.minimizer.n_bin_id();
        let rec_id = graph.nodes[node].record;

        let allow_rc = !self.paired
            || (graph.nodes[node].exact_group.is_none()
                && graph.nodes[node].sub_trees.is_empty());
        let has_decorations = graph.nodes[node].exact_group.is_some()
            || !graph.nodes[node].sub_trees.is_empty();

        let (fwd, rev) = {
            let rec = &records[rec_id];
            let fwd = self.find_minimizer_hr(&rec.seq, signature);
            let rev = if allow_rc && !has_decorations {
                self.find_minimizer_hr(&rec.rc_seq(), signature)
            } else {
                fwd
            };
            (fwd, rev)
        };

        let (minimizer, mut direction_change) = if fwd.0 <= rev.0 {
            (fwd, false)
        } else {
            (rev, true)
        };

        let target_bin = if minimizer.0 != n_bin {
            minimizer.0
        } else {
            direction_change = false;
            signature
        };

        if direction_change {
            records[rec_id].apply_rc();
        }
        if minimizer.0 != n_bin {
            records[rec_id].minim_pos = minimizer.1;
            self.update_exact_matches(node, records, graph, direction_change);
        }

        let out = bins.entry(target_bin).or_default();
        flatten_node(node, graph, records, out);
    }

    fn update_exact_matches(&self,
                            node: NodeId,
                            records: &mut [FastqRecord],
                            graph: &Graph,
                            direction_change: bool) {
        let group = match graph.nodes[node].exact_group {
            Some(g) => g,
            None => return,
        };
        let main_pos = records[graph.nodes[node].record].minim_pos;
        for &em in &graph.exact_groups[group] {
            if direction_change {
                records[em].apply_rc();
            }
            records[em].minim_pos = main_pos;
        }
    }

    fn update_tree_reads(&self,
                         node: NodeId,
                         records: &mut [FastqRecord],
                         graph: &mut Graph) {
        let main_len = records[graph.nodes[node].record].seq_len();
        let tree_ids: Vec<usize> = graph.nodes[node].sub_trees.clone();
        for t in tree_ids {
            self.rc_sub_tree(&mut graph.sub_trees[t], records, main_len);
        }
    }

    /// Reverse-complement an entire transferred subtree: the carried
    /// signature is complemented and bit-reversed, positions are mirrored,
    /// every nested record flips orientation.
    fn rc_sub_tree(&self,
                   sub: &mut SubTree,
                   records: &mut [FastqRecord],
                   main_len: usize) {
        let sig_len = self.minimizer.signature_len as usize;
        sub.signature_id = self.minimizer.reverse_signature(sub.signature_id);
        sub.main_signature_pos =
            (main_len - sub.main_signature_pos as usize - sig_len) as u16;

        for n in 0..sub.graph.nodes.len() {
            let rec_id = sub.graph.nodes[n].record;
            {
                let rec = &mut records[rec_id];
                rec.apply_rc();
                rec.minim_pos =
                    (rec.seq_len() - rec.minim_pos as usize - sig_len) as u16;
            }
            if let Some(g) = sub.graph.nodes[n].exact_group {
                let main_pos = records[rec_id].minim_pos;
                let ems: Vec<usize> = sub.graph.exact_groups[g].clone();
                for em in ems {
                    records[em].apply_rc();
                    records[em].minim_pos = main_pos;
                }
            }
        }

        for t in 0..sub.graph.sub_trees.len() {
            let mut nested = std::mem::take(&mut sub.graph.sub_trees[t]);
            self.rc_sub_tree(&mut nested, records, main_len);
            sub.graph.sub_trees[t] = nested;
        }
    }
}

/// Invert the parent chain so `node` becomes the root of its tree while all
/// descendant edges are preserved.
pub fn set_as_root(graph: &mut Graph, node: NodeId) {
    invert_chain(graph, node, None);
    graph.nodes[node].parent = None;
    graph.nodes[node].node_type = NodeType::Hard;
}

fn invert_chain(graph: &mut Graph, node: NodeId, prev: Option<NodeId>) {
    if let Some(parent) = graph.nodes[node].parent {
        invert_chain(graph, parent, Some(node));

        let pos = graph.nodes[parent]
            .children
            .iter()
            .position(|&c| c == node)
            .expect("child link must exist");
        graph.nodes[parent].children.remove(pos);
        graph.nodes[node].children.push(parent);
        graph.nodes[parent].parent = Some(node);
        graph.nodes[node].parent = prev;
    } else {
        debug_assert_eq!(NodeType::Hard, graph.nodes[node].node_type);
        graph.nodes[node].node_type = NodeType::Lz;
    }
}
