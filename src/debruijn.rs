//! # De Bruijn graph assembly
//!
//! Builds a kmer graph from a bag of paired-end reads, contracts linear
//! chains into simple paths, and extracts the highest-coverage traversal
//! as the locus contig. Nodes live in an arena and refer to each other
//! through `NodeId` indexes.
use std::collections::HashMap;
use std::fmt;
use std::fmt::Write as _;

use crate::seq::{DNASeq2, DNASeq4, Nt2};

/// A kmer packed two bits per nucleotide into a `u64`, first nucleotide
/// in the high bits. Limits the kmer length to 31.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Default)]
pub struct Kmer(u64);

pub const MAX_KMER_LENGTH: usize = 31;

impl Kmer {
    fn mask(km_len: usize) -> u64 {
        (1u64 << (2 * km_len)) - 1
    }

    pub fn from_nts(nts: &[Nt2]) -> Kmer {
        let mut km = 0u64;
        for nt in nts {
            km = (km << 2) | nt.index() as u64;
        }
        Kmer(km)
    }

    /// The successor kmer along the edge labelled `nt`: drop the first
    /// nucleotide, append `nt`.
    pub fn succ(self, km_len: usize, nt: Nt2) -> Kmer {
        Kmer(((self.0 << 2) & Self::mask(km_len)) | nt.index() as u64)
    }

    /// The predecessor kmer along the edge labelled `nt`: drop the last
    /// nucleotide, prepend `nt`.
    pub fn pred(self, km_len: usize, nt: Nt2) -> Kmer {
        Kmer((self.0 >> 2) | ((nt.index() as u64) << (2 * (km_len - 1))))
    }

    pub fn front(self, km_len: usize) -> Nt2 {
        Nt2::from_index(((self.0 >> (2 * (km_len - 1))) & 0x3) as usize)
    }

    pub fn back(self) -> Nt2 {
        Nt2::from_index((self.0 & 0x3) as usize)
    }

    pub fn at(self, km_len: usize, i: usize) -> Nt2 {
        Nt2::from_index(((self.0 >> (2 * (km_len - 1 - i))) & 0x3) as usize)
    }

    pub fn str(self, km_len: usize) -> String {
        (0..km_len).map(|i| self.at(km_len, i).to_char()).collect()
    }
}

/// Iterate the kmers of a 4-bit sequence, restarting after every
/// non-ACGT position.
pub fn kmers<'a>(seq: &'a DNASeq4, km_len: usize) -> impl Iterator<Item = Kmer> + 'a {
    let mut km = 0u64;
    let mut n_good = 0usize;
    let mask = Kmer::mask(km_len);
    seq.iter().filter_map(move |nt4| match nt4.to_nt2() {
        Some(nt) => {
            km = ((km << 2) & mask) | nt.index() as u64;
            n_good += 1;
            if n_good >= km_len {
                Some(Kmer(km))
            } else {
                None
            }
        }
        None => {
            n_good = 0;
            None
        }
    })
}

/// Index of a node in the graph arena.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct NodeId(u32);

impl NodeId {
    fn idx(self) -> usize {
        self.0 as usize
    }
}

#[derive(Clone, Debug)]
struct Node {
    km: Kmer,
    count: usize,
    pred: [Option<NodeId>; 4],
    succ: [Option<NodeId>; 4],
}

impl Node {
    fn new(km: Kmer, count: usize) -> Node {
        Node {
            km,
            count,
            pred: [None; 4],
            succ: [None; 4],
        }
    }

    fn n_pred(&self) -> usize {
        self.pred.iter().filter(|p| p.is_some()).count()
    }

    fn n_succ(&self) -> usize {
        self.succ.iter().filter(|s| s.is_some()).count()
    }

    fn first_succ(&self) -> Option<NodeId> {
        self.succ.iter().find_map(|s| *s)
    }
}

/// A contracted linear chain, identified by its first node.
#[derive(Clone, Copy, Debug)]
pub struct SPath {
    first: NodeId,
    last: NodeId,
    n_nodes: usize,
    cum_count: usize,
}

impl SPath {
    pub fn n_nodes(&self) -> usize {
        self.n_nodes
    }

    pub fn cum_count(&self) -> usize {
        self.cum_count
    }
}

/// Returned by [`Graph::find_best_path`] when the simple-path graph
/// contains a cycle.
#[derive(Debug, PartialEq, Eq)]
pub struct NotADag;

impl fmt::Display for NotADag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "kmer graph is not a DAG")
    }
}

impl std::error::Error for NotADag {}

pub struct Graph {
    km_len: usize,
    counts: HashMap<Kmer, usize>,
    nodes: Vec<Node>,
    node_of: HashMap<Kmer, NodeId>,
    spaths: Vec<SPath>,
    spath_of_first: HashMap<NodeId, usize>,
}

impl Graph {
    pub fn new(km_len: usize) -> Graph {
        assert!(
            km_len >= 2 && km_len <= MAX_KMER_LENGTH,
            "kmer length {km_len} out of range"
        );
        Graph {
            km_len,
            counts: HashMap::new(),
            nodes: Vec::new(),
            node_of: HashMap::new(),
            spaths: Vec::new(),
            spath_of_first: HashMap::new(),
        }
    }

    pub fn km_len(&self) -> usize {
        self.km_len
    }

    /// No kmer met the minimum count.
    pub fn empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn n_simple_paths(&self) -> usize {
        self.spaths.len()
    }

    fn clear(&mut self) {
        self.counts.clear();
        self.nodes.clear();
        self.node_of.clear();
        self.spaths.clear();
        self.spath_of_first.clear();
    }

    /// Reset the graph and rebuild it from `seqs`, keeping only kmers
    /// seen at least `min_count` times. Safe to call repeatedly; the
    /// working maps are reused across loci.
    pub fn rebuild(&mut self, seqs: &[&DNASeq4], min_count: usize) {
        self.clear();

        for seq in seqs {
            for km in kmers(seq, self.km_len) {
                *self.counts.entry(km).or_insert(0) += 1;
            }
        }

        // Allocate the arena in kmer order so traversal tie-breaks do
        // not depend on hash-map iteration order.
        let mut retained: Vec<(Kmer, usize)> = self
            .counts
            .iter()
            .filter(|(_, &count)| count >= min_count)
            .map(|(&km, &count)| (km, count))
            .collect();
        retained.sort_by_key(|(km, _)| km.0);
        for (km, count) in retained {
            let id = NodeId(self.nodes.len() as u32);
            self.nodes.push(Node::new(km, count));
            self.node_of.insert(km, id);
        }

        // Link retained kmers. An edge u --x--> v exists iff v is u
        // shifted by x; the symmetric pred slot is indexed by the
        // nucleotide dropped from u.
        for i in 0..self.nodes.len() {
            let km = self.nodes[i].km;
            let front = km.front(self.km_len);
            for nt in Nt2::ALL {
                if let Some(&j) = self.node_of.get(&km.succ(self.km_len, nt)) {
                    self.nodes[i].succ[nt.index()] = Some(j);
                    self.nodes[j.idx()].pred[front.index()] = Some(NodeId(i as u32));
                }
            }
        }

        self.build_simple_paths();
    }

    fn is_path_first(&self, id: NodeId) -> bool {
        let node = &self.nodes[id.idx()];
        if node.n_pred() != 1 {
            return true;
        }
        let pred = node.pred.iter().find_map(|p| *p).unwrap();
        self.nodes[pred.idx()].n_succ() != 1
    }

    fn build_simple_paths(&mut self) {
        let mut visited = vec![false; self.nodes.len()];

        let firsts: Vec<NodeId> = (0..self.nodes.len())
            .map(|i| NodeId(i as u32))
            .filter(|&id| self.is_path_first(id))
            .collect();
        for first in firsts {
            self.walk_simple_path(first, &mut visited);
        }

        // Components left unvisited have no entry point (every node has
        // in/out degree one); start anywhere so the cycle surfaces as a
        // simple-path cycle and fails the DAG check.
        for i in 0..self.nodes.len() {
            if !visited[i] {
                self.walk_simple_path(NodeId(i as u32), &mut visited);
            }
        }
    }

    fn walk_simple_path(&mut self, first: NodeId, visited: &mut [bool]) {
        let mut cur = first;
        let mut n_nodes = 1;
        let mut cum_count = self.nodes[cur.idx()].count;
        visited[cur.idx()] = true;
        loop {
            let node = &self.nodes[cur.idx()];
            if node.n_succ() != 1 {
                break;
            }
            let next = node.first_succ().unwrap();
            if self.nodes[next.idx()].n_pred() != 1 || visited[next.idx()] {
                break;
            }
            cur = next;
            visited[cur.idx()] = true;
            n_nodes += 1;
            cum_count += self.nodes[cur.idx()].count;
        }
        self.spath_of_first.insert(first, self.spaths.len());
        self.spaths.push(SPath {
            first,
            last: cur,
            n_nodes,
            cum_count,
        });
    }

    /// The simple paths reachable from the last node of `sp`. `None`
    /// marks an edge into the middle of another path, which only happens
    /// on cyclic graphs.
    fn spath_succs(&self, sp: usize) -> Vec<Option<usize>> {
        let last = self.spaths[sp].last;
        self.nodes[last.idx()]
            .succ
            .iter()
            .filter_map(|s| *s)
            .map(|node| self.spath_of_first.get(&node).copied())
            .collect()
    }

    /// The traversal of simple paths with the highest cumulative kmer
    /// count, in topological order.
    pub fn find_best_path(&self) -> Result<Vec<usize>, NotADag> {
        let n = self.spaths.len();
        let mut succs: Vec<Vec<usize>> = Vec::with_capacity(n);
        let mut n_preds = vec![0usize; n];
        for sp in 0..n {
            let mut out = Vec::new();
            for succ in self.spath_succs(sp) {
                let succ = succ.ok_or(NotADag)?;
                n_preds[succ] += 1;
                out.push(succ);
            }
            succs.push(out);
        }

        // Kahn's algorithm; a leftover node means a cycle.
        let mut order = Vec::with_capacity(n);
        let mut ready: Vec<usize> = (0..n).filter(|&sp| n_preds[sp] == 0).collect();
        while let Some(sp) = ready.pop() {
            order.push(sp);
            for &succ in &succs[sp] {
                n_preds[succ] -= 1;
                if n_preds[succ] == 0 {
                    ready.push(succ);
                }
            }
        }
        if order.len() != n {
            return Err(NotADag);
        }

        // Maximise the cumulative kmer count over the DAG.
        let mut best = vec![0usize; n];
        let mut back: Vec<Option<usize>> = vec![None; n];
        for &sp in &order {
            best[sp] += self.spaths[sp].cum_count;
            for &succ in &succs[sp] {
                if best[sp] > best[succ] {
                    best[succ] = best[sp];
                    back[succ] = Some(sp);
                }
            }
        }

        let mut cur = (0..n).max_by_key(|&sp| best[sp]).ok_or(NotADag)?;
        let mut path = vec![cur];
        while let Some(prev) = back[cur] {
            path.push(prev);
            cur = prev;
        }
        path.reverse();
        Ok(path)
    }

    /// The nucleotides of one simple path: the first node's kmer, then
    /// the trailing nucleotide of every following node.
    fn spath_nts(&self, sp: usize) -> Vec<Nt2> {
        let path = &self.spaths[sp];
        let mut nts: Vec<Nt2> = (0..self.km_len)
            .map(|i| self.nodes[path.first.idx()].km.at(self.km_len, i))
            .collect();
        let mut cur = path.first;
        while cur != path.last {
            cur = self.nodes[cur.idx()].first_succ().unwrap();
            nts.push(self.nodes[cur.idx()].km.back());
        }
        nts
    }

    /// Concatenate a traversal into a contig: the first path contributes
    /// its full string, each following path only what lies past the
    /// shared `k-1` overlap.
    pub fn contig(&self, path: &[usize]) -> DNASeq2 {
        let mut contig = DNASeq2::new();
        for (i, &sp) in path.iter().enumerate() {
            let nts = self.spath_nts(sp);
            let skip = if i == 0 { 0 } else { self.km_len - 1 };
            for &nt in &nts[skip..] {
                contig.push(nt);
            }
        }
        contig
    }

    /// Render the simple-path graph as GFA.
    pub fn gfa(&self) -> String {
        let mut out = String::from("H\tVN:Z:1.0\n");
        for (sp, path) in self.spaths.iter().enumerate() {
            let nts: String = self.spath_nts(sp).iter().map(|nt| nt.to_char()).collect();
            let _ = writeln!(out, "S\t{}\t{}\tKC:i:{}", sp + 1, nts, path.cum_count);
        }
        for sp in 0..self.spaths.len() {
            for succ in self.spath_succs(sp).into_iter().flatten() {
                let _ = writeln!(
                    out,
                    "L\t{}\t+\t{}\t+\t{}M",
                    sp + 1,
                    succ + 1,
                    self.km_len - 1
                );
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assemble(seqs: &[&str], km_len: usize, min_count: usize) -> Option<String> {
        let seqs: Vec<DNASeq4> = seqs.iter().map(|s| DNASeq4::from_text(s)).collect();
        let refs: Vec<&DNASeq4> = seqs.iter().collect();
        let mut graph = Graph::new(km_len);
        graph.rebuild(&refs, min_count);
        if graph.empty() {
            return None;
        }
        let path = graph.find_best_path().ok()?;
        Some(graph.contig(&path).to_string())
    }

    #[test]
    fn kmer_shift_ops() {
        let km = Kmer::from_nts(&[Nt2::A, Nt2::C, Nt2::G]);
        assert_eq!(km.str(3), "ACG");
        assert_eq!(km.succ(3, Nt2::T).str(3), "CGT");
        assert_eq!(km.pred(3, Nt2::T).str(3), "TAC");
        assert_eq!(km.front(3), Nt2::A);
        assert_eq!(km.back(), Nt2::G);
    }

    #[test]
    fn kmer_iterator_skips_ns() {
        let seq = DNASeq4::from_text("ACGNTACGT");
        let kms: Vec<String> = kmers(&seq, 3).map(|km| km.str(3)).collect();
        assert_eq!(kms, vec!["TAC", "ACG", "CGT"]);
    }

    #[test]
    fn linear_sequence_reassembles() {
        let seq = "ACGGTCATCGGATTACCAGTA";
        let contig = assemble(&[seq, seq], 5, 2).unwrap();
        assert_eq!(contig, seq);
    }

    #[test]
    fn below_min_count_graph_is_empty() {
        let seqs: Vec<DNASeq4> = vec![DNASeq4::from_text("ACGGTCATCGGATTACC")];
        let refs: Vec<&DNASeq4> = seqs.iter().collect();
        let mut graph = Graph::new(5);
        graph.rebuild(&refs, 2);
        assert!(graph.empty());
    }

    #[test]
    fn rebuild_resets_state() {
        let a = DNASeq4::from_text("ACGGTCATCGGATTACC");
        let b = DNASeq4::from_text("TTGACCATGGCAAGGTC");
        let mut graph = Graph::new(5);
        graph.rebuild(&[&a, &a], 1);
        let n_first = graph.n_simple_paths();
        assert!(n_first > 0);
        graph.rebuild(&[&b, &b], 1);
        let path = graph.find_best_path().unwrap();
        assert_eq!(graph.contig(&path).to_string(), "TTGACCATGGCAAGGTC");
    }

    #[test]
    fn tandem_repeat_is_not_a_dag() {
        let seq = "ACGACGACGACGACGACG";
        let seqs = vec![DNASeq4::from_text(seq), DNASeq4::from_text(seq)];
        let refs: Vec<&DNASeq4> = seqs.iter().collect();
        let mut graph = Graph::new(5);
        graph.rebuild(&refs, 2);
        assert!(!graph.empty());
        assert_eq!(graph.find_best_path(), Err(NotADag));
    }

    #[test]
    fn higher_coverage_branch_wins() {
        // A bubble at one position; the C variant has three times the
        // depth of the T variant.
        let major = "AAGGCCATTACGGT";
        let minor = "AAGGCCATAACGGT";
        let contig = assemble(&[major, major, major, minor], 5, 1).unwrap();
        assert_eq!(contig, major);
    }

    #[test]
    fn contig_substrings_are_retained_kmers() {
        let seq = "ACGGTCATCGGATTACCAGTAGGCAT";
        let seqs = vec![DNASeq4::from_text(seq), DNASeq4::from_text(seq)];
        let refs: Vec<&DNASeq4> = seqs.iter().collect();
        let mut graph = Graph::new(7);
        graph.rebuild(&refs, 2);
        let path = graph.find_best_path().unwrap();
        let contig = graph.contig(&path).to_string();
        for i in 0..=contig.len() - 7 {
            let window = DNASeq4::from_text(&contig[i..i + 7]);
            let km = kmers(&window, 7).next().unwrap();
            assert!(graph.node_of.contains_key(&km));
        }
    }

    #[test]
    fn gfa_has_segments_and_links() {
        let seqs = vec![
            DNASeq4::from_text("AAGGCCATTACGGT"),
            DNASeq4::from_text("AAGGCCATTACGGT"),
            DNASeq4::from_text("AAGGCCATAACGGT"),
            DNASeq4::from_text("AAGGCCATAACGGT"),
        ];
        let refs: Vec<&DNASeq4> = seqs.iter().collect();
        let mut graph = Graph::new(5);
        graph.rebuild(&refs, 1);
        let gfa = graph.gfa();
        assert!(gfa.starts_with("H\tVN:Z:1.0\n"));
        assert!(gfa.contains("\nS\t") || gfa.contains("S\t1\t"));
        assert!(gfa.contains("4M"));
    }
}
