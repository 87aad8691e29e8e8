//! # Gapped alignment
//!
//! Needleman-Wunsch alignment with gap-open/gap-extend scoring, used to
//! place paired-end reads on the assembled contig. The score and path
//! matrices are reused across calls and only grow. Each path cell keeps
//! three independent back-pointer bits so equally scoring tracebacks can
//! be enumerated and ranked.
use std::cmp::Ordering;

use anyhow::{bail, ensure, Result};
use ndarray::Array2;

use crate::cigar::{Cigar, Op};

pub const MATCH_SCORE: f64 = 5.0;
pub const MISMATCH_SCORE: f64 = -4.0;
pub const GAP_OPEN_SCORE: f64 = -10.0;
pub const GAP_EXT_SCORE: f64 = -0.5;

/// Back-pointer bits of one matrix cell.
#[derive(Clone, Copy, Default, PartialEq, Eq, Debug)]
struct PathBits {
    diag: bool,
    up: bool,
    left: bool,
}

impl PathBits {
    fn count(self) -> u8 {
        self.diag as u8 + self.up as u8 + self.left as u8
    }

    fn clear(&mut self) {
        *self = PathBits::default();
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Dir {
    Down,
    Diag,
    Right,
}

/// One finished alignment, with the statistics used to rank tied
/// tracebacks.
#[derive(Clone, Default, Debug)]
pub struct AlignRes {
    pub cigar: Cigar,
    pub gap_cnt: usize,
    /// Matched columns before the first gap.
    pub contiguity: usize,
    pub pct_id: f64,
    /// Subject position of the first aligned base (local alignments).
    pub subj_pos: usize,
}

/// Rank tied alignments: fewest gaps, then highest identity, then
/// longest contiguity.
fn compare_alignres(a: &AlignRes, b: &AlignRes) -> Ordering {
    a.gap_cnt
        .cmp(&b.gap_cnt)
        .then(b.pct_id.partial_cmp(&a.pct_id).unwrap_or(Ordering::Equal))
        .then(b.contiguity.cmp(&a.contiguity))
}

/// A pre-matched span constraining the local alignment: `len` identical
/// nucleotides starting at `query_pos` / `subj_pos` (0-based).
#[derive(Clone, Copy, Debug)]
pub struct Anchor {
    pub query_pos: usize,
    pub subj_pos: usize,
    pub len: usize,
}

pub struct GappedAln {
    m: usize,
    n: usize,
    matrix: Array2<f64>,
    path: Array2<PathBits>,
    max_score: f64,
    max_m: usize,
    max_n: usize,
    result: AlignRes,
}

impl Default for GappedAln {
    fn default() -> GappedAln {
        GappedAln::new()
    }
}

impl GappedAln {
    pub fn new() -> GappedAln {
        GappedAln {
            m: 0,
            n: 0,
            matrix: Array2::zeros((0, 0)),
            path: Array2::default((0, 0)),
            max_score: 0.0,
            max_m: 0,
            max_n: 0,
            result: AlignRes::default(),
        }
    }

    /// Set the active dimensions for a query of `len_1` and a subject of
    /// `len_2` nucleotides. The matrices are reallocated only when they
    /// must grow, with a 25% margin to damp repeated growth.
    pub fn init(&mut self, len_1: usize, len_2: usize) {
        self.m = len_1 + 1;
        self.n = len_2 + 1;
        let (rows, cols) = self.matrix.dim();
        if self.m > rows || self.n > cols {
            let mut size = self.m.max(self.n);
            size += size / 4;
            self.matrix = Array2::zeros((size, size));
            self.path = Array2::default((size, size));
        }
        self.max_score = 0.0;
        self.max_m = 0;
        self.max_n = 0;
    }

    pub fn result(&self) -> &AlignRes {
        &self.result
    }

    /// Global alignment of `query` against `subj`.
    pub fn align(&mut self, query: &str, subj: &str) -> Result<&AlignRes> {
        ensure!(!query.is_empty() && !subj.is_empty(), "empty alignment input");
        self.init(query.len(), subj.len());
        let query = query.as_bytes().to_vec();
        let subj = subj.as_bytes().to_vec();

        // First row and column hold cumulative gap scores.
        self.matrix[[0, 0]] = 0.0;
        self.path[[0, 0]].clear();
        for i in 1..self.m {
            let ext = self.path[[i - 1, 0]].up;
            self.matrix[[i, 0]] =
                self.matrix[[i - 1, 0]] + if ext { GAP_EXT_SCORE } else { GAP_OPEN_SCORE };
            self.path[[i, 0]] = PathBits {
                diag: false,
                up: true,
                left: false,
            };
        }
        for j in 1..self.n {
            let ext = self.path[[0, j - 1]].left;
            self.matrix[[0, j]] =
                self.matrix[[0, j - 1]] + if ext { GAP_EXT_SCORE } else { GAP_OPEN_SCORE };
            self.path[[0, j]] = PathBits {
                diag: false,
                up: false,
                left: true,
            };
        }

        self.score_region(false, &query, 1, self.m - 1, &subj, 1, self.n - 1);
        self.result = self.trace_global(&query, &subj);
        Ok(&self.result)
    }

    /// Local alignment of `query` against `subj`, constrained to the
    /// regions around and between the given pre-matched `anchors`
    /// (ordered by query position). The result's CIGAR carries leading
    /// and trailing soft clips for unaligned query ends.
    pub fn align_constrained(
        &mut self,
        query: &str,
        subj: &str,
        anchors: &[Anchor],
    ) -> Result<&AlignRes> {
        ensure!(!anchors.is_empty(), "constrained alignment without anchors");
        self.init(query.len(), subj.len());
        let query = query.as_bytes().to_vec();
        let subj = subj.as_bytes().to_vec();

        // Unlike the global case only scattered regions get filled, so
        // start from a clean slate.
        for i in 0..self.m {
            for j in 0..self.n {
                self.matrix[[i, j]] = 0.0;
                self.path[[i, j]].clear();
            }
        }

        // Region before the first anchor, if the anchor does not start
        // at the beginning of the query.
        let front = anchors[0];
        if front.query_pos > 0 {
            let q_start = 1;
            let q_end = front.query_pos;
            let q_len = q_end;
            let s_end = front.subj_pos;
            let s_start = (1 + front.subj_pos).saturating_sub(2 * q_len).max(1);
            if s_start <= s_end {
                self.bound_region(q_start, q_end, s_start, s_end);
                self.score_region(true, &query, q_start, q_end, &subj, s_start, s_end);
            }
        }

        for (k, aln) in anchors.iter().enumerate() {
            // The anchor itself: matches along the diagonal.
            for off in 0..aln.len {
                let i = aln.query_pos + 1 + off;
                let j = aln.subj_pos + 1 + off;
                self.matrix[[i, j]] = self.matrix[[i - 1, j - 1]] + MATCH_SCORE;
                self.path[[i, j]] = PathBits {
                    diag: true,
                    up: false,
                    left: false,
                };
                if self.matrix[[i, j]] > self.max_score {
                    self.max_score = self.matrix[[i, j]];
                    self.max_m = i;
                    self.max_n = j;
                }
            }

            // Connector between this anchor and the next one.
            if let Some(next) = anchors.get(k + 1) {
                let q_start = 1 + aln.query_pos + aln.len;
                let q_end = next.query_pos;
                let s_start = 1 + aln.subj_pos + aln.len;
                let s_end = next.subj_pos;
                if q_start <= q_end && s_start <= s_end {
                    self.bound_region(q_start, q_end, s_start, s_end);
                    self.score_region(true, &query, q_start, q_end, &subj, s_start, s_end);
                }
            }
        }

        // Region past the last anchor, if it does not reach the end of
        // the query.
        let back = anchors[anchors.len() - 1];
        if back.query_pos + back.len < query.len() {
            let q_start = 1 + back.query_pos + back.len;
            let q_end = query.len();
            let q_len = q_end - q_start + 1;
            let s_start = (1 + back.subj_pos + back.len).min(self.n - 1);
            let s_end = (s_start + 2 * q_len).min(self.n - 1);
            if s_start <= s_end {
                self.bound_region(q_start, q_end, s_start, s_end);
                self.score_region(true, &query, q_start, q_end, &subj, s_start, s_end);
            }
        }

        if self.max_score <= 0.0 {
            bail!("constrained alignment found no positive-scoring cell");
        }
        self.result = self.trace_local(&query, &subj);
        Ok(&self.result)
    }

    /// Wall off a region about to be scored so tracebacks entering it
    /// from outside are funnelled along its borders.
    fn bound_region(&mut self, q_start: usize, q_end: usize, s_start: usize, s_end: usize) {
        let left_only = PathBits {
            diag: false,
            up: false,
            left: true,
        };
        let up_only = PathBits {
            diag: false,
            up: true,
            left: false,
        };

        // Row above the region points left.
        if q_start >= 1 {
            for j in s_start..=(s_end + 1).min(self.n - 1) {
                self.path[[q_start - 1, j]] = left_only;
            }
        }
        // Row below points up.
        if q_end + 1 < self.m {
            for j in s_start.saturating_sub(1)..=s_end {
                self.path[[q_end + 1, j]] = up_only;
            }
        }
        // Column to the left points up.
        if s_start >= 1 {
            for i in q_start..=(q_end + 1).min(self.m - 1) {
                self.path[[i, s_start - 1]] = up_only;
            }
        }
        // Column to the right points left.
        if s_end + 1 < self.n {
            for i in q_start.saturating_sub(1)..=q_end {
                self.path[[i, s_end + 1]] = left_only;
            }
        }
    }

    /// Fill one rectangular region of the matrix (1-based inclusive
    /// bounds). Gap extension applies when the predecessor cell already
    /// points in the same gap direction, otherwise gap open.
    fn score_region(
        &mut self,
        local: bool,
        query: &[u8],
        q_start: usize,
        q_end: usize,
        subj: &[u8],
        s_start: usize,
        s_end: usize,
    ) {
        for i in q_start..=q_end {
            for j in s_start..=s_end {
                let score_down = self.matrix[[i - 1, j]]
                    + if self.path[[i - 1, j]].up {
                        GAP_EXT_SCORE
                    } else {
                        GAP_OPEN_SCORE
                    };
                let score_diag = self.matrix[[i - 1, j - 1]]
                    + if query[i - 1] == subj[j - 1] {
                        MATCH_SCORE
                    } else {
                        MISMATCH_SCORE
                    };
                let score_right = self.matrix[[i, j - 1]]
                    + if self.path[[i, j - 1]].left {
                        GAP_EXT_SCORE
                    } else {
                        GAP_OPEN_SCORE
                    };

                // Order the three moves best first; ties keep the
                // down, diag, right preference.
                let mut ranked = [
                    (score_down, Dir::Down),
                    (score_diag, Dir::Diag),
                    (score_right, Dir::Right),
                ];
                if ranked[0].0 < ranked[1].0 {
                    ranked.swap(0, 1);
                }
                if ranked[1].0 < ranked[2].0 {
                    ranked.swap(1, 2);
                }
                if ranked[0].0 < ranked[1].0 {
                    ranked.swap(0, 1);
                }

                self.matrix[[i, j]] = ranked[0].0;
                if ranked[0].0 > self.max_score {
                    self.max_score = ranked[0].0;
                    self.max_m = i;
                    self.max_n = j;
                }

                // Local alignments cannot extend through non-positive
                // cells.
                if local && ranked[0].0 <= 0.0 {
                    self.path[[i, j]].clear();
                    continue;
                }

                let mut bits = PathBits::default();
                let mut mark = |dir: Dir| match dir {
                    Dir::Diag => bits.diag = true,
                    Dir::Down => bits.up = true,
                    Dir::Right => bits.left = true,
                };
                mark(ranked[0].1);
                if ranked[0].0 == ranked[1].0 {
                    mark(ranked[1].1);
                    if ranked[1].0 == ranked[2].0 {
                        mark(ranked[2].1);
                    }
                }
                self.path[[i, j]] = bits;
            }
        }
    }

    /// Enumerate tied global tracebacks from the bottom-right corner and
    /// keep the best one. Each pass clears one direction bit at every
    /// multi-path cell it crosses, so the enumeration terminates.
    fn trace_global(&mut self, query: &[u8], subj: &[u8]) -> AlignRes {
        let mut alns: Vec<AlignRes> = Vec::new();
        loop {
            let mut more_paths = false;
            let mut i = self.m - 1;
            let mut j = self.n - 1;
            let mut aln_1: Vec<u8> = Vec::new();
            let mut aln_2: Vec<u8> = Vec::new();

            while i > 0 || j > 0 {
                let bits = self.path[[i, j]];
                let cnt = bits.count();
                if cnt > 1 {
                    more_paths = true;
                }
                if bits.diag {
                    aln_1.push(query[i - 1]);
                    aln_2.push(subj[j - 1]);
                    if cnt > 1 {
                        self.path[[i, j]].diag = false;
                    }
                    i -= 1;
                    j -= 1;
                } else if bits.up {
                    aln_1.push(query[i - 1]);
                    aln_2.push(b'-');
                    if cnt > 1 {
                        self.path[[i, j]].up = false;
                    }
                    i -= 1;
                } else if bits.left {
                    aln_1.push(b'-');
                    aln_2.push(subj[j - 1]);
                    if cnt > 1 {
                        self.path[[i, j]].left = false;
                    }
                    j -= 1;
                } else {
                    break;
                }
            }

            aln_1.reverse();
            aln_2.reverse();
            alns.push(alignment_to_res(&aln_1, &aln_2, 0, 0, 0));

            if !more_paths {
                break;
            }
        }
        alns.sort_by(compare_alignres);
        alns.swap_remove(0)
    }

    /// Like [`Self::trace_global`] but starting from the maximum-scoring
    /// cell and stopping at the first cell with no exits, soft-clipping
    /// the unaligned query ends.
    fn trace_local(&mut self, query: &[u8], subj: &[u8]) -> AlignRes {
        let mut alns: Vec<AlignRes> = Vec::new();
        loop {
            let mut more_paths = false;
            let mut i = self.max_m;
            let mut j = self.max_n;
            let mut aln_1: Vec<u8> = Vec::new();
            let mut aln_2: Vec<u8> = Vec::new();
            let mut query_start = 0;

            while i > 0 || j > 0 {
                let bits = self.path[[i, j]];
                let cnt = bits.count();
                if cnt > 1 {
                    more_paths = true;
                }
                if bits.diag {
                    aln_1.push(query[i - 1]);
                    aln_2.push(subj[j - 1]);
                    if cnt > 1 {
                        self.path[[i, j]].diag = false;
                    }
                    i -= 1;
                    j -= 1;
                } else if bits.up {
                    aln_1.push(query[i - 1]);
                    aln_2.push(b'-');
                    if cnt > 1 {
                        self.path[[i, j]].up = false;
                    }
                    i -= 1;
                } else if bits.left {
                    aln_1.push(b'-');
                    aln_2.push(subj[j - 1]);
                    if cnt > 1 {
                        self.path[[i, j]].left = false;
                    }
                    j -= 1;
                } else {
                    query_start = i;
                    break;
                }
            }

            aln_1.reverse();
            aln_2.reverse();
            let trailing = query.len() - self.max_m;
            alns.push(alignment_to_res(&aln_1, &aln_2, query_start, trailing, j));

            if !more_paths {
                break;
            }
        }
        alns.sort_by(compare_alignres);
        alns.swap_remove(0)
    }
}

/// Convert a pair of aligned strings (gaps as `-`) into an [`AlignRes`].
fn alignment_to_res(
    aln_1: &[u8],
    aln_2: &[u8],
    leading_clip: usize,
    trailing_clip: usize,
    subj_pos: usize,
) -> AlignRes {
    let mut cigar = Cigar::new();
    if leading_clip > 0 {
        cigar.push(Op::SoftClip, leading_clip);
    }

    let len = aln_1.len();
    let mut gaps = 0;
    let mut contiguity = 0;
    let mut seq_break = false;
    let mut ident = 0usize;
    let mut i = 0;
    while i < len {
        if aln_1[i] != b'-' && aln_2[i] != b'-' {
            let mut cnt = 0;
            while i < len && aln_1[i] != b'-' && aln_2[i] != b'-' {
                if aln_1[i] == aln_2[i] {
                    ident += 1;
                }
                cnt += 1;
                i += 1;
                if !seq_break {
                    contiguity += 1;
                }
            }
            cigar.push(Op::Match, cnt);
        } else if aln_1[i] == b'-' {
            let mut cnt = 0;
            while i < len && aln_1[i] == b'-' {
                cnt += 1;
                i += 1;
            }
            cigar.push(Op::Del, cnt);
            gaps += 1;
            seq_break = true;
        } else {
            let mut cnt = 0;
            while i < len && aln_2[i] == b'-' {
                cnt += 1;
                i += 1;
            }
            cigar.push(Op::Ins, cnt);
            gaps += 1;
            seq_break = true;
        }
    }

    if trailing_clip > 0 {
        cigar.push(Op::SoftClip, trailing_clip);
    }

    AlignRes {
        cigar,
        gap_cnt: gaps,
        contiguity,
        pct_id: if len > 0 { ident as f64 / len as f64 } else { 0.0 },
        subj_pos,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::seq::DNASeq4;

    #[test]
    fn identical_sequences_align_all_match() {
        let mut aligner = GappedAln::new();
        let res = aligner.align("ACGTACGTAC", "ACGTACGTAC").unwrap().clone();
        assert_eq!(res.cigar.to_string(), "10M");
        assert_eq!(res.gap_cnt, 0);
        assert_eq!(res.pct_id, 1.0);
        assert_eq!(res.contiguity, 10);
    }

    #[test]
    fn single_mismatch_stays_gapless() {
        let mut aligner = GappedAln::new();
        let res = aligner.align("ACGTACGTAC", "ACGTTCGTAC").unwrap();
        assert_eq!(res.cigar.to_string(), "10M");
        assert_eq!(res.gap_cnt, 0);
        assert!((res.pct_id - 0.9).abs() < 1e-9);
    }

    #[test]
    fn subject_insertion_yields_deletion_op() {
        let mut aligner = GappedAln::new();
        let res = aligner.align("ACGTACGT", "ACGTTACGT").unwrap();
        assert_eq!(res.cigar.query_len(), 8);
        assert_eq!(res.cigar.ref_len(), 9);
        assert_eq!(res.gap_cnt, 1);
        assert!(res.cigar.to_string().contains('D'));
    }

    #[test]
    fn query_insertion_yields_insertion_op() {
        let mut aligner = GappedAln::new();
        let res = aligner.align("ACGTTACGT", "ACGTACGT").unwrap();
        assert_eq!(res.cigar.query_len(), 9);
        assert_eq!(res.cigar.ref_len(), 8);
        assert_eq!(res.gap_cnt, 1);
        assert!(res.cigar.to_string().contains('I'));
    }

    #[test]
    fn matrices_are_reused_across_calls() {
        let mut aligner = GappedAln::new();
        aligner.align("ACGTACGTACGTACGTACGT", "ACGTACGTACGTACGTACGT").unwrap();
        let res = aligner.align("ACGT", "ACGT").unwrap();
        assert_eq!(res.cigar.to_string(), "4M");
        let res = aligner.align("AACC", "AGCC").unwrap();
        assert_eq!(res.cigar.to_string(), "4M");
    }

    #[test]
    fn constrained_alignment_soft_clips_query_start() {
        let query = "TTTTTACGTACGT";
        let subj = "ACGTACGTAAAA";
        let anchors = [Anchor {
            query_pos: 5,
            subj_pos: 0,
            len: 8,
        }];
        let mut aligner = GappedAln::new();
        let res = aligner.align_constrained(query, subj, &anchors).unwrap().clone();
        assert_eq!(res.cigar.to_string(), "5S8M");
        assert_eq!(res.subj_pos, 0);
        assert_eq!(res.cigar.query_len(), query.len());

        // Applying the CIGAR projects the clip as leading Ns.
        let projected = res.cigar.apply_to_seq(&DNASeq4::from_text(query));
        assert_eq!(projected.str(), "NNNNNACGTACGT");
    }

    #[test]
    fn constrained_alignment_bridges_two_anchors() {
        // Two exact 6nt anchors separated by one mismatched nucleotide.
        let query = "ACGTGGATTACCGA";
        let subj = "ACGTGGCTTACCGA";
        let anchors = [
            Anchor {
                query_pos: 0,
                subj_pos: 0,
                len: 6,
            },
            Anchor {
                query_pos: 7,
                subj_pos: 7,
                len: 7,
            },
        ];
        let mut aligner = GappedAln::new();
        let res = aligner.align_constrained(query, subj, &anchors).unwrap();
        assert_eq!(res.cigar.to_string(), "14M");
        assert_eq!(res.gap_cnt, 0);
    }

    #[test]
    fn constrained_alignment_soft_clips_query_end() {
        let query = "ACGTACGTTTTTT";
        let subj = "AAAACGTACGT";
        let anchors = [Anchor {
            query_pos: 0,
            subj_pos: 3,
            len: 8,
        }];
        let mut aligner = GappedAln::new();
        let res = aligner.align_constrained(query, subj, &anchors).unwrap();
        assert_eq!(res.cigar.to_string(), "8M5S");
        assert_eq!(res.subj_pos, 3);
        assert_eq!(res.cigar.query_len(), query.len());
    }

    #[test]
    fn gap_extension_is_cheaper_than_reopening() {
        // A two-nucleotide deletion should stay contiguous rather than
        // split into two separate gaps.
        let mut aligner = GappedAln::new();
        let res = aligner.align("ACGTAAGGCC", "ACGTCCAAGGCC").unwrap();
        assert_eq!(res.gap_cnt, 1);
        assert_eq!(res.cigar.ref_len(), 12);
    }
}
