//! # CIGAR strings
//!
//! Run-length encoded alignment operations and the editing routines that
//! project a read into the reference frame. Operations follow the SAM
//! conventions; the aligner only emits M/I/D/S but the BAM reader may
//! see the full set.
use std::fmt;

use anyhow::{bail, Result};

use crate::seq::{DNASeq4, Nt4};

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Op {
    Match,
    Ins,
    Del,
    SoftClip,
    RefSkip,
    HardClip,
    Pad,
    Equal,
    Diff,
}

impl Op {
    pub fn from_char(c: char) -> Result<Op> {
        Ok(match c {
            'M' => Op::Match,
            'I' => Op::Ins,
            'D' => Op::Del,
            'S' => Op::SoftClip,
            'N' => Op::RefSkip,
            'H' => Op::HardClip,
            'P' => Op::Pad,
            '=' => Op::Equal,
            'X' => Op::Diff,
            _ => bail!("illegal CIGAR operation '{c}'"),
        })
    }

    pub fn to_char(self) -> char {
        match self {
            Op::Match => 'M',
            Op::Ins => 'I',
            Op::Del => 'D',
            Op::SoftClip => 'S',
            Op::RefSkip => 'N',
            Op::HardClip => 'H',
            Op::Pad => 'P',
            Op::Equal => '=',
            Op::Diff => 'X',
        }
    }

    /// Does this operation advance the position in the reference?
    pub fn consumes_ref(self) -> bool {
        matches!(
            self,
            Op::Match | Op::Del | Op::RefSkip | Op::Equal | Op::Diff
        )
    }

    /// Does this operation advance the position in the query?
    pub fn consumes_query(self) -> bool {
        matches!(
            self,
            Op::Match | Op::Ins | Op::SoftClip | Op::Equal | Op::Diff
        )
    }
}

/// A CIGAR string: a run-length encoded vector of operations.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct Cigar(Vec<(Op, usize)>);

impl Cigar {
    pub fn new() -> Cigar {
        Cigar::default()
    }

    pub fn from_ops(ops: Vec<(Op, usize)>) -> Cigar {
        let mut c = Cigar::new();
        for (op, len) in ops {
            c.push(op, len);
        }
        c
    }

    /// A single-operation CIGAR covering `len` matched positions.
    pub fn full_match(len: usize) -> Cigar {
        Cigar(vec![(Op::Match, len)])
    }

    pub fn parse(text: &str) -> Result<Cigar> {
        let mut cigar = Cigar::new();
        let mut len: usize = 0;
        let mut have_len = false;
        for c in text.chars() {
            if let Some(d) = c.to_digit(10) {
                len = len * 10 + d as usize;
                have_len = true;
            } else {
                if !have_len {
                    bail!("malformed CIGAR string '{text}'");
                }
                cigar.push(Op::from_char(c)?, len);
                len = 0;
                have_len = false;
            }
        }
        if have_len {
            bail!("malformed CIGAR string '{text}': trailing length");
        }
        Ok(cigar)
    }

    pub fn ops(&self) -> &[(Op, usize)] {
        &self.0
    }

    pub fn n_ops(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Append an operation, merging it with the last one if equal.
    pub fn push(&mut self, op: Op, len: usize) {
        if len == 0 {
            return;
        }
        if let Some(last) = self.0.last_mut() {
            if last.0 == op {
                last.1 += len;
                return;
            }
        }
        self.0.push((op, len));
    }

    /// Prepend an operation, merging it with the first one if equal.
    pub fn push_front(&mut self, op: Op, len: usize) {
        if len == 0 {
            return;
        }
        if let Some(first) = self.0.first_mut() {
            if first.0 == op {
                first.1 += len;
                return;
            }
        }
        self.0.insert(0, (op, len));
    }

    /// Total length consumed in the query sequence.
    pub fn query_len(&self) -> usize {
        self.0
            .iter()
            .filter(|(op, _)| op.consumes_query())
            .map(|(_, len)| len)
            .sum()
    }

    /// Total length consumed in the reference sequence.
    pub fn ref_len(&self) -> usize {
        self.0
            .iter()
            .filter(|(op, _)| op.consumes_ref())
            .map(|(_, len)| len)
            .sum()
    }

    /// Reverse the operation order, as needed when a record was aligned
    /// to the minus strand and its sequence has been reverse complemented.
    pub fn reverse(&mut self) {
        self.0.reverse();
    }

    /// Swap insertions and deletions, turning a query-vs-subject CIGAR
    /// into a subject-vs-query one.
    pub fn invert(&self) -> Cigar {
        Cigar(
            self.0
                .iter()
                .map(|&(op, len)| match op {
                    Op::Ins => (Op::Del, len),
                    Op::Del => (Op::Ins, len),
                    other => (other, len),
                })
                .collect(),
        )
    }

    /// Project the query through the alignment: soft-clipped positions
    /// become N, deletions insert N runs, matches and insertions copy
    /// query bases.
    pub fn apply_to_seq(&self, seq: &DNASeq4) -> DNASeq4 {
        let mut out = DNASeq4::new();
        let mut bp = 0;
        for &(op, len) in &self.0 {
            match op {
                Op::SoftClip => {
                    for _ in 0..len {
                        out.push(Nt4::N);
                    }
                    bp += len;
                }
                Op::Del | Op::RefSkip => {
                    for _ in 0..len {
                        out.push(Nt4::N);
                    }
                }
                Op::Ins | Op::Match | Op::Equal | Op::Diff => {
                    for _ in 0..len {
                        out.push(seq.at(bp));
                        bp += 1;
                    }
                }
                Op::HardClip | Op::Pad => {}
            }
        }
        out
    }

    /// Edit a read in place so it lines up with the reference while
    /// keeping its length: soft clips become N, deletions insert an
    /// N-padded gap and shift the remainder right (truncated at the 3'
    /// end), insertions are removed and the 3' end is N-padded.
    pub fn edit_gaps(&self, seq: &mut DNASeq4) {
        let len = seq.len();
        let mut bp = 0;
        for &(op, dist) in &self.0 {
            match op {
                Op::SoftClip => {
                    let stop = (bp + dist).min(len);
                    while bp < stop {
                        seq.set(bp, Nt4::N);
                        bp += 1;
                    }
                }
                Op::Del | Op::RefSkip => {
                    // Save the suffix, write the gap, shift the suffix.
                    let tail: Vec<Nt4> = (bp.min(len)..len).map(|i| seq.at(i)).collect();
                    let stop = (bp + dist).min(len);
                    while bp < stop {
                        seq.set(bp, Nt4::N);
                        bp += 1;
                    }
                    let mut j = bp;
                    for nt in tail {
                        if j >= len {
                            break;
                        }
                        seq.set(j, nt);
                        j += 1;
                    }
                }
                Op::Ins => {
                    if bp >= len {
                        continue;
                    }
                    let from = (bp + dist).min(len);
                    let tail: Vec<Nt4> = (from..len).map(|i| seq.at(i)).collect();
                    let mut j = bp;
                    for nt in tail {
                        seq.set(j, nt);
                        j += 1;
                    }
                    while j < len {
                        seq.set(j, Nt4::N);
                        j += 1;
                    }
                }
                Op::Match | Op::Equal | Op::Diff => {
                    bp += dist;
                }
                Op::HardClip | Op::Pad => {}
            }
        }
    }
}

impl fmt::Display for Cigar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for &(op, len) in &self.0 {
            write!(f, "{}{}", len, op.to_char())?;
        }
        Ok(())
    }
}

impl fmt::Debug for Cigar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Cigar(\"{self}\")")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_and_format() {
        let c = Cigar::parse("5S10M2I3D80M").unwrap();
        assert_eq!(c.to_string(), "5S10M2I3D80M");
        assert_eq!(c.n_ops(), 5);
        assert_eq!(c.query_len(), 5 + 10 + 2 + 80);
        assert_eq!(c.ref_len(), 10 + 3 + 80);
    }

    #[test]
    fn parse_rejects_garbage() {
        assert!(Cigar::parse("10Q").is_err());
        assert!(Cigar::parse("M").is_err());
        assert!(Cigar::parse("10M5").is_err());
    }

    #[test]
    fn push_merges_runs() {
        let mut c = Cigar::new();
        c.push(Op::Match, 5);
        c.push(Op::Match, 3);
        c.push(Op::Del, 0);
        c.push(Op::Del, 2);
        assert_eq!(c.to_string(), "8M2D");
        c.push_front(Op::Match, 2);
        assert_eq!(c.to_string(), "10M2D");
        c.push_front(Op::Del, 4);
        assert_eq!(c.to_string(), "4D10M2D");
    }

    #[test]
    fn invert_swaps_indels() {
        let c = Cigar::parse("4M1I3M2D1M").unwrap();
        assert_eq!(c.invert().to_string(), "4M1D3M2I1M");
    }

    #[test]
    fn apply_soft_clip_yields_leading_ns() {
        let c = Cigar::parse("5S5M").unwrap();
        let seq = DNASeq4::from_text("ACGTACGTAC");
        assert_eq!(c.apply_to_seq(&seq).str(), "NNNNNCGTAC");
    }

    #[test]
    fn apply_expands_deletions() {
        let c = Cigar::parse("3M2D3M").unwrap();
        let seq = DNASeq4::from_text("ACGTTT");
        assert_eq!(c.apply_to_seq(&seq).str(), "ACGNNTTT");
    }

    #[test]
    fn edit_gaps_collapses_insertion() {
        // Read AACCGGTT with a 2nt insertion after the first 2 bases.
        let c = Cigar::parse("2M2I4M").unwrap();
        let mut seq = DNASeq4::from_text("AACCGGTT");
        c.edit_gaps(&mut seq);
        assert_eq!(seq.str(), "AAGGTTNN");
    }

    #[test]
    fn edit_gaps_expands_deletion() {
        let c = Cigar::parse("2M2D6M").unwrap();
        let mut seq = DNASeq4::from_text("AACCGGTT");
        c.edit_gaps(&mut seq);
        assert_eq!(seq.str(), "AANNCCGG");
    }
}
