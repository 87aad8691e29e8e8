//! # Locus read and alignment sets
//!
//! `LocReadSet` is what the catalog reader hands to the driver: the raw
//! forward and paired-end reads of one locus. `LocAlnSet` is the aligned
//! form: a reference contig plus reads carrying CIGARs whose
//! reference-consumed length equals the reference length. Genotyping
//! walks the alignment column by column through [`LocAlnSet::sites`].
use std::collections::HashMap;

use crate::cigar::{Cigar, Op};
use crate::metapop::MetaPopInfo;
use crate::seq::{Counts, DNASeq4, Nt4};

/// A read tagged with the index of its sample in the metapopulation.
#[derive(Clone, Debug)]
pub struct Read {
    pub name: String,
    pub seq: DNASeq4,
    pub sample: usize,
}

impl Read {
    pub fn new(name: String, seq: DNASeq4, sample: usize) -> Read {
        Read { name, seq, sample }
    }
}

/// The reads of one locus, as read from the catalog.
#[derive(Clone, Debug, Default)]
pub struct LocReadSet {
    pub id: u32,
    pub fw_reads: Vec<Read>,
    pub pe_reads: Vec<Read>,
}

impl LocReadSet {
    pub fn new(id: u32) -> LocReadSet {
        LocReadSet {
            id,
            fw_reads: Vec::new(),
            pe_reads: Vec::new(),
        }
    }
}

/// A read placed on the locus reference.
#[derive(Clone, Debug)]
pub struct AlnRead {
    pub read: Read,
    pub cigar: Cigar,
}

impl AlnRead {
    pub fn new(read: Read, cigar: Cigar) -> AlnRead {
        AlnRead { read, cigar }
    }

    /// Iterate the reference columns of this read. Yields `Some(nt)` for
    /// columns the read covers with a base and `None` for columns it
    /// spans with a deletion; inserted and soft-clipped query bases are
    /// skipped.
    pub fn columns(&self) -> ColumnIter<'_> {
        ColumnIter {
            seq: &self.read.seq,
            ops: self.cigar.ops(),
            op_i: 0,
            op_off: 0,
            qpos: 0,
        }
    }
}

pub struct ColumnIter<'a> {
    seq: &'a DNASeq4,
    ops: &'a [(Op, usize)],
    op_i: usize,
    op_off: usize,
    qpos: usize,
}

impl<'a> Iterator for ColumnIter<'a> {
    type Item = Option<Nt4>;

    fn next(&mut self) -> Option<Option<Nt4>> {
        loop {
            let &(op, len) = self.ops.get(self.op_i)?;
            if self.op_off == len {
                self.op_i += 1;
                self.op_off = 0;
                continue;
            }
            match op {
                Op::Match | Op::Equal | Op::Diff => {
                    let nt = self.seq.at(self.qpos);
                    self.qpos += 1;
                    self.op_off += 1;
                    return Some(Some(nt));
                }
                Op::Del | Op::RefSkip => {
                    self.op_off += 1;
                    return Some(None);
                }
                Op::Ins | Op::SoftClip => {
                    self.qpos += len;
                    self.op_i += 1;
                    self.op_off = 0;
                }
                Op::HardClip | Op::Pad => {
                    self.op_i += 1;
                    self.op_off = 0;
                }
            }
        }
    }
}

/// Per-column nucleotide depths, per sample and locus-wide.
#[derive(Clone, Debug, Default)]
pub struct SiteCounts {
    pub samples: Vec<Counts>,
    pub tot: Counts,
}

impl SiteCounts {
    pub fn new(n_samples: usize) -> SiteCounts {
        SiteCounts {
            samples: vec![Counts::new(); n_samples],
            tot: Counts::new(),
        }
    }
}

/// The aligned representation of one locus.
#[derive(Clone, Debug)]
pub struct LocAlnSet {
    id: u32,
    n_samples: usize,
    ref_seq: DNASeq4,
    reads: Vec<AlnRead>,
    sample_reads: Vec<Vec<usize>>,
}

impl LocAlnSet {
    pub fn new(id: u32, n_samples: usize) -> LocAlnSet {
        LocAlnSet {
            id,
            n_samples,
            ref_seq: DNASeq4::new(),
            reads: Vec::new(),
            sample_reads: vec![Vec::new(); n_samples],
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn n_samples(&self) -> usize {
        self.n_samples
    }

    pub fn ref_seq(&self) -> &DNASeq4 {
        &self.ref_seq
    }

    pub fn set_ref(&mut self, ref_seq: DNASeq4) {
        self.ref_seq = ref_seq;
    }

    pub fn reads(&self) -> &[AlnRead] {
        &self.reads
    }

    /// Indices of the reads belonging to `sample`.
    pub fn sample_reads(&self, sample: usize) -> &[usize] {
        &self.sample_reads[sample]
    }

    pub fn add(&mut self, aln_read: AlnRead) {
        debug_assert_eq!(
            aln_read.cigar.ref_len(),
            self.ref_seq.len(),
            "read '{}' does not span the reference",
            aln_read.read.name
        );
        self.sample_reads[aln_read.read.sample].push(self.reads.len());
        self.reads.push(aln_read);
    }

    /// Iterate per-column [`SiteCounts`] over all reads.
    pub fn sites(&self) -> SiteIter<'_> {
        SiteIter {
            aln: self,
            col: 0,
            col_iters: self.reads.iter().map(AlnRead::columns).collect(),
        }
    }

    /// Concatenate two alignment sets horizontally. Reads of `a` are
    /// padded with a deletion over `b`'s reference and vice versa, so
    /// every read still spans the full (concatenated) reference.
    pub fn juxtapose(a: LocAlnSet, b: LocAlnSet) -> LocAlnSet {
        assert_eq!(a.n_samples, b.n_samples);
        let a_len = a.ref_seq.len();
        let b_len = b.ref_seq.len();

        let mut out = LocAlnSet::new(a.id, a.n_samples);
        let mut ref_seq = a.ref_seq;
        ref_seq.append(&b.ref_seq);
        out.set_ref(ref_seq);

        for mut r in a.reads {
            r.cigar.push(Op::Del, b_len);
            out.add(r);
        }
        for mut r in b.reads {
            r.cigar.push_front(Op::Del, a_len);
            out.add(r);
        }
        out
    }

    /// Combine the two mates of each template into a single aligned row
    /// spanning both sides. Mates share a read name up to the `/1`/`/2`
    /// suffix; merged rows are renamed with a trailing `m`.
    pub fn merge_paired_reads(&mut self) {
        let mut by_template: HashMap<(usize, String), Vec<usize>> = HashMap::new();
        for (i, r) in self.reads.iter().enumerate() {
            by_template
                .entry((r.read.sample, template_name(&r.read.name).to_string()))
                .or_default()
                .push(i);
        }

        let mut merged_away = vec![false; self.reads.len()];
        let mut merged_reads: Vec<AlnRead> = Vec::new();
        // Walk reads in order so output does not depend on map order.
        for (i, r) in self.reads.iter().enumerate() {
            if merged_away[i] {
                continue;
            }
            let key = (r.read.sample, template_name(&r.read.name).to_string());
            let group = &by_template[&key];
            if group.len() == 2 && group[0] == i {
                let mate = group[1];
                merged_away[i] = true;
                merged_away[mate] = true;
                merged_reads.push(merge_rows(
                    &self.reads[i],
                    &self.reads[mate],
                    self.ref_seq.len(),
                ));
            }
        }

        let old_reads = std::mem::take(&mut self.reads);
        self.sample_reads = vec![Vec::new(); self.n_samples];
        for (i, r) in old_reads.into_iter().enumerate() {
            if !merged_away[i] {
                self.add(r);
            }
        }
        for r in merged_reads {
            self.add(r);
        }
    }

    /// Render the reference and every aligned read, one row per read
    /// (name, sample, per-column bases).
    pub fn dump_alns(&self, mpopi: &MetaPopInfo) -> String {
        let mut out = String::new();
        out.push_str(&self.ref_seq.str());
        out.push('\n');
        for r in &self.reads {
            let cols: String = r
                .columns()
                .map(|c| match c {
                    Some(nt) => nt.to_char(),
                    None => '-',
                })
                .collect();
            out.push_str(&r.read.name);
            out.push('\t');
            out.push_str(&mpopi.samples()[r.read.sample].name);
            out.push('\t');
            out.push_str(&cols);
            out.push('\n');
        }
        out
    }
}

/// The template (mate-pair) name of a read: its name without the
/// trailing `/1` or `/2`.
fn template_name(name: &str) -> &str {
    name.strip_suffix("/1")
        .or_else(|| name.strip_suffix("/2"))
        .unwrap_or(name)
}

/// Merge two mate rows column-wise. Where only one mate covers a column
/// its base is taken; where both do, the first mate wins unless its base
/// is N.
fn merge_rows(a: &AlnRead, b: &AlnRead, ref_len: usize) -> AlnRead {
    let mut seq = DNASeq4::new();
    let mut cigar = Cigar::new();
    let mut a_cols = a.columns();
    let mut b_cols = b.columns();
    for _ in 0..ref_len {
        let ca = a_cols.next().unwrap_or(None);
        let cb = b_cols.next().unwrap_or(None);
        let merged = match (ca, cb) {
            (Some(x), Some(y)) => Some(if x == Nt4::N { y } else { x }),
            (Some(x), None) => Some(x),
            (None, Some(y)) => Some(y),
            (None, None) => None,
        };
        match merged {
            Some(nt) => {
                seq.push(nt);
                cigar.push(Op::Match, 1);
            }
            None => cigar.push(Op::Del, 1),
        }
    }
    AlnRead::new(
        Read::new(
            format!("{}m", template_name(&a.read.name)),
            seq,
            a.read.sample,
        ),
        cigar,
    )
}

pub struct SiteIter<'a> {
    aln: &'a LocAlnSet,
    col: usize,
    col_iters: Vec<ColumnIter<'a>>,
}

impl<'a> Iterator for SiteIter<'a> {
    type Item = SiteCounts;

    fn next(&mut self) -> Option<SiteCounts> {
        if self.col >= self.aln.ref_seq.len() {
            return None;
        }
        self.col += 1;
        let mut counts = SiteCounts::new(self.aln.n_samples);
        for (r, cols) in self.aln.reads.iter().zip(self.col_iters.iter_mut()) {
            if let Some(Some(nt)) = cols.next() {
                if let Some(nt2) = nt.to_nt2() {
                    counts.samples[r.read.sample].add(nt2);
                    counts.tot.add(nt2);
                }
            }
        }
        Some(counts)
    }
}
