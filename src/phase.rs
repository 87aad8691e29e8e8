//! # Read-backed haplotype phasing
//!
//! Resolves the diploid phase of each sample's heterozygous sites from
//! the allele pairs observed together on individual reads. Cooccurring
//! alleles form a graph; connected subgraphs are haplotypes and may not
//! contain two alleles of the same site. Samples whose graph violates
//! that constraint are reported as inconsistent.
use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Write as _;

use crate::locus::LocAlnSet;
use crate::metapop::MetaPopInfo;
use crate::model::{SiteCall, SnpCall};
use crate::seq::{Nt2, Nt4};

/// Minimum number of reads that must support an allele pair before the
/// edge takes part in phasing. Weight-1 edges are drawn (dotted) in the
/// DOT output but otherwise ignored.
pub const MIN_COOCCURRENCES: usize = 2;

/// One phased heterozygous site of one sample.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct PhasedHet {
    /// Column of the first phased SNP of the set, per the VCF `PS`
    /// convention.
    pub phase_set: usize,
    pub left: Nt2,
    pub right: Nt2,
}

/// Symmetric counter of allele pairs observed on the same read, over the
/// SNPs of one locus. Only the `i < j` half is stored.
pub struct CooccurrenceCounter {
    n_snps: usize,
    counts: Vec<[[usize; 4]; 4]>,
}

impl CooccurrenceCounter {
    pub fn new(n_snps: usize) -> CooccurrenceCounter {
        CooccurrenceCounter {
            n_snps,
            counts: vec![[[0; 4]; 4]; n_snps * n_snps],
        }
    }

    pub fn at(&self, snp_i: usize, nt_i: Nt2, snp_j: usize, nt_j: Nt2) -> usize {
        assert!(snp_i < snp_j);
        self.counts[snp_i * self.n_snps + snp_j][nt_i.index()][nt_j.index()]
    }

    pub fn increment(&mut self, snp_i: usize, nt_i: Nt2, snp_j: usize, nt_j: Nt2) {
        assert!(snp_i < snp_j);
        self.counts[snp_i * self.n_snps + snp_j][nt_i.index()][nt_j.index()] += 1;
    }

    pub fn clear(&mut self) {
        for m in &mut self.counts {
            *m = [[0; 4]; 4];
        }
    }
}

/// The outcome of phasing one locus.
#[derive(Debug, Default)]
pub struct PhaseResult {
    /// Per sample: column of a phased het site to its phasing.
    pub phase_data: Vec<BTreeMap<usize, PhasedHet>>,
    /// Samples whose cooccurrence graph was not 2-colourable.
    pub inconsistent: BTreeSet<usize>,
    /// DOT rendering of the per-sample haplotype graphs, when requested.
    pub hapgraph: Option<String>,
}

/// Phase every sample of the locus. `calls` must hold one [`SiteCall`]
/// per reference column.
pub fn phase_hets(
    calls: &[SiteCall],
    aln_loc: &LocAlnSet,
    mpopi: &MetaPopInfo,
    want_graph: bool,
) -> PhaseResult {
    let n_samples = mpopi.n_samples();
    let mut result = PhaseResult {
        phase_data: vec![BTreeMap::new(); n_samples],
        ..PhaseResult::default()
    };

    // The SNP columns of this locus.
    let snp_cols: Vec<usize> = (0..aln_loc.ref_seq().len())
        .filter(|&i| calls[i].alleles().len() > 1)
        .collect();
    if snp_cols.is_empty() {
        return result;
    }

    let mut graph = String::new();
    if want_graph {
        let cols: Vec<String> = snp_cols.iter().map(|c| c.to_string()).collect();
        let _ = write!(
            graph,
            "subgraph cluster_loc{} {{\n\tlabel=\"locus {}\";\n\t# snp columns: {}\n",
            aln_loc.id(),
            aln_loc.id(),
            cols.join(",")
        );
    }

    let mut cooccurrences = CooccurrenceCounter::new(snp_cols.len());
    for sample in 0..n_samples {
        if aln_loc.sample_reads(sample).is_empty() {
            continue;
        }

        // The heterozygous SNPs of this sample, as indices into snp_cols.
        let het_snps: Vec<usize> = (0..snp_cols.len())
            .filter(|&snp_i| {
                calls[snp_cols[snp_i]].sample_calls()[sample].call() == SnpCall::Het
            })
            .collect();
        if het_snps.is_empty() {
            continue;
        }
        if het_snps.len() == 1 {
            // Trivial one-site haplotypes.
            let col = snp_cols[het_snps[0]];
            let (nt0, nt1) = calls[col].sample_calls()[sample].nts().unwrap();
            result.phase_data[sample].insert(
                col,
                PhasedHet {
                    phase_set: col,
                    left: nt0,
                    right: nt1,
                },
            );
            continue;
        }

        let het_calls: Vec<(Nt2, Nt2)> = het_snps
            .iter()
            .map(|&het_i| {
                calls[snp_cols[het_i]].sample_calls()[sample]
                    .nts()
                    .unwrap()
            })
            .collect();

        count_cooccurrences(
            &mut cooccurrences,
            aln_loc,
            sample,
            &snp_cols,
            &het_snps,
            &het_calls,
        );

        if want_graph {
            write_sample_graph(
                &mut graph,
                aln_loc,
                mpopi,
                sample,
                &snp_cols,
                &het_snps,
                &het_calls,
                &cooccurrences,
            );
        }

        match assemble_haplotypes(&cooccurrences, &het_snps, &het_calls) {
            None => {
                result.inconsistent.insert(sample);
            }
            Some(haps) => {
                record_phase_sets(
                    &mut result.phase_data[sample],
                    &haps,
                    &snp_cols,
                    &het_snps,
                    &het_calls,
                );
            }
        }
        cooccurrences.clear();
    }

    if want_graph {
        graph.push_str("}\n");
        result.hapgraph = Some(graph);
    }
    result
}

/// Scan each read of the sample and count the allele pairs it reports.
/// A read contributes at a site only if it carries one of the two called
/// alleles there; anything else is treated as missing.
fn count_cooccurrences(
    cooccurrences: &mut CooccurrenceCounter,
    aln_loc: &LocAlnSet,
    sample: usize,
    snp_cols: &[usize],
    het_snps: &[usize],
    het_calls: &[(Nt2, Nt2)],
) {
    let mut read_hap: Vec<Option<Nt2>> = vec![None; het_snps.len()];
    for &read_i in aln_loc.sample_reads(sample) {
        let mut cols = aln_loc.reads()[read_i].columns();
        let mut pos = 0;
        for (het_i, &snp_i) in het_snps.iter().enumerate() {
            let col = snp_cols[snp_i];
            let nt = cols.nth(col - pos).unwrap_or(None).unwrap_or(Nt4::N);
            pos = col + 1;
            read_hap[het_i] = match nt.to_nt2() {
                Some(nt2) => {
                    let (nt0, nt1) = het_calls[het_i];
                    if nt2 == nt0 || nt2 == nt1 {
                        Some(nt2)
                    } else {
                        None
                    }
                }
                None => None,
            };
        }

        for i in 0..het_snps.len() {
            let Some(nti) = read_hap[i] else { continue };
            for j in i + 1..het_snps.len() {
                let Some(ntj) = read_hap[j] else { continue };
                cooccurrences.increment(het_snps[i], nti, het_snps[j], ntj);
            }
        }
    }
}

/// Greedy union-merge of cooccurring alleles into haplotypes. Each
/// haplotype holds at most one allele per site; `None` signals that the
/// constraint was violated and the sample cannot be phased as a diploid.
fn assemble_haplotypes(
    cooccurrences: &CooccurrenceCounter,
    het_snps: &[usize],
    het_calls: &[(Nt2, Nt2)],
) -> Option<Vec<Vec<Option<Nt2>>>> {
    let n_hets = het_snps.len();
    let mut haps: Vec<Vec<Option<Nt2>>> = Vec::new();
    // Which haplotype each allele currently belongs to.
    let mut allele_to_hap: Vec<[Option<usize>; 4]> = vec![[None; 4]; n_hets];

    for het_i in 0..n_hets {
        let alleles_i = [het_calls[het_i].0, het_calls[het_i].1];
        let snp_i = het_snps[het_i];
        for het_j in het_i + 1..n_hets {
            let alleles_j = [het_calls[het_j].0, het_calls[het_j].1];
            let snp_j = het_snps[het_j];
            for nti in alleles_i {
                for ntj in alleles_j {
                    let n = cooccurrences.at(snp_i, nti, snp_j, ntj);
                    if n < MIN_COOCCURRENCES {
                        // Too little support; weight-1 edges are noise.
                        continue;
                    }

                    let hap_i = allele_to_hap[het_i][nti.index()];
                    let hap_j = allele_to_hap[het_j][ntj.index()];
                    match (hap_i, hap_j) {
                        (None, None) => {
                            // Two singletons: start a new haplotype.
                            let mut hap = vec![None; n_hets];
                            hap[het_i] = Some(nti);
                            hap[het_j] = Some(ntj);
                            allele_to_hap[het_i][nti.index()] = Some(haps.len());
                            allele_to_hap[het_j][ntj.index()] = Some(haps.len());
                            haps.push(hap);
                        }
                        (Some(hi), Some(hj)) if hi == hj => {}
                        (Some(hi), None) => {
                            if haps[hi][het_j].is_some() {
                                // Another allele of site j is already
                                // phased into this haplotype.
                                return None;
                            }
                            haps[hi][het_j] = Some(ntj);
                            allele_to_hap[het_j][ntj.index()] = Some(hi);
                        }
                        (None, Some(hj)) => {
                            if haps[hj][het_i].is_some() {
                                return None;
                            }
                            haps[hj][het_i] = Some(nti);
                            allele_to_hap[het_i][nti.index()] = Some(hj);
                        }
                        (Some(hi), Some(hj)) => {
                            // Merging is only consistent if the two
                            // haplotypes cover disjoint sites.
                            for k in 0..n_hets {
                                if haps[hi][k].is_some() && haps[hj][k].is_some() {
                                    return None;
                                }
                            }
                            let rm_hap = std::mem::take(&mut haps[hj]);
                            for (k, allele) in rm_hap.into_iter().enumerate() {
                                if let Some(nt) = allele {
                                    haps[hi][k] = Some(nt);
                                    allele_to_hap[k][nt.index()] = Some(hi);
                                }
                            }
                        }
                    }
                }
            }
        }
    }
    Some(haps)
}

/// Pair up haplotypes into phase sets and emit one [`PhasedHet`] per
/// column both cover. Columns no pair covers come out as singletons.
fn record_phase_sets(
    phased: &mut BTreeMap<usize, PhasedHet>,
    haps: &[Vec<Option<Nt2>>],
    snp_cols: &[usize],
    het_snps: &[usize],
    het_calls: &[(Nt2, Nt2)],
) {
    for i in 0..haps.len() {
        if haps[i].is_empty() {
            // Deleted remnant of a merger.
            continue;
        }
        for j in i + 1..haps.len() {
            if haps[j].is_empty() {
                continue;
            }
            // Each pair of haplotypes becomes one phase set. With three
            // or more haplotypes the pairs cover disjoint columns by
            // construction.
            let mut phase_set = None;
            for (het_i, &snp_i) in het_snps.iter().enumerate() {
                let (Some(left), Some(right)) = (haps[i][het_i], haps[j][het_i]) else {
                    continue;
                };
                let col = snp_cols[snp_i];
                let ps = *phase_set.get_or_insert(col);
                phased.insert(
                    col,
                    PhasedHet {
                        phase_set: ps,
                        left,
                        right,
                    },
                );
            }
        }
    }

    // Unpaired columns become their own one-site phase sets.
    for (het_i, &snp_i) in het_snps.iter().enumerate() {
        let col = snp_cols[snp_i];
        if !phased.contains_key(&col) {
            let (nt0, nt1) = het_calls[het_i];
            phased.insert(
                col,
                PhasedHet {
                    phase_set: col,
                    left: nt0,
                    right: nt1,
                },
            );
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn write_sample_graph(
    graph: &mut String,
    aln_loc: &LocAlnSet,
    mpopi: &MetaPopInfo,
    sample: usize,
    snp_cols: &[usize],
    het_snps: &[usize],
    het_calls: &[(Nt2, Nt2)],
    cooccurrences: &CooccurrenceCounter,
) {
    let node_id = |col: usize, allele: Nt2| {
        format!("l{}s{}c{}{}", aln_loc.id(), sample, col, allele.to_char())
    };

    let n_reads = aln_loc.sample_reads(sample).len();
    let n_merged = aln_loc
        .sample_reads(sample)
        .iter()
        .filter(|&&i| aln_loc.reads()[i].read.name.ends_with('m'))
        .count();
    let het_cols: Vec<String> = het_snps
        .iter()
        .map(|&snp_i| snp_cols[snp_i].to_string())
        .collect();
    let _ = write!(
        graph,
        "\tsubgraph cluster_sample{} {{\n\t\tlabel=\"i{} '{}'\\nnreads={},merged={}\";\n\t\tstyle=dashed;\n\t\t# heterozygous columns: {}\n",
        sample,
        sample,
        mpopi.samples()[sample].name,
        n_reads,
        n_merged,
        het_cols.join(",")
    );

    for (het_i, &snp_i) in het_snps.iter().enumerate() {
        let col = snp_cols[snp_i];
        for allele in [het_calls[het_i].0, het_calls[het_i].1] {
            let _ = writeln!(
                graph,
                "\t\t{} [label=<<sup><font point-size=\"10\">{}</font></sup>{}>];",
                node_id(col, allele),
                col,
                allele.to_char()
            );
        }
    }

    for (het_i, &snp_i) in het_snps.iter().enumerate() {
        for (het_j_off, &snp_j) in het_snps.iter().enumerate().skip(het_i + 1) {
            for nti in [het_calls[het_i].0, het_calls[het_i].1] {
                for ntj in [het_calls[het_j_off].0, het_calls[het_j_off].1] {
                    let n = cooccurrences.at(snp_i, nti, snp_j, ntj);
                    if n == 0 {
                        continue;
                    }
                    let style = if n == 1 {
                        "style=dotted".to_string()
                    } else {
                        format!("label=\"{n}\",penwidth={n}")
                    };
                    let _ = writeln!(
                        graph,
                        "\t\t{} -- {} [{}];",
                        node_id(snp_cols[snp_i], nti),
                        node_id(snp_cols[snp_j], ntj),
                        style
                    );
                }
            }
        }
    }
    graph.push_str("\t}\n");
}
