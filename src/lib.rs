//! # rystacks
//!
//! Per-locus variant discovery and haplotype phasing over a RAD-seq
//! locus catalog. For every locus the pipeline assembles a paired-end
//! contig, aligns the paired reads to it, juxtaposes it with the
//! forward reads, calls a genotype at every column, phases each sample's
//! heterozygous sites from read evidence, and emits the consensus,
//! per-site calls and model tables.
//!
//! The heavy lifting happens in [`process_locus`], which is meant to be
//! called from inside a rayon parallel iterator: workers own all
//! per-locus state (graph, aligner, alignment set) and return the
//! locus's formatted output for the single writer loop to drain in
//! input order.
use std::collections::{BTreeSet, HashMap, HashSet};
use std::fmt::Write as _;

use anyhow::Result;
use log::{debug, warn};

pub mod align;
pub mod cigar;
pub mod cli;
pub mod debruijn;
pub mod io;
pub mod locus;
pub mod metapop;
pub mod model;
pub mod phase;
pub mod seq;

use align::GappedAln;
use cigar::Cigar;
use debruijn::Graph;
use locus::{AlnRead, LocAlnSet, LocReadSet, SiteCounts};
use metapop::MetaPopInfo;
use model::{Model, SiteCall, SnpCall};
use phase::PhasedHet;
use seq::{DNASeq4, Nt2, Nt4};

/// Paired reads whose alignment to the contig needs more CIGAR
/// operations than this did not really align and are dropped.
pub const MAX_ALN_CIGAR_OPS: usize = 10;

/// Number of Ns juxtaposed between the forward region and the
/// paired-end contig.
pub const PE_SPACER_LEN: usize = 10;

/// Everything a worker needs to process a locus. Built once from the
/// command line and shared immutably.
#[derive(Clone, Debug)]
pub struct Config {
    pub model: Model,
    pub km_length: usize,
    pub min_km_count: usize,
    pub write_haplotypes: bool,
    pub write_gfa: bool,
    pub write_alns: bool,
    pub write_hapgraphs: bool,
    pub vcf_write_depths: bool,
}

impl Config {
    /// The configuration block reported on the console and in the run
    /// log.
    pub fn report(&self, in_dir: &std::path::Path, batch_id: u32, n_whitelisted: usize) -> String {
        let mut out = String::from("Configuration for this run:\n");
        let _ = writeln!(out, "  Input directory: '{}'", in_dir.display());
        let _ = writeln!(out, "  Batch ID: {batch_id}");
        let _ = writeln!(out, "  Model: {}", self.model);
        if n_whitelisted > 0 {
            let _ = writeln!(out, "  Whitelist of {n_whitelisted} loci.");
        }
        if self.km_length != 31 {
            let _ = writeln!(out, "  Kmer length: {}", self.km_length);
        }
        if self.min_km_count != 2 {
            let _ = writeln!(out, "  Min coverage: {}", self.min_km_count);
        }
        out
    }
}

/// Reusable per-worker scratch state, reset between loci.
pub struct Workspace {
    pub graph: Graph,
    pub aligner: GappedAln,
}

impl Workspace {
    pub fn new(km_length: usize) -> Workspace {
        Workspace {
            graph: Graph::new(km_length),
            aligner: GappedAln::new(),
        }
    }
}

/// The formatted output of one processed locus.
#[derive(Debug, Default)]
pub struct LocusOutput {
    pub id: u32,
    /// Why the paired-end stage was abandoned, if it was.
    pub pe_skip: Option<&'static str>,
    pub fasta: String,
    pub vcf: String,
    pub models: String,
    pub alns: Option<String>,
    pub gfa: Option<String>,
    pub hapgraph: Option<String>,
}

/// Run the whole per-locus pipeline. Returns `None` when the locus has
/// no usable forward reads and nothing can be emitted.
pub fn process_locus(
    loc: LocReadSet,
    mpopi: &MetaPopInfo,
    cfg: &Config,
    ws: &mut Workspace,
) -> Result<Option<LocusOutput>> {
    let LocReadSet {
        id,
        fw_reads,
        pe_reads,
    } = loc;
    if fw_reads.is_empty() {
        debug!("locus {id}: no forward reads");
        return Ok(None);
    }

    let mut out = LocusOutput {
        id,
        ..LocusOutput::default()
    };

    // Assemble the paired-end reads and align them back to the contig.
    let mut pe_aln_loc: Option<LocAlnSet> = None;
    if !pe_reads.is_empty() {
        match assemble_pe_contig(id, pe_reads, mpopi, cfg, ws, &mut out)? {
            Ok(aln_set) => pe_aln_loc = Some(aln_set),
            Err(reason) => out.pe_skip = Some(reason),
        }
    }

    // The forward reads all share the locus length and align trivially.
    let mut fw_aln_loc = LocAlnSet::new(id, mpopi.n_samples());
    fw_aln_loc.set_ref(fw_reads[0].seq.clone());
    let fw_len = fw_aln_loc.ref_seq().len();
    for r in fw_reads {
        if r.seq.len() != fw_len {
            warn!("locus {id}: skipping read '{}' of odd length", r.name);
            continue;
        }
        let cigar = Cigar::full_match(fw_len);
        fw_aln_loc.add(AlnRead::new(r, cigar));
    }
    if fw_aln_loc.reads().is_empty() {
        debug!("locus {id}: no usable forward reads");
        return Ok(None);
    }

    // Merge the forward and paired-end contigs.
    let mut aln_loc = match pe_aln_loc {
        None => fw_aln_loc,
        Some(pe_aln_loc) => {
            let mut spacer = LocAlnSet::new(id, mpopi.n_samples());
            spacer.set_ref(DNASeq4::from_text(&"N".repeat(PE_SPACER_LEN)));
            let mut joined = LocAlnSet::juxtapose(
                fw_aln_loc,
                LocAlnSet::juxtapose(spacer, pe_aln_loc),
            );
            joined.merge_paired_reads();
            joined
        }
    };

    if cfg.write_alns {
        out.alns = Some(format!(
            "BEGIN {id}\n{}END {id}\n",
            aln_loc.dump_alns(mpopi)
        ));
    }

    // Call a genotype at every column.
    let mut depths: Vec<SiteCounts> = Vec::with_capacity(aln_loc.ref_seq().len());
    let mut calls: Vec<SiteCall> = Vec::with_capacity(aln_loc.ref_seq().len());
    for site in aln_loc.sites() {
        calls.push(cfg.model.call(&site));
        depths.push(site);
    }

    // Update the consensus sequence.
    let mut new_ref = aln_loc.ref_seq().clone();
    for (i, call) in calls.iter().enumerate() {
        match call.most_frequent_allele() {
            Some(nt) => new_ref.set(i, Nt4::from(nt)),
            None => new_ref.set(i, Nt4::N),
        }
    }
    aln_loc.set_ref(new_ref);

    // Call haplotypes.
    let mut phase_data = None;
    if cfg.write_haplotypes {
        let phase_res = phase::phase_hets(&calls, &aln_loc, mpopi, cfg.write_hapgraphs);
        out.hapgraph = phase_res.hapgraph;

        // Observed haplotypes inconsistent with a diploid sample void
        // that sample's data for the whole locus.
        for &sample in &phase_res.inconsistent {
            debug!(
                "locus {id}: inconsistent haplotypes for sample '{}'",
                mpopi.samples()[sample].name
            );
            for (site, call) in depths.iter_mut().zip(calls.iter_mut()) {
                site.tot.sub_counts(&site.samples[sample]);
                site.samples[sample] = seq::Counts::new();
                call.discard_sample(sample);
            }
        }
        phase_data = Some(phase_res.phase_data);
    }

    write_one_locus(&mut out, &aln_loc, &depths, &calls, phase_data.as_deref(), mpopi, cfg);
    Ok(Some(out))
}

/// The paired-end half of the pipeline: de Bruijn assembly, best-path
/// contig extraction and read re-alignment. The inner `Err` names the
/// reason the stage was abandoned; the locus goes on without it.
fn assemble_pe_contig(
    id: u32,
    pe_reads: Vec<locus::Read>,
    mpopi: &MetaPopInfo,
    cfg: &Config,
    ws: &mut Workspace,
    out: &mut LocusOutput,
) -> Result<std::result::Result<LocAlnSet, &'static str>> {
    let seqs: Vec<&DNASeq4> = pe_reads.iter().map(|r| &r.seq).collect();
    ws.graph.rebuild(&seqs, cfg.min_km_count);
    if ws.graph.empty() {
        return Ok(Err("empty kmer graph"));
    }
    if cfg.write_gfa {
        out.gfa = Some(ws.graph.gfa());
    }

    let path = match ws.graph.find_best_path() {
        Ok(path) => path,
        Err(debruijn::NotADag) => return Ok(Err("kmer graph is not a DAG")),
    };
    let contig = ws.graph.contig(&path);
    let ctg = contig.to_string();

    let mut aln_set = LocAlnSet::new(id, mpopi.n_samples());
    aln_set.set_ref(DNASeq4::from(&contig));
    for r in pe_reads {
        let res = ws.aligner.align(&r.seq.str(), &ctg)?;
        if res.cigar.n_ops() > MAX_ALN_CIGAR_OPS {
            // Read did not really align; drop it.
            continue;
        }
        let cigar = res.cigar.clone();
        aln_set.add(AlnRead::new(r, cigar));
    }
    if aln_set.reads().is_empty() {
        return Ok(Err("no paired read aligned to the contig"));
    }
    Ok(Ok(aln_set))
}

/// Format the locus's FASTA record, VCF records and model table lines.
fn write_one_locus(
    out: &mut LocusOutput,
    aln_loc: &LocAlnSet,
    depths: &[SiteCounts],
    calls: &[SiteCall],
    phase_data: Option<&[std::collections::BTreeMap<usize, PhasedHet>]>,
    mpopi: &MetaPopInfo,
    cfg: &Config,
) {
    let loc_id = aln_loc.id();
    let ref_seq = aln_loc.ref_seq();
    debug_assert_eq!(depths.len(), ref_seq.len());
    debug_assert_eq!(calls.len(), ref_seq.len());

    //
    // VCF records.
    //
    // A phase set spanning a single column carries no phase
    // information; those genotypes are reported unphased, without PS.
    let multi_site_ps: Option<Vec<HashSet<usize>>> = phase_data.map(|data| {
        data.iter()
            .map(|sample_map| {
                let mut counts: HashMap<usize, usize> = HashMap::new();
                for p in sample_map.values() {
                    *counts.entry(p.phase_set).or_insert(0) += 1;
                }
                counts
                    .into_iter()
                    .filter(|&(_, n)| n >= 2)
                    .map(|(ps, _)| ps)
                    .collect()
            })
            .collect()
    });

    let mut sample_sites_w_data = vec![0usize; mpopi.n_samples()];
    for i in 0..ref_seq.len() {
        let sitedepths = &depths[i];
        let sitecall = &calls[i];
        if sitecall.alleles().is_empty() {
            // No useful data at this site.
            continue;
        }
        let ref_nt = ref_seq.at(i);
        if !ref_nt.is_acgt() {
            continue;
        }

        // The reference allele comes first, the alternatives by
        // decreasing frequency.
        let ref_nt2 = ref_nt.to_nt2().unwrap();
        let mut vcf_alleles: Vec<Nt2> = vec![ref_nt2];
        for &(nt, _) in sitecall.alleles() {
            if nt != ref_nt2 {
                vcf_alleles.push(nt);
            }
        }
        let allele_index =
            |nt: Nt2| vcf_alleles.iter().position(|&a| a == nt).unwrap();

        let rec = &mut out.vcf;
        let _ = write!(rec, "{loc_id}\t{}\t.\t{ref_nt2}\t", i + 1);
        if vcf_alleles.len() == 1 {
            // Fixed site.
            let _ = write!(rec, ".\t.\t.\t");
            let _ = write!(
                rec,
                "DP={};AD={}",
                sitedepths.tot.sum(),
                sitedepths.tot.get(ref_nt2)
            );
            if cfg.vcf_write_depths {
                let _ = write!(rec, ";cnts={}", counts_list(&sitedepths.tot));
            }
            let _ = write!(rec, "\tDP");
            for (sample, counts) in sitedepths.samples.iter().enumerate() {
                let dp = counts.sum();
                if dp == 0 {
                    let _ = write!(rec, "\t.");
                    continue;
                }
                sample_sites_w_data[sample] += 1;
                let _ = write!(rec, "\t{dp}");
            }
        } else {
            // Polymorphic site.
            let alts: Vec<String> = vcf_alleles[1..].iter().map(|nt| nt.to_string()).collect();
            let _ = write!(rec, "{}\t.\t.\t", alts.join(","));

            let ad: Vec<String> = vcf_alleles
                .iter()
                .map(|&nt| sitedepths.tot.get(nt).to_string())
                .collect();
            let af: Vec<String> = vcf_alleles[1..]
                .iter()
                .map(|&nt| format!("{:.3}", sitecall.freq(nt).unwrap_or(0.0)))
                .collect();
            let _ = write!(
                rec,
                "DP={};AD={};AF={}",
                sitedepths.tot.sum(),
                ad.join(","),
                af.join(",")
            );
            if cfg.vcf_write_depths {
                let _ = write!(rec, ";cnts={}", counts_list(&sitedepths.tot));
            }

            let _ = write!(rec, "\tGT");
            if cfg.write_haplotypes {
                let _ = write!(rec, ":PS");
            }
            let _ = write!(rec, ":DP:AD:GL");
            if cfg.vcf_write_depths {
                let _ = write!(rec, ":cnts");
            }

            for (sample, counts) in sitedepths.samples.iter().enumerate() {
                let dp = counts.sum();
                if dp == 0 {
                    let _ = write!(rec, "\t.");
                    continue;
                }
                sample_sites_w_data[sample] += 1;
                let scall = &sitecall.sample_calls()[sample];

                let mut genotype = String::new();
                match (scall.call(), scall.nts()) {
                    (SnpCall::Hom, Some((nt, _))) => {
                        let gt = allele_index(nt);
                        let _ = write!(genotype, "{gt}/{gt}");
                        if cfg.write_haplotypes {
                            genotype.push_str(":.");
                        }
                    }
                    (SnpCall::Het, Some((nt0, nt1))) => {
                        let phased_het = phase_data
                            .and_then(|data| data[sample].get(&i))
                            .filter(|p| {
                                multi_site_ps
                                    .as_ref()
                                    .is_some_and(|ps| ps[sample].contains(&p.phase_set))
                            });
                        match phased_het {
                            Some(p) => {
                                let _ = write!(
                                    genotype,
                                    "{}|{}:{}",
                                    allele_index(p.left),
                                    allele_index(p.right),
                                    p.phase_set + 1
                                );
                            }
                            None => {
                                let mut gt = [allele_index(nt0), allele_index(nt1)];
                                gt.sort_unstable();
                                let _ = write!(genotype, "{}/{}", gt[0], gt[1]);
                                if cfg.write_haplotypes {
                                    genotype.push_str(":.");
                                }
                            }
                        }
                    }
                    _ => {
                        genotype.push('.');
                        if cfg.write_haplotypes {
                            genotype.push_str(":.");
                        }
                    }
                }

                let _ = write!(genotype, ":{dp}");
                let sample_ad: Vec<String> = vcf_alleles
                    .iter()
                    .map(|&nt| counts.get(nt).to_string())
                    .collect();
                let _ = write!(genotype, ":{}", sample_ad.join(","));
                let _ = write!(genotype, ":{}", fmt_gt_gl(&vcf_alleles, scall));
                if cfg.vcf_write_depths {
                    let _ = write!(genotype, ":{}", counts_list(counts));
                }
                let _ = write!(rec, "\t{genotype}");
            }
        }
        rec.push('\n');
    }

    //
    // FASTA record. Some samples may have been discarded because their
    // haplotypes were inconsistent.
    //
    let samples_w_reads: BTreeSet<usize> =
        aln_loc.reads().iter().map(|r| r.read.sample).collect();
    let n_remaining = sample_sites_w_data.iter().filter(|&&n| n > 0).count();
    let _ = write!(out.fasta, ">{loc_id} NS={n_remaining}");
    if n_remaining < samples_w_reads.len() {
        let _ = write!(
            out.fasta,
            " n_discarded_samples={}",
            samples_w_reads.len() - n_remaining
        );
    }
    let _ = writeln!(out.fasta, "\n{}", ref_seq.str());

    //
    // Models table: LOCID \t LINETYPE \t SAMPLEID \t CONTENTS.
    //
    let tsv = &mut out.models;
    let _ = writeln!(tsv, "{loc_id}\tconsensus\t\t{}", ref_seq.str());

    let _ = write!(tsv, "{loc_id}\tmodel\t\t");
    for call in calls {
        let _ = write!(tsv, "{}", call.alleles().len());
    }
    tsv.push('\n');

    let _ = write!(tsv, "{loc_id}\tdepth\t\t");
    for site in depths {
        let _ = write!(tsv, "{:02x}", site.tot.sum().min(0xff));
    }
    tsv.push('\n');

    for (s, sample) in mpopi.samples().iter().enumerate() {
        let _ = write!(tsv, "{loc_id}\ts_model\t{}\t", sample.id);
        for call in calls {
            let code = match call.alleles().len() {
                0 => 'U',
                1 => 'O',
                _ => match call.sample_calls()[s].call() {
                    SnpCall::Hom => 'O',
                    SnpCall::Het => 'E',
                    SnpCall::Unk => 'U',
                },
            };
            let _ = write!(tsv, "{code}");
        }
        tsv.push('\n');

        let _ = write!(tsv, "{loc_id}\ts_depths\t{}\t", sample.id);
        for site in depths {
            for nt in Nt2::ALL {
                let _ = write!(tsv, "{:02x}", site.samples[s].get(nt).min(0xff));
            }
        }
        tsv.push('\n');
    }
}

fn counts_list(counts: &seq::Counts) -> String {
    let list: Vec<String> = Nt2::ALL
        .iter()
        .map(|&nt| counts.get(nt).to_string())
        .collect();
    list.join(",")
}

/// The VCF `GL` field: log10 genotype likelihoods over the site's
/// alleles, in VCF genotype order.
fn fmt_gt_gl(vcf_alleles: &[Nt2], scall: &model::SampleCall) -> String {
    let mut gls = Vec::new();
    for (k, &b) in vcf_alleles.iter().enumerate() {
        for &a in vcf_alleles.iter().take(k + 1) {
            gls.push(format!(
                "{:.2}",
                scall.lnls().at(a, b) / std::f64::consts::LN_10
            ));
        }
    }
    gls.join(",")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ModelType;

    fn test_config() -> Config {
        Config {
            model: Model::new(ModelType::Snp, 0.05, 0.05).unwrap(),
            km_length: 5,
            min_km_count: 2,
            write_haplotypes: true,
            write_gfa: false,
            write_alns: false,
            write_hapgraphs: false,
            vcf_write_depths: false,
        }
    }

    fn one_sample_mpopi() -> MetaPopInfo {
        MetaPopInfo::from_rgs(vec![(1, "sample_1".to_string())])
    }

    #[test]
    fn locus_without_forward_reads_is_discarded() {
        let cfg = test_config();
        let mpopi = one_sample_mpopi();
        let mut ws = Workspace::new(cfg.km_length);
        let out = process_locus(LocReadSet::new(9), &mpopi, &cfg, &mut ws).unwrap();
        assert!(out.is_none());
    }

    #[test]
    fn odd_length_forward_reads_are_skipped() {
        let cfg = test_config();
        let mpopi = one_sample_mpopi();
        let mut ws = Workspace::new(cfg.km_length);

        let mut loc = LocReadSet::new(11);
        for i in 0..10 {
            loc.fw_reads.push(locus::Read::new(
                format!("r{i}"),
                DNASeq4::from_text("ACGTACGTAC"),
                0,
            ));
        }
        loc.fw_reads.push(locus::Read::new(
            "short".to_string(),
            DNASeq4::from_text("ACGT"),
            0,
        ));

        let out = process_locus(loc, &mpopi, &cfg, &mut ws).unwrap().unwrap();
        // The truncated read contributes no depth.
        assert!(out.models.contains("11\tdepth\t\t0a0a0a0a0a0a0a0a0a0a\n"));
    }

    #[test]
    fn empty_pe_graph_keeps_the_locus_forward_only() {
        let cfg = test_config();
        let mpopi = one_sample_mpopi();
        let mut ws = Workspace::new(cfg.km_length);

        let mut loc = LocReadSet::new(12);
        for i in 0..10 {
            loc.fw_reads.push(locus::Read::new(
                format!("r{i}"),
                DNASeq4::from_text("ACGTACGTAC"),
                0,
            ));
        }
        // A single paired read: no kmer reaches the minimum count.
        loc.pe_reads.push(locus::Read::new(
            "p0".to_string(),
            DNASeq4::from_text("TTGACCATGG"),
            0,
        ));

        let out = process_locus(loc, &mpopi, &cfg, &mut ws).unwrap().unwrap();
        assert_eq!(out.pe_skip, Some("empty kmer graph"));
        assert!(out.fasta.contains("\nACGTACGTAC\n"));
    }

    #[test]
    fn gl_field_follows_vcf_genotype_order() {
        let model = Model::new(ModelType::Snp, 0.05, 0.05).unwrap();
        let mut site = SiteCounts::new(1);
        for _ in 0..10 {
            site.samples[0].add(Nt2::C);
            site.tot.add(Nt2::C);
        }
        for _ in 0..10 {
            site.samples[0].add(Nt2::G);
            site.tot.add(Nt2::G);
        }
        let call = model.call(&site);
        let scall = &call.sample_calls()[0];
        let gl = fmt_gt_gl(&[Nt2::C, Nt2::G], scall);
        let values: Vec<f64> = gl.split(',').map(|v| v.parse().unwrap()).collect();
        assert_eq!(values.len(), 3);
        // The heterozygous genotype is the most likely.
        assert!(values[1] > values[0]);
        assert!(values[1] > values[2]);
    }
}
