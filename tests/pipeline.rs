//! End-to-end scenarios for the per-locus pipeline, driven through
//! `process_locus` on constructed read sets.
use rystacks::align::{Anchor, GappedAln};
use rystacks::locus::{LocReadSet, Read};
use rystacks::metapop::MetaPopInfo;
use rystacks::model::{Model, ModelType};
use rystacks::seq::DNASeq4;
use rystacks::{process_locus, Config, LocusOutput, Workspace};

fn config() -> Config {
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

fn one_sample() -> MetaPopInfo {
    MetaPopInfo::from_rgs(vec![(1, "sample_1".to_string())])
}

fn two_samples() -> MetaPopInfo {
    MetaPopInfo::from_rgs(vec![(1, "sample_1".to_string()), (2, "sample_2".to_string())])
}

fn locus(id: u32, fw: &[(&str, usize)]) -> LocReadSet {
    let mut loc = LocReadSet::new(id);
    for (i, &(seq, sample)) in fw.iter().enumerate() {
        loc.fw_reads
            .push(Read::new(format!("r{i}"), DNASeq4::from_text(seq), sample));
    }
    loc
}

fn run_locus(loc: LocReadSet, mpopi: &MetaPopInfo, cfg: &Config) -> LocusOutput {
    let mut ws = Workspace::new(cfg.km_length);
    process_locus(loc, mpopi, cfg, &mut ws).unwrap().unwrap()
}

fn variant_lines(out: &LocusOutput) -> Vec<&str> {
    out.vcf.lines().filter(|l| l.contains("GT")).collect()
}

#[test]
fn trivial_monomorphic_locus() {
    let cfg = config();
    let mpopi = one_sample();
    let reads: Vec<(&str, usize)> = vec![("ACGTACGTAC", 0); 10];
    let out = run_locus(locus(1, &reads), &mpopi, &cfg);

    // No variant records; every site is emitted as a fixed record.
    assert!(variant_lines(&out).is_empty());
    assert_eq!(out.vcf.lines().count(), 10);
    for line in out.vcf.lines() {
        let fields: Vec<&str> = line.split('\t').collect();
        assert_eq!(fields[0], "1");
        assert_eq!(fields[4], ".");
        assert!(fields[7].starts_with("DP=10"));
        assert_eq!(fields[8], "DP");
        assert_eq!(fields[9], "10");
    }

    assert_eq!(out.fasta, ">1 NS=1\nACGTACGTAC\n");
    assert!(out.models.contains("1\tconsensus\t\tACGTACGTAC\n"));
    assert!(out.models.contains("1\tmodel\t\t1111111111\n"));
    assert!(out.models.contains("1\ts_model\t1\tOOOOOOOOOO\n"));
    assert!(out
        .models
        .contains("1\tdepth\t\t0a0a0a0a0a0a0a0a0a0a\n"));
}

#[test]
fn single_het_snp() {
    let cfg = config();
    let mpopi = one_sample();
    let mut reads: Vec<(&str, usize)> = vec![("AAACAAAA", 0); 10];
    reads.extend(vec![("AAAGAAAA", 0); 10]);
    let out = run_locus(locus(2, &reads), &mpopi, &cfg);

    let variants = variant_lines(&out);
    assert_eq!(variants.len(), 1);
    let fields: Vec<&str> = variants[0].split('\t').collect();
    assert_eq!(fields[1], "4");
    assert_eq!(fields[3], "C");
    assert_eq!(fields[4], "G");
    assert!(fields[7].contains("AD=10,10"));
    assert!(fields[7].contains("AF=0.500"));
    assert_eq!(fields[8], "GT:PS:DP:AD:GL");
    // A lone het carries no phase set.
    assert!(fields[9].starts_with("0/1:.:20:10,10:"));
    // The GL vector covers the three genotypes over two alleles.
    let gl = fields[9].rsplit(':').next().unwrap();
    assert_eq!(gl.split(',').count(), 3);

    assert!(out.models.contains("2\ts_model\t1\tOOOEOOOO\n"));
}

#[test]
fn two_snp_phased_het() {
    let cfg = config();
    let mpopi = one_sample();
    let mut reads: Vec<(&str, usize)> = vec![("ACAAAC", 0); 10];
    reads.extend(vec![("AGAAAT", 0); 10]);
    let out = run_locus(locus(3, &reads), &mpopi, &cfg);

    let variants = variant_lines(&out);
    assert_eq!(variants.len(), 2);

    // Both records carry PS = the 1-based column of the first het, and
    // the haplotypes pair C with C and G with T.
    let first: Vec<&str> = variants[0].split('\t').collect();
    assert_eq!(first[1], "2");
    assert_eq!((first[3], first[4]), ("C", "G"));
    assert!(first[9].starts_with("0|1:2:20:10,10:"));

    let second: Vec<&str> = variants[1].split('\t').collect();
    assert_eq!(second[1], "6");
    assert_eq!((second[3], second[4]), ("C", "T"));
    assert!(second[9].starts_with("0|1:2:20:10,10:"));
}

#[test]
fn inconsistent_haplotypes_blank_the_sample() {
    let cfg = config();
    let mpopi = two_samples();
    let mut loc = LocReadSet::new(4);
    // Sample 0: two clean haplotypes.
    for i in 0..10 {
        loc.fw_reads
            .push(Read::new(format!("a{i}"), DNASeq4::from_text("ACAAAC"), 0));
        loc.fw_reads
            .push(Read::new(format!("b{i}"), DNASeq4::from_text("AGAAAT"), 0));
    }
    // Sample 1: three well-supported haplotypes (CC, GT, CT).
    for i in 0..8 {
        loc.fw_reads
            .push(Read::new(format!("c{i}"), DNASeq4::from_text("ACAAAC"), 1));
        loc.fw_reads
            .push(Read::new(format!("d{i}"), DNASeq4::from_text("AGAAAT"), 1));
        loc.fw_reads
            .push(Read::new(format!("e{i}"), DNASeq4::from_text("ACAAAT"), 1));
    }
    let out = run_locus(loc, &mpopi, &cfg);

    let variants = variant_lines(&out);
    assert_eq!(variants.len(), 2);
    for line in &variants {
        let fields: Vec<&str> = line.split('\t').collect();
        // Sample 0 keeps its phased genotype; sample 1 is blanked.
        assert!(fields[9].starts_with("0|1:2:"));
        assert_eq!(fields[10], ".");
    }
    assert!(out.fasta.starts_with(">4 NS=1 n_discarded_samples=1\n"));
    // The blanked sample reads U at the variant columns and has zero
    // depth across the whole locus (six columns, four hex pairs each).
    assert!(out.models.contains("4\ts_model\t2\tOUOOOU\n"));
    let zeros = "0".repeat(48);
    assert!(out.models.contains(&format!("4\ts_depths\t2\t{zeros}\n")));
}

#[test]
fn non_dag_assembly_keeps_forward_consensus() {
    let cfg = config();
    let mpopi = one_sample();
    let mut loc = locus(5, &vec![("ACGTACGTAC", 0); 10]);
    // Tandem repeat within k: the kmer graph is cyclic.
    for i in 0..5 {
        loc.pe_reads.push(Read::new(
            format!("p{i}"),
            DNASeq4::from_text("ACGACGACGACGACG"),
            0,
        ));
    }
    let out = run_locus(loc, &mpopi, &cfg);

    assert_eq!(out.pe_skip, Some("kmer graph is not a DAG"));
    assert_eq!(out.fasta, ">5 NS=1\nACGTACGTAC\n");
}

#[test]
fn soft_clipped_alignment_projects_leading_ns() {
    let query = "TTTTTACGTACGT";
    let subj = "ACGTACGTAAAA";
    let anchors = [Anchor {
        query_pos: 5,
        subj_pos: 0,
        len: 8,
    }];
    let mut aligner = GappedAln::new();
    let res = aligner
        .align_constrained(query, subj, &anchors)
        .unwrap()
        .clone();

    assert!(res.cigar.to_string().starts_with("5S"));
    assert_eq!(res.subj_pos, 0);
    let projected = res.cigar.apply_to_seq(&DNASeq4::from_text(query));
    assert_eq!(&projected.str()[..5], "NNNNN");
}

#[test]
fn paired_end_stage_extends_the_locus() {
    let cfg = config();
    let mpopi = one_sample();
    let mut loc = LocReadSet::new(7);
    for i in 0..6 {
        loc.fw_reads.push(Read::new(
            format!("t{i}"),
            DNASeq4::from_text("ACGTACGTAC"),
            0,
        ));
        loc.pe_reads.push(Read::new(
            format!("t{i}"),
            DNASeq4::from_text("TTGACCATGG"),
            0,
        ));
    }
    let out = run_locus(loc, &mpopi, &cfg);

    assert_eq!(out.pe_skip, None);
    // Forward region, ten-N spacer, paired-end contig.
    assert_eq!(out.fasta, ">7 NS=1\nACGTACGTACNNNNNNNNNNTTGACCATGG\n");
    assert!(out
        .models
        .contains("7\tmodel\t\t111111111100000000001111111111\n"));
}

#[test]
fn no_haps_disables_phase_output() {
    let mut cfg = config();
    cfg.write_haplotypes = false;
    let mpopi = one_sample();
    let mut reads: Vec<(&str, usize)> = vec![("ACAAAC", 0); 10];
    reads.extend(vec![("AGAAAT", 0); 10]);
    let out = run_locus(locus(8, &reads), &mpopi, &cfg);

    let variants = variant_lines(&out);
    assert_eq!(variants.len(), 2);
    for line in &variants {
        let fields: Vec<&str> = line.split('\t').collect();
        assert_eq!(fields[8], "GT:DP:AD:GL");
        assert!(fields[9].starts_with("0/1:20:"));
    }
}

#[test]
fn hapgraph_output_wraps_locus_subgraph() {
    let mut cfg = config();
    cfg.write_hapgraphs = true;
    let mpopi = one_sample();
    let mut reads: Vec<(&str, usize)> = vec![("ACAAAC", 0); 10];
    reads.extend(vec![("AGAAAT", 0); 10]);
    let out = run_locus(locus(9, &reads), &mpopi, &cfg);

    let graph = out.hapgraph.unwrap();
    assert!(graph.starts_with("subgraph cluster_loc9 {"));
    assert!(graph.trim_end().ends_with('}'));
    assert!(graph.contains("penwidth=10"));
}

#[test]
fn alns_dump_brackets_the_locus() {
    let mut cfg = config();
    cfg.write_alns = true;
    let mpopi = one_sample();
    let out = run_locus(locus(10, &vec![("ACGTACGTAC", 0); 4]), &mpopi, &cfg);

    let alns = out.alns.unwrap();
    assert!(alns.starts_with("BEGIN 10\n"));
    assert!(alns.trim_end().ends_with("END 10"));
    assert!(alns.contains("r0\tsample_1\tACGTACGTAC"));
}
