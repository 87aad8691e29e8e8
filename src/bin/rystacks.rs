use std::collections::BTreeSet;
use std::process::exit;

use anyhow::{bail, Context, Result};
use clap::error::ErrorKind;
use clap::Parser;
use log::{debug, error, info, warn};
use rayon::prelude::*;
use rayon::ThreadPoolBuilder;

use rystacks::cli::Cli;
use rystacks::io::{self, bam::BamLocusReader, fasta::GzFastaWriter, vcf::VcfWriter, TextWriter};
use rystacks::model::Model;
use rystacks::{process_locus, Config, LocusOutput, Workspace};

/// Exit code for command line errors.
const EXIT_BAD_ARGS: i32 = 13;

/// Number of loci handed to the worker pool per parallel round.
const BATCH_SIZE: usize = 500;

fn main() {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) if matches!(e.kind(), ErrorKind::DisplayHelp | ErrorKind::DisplayVersion) => {
            let _ = e.print();
            exit(0);
        }
        Err(e) => {
            let _ = e.print();
            exit(EXIT_BAD_ARGS);
        }
    };

    env_logger::Builder::from_env(
        env_logger::Env::default()
            .default_filter_or(if cli.quiet { "warn" } else { "info" }),
    )
    .init();

    let setup = match setup(&cli) {
        Ok(setup) => setup,
        Err(e) => {
            error!("{e:#}");
            exit(EXIT_BAD_ARGS);
        }
    };

    if let Err(e) = run(&cli, setup) {
        error!("{e:#}");
        exit(1);
    }
}

struct Setup {
    cfg: Config,
    batch_id: u32,
    whitelist: Option<BTreeSet<u32>>,
}

fn setup(cli: &Cli) -> Result<Setup> {
    let model = Model::new(cli.model.model_type(), cli.gt_alpha, cli.var_alpha)?;

    let batch_id = match cli.batch_id {
        Some(id) => id,
        None => {
            let ids = io::find_catalogs(&cli.in_dir)?;
            match ids.len() {
                0 => bail!("unable to find a catalog in '{}'", cli.in_dir.display()),
                1 => ids[0],
                _ => bail!("input directory contains several catalogs, please specify -b"),
            }
        }
    };

    let whitelist = cli
        .whitelist
        .as_deref()
        .map(io::read_whitelist)
        .transpose()?;

    let cfg = Config {
        model,
        km_length: cli.kmer_length,
        min_km_count: cli.min_cov,
        write_haplotypes: !cli.no_haps,
        write_gfa: cli.gfa,
        write_alns: cli.alns,
        write_hapgraphs: cli.hap_graphs,
        vcf_write_depths: cli.depths,
    };

    Ok(Setup {
        cfg,
        batch_id,
        whitelist,
    })
}

fn run(cli: &Cli, setup: Setup) -> Result<()> {
    let Setup {
        cfg,
        batch_id,
        mut whitelist,
    } = setup;

    ThreadPoolBuilder::new()
        .num_threads(cli.threads)
        .build_global()
        .context("failed to initialize the worker pool")?;

    let mut reader = BamLocusReader::open(&io::catalog_path(&cli.in_dir, batch_id))?;
    let mpopi = reader.mpopi().clone();
    info!(
        "Found {} samples and {} catalog loci.",
        mpopi.n_samples(),
        reader.n_loci()
    );

    let config_report = cfg.report(
        &cli.in_dir,
        batch_id,
        whitelist.as_ref().map_or(0, BTreeSet::len),
    );
    for line in config_report.lines() {
        info!("{line}");
    }

    let mut vcf = VcfWriter::create(&io::output_path(&cli.in_dir, batch_id, "vcf"), &mpopi)?;
    let mut fasta = GzFastaWriter::create(&io::output_path(&cli.in_dir, batch_id, "fa.gz"))?;
    let mut models = TextWriter::create(&io::output_path(&cli.in_dir, batch_id, "tsv"))?;
    let mut alns_f = match cfg.write_alns {
        false => None,
        true => {
            let mut w = TextWriter::create(&io::output_path(&cli.in_dir, batch_id, "alns"))?;
            w.write_block(io::ALNS_USAGE_HEADER)?;
            Some(w)
        }
    };
    let mut hapgraphs_f = match cfg.write_hapgraphs {
        false => None,
        true => {
            let mut w =
                TextWriter::create(&io::output_path(&cli.in_dir, batch_id, "hapgraphs.dot"))?;
            w.write_block(io::HAPGRAPHS_PROLOGUE)?;
            Some(w)
        }
    };

    info!("Processing all loci...");
    let mut n_loci = 0usize;
    let mut n_discarded = 0usize;
    let mut n_pe_skipped = 0usize;
    loop {
        // Read the next batch of loci; the whitelist empties as its
        // loci are seen, after which reading stops early.
        let mut batch = Vec::with_capacity(BATCH_SIZE);
        while batch.len() < BATCH_SIZE {
            if whitelist.as_ref().is_some_and(BTreeSet::is_empty) {
                break;
            }
            let Some(loc) = reader.read_one_locus()? else {
                break;
            };
            if let Some(wl) = whitelist.as_mut() {
                if !wl.remove(&loc.id) {
                    continue;
                }
            }
            batch.push(loc);
        }
        if batch.is_empty() {
            break;
        }

        // Workers keep their graph and aligner across loci.
        let outputs: Vec<Result<Option<LocusOutput>>> = batch
            .into_par_iter()
            .map_init(
                || Workspace::new(cfg.km_length),
                |ws, loc| process_locus(loc, &mpopi, &cfg, ws),
            )
            .collect();

        // Drain the results in input order.
        for res in outputs {
            n_loci += 1;
            match res {
                Ok(Some(out)) => {
                    if let Some(reason) = out.pe_skip {
                        n_pe_skipped += 1;
                        debug!("locus {}: paired-end stage skipped: {reason}", out.id);
                    }
                    fasta.write_record(&out.fasta)?;
                    vcf.write_records(&out.vcf)?;
                    models.write_block(&out.models)?;
                    if let (Some(w), Some(block)) = (alns_f.as_mut(), out.alns.as_deref()) {
                        w.write_block(block)?;
                    }
                    if let (Some(w), Some(block)) = (hapgraphs_f.as_mut(), out.hapgraph.as_deref())
                    {
                        w.write_block(block)?;
                    }
                    if let Some(gfa) = out.gfa.as_deref() {
                        let path = cli.in_dir.join(format!("{}.gfa", out.id));
                        std::fs::write(&path, gfa)
                            .with_context(|| format!("failed to write '{}'", path.display()))?;
                    }
                }
                Ok(None) => n_discarded += 1,
                Err(e) => {
                    n_discarded += 1;
                    warn!("skipping locus: {e:#}");
                }
            }
        }
    }

    if reader.n_malformed() > 0 {
        warn!("{} malformed records were skipped.", reader.n_malformed());
    }

    let mut summary = format!(
        "Processed {n_loci} loci; retained {} of them.\n",
        n_loci - n_discarded
    );
    if n_pe_skipped > 0 {
        summary.push_str(&format!(
            "Paired-end contigs were skipped for {n_pe_skipped} loci.\n"
        ));
    }
    for line in summary.lines() {
        info!("{line}");
    }
    io::write_run_log(
        &io::output_path(&cli.in_dir, batch_id, "log"),
        &config_report,
        &summary,
    )?;

    if let Some(mut w) = hapgraphs_f {
        w.write_block("}\n")?;
        w.finish()?;
    }
    if let Some(w) = alns_f {
        w.finish()?;
    }
    models.finish()?;
    vcf.finish()?;
    fasta.finish()?;

    info!("rystacks is done.");
    Ok(())
}
