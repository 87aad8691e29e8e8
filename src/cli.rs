//! # Command line interface for `rystacks`
use std::fmt;
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Parser, ValueEnum};

use crate::model::ModelType;

#[derive(Parser)]
#[command(
    name = "rystacks",
    author,
    version,
    about = "Variant discovery and haplotype phasing over a locus catalog",
    long_about = None
)]
pub struct Cli {
    /// Input directory (must contain a batch_X.catalog.bam file)
    #[arg(short = 'P', long = "in-dir")]
    pub in_dir: PathBuf,

    /// Batch ID (default: guess from the catalog in the input directory)
    #[arg(short = 'b', long = "batch-id")]
    pub batch_id: Option<u32>,

    /// A whitelist of locus IDs, one per line
    #[arg(short = 'W', long)]
    pub whitelist: Option<PathBuf>,

    /// Model to use to call variants and genotypes
    #[arg(long, value_enum, default_value_t = ModelChoice::Snp)]
    pub model: ModelChoice,

    /// Alpha threshold for calling genotypes
    #[arg(long, default_value_t = 0.05)]
    pub gt_alpha: f64,

    /// Alpha threshold for discovering variants
    #[arg(long, default_value_t = 0.05)]
    pub var_alpha: f64,

    /// Kmer length for paired-end contig assembly
    #[arg(long, default_value_t = 31, value_parser = kmer_length_in_range)]
    pub kmer_length: usize,

    /// Minimum coverage to consider a kmer
    #[arg(long = "min-cov", default_value_t = 2)]
    pub min_cov: usize,

    /// Disable phasing
    #[arg(long)]
    pub no_haps: bool,

    /// Output a GFA file for each locus
    #[arg(long)]
    pub gfa: bool,

    /// Output a file showing the contigs and read alignments
    #[arg(long)]
    pub alns: bool,

    /// Output a dot graph file showing phasing information
    #[arg(long = "hap-graphs")]
    pub hap_graphs: bool,

    /// Write detailed depth data in the output VCF
    #[arg(long)]
    pub depths: bool,

    /// Suppress console output
    #[arg(short, long)]
    pub quiet: bool,

    /// Number of worker threads to use
    #[arg(short = 't', long, default_value_t = 1, value_parser = threads_in_range)]
    pub threads: usize,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
pub enum ModelChoice {
    Snp,
    Marukihigh,
    Marukilow,
}

impl ModelChoice {
    pub fn model_type(self) -> ModelType {
        match self {
            ModelChoice::Snp => ModelType::Snp,
            ModelChoice::Marukihigh => ModelType::MarukiHigh,
            ModelChoice::Marukilow => ModelType::MarukiLow,
        }
    }
}

impl fmt::Display for ModelChoice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.model_type())
    }
}

fn threads_in_range(s: &str) -> Result<usize> {
    let threads = s
        .parse()
        .context("Could not parse value passed to --threads to integer")?;
    if threads < 1 {
        bail!("--threads must be at least 1");
    }
    Ok(threads)
}

fn kmer_length_in_range(s: &str) -> Result<usize> {
    let km_length: usize = s
        .parse()
        .context("Could not parse value passed to --kmer-length to integer")?;
    if !(2..=crate::debruijn::MAX_KMER_LENGTH).contains(&km_length) {
        bail!(
            "--kmer-length must be between 2 and {}",
            crate::debruijn::MAX_KMER_LENGTH
        );
    }
    Ok(km_length)
}
