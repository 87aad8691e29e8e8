//! # Input and output plumbing
//!
//! Catalog discovery, the locus whitelist, and the run's output files.
//! Workers format per-locus output themselves; the writers here own the
//! file handles and are only touched from the single writer loop.
use std::collections::BTreeSet;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};

pub mod bam;
pub mod fasta;
pub mod vcf;

/// Batch ids of the `batch_<id>.catalog.bam` files present in `dir`.
pub fn find_catalogs(dir: &Path) -> Result<Vec<u32>> {
    let mut ids = Vec::new();
    let entries = fs::read_dir(dir)
        .with_context(|| format!("failed to read input directory '{}'", dir.display()))?;
    for entry in entries {
        let entry = entry?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        if let Some(id) = name
            .strip_prefix("batch_")
            .and_then(|rest| rest.strip_suffix(".catalog.bam"))
            .and_then(|id| id.parse::<u32>().ok())
        {
            ids.push(id);
        }
    }
    ids.sort_unstable();
    Ok(ids)
}

pub fn catalog_path(dir: &Path, batch_id: u32) -> PathBuf {
    dir.join(format!("batch_{batch_id}.catalog.bam"))
}

/// Path of one of the run's outputs, e.g. `batch_1.rystacks.vcf`.
pub fn output_path(dir: &Path, batch_id: u32, suffix: &str) -> PathBuf {
    dir.join(format!("batch_{batch_id}.rystacks.{suffix}"))
}

/// Read a whitelist of numeric locus ids, one per line. Blank lines are
/// ignored; an effectively empty whitelist is an error.
pub fn read_whitelist(path: &Path) -> Result<BTreeSet<u32>> {
    let text = fs::read_to_string(path)
        .with_context(|| format!("failed to open whitelist '{}'", path.display()))?;
    let mut wl = BTreeSet::new();
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let id = line
            .parse::<u32>()
            .with_context(|| format!("bad locus id '{line}' in whitelist"))?;
        wl.insert(id);
    }
    if wl.is_empty() {
        bail!("whitelist '{}' appears empty", path.display());
    }
    Ok(wl)
}

/// A plain text output file fed with pre-formatted blocks (the models
/// TSV, the alignment dump, the haplotype graphs).
pub struct TextWriter {
    writer: BufWriter<File>,
}

impl TextWriter {
    pub fn create(path: &Path) -> Result<TextWriter> {
        let file = File::create(path)
            .with_context(|| format!("failed to create '{}'", path.display()))?;
        Ok(TextWriter {
            writer: BufWriter::new(file),
        })
    }

    pub fn write_block(&mut self, block: &str) -> Result<()> {
        self.writer
            .write_all(block.as_bytes())
            .context("failed to write output block")
    }

    pub fn finish(mut self) -> Result<()> {
        self.writer.flush().context("failed to flush output")
    }
}

/// Header of the alignment dump, showing how to extract observed read
/// haplotypes from it.
pub const ALNS_USAGE_HEADER: &str = "\
# This prints observed read haplotypes:
# loc=39
# sample=BT_2827.13
# cols=$(grep -E \"^$loc\\b\" batch_1.rystacks.vcf | awk '$5!=\".\"' | cut -f2 | paste -sd ',') # (SNPs.)
# sed -n \"/^BEGIN $loc\\b/,/^END $loc\\b/ p\" batch_1.rystacks.alns | grep \"$sample\" | cut -f3 | cut -c$cols | sort | uniq -c | sort -nr
";

/// Prologue of the haplotype-graph DOT file; closed with a single `}`.
pub const HAPGRAPHS_PROLOGUE: &str = "\
# dot -Tpdf -O batch_1.rystacks.hapgraphs.dot
# loc=371
# { g=batch_1.rystacks.hapgraphs.dot; sed -n '0,/^subgraph/p' $g | head -n-1; sed -n \"/^subgraph cluster_loc$loc\\b/,/^}/p\" $g; echo \\}; } | dot -Tpdf -o haps.$loc.pdf
graph {
edge[color=\"grey60\",fontsize=12,labeljust=\"l\"];
";

/// Write the run log: configuration, then the end-of-run summary.
pub fn write_run_log(path: &Path, config_report: &str, summary: &str) -> Result<()> {
    let mut log = TextWriter::create(path)?;
    log.write_block(config_report)?;
    log.write_block("\n")?;
    log.write_block(summary)?;
    log.finish()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn catalog_names_round_trip() {
        let dir = Path::new("/tmp/run");
        assert_eq!(
            catalog_path(dir, 7),
            PathBuf::from("/tmp/run/batch_7.catalog.bam")
        );
        assert_eq!(
            output_path(dir, 7, "fa.gz"),
            PathBuf::from("/tmp/run/batch_7.rystacks.fa.gz")
        );
    }
}
