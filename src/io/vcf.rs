//! # VCF output
//!
//! Streaming text writer for the per-site variant calls. Loci use their
//! numeric id as the chromosome name, so records are written with an
//! explicit header describing only the INFO/FORMAT fields; workers
//! format their own records and the writer serialises them to disk.
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use anyhow::{Context, Result};

use crate::metapop::MetaPopInfo;

/// The VCF info lines included in the header.
const VCF_INFO_LINES: &[&str] = &[
    r#"##INFO=<ID=DP,Number=1,Type=Integer,Description="Total Depth">"#,
    r#"##INFO=<ID=AD,Number=R,Type=Integer,Description="Total Depth for Each Allele">"#,
    r#"##INFO=<ID=AF,Number=A,Type=Float,Description="Allele Frequency">"#,
    r#"##INFO=<ID=cnts,Number=4,Type=Integer,Description="Total Depths for A,C,G,T">"#,
];

/// The VCF format lines included in the header.
const VCF_FORMAT_LINES: &[&str] = &[
    r#"##FORMAT=<ID=GT,Number=1,Type=String,Description="Genotype">"#,
    r#"##FORMAT=<ID=PS,Number=1,Type=Integer,Description="Phase Set">"#,
    r#"##FORMAT=<ID=DP,Number=1,Type=Integer,Description="Read Depth">"#,
    r#"##FORMAT=<ID=AD,Number=R,Type=Integer,Description="Read Depth for Each Allele">"#,
    r#"##FORMAT=<ID=GL,Number=G,Type=Float,Description="Genotype Likelihood">"#,
    r#"##FORMAT=<ID=cnts,Number=4,Type=Integer,Description="Read Depths for A,C,G,T">"#,
];

pub struct VcfWriter {
    writer: BufWriter<File>,
}

impl VcfWriter {
    pub fn create(path: &Path, mpopi: &MetaPopInfo) -> Result<VcfWriter> {
        let file = File::create(path)
            .with_context(|| format!("failed to create '{}'", path.display()))?;
        let mut writer = BufWriter::new(file);

        writeln!(writer, "##fileformat=VCFv4.2")?;
        writeln!(writer, "##source=rystacks {}", env!("CARGO_PKG_VERSION"))?;
        for line in VCF_INFO_LINES {
            writeln!(writer, "{line}")?;
        }
        for line in VCF_FORMAT_LINES {
            writeln!(writer, "{line}")?;
        }
        write!(writer, "#CHROM\tPOS\tID\tREF\tALT\tQUAL\tFILTER\tINFO\tFORMAT")?;
        for sample in mpopi.samples() {
            write!(writer, "\t{}", sample.name)?;
        }
        writeln!(writer)?;

        Ok(VcfWriter { writer })
    }

    /// Append pre-formatted records (one or more full lines).
    pub fn write_records(&mut self, records: &str) -> Result<()> {
        self.writer
            .write_all(records.as_bytes())
            .context("failed to write VCF records")
    }

    pub fn finish(mut self) -> Result<()> {
        self.writer.flush().context("failed to flush VCF output")
    }
}
