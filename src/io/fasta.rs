//! # Gzipped FASTA output
//!
//! One consensus record per locus, written through a gzip encoder.
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use anyhow::{Context, Result};
use flate2::write::GzEncoder;
use flate2::Compression;

pub struct GzFastaWriter {
    encoder: GzEncoder<BufWriter<File>>,
}

impl GzFastaWriter {
    pub fn create(path: &Path) -> Result<GzFastaWriter> {
        let file = File::create(path)
            .with_context(|| format!("failed to create '{}'", path.display()))?;
        Ok(GzFastaWriter {
            encoder: GzEncoder::new(BufWriter::new(file), Compression::default()),
        })
    }

    /// Append a pre-formatted record (`>header\nsequence\n`).
    pub fn write_record(&mut self, record: &str) -> Result<()> {
        self.encoder
            .write_all(record.as_bytes())
            .context("failed to write FASTA record")
    }

    /// Flush the gzip stream; dropping without finishing would truncate
    /// the output.
    pub fn finish(self) -> Result<()> {
        self.encoder
            .finish()
            .context("failed to finalize gzip FASTA output")?
            .flush()
            .context("failed to flush FASTA output")
    }
}
