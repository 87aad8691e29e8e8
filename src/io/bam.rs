//! # Catalog BAM reader
//!
//! Reads the `batch_<id>.catalog.bam` produced by the cataloging step.
//! Each target in the header is one locus; every record carries the
//! sample name in its `RG` read group, and second mates are flagged with
//! the paired/read2 flag bits. Records are grouped per target into
//! [`LocReadSet`]s.
use std::collections::HashMap;
use std::path::Path;

use anyhow::{bail, Context, Result};
use log::warn;
use rust_htslib::bam::{self, record::Aux, Read as BamRead};

use crate::cigar::{Cigar, Op};
use crate::locus::{LocReadSet, Read};
use crate::metapop::MetaPopInfo;
use crate::seq::DNASeq4;

pub struct BamLocusReader {
    reader: bam::Reader,
    mpopi: MetaPopInfo,
    rg_to_sample: HashMap<String, usize>,
    /// Locus id of each target, in tid order.
    locus_ids: Vec<u32>,
    pending: Option<(usize, Read, bool)>,
    eof: bool,
    n_malformed: usize,
}

impl BamLocusReader {
    pub fn open(path: &Path) -> Result<BamLocusReader> {
        let reader = bam::Reader::from_path(path)
            .with_context(|| format!("failed to open catalog '{}'", path.display()))?;

        let names: Vec<String> = reader
            .header()
            .target_names()
            .iter()
            .map(|n| String::from_utf8_lossy(n).into_owned())
            .collect();
        let name_refs: Vec<&str> = names.iter().map(String::as_str).collect();
        let locus_ids = locus_ids_from_names(&name_refs)?;

        let (mpopi, rg_to_sample) = parse_read_groups(&reader)?;
        if mpopi.n_samples() == 0 {
            bail!(
                "catalog '{}' does not declare any read groups",
                path.display()
            );
        }

        Ok(BamLocusReader {
            reader,
            mpopi,
            rg_to_sample,
            locus_ids,
            pending: None,
            eof: false,
            n_malformed: 0,
        })
    }

    pub fn mpopi(&self) -> &MetaPopInfo {
        &self.mpopi
    }

    pub fn n_loci(&self) -> usize {
        self.locus_ids.len()
    }

    /// Records skipped because they could not be interpreted.
    pub fn n_malformed(&self) -> usize {
        self.n_malformed
    }

    /// Read all records of the next locus. Returns `None` at the end of
    /// the catalog.
    pub fn read_one_locus(&mut self) -> Result<Option<LocReadSet>> {
        let (tid, read, is_pe) = match self.pending.take() {
            Some(first) => first,
            None => match self.next_usable_record()? {
                Some(first) => first,
                None => return Ok(None),
            },
        };

        let mut loc = LocReadSet::new(self.locus_ids[tid]);
        push_read(&mut loc, read, is_pe);
        while let Some((next_tid, read, is_pe)) = self.next_usable_record()? {
            if next_tid != tid {
                self.pending = Some((next_tid, read, is_pe));
                break;
            }
            push_read(&mut loc, read, is_pe);
        }
        Ok(Some(loc))
    }

    /// The next record that parses cleanly, as (tid, read, is_pe).
    /// Malformed records are logged and skipped.
    fn next_usable_record(&mut self) -> Result<Option<(usize, Read, bool)>> {
        if self.eof {
            return Ok(None);
        }
        let mut record = bam::Record::new();
        loop {
            match self.reader.read(&mut record) {
                None => {
                    self.eof = true;
                    return Ok(None);
                }
                Some(Err(e)) => return Err(e).context("failed to read catalog record"),
                Some(Ok(())) => {}
            }
            match self.parse_record(&record) {
                Ok(Some(parsed)) => return Ok(Some(parsed)),
                Ok(None) => {}
                Err(e) => {
                    self.n_malformed += 1;
                    warn!(
                        "skipping record '{}': {e:#}",
                        String::from_utf8_lossy(record.qname())
                    );
                }
            }
        }
    }

    /// Interpret one BAM record. `Ok(None)` marks records we silently
    /// ignore (secondary/supplementary alignments).
    fn parse_record(&self, record: &bam::Record) -> Result<Option<(usize, Read, bool)>> {
        if record.is_secondary() || record.is_supplementary() {
            return Ok(None);
        }
        let tid = record.tid();
        if tid < 0 || tid as usize >= self.locus_ids.len() {
            bail!("record is not assigned to a locus");
        }

        let rg = match record.aux(b"RG") {
            Ok(Aux::String(rg)) => rg.to_string(),
            Ok(_) => bail!("RG aux field is not a string"),
            Err(_) => bail!("record has no RG aux field"),
        };
        let sample = *self
            .rg_to_sample
            .get(&rg)
            .with_context(|| format!("unknown read group '{rg}'"))?;

        let name = String::from_utf8_lossy(record.qname()).into_owned();
        let mut seq = DNASeq4::from_bam(record.seq().encoded, record.seq_len());

        // Project the record into its reference frame. On the minus
        // strand the stored sequence is reverse complemented and the
        // CIGAR reads backwards.
        let mut cigar = htslib_cigar(record)?;
        if record.is_reverse() {
            seq = seq.rev_compl();
            cigar.reverse();
        }
        if cigar
            .ops()
            .iter()
            .any(|&(op, _)| matches!(op, Op::Ins | Op::Del | Op::SoftClip))
        {
            cigar.edit_gaps(&mut seq);
        }

        let is_pe = record.is_paired() && record.is_last_in_template();
        Ok(Some((tid as usize, Read::new(name, seq, sample), is_pe)))
    }
}

fn push_read(loc: &mut LocReadSet, read: Read, is_pe: bool) {
    if is_pe {
        loc.pe_reads.push(read);
    } else {
        loc.fw_reads.push(read);
    }
}

/// Catalog targets are named by their numeric locus id.
fn locus_ids_from_names(names: &[&str]) -> Result<Vec<u32>> {
    names
        .iter()
        .map(|name| {
            name.parse::<u32>()
                .with_context(|| format!("catalog target '{name}' is not a numeric locus id"))
        })
        .collect()
}

/// Build the metapopulation from the `@RG` header lines (`ID` numeric
/// sample id, `SM` sample name) and map read-group ids to sample
/// indexes.
fn parse_read_groups(reader: &bam::Reader) -> Result<(MetaPopInfo, HashMap<String, usize>)> {
    let header = bam::Header::from_template(reader.header());
    let mut rgs: Vec<(String, usize, String)> = Vec::new();
    if let Some(records) = header.to_hashmap().get("RG") {
        for rg in records {
            let rg_id = rg
                .get("ID")
                .context("@RG line without an ID field")?
                .clone();
            let numeric_id = rg_id.parse::<usize>().unwrap_or(rgs.len());
            let name = rg.get("SM").cloned().unwrap_or_else(|| rg_id.clone());
            rgs.push((rg_id, numeric_id, name));
        }
    }

    let mpopi = MetaPopInfo::from_rgs(
        rgs.iter()
            .map(|(_, id, name)| (*id, name.clone()))
            .collect(),
    );
    let mut rg_to_sample = HashMap::new();
    for (rg_id, _, name) in rgs {
        let index = mpopi.sample_index(&name)?;
        rg_to_sample.insert(rg_id, index);
    }
    Ok((mpopi, rg_to_sample))
}

fn htslib_cigar(record: &bam::Record) -> Result<Cigar> {
    use rust_htslib::bam::record::Cigar as HtsCigar;
    let mut cigar = Cigar::new();
    for op in record.cigar().iter() {
        let (op, len) = match *op {
            HtsCigar::Match(l) => (Op::Match, l),
            HtsCigar::Ins(l) => (Op::Ins, l),
            HtsCigar::Del(l) => (Op::Del, l),
            HtsCigar::SoftClip(l) => (Op::SoftClip, l),
            HtsCigar::RefSkip(l) => (Op::RefSkip, l),
            HtsCigar::HardClip(l) => (Op::HardClip, l),
            HtsCigar::Pad(l) => (Op::Pad, l),
            HtsCigar::Equal(l) => (Op::Equal, l),
            HtsCigar::Diff(l) => (Op::Diff, l),
        };
        cigar.push(op, len as usize);
    }
    Ok(cigar)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn locus_ids_parse_numeric_targets() {
        let ids = locus_ids_from_names(&["1", "2", "57"]).unwrap();
        assert_eq!(ids, vec![1, 2, 57]);
    }

    #[test]
    fn locus_ids_reject_non_numeric_targets() {
        assert!(locus_ids_from_names(&["1", "chr2"]).is_err());
    }
}
