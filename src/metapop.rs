//! # Metapopulation information
//!
//! The samples taking part in a run, parsed from the read groups of the
//! catalog BAM header. Immutable after load; every read in the pipeline
//! carries an index into this table.
use std::collections::HashMap;

use anyhow::{Context, Result};

#[derive(Clone, Debug)]
pub struct Sample {
    pub name: String,
    /// Numeric sample id carried in the read group.
    pub id: usize,
}

#[derive(Clone, Debug, Default)]
pub struct MetaPopInfo {
    samples: Vec<Sample>,
    indexes: HashMap<String, usize>,
}

impl MetaPopInfo {
    /// Build from (numeric id, name) pairs. Samples are ordered by name
    /// so indexes are stable regardless of read-group order.
    pub fn from_rgs(mut rgs: Vec<(usize, String)>) -> MetaPopInfo {
        rgs.sort_by(|a, b| a.1.cmp(&b.1));
        rgs.dedup_by(|a, b| a.1 == b.1);
        let mut mpopi = MetaPopInfo::default();
        for (id, name) in rgs {
            mpopi.indexes.insert(name.clone(), mpopi.samples.len());
            mpopi.samples.push(Sample { name, id });
        }
        mpopi
    }

    pub fn samples(&self) -> &[Sample] {
        &self.samples
    }

    pub fn n_samples(&self) -> usize {
        self.samples.len()
    }

    pub fn sample_index(&self, name: &str) -> Result<usize> {
        self.indexes
            .get(name)
            .copied()
            .with_context(|| format!("unknown sample '{name}'"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn samples_are_sorted_by_name() {
        let mpopi = MetaPopInfo::from_rgs(vec![
            (3, "s_c".to_string()),
            (1, "s_a".to_string()),
            (2, "s_b".to_string()),
        ]);
        let names: Vec<&str> = mpopi.samples().iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["s_a", "s_b", "s_c"]);
        assert_eq!(mpopi.sample_index("s_b").unwrap(), 1);
        assert!(mpopi.sample_index("nope").is_err());
    }
}
