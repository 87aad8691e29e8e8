//! # Per-site genotype models
//!
//! Three likelihood models behind a single `call` entry point: the
//! classic multinomial likelihood-ratio caller and the two
//! genotype-frequency estimators of Maruki & Lynch (low and high
//! coverage). A call classifies every sample at one alignment column as
//! homozygous, heterozygous or unknown and records the full genotype
//! log-likelihood vector used for VCF `GL` output.
use std::fmt;

use anyhow::{bail, Result};

use crate::locus::SiteCounts;
use crate::seq::{Counts, Nt2};

/// Fixed per-read sequencing-error frequency assumed by the multinomial
/// model's likelihood vectors.
pub const SEQ_ERR_FREQ: f64 = 0.01;

/// Chi-square critical values (one degree of freedom) for the supported
/// significance levels.
fn chisq_crit(alpha: f64) -> Result<f64> {
    Ok(match alpha {
        a if (a - 0.1).abs() < 1e-12 => 2.706,
        a if (a - 0.05).abs() < 1e-12 => 3.841,
        a if (a - 0.01).abs() < 1e-12 => 6.635,
        a if (a - 0.001).abs() < 1e-12 => 10.828,
        _ => bail!("alpha must be one of 0.1, 0.05, 0.01, 0.001 (got {alpha})"),
    })
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum SnpCall {
    Hom,
    Het,
    Unk,
}

/// Ln-likelihoods of the ten diploid genotypes, stored in VCF genotype
/// order over A, C, G, T.
#[derive(Clone, Debug)]
pub struct GtLiks([f64; 10]);

impl Default for GtLiks {
    fn default() -> GtLiks {
        GtLiks([f64::NEG_INFINITY; 10])
    }
}

impl GtLiks {
    fn index(a: Nt2, b: Nt2) -> usize {
        let (i, j) = if a.index() <= b.index() {
            (a.index(), b.index())
        } else {
            (b.index(), a.index())
        };
        j * (j + 1) / 2 + i
    }

    pub fn at(&self, a: Nt2, b: Nt2) -> f64 {
        self.0[Self::index(a, b)]
    }

    pub fn set(&mut self, a: Nt2, b: Nt2, lnl: f64) {
        self.0[Self::index(a, b)] = lnl;
    }
}

/// Multinomial ln-likelihood of every diploid genotype given the
/// nucleotide counts of one sample and a per-read error frequency.
fn gt_lnls(counts: &Counts, err: f64) -> GtLiks {
    let mut liks = GtLiks::default();
    for a in Nt2::ALL {
        for b in Nt2::ALL {
            if b.index() < a.index() {
                continue;
            }
            let mut lnl = 0.0;
            for nt in Nt2::ALL {
                let n = counts.get(nt);
                if n == 0 {
                    continue;
                }
                let p = if a == b {
                    if nt == a {
                        1.0 - err
                    } else {
                        err / 3.0
                    }
                } else if nt == a || nt == b {
                    0.5 - err / 3.0
                } else {
                    err / 3.0
                };
                lnl += n as f64 * p.ln();
            }
            liks.set(a, b, lnl);
        }
    }
    liks
}

/// One sample's genotype at one column.
#[derive(Clone, Debug)]
pub struct SampleCall {
    call: SnpCall,
    nts: Option<(Nt2, Nt2)>,
    lnls: GtLiks,
}

impl SampleCall {
    fn none() -> SampleCall {
        SampleCall {
            call: SnpCall::Unk,
            nts: None,
            lnls: GtLiks::default(),
        }
    }

    fn hom(nt: Nt2, lnls: GtLiks) -> SampleCall {
        SampleCall {
            call: SnpCall::Hom,
            nts: Some((nt, nt)),
            lnls,
        }
    }

    fn het(nt0: Nt2, nt1: Nt2, lnls: GtLiks) -> SampleCall {
        assert!(nt0 != nt1);
        SampleCall {
            call: SnpCall::Het,
            nts: Some((nt0, nt1)),
            lnls,
        }
    }

    fn unk(lnls: GtLiks) -> SampleCall {
        SampleCall {
            call: SnpCall::Unk,
            nts: None,
            lnls,
        }
    }

    pub fn call(&self) -> SnpCall {
        self.call
    }

    /// The called alleles; `hom` implies both equal, `het` both
    /// distinct.
    pub fn nts(&self) -> Option<(Nt2, Nt2)> {
        self.nts
    }

    pub fn lnls(&self) -> &GtLiks {
        &self.lnls
    }

    /// Reset to an unknown call, dropping the allele pair.
    pub fn blank(&mut self) {
        self.call = SnpCall::Unk;
        self.nts = None;
    }
}

/// The outcome of calling one alignment column.
#[derive(Clone, Debug, Default)]
pub struct SiteCall {
    /// Observed alleles with their frequencies, sorted by decreasing
    /// frequency (ties towards the smaller nucleotide). Frequencies sum
    /// to one whenever the vector is non-empty.
    alleles: Vec<(Nt2, f64)>,
    sample_calls: Vec<SampleCall>,
}

impl SiteCall {
    /// Derive the site alleles from the individual sample calls: a
    /// homozygote contributes its allele twice, a heterozygote each of
    /// its alleles once.
    fn from_sample_calls(sample_calls: Vec<SampleCall>) -> SiteCall {
        let mut counts = Counts::new();
        for c in &sample_calls {
            match (c.call, c.nts) {
                (SnpCall::Hom, Some((nt, _))) => {
                    counts.add(nt);
                    counts.add(nt);
                }
                (SnpCall::Het, Some((nt0, nt1))) => {
                    counts.add(nt0);
                    counts.add(nt1);
                }
                _ => {}
            }
        }
        let total = counts.sum();
        let mut alleles = Vec::new();
        if total > 0 {
            for (n, nt) in counts.sorted() {
                if n > 0 {
                    alleles.push((nt, n as f64 / total as f64));
                }
            }
        }
        SiteCall {
            alleles,
            sample_calls,
        }
    }

    pub fn alleles(&self) -> &[(Nt2, f64)] {
        &self.alleles
    }

    pub fn sample_calls(&self) -> &[SampleCall] {
        &self.sample_calls
    }

    pub fn most_frequent_allele(&self) -> Option<Nt2> {
        self.alleles.first().map(|&(nt, _)| nt)
    }

    pub fn freq(&self, nt: Nt2) -> Option<f64> {
        self.alleles
            .iter()
            .find(|&&(a, _)| a == nt)
            .map(|&(_, f)| f)
    }

    pub fn is_variant(&self) -> bool {
        self.alleles.len() > 1
    }

    /// Blank one sample's call and recompute the allele frequencies
    /// from the remaining samples.
    pub fn discard_sample(&mut self, sample: usize) {
        self.sample_calls[sample].blank();
        let calls = std::mem::take(&mut self.sample_calls);
        *self = SiteCall::from_sample_calls(calls);
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ModelType {
    Snp,
    MarukiHigh,
    MarukiLow,
}

impl fmt::Display for ModelType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ModelType::Snp => "snp",
            ModelType::MarukiHigh => "marukihigh",
            ModelType::MarukiLow => "marukilow",
        };
        write!(f, "{name}")
    }
}

/// A configured genotype model. Construction validates the alpha
/// thresholds; `call` dispatches on the model type.
#[derive(Clone, Debug)]
pub struct Model {
    model_type: ModelType,
    gt_alpha: f64,
    var_alpha: f64,
    gt_crit: f64,
    var_crit: f64,
}

impl Model {
    pub fn new(model_type: ModelType, gt_alpha: f64, var_alpha: f64) -> Result<Model> {
        Ok(Model {
            model_type,
            gt_alpha,
            var_alpha,
            gt_crit: chisq_crit(gt_alpha)?,
            var_crit: chisq_crit(var_alpha)?,
        })
    }

    pub fn model_type(&self) -> ModelType {
        self.model_type
    }

    pub fn call(&self, depths: &SiteCounts) -> SiteCall {
        match self.model_type {
            ModelType::Snp => self.call_multinomial(depths),
            ModelType::MarukiHigh => self.call_maruki(depths, true),
            ModelType::MarukiLow => self.call_maruki(depths, false),
        }
    }

    fn call_multinomial(&self, depths: &SiteCounts) -> SiteCall {
        let sample_calls = depths
            .samples
            .iter()
            .map(|counts| self.multinomial_sample_call(counts))
            .collect();
        SiteCall::from_sample_calls(sample_calls)
    }

    fn multinomial_sample_call(&self, counts: &Counts) -> SampleCall {
        let dp = counts.sum();
        if dp == 0 {
            return SampleCall::none();
        }
        let ranked = counts.sorted();
        let (n1, nt1) = ranked[0];
        let (n2, nt2) = ranked[1];
        let (n3, _) = ranked[2];
        let (n4, _) = ranked[3];
        let dp_f = dp as f64;

        let mut l_ratio = n1 as f64 * (n1 as f64 / dp_f).ln();
        if dp > n1 {
            l_ratio += (dp - n1) as f64 * ((dp - n1) as f64 / (3.0 * dp_f)).ln();
        }
        if n1 + n2 > 0 {
            l_ratio -= (n1 + n2) as f64 * ((n1 + n2) as f64 / (2.0 * dp_f)).ln();
        }
        if n3 + n4 > 0 {
            l_ratio -= (n3 + n4) as f64 * ((n3 + n4) as f64 / (2.0 * dp_f)).ln();
        }
        l_ratio *= 2.0;

        let lnls = gt_lnls(counts, SEQ_ERR_FREQ);
        if l_ratio >= self.gt_crit {
            SampleCall::hom(nt1, lnls)
        } else if l_ratio <= -self.gt_crit {
            SampleCall::het(nt1, nt2, lnls)
        } else {
            SampleCall::unk(lnls)
        }
    }

    /// The Maruki & Lynch genotype-frequency estimators. Both estimate
    /// the sequencing-error rate and candidate alleles site-wide from
    /// the pooled counts, test the site for polymorphism at `var_alpha`,
    /// and genotype each sample at `gt_alpha`; the high-coverage variant
    /// weights genotypes by a Hardy-Weinberg prior at the estimated
    /// major-allele frequency, the low-coverage variant refines that
    /// frequency by expectation-maximisation over the genotype
    /// posteriors first.
    fn call_maruki(&self, depths: &SiteCounts, high: bool) -> SiteCall {
        let dp_tot = depths.tot.sum();
        if dp_tot == 0 {
            let sample_calls = depths.samples.iter().map(|_| SampleCall::none()).collect();
            return SiteCall::from_sample_calls(sample_calls);
        }

        let ranked = depths.tot.sorted();
        let (n1, major) = ranked[0];
        let (n2, minor) = ranked[1];
        let err = site_err_rate(dp_tot, n1, n2);

        let lnls: Vec<Option<GtLiks>> = depths
            .samples
            .iter()
            .map(|c| {
                if c.sum() > 0 {
                    Some(gt_lnls(c, err))
                } else {
                    None
                }
            })
            .collect();

        if n2 == 0 {
            return self.maruki_monomorphic(depths, major, lnls);
        }

        // Major-allele frequency: read-count estimate, refined by EM
        // over the genotype posteriors for the low-coverage model.
        let mut p = n1 as f64 / (n1 + n2) as f64;
        if !high {
            p = em_allele_freq(p, &lnls, major, minor);
        }
        p = p.clamp(1e-9, 1.0 - 1e-9);

        // Is the site polymorphic? Likelihood-ratio of the mixture at
        // the estimated frequency against a fixed major allele.
        let mut lnl_poly = 0.0;
        let mut lnl_mono = 0.0;
        for liks in lnls.iter().flatten() {
            let weighted = [
                2.0 * p.ln() + liks.at(major, major),
                (2.0 * p * (1.0 - p)).ln() + liks.at(major, minor),
                2.0 * (1.0 - p).ln() + liks.at(minor, minor),
            ];
            lnl_poly += ln_sum_exp(&weighted);
            lnl_mono += liks.at(major, major);
        }
        if 2.0 * (lnl_poly - lnl_mono) < self.var_crit {
            return self.maruki_monomorphic(depths, major, lnls);
        }

        let sample_calls = lnls
            .into_iter()
            .map(|liks| match liks {
                None => SampleCall::none(),
                Some(liks) => {
                    let mut scored = [
                        (2.0 * p.ln() + liks.at(major, major), SnpCall::Hom, major, major),
                        (
                            (2.0 * p * (1.0 - p)).ln() + liks.at(major, minor),
                            SnpCall::Het,
                            major,
                            minor,
                        ),
                        (
                            2.0 * (1.0 - p).ln() + liks.at(minor, minor),
                            SnpCall::Hom,
                            minor,
                            minor,
                        ),
                    ];
                    scored.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap());
                    if 2.0 * (scored[0].0 - scored[1].0) < self.gt_crit {
                        SampleCall::unk(liks)
                    } else {
                        match scored[0].1 {
                            SnpCall::Hom => SampleCall::hom(scored[0].2, liks),
                            _ => SampleCall::het(scored[0].2, scored[0].3, liks),
                        }
                    }
                }
            })
            .collect();
        SiteCall::from_sample_calls(sample_calls)
    }

    /// The fixed-site outcome of the Maruki models: samples whose reads
    /// back the site's major allele are homozygous for it once their own
    /// evidence is significant, everything else stays unknown.
    fn maruki_monomorphic(
        &self,
        depths: &SiteCounts,
        major: Nt2,
        lnls: Vec<Option<GtLiks>>,
    ) -> SiteCall {
        let sample_calls = depths
            .samples
            .iter()
            .zip(lnls)
            .map(|(counts, liks)| {
                let Some(liks) = liks else {
                    return SampleCall::none();
                };
                let ranked = counts.sorted();
                if ranked[0].1 != major {
                    return SampleCall::unk(liks);
                }
                // Hom against the best het involving the major allele.
                let best_het = Nt2::ALL
                    .into_iter()
                    .filter(|&nt| nt != major)
                    .map(|nt| liks.at(major, nt))
                    .fold(f64::NEG_INFINITY, f64::max);
                if 2.0 * (liks.at(major, major) - best_het) >= self.gt_crit {
                    SampleCall::hom(major, liks)
                } else {
                    SampleCall::unk(liks)
                }
            })
            .collect();
        SiteCall::from_sample_calls(sample_calls)
    }
}

impl fmt::Display for Model {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.model_type {
            ModelType::Snp => write!(f, "snp (gt_alpha: {})", self.gt_alpha),
            _ => write!(
                f,
                "{} (gt_alpha: {}, var_alpha: {})",
                self.model_type, self.gt_alpha, self.var_alpha
            ),
        }
    }
}

/// Site-wide error-rate estimate: reads matching neither candidate
/// allele represent two of the three possible error classes.
fn site_err_rate(dp_tot: usize, n1: usize, n2: usize) -> f64 {
    let others = dp_tot - n1 - n2;
    (1.5 * others as f64 / dp_tot as f64).clamp(1e-9, 1.0 / 3.0)
}

fn ln_sum_exp(values: &[f64]) -> f64 {
    let max = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    if !max.is_finite() {
        return max;
    }
    max + values.iter().map(|v| (v - max).exp()).sum::<f64>().ln()
}

/// Expectation-maximisation of the major-allele frequency under
/// Hardy-Weinberg genotype priors.
fn em_allele_freq(mut p: f64, lnls: &[Option<GtLiks>], major: Nt2, minor: Nt2) -> f64 {
    for _ in 0..100 {
        let mut exp_major = 0.0;
        let mut n_data = 0usize;
        let q = (1.0 - p).clamp(1e-9, 1.0);
        let pc = p.clamp(1e-9, 1.0);
        for liks in lnls.iter().flatten() {
            let weighted = [
                2.0 * pc.ln() + liks.at(major, major),
                (2.0 * pc * q).ln() + liks.at(major, minor),
                2.0 * q.ln() + liks.at(minor, minor),
            ];
            let norm = ln_sum_exp(&weighted);
            let post_mm = (weighted[0] - norm).exp();
            let post_mn = (weighted[1] - norm).exp();
            exp_major += 2.0 * post_mm + post_mn;
            n_data += 1;
        }
        if n_data == 0 {
            return p;
        }
        let p_new = exp_major / (2.0 * n_data as f64);
        if (p_new - p).abs() < 1e-6 {
            return p_new;
        }
        p = p_new;
    }
    p
}

#[cfg(test)]
mod tests {
    use super::*;

    fn site(samples: Vec<Vec<(Nt2, usize)>>) -> SiteCounts {
        let mut counts = SiteCounts::new(samples.len());
        for (s, nts) in samples.iter().enumerate() {
            for &(nt, n) in nts {
                for _ in 0..n {
                    counts.samples[s].add(nt);
                    counts.tot.add(nt);
                }
            }
        }
        counts
    }

    fn snp_model() -> Model {
        Model::new(ModelType::Snp, 0.05, 0.05).unwrap()
    }

    #[test]
    fn rejects_unsupported_alpha() {
        assert!(Model::new(ModelType::Snp, 0.2, 0.05).is_err());
        assert!(Model::new(ModelType::Snp, 0.05, 0.07).is_err());
    }

    #[test]
    fn deep_unanimous_sample_is_hom() {
        let call = snp_model().call(&site(vec![vec![(Nt2::A, 10)]]));
        assert_eq!(call.sample_calls()[0].call(), SnpCall::Hom);
        assert_eq!(call.sample_calls()[0].nts(), Some((Nt2::A, Nt2::A)));
        assert_eq!(call.alleles(), &[(Nt2::A, 1.0)]);
    }

    #[test]
    fn balanced_sample_is_het() {
        let call = snp_model().call(&site(vec![vec![(Nt2::C, 10), (Nt2::G, 10)]]));
        let sc = &call.sample_calls()[0];
        assert_eq!(sc.call(), SnpCall::Het);
        assert_eq!(sc.nts(), Some((Nt2::C, Nt2::G)));
        assert_eq!(call.alleles().len(), 2);
        let freq_sum: f64 = call.alleles().iter().map(|&(_, f)| f).sum();
        assert!((freq_sum - 1.0).abs() < 1e-12);
    }

    #[test]
    fn shallow_sample_is_unknown() {
        let call = snp_model().call(&site(vec![vec![(Nt2::A, 2)]]));
        assert_eq!(call.sample_calls()[0].call(), SnpCall::Unk);
        assert!(call.alleles().is_empty());
    }

    #[test]
    fn no_depth_sample_is_unknown() {
        let call = snp_model().call(&site(vec![vec![], vec![(Nt2::A, 10)]]));
        assert_eq!(call.sample_calls()[0].call(), SnpCall::Unk);
        assert_eq!(call.sample_calls()[1].call(), SnpCall::Hom);
    }

    #[test]
    fn het_likelihood_tops_hom_for_balanced_counts() {
        let counts = {
            let mut c = Counts::new();
            for _ in 0..8 {
                c.add(Nt2::A);
            }
            for _ in 0..8 {
                c.add(Nt2::T);
            }
            c
        };
        let liks = gt_lnls(&counts, SEQ_ERR_FREQ);
        assert!(liks.at(Nt2::A, Nt2::T) > liks.at(Nt2::A, Nt2::A));
        assert!(liks.at(Nt2::A, Nt2::T) > liks.at(Nt2::T, Nt2::T));
    }

    #[test]
    fn allele_frequencies_reflect_genotype_counts() {
        // Two hom A samples, one het A/G.
        let call = snp_model().call(&site(vec![
            vec![(Nt2::A, 10)],
            vec![(Nt2::A, 10)],
            vec![(Nt2::A, 8), (Nt2::G, 8)],
        ]));
        assert_eq!(call.most_frequent_allele(), Some(Nt2::A));
        assert!((call.freq(Nt2::A).unwrap() - 5.0 / 6.0).abs() < 1e-12);
        assert!((call.freq(Nt2::G).unwrap() - 1.0 / 6.0).abs() < 1e-12);
    }

    #[test]
    fn discard_sample_recomputes_frequencies() {
        let mut call = snp_model().call(&site(vec![
            vec![(Nt2::A, 10)],
            vec![(Nt2::A, 8), (Nt2::G, 8)],
        ]));
        assert!(call.is_variant());
        call.discard_sample(1);
        assert_eq!(call.sample_calls()[1].call(), SnpCall::Unk);
        assert_eq!(call.alleles(), &[(Nt2::A, 1.0)]);
    }

    #[test]
    fn maruki_low_calls_balanced_het() {
        let model = Model::new(ModelType::MarukiLow, 0.05, 0.05).unwrap();
        let call = model.call(&site(vec![
            vec![(Nt2::C, 12), (Nt2::G, 12)],
            vec![(Nt2::C, 20)],
        ]));
        assert_eq!(call.sample_calls()[0].call(), SnpCall::Het);
        assert_eq!(call.sample_calls()[1].call(), SnpCall::Hom);
        assert!(call.is_variant());
    }

    #[test]
    fn maruki_high_monomorphic_site_stays_fixed() {
        let model = Model::new(ModelType::MarukiHigh, 0.05, 0.05).unwrap();
        let call = model.call(&site(vec![vec![(Nt2::T, 20)], vec![(Nt2::T, 15)]]));
        assert_eq!(call.alleles(), &[(Nt2::T, 1.0)]);
        for sc in call.sample_calls() {
            assert_eq!(sc.call(), SnpCall::Hom);
        }
    }

    #[test]
    fn maruki_high_lone_error_read_does_not_make_a_variant() {
        let model = Model::new(ModelType::MarukiHigh, 0.05, 0.05).unwrap();
        let call = model.call(&site(vec![vec![(Nt2::T, 30), (Nt2::A, 1)]]));
        assert!(!call.is_variant());
    }
}
