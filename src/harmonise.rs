/// Allele harmonisation: match summary-statistics SNPs against the reference
/// panel, express every effect with respect to the phenotype's effect allele,
/// and drop SNPs whose allele frequencies disagree with the panel.
///
/// The panel is not touched; the flipped mean dosages and the dosage
/// orientation live here, private to one conditional analysis. Diagnostic
/// rows are returned as a value — the driver decides where to write them.
use crate::error::{CojoError, Result};
use crate::reference::ReferencePanel;
use crate::stats;
use crate::sumstats::Phenotype;
use std::collections::HashSet;

/// One row of the `badsnps` diagnostic report.
#[derive(Debug, Clone)]
pub struct BadSnpRow {
    pub snp: String,
    pub chisq: f64,
    pub pval: f64,
    pub freq: f64,
}

/// Harmonised per-SNP state, indexed 0..n−1 in reference-inclusion order.
#[derive(Debug, Clone)]
pub struct Harmonised {
    /// Reference SNP indices, ascending.
    pub to_include: Vec<usize>,
    pub snp_name: Vec<String>,
    pub freq: Vec<f64>,
    pub beta: Vec<f64>,
    pub se: Vec<f64>,
    pub pval: Vec<f64>,
    pub chisq: Vec<f64>,
    pub n_outcome: Vec<f64>,
    /// Mean dosage of the effect allele (2 − μ when the effect allele is the
    /// panel's A2).
    pub mu: Vec<f64>,
    /// The effect allele each β refers to.
    pub ref_allele: Vec<String>,
    /// Whether the raw A1 dosage already counts the effect allele.
    pub count_a1: Vec<bool>,
    pub n_freq_dropped: usize,
    /// Every candidate that reached allele matching, including the
    /// frequency-dropped ones.
    pub diagnostics: Vec<BadSnpRow>,
}

impl Harmonised {
    pub fn len(&self) -> usize {
        self.to_include.len()
    }

    pub fn is_empty(&self) -> bool {
        self.to_include.is_empty()
    }
}

/// Match `pheno` against `panel`; see the module docs for the rules.
pub fn match_phenotype(
    pheno: &Phenotype,
    panel: &ReferencePanel,
    freq_threshold: f64,
    verbose: bool,
) -> Result<Harmonised> {
    // Candidate pass: identifier found and the effect allele is one of the
    // panel's two alleles.
    let mut candidates: Vec<(usize, usize)> = Vec::new(); // (ref_idx, pheno_idx)
    let mut seen_ref: HashSet<usize> = HashSet::new();
    for i in 0..pheno.len() {
        let Some(&j) = panel.snp_index.get(&pheno.snp_name[i]) else {
            continue;
        };
        let rec = &panel.snps[j];
        if pheno.allele1[i] != rec.a1 && pheno.allele1[i] != rec.a2 {
            continue;
        }
        if seen_ref.insert(j) {
            candidates.push((j, i));
        }
    }
    candidates.sort_by_key(|&(j, _)| j);

    let mut h = Harmonised {
        to_include: Vec::new(),
        snp_name: Vec::new(),
        freq: Vec::new(),
        beta: Vec::new(),
        se: Vec::new(),
        pval: Vec::new(),
        chisq: Vec::new(),
        n_outcome: Vec::new(),
        mu: Vec::new(),
        ref_allele: Vec::new(),
        count_a1: Vec::new(),
        n_freq_dropped: 0,
        diagnostics: Vec::new(),
    };

    for (j, i) in candidates {
        let rec = &panel.snps[j];
        let count_a1 = pheno.allele1[i] == rec.a1;
        let mu = if count_a1 {
            panel.mu[j]
        } else {
            2.0 - panel.mu[j]
        };

        let chisq = (pheno.beta[i] / pheno.se[i]) * (pheno.beta[i] / pheno.se[i]);
        let pval = stats::pchisq(chisq);
        h.diagnostics.push(BadSnpRow {
            snp: pheno.snp_name[i].clone(),
            chisq,
            pval,
            freq: pheno.freq[i],
        });

        if (mu / 2.0 - pheno.freq[i]).abs() >= freq_threshold {
            h.n_freq_dropped += 1;
            continue;
        }

        h.to_include.push(j);
        h.snp_name.push(pheno.snp_name[i].clone());
        h.freq.push(pheno.freq[i]);
        h.beta.push(pheno.beta[i]);
        h.se.push(pheno.se[i]);
        h.pval.push(pval);
        h.chisq.push(chisq);
        h.n_outcome.push(pheno.n[i]);
        h.mu.push(mu);
        h.ref_allele.push(pheno.allele1[i].clone());
        h.count_a1.push(count_a1);
    }

    if h.n_freq_dropped > 0 && verbose {
        println!(
            "[{}] {} SNPs had a large allele-frequency difference to the reference sample and were dropped",
            pheno.name, h.n_freq_dropped
        );
    }

    if h.is_empty() {
        return Err(CojoError::NoOverlap);
    }
    println!(
        "[{}] Matched {} SNPs from the phenotype file to the reference panel",
        pheno.name,
        h.len()
    );
    Ok(h)
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
