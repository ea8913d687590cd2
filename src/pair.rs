/// Matched two-phenotype datasets: intersect the conditioned outputs of two
/// analyses on SNP identifier and collect both sides' statistics for the
/// downstream colocalisation component.
use anyhow::Result;
use std::collections::HashMap;

use crate::cli::PairArgs;
use crate::cond::{self, CondOptions, CondOutput};
use crate::reference::ReferencePanel;
use crate::sumstats::Phenotype;

/// Six parallel vectors per side, ordered as in the first analysis.
#[derive(Debug, Clone, Default)]
pub struct MatchedPair {
    pub snps: Vec<String>,
    pub betas1: Vec<f64>,
    pub ses1: Vec<f64>,
    pub pvals1: Vec<f64>,
    pub mafs1: Vec<f64>,
    pub ns1: Vec<f64>,
    pub betas2: Vec<f64>,
    pub ses2: Vec<f64>,
    pub pvals2: Vec<f64>,
    pub mafs2: Vec<f64>,
    pub ns2: Vec<f64>,
}

impl MatchedPair {
    pub fn new(o1: &CondOutput, o2: &CondOutput) -> MatchedPair {
        let mut idx2: HashMap<&str, usize> = HashMap::with_capacity(o2.rows.len());
        for (i, row) in o2.rows.iter().enumerate() {
            idx2.entry(row.name.as_str()).or_insert(i);
        }

        let mut pair = MatchedPair::default();
        for r1 in &o1.rows {
            let Some(&i2) = idx2.get(r1.name.as_str()) else {
                continue;
            };
            let r2 = &o2.rows[i2];
            pair.snps.push(r1.name.clone());
            pair.betas1.push(r1.beta);
            pair.ses1.push(r1.se);
            pair.pvals1.push(r1.pval);
            pair.mafs1.push(r1.freq);
            pair.ns1.push(r1.n);
            pair.betas2.push(r2.beta);
            pair.ses2.push(r2.se);
            pair.pvals2.push(r2.pval);
            pair.mafs2.push(r2.freq);
            pair.ns2.push(r2.n);
        }
        pair
    }

    pub fn len(&self) -> usize {
        self.snps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.snps.is_empty()
    }

    /// Index of the SNP with the smallest conditional p on either side.
    pub fn top_shared(&self) -> Option<usize> {
        (0..self.len()).min_by(|&a, &b| {
            let pa = self.pvals1[a].min(self.pvals2[a]);
            let pb = self.pvals1[b].min(self.pvals2[b]);
            pa.partial_cmp(&pb).unwrap_or(std::cmp::Ordering::Equal)
        })
    }
}

// ---------------------------------------------------------------------------
// `pair` subcommand driver
// ---------------------------------------------------------------------------

pub fn run(args: PairArgs) -> Result<()> {
    let panel = ReferencePanel::from_bfile(&args.engine.bfile)?;
    let p1 = Phenotype::from_file(&args.sumstats1, args.name1.as_deref())?;
    let p2 = Phenotype::from_file(&args.sumstats2, args.name2.as_deref())?;
    anyhow::ensure!(
        p1.name != p2.name,
        "the two phenotypes resolve to the same name '{}'; use --name1/--name2",
        p1.name
    );

    let opts = CondOptions::from_args(&args.engine);
    let mut ca1 = cond::run_analysis(&p1, &panel, opts.clone(), None, args.joint_out)?;
    let mut ca2 = cond::run_analysis(&p2, &panel, opts, None, args.joint_out)?;

    let s1 = ca1.independent_snps().len();
    let s2 = ca2.independent_snps().len();
    println!(
        "[{} × {}] Building matched datasets for {} × {} signal combinations",
        ca1.name(),
        ca2.name(),
        s1,
        s2
    );

    for i in 0..s1 {
        let o1 = ca1.pw_conditional(Some(i))?;
        for j in 0..s2 {
            let o2 = ca2.pw_conditional(Some(j))?;
            if !o1.cond_passed || !o2.cond_passed {
                println!(
                    "[{} × {}] signals ({}, {}): conditional pass incomplete, skipping",
                    ca1.name(),
                    ca2.name(),
                    i,
                    j
                );
                continue;
            }
            let pair = MatchedPair::new(&o1, &o2);
            println!(
                "[{} × {}] signals ({}, {}): {} shared SNPs ready for colocalisation",
                ca1.name(),
                ca2.name(),
                i,
                j,
                pair.len()
            );
            if let Some(k) = pair.top_shared() {
                println!(
                    "  top shared SNP {}: b {:.4}/{:.4}, se {:.4}/{:.4}, p {:e}/{:e}, maf {:.3}/{:.3}, n {:.0}/{:.0}",
                    pair.snps[k],
                    pair.betas1[k],
                    pair.betas2[k],
                    pair.ses1[k],
                    pair.ses2[k],
                    pair.pvals1[k],
                    pair.pvals2[k],
                    pair.mafs1[k],
                    pair.mafs2[k],
                    pair.ns1[k],
                    pair.ns2[k]
                );
            }
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cond::SnpRow;

    fn out(rows: Vec<(&str, f64)>) -> CondOutput {
        CondOutput {
            rows: rows
                .into_iter()
                .map(|(name, beta)| SnpRow {
                    name: name.to_string(),
                    beta,
                    se: 0.01,
                    freq: 0.3,
                    pval: 0.5,
                    n: 1000.0,
                })
                .collect(),
            cond_passed: true,
        }
    }

    #[test]
    fn test_intersection_keeps_first_side_order() {
        let o1 = out(vec![("rs1", 0.1), ("rs2", 0.2), ("rs3", 0.3)]);
        let o2 = out(vec![("rs3", -0.3), ("rs1", -0.1)]);

        let pair = MatchedPair::new(&o1, &o2);
        assert_eq!(pair.snps, vec!["rs1", "rs3"]);
        assert_eq!(pair.betas1, vec![0.1, 0.3]);
        assert_eq!(pair.betas2, vec![-0.1, -0.3]);
        assert_eq!(pair.len(), 2);
        assert_eq!(pair.ses1.len(), 2);
        assert_eq!(pair.ns2, vec![1000.0, 1000.0]);
        assert!(pair.top_shared().is_some());
    }

    #[test]
    fn test_no_shared_snps_gives_empty_pair() {
        let o1 = out(vec![("rs1", 0.1)]);
        let o2 = out(vec![("rs9", 0.2)]);
        let pair = MatchedPair::new(&o1, &o2);
        assert!(pair.is_empty());
    }
}
