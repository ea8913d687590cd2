/// Conditional & joint analysis engine.
///
/// Holds the harmonised per-SNP moments (`msx_b`, `msx`, `nD`) and the LD
/// moment matrices B, B_N, Z, Z_N with their inverses, supports incremental
/// insertion/erasure of SNPs with positive-definiteness, condition-number,
/// and collinearity guards, and drives the stepwise forward-selection /
/// backward-elimination search plus the per-signal pairwise conditioning
/// passes.
///
/// Matrices are dense `ndarray` arrays; SNP pairs on different chromosomes
/// or beyond the LD window keep structural zeros (complete LE). The selected
/// set stays small, so the dense LDLᵀ refactor per step is cheap.
use anyhow::Context;
use ndarray::{Array1, Array2};
use rayon::prelude::*;
use std::collections::HashSet;
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};

use crate::cli::{CondArgs, EngineArgs};
use crate::error::{CojoError, Result};
use crate::harmonise::{self, BadSnpRow, Harmonised};
use crate::reference::ReferencePanel;
use crate::stats::{self, Ldlt};
use crate::sumstats::Phenotype;

// ---------------------------------------------------------------------------
// Options
// ---------------------------------------------------------------------------

/// Engine knobs; defaults follow the published tool.
#[derive(Debug, Clone)]
pub struct CondOptions {
    /// Entry/exit p threshold in stepwise selection.
    pub p_cutoff: f64,
    /// Max R² of a new SNP on the already-selected SNPs.
    pub collinear: f64,
    /// Pairs further apart than this (bp) are assumed in complete LE.
    pub ld_window: f64,
    /// Max number of independent SNPs selected.
    pub top_snp: f64,
    /// Max |freq_pheno − μ/2| accepted by the harmoniser.
    pub freq_threshold: f64,
    pub verbose: bool,
    /// Output file prefix.
    pub out: String,
}

impl Default for CondOptions {
    fn default() -> Self {
        CondOptions {
            p_cutoff: 5e-8,
            collinear: 0.9,
            ld_window: 1e7,
            top_snp: 1e10,
            freq_threshold: 0.2,
            verbose: true,
            out: "result".to_string(),
        }
    }
}

// ---------------------------------------------------------------------------
// Output rows
// ---------------------------------------------------------------------------

/// One SNP of a pairwise-conditioned dataset.
#[derive(Debug, Clone)]
pub struct SnpRow {
    pub name: String,
    pub beta: f64,
    pub se: f64,
    pub freq: f64,
    pub pval: f64,
    pub n: f64,
}

/// The dataset handed to the colocalisation collaborator for one
/// conditioning pass: still-selected SNPs first (marginal rows), then the
/// remaining SNPs with conditional estimates where the pass produced them.
#[derive(Debug, Clone)]
pub struct CondOutput {
    pub rows: Vec<SnpRow>,
    pub cond_passed: bool,
}

/// One row of a `.cma.cojo` / `.jma.cojo` file.
#[derive(Debug, Clone)]
pub struct CojoRow {
    pub chr: u8,
    pub snp: String,
    pub bp: i64,
    pub ref_a: String,
    pub freq: f64,
    pub b: f64,
    pub se: f64,
    pub p: f64,
    pub n: f64,
    pub freq_geno: f64,
    pub bc: f64,
    pub bc_se: f64,
    pub pc: f64,
}

struct Snapshot {
    b: Array2<f64>,
    b_i: Array2<f64>,
    b_n: Array2<f64>,
    b_n_i: Array2<f64>,
    d_n: Array1<f64>,
    z: Array2<f64>,
    z_n: Array2<f64>,
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

pub struct CondAnalysis<'a> {
    name: String,
    opts: CondOptions,
    panel: &'a ReferencePanel,
    h: Harmonised,

    /// Reference-derived per-SNP dosage variance ‖xᵢ‖²/m.
    msx_b: Vec<f64>,
    /// Summary-derived variance 2f(1−f).
    msx: Vec<f64>,
    /// Effective sample size implied by β, SE, and Vp.
    n_d: Vec<f64>,
    vp: f64,
    ve: f64,

    b: Array2<f64>,
    b_i: Array2<f64>,
    b_n: Array2<f64>,
    b_n_i: Array2<f64>,
    d_n: Array1<f64>,
    z: Array2<f64>,
    z_n: Array2<f64>,

    n_collinear: usize,
    n_backward: usize,

    ind_snps: Vec<usize>,
    remain_snps: Vec<usize>,
    snapshot: Option<Snapshot>,
}

fn argmin(v: &[f64]) -> usize {
    let mut m = 0;
    for i in 1..v.len() {
        if v[i] < v[m] {
            m = i;
        }
    }
    m
}

fn argmax(v: &[f64]) -> usize {
    let mut m = 0;
    for i in 1..v.len() {
        if v[i] > v[m] {
            m = i;
        }
    }
    m
}

impl<'a> CondAnalysis<'a> {
    /// Harmonise `pheno` against `panel` and initialise the per-SNP moments.
    pub fn init(
        pheno: &Phenotype,
        panel: &'a ReferencePanel,
        opts: CondOptions,
    ) -> Result<CondAnalysis<'a>> {
        let h = harmonise::match_phenotype(pheno, panel, opts.freq_threshold, opts.verbose)?;
        let n = h.len();
        let m = panel.n_individuals() as f64;

        let msx_b: Vec<f64> = (0..n)
            .into_par_iter()
            .map(|i| {
                let x = panel.dosage_vector(h.to_include[i], h.count_a1[i], h.mu[i]);
                x.dot(&x) / m
            })
            .collect();
        let msx: Vec<f64> = h.freq.iter().map(|f| 2.0 * f * (1.0 - f)).collect();

        let vp = pheno.variance();
        let n_d: Vec<f64> = (0..n)
            .map(|i| {
                let nd = (vp - msx[i] * h.beta[i] * h.beta[i]) / (msx[i] * h.se[i] * h.se[i]) + 1.0;
                // msx = 0 (monomorphic claim) degenerates the formula; fall
                // back to the reported sample size.
                if nd.is_finite() { nd } else { h.n_outcome[i] }
            })
            .collect();

        Ok(CondAnalysis {
            name: pheno.name.clone(),
            opts,
            panel,
            h,
            msx_b,
            msx,
            n_d,
            vp,
            ve: vp,
            b: Array2::zeros((0, 0)),
            b_i: Array2::zeros((0, 0)),
            b_n: Array2::zeros((0, 0)),
            b_n_i: Array2::zeros((0, 0)),
            d_n: Array1::zeros(0),
            z: Array2::zeros((0, 0)),
            z_n: Array2::zeros((0, 0)),
            n_collinear: 0,
            n_backward: 0,
            ind_snps: Vec::new(),
            remain_snps: Vec::new(),
            snapshot: None,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn independent_snps(&self) -> &[usize] {
        &self.ind_snps
    }

    pub fn diagnostics(&self) -> &[BadSnpRow] {
        &self.h.diagnostics
    }

    fn make_x(&self, i: usize) -> Array1<f64> {
        self.panel
            .dosage_vector(self.h.to_include[i], self.h.count_a1[i], self.h.mu[i])
    }

    /// LD-window gate: same chromosome and closer than `ld_window` bp.
    fn ld_gate(&self, i: usize, j: usize) -> bool {
        let a = &self.panel.snps[self.h.to_include[i]];
        let b = &self.panel.snps[self.h.to_include[j]];
        a.chr == b.chr && ((a.bp - b.bp).abs() as f64) < self.opts.ld_window
    }

    /// B_N weighting of an x-dot-product for the SNP pair (i, j).
    fn n_weight(&self, i: usize, j: usize) -> f64 {
        self.n_d[i].min(self.n_d[j])
            * (self.msx[i] * self.msx[j] / (self.msx_b[i] * self.msx_b[j])).sqrt()
    }

    /// PD, condition-number, and collinearity checks shared by `init_b` and
    /// `insert`.
    fn guards_pass(&self, ldlt: &Ldlt, b: &Array2<f64>, b_i: &Array2<f64>) -> bool {
        let d_min = ldlt.d_min();
        if !(d_min > 0.0) || (ldlt.d_max() / d_min).sqrt() > 30.0 {
            return false;
        }
        let s = b.nrows();
        let r2_max = (0..s)
            .map(|j| 1.0 - 1.0 / (b[[j, j]] * b_i[[j, j]]))
            .fold(f64::NEG_INFINITY, f64::max);
        r2_max <= self.opts.collinear
    }

    // -----------------------------------------------------------------------
    // Moment-matrix construction
    // -----------------------------------------------------------------------

    /// Build B and B_N from scratch for `idx`, factor both, and commit.
    /// Returns false (state untouched) when the guards fail.
    fn init_b(&mut self, idx: &[usize]) -> bool {
        let s = idx.len();
        let m = self.panel.n_individuals() as f64;
        let mut b = Array2::<f64>::zeros((s, s));
        let mut b_n = Array2::<f64>::zeros((s, s));
        let mut d_n = Array1::<f64>::zeros(s);

        let xs: Vec<Array1<f64>> = idx.iter().map(|&i| self.make_x(i)).collect();
        for i in 0..s {
            d_n[i] = self.msx[idx[i]] * self.n_d[idx[i]];
            b[[i, i]] = self.msx_b[idx[i]];
            b_n[[i, i]] = d_n[i];
            for j in (i + 1)..s {
                if self.ld_gate(idx[i], idx[j]) {
                    let d = xs[i].dot(&xs[j]) / m;
                    b[[i, j]] = d;
                    b[[j, i]] = d;
                    let w = d * self.n_weight(idx[i], idx[j]);
                    b_n[[i, j]] = w;
                    b_n[[j, i]] = w;
                }
            }
        }

        let ldlt = Ldlt::factor(&b);
        let b_i = ldlt.inverse();
        if !self.guards_pass(&ldlt, &b, &b_i) {
            return false;
        }
        let b_n_i = Ldlt::factor(&b_n).inverse();

        self.b = b;
        self.b_i = b_i;
        self.b_n = b_n;
        self.b_n_i = b_n_i;
        self.d_n = d_n;
        true
    }

    /// Build Z and Z_N from scratch: cross-covariances between each selected
    /// SNP and every harmonised SNP, skipping self pairs.
    fn init_z(&mut self, idx: &[usize]) {
        let s = idx.len();
        let n = self.h.len();
        let m = self.panel.n_individuals() as f64;
        let mut z = Array2::<f64>::zeros((s, n));
        let mut z_n = Array2::<f64>::zeros((s, n));

        let xs: Vec<Array1<f64>> = idx.iter().map(|&i| self.make_x(i)).collect();
        for j in 0..n {
            if !(0..s).any(|i| idx[i] != j && self.ld_gate(idx[i], j)) {
                continue;
            }
            let x_j = self.make_x(j);
            for i in 0..s {
                if idx[i] != j && self.ld_gate(idx[i], j) {
                    let d = x_j.dot(&xs[i]) / m;
                    z[[i, j]] = d;
                    z_n[[i, j]] = d * self.n_weight(idx[i], j);
                }
            }
        }

        self.z = z;
        self.z_n = z_n;
    }

    /// Add SNP `pos` to the selected set `idx`, rebuilding B/B_N around the
    /// new row/column and copying everything else through the shifted index
    /// map. Returns false — with all matrices untouched and the collinear
    /// counter bumped — when the guards reject the enlarged set.
    fn insert_b_z(&mut self, idx: &[usize], pos: usize) -> bool {
        let mut ix = idx.to_vec();
        ix.push(pos);
        ix.sort_unstable();
        let s = ix.len();
        let p = ix.iter().position(|&v| v == pos).expect("pos in ix");
        let m = self.panel.n_individuals() as f64;

        let mut b = Array2::<f64>::zeros((s, s));
        let mut b_n = Array2::<f64>::zeros((s, s));
        let mut d_n = Array1::<f64>::zeros(s);
        for i in 0..s {
            d_n[i] = self.msx[ix[i]] * self.n_d[ix[i]];
            b[[i, i]] = self.msx_b[ix[i]];
            b_n[[i, i]] = d_n[i];
        }
        // Entries not involving `pos` are copied from the old matrices.
        for i in 0..s {
            if i == p {
                continue;
            }
            let oi = i - (i > p) as usize;
            for j in (i + 1)..s {
                if j == p {
                    continue;
                }
                let oj = j - (j > p) as usize;
                b[[i, j]] = self.b[[oi, oj]];
                b[[j, i]] = self.b[[oi, oj]];
                b_n[[i, j]] = self.b_n[[oi, oj]];
                b_n[[j, i]] = self.b_n[[oi, oj]];
            }
        }
        // The new row/column comes from fresh dot products under the gate.
        let x_p = self.make_x(pos);
        for q in 0..s {
            if q == p || !self.ld_gate(ix[q], pos) {
                continue;
            }
            let x_q = self.make_x(ix[q]);
            let d = x_q.dot(&x_p) / m;
            b[[q, p]] = d;
            b[[p, q]] = d;
            let w = d * self.n_weight(ix[q], pos);
            b_n[[q, p]] = w;
            b_n[[p, q]] = w;
        }

        let ldlt = Ldlt::factor(&b);
        let b_i = ldlt.inverse();
        if !self.guards_pass(&ldlt, &b, &b_i) {
            self.n_collinear += 1;
            return false;
        }
        let b_n_i = Ldlt::factor(&b_n).inverse();

        self.b = b;
        self.b_i = b_i;
        self.b_n = b_n;
        self.b_n_i = b_n_i;
        self.d_n = d_n;

        if self.z_n.ncols() == 0 {
            return true;
        }

        let n = self.h.len();
        let mut z = Array2::<f64>::zeros((s, n));
        let mut z_n = Array2::<f64>::zeros((s, n));
        for i in 0..s {
            if i == p {
                continue;
            }
            let oi = i - (i > p) as usize;
            z.row_mut(i).assign(&self.z.row(oi));
            z_n.row_mut(i).assign(&self.z_n.row(oi));
        }
        for j in 0..n {
            if pos == j || !self.ld_gate(pos, j) {
                continue;
            }
            let x_j = self.make_x(j);
            let d = x_j.dot(&x_p) / m;
            z[[p, j]] = d;
            z_n[[p, j]] = d * self.n_weight(pos, j);
        }
        self.z = z;
        self.z_n = z_n;
        true
    }

    /// Drop SNP `pos` from the selected set `idx` (which still contains it):
    /// shift the surviving rows/columns and re-factor.
    fn erase_b_z(&mut self, idx: &[usize], pos: usize) {
        let s = idx.len();
        let p = idx.iter().position(|&v| v == pos).expect("pos in idx");

        let mut b = Array2::<f64>::zeros((s - 1, s - 1));
        let mut b_n = Array2::<f64>::zeros((s - 1, s - 1));
        let mut d_n = Array1::<f64>::zeros(s - 1);
        for i in 0..(s - 1) {
            let oi = i + (i >= p) as usize;
            d_n[i] = self.msx[idx[oi]] * self.n_d[idx[oi]];
            for j in 0..(s - 1) {
                let oj = j + (j >= p) as usize;
                b[[i, j]] = self.b[[oi, oj]];
                b_n[[i, j]] = self.b_n[[oi, oj]];
            }
        }

        // A principal submatrix of a PD matrix is PD; no guards here.
        self.b_i = Ldlt::factor(&b).inverse();
        self.b_n_i = Ldlt::factor(&b_n).inverse();
        self.b = b;
        self.b_n = b_n;
        self.d_n = d_n;

        if self.z_n.ncols() == 0 {
            return;
        }
        let n = self.h.len();
        let mut z = Array2::<f64>::zeros((s - 1, n));
        let mut z_n = Array2::<f64>::zeros((s - 1, n));
        for i in 0..(s - 1) {
            let oi = i + (i >= p) as usize;
            z.row_mut(i).assign(&self.z.row(oi));
            z_n.row_mut(i).assign(&self.z_n.row(oi));
        }
        self.z = z;
        self.z_n = z_n;
    }

    // -----------------------------------------------------------------------
    // Joint & conditional estimation
    // -----------------------------------------------------------------------

    /// Joint effects of the selected set: bJ = B_N⁻¹·diag(D_N)·b.
    fn joint(&mut self, idx: &[usize]) -> Result<(Array1<f64>, Array1<f64>, Array1<f64>)> {
        let s = idx.len();
        if self.b_n.ncols() == 0 && !self.init_b(idx) {
            return Err(CojoError::CollinearInit);
        }

        let b_marg: Array1<f64> = idx.iter().map(|&i| self.h.beta[i]).collect();
        let mut bj = self.b_n_i.dot(&(&self.d_n * &b_marg));

        if self.opts.p_cutoff > 1e-3 {
            self.ve = self.calc_ve(idx, &bj, &b_marg)?;
        }

        let mut bj_se = Array1::<f64>::zeros(s);
        let mut pj = Array1::<f64>::ones(s);
        for i in 0..s {
            let var = self.b_n_i[[i, i]] * self.ve;
            if var > 1.0e-30 {
                bj_se[i] = var.sqrt();
                let z = bj[i] / bj_se[i];
                pj[i] = stats::pchisq(z * z);
            } else {
                bj[i] = 0.0;
                bj_se[i] = 0.0;
            }
        }
        Ok((bj, bj_se, pj))
    }

    /// Residual-variance update used by lax (p_cutoff > 1e-3) models.
    fn calc_ve(&self, idx: &[usize], bj: &Array1<f64>, b: &Array1<f64>) -> Result<f64> {
        let s = idx.len();
        let nd: Vec<f64> = idx.iter().map(|&k| self.n_d[k]).collect();
        let fitted: f64 = (0..s).map(|k| self.d_n[k] * bj[k] * b[k]).sum();

        let nu = stats::median(&nd);
        if nu - (s as f64) < 1.0 {
            return Err(CojoError::OverFit);
        }
        let ve = ((nu - 1.0) * self.vp - fitted) / (nu - s as f64);
        if ve <= 0.0 {
            return Err(CojoError::ResidualOutOfBounds);
        }
        Ok(ve)
    }

    /// Conditional effects of every SNP in `remain` given the selected set.
    ///
    /// pC carries the sentinel 2.0 where no estimate was produced (B2 ≈ 0,
    /// the collinearity guard fired, or the variance degenerated).
    fn conditional(
        &mut self,
        selected: &[usize],
        remain: &[usize],
    ) -> Result<(Array1<f64>, Array1<f64>, Array1<f64>)> {
        let s = selected.len();
        let r = remain.len();
        if s > 0 {
            if self.b_n.ncols() == 0 && !self.init_b(selected) {
                return Err(CojoError::CollinearInit);
            }
            if self.z_n.ncols() == 0 {
                self.init_z(selected);
            }
        }

        let b_marg: Array1<f64> = selected.iter().map(|&i| self.h.beta[i]).collect();
        let mut bc = Array1::<f64>::zeros(r);
        let mut bc_se = Array1::<f64>::zeros(r);
        let mut pc = Array1::<f64>::from_elem(r, 2.0);

        for i in 0..r {
            let j = remain[i];
            let b2 = self.msx[j] * self.n_d[j];
            if !stats::float_equal(b2, 0.0) {
                if s == 0 {
                    bc[i] = self.h.beta[j];
                    bc_se[i] = 1.0 / b2;
                } else {
                    let z_bi = self.z_n.column(j).dot(&self.b_n_i);
                    let z_bi_tmp = self.z.column(j).dot(&self.b_i);
                    if self.z.column(j).dot(&z_bi_tmp) / self.msx_b[j] < self.opts.collinear {
                        bc[i] = self.h.beta[j] - (&z_bi * &self.d_n).dot(&b_marg) / b2;
                        bc_se[i] = 1.0 / b2;
                    }
                }
            }
            bc_se[i] *= self.ve;
            if bc_se[i] > 1e-10 * self.vp {
                bc_se[i] = bc_se[i].sqrt();
                let z = bc[i] / bc_se[i];
                pc[i] = stats::pchisq(z * z);
            }
        }
        Ok((bc, bc_se, pc))
    }

    // -----------------------------------------------------------------------
    // Stepwise selection
    // -----------------------------------------------------------------------

    /// Forward entry: repeatedly try the lowest conditional p-value;
    /// collinear candidates are dropped from `remain` and the next best
    /// tried. Returns false when no remaining SNP clears the cutoff.
    fn select_entry(&mut self, selected: &mut Vec<usize>, remain: &mut Vec<usize>) -> Result<bool> {
        let (_bc, _bc_se, pc) = self.conditional(selected, remain)?;
        let mut pc = pc.to_vec();

        loop {
            if remain.is_empty() {
                return Ok(false);
            }
            let m = argmin(&pc);
            if pc[m] >= self.opts.p_cutoff {
                return Ok(false);
            }
            let candidate = remain[m];
            if self.insert_b_z(selected, candidate) {
                if self.opts.verbose {
                    println!(
                        "[{}] Selected {} with conditional p = {:e}",
                        self.name, self.h.snp_name[candidate], pc[m]
                    );
                }
                selected.push(candidate);
                selected.sort_unstable();
                remain.remove(m);
                return Ok(true);
            }
            // Collinear with the current model: drop and try the next best.
            pc.remove(m);
            remain.remove(m);
        }
    }

    /// Backward elimination: erase the worst joint p-value until every
    /// selected SNP clears the cutoff.
    fn selected_stay(&mut self, select: &mut Vec<usize>) -> Result<()> {
        if self.b_n.ncols() == 0 && !self.init_b(select) {
            return Err(CojoError::CollinearInit);
        }

        while !select.is_empty() {
            let (_bj, _bj_se, pj) = self.joint(select)?;
            let m = argmax(pj.as_slice().expect("contiguous pJ"));
            if pj[m] > self.opts.p_cutoff {
                self.n_backward += 1;
                let pos = select[m];
                self.erase_b_z(select, pos);
                select.remove(m);
                if self.opts.verbose {
                    println!(
                        "[{}] Backward elimination removed {}",
                        self.name, self.h.snp_name[pos]
                    );
                }
            } else {
                break;
            }
        }
        Ok(())
    }

    /// The stepwise search: initial argmax-χ² entry, then alternating
    /// forward entry and backward elimination until stable.
    fn stepwise_select(&mut self) -> Result<(Vec<usize>, Vec<usize>)> {
        let m = argmax(&self.h.chisq);
        println!(
            "[{}] Top SNP {} (chisq {:.2}, p = {:e})",
            self.name, self.h.snp_name[m], self.h.chisq[m], self.h.pval[m]
        );
        if self.h.pval[m] >= self.opts.p_cutoff {
            return Ok((Vec::new(), Vec::new()));
        }

        let mut selected = vec![m];
        let mut remain: Vec<usize> = (0..self.h.len()).filter(|&i| i != m).collect();

        if self.opts.p_cutoff > 1e-3 && self.opts.verbose {
            println!(
                "WARNING: p-value cutoff {:e} is loose for a stepwise model; joint refitting may not be stable",
                self.opts.p_cutoff
            );
        }

        let mut prev_num = 0usize;
        while !remain.is_empty() {
            if self.select_entry(&mut selected, &mut remain)? {
                self.selected_stay(&mut selected)?;
            } else {
                break;
            }
            if selected.len() % 5 == 0 && selected.len() > prev_num {
                println!(
                    "[{}] {} associated SNPs have been selected",
                    self.name,
                    selected.len()
                );
            }
            prev_num = prev_num.max(selected.len());
            if selected.len() as f64 >= self.opts.top_snp {
                break;
            }
        }

        // Lax models get one extra backward pass once entry stops.
        if self.opts.p_cutoff > 1e-3 {
            self.selected_stay(&mut selected)?;
        }

        println!(
            "[{}] Finally, {} associated SNPs have been selected",
            self.name,
            selected.len()
        );
        Ok((selected, remain))
    }

    // -----------------------------------------------------------------------
    // Driver surface
    // -----------------------------------------------------------------------

    /// Run the stepwise search and snapshot the moment matrices for the
    /// pairwise conditioning passes.
    pub fn find_independent_snps(&mut self) -> Result<()> {
        println!(
            "[{}] Stepwise model selection on {} SNPs (p cutoff {:e}, collinearity {}, complete LE assumed beyond {} Mb)",
            self.name,
            self.h.len(),
            self.opts.p_cutoff,
            self.opts.collinear,
            self.opts.ld_window / 1e6
        );
        let (selected, remain) = self.stepwise_select()?;
        if selected.is_empty() {
            return Err(CojoError::EmptySignalSet);
        }
        if selected.len() >= self.panel.n_individuals() {
            return Err(CojoError::TooManySignals {
                selected: selected.len(),
                individuals: self.panel.n_individuals(),
            });
        }
        println!(
            "[{}] {} SNPs eliminated by backward selection",
            self.name, self.n_backward
        );

        self.commit_independent(selected, remain)
    }

    /// Use a caller-supplied independent set instead of stepwise selection.
    pub fn set_independent_snps(&mut self, given: Vec<usize>) -> Result<()> {
        let mut given = given;
        given.sort_unstable();
        given.dedup();
        if given.is_empty() {
            return Err(CojoError::EmptySignalSet);
        }
        if given.len() >= self.panel.n_individuals() {
            return Err(CojoError::TooManySignals {
                selected: given.len(),
                individuals: self.panel.n_individuals(),
            });
        }
        if !self.init_b(&given) {
            return Err(CojoError::CollinearInit);
        }
        let remain: Vec<usize> = (0..self.h.len()).filter(|i| !given.contains(i)).collect();
        self.commit_independent(given, remain)
    }

    fn commit_independent(&mut self, selected: Vec<usize>, remain: Vec<usize>) -> Result<()> {
        // A single-SNP search may end before any matrix was built.
        if self.b_n.ncols() == 0 && !self.init_b(&selected) {
            return Err(CojoError::CollinearInit);
        }
        if self.z_n.ncols() == 0 {
            self.init_z(&selected);
        }
        self.ind_snps = selected;
        self.remain_snps = remain;
        self.snapshot = Some(Snapshot {
            b: self.b.clone(),
            b_i: self.b_i.clone(),
            b_n: self.b_n.clone(),
            b_n_i: self.b_n_i.clone(),
            d_n: self.d_n.clone(),
            z: self.z.clone(),
            z_n: self.z_n.clone(),
        });
        Ok(())
    }

    fn restore_snapshot(&mut self) {
        let snap = self
            .snapshot
            .take()
            .expect("independent-SNP search must run before conditioning passes");
        self.b = snap.b.clone();
        self.b_i = snap.b_i.clone();
        self.b_n = snap.b_n.clone();
        self.b_n_i = snap.b_n_i.clone();
        self.d_n = snap.d_n.clone();
        self.z = snap.z.clone();
        self.z_n = snap.z_n.clone();
        self.snapshot = Some(snap);
    }

    /// Restore the post-search state, optionally free the `pos`-th
    /// independent SNP into the remaining set, and run the conditional pass.
    fn conditioned_view(
        &mut self,
        pos: Option<usize>,
    ) -> Result<(Vec<usize>, Vec<usize>, Array1<f64>, Array1<f64>, Array1<f64>)> {
        self.restore_snapshot();
        let mut selected = self.ind_snps.clone();
        let mut remain = self.remain_snps.clone();
        if let Some(p) = pos {
            let snp = selected[p];
            remain.push(snp);
            self.erase_b_z(&selected, snp);
            selected.remove(p);
        }
        let (bc, bc_se, pc) = self.conditional(&selected, &remain)?;
        Ok((selected, remain, bc, bc_se, pc))
    }

    /// One pairwise conditioning pass: all independent SNPs other than the
    /// `pos`-th are held fixed (all of them when `pos` is None).
    pub fn pw_conditional(&mut self, pos: Option<usize>) -> Result<CondOutput> {
        let (selected, remain, bc, bc_se, pc) = self.conditioned_view(pos)?;
        let cond_passed = !remain.is_empty();

        let mut rows = Vec::with_capacity(selected.len() + remain.len());
        for &j in &selected {
            rows.push(SnpRow {
                name: self.h.snp_name[j].clone(),
                beta: self.h.beta[j],
                se: self.h.se[j],
                freq: self.h.freq[j],
                pval: self.h.pval[j],
                n: self.n_d[j],
            });
        }
        for (i, &j) in remain.iter().enumerate() {
            // Sentinel pC = 2 ⇒ no conditional estimate; keep the marginal.
            let (beta, se, pval) = if pc[i] != 2.0 {
                (bc[i], bc_se[i], pc[i])
            } else {
                (self.h.beta[j], self.h.se[j], self.h.pval[j])
            };
            rows.push(SnpRow {
                name: self.h.snp_name[j].clone(),
                beta,
                se,
                freq: self.h.freq[j],
                pval,
                n: self.n_d[j],
            });
        }
        Ok(CondOutput { rows, cond_passed })
    }

    /// `.cma.cojo` rows: each independent SNP with its leave-one-out
    /// conditional estimate (conditioning on the other independent SNPs).
    pub fn cma_rows(&mut self) -> Result<Vec<CojoRow>> {
        let ind = self.ind_snps.clone();
        let mut rows = Vec::with_capacity(ind.len());
        for p in 0..ind.len() {
            let (_selected, remain, bc, bc_se, pc) = self.conditioned_view(Some(p))?;
            // The freed SNP was appended to the end of `remain`.
            let i = remain.len() - 1;
            debug_assert_eq!(remain[i], ind[p]);
            rows.push(self.cojo_row(ind[p], bc[i], bc_se[i], pc[i]));
        }
        self.restore_snapshot();
        Ok(rows)
    }

    /// `.jma.cojo` rows: joint estimates of the independent set.
    pub fn jma_rows(&mut self) -> Result<Vec<CojoRow>> {
        self.restore_snapshot();
        let ind = self.ind_snps.clone();
        let (bj, bj_se, pj) = self.joint(&ind)?;
        Ok(ind
            .iter()
            .enumerate()
            .map(|(i, &j)| self.cojo_row(j, bj[i], bj_se[i], pj[i]))
            .collect())
    }

    fn cojo_row(&self, j: usize, bc: f64, bc_se: f64, pc: f64) -> CojoRow {
        let rec = &self.panel.snps[self.h.to_include[j]];
        CojoRow {
            chr: rec.chr,
            snp: self.h.snp_name[j].clone(),
            bp: rec.bp,
            ref_a: self.h.ref_allele[j].clone(),
            freq: self.h.freq[j],
            b: self.h.beta[j],
            se: self.h.se[j],
            p: self.h.pval[j],
            n: self.n_d[j],
            freq_geno: 0.5 * self.h.mu[j],
            bc,
            bc_se,
            pc,
        }
    }

    /// Read SNP identifiers to condition on (first token per line) and map
    /// them to harmonised indices.
    pub fn read_snplist(&self, path: &str) -> Result<Vec<usize>> {
        let file = File::open(path).map_err(|e| CojoError::io(path, e))?;
        let mut names: HashSet<String> = HashSet::new();
        for line in BufReader::new(file).lines() {
            let line = line.map_err(|e| CojoError::io(path, e))?;
            if let Some(tok) = line.split_whitespace().next() {
                names.insert(tok.to_string());
            }
        }
        let given: Vec<usize> = (0..self.h.len())
            .filter(|&i| names.contains(&self.h.snp_name[i]))
            .collect();
        if given.is_empty() {
            return Err(CojoError::NoOverlap);
        }
        println!(
            "[{}] {} conditioning SNP(s) matched to the harmonised set",
            self.name,
            given.len()
        );
        Ok(given)
    }
}

// ---------------------------------------------------------------------------
// Output writers
// ---------------------------------------------------------------------------

pub fn write_badsnps(path: &str, rows: &[BadSnpRow]) -> Result<()> {
    (|| -> std::io::Result<()> {
        let mut w = BufWriter::new(File::create(path)?);
        writeln!(w, "SNP\tChisq\tPval\tFreq")?;
        for r in rows {
            writeln!(w, "{}\t{}\t{}\t{}", r.snp, r.chisq, r.pval, r.freq)?;
        }
        w.flush()
    })()
    .map_err(|e| CojoError::io(path, e))
}

fn write_cojo(path: &str, rows: &[CojoRow], suffix: &str) -> Result<()> {
    (|| -> std::io::Result<()> {
        let mut w = BufWriter::new(File::create(path)?);
        writeln!(
            w,
            "Chr\tSNP\tbp\trefA\tfreq\tb\tse\tp\tn\tfreq_geno\tb{0}\tb{0}_se\tp{0}",
            suffix
        )?;
        for r in rows {
            writeln!(
                w,
                "{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}",
                r.chr,
                r.snp,
                r.bp,
                r.ref_a,
                r.freq,
                r.b,
                r.se,
                r.p,
                r.n,
                r.freq_geno,
                r.bc,
                r.bc_se,
                r.pc
            )?;
        }
        w.flush()
    })()
    .map_err(|e| CojoError::io(path, e))
}

pub fn write_cma(path: &str, rows: &[CojoRow]) -> Result<()> {
    write_cojo(path, rows, "C")
}

pub fn write_jma(path: &str, rows: &[CojoRow]) -> Result<()> {
    write_cojo(path, rows, "J")
}

// ---------------------------------------------------------------------------
// `cond` subcommand driver
// ---------------------------------------------------------------------------

impl CondOptions {
    pub fn from_args(args: &EngineArgs) -> CondOptions {
        CondOptions {
            p_cutoff: args.p_cutoff,
            collinear: args.collinear,
            ld_window: args.ld_window,
            top_snp: args.top_snp,
            freq_threshold: args.freq_threshold,
            verbose: !args.no_verbose,
            out: args.out.clone(),
        }
    }
}

/// Run one conditional analysis end to end and write its outputs.
pub fn run_analysis<'a>(
    pheno: &Phenotype,
    panel: &'a ReferencePanel,
    opts: CondOptions,
    cond_file: Option<&str>,
    joint_out: bool,
) -> anyhow::Result<CondAnalysis<'a>> {
    let mut ca = CondAnalysis::init(pheno, panel, opts)
        .with_context(|| format!("harmonising phenotype '{}'", pheno.name))?;

    let badsnps_path = format!("{}.{}.badsnps", ca.opts.out, ca.name);
    write_badsnps(&badsnps_path, ca.diagnostics())
        .with_context(|| format!("phenotype '{}'", ca.name))?;

    if let Some(list) = cond_file {
        let given = ca
            .read_snplist(list)
            .with_context(|| format!("phenotype '{}'", ca.name))?;
        ca.set_independent_snps(given)
            .with_context(|| format!("phenotype '{}'", ca.name))?;
    } else {
        ca.find_independent_snps()
            .with_context(|| format!("phenotype '{}'", ca.name))?;
    }

    let cname = format!("{}.{}", ca.opts.out, ca.name);
    let rows = ca
        .cma_rows()
        .with_context(|| format!("phenotype '{}'", ca.name))?;
    write_cma(&format!("{}.cma.cojo", cname), &rows)?;
    if joint_out {
        let rows = ca
            .jma_rows()
            .with_context(|| format!("phenotype '{}'", ca.name))?;
        write_jma(&format!("{}.jma.cojo", cname), &rows)?;
    }

    println!(
        "[{}] {} independent signal(s); {} collinear candidate(s) rejected, {} eliminated backward",
        ca.name,
        ca.ind_snps.len(),
        ca.n_collinear,
        ca.n_backward
    );
    Ok(ca)
}

pub fn run(args: CondArgs) -> anyhow::Result<()> {
    let pheno = Phenotype::from_file(&args.sumstats, args.name.as_deref())?;
    let panel = ReferencePanel::from_bfile(&args.engine.bfile)?;
    let opts = CondOptions::from_args(&args.engine);
    run_analysis(
        &pheno,
        &panel,
        opts,
        args.cond_file.as_deref(),
        args.joint_out,
    )?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
