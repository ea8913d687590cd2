/// PLINK reference panel: .bim/.fam parsing, .bed genotypes via `bed-reader`,
/// and the centered-dosage vector builder used by the LD moment tables.
///
/// Genotypes are held as two per-SNP indicator bit arrays over individuals:
/// (b₁,b₂) = (0,0)/(1,0)/(1,1) for an A1-dosage of 0/1/2 and (0,1) for a
/// missing call. The panel is read-only after loading; allele flips live in
/// the per-analysis harmonised state, not here.
use anyhow::{Context, Result};
use bed_reader::{Bed, ReadOptions};
use ndarray::{Array1, Array2};
use rayon::prelude::*;
use std::collections::HashMap;
use std::fs::File;
use std::io::{BufRead, BufReader};

// ---------------------------------------------------------------------------
// BIM / FAM parsing
// ---------------------------------------------------------------------------

/// Per-SNP metadata from a PLINK .bim file.
/// Columns: CHR  SNP  CM  BP  A1  A2.
#[derive(Debug, Clone)]
pub struct BimRecord {
    pub chr: u8,
    pub snp: String,
    pub bp: i64,
    pub a1: String,
    pub a2: String,
}

/// Parse a PLINK .bim file. Returns one `BimRecord` per row.
pub fn parse_bim(path: &str) -> Result<Vec<BimRecord>> {
    let f = File::open(path).with_context(|| format!("opening BIM file '{}'", path))?;
    let reader = BufReader::new(f);
    let mut records = Vec::new();

    for (line_no, line) in reader.lines().enumerate() {
        let line = line.with_context(|| format!("reading BIM line {}", line_no + 1))?;
        let cols: Vec<&str> = line.split_whitespace().collect();
        anyhow::ensure!(
            cols.len() >= 6,
            "BIM line {}: expected 6 columns, got {}",
            line_no + 1,
            cols.len()
        );

        records.push(BimRecord {
            chr: cols[0].parse::<u8>().unwrap_or(0),
            snp: cols[1].to_string(),
            bp: cols[3].parse::<i64>().unwrap_or(0),
            a1: cols[4].to_uppercase(),
            a2: cols[5].to_uppercase(),
        });
    }

    Ok(records)
}

/// Parse (FID, IID) pairs from a PLINK .fam file in order.
pub fn parse_fam(path: &str) -> Result<Vec<(String, String)>> {
    let f = File::open(path).with_context(|| format!("opening FAM file '{}'", path))?;
    let reader = BufReader::new(f);
    let mut ids = Vec::new();
    for (i, line) in reader.lines().enumerate() {
        let line = line.with_context(|| format!("reading FAM line {}", i + 1))?;
        let cols: Vec<&str> = line.split_whitespace().collect();
        anyhow::ensure!(
            cols.len() >= 2,
            "FAM line {}: expected ≥ 2 columns (FID IID ...), got {}",
            i + 1,
            cols.len()
        );
        ids.push((cols[0].to_string(), cols[1].to_string()));
    }
    Ok(ids)
}

// ---------------------------------------------------------------------------
// Reference panel
// ---------------------------------------------------------------------------

pub struct ReferencePanel {
    pub snps: Vec<BimRecord>,
    /// SNP name → index into `snps` (first occurrence wins).
    pub snp_index: HashMap<String, usize>,
    /// Indicator bits per SNP per individual; see module docs for encoding.
    pub bed_snp_1: Vec<Vec<bool>>,
    pub bed_snp_2: Vec<Vec<bool>>,
    /// Mean A1 dosage per SNP over non-missing individuals.
    pub mu: Vec<f64>,
    pub fam_ids: Vec<(String, String)>,
    /// Indices of individuals included in all dosage computations.
    pub fam_ids_inc: Vec<usize>,
}

impl ReferencePanel {
    /// Load `{prefix}.bim`, `{prefix}.fam`, and `{prefix}.bed`.
    pub fn from_bfile(prefix: &str) -> Result<ReferencePanel> {
        let bim_path = format!("{}.bim", prefix);
        let fam_path = format!("{}.fam", prefix);
        let bed_path = format!("{}.bed", prefix);

        let snps = parse_bim(&bim_path).with_context(|| format!("parsing BIM '{}'", bim_path))?;
        let fam_ids =
            parse_fam(&fam_path).with_context(|| format!("parsing FAM '{}'", fam_path))?;
        let n_snps = snps.len();
        let n_indiv = fam_ids.len();
        anyhow::ensure!(n_snps > 0, "BIM '{}' lists no SNPs", bim_path);
        anyhow::ensure!(n_indiv > 0, "FAM '{}' lists no individuals", fam_path);

        let mut bed = Bed::new(bed_path.as_str())
            .with_context(|| format!("opening BED file '{}'", bed_path))?;
        let raw: Array2<f32> = ReadOptions::builder()
            .f32()
            .read(&mut bed)
            .with_context(|| format!("reading BED file '{}'", bed_path))?;
        anyhow::ensure!(
            raw.nrows() == n_indiv && raw.ncols() == n_snps,
            "BED file '{}' is {}×{} but FAM/BIM describe {}×{}",
            bed_path,
            raw.nrows(),
            raw.ncols(),
            n_indiv,
            n_snps
        );

        let mut panel = ReferencePanel {
            snp_index: HashMap::with_capacity(n_snps),
            bed_snp_1: vec![vec![false; n_indiv]; n_snps],
            bed_snp_2: vec![vec![false; n_indiv]; n_snps],
            mu: vec![0.0; n_snps],
            fam_ids,
            fam_ids_inc: (0..n_indiv).collect(),
            snps,
        };

        for j in 0..n_snps {
            panel.snp_index.entry(panel.snps[j].snp.clone()).or_insert(j);
            let (mut sum, mut count) = (0.0f64, 0usize);
            for k in 0..n_indiv {
                let v = raw[[k, j]];
                if v.is_nan() {
                    // Missing call: (b₁,b₂) = (0,1).
                    panel.bed_snp_2[j][k] = true;
                    continue;
                }
                let d = v.round() as u8;
                panel.bed_snp_1[j][k] = d >= 1;
                panel.bed_snp_2[j][k] = d >= 2;
                sum += d as f64;
                count += 1;
            }
            panel.mu[j] = if count > 0 { sum / count as f64 } else { 0.0 };
        }

        println!(
            "Loaded {} SNPs, {} individuals from '{}'",
            panel.n_snps(),
            panel.fam_ids.len(),
            prefix
        );
        Ok(panel)
    }

    pub fn n_snps(&self) -> usize {
        self.snps.len()
    }

    pub fn n_individuals(&self) -> usize {
        self.fam_ids_inc.len()
    }

    /// Centered dosage vector for reference SNP `snp` over the included
    /// individuals.
    ///
    /// `count_a1` selects the dosage orientation (false ⇒ 2 − d, i.e. the
    /// effect allele is the panel's A2) and `mu` is the matching mean
    /// dosage; missing calls are imputed to the mean, hence 0 after
    /// centering. The fill is data-parallel over individuals, each worker
    /// owning one output slot.
    pub fn dosage_vector(&self, snp: usize, count_a1: bool, mu: f64) -> Array1<f64> {
        let b1 = &self.bed_snp_1[snp];
        let b2 = &self.bed_snp_2[snp];
        let mut x = Array1::<f64>::zeros(self.fam_ids_inc.len());
        x.as_slice_mut()
            .expect("contiguous dosage vector")
            .par_iter_mut()
            .zip(&self.fam_ids_inc)
            .for_each(|(xi, &k)| {
                *xi = if !b1[k] && b2[k] {
                    0.0
                } else {
                    let d = (b1[k] as u8 + b2[k] as u8) as f64;
                    let d = if count_a1 { d } else { 2.0 - d };
                    d - mu
                };
            });
        x
    }
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    /// PLINK .bed 2-bit codes for an A1-dosage (None = missing):
    /// 2 → 0b00, 1 → 0b10, 0 → 0b11, missing → 0b01.
    pub fn pack_a1_dosages(dosages: &[Option<u8>]) -> Vec<u8> {
        let code = |g: Option<u8>| match g {
            Some(2) => 0b00u8,
            Some(1) => 0b10,
            Some(0) => 0b11,
            _ => 0b01,
        };
        dosages
            .chunks(4)
            .map(|chunk| {
                chunk
                    .iter()
                    .enumerate()
                    .fold(0u8, |byte, (i, &g)| byte | (code(g) << (2 * i)))
            })
            .collect()
    }

    pub fn write_plink(
        dir: &std::path::Path,
        bim_rows: &[&str],
        n_indiv: usize,
        snp_dosages: &[Vec<Option<u8>>],
    ) -> String {
        let prefix = dir.join("panel");

        let mut fam = File::create(prefix.with_extension("fam")).unwrap();
        for i in 1..=n_indiv {
            writeln!(fam, "F{} I{} 0 0 0 -9", i, i).unwrap();
        }

        let mut bim = File::create(prefix.with_extension("bim")).unwrap();
        for row in bim_rows {
            writeln!(bim, "{}", row).unwrap();
        }

        let mut bed = File::create(prefix.with_extension("bed")).unwrap();
        bed.write_all(&[0x6C, 0x1B, 0x01]).unwrap();
        for dosages in snp_dosages {
            assert_eq!(dosages.len(), n_indiv);
            bed.write_all(&pack_a1_dosages(dosages)).unwrap();
        }

        prefix.to_string_lossy().to_string()
    }

    #[test]
    fn test_parse_bim_fields() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.bim");
        std::fs::write(&path, "1\trs1\t0\t12345\ta\tg\n2\trs2\t0\t999\tC\tT\n").unwrap();
        let recs = parse_bim(path.to_str().unwrap()).unwrap();
        assert_eq!(recs.len(), 2);
        assert_eq!(recs[0].snp, "rs1");
        assert_eq!(recs[0].chr, 1);
        assert_eq!(recs[0].bp, 12345);
        assert_eq!(recs[0].a1, "A");
        assert_eq!(recs[0].a2, "G");
        assert_eq!(recs[1].chr, 2);
    }

    #[test]
    fn test_load_panel_bits_and_mu() {
        let dir = tempfile::tempdir().unwrap();
        let prefix = write_plink(
            dir.path(),
            &["1\trs1\t0\t100\tA\tG", "1\trs2\t0\t200\tC\tT"],
            4,
            &[
                vec![Some(0), Some(1), Some(2), Some(1)],
                vec![Some(2), None, Some(0), Some(2)],
            ],
        );

        let panel = ReferencePanel::from_bfile(&prefix).unwrap();
        assert_eq!(panel.n_snps(), 2);
        assert_eq!(panel.n_individuals(), 4);
        assert_eq!(panel.snp_index["rs2"], 1);

        // rs1 dosages [0,1,2,1]: b1 = [F,T,T,T], b2 = [F,F,T,F], μ = 1.
        assert_eq!(panel.bed_snp_1[0], vec![false, true, true, true]);
        assert_eq!(panel.bed_snp_2[0], vec![false, false, true, false]);
        assert!((panel.mu[0] - 1.0).abs() < 1e-12);

        // rs2 has one missing call: (b₁,b₂) = (0,1); μ over the other three.
        assert!(!panel.bed_snp_1[1][1]);
        assert!(panel.bed_snp_2[1][1]);
        assert!((panel.mu[1] - 4.0 / 3.0).abs() < 1e-12);
    }

    #[test]
    fn test_dosage_vector_orientation_and_missing() {
        let dir = tempfile::tempdir().unwrap();
        let prefix = write_plink(
            dir.path(),
            &["1\trs1\t0\t100\tA\tG"],
            4,
            &[vec![Some(0), Some(1), None, Some(2)]],
        );
        let panel = ReferencePanel::from_bfile(&prefix).unwrap();
        let mu = panel.mu[0];
        assert!((mu - 1.0).abs() < 1e-12);

        let x = panel.dosage_vector(0, true, mu);
        assert!((x[0] - (0.0 - mu)).abs() < 1e-12);
        assert!((x[1] - (1.0 - mu)).abs() < 1e-12);
        assert_eq!(x[2], 0.0, "missing call must centre to zero");
        assert!((x[3] - (2.0 - mu)).abs() < 1e-12);

        // Flipped orientation: d ↦ 2 − d, centered with the flipped mean.
        let x_flip = panel.dosage_vector(0, false, 2.0 - mu);
        for k in 0..4 {
            assert!((x_flip[k] + x[k]).abs() < 1e-12, "k = {k}");
        }
    }
}
