/// GWAS summary-statistics loading: Polars CSV reader plus a column-name
/// synonym map, producing the per-SNP vectors the harmoniser consumes.
use anyhow::{Context, Result};
use polars::prelude::*;
use std::fs::File;
use std::path::PathBuf;

use crate::stats;

// ---------------------------------------------------------------------------
// Column-name synonym map
// ---------------------------------------------------------------------------

/// (uppercase_synonym, canonical_name) pairs.
const CNAME_MAP: &[(&str, &str)] = &[
    // SNP identifier
    ("SNP", "SNP"),
    ("MARKERNAME", "SNP"),
    ("SNPID", "SNP"),
    ("RSID", "SNP"),
    ("RS", "SNP"),
    // Effect allele
    ("A1", "A1"),
    ("ALLELE1", "A1"),
    ("EFFECT_ALLELE", "A1"),
    ("EA", "A1"),
    // Other allele
    ("A2", "A2"),
    ("ALLELE2", "A2"),
    ("OTHER_ALLELE", "A2"),
    ("NON_EFFECT_ALLELE", "A2"),
    ("NEA", "A2"),
    // Effect-allele frequency
    ("FREQ", "FREQ"),
    ("FRQ", "FREQ"),
    ("EAF", "FREQ"),
    ("MAF", "FREQ"),
    // Effect size
    ("B", "B"),
    ("BETA", "B"),
    ("EFFECT", "B"),
    // Standard error
    ("SE", "SE"),
    ("STDERR", "SE"),
    ("STDERROR", "SE"),
    // P-value (optional; recomputed from χ² regardless)
    ("P", "P"),
    ("PVAL", "P"),
    ("PVALUE", "P"),
    ("P_VALUE", "P"),
    // Sample size
    ("N", "N"),
];

fn cname_lookup(upper: &str) -> Option<&'static str> {
    CNAME_MAP.iter().find(|(k, _)| *k == upper).map(|(_, v)| *v)
}

// ---------------------------------------------------------------------------
// Phenotype summary table
// ---------------------------------------------------------------------------

/// One phenotype's summary statistics, column-parallel over SNPs.
///
/// P-values are recomputed from χ² = (β/SE)² at load; any p column in the
/// file is treated as advisory only.
#[derive(Debug, Clone)]
pub struct Phenotype {
    pub name: String,
    pub snp_name: Vec<String>,
    pub allele1: Vec<String>,
    pub allele2: Vec<String>,
    pub freq: Vec<f64>,
    pub beta: Vec<f64>,
    pub se: Vec<f64>,
    pub pval: Vec<f64>,
    pub n: Vec<f64>,
}

impl Phenotype {
    /// Read a tab-separated summary file (optionally .gz).
    ///
    /// `name` overrides the phenotype name; the file stem is the default.
    pub fn from_file(path: &str, name: Option<&str>) -> Result<Phenotype> {
        let pheno_name = match name {
            Some(n) => n.to_string(),
            None => file_stem(path),
        };

        // Decompress .gz into a temp file; Polars then reads plain text.
        let (resolved, _guard): (PathBuf, Option<tempfile::TempPath>) = if path.ends_with(".gz") {
            let input =
                File::open(path).with_context(|| format!("opening sumstats '{}'", path))?;
            let mut decoder = flate2::read::GzDecoder::new(input);
            let mut tmp = tempfile::Builder::new()
                .prefix("pwcojo_gz_")
                .suffix(".tmp")
                .tempfile()
                .context("creating temp file for gz decompression")?;
            std::io::copy(&mut decoder, &mut tmp)
                .with_context(|| format!("decompressing '{}'", path))?;
            let tp = tmp.into_temp_path();
            (tp.to_path_buf(), Some(tp))
        } else {
            (PathBuf::from(path), None)
        };

        let mut df = CsvReadOptions::default()
            .with_has_header(true)
            .with_parse_options(CsvParseOptions::default().with_separator(b'\t'))
            .try_into_reader_with_file_path(Some(resolved))
            .with_context(|| format!("opening sumstats '{}'", path))?
            .finish()
            .with_context(|| format!("reading sumstats '{}'", path))?;

        normalize_columns(&mut df)?;
        for required in ["SNP", "A1", "A2", "FREQ", "B", "SE", "N"] {
            anyhow::ensure!(
                df.get_column_names().iter().any(|c| c.as_str() == required),
                "sumstats '{}' is missing a {} column (or a recognised synonym)",
                path,
                required
            );
        }

        let snp = str_column(&df, "SNP")?;
        let a1 = str_column(&df, "A1")?;
        let a2 = str_column(&df, "A2")?;
        let freq = f64_column(&df, "FREQ")?;
        let beta = f64_column(&df, "B")?;
        let se = f64_column(&df, "SE")?;
        let n = f64_column(&df, "N")?;

        let mut pheno = Phenotype {
            name: pheno_name,
            snp_name: Vec::new(),
            allele1: Vec::new(),
            allele2: Vec::new(),
            freq: Vec::new(),
            beta: Vec::new(),
            se: Vec::new(),
            pval: Vec::new(),
            n: Vec::new(),
        };

        let mut dropped = 0usize;
        for i in 0..df.height() {
            let row = (
                snp[i].as_deref(),
                a1[i].as_deref(),
                a2[i].as_deref(),
                freq[i],
                beta[i],
                se[i],
                n[i],
            );
            let (Some(snp), Some(a1), Some(a2), Some(f), Some(b), Some(se), Some(n)) = row else {
                dropped += 1;
                continue;
            };
            if !f.is_finite() || !b.is_finite() || !se.is_finite() || se <= 0.0 || n <= 0.0 {
                dropped += 1;
                continue;
            }
            pheno.snp_name.push(snp.to_string());
            pheno.allele1.push(a1.to_uppercase());
            pheno.allele2.push(a2.to_uppercase());
            pheno.freq.push(f);
            pheno.beta.push(b);
            pheno.se.push(se);
            pheno.pval.push(stats::pchisq((b / se) * (b / se)));
            pheno.n.push(n);
        }

        if dropped > 0 {
            println!(
                "[{}] Dropped {} rows with missing or unusable values",
                pheno.name, dropped
            );
        }
        anyhow::ensure!(
            !pheno.snp_name.is_empty(),
            "sumstats '{}' contained no usable rows",
            path
        );

        println!(
            "[{}] Read {} SNPs; trait variance estimated as {:.6}",
            pheno.name,
            pheno.snp_name.len(),
            pheno.variance()
        );
        Ok(pheno)
    }

    pub fn len(&self) -> usize {
        self.snp_name.len()
    }

    /// Trait variance Vp, the median over SNPs of 2f(1−f)·(N·SE² + β²).
    pub fn variance(&self) -> f64 {
        let per_snp: Vec<f64> = (0..self.len())
            .map(|i| {
                let msx = 2.0 * self.freq[i] * (1.0 - self.freq[i]);
                msx * (self.n[i] * self.se[i] * self.se[i] + self.beta[i] * self.beta[i])
            })
            .collect();
        stats::median(&per_snp)
    }
}

fn file_stem(path: &str) -> String {
    std::path::Path::new(path)
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| path.to_string())
}

/// Rename header columns to their canonical names, case-insensitively.
fn normalize_columns(df: &mut DataFrame) -> Result<()> {
    let existing: Vec<String> = df
        .get_column_names()
        .iter()
        .map(|s| s.to_string())
        .collect();
    for name in existing {
        let upper = name.to_uppercase();
        if let Some(canonical) = cname_lookup(&upper) {
            if name != canonical {
                df.rename(&name, canonical.into())
                    .with_context(|| format!("renaming column '{}'", name))?;
            }
        }
    }
    Ok(())
}

fn f64_column(df: &DataFrame, name: &str) -> Result<Vec<Option<f64>>> {
    let s = df
        .column(name)
        .with_context(|| format!("column '{}'", name))?
        .cast(&DataType::Float64)
        .with_context(|| format!("casting column '{}' to f64", name))?;
    let ca = s
        .as_materialized_series()
        .f64()
        .with_context(|| format!("column '{}' as f64", name))?;
    Ok(ca.into_iter().collect())
}

fn str_column(df: &DataFrame, name: &str) -> Result<Vec<Option<String>>> {
    let s = df
        .column(name)
        .with_context(|| format!("column '{}'", name))?
        .cast(&DataType::String)
        .with_context(|| format!("casting column '{}' to string", name))?;
    let ca = s
        .as_materialized_series()
        .str()
        .with_context(|| format!("column '{}' as string", name))?;
    Ok(ca.into_iter().map(|o| o.map(|v| v.to_string())).collect())
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
