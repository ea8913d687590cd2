/// CLI argument definitions using clap derive macros.
use clap::{Args, Parser, Subcommand};

#[derive(Parser)]
#[command(
    name = "pwcojo",
    about = "Pairwise conditional & joint analysis of GWAS summary statistics",
    version
)]
pub struct Cli {
    /// Number of Rayon threads (global). Defaults to Rayon's internal heuristic.
    #[arg(long, global = true)]
    pub rayon_threads: Option<usize>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Conditional analysis of a single phenotype against a reference panel
    Cond(CondArgs),
    /// Conditional analyses of two phenotypes plus the matched pairwise datasets
    Pair(PairArgs),
}

// ---------------------------------------------------------------------------
// Shared engine knobs
// ---------------------------------------------------------------------------

#[derive(Args)]
pub struct EngineArgs {
    /// PLINK binary reference panel prefix (.bed/.bim/.fam)
    #[arg(long)]
    pub bfile: String,

    /// Output file prefix
    #[arg(long, default_value = "result")]
    pub out: String,

    /// Entry/exit p-value threshold in stepwise selection
    #[arg(long, default_value_t = 5e-8)]
    pub p_cutoff: f64,

    /// Maximum R² of a new SNP on the already-selected SNPs
    #[arg(long, default_value_t = 0.9)]
    pub collinear: f64,

    /// LD window in base pairs; pairs further apart are assumed in complete LE
    #[arg(long, default_value_t = 1e7)]
    pub ld_window: f64,

    /// Maximum number of independent SNPs to select
    #[arg(long, default_value_t = 1e10)]
    pub top_snp: f64,

    /// Maximum |freq_pheno − μ/2| accepted when harmonising alleles
    #[arg(long, default_value_t = 0.2)]
    pub freq_threshold: f64,

    /// Silence warning chatter (progress lines are always printed)
    #[arg(long, default_value_t = false)]
    pub no_verbose: bool,
}

// ---------------------------------------------------------------------------
// cond
// ---------------------------------------------------------------------------

#[derive(Args)]
pub struct CondArgs {
    /// GWAS summary statistics file (TSV with header, optionally .gz)
    #[arg(long)]
    pub sumstats: String,

    /// Phenotype name (defaults to the sumstats file stem)
    #[arg(long)]
    pub name: Option<String>,

    /// File of SNP identifiers to condition on instead of running stepwise
    /// selection (one per line, first token used)
    #[arg(long)]
    pub cond_file: Option<String>,

    /// Also write the joint estimates of the independent set (.jma.cojo)
    #[arg(long, default_value_t = false)]
    pub joint_out: bool,

    #[command(flatten)]
    pub engine: EngineArgs,
}

// ---------------------------------------------------------------------------
// pair
// ---------------------------------------------------------------------------

#[derive(Args)]
pub struct PairArgs {
    /// Summary statistics of the first phenotype
    #[arg(long)]
    pub sumstats1: String,

    /// Summary statistics of the second phenotype
    #[arg(long)]
    pub sumstats2: String,

    /// Name of the first phenotype (defaults to the file stem)
    #[arg(long)]
    pub name1: Option<String>,

    /// Name of the second phenotype (defaults to the file stem)
    #[arg(long)]
    pub name2: Option<String>,

    /// Also write the joint estimates of each independent set (.jma.cojo)
    #[arg(long, default_value_t = false)]
    pub joint_out: bool,

    #[command(flatten)]
    pub engine: EngineArgs,
}
