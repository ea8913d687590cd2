/// Typed failures of the conditional-analysis engine.
///
/// Collinearity during stepwise insertion is handled locally (the candidate
/// is dropped and the next best tried) and never surfaces here; everything
/// below aborts the current analysis but not sibling analyses in a batch.
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CojoError {
    #[error("no phenotype SNPs could be matched to the reference panel")]
    NoOverlap,

    #[error("cannot access '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("no SNPs were selected by stepwise selection (the top SNP did not reach the p-value cutoff)")]
    EmptySignalSet,

    #[error(
        "{selected} SNPs selected but the reference panel has only {individuals} individuals; \
         the joint model is rank-deficient — tighten the p-value cutoff"
    )]
    TooManySignals { selected: usize, individuals: usize },

    #[error("the supplied SNP set has a collinearity problem and cannot be jointly fitted")]
    CollinearInit,

    #[error("model is over-fitting (no residual degrees of freedom); tighten the p-value cutoff")]
    OverFit,

    #[error("residual variance fell below zero (over-fitting); tighten the p-value cutoff")]
    ResidualOutOfBounds,
}

impl CojoError {
    /// Shorthand for wrapping an I/O failure with the offending path.
    pub fn io(path: impl Into<String>, source: std::io::Error) -> Self {
        CojoError::Io {
            path: path.into(),
            source,
        }
    }
}

pub type Result<T> = std::result::Result<T, CojoError>;
