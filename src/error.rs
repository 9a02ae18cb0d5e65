// error.rs

use crate::config::ResampleStrategy;
use std::path::PathBuf;
use thiserror::Error;

/// Errors raised by the atlas pipeline.
///
/// Per-gene model failures (`ModelFit`) are recovered by the platform
/// estimator and reported alongside its results; every other variant aborts
/// the run that produced it.
#[derive(Debug, Error)]
pub enum AtlasError {
    #[error("Input shape error: {0}")]
    InputShape(String),

    #[error("Mixed model fit failed for gene '{gene}': {reason}")]
    ModelFit { gene: String, reason: String },

    #[error("Degenerate cohort in {strategy} iteration {iteration}: {reason}")]
    DegenerateResample {
        iteration: usize,
        strategy: ResampleStrategy,
        reason: String,
    },

    #[error("Degenerate cohort: {0}")]
    DegenerateCohort(String),

    #[error("PCA error: {0}")]
    Pca(String),

    #[error("Clustering error: {0}")]
    Clustering(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Parse error in {path}:{line}: {reason}")]
    Parse {
        path: PathBuf,
        line: usize,
        reason: String,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, AtlasError>;

impl AtlasError {
    /// Re-labels a cohort-level failure with the resampling iteration that hit it.
    pub(crate) fn in_iteration(self, iteration: usize, strategy: ResampleStrategy) -> Self {
        match self {
            AtlasError::DegenerateCohort(reason) => AtlasError::DegenerateResample {
                iteration,
                strategy,
                reason,
            },
            AtlasError::Pca(reason) | AtlasError::Clustering(reason) => {
                AtlasError::DegenerateResample {
                    iteration,
                    strategy,
                    reason,
                }
            }
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cohort_errors_gain_iteration_context() {
        let err = AtlasError::DegenerateCohort("platform 'RNAseq' has 1 sample".into())
            .in_iteration(4, ResampleStrategy::Bootstrap);
        match err {
            AtlasError::DegenerateResample {
                iteration,
                strategy,
                ref reason,
            } => {
                assert_eq!(iteration, 4);
                assert_eq!(strategy, ResampleStrategy::Bootstrap);
                assert!(reason.contains("RNAseq"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(format!(
            "{}",
            AtlasError::DegenerateCohort("x".into()).in_iteration(0, ResampleStrategy::Jackknife)
        )
        .contains("jackknife iteration 0"));
    }

    #[test]
    fn io_errors_pass_through() {
        let err = AtlasError::from(std::io::Error::new(std::io::ErrorKind::NotFound, "gone"))
            .in_iteration(1, ResampleStrategy::Jackknife);
        assert!(matches!(err, AtlasError::Io(_)));
    }
}
