//! Platform-dependence filtering and clustering stability for integrated
//! expression atlases.
//!
//! The pipeline estimates, per gene, how much of its variance is explained by
//! the measurement platform, keeps the platform-independent genes, rank
//! transforms and reduces the cohort, and clusters it. Resampling the cohort
//! (bootstrap or leave-one-dataset-out) and re-running the whole pipeline
//! gives an H-index per cluster measuring how reproducible it is.

pub mod annotations;
pub mod assignment;
pub mod cluster;
pub mod config;
pub mod error;
pub mod gene_filter;
pub mod integrate;
pub mod io;
pub mod matrix;
pub mod mixed_model;
pub mod pca;
pub mod percentile;
pub mod platform;
pub mod resample;
pub mod selection;
pub mod simulate;
pub mod stability;
pub mod threshold_scan;

pub use annotations::{SampleAnnotations, SampleRecord};
pub use assignment::{ClusterAssignment, ResampledClusteringCollection};
pub use config::{
    EstimatorConfig, FilterConfig, FlaggedGenePolicy, MixedModelConfig, ResampleStrategy,
    StabilityConfig, ThresholdScanConfig, WarningPolicy, ATLAS_VARIANCE_THRESHOLD,
    RESAMPLING_VARIANCE_THRESHOLD,
};
pub use error::{AtlasError, Result};
pub use gene_filter::select_platform_independent;
pub use matrix::{ExpressionMatrix, SampleMajorMatrix};
pub use percentile::transform_to_percentile;
pub use platform::{calculate_platform_dependence, GeneFitOutcome, VarianceFractionTable};
pub use resample::{resample_clustering, resample_clustering_until, ClusterStability, StabilityReport};
pub use selection::SampleSelector;
pub use stability::calc_h_index;
