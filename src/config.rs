// config.rs

use crate::error::{AtlasError, Result};
use serde::Serialize;
use std::fmt;
use std::str::FromStr;

/// Platform-variance threshold used by the resampling pipeline.
pub const RESAMPLING_VARIANCE_THRESHOLD: f64 = 0.145;
/// Platform-variance threshold used when filtering the atlas on its own.
pub const ATLAS_VARIANCE_THRESHOLD: f64 = 0.2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ResampleStrategy {
    /// Draw a same-size cohort with replacement.
    Bootstrap,
    /// Leave one source dataset out per iteration.
    Jackknife,
}

impl fmt::Display for ResampleStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResampleStrategy::Bootstrap => write!(f, "bootstrap"),
            ResampleStrategy::Jackknife => write!(f, "jackknife"),
        }
    }
}

impl FromStr for ResampleStrategy {
    type Err = AtlasError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "bootstrap" => Ok(ResampleStrategy::Bootstrap),
            "jackknife" => Ok(ResampleStrategy::Jackknife),
            other => Err(AtlasError::InvalidConfig(format!(
                "unknown resample strategy '{}' (expected 'bootstrap' or 'jackknife')",
                other
            ))),
        }
    }
}

/// What to do with convergence warnings raised by the mixed-model optimiser.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WarningPolicy {
    /// Record the warning on the result and stay quiet.
    #[default]
    Ignore,
    /// Record the warning and also emit it through `log::warn!`.
    Log,
}

/// Whether genes whose fit carried a convergence warning may pass the gene filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FlaggedGenePolicy {
    #[default]
    Keep,
    Exclude,
}

/// Optimiser settings for the per-gene random-intercept model.
#[derive(Debug, Clone)]
pub struct MixedModelConfig {
    /// Golden-section stops once the bracket on ln(tau^2 / sigma^2) is narrower than this.
    pub tolerance: f64,
    pub max_iterations: usize,
    /// Search interval for ln(tau^2 / sigma^2).
    pub log_ratio_bounds: (f64, f64),
    /// Likelihood spread below which the variance ratio is reported as unidentified.
    pub flat_likelihood_tolerance: f64,
    pub warning_policy: WarningPolicy,
}

impl Default for MixedModelConfig {
    fn default() -> Self {
        Self {
            tolerance: 1e-6,
            max_iterations: 200,
            log_ratio_bounds: (-12.0, 8.0),
            flat_likelihood_tolerance: 1e-8,
            warning_policy: WarningPolicy::Ignore,
        }
    }
}

impl MixedModelConfig {
    pub fn validate(&self) -> Result<()> {
        let (lo, hi) = self.log_ratio_bounds;
        if !(lo.is_finite() && hi.is_finite() && lo < hi) {
            return Err(AtlasError::InvalidConfig(format!(
                "log_ratio_bounds must be finite with lower < upper, got ({}, {})",
                lo, hi
            )));
        }
        if !(self.tolerance > 0.0) {
            return Err(AtlasError::InvalidConfig("tolerance must be > 0".into()));
        }
        if self.max_iterations == 0 {
            return Err(AtlasError::InvalidConfig("max_iterations must be > 0".into()));
        }
        Ok(())
    }
}

/// Settings shared by every call to the platform-variance estimator.
#[derive(Debug, Clone)]
pub struct EstimatorConfig {
    pub mixed_model: MixedModelConfig,
    /// Every platform level present in a cohort needs at least this many observations.
    pub min_samples_per_platform: usize,
    pub show_progress: bool,
}

impl Default for EstimatorConfig {
    fn default() -> Self {
        Self {
            mixed_model: MixedModelConfig::default(),
            min_samples_per_platform: 2,
            show_progress: false,
        }
    }
}

/// Standalone atlas gene filtering.
#[derive(Debug, Clone)]
pub struct FilterConfig {
    pub threshold: f64,
    pub flagged_gene_policy: FlaggedGenePolicy,
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            threshold: ATLAS_VARIANCE_THRESHOLD,
            flagged_gene_policy: FlaggedGenePolicy::Keep,
        }
    }
}

/// Configuration of a resampling stability run.
#[derive(Debug, Clone)]
pub struct StabilityConfig {
    pub resample_strategy: ResampleStrategy,
    /// Bootstrap iteration count; ignored by the jackknife.
    pub n_resamples: usize,
    pub n_clusters_list: Vec<usize>,
    pub platform_variance_threshold: f64,
    pub n_pca_components: usize,
    /// Bootstrap seed. A random seed is drawn (and logged) when `None`.
    pub seed: Option<u64>,
    pub flagged_gene_policy: FlaggedGenePolicy,
    /// Run resampling iterations concurrently (results are still merged in iteration order).
    pub parallel_iterations: bool,
    pub estimator: EstimatorConfig,
}

impl Default for StabilityConfig {
    fn default() -> Self {
        Self {
            resample_strategy: ResampleStrategy::Jackknife,
            n_resamples: 10,
            n_clusters_list: vec![3, 4],
            platform_variance_threshold: RESAMPLING_VARIANCE_THRESHOLD,
            n_pca_components: 3,
            seed: None,
            flagged_gene_policy: FlaggedGenePolicy::Keep,
            parallel_iterations: false,
            estimator: EstimatorConfig::default(),
        }
    }
}

impl StabilityConfig {
    pub fn validate(&self) -> Result<()> {
        if self.resample_strategy == ResampleStrategy::Bootstrap && self.n_resamples == 0 {
            return Err(AtlasError::InvalidConfig(
                "n_resamples must be a positive integer for bootstrap resampling".into(),
            ));
        }
        if self.n_clusters_list.is_empty() {
            return Err(AtlasError::InvalidConfig("n_clusters_list must not be empty".into()));
        }
        if let Some(&k) = self.n_clusters_list.iter().find(|&&k| k < 2) {
            return Err(AtlasError::InvalidConfig(format!(
                "cluster counts must be >= 2, got {}",
                k
            )));
        }
        validate_threshold(self.platform_variance_threshold)?;
        if self.n_pca_components == 0 {
            return Err(AtlasError::InvalidConfig("n_pca_components must be > 0".into()));
        }
        if self.estimator.min_samples_per_platform == 0 {
            return Err(AtlasError::InvalidConfig(
                "min_samples_per_platform must be > 0".into(),
            ));
        }
        self.estimator.mixed_model.validate()
    }
}

/// Exploratory scan over candidate platform-variance thresholds.
#[derive(Debug, Clone)]
pub struct ThresholdScanConfig {
    pub thresholds: Vec<f64>,
    pub n_pca_components: usize,
    pub flagged_gene_policy: FlaggedGenePolicy,
}

impl Default for ThresholdScanConfig {
    fn default() -> Self {
        // 0.04, 0.05, ..., 1.00
        let thresholds = (4..=100).map(|i| i as f64 / 100.0).collect();
        Self {
            thresholds,
            n_pca_components: 10,
            flagged_gene_policy: FlaggedGenePolicy::Keep,
        }
    }
}

impl ThresholdScanConfig {
    pub fn validate(&self) -> Result<()> {
        if self.thresholds.is_empty() {
            return Err(AtlasError::InvalidConfig("no thresholds to scan".into()));
        }
        for &t in &self.thresholds {
            validate_threshold(t)?;
        }
        if self.n_pca_components == 0 {
            return Err(AtlasError::InvalidConfig("n_pca_components must be > 0".into()));
        }
        Ok(())
    }
}

pub fn validate_threshold(threshold: f64) -> Result<()> {
    if !(0.0..=1.0).contains(&threshold) {
        return Err(AtlasError::InvalidConfig(format!(
            "platform variance threshold must lie in [0, 1], got {}",
            threshold
        )));
    }
    Ok(())
}
