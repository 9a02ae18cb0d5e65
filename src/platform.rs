// platform.rs

use crate::annotations::SampleAnnotations;
use crate::config::{EstimatorConfig, WarningPolicy};
use crate::error::{AtlasError, Result};
use crate::matrix::ExpressionMatrix;
use crate::mixed_model::{fit_random_intercept, ConvergenceWarning, RandomInterceptDesign};
use indicatif::{ProgressBar, ProgressStyle};
use log::{debug, info, warn};
use rayon::prelude::*;

/// Outcome of the per-gene platform model.
#[derive(Debug, Clone, PartialEq)]
pub enum GeneFitOutcome {
    Fitted {
        fraction: f64,
        warning: Option<ConvergenceWarning>,
    },
    Failed {
        reason: String,
    },
}

/// Fraction of fitted variance attributable to platform, per gene.
///
/// Values can leave `[0, 1]` slightly on unstable fits; they are kept as is.
#[derive(Debug, Clone, Default)]
pub struct VarianceFractionTable {
    genes: Vec<String>,
    outcomes: Vec<GeneFitOutcome>,
}

impl VarianceFractionTable {
    pub fn from_outcomes(genes: Vec<String>, outcomes: Vec<GeneFitOutcome>) -> Result<Self> {
        if genes.len() != outcomes.len() {
            return Err(AtlasError::InputShape(format!(
                "{} genes but {} fit outcomes",
                genes.len(),
                outcomes.len()
            )));
        }
        Ok(Self { genes, outcomes })
    }

    pub fn len(&self) -> usize {
        self.genes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.genes.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &GeneFitOutcome)> {
        self.genes.iter().map(String::as_str).zip(self.outcomes.iter())
    }

    pub fn fraction(&self, gene: &str) -> Option<f64> {
        self.iter().find(|(g, _)| *g == gene).and_then(|(_, o)| match o {
            GeneFitOutcome::Fitted { fraction, .. } => Some(*fraction),
            GeneFitOutcome::Failed { .. } => None,
        })
    }

    /// Genes with a usable fraction, in input order.
    pub fn fractions(&self) -> impl Iterator<Item = (&str, f64)> {
        self.iter().filter_map(|(g, o)| match o {
            GeneFitOutcome::Fitted { fraction, .. } => Some((g, *fraction)),
            GeneFitOutcome::Failed { .. } => None,
        })
    }

    pub fn warnings(&self) -> impl Iterator<Item = (&str, ConvergenceWarning)> {
        self.iter().filter_map(|(g, o)| match o {
            GeneFitOutcome::Fitted {
                warning: Some(w), ..
            } => Some((g, *w)),
            _ => None,
        })
    }

    /// Genes whose model produced nothing usable, as flagged errors.
    pub fn failures(&self) -> Vec<AtlasError> {
        self.iter()
            .filter_map(|(g, o)| match o {
                GeneFitOutcome::Failed { reason } => Some(AtlasError::ModelFit {
                    gene: g.to_string(),
                    reason: reason.clone(),
                }),
                GeneFitOutcome::Fitted { .. } => None,
            })
            .collect()
    }
}

/// Checks that a cohort can support one model per gene: more observations than
/// platform levels, and every level seen at least `min_per_platform` times.
pub fn check_cohort(platforms: &[String], min_per_platform: usize) -> Result<()> {
    let design = RandomInterceptDesign::categorical(platforms);
    if design.n_obs() < 2 {
        return Err(AtlasError::DegenerateCohort(format!(
            "cohort has {} observation(s)",
            design.n_obs()
        )));
    }
    if design.n_obs() <= design.n_fixed() {
        return Err(AtlasError::DegenerateCohort(format!(
            "{} observations cannot support {} platform levels",
            design.n_obs(),
            design.levels().len()
        )));
    }
    if let Some((level, &size)) = design
        .levels()
        .iter()
        .zip(design.group_sizes())
        .find(|(_, &size)| size < min_per_platform)
    {
        return Err(AtlasError::DegenerateCohort(format!(
            "platform '{}' has {} sample(s), need at least {}",
            level, size, min_per_platform
        )));
    }
    Ok(())
}

/// Fits `expression ~ platform` with a platform random intercept for every gene
/// and returns the platform share of the fitted variance.
///
/// Genes are independent and fitted in parallel. A gene whose fit fails is
/// reported in the table instead of aborting the run.
pub fn calculate_platform_dependence(
    matrix: &ExpressionMatrix,
    annotations: &SampleAnnotations,
    config: &EstimatorConfig,
) -> Result<VarianceFractionTable> {
    annotations.validate_covers(matrix)?;
    config.mixed_model.validate()?;
    let platforms = annotations.platforms_for(matrix.sample_ids())?;
    check_cohort(&platforms, config.min_samples_per_platform)?;

    let design = RandomInterceptDesign::categorical(&platforms);
    debug!(
        "Platform model: {} observations, levels {:?} with sizes {:?}",
        design.n_obs(),
        design.levels(),
        design.group_sizes()
    );
    info!(
        "Estimating platform dependence for {} genes across {} samples...",
        matrix.n_genes(),
        matrix.n_samples()
    );

    let pb = if config.show_progress {
        let style = ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} genes ({percent}%) ETA: {eta}")
            .map_err(|e| AtlasError::InvalidConfig(format!("progress bar style: {}", e)))?
            .progress_chars("=> ");
        ProgressBar::new(matrix.n_genes() as u64).with_style(style)
    } else {
        ProgressBar::hidden()
    };

    let outcomes: Vec<GeneFitOutcome> = (0..matrix.n_genes())
        .into_par_iter()
        .map(|gene_idx| {
            let outcome = match fit_random_intercept(&design, matrix.gene_row(gene_idx), &config.mixed_model) {
                Ok(fit) => match fit.variance_fraction() {
                    Some(fraction) => GeneFitOutcome::Fitted {
                        fraction,
                        warning: fit.warning,
                    },
                    None => GeneFitOutcome::Failed {
                        reason: "fitted and residual variances are both zero".into(),
                    },
                },
                Err(failure) => GeneFitOutcome::Failed {
                    reason: failure.to_string(),
                },
            };
            pb.inc(1);
            outcome
        })
        .collect();
    pb.finish_and_clear();

    let table = VarianceFractionTable::from_outcomes(matrix.gene_ids().to_vec(), outcomes)?;

    let n_warned = table.warnings().count();
    if n_warned > 0 {
        match config.mixed_model.warning_policy {
            WarningPolicy::Ignore => debug!("{} gene fit(s) carried convergence warnings", n_warned),
            WarningPolicy::Log => {
                for (gene, w) in table.warnings() {
                    warn!("Convergence warning for gene '{}': {}", gene, w);
                }
            }
        }
    }
    let failures = table.failures();
    for failure in failures.iter().take(10) {
        warn!("{}", failure);
    }
    if failures.len() > 10 {
        warn!("... and {} more failed gene fits", failures.len() - 10);
    }
    info!(
        "Platform dependence estimated: {} usable, {} failed.",
        table.len() - failures.len(),
        failures.len()
    );
    Ok(table)
}
