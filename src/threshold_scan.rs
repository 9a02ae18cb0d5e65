// threshold_scan.rs

use crate::annotations::SampleAnnotations;
use crate::config::ThresholdScanConfig;
use crate::error::{AtlasError, Result};
use crate::gene_filter::select_platform_independent;
use crate::matrix::ExpressionMatrix;
use crate::pca;
use crate::percentile::transform_to_percentile;
use crate::platform::VarianceFractionTable;
use log::{debug, info};
use rayon::prelude::*;
use serde::Serialize;
use statrs::distribution::{ChiSquared, ContinuousCDF};
use std::collections::BTreeMap;

/// Kruskal-Wallis test result.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct KruskalWallis {
    /// Tie-corrected H statistic.
    pub statistic: f64,
    pub p_value: f64,
}

/// Platform separation along each principal component at one threshold.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ThresholdScanRow {
    pub threshold: f64,
    pub n_genes: usize,
    /// One entry per component, `PC1` first.
    pub tests: Vec<KruskalWallis>,
}

/// Kruskal-Wallis H test over `groups`, using average ranks and the usual
/// tie correction. `None` when fewer than two groups have observations.
///
/// When every observation is tied the statistic is 0 with p-value 1.
pub fn kruskal_wallis(groups: &[Vec<f64>]) -> Option<KruskalWallis> {
    let groups: Vec<&Vec<f64>> = groups.iter().filter(|g| !g.is_empty()).collect();
    if groups.len() < 2 {
        return None;
    }
    let mut pooled: Vec<(f64, usize)> = groups
        .iter()
        .enumerate()
        .flat_map(|(gi, g)| g.iter().map(move |&v| (v, gi)))
        .collect();
    pooled.sort_by(|a, b| a.0.total_cmp(&b.0));
    let n = pooled.len() as f64;

    let mut rank_sums = vec![0.0; groups.len()];
    let mut tie_term = 0.0;
    let mut i = 0;
    while i < pooled.len() {
        let mut j = i + 1;
        while j < pooled.len() && pooled[j].0 == pooled[i].0 {
            j += 1;
        }
        let rank = (i + 1 + j) as f64 / 2.0;
        for &(_, gi) in &pooled[i..j] {
            rank_sums[gi] += rank;
        }
        let t = (j - i) as f64;
        tie_term += t * t * t - t;
        i = j;
    }

    let correction = 1.0 - tie_term / (n * n * n - n);
    let df = (groups.len() - 1) as f64;
    if correction <= 0.0 {
        return Some(KruskalWallis {
            statistic: 0.0,
            p_value: 1.0,
        });
    }
    let sum: f64 = groups
        .iter()
        .zip(&rank_sums)
        .map(|(g, r)| r * r / g.len() as f64)
        .sum();
    let statistic = ((12.0 / (n * (n + 1.0)) * sum - 3.0 * (n + 1.0)) / correction).max(0.0);
    let p_value = ChiSquared::new(df)
        .map(|dist| dist.sf(statistic))
        .unwrap_or(f64::NAN);
    Some(KruskalWallis { statistic, p_value })
}

/// For each candidate threshold, keeps the genes at or under it, reduces the
/// percentile-transformed cohort to principal components and tests each
/// component for differences between platforms.
///
/// Thresholds that keep fewer than two genes produce no row.
pub fn scan_thresholds(
    matrix: &ExpressionMatrix,
    annotations: &SampleAnnotations,
    table: &VarianceFractionTable,
    config: &ThresholdScanConfig,
) -> Result<Vec<ThresholdScanRow>> {
    config.validate()?;
    annotations.validate_covers(matrix)?;

    let mut by_platform: BTreeMap<String, Vec<usize>> = BTreeMap::new();
    for (j, platform) in annotations.platforms_for(matrix.sample_ids())?.into_iter().enumerate() {
        by_platform.entry(platform).or_default().push(j);
    }
    if by_platform.len() < 2 {
        return Err(AtlasError::DegenerateCohort(format!(
            "threshold scan needs at least 2 platforms, found {}",
            by_platform.len()
        )));
    }
    let groups: Vec<Vec<usize>> = by_platform.into_values().collect();

    info!(
        "Scanning {} thresholds with {} components over {} platforms...",
        config.thresholds.len(),
        config.n_pca_components,
        groups.len()
    );

    let rows = config
        .thresholds
        .par_iter()
        .map(|&threshold| {
            let genes = select_platform_independent(table, threshold, config.flagged_gene_policy);
            if genes.len() < 2 {
                debug!("Threshold {}: {} gene(s) retained, skipped", threshold, genes.len());
                return Ok(None);
            }
            let percentile = transform_to_percentile(&matrix.select_genes(&genes)?);
            let reduced = pca::fit_transform(&percentile.to_sample_major(), config.n_pca_components)?;
            let scores = reduced.scores.values();
            let tests = scores
                .columns()
                .into_iter()
                .map(|component| {
                    let grouped: Vec<Vec<f64>> = groups
                        .iter()
                        .map(|idx| idx.iter().map(|&j| component[j]).collect())
                        .collect();
                    kruskal_wallis(&grouped).unwrap_or(KruskalWallis {
                        statistic: f64::NAN,
                        p_value: f64::NAN,
                    })
                })
                .collect();
            Ok(Some(ThresholdScanRow {
                threshold,
                n_genes: genes.len(),
                tests,
            }))
        })
        .collect::<Result<Vec<Option<ThresholdScanRow>>>>()?;

    let rows: Vec<ThresholdScanRow> = rows.into_iter().flatten().collect();
    info!("Threshold scan complete: {} rows.", rows.len());
    Ok(rows)
}
