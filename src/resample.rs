// resample.rs

use crate::annotations::SampleAnnotations;
use crate::assignment::{ClusterAssignment, ResampledClusteringCollection};
use crate::cluster::ward;
use crate::config::{ResampleStrategy, StabilityConfig};
use crate::error::{AtlasError, Result};
use crate::gene_filter::select_platform_independent;
use crate::matrix::ExpressionMatrix;
use crate::pca;
use crate::percentile::transform_to_percentile;
use crate::platform::calculate_platform_dependence;
use crate::stability::calc_h_index;
use log::{debug, info, warn};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rayon::prelude::*;
use serde::Serialize;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};

/// Stability of one requested cluster count.
#[derive(Debug, Clone, Serialize)]
pub struct ClusterStability {
    pub n_clusters: usize,
    /// H-index per base cluster, in base first-appearance label order.
    pub scores: Vec<f64>,
    pub collection: ResampledClusteringCollection,
}

#[derive(Debug, Clone, Serialize)]
pub struct StabilityReport {
    pub strategy: ResampleStrategy,
    /// Seed the bootstrap cohorts were drawn with.
    pub seed: Option<u64>,
    /// Resampling iterations merged into the collections. Lower than planned
    /// only when the run was interrupted.
    pub completed_iterations: usize,
    pub planned_iterations: usize,
    pub per_k: Vec<ClusterStability>,
    /// Genes that passed the filter; index 0 is the full cohort.
    pub retained_genes: Vec<Vec<String>>,
}

impl StabilityReport {
    pub fn stability_for(&self, n_clusters: usize) -> Option<&ClusterStability> {
        self.per_k.iter().find(|s| s.n_clusters == n_clusters)
    }

    pub fn interrupted(&self) -> bool {
        self.completed_iterations < self.planned_iterations
    }
}

/// Everything kept from one pass of the pipeline over a cohort.
struct PipelineOutcome {
    retained_genes: Vec<String>,
    /// One assignment per requested cluster count, in config order.
    assignments: Vec<ClusterAssignment>,
}

/// Clusters the full cohort, then re-runs the whole pipeline on every
/// resampled cohort and scores how well each base cluster is reproduced.
pub fn resample_clustering(
    matrix: &ExpressionMatrix,
    annotations: &SampleAnnotations,
    config: &StabilityConfig,
) -> Result<StabilityReport> {
    resample_clustering_until(matrix, annotations, config, &AtomicBool::new(false))
}

/// Like [`resample_clustering`], but checks `stop` before every iteration.
///
/// Once `stop` is set no further iteration starts; the report covers the
/// iterations completed so far.
pub fn resample_clustering_until(
    matrix: &ExpressionMatrix,
    annotations: &SampleAnnotations,
    config: &StabilityConfig,
    stop: &AtomicBool,
) -> Result<StabilityReport> {
    config.validate()?;
    annotations.validate_covers(matrix)?;
    if matrix.n_samples() == 0 {
        return Err(AtlasError::InputShape("expression matrix has no samples".into()));
    }
    let strategy = config.resample_strategy;

    let (cohorts, seed) = plan_cohorts(matrix, annotations, config)?;
    info!(
        "Base run on {} samples x {} genes; {} {} iterations planned.",
        matrix.n_samples(),
        matrix.n_genes(),
        cohorts.len(),
        strategy
    );

    let base = run_pipeline(matrix, annotations, config)?;
    info!(
        "Base run: {} genes retained at threshold {}.",
        base.retained_genes.len(),
        config.platform_variance_threshold
    );

    let run_iteration = |idx: usize, cohort: &[String]| -> Option<Result<PipelineOutcome>> {
        if stop.load(Ordering::Relaxed) {
            return None;
        }
        let iteration = idx + 1;
        if cohort.is_empty() {
            return Some(Err(AtlasError::DegenerateResample {
                iteration,
                strategy,
                reason: "resampled cohort is empty".into(),
            }));
        }
        let outcome = matrix
            .select_samples(cohort)
            .and_then(|sub| run_pipeline(&sub, annotations, config))
            .map_err(|e| e.in_iteration(iteration, strategy));
        if let Ok(o) = &outcome {
            info!(
                "{} iteration {}/{}: cohort of {} samples, {} genes retained.",
                strategy,
                iteration,
                cohorts.len(),
                cohort.len(),
                o.retained_genes.len()
            );
        }
        Some(outcome)
    };

    let results: Vec<Option<Result<PipelineOutcome>>> = if config.parallel_iterations {
        cohorts
            .par_iter()
            .enumerate()
            .map(|(i, c)| run_iteration(i, c))
            .collect()
    } else {
        let mut results = Vec::with_capacity(cohorts.len());
        for (i, c) in cohorts.iter().enumerate() {
            let r = run_iteration(i, c);
            let halt = matches!(r, None | Some(Err(_)));
            results.push(r);
            if halt {
                break;
            }
        }
        results
    };

    let mut collections: Vec<ResampledClusteringCollection> = base
        .assignments
        .into_iter()
        .map(ResampledClusteringCollection::new)
        .collect();
    let mut retained_genes = vec![base.retained_genes];
    let mut completed = 0;
    for result in results {
        let outcome = match result {
            Some(r) => r?,
            None => break,
        };
        for (collection, assignment) in collections.iter_mut().zip(outcome.assignments) {
            collection.push(assignment);
        }
        retained_genes.push(outcome.retained_genes);
        completed += 1;
    }
    if completed < cohorts.len() {
        warn!(
            "Resampling interrupted after {} of {} iterations; scoring the completed ones.",
            completed,
            cohorts.len()
        );
    }

    let mut per_k = Vec::with_capacity(collections.len());
    for (&n_clusters, collection) in config.n_clusters_list.iter().zip(collections) {
        let scores = if collection.n_resamples() > 0 {
            calc_h_index(&collection)?
        } else {
            Vec::new()
        };
        info!("k = {}: H-index per cluster {:?}", n_clusters, scores);
        per_k.push(ClusterStability {
            n_clusters,
            scores,
            collection,
        });
    }

    Ok(StabilityReport {
        strategy,
        seed,
        completed_iterations: completed,
        planned_iterations: cohorts.len(),
        per_k,
        retained_genes,
    })
}

/// Estimator -> filter -> percentile -> PCA -> Ward for every requested k.
fn run_pipeline(
    matrix: &ExpressionMatrix,
    annotations: &SampleAnnotations,
    config: &StabilityConfig,
) -> Result<PipelineOutcome> {
    let table = calculate_platform_dependence(matrix, annotations, &config.estimator)?;
    let retained_genes = select_platform_independent(
        &table,
        config.platform_variance_threshold,
        config.flagged_gene_policy,
    );
    drop(table);
    if retained_genes.is_empty() {
        return Err(AtlasError::DegenerateCohort(format!(
            "no gene has a platform variance fraction <= {}",
            config.platform_variance_threshold
        )));
    }

    let percentile = transform_to_percentile(&matrix.select_genes(&retained_genes)?);
    let reduced = pca::fit_transform(&percentile.to_sample_major(), config.n_pca_components)?;
    drop(percentile);

    let assignments = config
        .n_clusters_list
        .iter()
        .map(|&k| {
            let labels = ward(&reduced.scores, k)?;
            Ok(ClusterAssignment::from_labels(reduced.scores.row_ids(), &labels))
        })
        .collect::<Result<Vec<_>>>()?;

    Ok(PipelineOutcome {
        retained_genes,
        assignments,
    })
}

/// Sample cohorts of every iteration, drawn before any of them runs.
fn plan_cohorts(
    matrix: &ExpressionMatrix,
    annotations: &SampleAnnotations,
    config: &StabilityConfig,
) -> Result<(Vec<Vec<String>>, Option<u64>)> {
    let samples = matrix.sample_ids();
    match config.resample_strategy {
        ResampleStrategy::Bootstrap => {
            let seed = config.seed.unwrap_or_else(|| rand::rng().random());
            info!("Bootstrap seed: {}", seed);
            let mut rng = ChaCha8Rng::seed_from_u64(seed);
            let n = samples.len();
            let cohorts = (0..config.n_resamples)
                .map(|_| {
                    (0..n)
                        .map(|_| samples[rng.random_range(0..n)].clone())
                        .collect()
                })
                .collect();
            Ok((cohorts, Some(seed)))
        }
        ResampleStrategy::Jackknife => {
            annotations.validate_datasets()?;
            let in_matrix: HashSet<&str> = samples.iter().map(String::as_str).collect();
            let datasets: Vec<String> = annotations
                .datasets_in_order()
                .into_iter()
                .filter(|d| {
                    annotations.records().iter().any(|r| {
                        r.dataset.as_deref() == Some(d.as_str()) && in_matrix.contains(r.sample_id.as_str())
                    })
                })
                .collect();
            debug!("Jackknife order: {:?}", datasets);
            let cohorts = datasets
                .iter()
                .map(|d| {
                    samples
                        .iter()
                        .filter(|s| {
                            annotations
                                .get(s)
                                .is_some_and(|r| r.dataset.as_deref() != Some(d.as_str()))
                        })
                        .cloned()
                        .collect()
                })
                .collect();
            Ok((cohorts, None))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::annotations::SampleRecord;
    use ndarray::Array2;
    use rand_distr::{Distribution, Normal};

    /// Three platforms x `per_platform` samples; two biological groups carried
    /// by `n_bio` genes, plus `n_platform` genes that only track the platform.
    fn cohort(
        per_platform: usize,
        n_bio: usize,
        n_platform: usize,
        datasets: &[&str],
    ) -> (ExpressionMatrix, SampleAnnotations) {
        let platforms = ["Affy", "Illumina", "RNAseq"];
        let mut rng = ChaCha8Rng::seed_from_u64(11);
        let noise = Normal::new(0.0, 0.3).unwrap();
        let n = platforms.len() * per_platform;
        let mut sample_ids = Vec::with_capacity(n);
        let mut records = Vec::with_capacity(n);
        for (p, platform) in platforms.iter().enumerate() {
            for i in 0..per_platform {
                let id = format!("{platform}_{i}");
                records.push(SampleRecord::new(
                    id.clone(),
                    *platform,
                    Some(datasets[p % datasets.len()].to_string()),
                ));
                sample_ids.push(id);
            }
        }
        let values = Array2::from_shape_fn((n_bio + n_platform, n), |(g, j)| {
            let platform = (j / per_platform) as f64;
            let group = ((j % per_platform) % 2) as f64;
            if g < n_bio {
                4.0 + 3.0 * group * if g % 2 == 0 { 1.0 } else { -1.0 } + noise.sample(&mut rng)
            } else {
                2.0 + 6.0 * platform + 0.05 * noise.sample(&mut rng)
            }
        });
        let genes = (0..n_bio + n_platform).map(|g| format!("gene{g}")).collect();
        (
            ExpressionMatrix::new(genes, sample_ids, values).unwrap(),
            SampleAnnotations::new(records).unwrap(),
        )
    }

    fn config(strategy: ResampleStrategy) -> StabilityConfig {
        StabilityConfig {
            resample_strategy: strategy,
            n_resamples: 4,
            n_clusters_list: vec![2, 3],
            seed: Some(5),
            ..Default::default()
        }
    }

    #[test]
    fn jackknife_runs_once_per_dataset() {
        let (m, ann) = cohort(8, 6, 2, &["GSE1", "GSE2", "GSE3"]);
        let report = resample_clustering(&m, &ann, &config(ResampleStrategy::Jackknife)).unwrap();
        assert_eq!(report.completed_iterations, 3);
        assert_eq!(report.retained_genes.len(), 4);
        assert_eq!(report.per_k.len(), 2);
        let k2 = report.stability_for(2).unwrap();
        assert_eq!(k2.collection.n_resamples(), 3);
        assert_eq!(k2.scores.len(), 2);
        // the first dataset is left out of the first column
        assert!(!k2.collection.resamples[0].contains("Affy_0"));
        assert_eq!(k2.collection.resamples[0].distinct_samples(), 16);
        assert!(report.retained_genes[0].iter().all(|g| g != "gene6" && g != "gene7"));
    }

    #[test]
    fn bootstrap_runs_n_resamples_and_keeps_partial_coverage() {
        let (m, ann) = cohort(8, 6, 2, &["only"]);
        let cfg = config(ResampleStrategy::Bootstrap);
        let report = resample_clustering(&m, &ann, &cfg).unwrap();
        assert_eq!(report.completed_iterations, 4);
        assert_eq!(report.seed, Some(5));

        let (cohorts, _) = plan_cohorts(&m, &ann, &cfg).unwrap();
        let k3 = report.stability_for(3).unwrap();
        for (column, cohort) in k3.collection.resamples.iter().zip(&cohorts) {
            let drawn: HashSet<&String> = cohort.iter().collect();
            assert_eq!(column.len(), cohort.len());
            assert_eq!(column.distinct_samples(), drawn.len());
            for s in m.sample_ids() {
                assert_eq!(column.contains(s), drawn.contains(s));
            }
        }
        for score in k3.scores.iter() {
            assert!((0.0..1.0).contains(score));
        }
    }

    #[test]
    fn seeded_bootstrap_is_reproducible() {
        let (m, ann) = cohort(4, 2, 1, &["only"]);
        let cfg = config(ResampleStrategy::Bootstrap);
        let (a, _) = plan_cohorts(&m, &ann, &cfg).unwrap();
        let (b, _) = plan_cohorts(&m, &ann, &cfg).unwrap();
        assert_eq!(a, b);
        assert!(a.iter().all(|c| c.len() == m.n_samples()));
    }

    #[test]
    fn parallel_iterations_match_sequential() {
        let (m, ann) = cohort(6, 4, 2, &["GSE1", "GSE2", "GSE3"]);
        let seq = resample_clustering(&m, &ann, &config(ResampleStrategy::Jackknife)).unwrap();
        let par = resample_clustering(
            &m,
            &ann,
            &StabilityConfig {
                parallel_iterations: true,
                ..config(ResampleStrategy::Jackknife)
            },
        )
        .unwrap();
        assert_eq!(seq.retained_genes, par.retained_genes);
        for (a, b) in seq.per_k.iter().zip(&par.per_k) {
            assert_eq!(a.collection, b.collection);
            assert_eq!(a.scores, b.scores);
        }
    }

    #[test]
    fn losing_a_whole_platform_is_a_degenerate_resample() {
        // each platform is its own dataset, so the jackknife drops a platform
        // entirely; with one sample left on another platform the fit cannot run
        let (m, ann) = cohort(2, 3, 1, &["GSE1", "GSE2", "GSE3"]);
        let cfg = StabilityConfig {
            estimator: crate::config::EstimatorConfig {
                min_samples_per_platform: 3,
                ..Default::default()
            },
            ..config(ResampleStrategy::Jackknife)
        };
        let err = resample_clustering(&m, &ann, &cfg).unwrap_err();
        // the base cohort already fails the per-platform minimum
        assert!(matches!(err, AtlasError::DegenerateCohort(_)));

        let single = cohort(4, 3, 1, &["GSE1"]);
        let err = resample_clustering(&single.0, &single.1, &config(ResampleStrategy::Jackknife)).unwrap_err();
        match err {
            AtlasError::DegenerateResample {
                iteration, strategy, ..
            } => {
                assert_eq!(iteration, 1);
                assert_eq!(strategy, ResampleStrategy::Jackknife);
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn stop_flag_before_start_scores_nothing() {
        let (m, ann) = cohort(6, 4, 2, &["GSE1", "GSE2", "GSE3"]);
        let stop = AtomicBool::new(true);
        let report = resample_clustering_until(&m, &ann, &config(ResampleStrategy::Jackknife), &stop).unwrap();
        assert_eq!(report.completed_iterations, 0);
        assert!(report.interrupted());
        assert_eq!(report.retained_genes.len(), 1);
        assert!(report.per_k.iter().all(|k| k.scores.is_empty()));
    }

    #[test]
    fn jackknife_needs_dataset_annotations() {
        let (m, _) = cohort(4, 3, 1, &["GSE1"]);
        let records = m
            .sample_ids()
            .iter()
            .enumerate()
            .map(|(j, s)| SampleRecord::new(s.clone(), ["Affy", "Illumina", "RNAseq"][j / 4], None))
            .collect();
        let ann = SampleAnnotations::new(records).unwrap();
        let err = resample_clustering(&m, &ann, &config(ResampleStrategy::Jackknife)).unwrap_err();
        assert!(matches!(err, AtlasError::InputShape(_)));
    }
}
