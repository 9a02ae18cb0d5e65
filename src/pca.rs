// pca.rs

use crate::error::{AtlasError, Result};
use crate::matrix::SampleMajorMatrix;
use log::{debug, warn};
use ndarray::{Array1, Array2, Axis};
use ndarray_linalg::{Eigh, UPLO};

/// Principal component scores of a sample-major matrix.
#[derive(Debug, Clone)]
pub struct PcaResult {
    /// Samples x components, feature ids `PC1..PCk`.
    pub scores: SampleMajorMatrix,
    /// Component variances (covariance eigenvalues), largest first.
    pub explained_variance: Vec<f64>,
    /// Features x components, unit-length columns.
    pub loadings: Array2<f64>,
}

/// Exact PCA: column-centred (not scaled) data, full symmetric eigen
/// decomposition of the covariance matrix, or of the Gram matrix when there are
/// more features than samples.
///
/// Components are sign-normalised so the largest-magnitude loading is positive.
/// The component count is capped at `min(n_samples - 1, n_features)`.
pub fn fit_transform(data: &SampleMajorMatrix, n_components: usize) -> Result<PcaResult> {
    let n_samples = data.n_rows();
    let n_features = data.n_features();
    if n_components == 0 {
        return Err(AtlasError::Pca("number of components must be > 0".into()));
    }
    if n_samples < 2 {
        return Err(AtlasError::Pca(format!("PCA requires at least 2 samples, found {}", n_samples)));
    }
    if n_features == 0 {
        return Err(AtlasError::Pca("PCA requires at least 1 feature, found 0".into()));
    }
    if data.values().iter().any(|v| !v.is_finite()) {
        return Err(AtlasError::Pca("input contains non-finite values".into()));
    }

    let max_k = (n_samples - 1).min(n_features);
    let k = if n_components > max_k {
        warn!(
            "Requested {} components exceeds max possible ({}), adjusting to {}.",
            n_components, max_k, max_k
        );
        max_k
    } else {
        n_components
    };

    let mean = data
        .values()
        .mean_axis(Axis(0))
        .ok_or_else(|| AtlasError::Pca("failed to compute feature means".into()))?;
    let centered = data.values() - &mean;
    let denom = (n_samples - 1) as f64;

    let (eigenvalues, mut loadings) = if n_features <= n_samples {
        let cov = centered.t().dot(&centered) / denom;
        let (vals, vecs) = cov
            .eigh(UPLO::Upper)
            .map_err(|e| AtlasError::Pca(format!("eigen decomposition of covariance matrix failed: {}", e)))?;
        let order = descending_order(&vals);
        let mut loadings = Array2::<f64>::zeros((n_features, k));
        let mut eigenvalues = Vec::with_capacity(k);
        for (c, &idx) in order.iter().take(k).enumerate() {
            loadings.column_mut(c).assign(&vecs.column(idx));
            eigenvalues.push(vals[idx].max(0.0));
        }
        (eigenvalues, loadings)
    } else {
        // Gram trick: eigenvectors u of X X' / (n-1) map to axes X' u.
        let gram = centered.dot(&centered.t()) / denom;
        let (vals, vecs) = gram
            .eigh(UPLO::Upper)
            .map_err(|e| AtlasError::Pca(format!("eigen decomposition of Gram matrix failed: {}", e)))?;
        let order = descending_order(&vals);
        let mut loadings = Array2::<f64>::zeros((n_features, k));
        let mut eigenvalues = Vec::with_capacity(k);
        for (c, &idx) in order.iter().take(k).enumerate() {
            let mut axis = centered.t().dot(&vecs.column(idx));
            let norm = axis.dot(&axis).sqrt();
            if norm > 1e-12 {
                axis /= norm;
            } else {
                axis.fill(0.0);
            }
            loadings.column_mut(c).assign(&axis);
            eigenvalues.push(vals[idx].max(0.0));
        }
        (eigenvalues, loadings)
    };

    for mut column in loadings.columns_mut() {
        let pivot = column
            .iter()
            .copied()
            .fold(0.0_f64, |best, v| if v.abs() > best.abs() { v } else { best });
        if pivot < 0.0 {
            column.mapv_inplace(|v| -v);
        }
    }

    let scores = centered.dot(&loadings);
    debug!(
        "PCA on {}x{} matrix: component variances {:?}",
        n_samples,
        n_features,
        &eigenvalues[..eigenvalues.len().min(10)]
    );

    let component_ids = (1..=k).map(|i| format!("PC{}", i)).collect();
    Ok(PcaResult {
        scores: SampleMajorMatrix::new(data.row_ids().to_vec(), component_ids, scores)?,
        explained_variance: eigenvalues,
        loadings,
    })
}

fn descending_order(vals: &Array1<f64>) -> Vec<usize> {
    let mut order: Vec<usize> = (0..vals.len()).collect();
    order.sort_by(|&a, &b| vals[b].total_cmp(&vals[a]));
    order
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    fn sm(values: Array2<f64>) -> SampleMajorMatrix {
        let rows = (0..values.nrows()).map(|i| format!("s{i}")).collect();
        let cols = (0..values.ncols()).map(|i| format!("g{i}")).collect();
        SampleMajorMatrix::new(rows, cols, values).unwrap()
    }

    #[test]
    fn first_component_follows_dominant_axis() {
        let data = sm(array![
            [-2.0, 0.1],
            [-1.0, -0.1],
            [0.0, 0.05],
            [1.0, -0.05],
            [2.0, 0.0]
        ]);
        let res = fit_transform(&data, 1).unwrap();
        assert_eq!(res.scores.n_features(), 1);
        assert_abs_diff_eq!(res.loadings[[0, 0]].abs(), 1.0, epsilon = 1e-2);
        assert!(res.loadings[[0, 0]] > 0.0);
        assert_abs_diff_eq!(res.scores.values()[[4, 0]], 2.0, epsilon = 2e-2);
        assert_abs_diff_eq!(res.explained_variance[0], 2.5, epsilon = 1e-2);
    }

    #[test]
    fn scores_are_uncorrelated_with_reported_variances() {
        let tall = Array2::from_shape_fn((8, 3), |(i, j)| ((i * 5 + j * 3) % 7) as f64 + (i * j) as f64 * 0.1);
        let res = fit_transform(&sm(tall), 2).unwrap();
        assert_eq!(res.explained_variance.len(), 2);
        assert!(res.explained_variance[0] >= res.explained_variance[1]);
        let s = res.scores.values();
        assert_abs_diff_eq!(s.column(0).var(1.0), res.explained_variance[0], epsilon = 1e-8);
        assert_abs_diff_eq!(s.column(1).var(1.0), res.explained_variance[1], epsilon = 1e-8);
        assert_abs_diff_eq!(s.column(0).dot(&s.column(1)) / 7.0, 0.0, epsilon = 1e-8);
    }

    #[test]
    fn gram_path_matches_covariance_path() {
        // Same centred data seen through both decompositions: 4 samples x 6
        // features goes through the Gram matrix, the 4 x 3 slice does not.
        let base = Array2::from_shape_fn((4, 3), |(i, j)| ((i * 7 + j * 5) % 9) as f64);
        let mut wide = Array2::<f64>::zeros((4, 6));
        for i in 0..4 {
            for j in 0..3 {
                wide[[i, j]] = base[[i, j]];
            }
        }
        let narrow = fit_transform(&sm(base), 2).unwrap();
        let gram = fit_transform(&sm(wide), 2).unwrap();
        for c in 0..2 {
            assert_abs_diff_eq!(narrow.explained_variance[c], gram.explained_variance[c], epsilon = 1e-8);
            for r in 0..4 {
                assert_abs_diff_eq!(
                    narrow.scores.values()[[r, c]].abs(),
                    gram.scores.values()[[r, c]].abs(),
                    epsilon = 1e-8
                );
            }
        }
    }

    #[test]
    fn component_count_is_capped_by_rank() {
        let data = sm(array![[1.0, 2.0, 3.0, 4.0], [2.0, 1.0, 0.0, 5.0], [0.0, 0.0, 1.0, 1.0]]);
        let res = fit_transform(&data, 10).unwrap();
        assert_eq!(res.scores.n_features(), 2);
        assert_eq!(res.scores.feature_ids(), &["PC1", "PC2"]);
    }

    #[test]
    fn rejects_degenerate_inputs() {
        assert!(fit_transform(&sm(array![[1.0, 2.0]]), 1).is_err());
        assert!(fit_transform(&sm(array![[1.0], [f64::NAN]]), 1).is_err());
        assert!(fit_transform(&sm(array![[1.0], [2.0]]), 0).is_err());
    }
}
