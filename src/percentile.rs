// percentile.rs

use crate::matrix::ExpressionMatrix;
use ndarray::{Array2, ArrayView1};
use rayon::prelude::*;

/// Rank-normalises every sample column independently.
///
/// Each value becomes `(n_genes - rank + 1) / n_genes`, where `rank` is the
/// descending rank within the column (highest value = rank 1). Tied values share
/// the average of their ranks. Missing values take the bottom ranks, so the
/// output is always in `(0, 1]` and never missing.
pub fn transform_to_percentile(matrix: &ExpressionMatrix) -> ExpressionMatrix {
    let n_genes = matrix.n_genes();
    let n_samples = matrix.n_samples();
    let mut out = Array2::<f64>::zeros((n_genes, n_samples));
    if n_genes == 0 {
        return matrix.with_values(out);
    }

    let columns: Vec<Vec<f64>> = (0..n_samples)
        .into_par_iter()
        .map(|j| percentile_column(matrix.values().column(j)))
        .collect();

    for (j, col) in columns.into_iter().enumerate() {
        for (i, v) in col.into_iter().enumerate() {
            out[[i, j]] = v;
        }
    }
    matrix.with_values(out)
}

fn percentile_column(column: ArrayView1<'_, f64>) -> Vec<f64> {
    let n = column.len();
    let nf = n as f64;
    let ranks = descending_ranks(column);
    ranks.into_iter().map(|r| (nf - r + 1.0) / nf).collect()
}

/// Average descending ranks, missing values tied at the bottom.
fn descending_ranks(column: ArrayView1<'_, f64>) -> Vec<f64> {
    let n = column.len();
    let mut present: Vec<(f64, usize)> = column
        .iter()
        .enumerate()
        .filter(|(_, v)| !v.is_nan())
        .map(|(i, &v)| (v, i))
        .collect();
    present.sort_by(|a, b| b.0.total_cmp(&a.0));

    let mut ranks = vec![0.0; n];
    let mut i = 0;
    while i < present.len() {
        let mut j = i + 1;
        while j < present.len() && present[j].0 == present[i].0 {
            j += 1;
        }
        // 1-based ranks i+1 ..= j share their mean.
        let shared = (i + 1 + j) as f64 / 2.0;
        for &(_, idx) in &present[i..j] {
            ranks[idx] = shared;
        }
        i = j;
    }

    let n_missing = n - present.len();
    if n_missing > 0 {
        let shared = (present.len() + 1 + n) as f64 / 2.0;
        for (idx, v) in column.iter().enumerate() {
            if v.is_nan() {
                ranks[idx] = shared;
            }
        }
    }
    ranks
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    fn matrix(values: Array2<f64>) -> ExpressionMatrix {
        let genes = (0..values.nrows()).map(|i| format!("g{i}")).collect();
        let samples = (0..values.ncols()).map(|i| format!("s{i}")).collect();
        ExpressionMatrix::new(genes, samples, values).unwrap()
    }

    #[test]
    fn highest_value_maps_to_one_and_lowest_to_one_over_n() {
        let m = matrix(array![[5.0, 0.1], [1.0, 0.3], [3.0, 0.2], [4.0, 0.4]]);
        let p = transform_to_percentile(&m);
        let v = p.values();
        assert_abs_diff_eq!(v[[0, 0]], 1.0);
        assert_abs_diff_eq!(v[[1, 0]], 0.25);
        assert_abs_diff_eq!(v[[2, 0]], 0.5);
        assert_abs_diff_eq!(v[[3, 0]], 0.75);
        assert_abs_diff_eq!(v[[3, 1]], 1.0);
        assert_abs_diff_eq!(v[[0, 1]], 0.25);
    }

    #[test]
    fn ties_share_the_average_rank() {
        let m = matrix(array![[2.0], [2.0], [1.0], [3.0]]);
        let v = transform_to_percentile(&m).values().clone();
        // descending ranks: 3.0 -> 1, 2.0/2.0 -> 2.5, 1.0 -> 4
        assert_abs_diff_eq!(v[[3, 0]], 1.0);
        assert_abs_diff_eq!(v[[0, 0]], (4.0 - 2.5 + 1.0) / 4.0);
        assert_abs_diff_eq!(v[[1, 0]], v[[0, 0]]);
        assert_abs_diff_eq!(v[[2, 0]], 0.25);
    }

    #[test]
    fn missing_values_rank_last() {
        let m = matrix(array![[f64::NAN], [10.0], [f64::NAN], [-3.0]]);
        let v = transform_to_percentile(&m).values().clone();
        assert_abs_diff_eq!(v[[1, 0]], 1.0);
        assert_abs_diff_eq!(v[[3, 0]], 0.75);
        // NaNs share ranks 3 and 4 -> 3.5
        assert_abs_diff_eq!(v[[0, 0]], (4.0 - 3.5 + 1.0) / 4.0);
        assert_abs_diff_eq!(v[[2, 0]], v[[0, 0]]);
        assert!(v[[3, 0]] > v[[0, 0]]);
    }

    #[test]
    fn output_stays_in_unit_interval() {
        let values = Array2::from_shape_fn((50, 7), |(i, j)| {
            if (i + j) % 11 == 0 {
                f64::NAN
            } else {
                ((i * 31 + j * 17) % 13) as f64 - 6.0
            }
        });
        let p = transform_to_percentile(&matrix(values));
        assert!(p.values().iter().all(|&x| x > 0.0 && x <= 1.0));
        assert_eq!(p.gene_ids().len(), 50);
        assert_eq!(p.sample_ids().len(), 7);
    }
}
