// stability.rs

use crate::assignment::{ClusterAssignment, ResampledClusteringCollection};
use crate::error::{AtlasError, Result};
use std::collections::BTreeSet;

/// The H-index search grid is 0, 1/1000, ..., 999/1000.
const H_GRID: usize = 1000;

/// Reproducibility score of every base cluster, in the base assignment's
/// first-appearance label order.
///
/// For a base cluster, each resampled column contributes the best Jaccard
/// similarity between the cluster (restricted to the samples that column
/// covers) and any of the column's clusters. The score is the largest grid
/// value `h` such that at least a fraction `h` of the columns reach similarity
/// `h`. Empty-vs-empty comparisons are skipped and a column with nothing to
/// compare contributes 0; the fraction always divides by the full column count.
pub fn calc_h_index(collection: &ResampledClusteringCollection) -> Result<Vec<f64>> {
    if collection.resamples.is_empty() {
        return Err(AtlasError::InvalidConfig(
            "H-index needs at least one resampled assignment".into(),
        ));
    }
    Ok(collection
        .base
        .labels_in_order()
        .into_iter()
        .map(|label| {
            let cluster = collection.base.members(label);
            let sims = best_similarities(&cluster, &collection.resamples);
            h_index(&sims)
        })
        .collect())
}

/// Best-match Jaccard similarity of `cluster` in every resampled column.
fn best_similarities(cluster: &BTreeSet<&str>, resamples: &[ClusterAssignment]) -> Vec<f64> {
    resamples
        .iter()
        .map(|column| {
            let covered = column.covered_samples();
            let present: BTreeSet<&str> = cluster.intersection(&covered).copied().collect();
            column
                .labels_in_order()
                .into_iter()
                .filter_map(|j| {
                    let group = column.members(j);
                    let union = present.union(&group).count();
                    if union == 0 {
                        return None;
                    }
                    Some(present.intersection(&group).count() as f64 / union as f64)
                })
                .fold(0.0, f64::max)
        })
        .collect()
}

fn h_index(similarities: &[f64]) -> f64 {
    let n = similarities.len() as f64;
    for step in (1..H_GRID).rev() {
        let h = step as f64 / H_GRID as f64;
        let reaching = similarities.iter().filter(|&&s| s >= h).count() as f64;
        if reaching / n >= h {
            return h;
        }
    }
    0.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    fn assignment(pairs: &[(&str, usize)]) -> ClusterAssignment {
        ClusterAssignment::new(pairs.iter().map(|(s, l)| (s.to_string(), *l)).collect())
    }

    fn two_by_five(first: usize, second: usize) -> ClusterAssignment {
        let mut obs = Vec::new();
        for i in 0..5 {
            obs.push((format!("a{i}"), first));
        }
        for i in 0..5 {
            obs.push((format!("b{i}"), second));
        }
        ClusterAssignment::new(obs)
    }

    #[test]
    fn exact_reproduction_scores_the_top_of_the_grid() {
        let mut coll = ResampledClusteringCollection::new(two_by_five(0, 1));
        for i in 0..10 {
            // label ids are arbitrary between runs
            coll.push(if i % 2 == 0 { two_by_five(1, 0) } else { two_by_five(4, 9) });
        }
        let scores = calc_h_index(&coll).unwrap();
        assert_eq!(scores.len(), 2);
        for s in scores {
            assert_abs_diff_eq!(s, 0.999, epsilon = 1e-9);
        }
    }

    #[test]
    fn disjoint_columns_score_zero() {
        let base = assignment(&[("a", 0), ("b", 0), ("c", 1)]);
        let mut coll = ResampledClusteringCollection::new(base);
        // column covers only "c": cluster 0 has nothing present in it
        coll.push(assignment(&[("c", 0)]));
        coll.push(assignment(&[("c", 3)]));
        let scores = calc_h_index(&coll).unwrap();
        assert_eq!(scores[0], 0.0);
        assert_abs_diff_eq!(scores[1], 0.999, epsilon = 1e-9);
    }

    #[test]
    fn empty_column_contributes_zero_but_counts_in_denominator() {
        let base = assignment(&[("a", 0), ("b", 0)]);
        let mut coll = ResampledClusteringCollection::new(base);
        coll.push(assignment(&[("a", 0), ("b", 0)]));
        coll.push(ClusterAssignment::default());
        let scores = calc_h_index(&coll).unwrap();
        // similarities [1, 0]: half the columns reach any h <= 0.5
        assert_abs_diff_eq!(scores[0], 0.5, epsilon = 1e-9);
    }

    #[test]
    fn partial_agreement_sits_between_bounds() {
        let base = assignment(&[("a", 0), ("b", 0), ("c", 0), ("d", 1), ("e", 1), ("f", 1)]);
        let mut coll = ResampledClusteringCollection::new(base);
        coll.push(assignment(&[("a", 0), ("b", 0), ("c", 1), ("d", 1), ("e", 1), ("f", 1)]));
        coll.push(assignment(&[("a", 0), ("b", 1), ("c", 0), ("d", 1), ("e", 0), ("f", 1)]));
        coll.push(assignment(&[("a", 5), ("b", 5), ("c", 5), ("d", 6), ("e", 6), ("f", 6)]));
        let scores = calc_h_index(&coll).unwrap();
        for &s in &scores {
            assert!((0.0..1.0).contains(&s), "score {s} out of range");
        }
        // cluster 0 best matches: 2/3, 2/4, 1 -> two of three reach 2/3
        assert_abs_diff_eq!(scores[0], 0.666, epsilon = 1e-9);
    }

    #[test]
    fn missing_resamples_is_an_error() {
        let coll = ResampledClusteringCollection::new(assignment(&[("a", 0)]));
        assert!(matches!(calc_h_index(&coll), Err(AtlasError::InvalidConfig(_))));
    }

    #[test]
    fn grid_search_is_self_consistent() {
        assert_eq!(h_index(&[0.0, 0.0, 0.0]), 0.0);
        assert_abs_diff_eq!(h_index(&[0.3, 0.3, 0.3]), 0.3, epsilon = 1e-9);
        assert_abs_diff_eq!(h_index(&[0.9, 0.9, 0.1, 0.1]), 0.5, epsilon = 1e-9);
    }

    #[test]
    fn grid_points_are_exact() {
        // 3/10 sits exactly on the grid; an accumulated 0.001 step would land
        // just above it and resolve to 0.299.
        let sims = vec![3.0 / 10.0; 10];
        assert_eq!(h_index(&sims), 0.3);
        assert_eq!(h_index(&[0.7; 4]), 0.7);
    }
}
