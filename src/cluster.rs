// cluster.rs

use crate::error::{AtlasError, Result};
use crate::matrix::SampleMajorMatrix;
use log::debug;
use ndarray::Array2;

/// Ward agglomerative clustering of the rows of `data` into `n_clusters` groups.
///
/// Works on squared Euclidean distances with the Lance-Williams update for
/// Ward linkage. Equal merge costs are resolved towards the lowest index pair,
/// so the result is fully determined by the input. Returned labels are numbered
/// in order of first appearance along the rows (row 0 always gets label 0).
pub fn ward(data: &SampleMajorMatrix, n_clusters: usize) -> Result<Vec<usize>> {
    let n = data.n_rows();
    if n_clusters == 0 {
        return Err(AtlasError::Clustering("n_clusters must be > 0".into()));
    }
    if n_clusters > n {
        return Err(AtlasError::Clustering(format!(
            "n_clusters ({}) > n_samples ({})",
            n_clusters, n
        )));
    }
    if data.values().iter().any(|v| !v.is_finite()) {
        return Err(AtlasError::Clustering("coordinates contain non-finite values".into()));
    }

    let x = data.values();
    let mut dist = Array2::<f64>::zeros((n, n));
    for i in 0..n {
        for j in (i + 1)..n {
            let d: f64 = x
                .row(i)
                .iter()
                .zip(x.row(j).iter())
                .map(|(a, b)| (a - b).powi(2))
                .sum();
            dist[[i, j]] = d;
            dist[[j, i]] = d;
        }
    }

    // members[i] = original rows merged into cluster slot i; None once absorbed.
    let mut members: Vec<Option<Vec<usize>>> = (0..n).map(|i| Some(vec![i])).collect();
    let mut active: Vec<usize> = (0..n).collect();

    while active.len() > n_clusters {
        let mut best = f64::INFINITY;
        let (mut best_a, mut best_b) = (active[0], active[1]);
        for (ai, &a) in active.iter().enumerate() {
            for &b in &active[ai + 1..] {
                if dist[[a, b]] < best {
                    best = dist[[a, b]];
                    best_a = a;
                    best_b = b;
                }
            }
        }

        let size = |slot: usize, members: &[Option<Vec<usize>>]| {
            members[slot].as_ref().map_or(0, Vec::len) as f64
        };
        let n_a = size(best_a, &members);
        let n_b = size(best_b, &members);
        for &c in &active {
            if c == best_a || c == best_b {
                continue;
            }
            let n_c = size(c, &members);
            let updated = ((n_a + n_c) * dist[[best_a, c]] + (n_b + n_c) * dist[[best_b, c]]
                - n_c * dist[[best_a, best_b]])
                / (n_a + n_b + n_c);
            dist[[best_a, c]] = updated;
            dist[[c, best_a]] = updated;
        }

        let absorbed = members[best_b].take().unwrap_or_default();
        if let Some(m) = members[best_a].as_mut() {
            m.extend(absorbed);
        }
        active.retain(|&c| c != best_b);
    }

    let mut raw = vec![0usize; n];
    for (cluster, &slot) in active.iter().enumerate() {
        if let Some(rows) = &members[slot] {
            for &r in rows {
                raw[r] = cluster;
            }
        }
    }
    let labels = relabel_by_first_appearance(&raw);
    debug!(
        "Ward clustering of {} samples into {} clusters: sizes {:?}",
        n,
        n_clusters,
        cluster_sizes(&labels, n_clusters)
    );
    Ok(labels)
}

fn relabel_by_first_appearance(raw: &[usize]) -> Vec<usize> {
    let mut mapping: Vec<Option<usize>> = vec![None; raw.len()];
    let mut next = 0;
    raw.iter()
        .map(|&r| {
            *mapping[r].get_or_insert_with(|| {
                next += 1;
                next - 1
            })
        })
        .collect()
}

fn cluster_sizes(labels: &[usize], k: usize) -> Vec<usize> {
    let mut sizes = vec![0; k];
    for &l in labels {
        sizes[l] += 1;
    }
    sizes
}
