// assignment.rs
//
// Labels produced by separate clustering runs are arbitrary. Nothing here
// compares labels across assignments; callers ask for the member sets instead.

use serde::Serialize;
use std::collections::{BTreeSet, HashSet};

/// One clustering run: an opaque label for each observation in its cohort.
///
/// A bootstrap cohort can hold the same sample several times, so observations
/// are kept as an ordered list rather than a map.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ClusterAssignment {
    observations: Vec<(String, usize)>,
}

impl ClusterAssignment {
    pub fn new(observations: Vec<(String, usize)>) -> Self {
        Self { observations }
    }

    /// Pairs each sample id with the label at the same position.
    pub fn from_labels(sample_ids: &[String], labels: &[usize]) -> Self {
        debug_assert_eq!(sample_ids.len(), labels.len());
        Self {
            observations: sample_ids.iter().cloned().zip(labels.iter().copied()).collect(),
        }
    }

    pub fn observations(&self) -> &[(String, usize)] {
        &self.observations
    }

    /// Number of observations, duplicates included.
    pub fn len(&self) -> usize {
        self.observations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.observations.is_empty()
    }

    /// Distinct labels in order of first appearance.
    pub fn labels_in_order(&self) -> Vec<usize> {
        let mut seen = HashSet::new();
        self.observations
            .iter()
            .map(|(_, l)| *l)
            .filter(|l| seen.insert(*l))
            .collect()
    }

    /// Samples carrying `label`. A duplicated sample appears once per group it landed in.
    pub fn members(&self, label: usize) -> BTreeSet<&str> {
        self.observations
            .iter()
            .filter(|(_, l)| *l == label)
            .map(|(s, _)| s.as_str())
            .collect()
    }

    /// Every sample with at least one observation in this run.
    pub fn covered_samples(&self) -> BTreeSet<&str> {
        self.observations.iter().map(|(s, _)| s.as_str()).collect()
    }

    pub fn contains(&self, sample_id: &str) -> bool {
        self.observations.iter().any(|(s, _)| s == sample_id)
    }

    pub fn distinct_samples(&self) -> usize {
        self.covered_samples().len()
    }
}

/// Base assignment plus one assignment per resampling iteration, all for one
/// cluster count.
///
/// Each resampled column only covers the samples its cohort drew; samples left
/// out of an iteration are simply absent from that column.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ResampledClusteringCollection {
    pub base: ClusterAssignment,
    pub resamples: Vec<ClusterAssignment>,
}

impl ResampledClusteringCollection {
    pub fn new(base: ClusterAssignment) -> Self {
        Self {
            base,
            resamples: Vec::new(),
        }
    }

    /// Adds the next iteration's column, restricted to samples known to the base.
    pub fn push(&mut self, assignment: ClusterAssignment) {
        let known = self.base.covered_samples();
        let kept: Vec<(String, usize)> = assignment
            .observations
            .into_iter()
            .filter(|(s, _)| known.contains(s.as_str()))
            .collect();
        self.resamples.push(ClusterAssignment::new(kept));
    }

    pub fn n_resamples(&self) -> usize {
        self.resamples.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn membership_queries() {
        let a = ClusterAssignment::from_labels(&ids(&["s3", "s1", "s2", "s4"]), &[7, 2, 7, 2]);
        assert_eq!(a.labels_in_order(), vec![7, 2]);
        assert_eq!(a.members(7).into_iter().collect::<Vec<_>>(), vec!["s2", "s3"]);
        assert!(a.members(0).is_empty());
        assert!(a.contains("s4"));
        assert!(!a.contains("s9"));
        assert_eq!(a.distinct_samples(), 4);
    }

    #[test]
    fn duplicated_samples_count_once_per_group() {
        let a = ClusterAssignment::from_labels(&ids(&["s1", "s1", "s2", "s1"]), &[0, 1, 1, 0]);
        assert_eq!(a.len(), 4);
        assert_eq!(a.distinct_samples(), 2);
        assert_eq!(a.members(0).len(), 1);
        assert_eq!(a.members(1).len(), 2);
    }

    #[test]
    fn collection_drops_samples_unknown_to_the_base() {
        let base = ClusterAssignment::from_labels(&ids(&["a", "b", "c"]), &[0, 0, 1]);
        let mut coll = ResampledClusteringCollection::new(base);
        coll.push(ClusterAssignment::from_labels(&ids(&["a", "z", "c"]), &[1, 1, 0]));
        coll.push(ClusterAssignment::default());
        assert_eq!(coll.n_resamples(), 2);
        assert_eq!(coll.resamples[0].distinct_samples(), 2);
        assert!(!coll.resamples[0].contains("z"));
        assert!(!coll.resamples[0].contains("b"));
        assert!(coll.resamples[1].is_empty());
    }
}
