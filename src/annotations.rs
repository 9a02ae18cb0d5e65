// annotations.rs

use crate::error::{AtlasError, Result};
use crate::matrix::ExpressionMatrix;
use std::collections::{BTreeMap, HashMap, HashSet};

/// Per-sample metadata consumed by the pipeline.
#[derive(Debug, Clone, PartialEq)]
pub struct SampleRecord {
    pub sample_id: String,
    /// Measurement platform / batch.
    pub platform: String,
    /// Source study. Only the jackknife needs it.
    pub dataset: Option<String>,
    /// Any further columns, kept for output.
    pub extra: BTreeMap<String, String>,
}

impl SampleRecord {
    pub fn new(sample_id: impl Into<String>, platform: impl Into<String>, dataset: Option<String>) -> Self {
        Self {
            sample_id: sample_id.into(),
            platform: platform.into(),
            dataset,
            extra: BTreeMap::new(),
        }
    }
}

/// Sample annotation table keyed by sample identifier.
///
/// Records keep their input order; [`SampleAnnotations::datasets_in_order`]
/// relies on it for a reproducible jackknife order.
#[derive(Debug, Clone, Default)]
pub struct SampleAnnotations {
    records: Vec<SampleRecord>,
    index: HashMap<String, usize>,
}

impl SampleAnnotations {
    pub fn new(records: Vec<SampleRecord>) -> Result<Self> {
        let mut index = HashMap::with_capacity(records.len());
        for (i, rec) in records.iter().enumerate() {
            if index.insert(rec.sample_id.clone(), i).is_some() {
                return Err(AtlasError::InputShape(format!(
                    "sample '{}' is annotated more than once",
                    rec.sample_id
                )));
            }
        }
        Ok(Self { records, index })
    }

    pub fn records(&self) -> &[SampleRecord] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn sample_ids(&self) -> Vec<String> {
        self.records.iter().map(|r| r.sample_id.clone()).collect()
    }

    pub fn get(&self, sample_id: &str) -> Option<&SampleRecord> {
        self.index.get(sample_id).map(|&i| &self.records[i])
    }

    /// Every column of `matrix` must have an annotation record.
    pub fn validate_covers(&self, matrix: &ExpressionMatrix) -> Result<()> {
        let missing: Vec<&str> = matrix
            .sample_ids()
            .iter()
            .filter(|s| !self.index.contains_key(s.as_str()))
            .map(String::as_str)
            .collect();
        if !missing.is_empty() {
            return Err(AtlasError::InputShape(format!(
                "{} expression column(s) have no sample annotation (first: {:?})",
                missing.len(),
                &missing[..missing.len().min(5)]
            )));
        }
        Ok(())
    }

    /// Jackknife needs a dataset for every sample.
    pub fn validate_datasets(&self) -> Result<()> {
        if let Some(rec) = self.records.iter().find(|r| r.dataset.is_none()) {
            return Err(AtlasError::InputShape(format!(
                "sample '{}' has no Dataset annotation, required for jackknife resampling",
                rec.sample_id
            )));
        }
        Ok(())
    }

    /// Platform of each listed observation, in order.
    pub fn platforms_for(&self, samples: &[String]) -> Result<Vec<String>> {
        samples
            .iter()
            .map(|s| {
                self.get(s).map(|r| r.platform.clone()).ok_or_else(|| {
                    AtlasError::InputShape(format!("sample '{}' has no annotation", s))
                })
            })
            .collect()
    }

    /// Distinct dataset values in order of first appearance.
    pub fn datasets_in_order(&self) -> Vec<String> {
        let mut seen = HashSet::new();
        self.records
            .iter()
            .filter_map(|r| r.dataset.as_ref())
            .filter(|d| seen.insert(d.as_str()))
            .cloned()
            .collect()
    }

    /// Samples whose dataset differs from `dataset`, in record order.
    pub fn samples_excluding_dataset(&self, dataset: &str) -> Vec<String> {
        self.records
            .iter()
            .filter(|r| r.dataset.as_deref() != Some(dataset))
            .map(|r| r.sample_id.clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array2;

    fn table() -> SampleAnnotations {
        SampleAnnotations::new(vec![
            SampleRecord::new("a", "Illumina", Some("DS2".into())),
            SampleRecord::new("b", "Affy", Some("DS1".into())),
            SampleRecord::new("c", "Affy", Some("DS2".into())),
            SampleRecord::new("d", "RNAseq", Some("DS3".into())),
        ])
        .unwrap()
    }

    #[test]
    fn dataset_order_is_first_appearance() {
        assert_eq!(table().datasets_in_order(), vec!["DS2", "DS1", "DS3"]);
        assert_eq!(table().samples_excluding_dataset("DS2"), vec!["b", "d"]);
    }

    #[test]
    fn coverage_check_reports_missing_columns() {
        let ann = table();
        let ok = ExpressionMatrix::new(
            vec!["g".into()],
            vec!["a".into(), "d".into()],
            Array2::zeros((1, 2)),
        )
        .unwrap();
        assert!(ann.validate_covers(&ok).is_ok());

        let bad = ExpressionMatrix::new(
            vec!["g".into()],
            vec!["a".into(), "zz".into()],
            Array2::zeros((1, 2)),
        )
        .unwrap();
        let err = ann.validate_covers(&bad).unwrap_err();
        assert!(matches!(err, AtlasError::InputShape(ref m) if m.contains("zz")));
    }

    #[test]
    fn duplicate_records_and_missing_datasets() {
        assert!(SampleAnnotations::new(vec![
            SampleRecord::new("a", "p", None),
            SampleRecord::new("a", "p", None),
        ])
        .is_err());
        let ann = SampleAnnotations::new(vec![SampleRecord::new("a", "p", None)]).unwrap();
        assert!(ann.validate_datasets().is_err());
        assert!(table().validate_datasets().is_ok());
    }

    #[test]
    fn platforms_follow_observation_order_with_duplicates() {
        let obs = vec!["c".to_string(), "a".to_string(), "c".to_string()];
        assert_eq!(table().platforms_for(&obs).unwrap(), vec!["Affy", "Illumina", "Affy"]);
        assert!(table().platforms_for(&["x".to_string()]).is_err());
    }
}
