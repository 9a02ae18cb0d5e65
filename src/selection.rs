// selection.rs

use crate::annotations::{SampleAnnotations, SampleRecord};
use crate::error::{AtlasError, Result};
use log::info;
use regex::Regex;
use std::collections::{BTreeMap, BTreeSet};

/// Haematopoietic cell-type patterns used to pick blood samples out of
/// heterogeneous study metadata.
pub const BLOOD_CELL_PATTERNS: [&str; 20] = [
    "[Ll]ymp",
    "[Hh]aem",
    "[Hh]em",
    "HSC",
    "[Mm]ono",
    "[Bb]-* *cell",
    "[Mm]yelo",
    "[Gg]ranu",
    "[Mm]ac",
    "NK",
    "[Kk]ill",
    "[Mm]eg",
    "[Bb]aso",
    "[Nn]eut",
    "[Ee]os",
    "[Pp]las",
    "[Ee]ryt",
    "[Tt]-* *cell",
    "DC",
    "[Dd]endri",
];

/// Selects annotation records whose metadata matches any of a set of
/// regular expressions (unanchored search).
#[derive(Debug, Clone)]
pub struct SampleSelector {
    patterns: Vec<Regex>,
    /// Metadata columns searched; every extra column when `None`.
    columns: Option<Vec<String>>,
}

impl SampleSelector {
    pub fn new<S: AsRef<str>>(patterns: &[S]) -> Result<Self> {
        if patterns.is_empty() {
            return Err(AtlasError::InvalidConfig("no selection pattern given".into()));
        }
        let patterns = patterns
            .iter()
            .map(|p| {
                Regex::new(p.as_ref()).map_err(|e| {
                    AtlasError::InvalidConfig(format!("invalid pattern '{}': {}", p.as_ref(), e))
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            patterns,
            columns: None,
        })
    }

    pub fn blood_cells() -> Result<Self> {
        Self::new(&BLOOD_CELL_PATTERNS)
    }

    /// Restricts matching to the named metadata columns.
    pub fn with_columns(mut self, columns: Vec<String>) -> Self {
        self.columns = Some(columns);
        self
    }

    fn searched_values<'a>(&'a self, record: &'a SampleRecord) -> impl Iterator<Item = &'a str> + 'a {
        record
            .extra
            .iter()
            .filter(move |(column, _)| {
                self.columns
                    .as_ref()
                    .map_or(true, |cols| cols.iter().any(|c| c == *column))
            })
            .map(|(_, value)| value.as_str())
            .filter(|v| !v.is_empty() && *v != "NA")
    }

    pub fn is_match(&self, record: &SampleRecord) -> bool {
        self.searched_values(record)
            .any(|v| self.patterns.iter().any(|p| p.is_match(v)))
    }

    /// Matching records, in their original order.
    pub fn select(&self, annotations: &SampleAnnotations) -> Result<SampleAnnotations> {
        let selected: Vec<SampleRecord> = annotations
            .records()
            .iter()
            .filter(|r| self.is_match(r))
            .cloned()
            .collect();
        info!("{} out of {} samples are selected.", selected.len(), annotations.len());
        SampleAnnotations::new(selected)
    }

    /// Datasets holding at least one matching sample.
    pub fn select_datasets(&self, annotations: &SampleAnnotations) -> BTreeSet<String> {
        let datasets: BTreeSet<String> = annotations
            .records()
            .iter()
            .filter(|r| self.is_match(r))
            .filter_map(|r| r.dataset.clone())
            .collect();
        info!("{} datasets are selected: {:?}", datasets.len(), datasets);
        datasets
    }

    /// Distinct metadata values each pattern matched, for checking that a
    /// pattern does not catch unintended cell types.
    pub fn match_report(&self, annotations: &SampleAnnotations) -> BTreeMap<String, BTreeSet<String>> {
        self.patterns
            .iter()
            .map(|p| {
                let values = annotations
                    .records()
                    .iter()
                    .flat_map(|r| self.searched_values(r))
                    .filter(|v| p.is_match(v))
                    .map(str::to_string)
                    .collect();
                (p.as_str().to_string(), values)
            })
            .collect()
    }
}
