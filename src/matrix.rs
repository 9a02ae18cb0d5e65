// matrix.rs
//
// Orientation is part of the type: `ExpressionMatrix` is always genes x samples,
// `SampleMajorMatrix` is always samples x features. The only way between the two
// is `ExpressionMatrix::to_sample_major`.

use crate::error::{AtlasError, Result};
use ndarray::{Array2, ArrayView1, Axis};
use std::collections::{HashMap, HashSet};

/// Expression values, one row per gene and one column per observed sample.
///
/// Missing measurements are stored as `NaN`. Gene identifiers are unique.
/// Sample identifiers are unique in loaded data; a bootstrap cohort built by
/// [`ExpressionMatrix::select_samples`] may repeat them, each column being a
/// separate resampled observation.
#[derive(Debug, Clone, PartialEq)]
pub struct ExpressionMatrix {
    gene_ids: Vec<String>,
    sample_ids: Vec<String>,
    values: Array2<f64>,
}

impl ExpressionMatrix {
    pub fn new(gene_ids: Vec<String>, sample_ids: Vec<String>, values: Array2<f64>) -> Result<Self> {
        if values.nrows() != gene_ids.len() || values.ncols() != sample_ids.len() {
            return Err(AtlasError::InputShape(format!(
                "expression values are {}x{} but {} gene ids and {} sample ids were given",
                values.nrows(),
                values.ncols(),
                gene_ids.len(),
                sample_ids.len()
            )));
        }
        let mut seen = HashSet::with_capacity(gene_ids.len());
        if let Some(dup) = gene_ids.iter().find(|g| !seen.insert(g.as_str())) {
            return Err(AtlasError::InputShape(format!("duplicate gene id '{}'", dup)));
        }
        let mut seen = HashSet::with_capacity(sample_ids.len());
        if let Some(dup) = sample_ids.iter().find(|s| !seen.insert(s.as_str())) {
            return Err(AtlasError::InputShape(format!("duplicate sample id '{}'", dup)));
        }
        Ok(Self {
            gene_ids,
            sample_ids,
            values,
        })
    }

    pub fn gene_ids(&self) -> &[String] {
        &self.gene_ids
    }

    pub fn sample_ids(&self) -> &[String] {
        &self.sample_ids
    }

    pub fn values(&self) -> &Array2<f64> {
        &self.values
    }

    pub fn n_genes(&self) -> usize {
        self.gene_ids.len()
    }

    pub fn n_samples(&self) -> usize {
        self.sample_ids.len()
    }

    pub fn gene_row(&self, gene_idx: usize) -> ArrayView1<'_, f64> {
        self.values.row(gene_idx)
    }

    /// Same sample columns, new values. Used by transforms that keep the layout.
    pub(crate) fn with_values(&self, values: Array2<f64>) -> Self {
        debug_assert_eq!(values.dim(), self.values.dim());
        Self {
            gene_ids: self.gene_ids.clone(),
            sample_ids: self.sample_ids.clone(),
            values,
        }
    }

    /// Rows for `genes`, in the order given.
    pub fn select_genes(&self, genes: &[String]) -> Result<Self> {
        let index: HashMap<&str, usize> = self
            .gene_ids
            .iter()
            .enumerate()
            .map(|(i, g)| (g.as_str(), i))
            .collect();
        let rows = genes
            .iter()
            .map(|g| {
                index.get(g.as_str()).copied().ok_or_else(|| {
                    AtlasError::InputShape(format!("gene '{}' is not in the expression matrix", g))
                })
            })
            .collect::<Result<Vec<usize>>>()?;
        Ok(Self {
            gene_ids: genes.to_vec(),
            sample_ids: self.sample_ids.clone(),
            values: self.values.select(Axis(0), &rows),
        })
    }

    /// Columns for `samples`, in the order given. Repeated identifiers yield
    /// repeated columns.
    pub fn select_samples(&self, samples: &[String]) -> Result<Self> {
        let index: HashMap<&str, usize> = self
            .sample_ids
            .iter()
            .enumerate()
            .map(|(i, s)| (s.as_str(), i))
            .collect();
        let cols = samples
            .iter()
            .map(|s| {
                index.get(s.as_str()).copied().ok_or_else(|| {
                    AtlasError::InputShape(format!("sample '{}' is not in the expression matrix", s))
                })
            })
            .collect::<Result<Vec<usize>>>()?;
        Ok(Self {
            gene_ids: self.gene_ids.clone(),
            sample_ids: samples.to_vec(),
            values: self.values.select(Axis(1), &cols),
        })
    }

    pub fn to_sample_major(&self) -> SampleMajorMatrix {
        SampleMajorMatrix {
            row_ids: self.sample_ids.clone(),
            feature_ids: self.gene_ids.clone(),
            values: self.values.t().to_owned(),
        }
    }
}

/// Observations as rows, features (genes or principal components) as columns.
#[derive(Debug, Clone, PartialEq)]
pub struct SampleMajorMatrix {
    row_ids: Vec<String>,
    feature_ids: Vec<String>,
    values: Array2<f64>,
}

impl SampleMajorMatrix {
    pub fn new(row_ids: Vec<String>, feature_ids: Vec<String>, values: Array2<f64>) -> Result<Self> {
        if values.nrows() != row_ids.len() || values.ncols() != feature_ids.len() {
            return Err(AtlasError::InputShape(format!(
                "sample-major values are {}x{} but {} row ids and {} feature ids were given",
                values.nrows(),
                values.ncols(),
                row_ids.len(),
                feature_ids.len()
            )));
        }
        Ok(Self {
            row_ids,
            feature_ids,
            values,
        })
    }

    pub fn row_ids(&self) -> &[String] {
        &self.row_ids
    }

    pub fn feature_ids(&self) -> &[String] {
        &self.feature_ids
    }

    pub fn values(&self) -> &Array2<f64> {
        &self.values
    }

    pub fn n_rows(&self) -> usize {
        self.row_ids.len()
    }

    pub fn n_features(&self) -> usize {
        self.feature_ids.len()
    }
}
