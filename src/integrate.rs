// integrate.rs

use crate::annotations::{SampleAnnotations, SampleRecord};
use crate::error::{AtlasError, Result};
use crate::matrix::ExpressionMatrix;
use log::{debug, info};
use ndarray::Array2;
use std::collections::{HashMap, HashSet};

/// Expression table of one source dataset as loaded, before integration.
///
/// Unlike [`ExpressionMatrix`], gene ids may repeat (several probes of one gene).
#[derive(Debug, Clone, PartialEq)]
pub struct RawExpressionTable {
    pub gene_ids: Vec<String>,
    pub sample_ids: Vec<String>,
    /// Genes x samples, NaN = missing.
    pub values: Array2<f64>,
}

impl RawExpressionTable {
    pub fn new(gene_ids: Vec<String>, sample_ids: Vec<String>, values: Array2<f64>) -> Result<Self> {
        if values.nrows() != gene_ids.len() || values.ncols() != sample_ids.len() {
            return Err(AtlasError::InputShape(format!(
                "table values are {}x{} but {} row ids and {} sample ids were given",
                values.nrows(),
                values.ncols(),
                gene_ids.len(),
                sample_ids.len()
            )));
        }
        Ok(Self {
            gene_ids,
            sample_ids,
            values,
        })
    }

    /// Renames rows through `mapping` (probe id -> gene id). Rows without a
    /// mapping are dropped.
    pub fn map_row_ids(&self, mapping: &HashMap<String, String>) -> Self {
        let (rows, ids): (Vec<usize>, Vec<String>) = self
            .gene_ids
            .iter()
            .enumerate()
            .filter_map(|(i, probe)| mapping.get(probe).map(|g| (i, g.clone())))
            .unzip();
        Self {
            gene_ids: ids,
            sample_ids: self.sample_ids.clone(),
            values: self.values.select(ndarray::Axis(0), &rows),
        }
    }
}

/// Gene ids present in every table, in the order of the first table.
pub fn common_genes(tables: &[&RawExpressionTable]) -> Vec<String> {
    let Some((first, rest)) = tables.split_first() else {
        return Vec::new();
    };
    let others: Vec<HashSet<&str>> = rest
        .iter()
        .map(|t| t.gene_ids.iter().map(String::as_str).collect())
        .collect();
    let mut seen = HashSet::new();
    first
        .gene_ids
        .iter()
        .filter(|g| others.iter().all(|o| o.contains(g.as_str())))
        .filter(|g| seen.insert(g.as_str()))
        .cloned()
        .collect()
}

/// Joins tables column-wise on `genes`.
///
/// In each table, repeated rows of a gene are averaged ignoring missing
/// values. Columns keep table order; a sample id already taken by an earlier
/// table is dropped.
pub fn merge_columns(tables: &[&RawExpressionTable], genes: &[String]) -> Result<ExpressionMatrix> {
    let mut sample_ids: Vec<String> = Vec::new();
    let mut columns: Vec<Vec<f64>> = Vec::new();
    let mut taken: HashSet<String> = HashSet::new();

    for (t, table) in tables.iter().enumerate() {
        let mut rows_of: HashMap<&str, Vec<usize>> = HashMap::new();
        for (i, g) in table.gene_ids.iter().enumerate() {
            rows_of.entry(g.as_str()).or_default().push(i);
        }
        let rows: Vec<&Vec<usize>> = genes
            .iter()
            .map(|g| {
                rows_of.get(g.as_str()).ok_or_else(|| {
                    AtlasError::InputShape(format!("gene '{}' is missing from table {}", g, t))
                })
            })
            .collect::<Result<_>>()?;

        let mut dropped = 0;
        for (j, sample) in table.sample_ids.iter().enumerate() {
            if !taken.insert(sample.clone()) {
                dropped += 1;
                continue;
            }
            let column = table.values.column(j);
            columns.push(
                rows.iter()
                    .map(|idx| nan_mean(idx.iter().map(|&i| column[i])))
                    .collect(),
            );
            sample_ids.push(sample.clone());
        }
        if dropped > 0 {
            debug!("Table {}: {} sample column(s) already present, dropped", t, dropped);
        }
    }

    let mut values = Array2::<f64>::from_elem((genes.len(), sample_ids.len()), f64::NAN);
    for (j, col) in columns.into_iter().enumerate() {
        for (i, v) in col.into_iter().enumerate() {
            values[[i, j]] = v;
        }
    }
    info!(
        "Merged {} tables: {} common genes x {} samples",
        tables.len(),
        genes.len(),
        sample_ids.len()
    );
    ExpressionMatrix::new(genes.to_vec(), sample_ids, values)
}

/// Concatenates annotation tables, keeping the first record of any repeated sample id.
pub fn merge_annotations(tables: &[&SampleAnnotations]) -> Result<SampleAnnotations> {
    let mut seen = HashSet::new();
    let records: Vec<SampleRecord> = tables
        .iter()
        .flat_map(|t| t.records().iter())
        .filter(|r| !r.sample_id.is_empty() && seen.insert(r.sample_id.clone()))
        .cloned()
        .collect();
    SampleAnnotations::new(records)
}

fn nan_mean(values: impl Iterator<Item = f64>) -> f64 {
    let (sum, n) = values
        .filter(|v| !v.is_nan())
        .fold((0.0, 0usize), |(s, n), v| (s + v, n + 1));
    if n == 0 {
        f64::NAN
    } else {
        sum / n as f64
    }
}
