// io.rs
//
// Tab-separated tables. The first line is a header whose first cell labels the
// row-id column; every following line starts with a row id.

use crate::annotations::{SampleAnnotations, SampleRecord};
use crate::error::{AtlasError, Result};
use crate::integrate::RawExpressionTable;
use crate::matrix::ExpressionMatrix;
use csv::ReaderBuilder;
use log::{debug, info, warn};
use ndarray::Array2;
use std::collections::{BTreeMap, HashMap};
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

const PLATFORM_COLUMNS: [&str; 2] = ["Platform_Category", "Platform"];
const DATASET_COLUMNS: [&str; 2] = ["Dataset", "Dataset Name"];

fn parse_error(path: &Path, line: usize, reason: impl Into<String>) -> AtlasError {
    AtlasError::Parse {
        path: path.to_path_buf(),
        line,
        reason: reason.into(),
    }
}

/// Tab-separated records of `path` with their 1-based line numbers.
///
/// Rows may have different field counts; callers check them so errors can
/// name the offending line. Blank rows are skipped.
fn read_records(path: &Path) -> Result<Vec<(usize, Vec<String>)>> {
    let mut reader = ReaderBuilder::new()
        .delimiter(b'\t')
        .has_headers(false)
        .flexible(true)
        .from_path(path)
        .map_err(|e| csv_error(path, e))?;
    let mut records = Vec::new();
    for result in reader.records() {
        let record = result.map_err(|e| csv_error(path, e))?;
        if record.iter().all(|cell| cell.trim().is_empty()) {
            continue;
        }
        let line = record.position().map_or(0, |p| p.line() as usize);
        let cells = record
            .iter()
            .map(|cell| cell.trim_end_matches('\r').to_string())
            .collect();
        records.push((line, cells));
    }
    Ok(records)
}

fn csv_error(path: &Path, e: csv::Error) -> AtlasError {
    let line = e.position().map_or(0, |p| p.line() as usize);
    let reason = e.to_string();
    match e.into_kind() {
        csv::ErrorKind::Io(io) => AtlasError::Io(io),
        _ => parse_error(path, line, reason),
    }
}

fn parse_value(cell: &str) -> Option<f64> {
    match cell.trim() {
        "" | "NA" | "NaN" | "nan" | "N/A" => Some(f64::NAN),
        s => s.parse::<f64>().ok(),
    }
}

/// Parses a gene x sample table after `skip` leading lines, dropping the data
/// columns listed in `drop_columns` (matched by header name).
fn parse_table(path: &Path, skip: usize, drop_columns: &[&str]) -> Result<RawExpressionTable> {
    let mut lines = read_records(path)?.into_iter().skip(skip);
    let (header_line, header) = lines
        .next()
        .ok_or_else(|| parse_error(path, skip + 1, "missing header line"))?;
    let header_cells: Vec<&str> = header.iter().map(String::as_str).collect();
    let keep: Vec<usize> = (1..header_cells.len())
        .filter(|&c| !drop_columns.contains(&header_cells[c].trim()))
        .collect();
    let sample_ids: Vec<String> = keep.iter().map(|&c| header_cells[c].trim().to_string()).collect();
    if sample_ids.is_empty() {
        return Err(parse_error(path, header_line, "header has no sample columns"));
    }

    let mut gene_ids = Vec::new();
    let mut flat = Vec::new();
    for (line_no, line) in lines {
        let cells: Vec<&str> = line.iter().map(String::as_str).collect();
        if cells.len() != header_cells.len() {
            return Err(parse_error(
                path,
                line_no,
                format!("expected {} fields, found {}", header_cells.len(), cells.len()),
            ));
        }
        gene_ids.push(cells[0].trim().to_string());
        for &c in &keep {
            let v = parse_value(cells[c])
                .ok_or_else(|| parse_error(path, line_no, format!("invalid number '{}'", cells[c])))?;
            flat.push(v);
        }
    }
    let values = Array2::from_shape_vec((gene_ids.len(), sample_ids.len()), flat)
        .map_err(|e| parse_error(path, header_line, e.to_string()))?;
    debug!(
        "Read {} rows x {} samples from {}",
        gene_ids.len(),
        sample_ids.len(),
        path.display()
    );
    RawExpressionTable::new(gene_ids, sample_ids, values)
}

/// Reads a gene x sample table in which gene ids may repeat.
pub fn read_raw_table(path: &Path) -> Result<RawExpressionTable> {
    parse_table(path, 0, &[])
}

/// Reads a GCT file: two preamble lines, then `Name`, `Description` and one
/// column per sample. The description column is dropped.
pub fn read_gct(path: &Path) -> Result<RawExpressionTable> {
    let records = read_records(path)?;
    let has_description = records
        .get(2)
        .and_then(|(_, header)| header.get(1))
        .is_some_and(|c| c.trim() == "Description");
    if !has_description {
        return Err(AtlasError::InputShape(format!(
            "{} has no Description column in its GCT header",
            path.display()
        )));
    }
    parse_table(path, 2, &["Description"])
}

/// Reads a gene x sample expression table with unique gene ids.
pub fn read_expression(path: &Path) -> Result<ExpressionMatrix> {
    let raw = read_raw_table(path)?;
    ExpressionMatrix::new(raw.gene_ids, raw.sample_ids, raw.values)
}

/// Reads the sample annotation table.
///
/// The first column holds sample ids; the platform comes from
/// `Platform_Category` (or `Platform`) and the dataset from `Dataset` (or
/// `Dataset Name`). Every other column is kept in [`SampleRecord::extra`].
pub fn read_annotations(path: &Path) -> Result<SampleAnnotations> {
    let mut lines = read_records(path)?.into_iter();
    let (_, header) = lines
        .next()
        .ok_or_else(|| parse_error(path, 1, "missing header line"))?;
    let columns: Vec<String> = header.iter().map(|c| c.trim().to_string()).collect();
    let find = |names: &[&str]| {
        names
            .iter()
            .find_map(|name| columns.iter().skip(1).position(|c| c == name).map(|p| p + 1))
    };
    let platform_col = find(&PLATFORM_COLUMNS).ok_or_else(|| {
        AtlasError::InputShape(format!(
            "{} has no {} column",
            path.display(),
            PLATFORM_COLUMNS.join(" / ")
        ))
    })?;
    let dataset_col = find(&DATASET_COLUMNS);

    let mut records = Vec::new();
    for (line_no, line) in lines {
        let cells: Vec<&str> = line.iter().map(|c| c.trim()).collect();
        if cells.len() != columns.len() {
            return Err(parse_error(
                path,
                line_no,
                format!("expected {} fields, found {}", columns.len(), cells.len()),
            ));
        }
        let platform = cells[platform_col];
        if platform.is_empty() || platform == "NA" {
            return Err(parse_error(path, line_no, format!("sample '{}' has no platform", cells[0])));
        }
        let dataset = dataset_col
            .map(|c| cells[c])
            .filter(|d| !d.is_empty() && *d != "NA")
            .map(str::to_string);
        let mut record = SampleRecord::new(cells[0], platform, dataset);
        for (c, name) in columns.iter().enumerate().skip(1) {
            if c != platform_col && Some(c) != dataset_col {
                record.extra.insert(name.clone(), cells[c].to_string());
            }
        }
        records.push(record);
    }
    SampleAnnotations::new(records)
}

/// Two-column probe -> gene table with a header line.
pub fn read_probe_mapping(path: &Path) -> Result<HashMap<String, String>> {
    let mut mapping = HashMap::new();
    for (line_no, line) in read_records(path)?.into_iter().skip(1) {
        let mut cells = line.iter().map(|c| c.trim());
        match (cells.next(), cells.next()) {
            (Some(probe), Some(gene)) if !gene.is_empty() => {
                mapping.insert(probe.to_string(), gene.to_string());
            }
            _ => return Err(parse_error(path, line_no, "expected probe and gene columns")),
        }
    }
    Ok(mapping)
}

/// Loads every dataset in `ids` from `dir` into an explicit map keyed by id.
///
/// A dataset is read from the files whose name starts with its id and ends in
/// `.tsv` or `.gct`. Datasets that cannot be read are logged and left out of
/// the map; if `probe_mapping` is given, row ids are translated through it.
pub fn load_datasets(
    dir: &Path,
    ids: &[String],
    probe_mapping: Option<&HashMap<String, String>>,
) -> Result<BTreeMap<String, RawExpressionTable>> {
    let mut files: Vec<PathBuf> = fs::read_dir(dir)?
        .filter_map(std::result::Result::ok)
        .map(|entry| entry.path())
        .filter(|p| p.is_file())
        .collect();
    files.sort();

    let mut loaded = BTreeMap::new();
    for id in ids {
        for path in &files {
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if !name.starts_with(id.as_str()) {
                continue;
            }
            let table = if name.ends_with(".gct") {
                read_gct(path)
            } else if name.ends_with(".tsv") {
                read_raw_table(path)
            } else {
                continue;
            };
            match table {
                Ok(t) => {
                    let t = match probe_mapping {
                        Some(m) => t.map_row_ids(m),
                        None => t,
                    };
                    if loaded.insert(id.clone(), t).is_some() {
                        warn!("Dataset '{}' matched several files; keeping {}", id, path.display());
                    }
                }
                Err(e) => {
                    warn!("Failed to load dataset '{}' from {}: {}", id, path.display(), e);
                }
            }
        }
    }
    let missing: Vec<&String> = ids.iter().filter(|id| !loaded.contains_key(*id)).collect();
    if !missing.is_empty() {
        warn!("No table loaded for dataset(s) {:?}", missing);
    }
    info!(
        "Successfully loaded datasets {:?}",
        loaded.keys().collect::<Vec<_>>()
    );
    Ok(loaded)
}

fn format_value(v: f64) -> String {
    if v.is_nan() {
        "NA".to_string()
    } else {
        format!("{}", v)
    }
}

/// Writes `matrix` in the layout [`read_expression`] accepts.
pub fn write_expression(path: &Path, matrix: &ExpressionMatrix) -> Result<()> {
    let mut writer = BufWriter::new(File::create(path)?);
    write!(writer, "gene")?;
    for s in matrix.sample_ids() {
        write!(writer, "\t{}", s)?;
    }
    writeln!(writer)?;
    for (i, gene) in matrix.gene_ids().iter().enumerate() {
        write!(writer, "{}", gene)?;
        for &v in matrix.gene_row(i) {
            write!(writer, "\t{}", format_value(v))?;
        }
        writeln!(writer)?;
    }
    writer.flush()?;
    Ok(())
}

/// Writes `annotations` in the layout [`read_annotations`] accepts.
pub fn write_annotations(path: &Path, annotations: &SampleAnnotations) -> Result<()> {
    let extra_columns: Vec<&String> = {
        let mut cols: Vec<&String> = annotations
            .records()
            .iter()
            .flat_map(|r| r.extra.keys())
            .collect();
        cols.sort();
        cols.dedup();
        cols
    };
    let mut writer = BufWriter::new(File::create(path)?);
    write!(writer, "sample_id\tPlatform_Category\tDataset")?;
    for c in &extra_columns {
        write!(writer, "\t{}", c)?;
    }
    writeln!(writer)?;
    for r in annotations.records() {
        write!(
            writer,
            "{}\t{}\t{}",
            r.sample_id,
            r.platform,
            r.dataset.as_deref().unwrap_or("NA")
        )?;
        for c in &extra_columns {
            write!(writer, "\t{}", r.extra.get(*c).map(String::as_str).unwrap_or(""))?;
        }
        writeln!(writer)?;
    }
    writer.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;
    use tempfile::TempDir;

    fn write_file(dir: &TempDir, name: &str, content: &str) -> PathBuf {
        let path = dir.path().join(name);
        let mut f = File::create(&path).unwrap();
        f.write_all(content.as_bytes()).unwrap();
        path
    }

    #[test]
    fn missing_cells_become_nan() {
        let dir = TempDir::new().unwrap();
        let path = write_file(&dir, "e.tsv", "id\ts1\ts2\ts3\ng1\t1.5\tNA\t\ng2\tNaN\t-2\t3e2\n");
        let m = read_expression(&path).unwrap();
        assert_eq!(m.sample_ids(), &["s1", "s2", "s3"]);
        assert_eq!(m.values()[[0, 0]], 1.5);
        assert!(m.values()[[0, 1]].is_nan());
        assert!(m.values()[[0, 2]].is_nan());
        assert!(m.values()[[1, 0]].is_nan());
        assert_eq!(m.values()[[1, 2]], 300.0);
    }

    #[test]
    fn bad_cells_report_their_line() {
        let dir = TempDir::new().unwrap();
        let path = write_file(&dir, "e.tsv", "id\ts1\ng1\t1\ng2\tabc\n");
        match read_expression(&path).unwrap_err() {
            AtlasError::Parse { line, ref reason, .. } => {
                assert_eq!(line, 3);
                assert!(reason.contains("abc"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
        let ragged = write_file(&dir, "r.tsv", "id\ts1\ts2\ng1\t1\n");
        assert!(matches!(read_expression(&ragged), Err(AtlasError::Parse { line: 2, .. })));
    }

    #[test]
    fn quoted_cells_keep_embedded_tabs() {
        let dir = TempDir::new().unwrap();
        let path = write_file(
            &dir,
            "q.tsv",
            "\tPlatform\tDescription\r\ns1\tRNAseq\t\"sorted\tHSC\"\r\n\r\ns2\tAffy\tB cell\r\n",
        );
        let ann = read_annotations(&path).unwrap();
        assert_eq!(ann.len(), 2);
        assert_eq!(
            ann.get("s1").unwrap().extra.get("Description").map(String::as_str),
            Some("sorted\tHSC")
        );
        assert_eq!(ann.get("s2").unwrap().platform, "Affy");
    }

    #[test]
    fn annotation_column_aliases() {
        let dir = TempDir::new().unwrap();
        let path = write_file(
            &dir,
            "s.tsv",
            "\tCell Type\tPlatform\tDataset Name\ns1\tHSC\tIllumina HT12\tGSE1\ns2\tB cell\tRNAseq\tNA\n",
        );
        let ann = read_annotations(&path).unwrap();
        let s1 = ann.get("s1").unwrap();
        assert_eq!(s1.platform, "Illumina HT12");
        assert_eq!(s1.dataset.as_deref(), Some("GSE1"));
        assert_eq!(s1.extra.get("Cell Type").map(String::as_str), Some("HSC"));
        assert_eq!(ann.get("s2").unwrap().dataset, None);

        let no_platform = write_file(&dir, "n.tsv", "\tDataset\ns1\tGSE1\n");
        assert!(matches!(read_annotations(&no_platform), Err(AtlasError::InputShape(_))));
    }

    #[test]
    fn gct_drops_description_and_loader_keys_by_id() {
        let dir = TempDir::new().unwrap();
        write_file(
            &dir,
            "GSE10_expression.gct",
            "#1.2\n2\t2\nName\tDescription\ta\tb\np1\tna\t1\t2\np2\tna\t3\t4\n",
        );
        write_file(&dir, "GSE20.tsv", "id\tc\np1\t5\n");
        write_file(&dir, "GSE30.gct", "#1.2\n1\t1\nName\tc\np1\t5\n");
        write_file(&dir, "unrelated.txt", "x");

        let ids: Vec<String> = ["GSE10", "GSE20", "GSE30"].iter().map(|s| s.to_string()).collect();
        let loaded = load_datasets(dir.path(), &ids, None).unwrap();
        assert_eq!(loaded.keys().collect::<Vec<_>>(), vec!["GSE10", "GSE20"]);
        let gse10 = &loaded["GSE10"];
        assert_eq!(gse10.sample_ids, vec!["a", "b"]);
        assert_eq!(gse10.values[[1, 1]], 4.0);

        let mapping: HashMap<String, String> = [("p1".to_string(), "ENSG1".to_string())].into_iter().collect();
        let mapped = load_datasets(dir.path(), &ids[..1], Some(&mapping)).unwrap();
        assert_eq!(mapped["GSE10"].gene_ids, vec!["ENSG1"]);
    }
}
