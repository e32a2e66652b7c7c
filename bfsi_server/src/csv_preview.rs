//! Bounded JSON preview of a CSV file.

use common::CsvPreview;
use std::path::{Path, PathBuf};

#[derive(Debug, thiserror::Error)]
pub enum CsvPreviewError {
    #[error("CSV support is not available in this build (enable the csv-preview feature).")]
    Unavailable,
    #[error("CSV file not found at: {0}. Please verify the file path is correct.")]
    NotFound(String),
    #[error("Error parsing CSV file: {0}")]
    Parse(String),
    #[error("Permission denied: Cannot read file at {0}")]
    PermissionDenied(String),
    #[error("Error reading CSV file: {0}")]
    Io(String),
}

#[derive(Debug, Clone)]
pub struct CsvPreviewer {
    path: PathBuf,
    preview_rows: usize,
}

impl CsvPreviewer {
    pub fn new(path: impl Into<PathBuf>, preview_rows: usize) -> Self {
        Self {
            path: path.into(),
            preview_rows,
        }
    }

    pub fn enabled() -> bool {
        cfg!(feature = "csv-preview")
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn preview(&self) -> Result<CsvPreview, CsvPreviewError> {
        if !Self::enabled() {
            return Err(CsvPreviewError::Unavailable);
        }
        if !self.path.exists() {
            return Err(CsvPreviewError::NotFound(self.path.display().to_string()));
        }
        reader::read_preview(&self.path, self.preview_rows)
    }
}

#[cfg_attr(not(feature = "csv-preview"), allow(dead_code))]
fn empty_preview() -> CsvPreview {
    CsvPreview {
        data: Vec::new(),
        columns: Vec::new(),
        total_rows: 0,
        displayed_rows: 0,
        message: Some("CSV file is empty".to_string()),
    }
}

#[cfg(feature = "csv-preview")]
mod reader {
    use super::{empty_preview, CsvPreviewError};
    use common::CsvPreview;
    use serde_json::{Map, Number, Value};
    use std::collections::{HashMap, HashSet};
    use std::fs::File;
    use std::io;
    use std::path::Path;

    /// Cell contents treated as missing values.
    const MISSING_MARKERS: [&str; 19] = [
        "", "#N/A", "#N/A N/A", "#NA", "-1.#IND", "-1.#QNAN", "-NaN", "-nan", "1.#IND",
        "1.#QNAN", "<NA>", "N/A", "NA", "NULL", "NaN", "None", "n/a", "nan", "null",
    ];

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub(super) enum ColumnKind {
        Integer,
        Float,
        Boolean,
        Text,
    }

    fn is_missing(raw: &str) -> bool {
        MISSING_MARKERS.contains(&raw)
    }

    fn parse_bool(raw: &str) -> Option<bool> {
        match raw {
            "True" | "true" | "TRUE" => Some(true),
            "False" | "false" | "FALSE" => Some(false),
            _ => None,
        }
    }

    fn kind_of(raw: &str) -> ColumnKind {
        if raw.parse::<i64>().is_ok() {
            ColumnKind::Integer
        } else if raw.parse::<f64>().is_ok() {
            ColumnKind::Float
        } else if parse_bool(raw).is_some() {
            ColumnKind::Boolean
        } else {
            ColumnKind::Text
        }
    }

    fn widen(a: ColumnKind, b: ColumnKind) -> ColumnKind {
        match (a, b) {
            (x, y) if x == y => x,
            (ColumnKind::Integer, ColumnKind::Float) | (ColumnKind::Float, ColumnKind::Integer) => {
                ColumnKind::Float
            }
            _ => ColumnKind::Text,
        }
    }

    /// Running column type, fed every cell of the file.
    #[derive(Debug, Default, Clone, Copy)]
    pub(super) struct KindTally {
        kind: Option<ColumnKind>,
        has_missing: bool,
    }

    impl KindTally {
        pub(super) fn observe(&mut self, raw: &str) {
            if is_missing(raw) {
                self.has_missing = true;
                return;
            }
            let kind = kind_of(raw);
            self.kind = Some(match self.kind {
                Some(seen) => widen(seen, kind),
                None => kind,
            });
        }

        /// Integer columns with gaps become floats.
        pub(super) fn finish(self) -> ColumnKind {
            match self.kind {
                Some(ColumnKind::Integer) if self.has_missing => ColumnKind::Float,
                Some(kind) => kind,
                None => ColumnKind::Text,
            }
        }
    }

    /// Narrowest type every value in the column fits.
    #[cfg(test)]
    pub(super) fn infer_kind<'a>(values: impl Iterator<Item = &'a str>) -> ColumnKind {
        let mut tally = KindTally::default();
        for value in values {
            tally.observe(value);
        }
        tally.finish()
    }

    pub(super) fn to_json(raw: &str, kind: ColumnKind) -> Value {
        if is_missing(raw) {
            return Value::Null;
        }
        match kind {
            ColumnKind::Integer => raw.parse::<i64>().map(Value::from).unwrap_or(Value::Null),
            ColumnKind::Float => raw
                .parse::<f64>()
                .ok()
                .and_then(Number::from_f64)
                .map(Value::Number)
                .unwrap_or(Value::Null),
            ColumnKind::Boolean => parse_bool(raw).map(Value::Bool).unwrap_or(Value::Null),
            ColumnKind::Text => Value::String(raw.to_string()),
        }
    }

    /// Repeated header names become `name`, `name.1`, `name.2`, ... skipping
    /// any suffix that is already taken by another header.
    pub(super) fn dedupe_columns<'a>(headers: impl Iterator<Item = &'a str>) -> Vec<String> {
        let headers: Vec<&str> = headers.collect();
        let mut taken: HashSet<String> = headers.iter().map(|h| h.to_string()).collect();
        let mut counts: HashMap<&str, usize> = HashMap::new();
        let mut emitted: HashSet<String> = HashSet::new();
        let mut columns = Vec::with_capacity(headers.len());

        for header in headers {
            let name = if emitted.contains(header) {
                let count = counts.entry(header).or_insert(0);
                loop {
                    *count += 1;
                    let candidate = format!("{}.{}", header, count);
                    if !taken.contains(&candidate) {
                        break candidate;
                    }
                }
            } else {
                header.to_string()
            };
            taken.insert(name.clone());
            emitted.insert(name.clone());
            columns.push(name);
        }
        columns
    }

    fn io_error(err: io::Error, path: &Path) -> CsvPreviewError {
        match err.kind() {
            io::ErrorKind::NotFound => CsvPreviewError::NotFound(path.display().to_string()),
            io::ErrorKind::PermissionDenied => {
                CsvPreviewError::PermissionDenied(path.display().to_string())
            }
            _ => CsvPreviewError::Io(err.to_string()),
        }
    }

    fn csv_error(err: csv::Error, path: &Path) -> CsvPreviewError {
        let message = err.to_string();
        match err.into_kind() {
            csv::ErrorKind::Io(e) => io_error(e, path),
            csv::ErrorKind::Utf8 { .. } | csv::ErrorKind::UnequalLengths { .. } => {
                CsvPreviewError::Parse(message)
            }
            _ => CsvPreviewError::Io(message),
        }
    }

    pub(super) fn read_preview(path: &Path, preview_rows: usize) -> Result<CsvPreview, CsvPreviewError> {
        let file = File::open(path).map_err(|e| io_error(e, path))?;
        // Short rows are padded with missing values; long rows are rejected below.
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(true)
            .flexible(true)
            .from_reader(file);

        let headers = reader.headers().map_err(|e| csv_error(e, path))?.clone();
        if headers.is_empty() {
            return Ok(empty_preview());
        }
        let width = headers.len();

        let mut rows = Vec::with_capacity(preview_rows);
        let mut tallies = vec![KindTally::default(); width];
        let mut total_rows = 0usize;
        for record in reader.records() {
            let record = record.map_err(|e| csv_error(e, path))?;
            if record.len() > width {
                return Err(too_many_fields(&record, width));
            }
            for (i, tally) in tallies.iter_mut().enumerate() {
                tally.observe(record.get(i).unwrap_or(""));
            }
            total_rows += 1;
            if rows.len() < preview_rows {
                rows.push(record);
            }
        }

        if total_rows == 0 {
            return Ok(empty_preview());
        }

        let columns = dedupe_columns(headers.iter());
        let kinds: Vec<ColumnKind> = tallies.into_iter().map(KindTally::finish).collect();

        let data: Vec<Map<String, Value>> = rows
            .iter()
            .map(|record| {
                columns
                    .iter()
                    .zip(&kinds)
                    .enumerate()
                    .map(|(i, (name, kind))| {
                        (name.clone(), to_json(record.get(i).unwrap_or(""), *kind))
                    })
                    .collect()
            })
            .collect();

        Ok(CsvPreview {
            displayed_rows: data.len(),
            data,
            columns,
            total_rows,
            message: None,
        })
    }

    fn too_many_fields(record: &csv::StringRecord, width: usize) -> CsvPreviewError {
        let line = record
            .position()
            .map(|p| p.line().to_string())
            .unwrap_or_else(|| "?".to_string());
        CsvPreviewError::Parse(format!(
            "Expected {} fields in line {}, saw {}",
            width,
            line,
            record.len()
        ))
    }
}

#[cfg(not(feature = "csv-preview"))]
mod reader {
    use super::CsvPreviewError;
    use common::CsvPreview;
    use std::path::Path;

    pub(super) fn read_preview(_path: &Path, _preview_rows: usize) -> Result<CsvPreview, CsvPreviewError> {
        Err(CsvPreviewError::Unavailable)
    }
}
