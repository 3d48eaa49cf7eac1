//! Input loading: the tidy record store and raw extract preparation.
//!
//! Pipeline: manifest → raw prescribing + list-size extracts → BNF filter →
//! practice/month join → tidy CSV → [`TidyRecordStore`].

mod manifest;
mod raw;
mod tidy;

pub use manifest::*;
pub use raw::*;
pub use tidy::*;

use std::io::BufRead;
use std::path::Path;

use thiserror::Error;

use crate::models::{Period, PeriodParseError};
use crate::tabular::{split_record, Header};

/// Ingest errors. All of them abort the run.
#[derive(Error, Debug)]
pub enum IngestError {
    #[error("Schema error in {source_name} line {line}{}: {reason}", column_suffix(.column))]
    Schema {
        source_name: String,
        line: usize,
        column: Option<String>,
        reason: String,
    },

    #[error("I/O error reading {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

fn column_suffix(column: &Option<String>) -> String {
    column
        .as_ref()
        .map(|c| format!(" column '{}'", c))
        .unwrap_or_default()
}

pub type IngestResult<T> = Result<T, IngestError>;

impl IngestError {
    pub(crate) fn schema(
        source_name: &str,
        line: usize,
        column: Option<&str>,
        reason: impl Into<String>,
    ) -> Self {
        IngestError::Schema {
            source_name: source_name.to_string(),
            line,
            column: column.map(str::to_string),
            reason: reason.into(),
        }
    }

    pub(crate) fn io(path: &Path, source: std::io::Error) -> Self {
        IngestError::Io {
            path: path.display().to_string(),
            source,
        }
    }
}

/// A parsed CSV file: header plus `(line number, fields)` rows.
pub(crate) struct CsvTable {
    pub(crate) header: Header,
    pub(crate) rows: Vec<(usize, Vec<String>)>,
}

impl CsvTable {
    /// Index of a required column, or a schema error naming it.
    pub(crate) fn require(&self, source_name: &str, column: &str) -> IngestResult<usize> {
        self.header.index_of(column).ok_or_else(|| {
            IngestError::schema(source_name, 1, Some(column), "required column is missing")
        })
    }
}

/// Read a whole CSV, skipping blank lines and lines starting with `#`.
///
/// Every data row must have as many fields as the header.
pub(crate) fn read_csv_table<R: BufRead>(reader: R, source_name: &str) -> IngestResult<CsvTable> {
    let mut lines = reader
        .lines()
        .enumerate()
        .map(|(idx, line)| {
            line.map(|l| (idx + 1, l))
                .map_err(|e| IngestError::io(Path::new(source_name), e))
        })
        .filter(|line| match line {
            Ok((_, l)) => !(l.trim().is_empty() || l.starts_with('#')),
            Err(_) => true,
        });

    let (header_line, header_text) = lines
        .next()
        .transpose()?
        .ok_or_else(|| IngestError::schema(source_name, 1, None, "missing header row"))?;
    let header = Header::parse(&header_text)
        .map_err(|e| IngestError::schema(source_name, header_line, None, e))?;

    let mut rows = Vec::new();
    for line in lines {
        let (line_no, text) = line?;
        let fields = split_record(&text)
            .map_err(|e| IngestError::schema(source_name, line_no, None, e))?;
        if fields.len() != header.len() {
            return Err(IngestError::schema(
                source_name,
                line_no,
                None,
                format!("expected {} fields, found {}", header.len(), fields.len()),
            ));
        }
        rows.push((line_no, fields));
    }

    Ok(CsvTable { header, rows })
}

/// Parse a count cell: blank/NA is missing, otherwise a non-negative integer.
///
/// Whole-number floats such as `8123.0` are accepted because spreadsheet and
/// dataframe exports often widen integer columns that contain gaps.
/// Largest count accepted from input files; it must fit an SQLite INTEGER.
pub(crate) const MAX_COUNT: u64 = i64::MAX as u64;

pub(crate) fn parse_count(
    raw: Option<&str>,
    source_name: &str,
    line: usize,
    column: &str,
) -> IngestResult<Option<u64>> {
    let Some(value) = raw else {
        return Ok(None);
    };
    let too_large = || {
        IngestError::schema(
            source_name,
            line,
            Some(column),
            format!("count '{}' exceeds {}", value, MAX_COUNT),
        )
    };
    if let Ok(n) = value.parse::<u64>() {
        return if n <= MAX_COUNT { Ok(Some(n)) } else { Err(too_large()) };
    }
    match value.parse::<f64>() {
        Ok(f) if f.is_finite() && f >= 0.0 && f.fract() == 0.0 => {
            // 2^63 is the first float above MAX_COUNT
            if f < MAX_COUNT as f64 {
                Ok(Some(f as u64))
            } else {
                Err(too_large())
            }
        }
        _ => Err(IngestError::schema(
            source_name,
            line,
            Some(column),
            format!("expected a non-negative integer, got '{}'", value),
        )),
    }
}

pub(crate) fn parse_period(
    raw: &str,
    source_name: &str,
    line: usize,
    column: &str,
) -> IngestResult<Period> {
    Period::parse(raw).map_err(|e: PeriodParseError| {
        IngestError::schema(source_name, line, Some(column), e.to_string())
    })
}
