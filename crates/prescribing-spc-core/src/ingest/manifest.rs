//! Dataset manifest listing the raw extracts for each month.
//!
//! Format (lines starting with `#` are comments):
//!
//! ```text
//! month,url,file_name,type
//! 2024-01,https://...,epd_202401.csv,prescribing
//! 2024-01,,list_202401.csv,list_size
//! ```
//!
//! `url` is informational only; fetching is done outside this crate.

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::models::Period;
use crate::tabular::non_blank;

use super::{parse_period, read_csv_table, IngestError, IngestResult};

/// Kind of raw extract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DatasetKind {
    Prescribing,
    ListSize,
}

impl DatasetKind {
    fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "prescribing" => Some(DatasetKind::Prescribing),
            "list_size" => Some(DatasetKind::ListSize),
            _ => None,
        }
    }
}

/// One manifest row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatasetEntry {
    /// Month used when the file has no month column
    pub month: Option<Period>,
    pub url: Option<String>,
    pub file_name: String,
    pub kind: DatasetKind,
}

/// Parsed dataset manifest.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DatasetManifest {
    entries: Vec<DatasetEntry>,
}

impl DatasetManifest {
    pub fn from_csv_path<P: AsRef<Path>>(path: P) -> IngestResult<Self> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|e| IngestError::io(path, e))?;
        Self::from_csv_reader(BufReader::new(file), &path.display().to_string())
    }

    /// Parse a manifest. Rows without a file name or with an unknown type
    /// are skipped with a warning.
    pub fn from_csv_reader<R: BufRead>(reader: R, source_name: &str) -> IngestResult<Self> {
        let table = read_csv_table(reader, source_name)?;
        let month_idx = table.require(source_name, "month")?;
        let file_idx = table.require(source_name, "file_name")?;
        let type_idx = table.require(source_name, "type")?;
        let url_idx = table.header.index_of("url");

        let mut entries = Vec::new();
        for (line_no, fields) in &table.rows {
            let Some(file_name) = non_blank(fields.get(file_idx)) else {
                warn!("{} line {}: no file_name, skipping", source_name, line_no);
                continue;
            };
            let Some(kind) = non_blank(fields.get(type_idx)).and_then(DatasetKind::parse) else {
                warn!("{} line {}: unknown dataset type, skipping", source_name, line_no);
                continue;
            };
            let month = non_blank(fields.get(month_idx))
                .map(|m| parse_period(m, source_name, *line_no, "month"))
                .transpose()?;

            entries.push(DatasetEntry {
                month,
                url: url_idx
                    .and_then(|i| non_blank(fields.get(i)))
                    .map(str::to_string),
                file_name: file_name.to_string(),
                kind,
            });
        }

        Ok(Self { entries })
    }

    pub fn entries(&self) -> &[DatasetEntry] {
        &self.entries
    }

    pub fn of_kind(&self, kind: DatasetKind) -> impl Iterator<Item = &DatasetEntry> {
        self.entries.iter().filter(move |e| e.kind == kind)
    }
}
