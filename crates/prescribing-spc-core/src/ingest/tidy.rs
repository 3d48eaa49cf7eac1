//! Tidy record store: one normalized row per practice per month.

use std::collections::BTreeSet;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use tracing::info;

use crate::models::{Period, TidyRecord};
use crate::tabular::{escape_csv, non_blank};

use super::{parse_count, parse_period, read_csv_table, IngestError, IngestResult};

/// Read-only snapshot of tidy records for one pipeline run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TidyRecordStore {
    records: Vec<TidyRecord>,
}

impl TidyRecordStore {
    pub fn new(records: Vec<TidyRecord>) -> Self {
        Self { records }
    }

    pub fn records(&self) -> &[TidyRecord] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Distinct periods present in the store.
    pub fn periods(&self) -> BTreeSet<Period> {
        self.records.iter().map(|r| r.period).collect()
    }

    /// Load a tidy CSV file.
    pub fn from_csv_path<P: AsRef<Path>>(path: P) -> IngestResult<Self> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|e| IngestError::io(path, e))?;
        let name = path.display().to_string();
        let store = Self::from_csv_reader(BufReader::new(file), &name)?;
        info!("Loaded {} tidy records from {}", store.len(), name);
        Ok(store)
    }

    /// Load tidy CSV from any reader. `source_name` labels schema errors.
    pub fn from_csv_reader<R: BufRead>(reader: R, source_name: &str) -> IngestResult<Self> {
        let table = read_csv_table(reader, source_name)?;

        let practice_idx = table.require(source_name, "practice_code")?;
        let month_idx = table.require(source_name, "month")?;
        let items_idx = table.require(source_name, "items")?;
        let list_idx = table.require(source_name, "list_size")?;
        let pcn_idx = table.header.index_of("pcn_code");
        let icb_idx = table.header.index_of("icb_code");

        let mut records = Vec::with_capacity(table.rows.len());
        for (line_no, fields) in &table.rows {
            let line_no = *line_no;
            let practice_code = non_blank(fields.get(practice_idx)).ok_or_else(|| {
                IngestError::schema(source_name, line_no, Some("practice_code"), "blank practice code")
            })?;
            let month = non_blank(fields.get(month_idx)).ok_or_else(|| {
                IngestError::schema(source_name, line_no, Some("month"), "blank month")
            })?;

            records.push(TidyRecord {
                practice_code: practice_code.to_string(),
                pcn_code: pcn_idx
                    .and_then(|i| non_blank(fields.get(i)))
                    .map(str::to_string),
                icb_code: icb_idx
                    .and_then(|i| non_blank(fields.get(i)))
                    .map(str::to_string),
                period: parse_period(month, source_name, line_no, "month")?,
                items: parse_count(non_blank(fields.get(items_idx)), source_name, line_no, "items")?,
                list_size: parse_count(
                    non_blank(fields.get(list_idx)),
                    source_name,
                    line_no,
                    "list_size",
                )?,
            });
        }

        Ok(Self { records })
    }

    /// Serialize to tidy CSV. Missing counts are written as empty cells.
    pub fn to_csv(&self) -> String {
        let mut csv = String::new();
        csv.push_str("practice_code,pcn_code,icb_code,month,items,list_size\n");

        for r in &self.records {
            csv.push_str(&format!(
                "{},{},{},{},{},{}\n",
                escape_csv(&r.practice_code),
                escape_csv(r.pcn_code.as_deref().unwrap_or("")),
                escape_csv(r.icb_code.as_deref().unwrap_or("")),
                r.period,
                r.items.map(|n| n.to_string()).unwrap_or_default(),
                r.list_size.map(|n| n.to_string()).unwrap_or_default(),
            ));
        }

        csv
    }
}
