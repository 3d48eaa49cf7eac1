//! Practice summary export.

use std::path::Path;

use serde::Serialize;

use crate::engine::UnitSummary;
use crate::tabular::escape_csv;

use super::{fmt_f64, sha256_hex, write_new_file, ExportResult};

/// Per-unit whole-history summary ready for export.
#[derive(Debug, Clone, Serialize)]
pub struct SummaryExport {
    pub units: Vec<UnitSummary>,
}

impl SummaryExport {
    pub fn new(units: Vec<UnitSummary>) -> Self {
        Self { units }
    }

    /// Export to JSON.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    /// Export to CSV format. `outlier` is `high`, `low` or blank.
    pub fn to_csv(&self) -> String {
        let mut csv = String::new();

        // Header
        csv.push_str("unit_id,periods,total_items,total_list_size,rate_per_1000,expected_rate,lcl95,ucl95,lcl998,ucl998,outlier\n");

        for unit in &self.units {
            csv.push_str(&format!(
                "{},{},{},{},{},{},{},{},{},{},{}\n",
                escape_csv(unit.unit_id.as_str()),
                unit.periods,
                unit.total_items,
                unit.total_list_size,
                fmt_f64(unit.rate),
                fmt_f64(unit.limits.expected_rate),
                fmt_f64(unit.limits.lower_warning),
                fmt_f64(unit.limits.upper_warning),
                fmt_f64(unit.limits.lower_control),
                fmt_f64(unit.limits.upper_control),
                unit.classification.outlier_label(),
            ));
        }

        csv
    }

    /// Write the CSV to a new file and return its SHA-256.
    pub fn write_csv<P: AsRef<Path>>(&self, path: P) -> ExportResult<String> {
        let csv = self.to_csv();
        write_new_file(path, csv.as_bytes())?;
        Ok(sha256_hex(csv.as_bytes()))
    }
}
