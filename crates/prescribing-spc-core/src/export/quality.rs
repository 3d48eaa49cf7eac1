//! Data-quality report export.

use std::collections::BTreeMap;
use std::path::Path;

use serde::Serialize;

use crate::models::{DataQualityReport, QualityIssue};

use super::{write_new_file, ExportResult};

/// Run-level quality report written beside the metrics table.
///
/// Contains no timestamps so identical input gives an identical report.
#[derive(Debug, Clone, Serialize)]
pub struct QualityReportExport {
    /// SHA-256 of the metrics CSV this report accompanies
    pub output_sha256: Option<String>,
    pub rows_written: usize,
    pub excluded_rows: usize,
    pub issue_counts: BTreeMap<String, usize>,
    pub issues: Vec<QualityIssue>,
}

impl QualityReportExport {
    pub fn from_report(
        report: &DataQualityReport,
        rows_written: usize,
        output_sha256: Option<String>,
    ) -> Self {
        Self {
            output_sha256,
            rows_written,
            excluded_rows: report.excluded_rows(),
            issue_counts: report
                .counts()
                .into_iter()
                .map(|(kind, n)| (kind.as_str().to_string(), n))
                .collect(),
            issues: report.issues().to_vec(),
        }
    }

    /// Export to JSON.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    /// Write the JSON report to a new file.
    pub fn write_json<P: AsRef<Path>>(&self, path: P) -> ExportResult<()> {
        let json = self.to_json()?;
        write_new_file(path, json.as_bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{IssueKind, Period, UnitId};

    #[test]
    fn test_quality_export() {
        let mut report = DataQualityReport::new();
        let unit = UnitId::new("A81001");
        report.push(IssueKind::ZeroListSize, Some(&unit), Period::new(2024, 1), "zero");
        report.push(IssueKind::ZeroListSize, Some(&unit), Period::new(2024, 2), "zero");
        report.push(IssueKind::SeriesGap, Some(&unit), Period::new(2024, 4), "gap");

        let export = QualityReportExport::from_report(&report, 10, Some("ab12".into()));
        assert_eq!(export.excluded_rows, 2);
        assert_eq!(export.issue_counts["zero_list_size"], 2);

        let value: serde_json::Value = serde_json::from_str(&export.to_json().unwrap()).unwrap();
        assert_eq!(value["output_sha256"], "ab12");
        assert_eq!(value["issues"][2]["kind"], "series_gap");
        assert_eq!(value["issues"][0]["period"], "2024-01");
    }

    #[test]
    fn test_write_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("quality.json");
        let export = QualityReportExport::from_report(&DataQualityReport::new(), 0, None);
        export.write_json(&path).unwrap();
        assert!(std::fs::read_to_string(&path).unwrap().contains("\"rows_written\": 0"));
    }
}
