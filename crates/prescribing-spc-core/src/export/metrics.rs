//! Metrics writer: one row per (unit, period) joining every engine output.

use std::collections::HashMap;
use std::path::Path;

use serde::Serialize;
use tracing::info;

use crate::engine::EngineRun;
use crate::models::{
    ControlLimits, FunnelClassification, FunnelPoint, Period, SpcFlag, UnitId,
};
use crate::tabular::escape_csv;

use super::{fmt_f64, fmt_opt_f64, sha256_hex, write_new_file, ExportResult};

/// Column order of the metrics CSV.
pub const METRICS_COLUMNS: [&str; 11] = [
    "unit_id",
    "period",
    "items",
    "list_size",
    "rate",
    "rolling_rate",
    "spc_flag",
    "funnel_expected",
    "funnel_limit_upper",
    "funnel_limit_lower",
    "funnel_classification",
];

/// One output row.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricsRow {
    pub unit_id: UnitId,
    pub period: Period,
    pub items: u64,
    pub list_size: u64,
    pub rate: f64,
    pub rolling_rate: Option<f64>,
    /// `None` while the unit has no complete baseline
    pub spc_flag: Option<SpcFlag>,
    pub funnel_expected: Option<f64>,
    pub funnel_limit_upper: Option<f64>,
    pub funnel_limit_lower: Option<f64>,
    pub funnel_classification: Option<FunnelClassification>,
}

impl MetricsRow {
    fn to_csv_line(&self) -> String {
        format!(
            "{},{},{},{},{},{},{},{},{},{},{}\n",
            escape_csv(self.unit_id.as_str()),
            self.period,
            self.items,
            self.list_size,
            fmt_f64(self.rate),
            fmt_opt_f64(self.rolling_rate),
            self.spc_flag.map_or("pending", |f| f.as_str()),
            fmt_opt_f64(self.funnel_expected),
            fmt_opt_f64(self.funnel_limit_upper),
            fmt_opt_f64(self.funnel_limit_lower),
            self.funnel_classification.map_or("NA", |c| c.as_str()),
        )
    }
}

/// A unit's baseline limits, carried in the JSON export.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UnitControlLimits {
    pub unit_id: UnitId,
    pub baseline_start: Period,
    pub baseline_end: Period,
    #[serde(flatten)]
    pub limits: ControlLimits,
}

/// The assembled metrics table, sorted by (unit_id, period).
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MetricsTable {
    rows: Vec<MetricsRow>,
    control_limits: Vec<UnitControlLimits>,
}

impl MetricsTable {
    /// Join an engine run's outputs by (unit_id, period).
    pub fn assemble(run: &EngineRun) -> Self {
        let smoothed: HashMap<(&UnitId, Period), Option<f64>> = run
            .smoothed
            .iter()
            .map(|s| ((&s.unit_id, s.period), s.rolling_rate.value()))
            .collect();
        let flags: HashMap<(&UnitId, Period), SpcFlag> = run
            .spc
            .iter()
            .flat_map(|series| {
                series
                    .points
                    .iter()
                    .map(move |p| ((&series.unit_id, p.period), p.flag))
            })
            .collect();
        let funnel: HashMap<(&UnitId, Period), &FunnelPoint> = run
            .funnel
            .iter()
            .map(|p| ((&p.unit_id, p.period), p))
            .collect();

        let rows = run
            .rates
            .iter()
            .map(|obs| {
                let key = (obs.unit_id(), obs.period());
                let point = funnel.get(&key);
                MetricsRow {
                    unit_id: obs.unit_id().clone(),
                    period: obs.period(),
                    items: obs.items(),
                    list_size: obs.list_size(),
                    rate: obs.rate(),
                    rolling_rate: smoothed.get(&key).copied().flatten(),
                    spc_flag: flags.get(&key).copied(),
                    funnel_expected: point.map(|p| p.limits.expected_rate),
                    funnel_limit_upper: point.map(|p| p.limits.upper_control),
                    funnel_limit_lower: point.map(|p| p.limits.lower_control),
                    funnel_classification: point.map(|p| p.classification),
                }
            })
            .collect();

        let control_limits = run
            .spc
            .iter()
            .map(|series| UnitControlLimits {
                unit_id: series.unit_id.clone(),
                baseline_start: series.baseline_start,
                baseline_end: series.baseline_end,
                limits: series.limits,
            })
            .collect();

        Self {
            rows,
            control_limits,
        }
    }

    pub fn rows(&self) -> &[MetricsRow] {
        &self.rows
    }

    pub fn control_limits(&self) -> &[UnitControlLimits] {
        &self.control_limits
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Export to CSV. Numbers use six fixed decimals, absent values `NA`
    /// and SPC flags without a baseline `pending`.
    pub fn to_csv(&self) -> String {
        let mut csv = String::new();

        // Header
        csv.push_str(&METRICS_COLUMNS.join(","));
        csv.push('\n');

        for row in &self.rows {
            csv.push_str(&row.to_csv_line());
        }

        csv
    }

    /// Export rows and per-unit control limits to JSON.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    /// Write the CSV to a new file and return its SHA-256.
    pub fn write_csv<P: AsRef<Path>>(&self, path: P) -> ExportResult<String> {
        let csv = self.to_csv();
        write_new_file(path.as_ref(), csv.as_bytes())?;
        let digest = sha256_hex(csv.as_bytes());
        info!(
            "Wrote {} metrics rows to {} (sha256 {})",
            self.rows.len(),
            path.as_ref().display(),
            digest
        );
        Ok(digest)
    }

    /// Write the JSON export to a new file.
    pub fn write_json<P: AsRef<Path>>(&self, path: P) -> ExportResult<()> {
        let json = self.to_json()?;
        write_new_file(path, json.as_bytes())
    }
}
