//! Metrics engine: rates, smoothing, SPC and funnel statistics.
//!
//! Pipeline: Tidy records → Aggregator → (per unit) Smoother + SPC Engine
//!           → (per period) Funnel Engine → [`EngineRun`]
//!
//! Per-cell failures (no valid rows, short baseline, small cohort) are
//! recorded in the run's [`DataQualityReport`] and never abort the run.

mod aggregator;
mod funnel;
mod smoother;
mod spc;
pub mod stats;
mod summary;

pub use aggregator::*;
pub use funnel::*;
pub use smoother::*;
pub use spc::*;
pub use summary::*;

use std::collections::BTreeMap;

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::{ConfigError, EngineConfig};
use crate::ingest::TidyRecordStore;
use crate::models::{
    DataQualityReport, FunnelPoint, IssueKind, Period, RateObservation, SmoothedObservation,
    SpcSeries, UnitId,
};

/// Engine errors.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("No valid rows for {unit_id} in {period}")]
    InsufficientData { unit_id: UnitId, period: Period },

    #[error("Baseline for {unit_id} needs {required} periods, found {available}")]
    InsufficientBaseline {
        unit_id: UnitId,
        required: usize,
        available: usize,
    },

    #[error("Funnel cohort for {period} has {units} units, need at least {required}")]
    EmptyCohort {
        period: Period,
        units: usize,
        required: usize,
    },

    #[error("Summed counts for {unit_id} overflow")]
    CountOverflow { unit_id: UnitId },

    #[error("Series for {unit_id} is not strictly increasing at {period}")]
    NotChronological { unit_id: UnitId, period: Period },

    #[error("{0}")]
    InvalidConfig(#[from] ConfigError),
}

pub type EngineResult<T> = Result<T, EngineError>;

/// Everything computed for one tidy snapshot.
#[derive(Debug, Clone, Default)]
pub struct EngineRun {
    /// Sorted by (unit_id, period)
    pub rates: Vec<RateObservation>,
    pub smoothed: Vec<SmoothedObservation>,
    /// One series per unit with a complete baseline
    pub spc: Vec<SpcSeries>,
    /// Sorted by (period, unit_id)
    pub funnel: Vec<FunnelPoint>,
    pub report: DataQualityReport,
}

/// Result of the per-unit stage.
struct UnitOutcome {
    smoothed: Vec<SmoothedObservation>,
    spc: Option<SpcSeries>,
    report: DataQualityReport,
}

/// Coordinates the engine components over one tidy snapshot.
pub struct MetricsEngine {
    config: EngineConfig,
}

impl MetricsEngine {
    /// Create an engine; the configuration is validated here.
    pub fn new(config: EngineConfig) -> EngineResult<Self> {
        config.validate()?;
        Ok(Self { config })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Run every stage over the store.
    pub fn run(&self, store: &TidyRecordStore) -> EngineRun {
        let aggregator = Aggregator::new(self.config.granularity);
        let (rates, mut report) = aggregator.aggregate(store.records()).into_parts();
        info!(
            "Aggregated {} tidy records into {} {} observations ({} rows excluded)",
            store.len(),
            rates.len(),
            self.config.granularity,
            report.excluded_rows()
        );

        let mut by_unit: BTreeMap<&UnitId, Vec<RateObservation>> = BTreeMap::new();
        for obs in &rates {
            by_unit.entry(obs.unit_id()).or_default().push(obs.clone());
        }
        let series: Vec<(&UnitId, Vec<RateObservation>)> = by_unit.into_iter().collect();

        let outcomes = self.run_units(&series);

        let mut smoothed = Vec::with_capacity(rates.len());
        let mut spc = Vec::new();
        for outcome in outcomes {
            smoothed.extend(outcome.smoothed);
            spc.extend(outcome.spc);
            report.extend(outcome.report);
        }
        info!(
            "Smoothed {} units; {} have SPC baselines",
            series.len(),
            spc.len()
        );

        let funnel = self.run_funnels(&rates, &mut report);
        info!("Computed {} funnel points", funnel.len());

        let pending = report.count(IssueKind::InsufficientBaseline);
        if pending > 0 {
            warn!("{} units lack a full SPC baseline", pending);
        }

        EngineRun {
            rates,
            smoothed,
            spc,
            funnel,
            report,
        }
    }

    /// Units are independent; results keep the input (unit_id) order.
    #[cfg(feature = "parallel")]
    fn run_units(&self, series: &[(&UnitId, Vec<RateObservation>)]) -> Vec<UnitOutcome> {
        use rayon::prelude::*;
        series
            .par_iter()
            .map(|(unit_id, obs)| self.run_unit(unit_id, obs))
            .collect()
    }

    #[cfg(not(feature = "parallel"))]
    fn run_units(&self, series: &[(&UnitId, Vec<RateObservation>)]) -> Vec<UnitOutcome> {
        series
            .iter()
            .map(|(unit_id, obs)| self.run_unit(unit_id, obs))
            .collect()
    }

    /// Smoothing and SPC for one unit's chronological series.
    fn run_unit(&self, unit_id: &UnitId, series: &[RateObservation]) -> UnitOutcome {
        let mut report = DataQualityReport::new();
        debug!("Evaluating {} ({} periods)", unit_id, series.len());

        let smoother = Smoother::new(&self.config.smoothing);
        let smoothed = match smoother.smooth(series) {
            Ok(reported) => {
                let (smoothed, issues) = reported.into_parts();
                report.extend(issues);
                smoothed
            }
            // Aggregator output is sorted and unique per unit.
            Err(e) => {
                warn!("Smoothing skipped for {}: {}", unit_id, e);
                Vec::new()
            }
        };

        let spc_engine = SpcEngine::new(&self.config.spc);
        let spc = match spc_engine.evaluate(series) {
            Ok(reported) => {
                let (series, issues) = reported.into_parts();
                report.extend(issues);
                Some(series)
            }
            Err(e @ EngineError::InsufficientBaseline { .. }) => {
                report.push(IssueKind::InsufficientBaseline, Some(unit_id), None, e.to_string());
                None
            }
            Err(e) => {
                warn!("SPC skipped for {}: {}", unit_id, e);
                None
            }
        };

        UnitOutcome {
            smoothed,
            spc,
            report,
        }
    }

    fn run_funnels(
        &self,
        rates: &[RateObservation],
        report: &mut DataQualityReport,
    ) -> Vec<FunnelPoint> {
        let mut by_period: BTreeMap<Period, Vec<&RateObservation>> = BTreeMap::new();
        for obs in rates {
            by_period.entry(obs.period()).or_default().push(obs);
        }

        let engine = FunnelEngine::new(&self.config.funnel);
        let mut points = Vec::new();
        for (period, cohort) in by_period {
            match engine.evaluate_period(period, cohort) {
                Ok(period_points) => points.extend(period_points),
                Err(e) => report.push(IssueKind::EmptyCohort, None, Some(period), e.to_string()),
            }
        }
        points
    }
}
