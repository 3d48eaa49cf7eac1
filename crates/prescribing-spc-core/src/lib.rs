//! Prescribing SPC Core Library
//!
//! Per-capita prescribing rates for GP practices, with statistical process
//! control and funnel plots to separate genuine outliers from noise.
//!
//! # Architecture
//!
//! ```text
//! datasets.csv → raw prescribing + list-size extracts
//!                         │
//!                 BNF filter, practice/month join
//!                         │
//!                 [Tidy Record Store: tidy.csv]
//!                         │
//!                    Aggregator  (practice | pcn | icb | national)
//!                         │
//!         ┌───────────────┼────────────────┐
//!         │ per unit      │ per unit       │ per period
//!         ▼               ▼                ▼
//!     Smoother        SPC Engine      Funnel Engine
//!         │               │                │
//!         └───────────────┼────────────────┘
//!                         ▼
//!                  Metrics Writer
//!                         │
//!         ┌───────────────┼────────────────┐
//!         ▼               ▼                ▼
//!    metrics.csv     quality.json     SQLite sink
//!   (+ sha256)
//! ```
//!
//! # Core Principle
//!
//! **Missing is never zero.** Undefined rates are excluded and reported, and
//! derived values that cannot be computed are written as `NA` or `pending`.
//!
//! # Modules
//!
//! - [`config`]: Immutable engine configuration loaded from TOML
//! - [`models`]: Domain types (Period, RateObservation, ControlLimits, etc.)
//! - [`ingest`]: Tidy record store and raw extract preparation
//! - [`engine`]: Aggregator, smoother, SPC and funnel engines
//! - [`export`]: Metrics, summary and data-quality exports
//! - [`db`]: Append-only SQLite sink

pub mod config;
pub mod db;
pub mod engine;
pub mod export;
pub mod ingest;
pub mod models;
mod tabular;

// Re-export commonly used types
pub use config::{EngineConfig, Granularity};
pub use db::Database;
pub use engine::{EngineRun, MetricsEngine};
pub use export::{MetricsTable, QualityReportExport, SummaryExport};
pub use ingest::{DatasetManifest, TidyRecordStore};
pub use models::{DataQualityReport, Period, Reported, UnitId};

use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::{info, warn};

/// Errors from any pipeline stage.
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Config error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Ingest error: {0}")]
    Ingest(#[from] ingest::IngestError),

    #[error("Engine error: {0}")]
    Engine(#[from] engine::EngineError),

    #[error("Export error: {0}")]
    Export(#[from] export::ExportError),

    #[error("Database error: {0}")]
    Database(#[from] db::DbError),
}

pub type PipelineResult<T> = Result<T, PipelineError>;

/// Where a run's outputs go.
#[derive(Debug, Clone)]
pub struct OutputPaths {
    pub metrics_csv: PathBuf,
    pub quality_json: PathBuf,
    pub metrics_json: Option<PathBuf>,
    pub sqlite: Option<PathBuf>,
}

impl OutputPaths {
    /// The file outputs, in write order. The SQLite sink is appended to
    /// and is not included.
    pub fn files(&self) -> impl Iterator<Item = &Path> {
        [Some(&self.metrics_csv), self.metrics_json.as_ref(), Some(&self.quality_json)]
            .into_iter()
            .flatten()
            .map(PathBuf::as_path)
    }
}

/// Engine results plus the assembled metrics table.
#[derive(Debug, Clone)]
pub struct PipelineOutput {
    pub run: EngineRun,
    pub table: MetricsTable,
}

/// What was written by [`Pipeline::write_outputs`].
#[derive(Debug, Clone, PartialEq)]
pub struct WrittenOutputs {
    pub metrics_sha256: String,
    pub rows_written: usize,
    pub issues: usize,
}

/// Batch pipeline over one configuration.
pub struct Pipeline {
    engine: MetricsEngine,
}

impl Pipeline {
    /// Create a pipeline; the configuration is validated here.
    pub fn new(config: EngineConfig) -> PipelineResult<Self> {
        Ok(Self {
            engine: MetricsEngine::new(config)?,
        })
    }

    pub fn config(&self) -> &EngineConfig {
        self.engine.config()
    }

    // =========================================================================
    // Ingest
    // =========================================================================

    /// Build the tidy store from a dataset manifest and its raw files.
    pub fn prepare_tidy<P: AsRef<Path>, Q: AsRef<Path>>(
        &self,
        manifest_path: P,
        raw_dir: Q,
    ) -> PipelineResult<Reported<TidyRecordStore>> {
        let manifest = DatasetManifest::from_csv_path(manifest_path)?;
        info!("Manifest lists {} datasets", manifest.entries().len());
        Ok(ingest::load_from_manifest(
            &manifest,
            raw_dir.as_ref(),
            &self.config().ingest,
        )?)
    }

    // =========================================================================
    // Metrics
    // =========================================================================

    /// Run the engine and assemble the metrics table.
    pub fn run(&self, store: &TidyRecordStore) -> PipelineOutput {
        let run = self.engine.run(store);
        let table = MetricsTable::assemble(&run);
        PipelineOutput { run, table }
    }

    /// Write every output of a run. Existing files are never overwritten.
    ///
    /// All target files are checked before anything is written. If a later
    /// step fails, files already written by this call are removed, and the
    /// SQLite rows of the run are stored in a single transaction.
    pub fn write_outputs(
        &self,
        output: &PipelineOutput,
        paths: &OutputPaths,
    ) -> PipelineResult<WrittenOutputs> {
        if let Some(existing) = paths.files().find(|p| p.exists()) {
            return Err(export::ExportError::AlreadyExists(existing.display().to_string()).into());
        }

        let mut written = Vec::new();
        let result = write_run(output, paths, &mut written);
        if result.is_err() {
            for path in written {
                match std::fs::remove_file(path) {
                    Ok(()) => info!("Removed partial output {}", path.display()),
                    Err(e) => warn!("Could not remove partial output {}: {}", path.display(), e),
                }
            }
        }
        result
    }

    // =========================================================================
    // Summary
    // =========================================================================

    /// Whole-history funnel summary per unit.
    pub fn summary(&self, store: &TidyRecordStore) -> PipelineResult<Reported<SummaryExport>> {
        let aggregator = engine::Aggregator::new(self.config().granularity);
        let (rates, report) = aggregator.aggregate(store.records()).into_parts();
        let units = engine::summarize_units(&rates, &self.config().funnel)?;
        Ok(Reported::new(SummaryExport::new(units), report))
    }
}

fn write_run<'p>(
    output: &PipelineOutput,
    paths: &'p OutputPaths,
    written: &mut Vec<&'p Path>,
) -> PipelineResult<WrittenOutputs> {
    let digest = output.table.write_csv(&paths.metrics_csv)?;
    written.push(&paths.metrics_csv);

    if let Some(json_path) = &paths.metrics_json {
        output.table.write_json(json_path)?;
        written.push(json_path);
    }

    let quality =
        QualityReportExport::from_report(&output.run.report, output.table.len(), Some(digest.clone()));
    quality.write_json(&paths.quality_json)?;
    written.push(&paths.quality_json);

    if let Some(db_path) = &paths.sqlite {
        let mut db = Database::open(db_path)?;
        db.insert_run(&output.table, &output.run.report, &digest)?;
        info!("Stored {} metrics rows in {}", output.table.len(), db_path.display());
    }

    Ok(WrittenOutputs {
        metrics_sha256: digest,
        rows_written: output.table.len(),
        issues: output.run.report.len(),
    })
}
