//! Trailing-window smoothing of a unit's rate series.

use crate::config::SmoothingConfig;
use crate::models::{
    DataQualityReport, IssueKind, RateObservation, Reported, RollingRate, SmoothedObservation,
};

use super::stats::mean;
use super::{EngineError, EngineResult};

/// Trailing N-period mean over contiguous months.
pub struct Smoother {
    window: usize,
}

impl Smoother {
    pub fn new(config: &SmoothingConfig) -> Self {
        Self {
            window: config.window.max(1),
        }
    }

    pub fn window(&self) -> usize {
        self.window
    }

    /// Smooth one unit's series.
    ///
    /// The series must be strictly increasing by period. A missing month
    /// restarts the window, so the first `window - 1` periods after a gap are
    /// `InsufficientHistory` again.
    pub fn smooth(
        &self,
        series: &[RateObservation],
    ) -> EngineResult<Reported<Vec<SmoothedObservation>>> {
        let mut report = DataQualityReport::new();
        let mut smoothed = Vec::with_capacity(series.len());
        let mut run: Vec<f64> = Vec::with_capacity(self.window);

        for (i, obs) in series.iter().enumerate() {
            if i > 0 {
                let prev = &series[i - 1];
                let step = prev.period().months_until(obs.period());
                if step < 1 {
                    return Err(EngineError::NotChronological {
                        unit_id: obs.unit_id().clone(),
                        period: obs.period(),
                    });
                }
                if step > 1 {
                    report.push(
                        IssueKind::SeriesGap,
                        Some(obs.unit_id()),
                        Some(obs.period()),
                        format!("{} missing months after {}", step - 1, prev.period()),
                    );
                    run.clear();
                }
            }

            if run.len() == self.window {
                run.remove(0);
            }
            run.push(obs.rate());

            let rolling_rate = if run.len() == self.window {
                mean(&run).map_or(RollingRate::InsufficientHistory, RollingRate::Available)
            } else {
                RollingRate::InsufficientHistory
            };
            smoothed.push(SmoothedObservation {
                unit_id: obs.unit_id().clone(),
                period: obs.period(),
                rolling_rate,
            });
        }

        Ok(Reported::new(smoothed, report))
    }
}
