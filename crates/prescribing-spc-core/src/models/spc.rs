//! Control-limit and SPC classification models.

use serde::{Deserialize, Serialize};

use super::{Period, UnitId};

/// Relative tolerance below which a sigma counts as zero and a point counts
/// as sitting on the center line.
pub const DEGENERATE_TOLERANCE: f64 = 1e-9;

/// Baseline control limits for one unit.
///
/// Invariant: `lower(k) <= center <= upper(k)` for k in 1..=3, lower bands
/// floored at zero.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ControlLimits {
    pub center: f64,
    pub sigma: f64,
    pub upper_1: f64,
    pub upper_2: f64,
    pub upper_3: f64,
    pub lower_1: f64,
    pub lower_2: f64,
    pub lower_3: f64,
}

impl ControlLimits {
    /// Build the 1σ/2σ/3σ bands around `center`.
    pub fn new(center: f64, sigma: f64) -> Self {
        let sigma = sigma.max(0.0);
        let (lower_1, upper_1) = band(center, sigma, 1.0);
        let (lower_2, upper_2) = band(center, sigma, 2.0);
        let (lower_3, upper_3) = band(center, sigma, 3.0);
        Self {
            center,
            sigma,
            upper_1,
            upper_2,
            upper_3,
            lower_1,
            lower_2,
            lower_3,
        }
    }

    /// `(lower, upper)` at an arbitrary sigma multiplier.
    pub fn band(&self, multiplier: f64) -> (f64, f64) {
        band(self.center, self.sigma, multiplier)
    }

    /// Absolute tolerance used when comparing against the center line.
    pub fn tolerance(&self) -> f64 {
        DEGENERATE_TOLERANCE * self.center.abs().max(1.0)
    }

    /// True when the baseline had no measurable variation.
    pub fn is_degenerate(&self) -> bool {
        self.sigma <= self.tolerance()
    }
}

fn band(center: f64, sigma: f64, multiplier: f64) -> (f64, f64) {
    let width = sigma * multiplier;
    ((center - width).max(0.0), center + width)
}

/// Classification of one observation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SpcFlag {
    Normal,
    Warning,
    SpecialCause,
}

impl SpcFlag {
    pub fn as_str(&self) -> &'static str {
        match self {
            SpcFlag::Normal => "normal",
            SpcFlag::Warning => "warning",
            SpcFlag::SpecialCause => "special_cause",
        }
    }
}

/// Rule that raised a non-normal flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SpcRule {
    /// Outside the control (3σ) band
    BeyondControlLimit,
    /// Long run on one side of the center line
    Shift,
    /// Long run of strictly rising or falling points
    Trend,
    /// Outside the warning (2σ) band
    BeyondWarningLimit,
}

/// One classified observation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpcPoint {
    pub period: Period,
    pub rate: f64,
    pub flag: SpcFlag,
    pub rule: Option<SpcRule>,
}

/// A unit's classified series and the limits it was judged against.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpcSeries {
    pub unit_id: UnitId,
    pub limits: ControlLimits,
    /// First and last period of the baseline window
    pub baseline_start: Period,
    pub baseline_end: Period,
    pub points: Vec<SpcPoint>,
}

impl SpcSeries {
    /// Points flagged as special cause.
    pub fn signals(&self) -> impl Iterator<Item = &SpcPoint> {
        self.points
            .iter()
            .filter(|p| p.flag == SpcFlag::SpecialCause)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_limits_ordering() {
        let limits = ControlLimits::new(20.0, 4.0);
        assert_eq!(limits.upper_2, 28.0);
        assert_eq!(limits.lower_2, 12.0);
        assert!(limits.lower_3 <= limits.center && limits.center <= limits.upper_3);
        assert!(!limits.is_degenerate());
    }

    #[test]
    fn test_lower_limits_floored_at_zero() {
        let limits = ControlLimits::new(5.0, 4.0);
        assert_eq!(limits.lower_1, 1.0);
        assert_eq!(limits.lower_2, 0.0);
        assert_eq!(limits.lower_3, 0.0);
        assert_eq!(limits.band(10.0).0, 0.0);
    }

    #[test]
    fn test_degenerate_limits() {
        let limits = ControlLimits::new(10.0, 0.0);
        assert!(limits.is_degenerate());
        assert_eq!(limits.upper_3, 10.0);
        assert_eq!(limits.lower_3, 10.0);
    }

    #[test]
    fn test_flag_serialization() {
        assert_eq!(
            serde_json::to_string(&SpcFlag::SpecialCause).unwrap(),
            "\"special_cause\""
        );
        assert_eq!(SpcFlag::Warning.as_str(), "warning");
    }
}
