//! Funnel-plot models.

use serde::{Deserialize, Serialize};

use super::{Period, UnitId};

/// Position of a unit relative to its funnel control limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FunnelClassification {
    WithinLimits,
    AboveUpper,
    BelowLower,
}

impl FunnelClassification {
    pub fn as_str(&self) -> &'static str {
        match self {
            FunnelClassification::WithinLimits => "within_limits",
            FunnelClassification::AboveUpper => "above_upper",
            FunnelClassification::BelowLower => "below_lower",
        }
    }

    /// Outlier label used in the practice summary (`high`, `low` or blank).
    pub fn outlier_label(&self) -> &'static str {
        match self {
            FunnelClassification::WithinLimits => "",
            FunnelClassification::AboveUpper => "high",
            FunnelClassification::BelowLower => "low",
        }
    }
}

/// Funnel limits for one population size around an expected rate.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FunnelLimits {
    /// Population-weighted cohort rate (funnel center line)
    pub expected_rate: f64,
    /// Half-width at the warning z (default 95%)
    pub warning_width: f64,
    /// Half-width at the control z (default 99.8%)
    pub control_limit_width: f64,
    pub lower_warning: f64,
    pub upper_warning: f64,
    pub lower_control: f64,
    pub upper_control: f64,
}

impl FunnelLimits {
    /// Classify an observed rate against the control limits.
    pub fn classify(&self, observed_rate: f64) -> FunnelClassification {
        if observed_rate > self.upper_control {
            FunnelClassification::AboveUpper
        } else if observed_rate < self.lower_control {
            FunnelClassification::BelowLower
        } else {
            FunnelClassification::WithinLimits
        }
    }
}

/// One unit's position on a period's funnel plot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunnelPoint {
    pub unit_id: UnitId,
    pub period: Period,
    pub observed_rate: f64,
    /// List size
    pub population: u64,
    #[serde(flatten)]
    pub limits: FunnelLimits,
    pub classification: FunnelClassification,
}

impl FunnelPoint {
    pub fn expected_rate(&self) -> f64 {
        self.limits.expected_rate
    }

    pub fn control_limit_width(&self) -> f64 {
        self.limits.control_limit_width
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limits() -> FunnelLimits {
        FunnelLimits {
            expected_rate: 50.0,
            warning_width: 5.0,
            control_limit_width: 8.0,
            lower_warning: 45.0,
            upper_warning: 55.0,
            lower_control: 42.0,
            upper_control: 58.0,
        }
    }

    #[test]
    fn test_classify() {
        let l = limits();
        assert_eq!(l.classify(50.0), FunnelClassification::WithinLimits);
        assert_eq!(l.classify(56.0), FunnelClassification::WithinLimits);
        assert_eq!(l.classify(58.0), FunnelClassification::WithinLimits);
        assert_eq!(l.classify(58.1), FunnelClassification::AboveUpper);
        assert_eq!(l.classify(41.9), FunnelClassification::BelowLower);
    }

    #[test]
    fn test_labels() {
        assert_eq!(FunnelClassification::AboveUpper.as_str(), "above_upper");
        assert_eq!(FunnelClassification::AboveUpper.outlier_label(), "high");
        assert_eq!(FunnelClassification::BelowLower.outlier_label(), "low");
        assert_eq!(FunnelClassification::WithinLimits.outlier_label(), "");
    }
}
