//! Summary statistics over rate series.

use crate::config::SigmaPolicy;

/// d2 bias-correction constant for moving ranges of span 2.
pub const MOVING_RANGE_D2: f64 = 1.128;

pub fn mean(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    Some(values.iter().sum::<f64>() / values.len() as f64)
}

/// Standard deviation with `n - 1` denominator.
pub fn sample_std(values: &[f64]) -> Option<f64> {
    if values.len() < 2 {
        return None;
    }
    let m = mean(values)?;
    let ss: f64 = values.iter().map(|v| (v - m).powi(2)).sum();
    Some((ss / (values.len() - 1) as f64).sqrt())
}

/// Standard deviation with `n` denominator.
pub fn population_std(values: &[f64]) -> Option<f64> {
    let m = mean(values)?;
    let ss: f64 = values.iter().map(|v| (v - m).powi(2)).sum();
    Some((ss / values.len() as f64).sqrt())
}

/// XmR sigma estimate: mean absolute successive difference / d2.
pub fn moving_range_sigma(values: &[f64]) -> Option<f64> {
    if values.len() < 2 {
        return None;
    }
    let ranges: Vec<f64> = values.windows(2).map(|w| (w[1] - w[0]).abs()).collect();
    Some(mean(&ranges)? / MOVING_RANGE_D2)
}

/// Sigma under the configured policy.
pub fn sigma(values: &[f64], policy: SigmaPolicy) -> Option<f64> {
    match policy {
        SigmaPolicy::Sample => sample_std(values),
        SigmaPolicy::Population => population_std(values),
        SigmaPolicy::MovingRange => moving_range_sigma(values),
    }
}
