//! Funnel engine: population-scaled limits around a cohort's expected rate.

use tracing::warn;

use crate::config::{FunnelConfig, VarianceModel};
use crate::models::{FunnelLimits, FunnelPoint, Period, RateObservation};

use super::{EngineError, EngineResult};

/// Computes funnel limits for one period's cohort of units.
pub struct FunnelEngine<'a> {
    config: &'a FunnelConfig,
}

impl<'a> FunnelEngine<'a> {
    pub fn new(config: &'a FunnelConfig) -> Self {
        Self { config }
    }

    /// Population-weighted cohort rate: `Σitems / Σlist_size * 1000`.
    pub fn expected_rate<'o, I>(&self, cohort: I) -> Option<f64>
    where
        I: IntoIterator<Item = &'o RateObservation>,
    {
        // summed in u128; a cohort of u64 counts can exceed u64::MAX
        let (items, list_size) = cohort.into_iter().fold((0u128, 0u128), |(i, l), o| {
            (i + u128::from(o.items()), l + u128::from(o.list_size()))
        });
        (list_size > 0).then(|| items as f64 * 1000.0 / list_size as f64)
    }

    /// Variance of a per-1000 rate before dividing by population.
    ///
    /// The binomial form goes non-positive once the expected rate reaches
    /// 1000 per 1000, so it falls back to Poisson there.
    fn variance(&self, expected_rate: f64) -> f64 {
        match self.config.variance_model {
            VarianceModel::Binomial if expected_rate < 1000.0 => {
                expected_rate * (1.0 - expected_rate / 1000.0)
            }
            _ => expected_rate,
        }
    }

    /// Half-width of the funnel at `z` for a population.
    pub fn half_width(&self, z: f64, expected_rate: f64, population: u64) -> Option<f64> {
        if population == 0 {
            return None;
        }
        let se = (self.variance(expected_rate).max(0.0) / population as f64).sqrt();
        Some(z * se * self.config.scaling_constant)
    }

    /// Warning and control limits for one population. `None` for an empty
    /// population.
    pub fn limits(&self, expected_rate: f64, population: u64) -> Option<FunnelLimits> {
        let warning_width = self.half_width(self.config.z_warning, expected_rate, population)?;
        let control_limit_width =
            self.half_width(self.config.z_control, expected_rate, population)?;

        Some(FunnelLimits {
            expected_rate,
            warning_width,
            control_limit_width,
            lower_warning: (expected_rate - warning_width).max(0.0),
            upper_warning: expected_rate + warning_width,
            lower_control: (expected_rate - control_limit_width).max(0.0),
            upper_control: expected_rate + control_limit_width,
        })
    }

    /// Place every unit of one period on that period's funnel.
    ///
    /// Fails with [`EngineError::EmptyCohort`] when the cohort is smaller
    /// than `min_cohort`.
    pub fn evaluate_period<'o, I>(&self, period: Period, cohort: I) -> EngineResult<Vec<FunnelPoint>>
    where
        I: IntoIterator<Item = &'o RateObservation>,
    {
        let cohort: Vec<&RateObservation> = cohort.into_iter().collect();
        let required = self.config.min_cohort.max(2);
        if cohort.len() < required {
            return Err(EngineError::EmptyCohort {
                period,
                units: cohort.len(),
                required,
            });
        }

        let expected_rate = self
            .expected_rate(cohort.iter().copied())
            .ok_or(EngineError::EmptyCohort {
                period,
                units: cohort.len(),
                required,
            })?;
        if self.config.variance_model == VarianceModel::Binomial && expected_rate >= 1000.0 {
            warn!(
                "Expected rate {:.3} for {} exceeds 1000; using Poisson variance",
                expected_rate, period
            );
        }

        Ok(cohort
            .into_iter()
            .filter_map(|obs| {
                let limits = self.limits(expected_rate, obs.list_size())?;
                Some(FunnelPoint {
                    unit_id: obs.unit_id().clone(),
                    period,
                    observed_rate: obs.rate(),
                    population: obs.list_size(),
                    classification: limits.classify(obs.rate()),
                    limits,
                })
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{FunnelClassification, PrescribingObservation};

    fn obs(unit: &str, items: u64, list_size: u64) -> RateObservation {
        RateObservation::new(PrescribingObservation {
            unit_id: unit.into(),
            period: Period::new(2024, 1).unwrap(),
            items,
            list_size,
        })
        .unwrap()
    }

    #[test]
    fn test_expected_rate_is_population_weighted() {
        let config = FunnelConfig::default();
        let engine = FunnelEngine::new(&config);
        let cohort = [obs("A", 1, 10), obs("B", 99, 50_000)];
        let expected = engine.expected_rate(&cohort).unwrap();
        assert!((expected - 100.0 / 50_010.0 * 1000.0).abs() < 1e-12);
    }

    #[test]
    fn test_expected_rate_sums_past_u64() {
        let config = FunnelConfig::default();
        let engine = FunnelEngine::new(&config);
        let cohort = [obs("A", u64::MAX - 1, 1000), obs("B", 5, 1000)];
        let expected = engine.expected_rate(&cohort).unwrap();
        assert!(expected.is_finite());
        assert!((expected / (u64::MAX as f64 / 2.0) - 1.0).abs() < 1e-9);
        let empty: Vec<RateObservation> = Vec::new();
        assert!(engine.expected_rate(&empty).is_none());
    }

    #[test]
    fn test_width_shrinks_with_population() {
        let config = FunnelConfig::default();
        let engine = FunnelEngine::new(&config);
        let small = engine.limits(50.0, 100).unwrap();
        let large = engine.limits(50.0, 10_000).unwrap();

        assert!(small.control_limit_width > large.control_limit_width);
        assert!(small.upper_control > large.upper_control);
        assert!(small.lower_control <= large.lower_control);
        // 1/sqrt(n) scaling
        let ratio = small.control_limit_width / large.control_limit_width;
        assert!((ratio - 10.0).abs() < 1e-9);
    }

    #[test]
    fn test_binomial_width_matches_proportion_formula() {
        let config = FunnelConfig::default();
        let engine = FunnelEngine::new(&config);
        let limits = engine.limits(50.0, 4000).unwrap();
        let p: f64 = 0.05;
        let expected_width = 3.09 * (p * (1.0 - p) / 4000.0).sqrt() * 1000.0;
        assert!((limits.control_limit_width - expected_width).abs() < 1e-9);
        assert!(limits.lower_warning > limits.lower_control);
    }

    #[test]
    fn test_lower_limit_floored_and_empty_population() {
        let config = FunnelConfig::default();
        let engine = FunnelEngine::new(&config);
        let limits = engine.limits(1.0, 10).unwrap();
        assert_eq!(limits.lower_control, 0.0);
        assert!(engine.limits(1.0, 0).is_none());
    }

    #[test]
    fn test_poisson_fallback_above_1000() {
        let config = FunnelConfig::default();
        let engine = FunnelEngine::new(&config);
        let limits = engine.limits(1500.0, 100).unwrap();
        assert!(limits.control_limit_width > 0.0);
    }

    #[test]
    fn test_evaluate_period_classifies() {
        let config = FunnelConfig::default();
        let engine = FunnelEngine::new(&config);
        let cohort = vec![
            obs("A", 50, 1000),
            obs("B", 500, 10_000),
            obs("C", 500, 10_000),
            obs("D", 900, 10_000),
        ];
        let points = engine
            .evaluate_period(Period::new(2024, 1).unwrap(), &cohort)
            .unwrap();

        assert_eq!(points.len(), 4);
        assert_eq!(points[3].classification, FunnelClassification::AboveUpper);
        assert_eq!(points[0].classification, FunnelClassification::WithinLimits);
        assert!(points.iter().all(|p| p.expected_rate() == points[0].expected_rate()));
        // the small practice gets the wider funnel
        assert!(points[0].control_limit_width() > points[1].control_limit_width());
    }

    #[test]
    fn test_single_unit_cohort_rejected() {
        let config = FunnelConfig::default();
        let engine = FunnelEngine::new(&config);
        let cohort = vec![obs("A", 5, 100)];
        let result = engine.evaluate_period(Period::new(2024, 1).unwrap(), &cohort);
        assert!(matches!(
            result,
            Err(EngineError::EmptyCohort { units: 1, .. })
        ));
    }
}
