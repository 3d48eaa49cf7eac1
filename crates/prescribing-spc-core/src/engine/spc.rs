//! SPC engine: baseline control limits and per-point classification.

use crate::config::SpcConfig;
use crate::models::{
    ControlLimits, DataQualityReport, IssueKind, Period, RateObservation, Reported, SpcFlag,
    SpcPoint, SpcRule, SpcSeries,
};

use super::stats::{mean, sigma};
use super::{EngineError, EngineResult};

/// Shewhart-style classifier for one unit's chronological rate series.
pub struct SpcEngine<'a> {
    config: &'a SpcConfig,
}

/// Run and trend counters carried across consecutive months.
#[derive(Default)]
struct RunState {
    side: i8,
    side_len: usize,
    direction: i8,
    trend_len: usize,
    prev: Option<(Period, f64)>,
}

impl RunState {
    fn advance(&mut self, period: Period, rate: f64, side: i8) {
        // a missing month ends both runs
        if self
            .prev
            .is_some_and(|(prev_period, _)| prev_period.months_until(period) > 1)
        {
            *self = RunState::default();
        }

        if side == 0 {
            self.side = 0;
            self.side_len = 0;
        } else if side == self.side {
            self.side_len += 1;
        } else {
            self.side = side;
            self.side_len = 1;
        }

        let direction = match self.prev {
            Some((_, prev)) if rate > prev => 1,
            Some((_, prev)) if rate < prev => -1,
            _ => 0,
        };
        if direction == 0 {
            self.direction = 0;
            self.trend_len = 1;
        } else if direction == self.direction {
            self.trend_len += 1;
        } else {
            self.direction = direction;
            self.trend_len = 2;
        }
        self.prev = Some((period, rate));
    }
}

impl<'a> SpcEngine<'a> {
    pub fn new(config: &'a SpcConfig) -> Self {
        Self { config }
    }

    /// Select the baseline window.
    ///
    /// Without a configured start this is the first `baseline_periods`
    /// observations. With one it is the observations falling in the
    /// `baseline_periods` months from that start, all of which must exist.
    pub fn baseline<'s>(
        &self,
        series: &'s [RateObservation],
    ) -> EngineResult<&'s [RateObservation]> {
        let required = self.config.baseline_periods;
        let window = match self.config.baseline_start {
            None => series,
            Some(start) => {
                let from = series
                    .iter()
                    .position(|o| o.period() >= start)
                    .unwrap_or(series.len());
                let to = series[from..]
                    .iter()
                    .position(|o| start.months_until(o.period()) >= required as i64)
                    .map_or(series.len(), |n| from + n);
                &series[from..to]
            }
        };

        if window.len() < required {
            return Err(EngineError::InsufficientBaseline {
                unit_id: series
                    .first()
                    .map(|o| o.unit_id().clone())
                    .unwrap_or_default(),
                required,
                available: window.len(),
            });
        }
        Ok(&window[..required])
    }

    /// Limits from baseline rates under the configured sigma policy.
    pub fn control_limits(&self, baseline: &[f64]) -> Option<ControlLimits> {
        let center = mean(baseline)?;
        let sigma = sigma(baseline, self.config.sigma_policy)?;
        Some(ControlLimits::new(center, sigma))
    }

    /// Compute limits from the baseline and classify every observation.
    ///
    /// A baseline without variation is recorded as `degenerate_variance`.
    pub fn evaluate(&self, series: &[RateObservation]) -> EngineResult<Reported<SpcSeries>> {
        if let Some(pair) = series.windows(2).find(|w| w[1].period() <= w[0].period()) {
            return Err(EngineError::NotChronological {
                unit_id: pair[1].unit_id().clone(),
                period: pair[1].period(),
            });
        }

        let baseline = self.baseline(series)?;
        let rates: Vec<f64> = baseline.iter().map(RateObservation::rate).collect();
        let limits = self
            .control_limits(&rates)
            .ok_or_else(|| EngineError::InsufficientBaseline {
                unit_id: baseline[0].unit_id().clone(),
                required: self.config.baseline_periods,
                available: rates.len(),
            })?;

        let mut report = DataQualityReport::new();
        if limits.is_degenerate() {
            report.push(
                IssueKind::DegenerateVariance,
                Some(baseline[0].unit_id()),
                None,
                format!("baseline sigma is zero around {:.6}", limits.center),
            );
        }

        let unit_id = baseline[0].unit_id().clone();
        let baseline_start = baseline[0].period();
        let baseline_end = baseline[baseline.len() - 1].period();

        let monthly: Vec<(Period, f64)> = series.iter().map(|o| (o.period(), o.rate())).collect();
        let points = self
            .classify(&monthly, &limits)
            .into_iter()
            .zip(monthly)
            .map(|((flag, rule), (period, rate))| SpcPoint {
                period,
                rate,
                flag,
                rule,
            })
            .collect();

        Ok(Reported::new(
            SpcSeries {
                unit_id,
                limits,
                baseline_start,
                baseline_end,
                points,
            },
            report,
        ))
    }

    /// Classify chronological `(period, rate)` points against fixed limits.
    ///
    /// Rules in priority order: outside the control band, a long run on one
    /// side of center, an optional monotone trend, outside the warning band.
    /// Flags only look backwards: a run flags its `run_length`-th point and
    /// those after it, never the earlier members. Runs count consecutive
    /// calendar months, so a missing month starts them again.
    pub fn classify(
        &self,
        points: &[(Period, f64)],
        limits: &ControlLimits,
    ) -> Vec<(SpcFlag, Option<SpcRule>)> {
        let tolerance = limits.tolerance();
        let degenerate = limits.is_degenerate();
        let (control_lower, control_upper) = limits.band(self.config.control_sigma);
        let (warning_lower, warning_upper) = limits.band(self.config.warning_sigma);

        let mut state = RunState::default();
        points
            .iter()
            .map(|&(period, rate)| {
                let side = if rate > limits.center + tolerance {
                    1
                } else if rate < limits.center - tolerance {
                    -1
                } else {
                    0
                };
                state.advance(period, rate, side);

                let rule = if degenerate {
                    (side != 0).then_some(SpcRule::BeyondControlLimit)
                } else if rate > control_upper || rate < control_lower {
                    Some(SpcRule::BeyondControlLimit)
                } else if state.side_len >= self.config.run_length {
                    Some(SpcRule::Shift)
                } else if self
                    .config
                    .trend_length
                    .is_some_and(|n| state.trend_len >= n)
                {
                    Some(SpcRule::Trend)
                } else if rate > warning_upper || rate < warning_lower {
                    Some(SpcRule::BeyondWarningLimit)
                } else {
                    None
                };

                let flag = match rule {
                    None => SpcFlag::Normal,
                    Some(SpcRule::BeyondWarningLimit) => SpcFlag::Warning,
                    Some(_) => SpcFlag::SpecialCause,
                };
                (flag, rule)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Period, PrescribingObservation};

    fn series(items: &[u64]) -> Vec<RateObservation> {
        let start = Period::new(2023, 1).unwrap();
        items
            .iter()
            .enumerate()
            .map(|(i, &n)| {
                RateObservation::new(PrescribingObservation {
                    unit_id: "A81001".into(),
                    period: start.add_months(i as u32).unwrap(),
                    items: n,
                    list_size: 1000,
                })
                .unwrap()
            })
            .collect()
    }

    /// Consecutive months from January 2023.
    fn monthly(rates: &[f64]) -> Vec<(Period, f64)> {
        let start = Period::new(2023, 1).unwrap();
        rates
            .iter()
            .enumerate()
            .map(|(i, &r)| (start.add_months(i as u32).unwrap(), r))
            .collect()
    }

    fn flags(series: &SpcSeries) -> Vec<SpcFlag> {
        series.points.iter().map(|p| p.flag).collect()
    }

    #[test]
    fn test_constant_series_is_degenerate_and_normal() {
        let config = SpcConfig::default();
        let engine = SpcEngine::new(&config);
        let (result, report) = engine.evaluate(&series(&[5; 14])).unwrap().into_parts();

        assert!(result.limits.sigma.abs() < 1e-12);
        assert!(result.limits.is_degenerate());
        assert!(flags(&result).iter().all(|f| *f == SpcFlag::Normal));
        assert_eq!(report.count(IssueKind::DegenerateVariance), 1);
    }

    #[test]
    fn test_degenerate_deviation_is_special_cause() {
        let config = SpcConfig::default();
        let engine = SpcEngine::new(&config);
        let mut items = vec![5; 12];
        items.push(6);
        items.push(5);
        let (result, _) = engine.evaluate(&series(&items)).unwrap().into_parts();

        let f = flags(&result);
        assert_eq!(f[12], SpcFlag::SpecialCause);
        assert_eq!(f[13], SpcFlag::Normal);
    }

    #[test]
    fn test_eight_point_shift() {
        let config = SpcConfig::default();
        let engine = SpcEngine::new(&config);
        // baseline alternates around 10 and ends below center
        let items: Vec<u64> = (0..12).map(|i| if i % 2 == 0 { 11 } else { 9 }).collect();
        let mut obs = series(&items);
        let start = obs[11].period();
        for k in 1..=8u32 {
            obs.push(
                RateObservation::new(PrescribingObservation {
                    unit_id: "A81001".into(),
                    period: start.add_months(k).unwrap(),
                    items: 21,
                    list_size: 2000,
                })
                .unwrap(),
            );
        }

        let (result, _) = engine.evaluate(&obs).unwrap().into_parts();
        // 10.5 sits inside the warning band
        assert!(10.5 < result.limits.upper_2);
        let f = flags(&result);
        assert!(f[12..19].iter().all(|f| *f == SpcFlag::Normal));
        assert_eq!(f[19], SpcFlag::SpecialCause);
        assert_eq!(result.points[19].rule, Some(SpcRule::Shift));
    }

    #[test]
    fn test_gap_breaks_run() {
        let config = SpcConfig::default();
        let engine = SpcEngine::new(&config);
        let items: Vec<u64> = (0..12).map(|i| if i % 2 == 0 { 11 } else { 9 }).collect();
        let mut obs = series(&items);
        let above = |period: Period| {
            RateObservation::new(PrescribingObservation {
                unit_id: "A81001".into(),
                period,
                items: 21,
                list_size: 2000,
            })
            .unwrap()
        };
        // four months above center, two missing years, then eight more
        let last_baseline = obs[11].period();
        for k in 1..=4u32 {
            obs.push(above(last_baseline.add_months(k).unwrap()));
        }
        let resumed = last_baseline.add_months(4 + 24).unwrap();
        for k in 0..8u32 {
            obs.push(above(resumed.add_months(k).unwrap()));
        }

        let (result, _) = engine.evaluate(&obs).unwrap().into_parts();
        let f = flags(&result);
        assert!(f[12..23].iter().all(|f| *f == SpcFlag::Normal));
        assert_eq!(f[23], SpcFlag::SpecialCause);
        assert_eq!(result.points[23].rule, Some(SpcRule::Shift));
        assert_eq!(result.signals().count(), 1);
    }

    #[test]
    fn test_gap_breaks_trend() {
        let config = SpcConfig {
            trend_length: Some(4),
            ..SpcConfig::default()
        };
        let limits = ControlLimits::new(10.0, 5.0);
        let mut points = monthly(&[8.0, 9.0]);
        let resumed = points[1].0.add_months(3).unwrap();
        points.push((resumed, 10.0));
        points.push((resumed.next().unwrap(), 11.0));

        let out = SpcEngine::new(&config).classify(&points, &limits);
        assert!(out.iter().all(|(f, _)| *f == SpcFlag::Normal));

        let out = SpcEngine::new(&config).classify(&monthly(&[8.0, 9.0, 10.0, 11.0]), &limits);
        assert_eq!(out[3], (SpcFlag::SpecialCause, Some(SpcRule::Trend)));
    }

    #[test]
    fn test_point_on_center_breaks_run() {
        let config = SpcConfig {
            run_length: 3,
            ..SpcConfig::default()
        };
        let engine = SpcEngine::new(&config);
        let limits = ControlLimits::new(10.0, 2.0);
        let out = engine.classify(&monthly(&[11.0, 11.0, 10.0, 11.0, 11.0, 11.0]), &limits);
        let f: Vec<SpcFlag> = out.iter().map(|(f, _)| *f).collect();
        assert_eq!(
            f,
            vec![
                SpcFlag::Normal,
                SpcFlag::Normal,
                SpcFlag::Normal,
                SpcFlag::Normal,
                SpcFlag::Normal,
                SpcFlag::SpecialCause
            ]
        );
    }

    #[test]
    fn test_warning_and_control_bands() {
        let config = SpcConfig::default();
        let engine = SpcEngine::new(&config);
        let limits = ControlLimits::new(10.0, 1.0);
        let out = engine.classify(&monthly(&[12.5, 13.5, 7.5, 10.0]), &limits);
        assert_eq!(out[0], (SpcFlag::Warning, Some(SpcRule::BeyondWarningLimit)));
        assert_eq!(out[1], (SpcFlag::SpecialCause, Some(SpcRule::BeyondControlLimit)));
        assert_eq!(out[2], (SpcFlag::Warning, Some(SpcRule::BeyondWarningLimit)));
        assert_eq!(out[3], (SpcFlag::Normal, None));
    }

    #[test]
    fn test_trend_rule_optional() {
        let limits = ControlLimits::new(10.0, 5.0);
        let rates = monthly(&[9.0, 9.5, 10.5, 11.0, 12.0]);

        let config = SpcConfig::default();
        let out = SpcEngine::new(&config).classify(&rates, &limits);
        assert!(out.iter().all(|(f, _)| *f == SpcFlag::Normal));

        let config = SpcConfig {
            trend_length: Some(5),
            ..SpcConfig::default()
        };
        let out = SpcEngine::new(&config).classify(&rates, &limits);
        assert_eq!(out[4], (SpcFlag::SpecialCause, Some(SpcRule::Trend)));
        assert_eq!(out[3].0, SpcFlag::Normal);
    }

    #[test]
    fn test_short_baseline() {
        let config = SpcConfig::default();
        let engine = SpcEngine::new(&config);
        let result = engine.evaluate(&series(&[5, 6, 7]));
        assert!(matches!(
            result,
            Err(EngineError::InsufficientBaseline {
                required: 12,
                available: 3,
                ..
            })
        ));
    }

    #[test]
    fn test_frozen_baseline_start() {
        let config = SpcConfig {
            baseline_periods: 3,
            baseline_start: Period::new(2023, 3),
            ..SpcConfig::default()
        };
        let engine = SpcEngine::new(&config);
        let obs = series(&[50, 50, 10, 12, 14, 40]);
        let baseline = engine.baseline(&obs).unwrap();
        assert_eq!(baseline.len(), 3);
        assert_eq!(baseline[0].period(), Period::new(2023, 3).unwrap());

        let (result, _) = engine.evaluate(&obs).unwrap().into_parts();
        assert!((result.limits.center - 12.0).abs() < 1e-9);
        assert_eq!(result.baseline_end, Period::new(2023, 5).unwrap());
        assert_eq!(result.points[5].flag, SpcFlag::SpecialCause);
    }

    #[test]
    fn test_frozen_baseline_with_gap_is_insufficient() {
        let config = SpcConfig {
            baseline_periods: 3,
            baseline_start: Period::new(2023, 1),
            ..SpcConfig::default()
        };
        let engine = SpcEngine::new(&config);
        let mut obs = series(&[10, 11, 12, 13]);
        obs.remove(1);
        assert!(engine.baseline(&obs).is_err());
    }
}
