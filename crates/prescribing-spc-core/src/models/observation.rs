//! Observation models: tidy rows, per-unit counts and derived rates.

use std::fmt;

use serde::{Deserialize, Serialize};

use super::Period;

/// Identifier of a reporting entity: practice, PCN, ICB or `national`.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UnitId(String);

impl UnitId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The single aggregate unit used for national roll-ups.
    pub fn national() -> Self {
        Self("national".to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UnitId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for UnitId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Prescribing rate per 1000 registered patients.
///
/// Undefined (`None`) when the denominator is zero.
pub fn rate_per_1000(items: u64, list_size: u64) -> Option<f64> {
    if list_size == 0 {
        return None;
    }
    Some(items as f64 * 1000.0 / list_size as f64)
}

/// One row of the tidy record store.
///
/// Counts are optional so that missing cells reach the aggregator's
/// exclusion policy instead of being coerced to zero.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TidyRecord {
    /// GP practice code
    pub practice_code: String,
    /// Primary Care Network code, when known
    pub pcn_code: Option<String>,
    /// Integrated Care Board code, when known
    pub icb_code: Option<String>,
    /// Month of the extract
    pub period: Period,
    /// Prescription items matching the measure
    pub items: Option<u64>,
    /// Registered patients
    pub list_size: Option<u64>,
}

impl TidyRecord {
    /// Create a complete record with no PCN/ICB mapping.
    pub fn new(practice_code: impl Into<String>, period: Period, items: u64, list_size: u64) -> Self {
        Self {
            practice_code: practice_code.into(),
            pcn_code: None,
            icb_code: None,
            period,
            items: Some(items),
            list_size: Some(list_size),
        }
    }

    pub fn with_pcn(mut self, pcn_code: impl Into<String>) -> Self {
        self.pcn_code = Some(pcn_code.into());
        self
    }

    pub fn with_icb(mut self, icb_code: impl Into<String>) -> Self {
        self.icb_code = Some(icb_code.into());
        self
    }
}

/// One (unit, period) measurement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PrescribingObservation {
    pub unit_id: UnitId,
    pub period: Period,
    pub items: u64,
    pub list_size: u64,
}

/// A prescribing observation with its rate per 1000 patients.
///
/// Only constructible from an observation with a positive list size, so
/// every value of this type carries a defined rate.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RateObservation {
    #[serde(flatten)]
    observation: PrescribingObservation,
    rate: f64,
}

impl RateObservation {
    /// Derive the rate; `None` when `list_size == 0`.
    pub fn new(observation: PrescribingObservation) -> Option<Self> {
        let rate = rate_per_1000(observation.items, observation.list_size)?;
        Some(Self { observation, rate })
    }

    pub fn unit_id(&self) -> &UnitId {
        &self.observation.unit_id
    }

    pub fn period(&self) -> Period {
        self.observation.period
    }

    pub fn items(&self) -> u64 {
        self.observation.items
    }

    pub fn list_size(&self) -> u64 {
        self.observation.list_size
    }

    pub fn rate(&self) -> f64 {
        self.rate
    }
}

/// Trailing-window mean of a unit's rate.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", content = "value", rename_all = "snake_case")]
pub enum RollingRate {
    /// Mean of the trailing window
    Available(f64),
    /// Not enough contiguous history yet
    InsufficientHistory,
}

impl RollingRate {
    pub fn value(&self) -> Option<f64> {
        match self {
            RollingRate::Available(v) => Some(*v),
            RollingRate::InsufficientHistory => None,
        }
    }
}

/// Smoothed rate for one (unit, period).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SmoothedObservation {
    pub unit_id: UnitId,
    pub period: Period,
    pub rolling_rate: RollingRate,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn jan() -> Period {
        Period::new(2024, 1).unwrap()
    }

    #[test]
    fn test_rate_formula() {
        assert_eq!(rate_per_1000(1, 10), Some(100.0));
        assert_eq!(rate_per_1000(0, 5000), Some(0.0));
        assert_eq!(rate_per_1000(5, 0), None);
    }

    #[test]
    fn test_rate_observation_requires_list_size() {
        let obs = PrescribingObservation {
            unit_id: "A81001".into(),
            period: jan(),
            items: 3,
            list_size: 0,
        };
        assert!(RateObservation::new(obs).is_none());
    }

    #[test]
    fn test_rate_observation_serializes_flat() {
        let obs = RateObservation::new(PrescribingObservation {
            unit_id: "A81001".into(),
            period: jan(),
            items: 50,
            list_size: 1000,
        })
        .unwrap();

        let json = serde_json::to_value(&obs).unwrap();
        assert_eq!(json["unit_id"], "A81001");
        assert_eq!(json["period"], "2024-01");
        assert_eq!(json["rate"], 50.0);
    }

    #[test]
    fn test_rolling_rate_value() {
        assert_eq!(RollingRate::Available(2.5).value(), Some(2.5));
        assert_eq!(RollingRate::InsufficientHistory.value(), None);
    }

    #[test]
    fn test_tidy_record_builders() {
        let record = TidyRecord::new("A81001", jan(), 10, 2000)
            .with_pcn("U12345")
            .with_icb("QHM");
        assert_eq!(record.pcn_code.as_deref(), Some("U12345"));
        assert_eq!(record.icb_code.as_deref(), Some("QHM"));
        assert_eq!(record.items, Some(10));
    }
}
