//! Whole-history summary: one funnel position per unit across all periods.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::config::FunnelConfig;
use crate::models::{
    FunnelClassification, FunnelLimits, PrescribingObservation, RateObservation, UnitId,
};

use super::{EngineError, EngineResult, FunnelEngine};

/// Totals and funnel position for one unit over the whole snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnitSummary {
    pub unit_id: UnitId,
    /// Number of periods contributing
    pub periods: usize,
    pub total_items: u64,
    /// Sum of monthly list sizes (patient-months)
    pub total_list_size: u64,
    /// Rate per 1000 over the totals
    pub rate: f64,
    #[serde(flatten)]
    pub limits: FunnelLimits,
    pub classification: FunnelClassification,
}

/// Sum each unit's observations and place the totals on one funnel.
///
/// The expected rate is population-weighted over every unit, so large
/// units count in proportion to their list size.
pub fn summarize_units(
    rates: &[RateObservation],
    config: &FunnelConfig,
) -> EngineResult<Vec<UnitSummary>> {
    let Some(last_period) = rates.iter().map(RateObservation::period).max() else {
        return Ok(Vec::new());
    };

    let mut totals: BTreeMap<&UnitId, (u64, u64, usize)> = BTreeMap::new();
    for obs in rates {
        let entry = totals.entry(obs.unit_id()).or_insert((0, 0, 0));
        let (Some(items), Some(list_size)) = (
            entry.0.checked_add(obs.items()),
            entry.1.checked_add(obs.list_size()),
        ) else {
            return Err(EngineError::CountOverflow {
                unit_id: obs.unit_id().clone(),
            });
        };
        *entry = (items, list_size, entry.2 + 1);
    }

    let mut periods = BTreeMap::new();
    let combined: Vec<RateObservation> = totals
        .into_iter()
        .filter_map(|(unit_id, (items, list_size, count))| {
            periods.insert(unit_id.clone(), count);
            RateObservation::new(PrescribingObservation {
                unit_id: unit_id.clone(),
                period: last_period,
                items,
                list_size,
            })
        })
        .collect();

    let points = FunnelEngine::new(config).evaluate_period(last_period, &combined)?;
    Ok(points
        .into_iter()
        .zip(&combined)
        .map(|(point, obs)| UnitSummary {
            periods: periods.get(&point.unit_id).copied().unwrap_or_default(),
            total_items: obs.items(),
            total_list_size: obs.list_size(),
            rate: point.observed_rate,
            unit_id: point.unit_id,
            limits: point.limits,
            classification: point.classification,
        })
        .collect())
}
