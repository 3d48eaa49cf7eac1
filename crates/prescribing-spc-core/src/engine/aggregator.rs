//! Aggregator: tidy rows → one rate observation per (unit, period).

use std::collections::{BTreeMap, BTreeSet};

use crate::config::Granularity;
use crate::models::{
    DataQualityReport, IssueKind, Period, PrescribingObservation, RateObservation, Reported,
    TidyRecord, UnitId,
};

use super::{EngineError, EngineResult};

/// Rolls tidy records up to the configured granularity.
///
/// Rates for a group are always `sum(items) / sum(list_size) * 1000` over
/// the member rows, never an average of member rates.
pub struct Aggregator {
    granularity: Granularity,
}

impl Aggregator {
    pub fn new(granularity: Granularity) -> Self {
        Self { granularity }
    }

    pub fn granularity(&self) -> Granularity {
        self.granularity
    }

    /// Unit a record belongs to, `None` when its PCN/ICB code is missing.
    pub fn group_key(&self, record: &TidyRecord) -> Option<UnitId> {
        match self.granularity {
            Granularity::Practice => Some(UnitId::new(record.practice_code.as_str())),
            Granularity::Pcn => record.pcn_code.as_deref().map(UnitId::from),
            Granularity::Icb => record.icb_code.as_deref().map(UnitId::from),
            Granularity::National => Some(UnitId::national()),
        }
    }

    /// Aggregate a whole snapshot. Output is sorted by (unit_id, period).
    ///
    /// Duplicate (practice, period) rows keep the first occurrence. Rows
    /// excluded for missing data or group keys are recorded in the report,
    /// as are cells left with no valid rows.
    pub fn aggregate(&self, records: &[TidyRecord]) -> Reported<Vec<RateObservation>> {
        let mut report = DataQualityReport::new();
        let mut seen: BTreeSet<(&str, Period)> = BTreeSet::new();
        let mut cells: BTreeMap<(UnitId, Period), Vec<&TidyRecord>> = BTreeMap::new();

        for record in records {
            if !seen.insert((record.practice_code.as_str(), record.period)) {
                report.push(
                    IssueKind::DuplicateRow,
                    Some(&UnitId::new(record.practice_code.as_str())),
                    Some(record.period),
                    "duplicate practice/month row; first occurrence kept",
                );
                continue;
            }

            let Some(unit_id) = self.group_key(record) else {
                report.push(
                    IssueKind::MissingGroupKey,
                    Some(&UnitId::new(record.practice_code.as_str())),
                    Some(record.period),
                    format!("no {} code", self.granularity),
                );
                continue;
            };
            cells.entry((unit_id, record.period)).or_default().push(record);
        }

        let mut observations = Vec::with_capacity(cells.len());
        for ((unit_id, period), rows) in cells {
            match fold_cell(&unit_id, period, rows, &mut report) {
                Some(obs) => observations.push(obs),
                None => report.push(
                    IssueKind::InsufficientData,
                    Some(&unit_id),
                    Some(period),
                    "no valid rows; cell omitted",
                ),
            }
        }

        Reported::new(observations, report)
    }

    /// Aggregate the rows of a single (unit, period) cell.
    ///
    /// Fails with [`EngineError::InsufficientData`] when no row has both an
    /// item count and a positive list size.
    pub fn aggregate_cell<'r, I>(
        &self,
        unit_id: &UnitId,
        period: Period,
        rows: I,
    ) -> EngineResult<Reported<RateObservation>>
    where
        I: IntoIterator<Item = &'r TidyRecord>,
    {
        let mut report = DataQualityReport::new();
        match fold_cell(unit_id, period, rows, &mut report) {
            Some(obs) => Ok(Reported::new(obs, report)),
            None => Err(EngineError::InsufficientData {
                unit_id: unit_id.clone(),
                period,
            }),
        }
    }
}

/// Sum the valid rows of a cell, recording each excluded row.
fn fold_cell<'r, I>(
    unit_id: &UnitId,
    period: Period,
    rows: I,
    report: &mut DataQualityReport,
) -> Option<RateObservation>
where
    I: IntoIterator<Item = &'r TidyRecord>,
{
    let mut items = 0u64;
    let mut list_size = 0u64;
    let mut valid = 0usize;

    for row in rows {
        let practice = UnitId::new(row.practice_code.as_str());
        match (row.items, row.list_size) {
            (None, _) => report.push(
                IssueKind::MissingItems,
                Some(&practice),
                Some(period),
                "missing item count; row excluded",
            ),
            (_, None) => report.push(
                IssueKind::MissingListSize,
                Some(&practice),
                Some(period),
                "missing list size; row excluded",
            ),
            (_, Some(0)) => report.push(
                IssueKind::ZeroListSize,
                Some(&practice),
                Some(period),
                "zero list size; rate undefined, row excluded",
            ),
            (Some(n), Some(size)) => match (items.checked_add(n), list_size.checked_add(size)) {
                (Some(sum_items), Some(sum_size)) => {
                    items = sum_items;
                    list_size = sum_size;
                    valid += 1;
                }
                _ => report.push(
                    IssueKind::CountOverflow,
                    Some(&practice),
                    Some(period),
                    "cell totals overflow; row excluded",
                ),
            },
        }
    }

    if valid == 0 {
        return None;
    }
    RateObservation::new(PrescribingObservation {
        unit_id: unit_id.clone(),
        period,
        items,
        list_size,
    })
}
