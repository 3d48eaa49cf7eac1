//! Data-quality side channel.
//!
//! Exclusions and per-cell failures are accumulated into a
//! [`DataQualityReport`] that travels beside the primary result
//! (see [`Reported`]) instead of going to a global log.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use super::{Period, UnitId};

/// Category of a data-quality issue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueKind {
    MissingItems,
    MissingListSize,
    ZeroListSize,
    MissingGroupKey,
    DuplicateRow,
    CountOverflow,
    SeriesGap,
    InsufficientData,
    InsufficientBaseline,
    EmptyCohort,
    DegenerateVariance,
}

impl IssueKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            IssueKind::MissingItems => "missing_items",
            IssueKind::MissingListSize => "missing_list_size",
            IssueKind::ZeroListSize => "zero_list_size",
            IssueKind::MissingGroupKey => "missing_group_key",
            IssueKind::DuplicateRow => "duplicate_row",
            IssueKind::CountOverflow => "count_overflow",
            IssueKind::SeriesGap => "series_gap",
            IssueKind::InsufficientData => "insufficient_data",
            IssueKind::InsufficientBaseline => "insufficient_baseline",
            IssueKind::EmptyCohort => "empty_cohort",
            IssueKind::DegenerateVariance => "degenerate_variance",
        }
    }

    /// True for issues that remove an input row from the computation.
    pub fn is_row_exclusion(&self) -> bool {
        matches!(
            self,
            IssueKind::MissingItems
                | IssueKind::MissingListSize
                | IssueKind::ZeroListSize
                | IssueKind::MissingGroupKey
                | IssueKind::DuplicateRow
                | IssueKind::CountOverflow
        )
    }
}

impl fmt::Display for IssueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single recorded issue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QualityIssue {
    pub kind: IssueKind,
    pub unit_id: Option<UnitId>,
    pub period: Option<Period>,
    pub message: String,
}

/// Accumulated data-quality issues for one pipeline run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DataQualityReport {
    issues: Vec<QualityIssue>,
}

impl DataQualityReport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an issue.
    pub fn push(
        &mut self,
        kind: IssueKind,
        unit_id: Option<&UnitId>,
        period: Option<Period>,
        message: impl Into<String>,
    ) {
        self.issues.push(QualityIssue {
            kind,
            unit_id: unit_id.cloned(),
            period,
            message: message.into(),
        });
    }

    /// Append another report, preserving order.
    pub fn extend(&mut self, other: DataQualityReport) {
        self.issues.extend(other.issues);
    }

    pub fn issues(&self) -> &[QualityIssue] {
        &self.issues
    }

    pub fn len(&self) -> usize {
        self.issues.len()
    }

    pub fn is_empty(&self) -> bool {
        self.issues.is_empty()
    }

    pub fn count(&self, kind: IssueKind) -> usize {
        self.issues.iter().filter(|i| i.kind == kind).count()
    }

    /// Number of input rows excluded from rate computation.
    pub fn excluded_rows(&self) -> usize {
        self.issues.iter().filter(|i| i.kind.is_row_exclusion()).count()
    }

    /// Issue counts keyed by kind, in a stable order.
    pub fn counts(&self) -> BTreeMap<IssueKind, usize> {
        let mut counts = BTreeMap::new();
        for issue in &self.issues {
            *counts.entry(issue.kind).or_insert(0) += 1;
        }
        counts
    }
}

/// A result value paired with the data-quality issues raised producing it.
#[derive(Debug, Clone, PartialEq)]
pub struct Reported<T> {
    pub value: T,
    pub report: DataQualityReport,
}

impl<T> Reported<T> {
    pub fn new(value: T, report: DataQualityReport) -> Self {
        Self { value, report }
    }

    /// Split into the value and its report.
    pub fn into_parts(self) -> (T, DataQualityReport) {
        (self.value, self.report)
    }
}
