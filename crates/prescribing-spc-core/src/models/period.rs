//! Calendar-month periods.

use std::fmt;
use std::str::FromStr;

use chrono::{Datelike, Months, NaiveDate};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

/// Month string that could not be parsed.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("invalid month '{0}': expected YYYY-MM, YYYY-MM-DD or YYYYMM")]
pub struct PeriodParseError(pub String);

/// A calendar month, stored as its first day.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Period(NaiveDate);

impl Period {
    /// Build a period from a year and a 1-based month.
    pub fn new(year: i32, month: u32) -> Option<Self> {
        NaiveDate::from_ymd_opt(year, month, 1).map(Self)
    }

    /// Parse `YYYY-MM`, `YYYY-MM-DD` (any valid day) or the NHS `YYYYMM` form.
    pub fn parse(raw: &str) -> Result<Self, PeriodParseError> {
        let s = raw.trim();
        let err = || PeriodParseError(raw.to_string());

        if s.len() == 6 && s.bytes().all(|b| b.is_ascii_digit()) {
            let year: i32 = s[..4].parse().map_err(|_| err())?;
            let month: u32 = s[4..].parse().map_err(|_| err())?;
            return Self::new(year, month).ok_or_else(err);
        }

        let parts: Vec<&str> = s.split('-').collect();
        match parts.as_slice() {
            [year, month] if year.len() == 4 => {
                let year: i32 = year.parse().map_err(|_| err())?;
                let month: u32 = month.parse().map_err(|_| err())?;
                Self::new(year, month).ok_or_else(err)
            }
            [_, _, _] => {
                let date = NaiveDate::parse_from_str(s, "%Y-%m-%d").map_err(|_| err())?;
                Self::new(date.year(), date.month()).ok_or_else(err)
            }
            _ => Err(err()),
        }
    }

    pub fn year(&self) -> i32 {
        self.0.year()
    }

    pub fn month(&self) -> u32 {
        self.0.month()
    }

    /// The following calendar month.
    pub fn next(&self) -> Option<Self> {
        self.add_months(1)
    }

    /// This period shifted forward by `months`.
    pub fn add_months(&self, months: u32) -> Option<Self> {
        self.0.checked_add_months(Months::new(months)).map(Self)
    }

    /// Signed number of months from `self` to `later`.
    pub fn months_until(&self, later: Period) -> i64 {
        let index = |p: &Period| p.year() as i64 * 12 + p.month() as i64;
        index(&later) - index(self)
    }
}

impl fmt::Display for Period {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04}-{:02}", self.year(), self.month())
    }
}

impl FromStr for Period {
    type Err = PeriodParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl Serialize for Period {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Period {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Period::parse(&raw).map_err(serde::de::Error::custom)
    }
}
