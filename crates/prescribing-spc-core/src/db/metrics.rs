//! Metrics and quality-issue persistence.

use rusqlite::{params, Connection, ErrorCode};

use crate::export::{MetricsRow, MetricsTable};
use crate::models::{DataQualityReport, FunnelClassification, Period, SpcFlag, UnitId};

use super::{Database, DbError, DbResult};

fn parse_spc_flag(s: &str) -> Option<SpcFlag> {
    match s {
        "normal" => Some(SpcFlag::Normal),
        "warning" => Some(SpcFlag::Warning),
        "special_cause" => Some(SpcFlag::SpecialCause),
        _ => None,
    }
}

fn parse_classification(s: &str) -> Option<FunnelClassification> {
    match s {
        "within_limits" => Some(FunnelClassification::WithinLimits),
        "above_upper" => Some(FunnelClassification::AboveUpper),
        "below_lower" => Some(FunnelClassification::BelowLower),
        _ => None,
    }
}

fn invalid(column: &str, value: impl ToString) -> DbError {
    DbError::InvalidValue {
        column: column.to_string(),
        value: value.to_string(),
    }
}

/// Raw column values of one stored metrics row.
type StoredRow = (
    String,
    String,
    i64,
    i64,
    f64,
    Option<f64>,
    Option<String>,
    Option<f64>,
    Option<f64>,
    Option<f64>,
    Option<String>,
);

fn decode_row(row: StoredRow) -> DbResult<MetricsRow> {
    let (unit_id, period, items, list_size, rate, rolling_rate, flag, expected, upper, lower, class) =
        row;
    Ok(MetricsRow {
        unit_id: UnitId::new(unit_id),
        period: Period::parse(&period).map_err(|_| invalid("period", &period))?,
        items: u64::try_from(items).map_err(|_| invalid("items", items))?,
        list_size: u64::try_from(list_size).map_err(|_| invalid("list_size", list_size))?,
        rate,
        rolling_rate,
        spc_flag: flag
            .map(|f| parse_spc_flag(&f).ok_or_else(|| invalid("spc_flag", &f)))
            .transpose()?,
        funnel_expected: expected,
        funnel_limit_upper: upper,
        funnel_limit_lower: lower,
        funnel_classification: class
            .map(|c| parse_classification(&c).ok_or_else(|| invalid("funnel_classification", &c)))
            .transpose()?,
    })
}

fn stored_count(column: &str, value: u64) -> DbResult<i64> {
    i64::try_from(value).map_err(|_| invalid(column, value))
}

fn insert_metric_rows(conn: &Connection, table: &MetricsTable) -> DbResult<usize> {
    let mut stmt = conn.prepare(
        r#"
        INSERT INTO metrics (
            unit_id, period, items, list_size, rate, rolling_rate, spc_flag,
            funnel_expected, funnel_limit_upper, funnel_limit_lower, funnel_classification
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )?;

    for row in table.rows() {
        let result = stmt.execute(params![
            row.unit_id.as_str(),
            row.period.to_string(),
            stored_count("items", row.items)?,
            stored_count("list_size", row.list_size)?,
            row.rate,
            row.rolling_rate,
            row.spc_flag.map(|f| f.as_str()),
            row.funnel_expected,
            row.funnel_limit_upper,
            row.funnel_limit_lower,
            row.funnel_classification.map(|c| c.as_str()),
        ]);
        match result {
            Ok(_) => {}
            Err(rusqlite::Error::SqliteFailure(e, _)) if e.code == ErrorCode::ConstraintViolation => {
                return Err(DbError::Constraint(format!(
                    "metrics row {} {} already stored",
                    row.unit_id, row.period
                )));
            }
            Err(e) => return Err(e.into()),
        }
    }
    Ok(table.len())
}

fn insert_issue_rows(
    conn: &Connection,
    report: &DataQualityReport,
    run_sha256: Option<&str>,
) -> DbResult<usize> {
    let mut stmt = conn.prepare(
        "INSERT INTO quality_issues (run_sha256, kind, unit_id, period, message) VALUES (?, ?, ?, ?, ?)",
    )?;
    for issue in report.issues() {
        stmt.execute(params![
            run_sha256,
            issue.kind.as_str(),
            issue.unit_id.as_ref().map(UnitId::as_str),
            issue.period.map(|p| p.to_string()),
            issue.message,
        ])?;
    }
    Ok(report.len())
}

impl Database {
    /// Append every row of a metrics table in one transaction.
    ///
    /// Rows are never replaced: a (unit_id, period) that is already stored
    /// fails the whole insert with [`DbError::Constraint`].
    pub fn insert_metrics(&mut self, table: &MetricsTable) -> DbResult<usize> {
        let tx = self.transaction()?;
        let inserted = insert_metric_rows(&tx, table)?;
        tx.commit()?;
        Ok(inserted)
    }

    /// Append a run's data-quality issues.
    pub fn insert_quality_issues(
        &mut self,
        report: &DataQualityReport,
        run_sha256: Option<&str>,
    ) -> DbResult<usize> {
        let tx = self.transaction()?;
        let inserted = insert_issue_rows(&tx, report, run_sha256)?;
        tx.commit()?;
        Ok(inserted)
    }

    /// Store a run's metrics and its quality issues together.
    ///
    /// Both go in one transaction, so a rejected metrics row leaves no
    /// issues from that run behind.
    pub fn insert_run(
        &mut self,
        table: &MetricsTable,
        report: &DataQualityReport,
        run_sha256: &str,
    ) -> DbResult<usize> {
        let tx = self.transaction()?;
        let inserted = insert_metric_rows(&tx, table)?;
        insert_issue_rows(&tx, report, Some(run_sha256))?;
        tx.commit()?;
        Ok(inserted)
    }

    /// All stored metrics rows ordered by (unit_id, period).
    pub fn load_metrics(&self) -> DbResult<Vec<MetricsRow>> {
        self.query_metrics("", [])
    }

    /// Stored metrics rows for one unit, in period order.
    pub fn load_unit_metrics(&self, unit_id: &UnitId) -> DbResult<Vec<MetricsRow>> {
        self.query_metrics("WHERE unit_id = ?", [unit_id.as_str()])
    }

    fn query_metrics<P: rusqlite::Params>(&self, filter: &str, params: P) -> DbResult<Vec<MetricsRow>> {
        let sql = format!(
            r#"
            SELECT unit_id, period, items, list_size, rate, rolling_rate, spc_flag,
                   funnel_expected, funnel_limit_upper, funnel_limit_lower, funnel_classification
            FROM metrics
            {}
            ORDER BY unit_id, period
            "#,
            filter
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let stored = stmt
            .query_map(params, |row| {
                Ok((
                    row.get(0)?,
                    row.get(1)?,
                    row.get(2)?,
                    row.get(3)?,
                    row.get(4)?,
                    row.get(5)?,
                    row.get(6)?,
                    row.get(7)?,
                    row.get(8)?,
                    row.get(9)?,
                    row.get(10)?,
                ))
            })?
            .collect::<Result<Vec<StoredRow>, _>>()?;

        stored.into_iter().map(decode_row).collect()
    }

    /// Number of stored metrics rows.
    pub fn count_metrics(&self) -> DbResult<usize> {
        let count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM metrics", [], |row| row.get(0))?;
        Ok(count as usize)
    }

    /// Number of stored quality issues.
    pub fn count_quality_issues(&self) -> DbResult<usize> {
        let count: i64 =
            self.conn
                .query_row("SELECT COUNT(*) FROM quality_issues", [], |row| row.get(0))?;
        Ok(count as usize)
    }
}
