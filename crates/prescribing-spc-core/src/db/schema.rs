//! SQLite schema definition.

/// Complete database schema for the metrics sink.
pub const SCHEMA: &str = r#"
-- ============================================================================
-- Metrics (one row per unit per period, append-only)
-- ============================================================================

CREATE TABLE IF NOT EXISTS metrics (
    unit_id TEXT NOT NULL,
    period TEXT NOT NULL,                         -- YYYY-MM
    items INTEGER NOT NULL CHECK (items >= 0),
    list_size INTEGER NOT NULL CHECK (list_size > 0),
    rate REAL NOT NULL,
    rolling_rate REAL,                            -- NULL while history is short
    spc_flag TEXT CHECK (spc_flag IN ('normal', 'warning', 'special_cause')),
    funnel_expected REAL,
    funnel_limit_upper REAL,
    funnel_limit_lower REAL,
    funnel_classification TEXT
        CHECK (funnel_classification IN ('within_limits', 'above_upper', 'below_lower')),
    created_at TEXT NOT NULL DEFAULT (datetime('now')),
    PRIMARY KEY (unit_id, period)
);

CREATE TRIGGER IF NOT EXISTS metrics_no_update BEFORE UPDATE ON metrics
BEGIN
    SELECT RAISE(ABORT, 'Metrics rows are append-only');
END;

CREATE TRIGGER IF NOT EXISTS metrics_no_delete BEFORE DELETE ON metrics
BEGIN
    SELECT RAISE(ABORT, 'Metrics rows are append-only');
END;

CREATE INDEX IF NOT EXISTS idx_metrics_period ON metrics(period);

-- ============================================================================
-- Data-quality issues
-- ============================================================================

CREATE TABLE IF NOT EXISTS quality_issues (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    run_sha256 TEXT,                              -- digest of the metrics CSV
    kind TEXT NOT NULL,
    unit_id TEXT,
    period TEXT,
    message TEXT NOT NULL,
    created_at TEXT NOT NULL DEFAULT (datetime('now'))
);

CREATE INDEX IF NOT EXISTS idx_quality_kind ON quality_issues(kind);
"#;
