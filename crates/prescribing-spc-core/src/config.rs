//! Engine configuration.
//!
//! A single immutable [`EngineConfig`] is loaded once (TOML, every field
//! defaulted), validated, and then borrowed by each component. Nothing reads
//! configuration from ambient state.

use std::fmt;
use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::models::Period;

/// Configuration errors.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid config: {0}")]
    Invalid(String),
}

pub type ConfigResult<T> = Result<T, ConfigError>;

/// Unit granularity the aggregator rolls tidy rows up to.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Granularity {
    #[default]
    Practice,
    Pcn,
    Icb,
    National,
}

impl Granularity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Granularity::Practice => "practice",
            Granularity::Pcn => "pcn",
            Granularity::Icb => "icb",
            Granularity::National => "national",
        }
    }
}

impl fmt::Display for Granularity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Granularity {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "practice" => Ok(Granularity::Practice),
            "pcn" => Ok(Granularity::Pcn),
            "icb" => Ok(Granularity::Icb),
            "national" => Ok(Granularity::National),
            other => Err(ConfigError::Invalid(format!(
                "unknown granularity '{}' (expected practice, pcn, icb or national)",
                other
            ))),
        }
    }
}

/// Rolling-average settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SmoothingConfig {
    /// Trailing window length in periods
    pub window: usize,
}

impl Default for SmoothingConfig {
    fn default() -> Self {
        Self { window: 3 }
    }
}

/// How the baseline standard deviation is estimated.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SigmaPolicy {
    /// Sample standard deviation (n - 1)
    #[default]
    Sample,
    /// Population standard deviation (n)
    Population,
    /// Mean moving range / d2 (1.128), as on an XmR chart
    MovingRange,
}

/// SPC engine settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SpcConfig {
    /// Baseline window length W
    pub baseline_periods: usize,
    /// Freeze the baseline to W months starting here instead of each
    /// unit's first W observations
    pub baseline_start: Option<Period>,
    pub sigma_policy: SigmaPolicy,
    /// Multiplier for the warning band
    pub warning_sigma: f64,
    /// Multiplier for the control band
    pub control_sigma: f64,
    /// Consecutive points on one side of center that signal a shift
    pub run_length: usize,
    /// Consecutive strictly rising/falling points that signal a trend
    /// (disabled when unset)
    pub trend_length: Option<usize>,
}

impl Default for SpcConfig {
    fn default() -> Self {
        Self {
            baseline_periods: 12,
            baseline_start: None,
            sigma_policy: SigmaPolicy::default(),
            warning_sigma: 2.0,
            control_sigma: 3.0,
            run_length: 8,
            trend_length: None,
        }
    }
}

/// Variance model behind the funnel limit width.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VarianceModel {
    /// `expected * (1 - expected / 1000)`
    #[default]
    Binomial,
    /// `expected`
    Poisson,
}

/// Funnel engine settings.
///
/// Half-width = `z * sqrt(variance(expected) / list_size) * scaling_constant`.
/// With the default `scaling_constant` of sqrt(1000) and the binomial model
/// this is the normal approximation to a binomial proportion, expressed per
/// 1000 patients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FunnelConfig {
    /// z for the inner (95%) limits
    pub z_warning: f64,
    /// z for the outer (99.8%) limits used for classification
    pub z_control: f64,
    pub scaling_constant: f64,
    pub variance_model: VarianceModel,
    /// Fewest units that make a cohort
    pub min_cohort: usize,
}

impl Default for FunnelConfig {
    fn default() -> Self {
        Self {
            z_warning: 1.96,
            z_control: 3.09,
            scaling_constant: 1000f64.sqrt(),
            variance_model: VarianceModel::default(),
            min_cohort: 2,
        }
    }
}

/// Source column names in prescribing extracts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PrescribingColumns {
    pub practice_code: String,
    pub month: String,
    pub bnf_code: String,
    pub items: String,
}

impl Default for PrescribingColumns {
    fn default() -> Self {
        Self {
            practice_code: "practice_code".to_string(),
            month: "month".to_string(),
            bnf_code: "bnf_code".to_string(),
            items: "items".to_string(),
        }
    }
}

/// Source column names in list-size extracts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ListSizeColumns {
    pub practice_code: String,
    pub month: String,
    pub list_size: String,
    pub pcn_code: String,
    pub icb_code: String,
}

impl Default for ListSizeColumns {
    fn default() -> Self {
        Self {
            practice_code: "practice_code".to_string(),
            month: "month".to_string(),
            list_size: "list_size".to_string(),
            pcn_code: "pcn_code".to_string(),
            icb_code: "icb_code".to_string(),
        }
    }
}

/// Column maps for raw extracts.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ColumnsConfig {
    pub prescribing: PrescribingColumns,
    pub list_size: ListSizeColumns,
}

/// Raw extract preparation settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct IngestConfig {
    /// BNF code prefix kept from prescribing extracts (0501: antibacterials)
    pub bnf_prefix: String,
    pub columns: ColumnsConfig,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            bnf_prefix: "0501".to_string(),
            columns: ColumnsConfig::default(),
        }
    }
}

/// Complete pipeline configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EngineConfig {
    pub granularity: Granularity,
    pub smoothing: SmoothingConfig,
    pub spc: SpcConfig,
    pub funnel: FunnelConfig,
    pub ingest: IngestConfig,
}

impl EngineConfig {
    /// Parse and validate a TOML document.
    pub fn from_toml_str(toml_str: &str) -> ConfigResult<Self> {
        let config: EngineConfig = toml::from_str(toml_str)?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a TOML file.
    pub fn load<P: AsRef<Path>>(path: P) -> ConfigResult<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml_str(&content)
    }

    /// Same configuration at a different granularity.
    pub fn with_granularity(mut self, granularity: Granularity) -> Self {
        self.granularity = granularity;
        self
    }

    /// Check parameter ranges.
    pub fn validate(&self) -> ConfigResult<()> {
        let invalid = |msg: String| Err(ConfigError::Invalid(msg));

        if self.smoothing.window == 0 {
            return invalid("smoothing.window must be at least 1".into());
        }

        let spc = &self.spc;
        if spc.baseline_periods < 2 {
            return invalid(format!(
                "spc.baseline_periods must be at least 2, got {}",
                spc.baseline_periods
            ));
        }
        if !(spc.warning_sigma > 0.0 && spc.warning_sigma < spc.control_sigma) {
            return invalid(format!(
                "spc sigma multipliers must satisfy 0 < warning_sigma < control_sigma, got {} and {}",
                spc.warning_sigma, spc.control_sigma
            ));
        }
        if spc.run_length < 2 {
            return invalid("spc.run_length must be at least 2".into());
        }
        if matches!(spc.trend_length, Some(n) if n < 2) {
            return invalid("spc.trend_length must be at least 2 when set".into());
        }

        let funnel = &self.funnel;
        if !(funnel.z_warning > 0.0 && funnel.z_warning < funnel.z_control) {
            return invalid(format!(
                "funnel z values must satisfy 0 < z_warning < z_control, got {} and {}",
                funnel.z_warning, funnel.z_control
            ));
        }
        if !(funnel.scaling_constant.is_finite() && funnel.scaling_constant > 0.0) {
            return invalid("funnel.scaling_constant must be a positive number".into());
        }
        if funnel.min_cohort < 2 {
            return invalid("funnel.min_cohort must be at least 2".into());
        }

        if self.ingest.bnf_prefix.chars().any(|c| c.is_whitespace()) {
            return invalid("ingest.bnf_prefix must not contain whitespace".into());
        }

        Ok(())
    }
}
