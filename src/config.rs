//! Run configuration: an optional TOML file, overridden by CLI flags.

use std::{
    fmt, fs,
    path::{Path, PathBuf},
    str::FromStr,
};

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::{
    archive::ExistingPolicy,
    demux::DemuxConfig,
    error::ConfigError,
    formats::Encoding,
    identity::IdentityRules,
    merge::GapFill,
    reconcile::RateReconciler,
};

// ─────────────────────────────────────────────────────────────────────
// Day range
// ─────────────────────────────────────────────────────────────────────

/// Inclusive range of UTC calendar days, written `YYYY-MM-DD` or
/// `YYYY-MM-DD..YYYY-MM-DD`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct DayRange {
    pub first: NaiveDate,
    pub last:  NaiveDate,
}

impl DayRange {
    pub fn contains(&self, date: NaiveDate) -> bool {
        self.first <= date && date <= self.last
    }
}

impl FromStr for DayRange {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parse = |d: &str| {
            NaiveDate::parse_from_str(d.trim(), "%Y-%m-%d")
                .map_err(|e| ConfigError::Invalid(format!("bad date '{d}' in day range: {e}")))
        };
        let (first, last) = match s.split_once("..") {
            Some((a, b)) => (parse(a)?, parse(b)?),
            None => {
                let d = parse(s)?;
                (d, d)
            }
        };
        Ok(Self { first, last })
    }
}

impl TryFrom<String> for DayRange {
    type Error = ConfigError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<DayRange> for String {
    fn from(r: DayRange) -> Self {
        r.to_string()
    }
}

impl fmt::Display for DayRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.first == self.last {
            write!(f, "{}", self.first.format("%Y-%m-%d"))
        } else {
            write!(f, "{}..{}", self.first.format("%Y-%m-%d"), self.last.format("%Y-%m-%d"))
        }
    }
}

// ─────────────────────────────────────────────────────────────────────
// Assemble
// ─────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunMode {
    /// Read everything, then finalize every bucket.
    #[default]
    Batch,
    /// Finalize each day as soon as its identity moves on to the next one.
    Streaming,
}

impl FromStr for RunMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "batch"     => Ok(RunMode::Batch),
            "streaming" => Ok(RunMode::Streaming),
            _ => Err(ConfigError::Invalid(format!("unknown mode '{s}' (batch, streaming)"))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AssembleConfig {
    pub input_root:                 PathBuf,
    pub output_root:                PathBuf,
    /// Overrides the network code of every identity.
    pub network_code:               Option<String>,
    pub day_range:                  Option<DayRange>,
    pub encoding:                   Encoding,
    pub gap_fill:                   GapFill,
    pub mode:                       RunMode,
    /// Reader threads; 0 lets rayon decide.
    pub workers:                    usize,
    /// Sources read per parallel batch in streaming mode.
    pub chunk_size:                 usize,
    pub existing:                   ExistingPolicy,
    pub rate_tolerance_hz:          f64,
    pub fallback_rate_tolerance_hz: f64,
    /// Failed sources plus failed buckets tolerated before the run counts
    /// as failed. `None` only warns.
    pub max_failures:               Option<usize>,
    /// Per-bucket CSV report.
    pub report:                     Option<PathBuf>,
    pub identity:                   IdentityRules,
    pub demux:                      DemuxConfig,
}

impl Default for AssembleConfig {
    fn default() -> Self {
        let rates = RateReconciler::default();
        Self {
            input_root:                 PathBuf::new(),
            output_root:                PathBuf::new(),
            network_code:               None,
            day_range:                  None,
            encoding:                   Encoding::default(),
            gap_fill:                   GapFill::default(),
            mode:                       RunMode::default(),
            workers:                    0,
            chunk_size:                 32,
            existing:                   ExistingPolicy::default(),
            rate_tolerance_hz:          rates.tolerance_hz,
            fallback_rate_tolerance_hz: rates.fallback_tolerance_hz,
            max_failures:               None,
            report:                     None,
            identity:                   IdentityRules::default(),
            demux:                      DemuxConfig::default(),
        }
    }
}

impl AssembleConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Read { path: path.to_path_buf(), source })?;
        Ok(toml::from_str(&text)?)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: String| Err(ConfigError::Invalid(msg));

        if self.input_root.as_os_str().is_empty() {
            return invalid("input_root is not set".into());
        }
        if self.output_root.as_os_str().is_empty() {
            return invalid("output_root is not set".into());
        }
        if self.input_root == self.output_root {
            return invalid(format!("input and output root are the same: {}", self.input_root.display()));
        }
        for (name, tol) in [
            ("rate_tolerance_hz", self.rate_tolerance_hz),
            ("fallback_rate_tolerance_hz", self.fallback_rate_tolerance_hz),
        ] {
            if !(tol.is_finite() && tol > 0.0) {
                return invalid(format!("{name} must be positive, got {tol}"));
            }
        }
        if self.fallback_rate_tolerance_hz < self.rate_tolerance_hz {
            return invalid("fallback_rate_tolerance_hz is smaller than rate_tolerance_hz".into());
        }
        if let Some(range) = self.day_range {
            if range.first > range.last {
                return invalid(format!("day range {range} ends before it starts"));
            }
        }
        if self.chunk_size == 0 {
            return invalid("chunk_size must be at least 1".into());
        }
        if let Some(net) = &self.network_code {
            if net.is_empty() || net.len() > 2 || !net.chars().all(|c| c.is_ascii_alphanumeric()) {
                return invalid(format!("network code '{net}' must be 1-2 alphanumeric characters"));
            }
        }
        if let GapFill::Fill(v) = self.gap_fill {
            if !v.is_finite() {
                return invalid(format!("gap fill value {v} is not finite"));
            }
        }
        Ok(())
    }

    /// Overrides the snap tolerances. A primary given without a fallback
    /// raises the fallback to at least the primary.
    pub fn set_rate_tolerances(&mut self, primary: Option<f64>, fallback: Option<f64>) {
        match (primary, fallback) {
            (p, Some(f)) => {
                if let Some(p) = p {
                    self.rate_tolerance_hz = p;
                }
                self.fallback_rate_tolerance_hz = f;
            }
            (Some(p), None) => {
                self.rate_tolerance_hz = p;
                self.fallback_rate_tolerance_hz = self.fallback_rate_tolerance_hz.max(p);
            }
            (None, None) => {}
        }
    }

    pub fn reconciler(&self) -> RateReconciler {
        RateReconciler {
            tolerance_hz:          self.rate_tolerance_hz,
            fallback_tolerance_hz: self.fallback_rate_tolerance_hz,
        }
    }

    /// Identity rules with the configured network override applied.
    pub fn identity_rules(&self) -> IdentityRules {
        match &self.network_code {
            Some(net) => self.identity.clone().with_network(net.clone()),
            None => self.identity.clone(),
        }
    }
}
