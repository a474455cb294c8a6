//! Thresholds and normalization spans for the bias rules

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Decision policy for the bias/adaptation engine
///
/// Severity for a metric is `clamp((value - threshold) / span, 0, 1)`. The policy
/// is archived with every audit record so a decision can be replayed exactly.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Policy {
    /// T1: clarify / read ratio
    pub clarification_ratio_threshold: f64,
    pub clarification_ratio_span: f64,
    /// T2: response latency variance in ms²
    pub latency_variance_threshold: f64,
    pub latency_variance_span: f64,
    /// T3: consecutive error/retry run
    pub consecutive_error_threshold: u32,
    /// Run length over which pace severity grows from its floor to 1
    pub consecutive_error_span: u32,
    /// T4: share of error/retry actions
    pub error_rate_threshold: f64,
    pub error_rate_span: f64,
    /// Reading grade above which content adds to language severity
    pub high_complexity_grade: f64,
    pub grade_span: f64,
    /// Weight of the content term in language severity
    pub content_weight: f64,
    /// Sufficient-confidence summaries must carry at least this many samples
    pub min_samples: u32,
    /// Number of magnitude levels for non-none actions
    pub simplification_levels: u8,
}

impl Default for Policy {
    fn default() -> Self {
        Self {
            clarification_ratio_threshold: 0.5,
            clarification_ratio_span: 1.5,
            latency_variance_threshold: 4_000_000.0,
            latency_variance_span: 12_000_000.0,
            consecutive_error_threshold: 3,
            consecutive_error_span: 5,
            error_rate_threshold: 0.4,
            error_rate_span: 0.6,
            high_complexity_grade: 12.0,
            grade_span: 6.0,
            content_weight: 0.2,
            min_samples: 3,
            simplification_levels: 3,
        }
    }
}

impl Policy {
    pub fn validate(&self) -> Result<()> {
        let thresholds = [
            ("clarification_ratio_threshold", self.clarification_ratio_threshold),
            ("latency_variance_threshold", self.latency_variance_threshold),
            ("error_rate_threshold", self.error_rate_threshold),
            ("high_complexity_grade", self.high_complexity_grade),
        ];
        for (name, value) in thresholds {
            if !value.is_finite() || value < 0.0 {
                return Err(Error::InvalidConfig(format!("engine.{} must be >= 0", name)));
            }
        }

        let spans = [
            ("clarification_ratio_span", self.clarification_ratio_span),
            ("latency_variance_span", self.latency_variance_span),
            ("error_rate_span", self.error_rate_span),
            ("grade_span", self.grade_span),
        ];
        for (name, value) in spans {
            if !value.is_finite() || value <= 0.0 {
                return Err(Error::InvalidConfig(format!("engine.{} must be > 0", name)));
            }
        }

        if self.error_rate_threshold >= 1.0 {
            return Err(Error::InvalidConfig(
                "engine.error_rate_threshold must be below 1".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.content_weight) {
            return Err(Error::InvalidConfig(
                "engine.content_weight must be within [0, 1]".to_string(),
            ));
        }
        if self.consecutive_error_threshold == 0 || self.consecutive_error_span == 0 {
            return Err(Error::InvalidConfig(
                "engine consecutive error threshold and span must be > 0".to_string(),
            ));
        }
        if self.simplification_levels == 0 {
            return Err(Error::InvalidConfig(
                "engine.simplification_levels must be > 0".to_string(),
            ));
        }
        Ok(())
    }
}
