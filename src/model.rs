//! Core data model shared by the pipeline stages
//!
//! Nothing in here carries a raw session identity. Handles are converted to a
//! `SessionFingerprint` at the boundary and only the fingerprint travels further.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Kind of learner action recorded by the session stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionType {
    Read,
    Ask,
    Clarify,
    Error,
    Retry,
}

impl ActionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionType::Read => "read",
            ActionType::Ask => "ask",
            ActionType::Clarify => "clarify",
            ActionType::Error => "error",
            ActionType::Retry => "retry",
        }
    }

    /// Error and retry both count towards an error run
    pub fn is_error_like(&self) -> bool {
        matches!(self, ActionType::Error | ActionType::Retry)
    }
}

/// A single learning interaction as received from the session stream
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Interaction {
    pub timestamp: DateTime<Utc>,
    pub action_type: ActionType,
    pub response_latency_ms: u64,
    pub content_ref: String,
}

impl Interaction {
    pub fn new(
        timestamp: DateTime<Utc>,
        action_type: ActionType,
        response_latency_ms: u64,
        content_ref: impl Into<String>,
    ) -> Self {
        Self {
            timestamp,
            action_type,
            response_latency_ms,
            content_ref: content_ref.into(),
        }
    }
}

/// One-way identifier standing in for a session handle within a salt epoch
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionFingerprint(String);

impl SessionFingerprint {
    pub(crate) fn from_hex(hex: String) -> Self {
        Self(hex)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Short prefix safe for log lines
    pub fn short(&self) -> &str {
        &self.0[..self.0.len().min(8)]
    }
}

impl fmt::Display for SessionFingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Coarse time slot an interaction falls into
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TimeBucket(pub DateTime<Utc>);

impl TimeBucket {
    pub fn start(&self) -> DateTime<Utc> {
        self.0
    }
}

/// Interaction after the identity has been stripped
///
/// Only the bucketed time survives; the raw timestamp is dropped here.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnonymizedInteraction {
    pub fingerprint: SessionFingerprint,
    pub bucket: TimeBucket,
    pub action_type: ActionType,
    pub response_latency_ms: u64,
    pub content_ref: String,
}

/// Whether a feature summary carries enough samples to act on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Confidence {
    Sufficient,
    /// Insufficient signal, consumers must fall back to defaults
    Low,
}

/// Fixed-shape digest of the recent interaction window for one fingerprint
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureSummary {
    pub sample_count: u32,
    pub latency_mean_ms: f64,
    pub latency_variance_ms2: f64,
    /// clarify / max(read, 1)
    pub clarification_ratio: f64,
    /// (clarify + ask) / n
    pub clarification_rate: f64,
    /// (error + retry) / n
    pub error_rate: f64,
    pub max_consecutive_errors: u32,
    pub confidence: Confidence,
}

impl FeatureSummary {
    /// Summary for a window too small to describe
    pub fn low_confidence(sample_count: u32) -> Self {
        Self {
            sample_count,
            latency_mean_ms: 0.0,
            latency_variance_ms2: 0.0,
            clarification_ratio: 0.0,
            clarification_rate: 0.0,
            error_rate: 0.0,
            max_consecutive_errors: 0,
            confidence: Confidence::Low,
        }
    }

    pub fn is_low_confidence(&self) -> bool {
        self.confidence == Confidence::Low
    }
}

/// Adaptation applied to the content the learner sees next
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdaptationAction {
    None,
    Simplify,
    AddExample,
    ChangeModality,
}

impl AdaptationAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            AdaptationAction::None => "none",
            AdaptationAction::Simplify => "simplify",
            AdaptationAction::AddExample => "add_example",
            AdaptationAction::ChangeModality => "change_modality",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "none" => Some(AdaptationAction::None),
            "simplify" => Some(AdaptationAction::Simplify),
            "add_example" => Some(AdaptationAction::AddExample),
            "change_modality" => Some(AdaptationAction::ChangeModality),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AdaptationDecision {
    pub action: AdaptationAction,
    /// 0 for `none`, otherwise 1..=simplification levels
    pub magnitude: u8,
}

impl AdaptationDecision {
    /// Neutral "no adaptation" decision used for low confidence and fallbacks
    pub fn none() -> Self {
        Self {
            action: AdaptationAction::None,
            magnitude: 0,
        }
    }

    pub fn is_none(&self) -> bool {
        self.action == AdaptationAction::None
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BiasType {
    None,
    LanguageComplexity,
    PaceMismatch,
    ExposureGap,
}

impl BiasType {
    pub const DETECTABLE: [BiasType; 3] = [
        BiasType::LanguageComplexity,
        BiasType::PaceMismatch,
        BiasType::ExposureGap,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            BiasType::None => "none",
            BiasType::LanguageComplexity => "language_complexity",
            BiasType::PaceMismatch => "pace_mismatch",
            BiasType::ExposureGap => "exposure_gap",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "none" => Some(BiasType::None),
            "language_complexity" => Some(BiasType::LanguageComplexity),
            "pace_mismatch" => Some(BiasType::PaceMismatch),
            "exposure_gap" => Some(BiasType::ExposureGap),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BiasSignal {
    pub bias_type: BiasType,
    /// Always within [0, 1]
    pub severity: f64,
}

impl BiasSignal {
    pub fn none() -> Self {
        Self {
            bias_type: BiasType::None,
            severity: 0.0,
        }
    }

    pub fn new(bias_type: BiasType, severity: f64) -> Self {
        Self {
            bias_type,
            severity: severity.clamp(0.0, 1.0),
        }
    }

    pub fn is_detected(&self) -> bool {
        self.bias_type != BiasType::None
    }
}
