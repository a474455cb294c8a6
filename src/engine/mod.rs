//! Bias/adaptation engine
//!
//! `evaluate` is a pure function of a feature summary, content metadata and the
//! policy. It draws no randomness and sees no identity, so replaying archived
//! inputs reproduces the recorded decision bit for bit.
//!
//! ## Rules (in tie-break order)
//! 1. `language_complexity`: clarification ratio and latency variance both above
//!    threshold, heavier when the content reads above the high grade. Action `simplify`.
//! 2. `pace_mismatch`: a consecutive error run at or above threshold. Action `add_example`.
//! 3. `exposure_gap`: clarification ratio above threshold without high variance, or a
//!    high error rate. Action `add_example` when the content has no examples, otherwise
//!    `change_modality`.
//!
//! The strongest signal wins. Low-confidence summaries always yield `none`.

use serde::{Deserialize, Serialize};

use crate::content::ContentMetadata;
use crate::error::{Error, Result};
use crate::model::{AdaptationAction, AdaptationDecision, BiasSignal, BiasType, FeatureSummary};

mod policy;

pub use policy::Policy;

/// Decision and signal produced for one summary
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Evaluation {
    pub decision: AdaptationDecision,
    pub signal: BiasSignal,
}

impl Evaluation {
    pub fn neutral() -> Self {
        Self {
            decision: AdaptationDecision::none(),
            signal: BiasSignal::none(),
        }
    }
}

/// Seam for the evaluation layer
///
/// The in-process `BiasEngine` never fails on valid input. A remote substitute may
/// return `Error::UpstreamUnavailable`, which the orchestrator turns into a neutral
/// decision.
pub trait Evaluator: Send + Sync {
    fn evaluate(&self, summary: &FeatureSummary, metadata: &ContentMetadata) -> Result<Evaluation>;

    /// Policy archived alongside audit records for replay
    fn policy(&self) -> &Policy;
}

/// Rule-based engine running `evaluate` under a fixed policy
#[derive(Debug, Clone, Default)]
pub struct BiasEngine {
    policy: Policy,
}

impl BiasEngine {
    pub fn new(policy: Policy) -> Self {
        Self { policy }
    }
}

impl Evaluator for BiasEngine {
    fn evaluate(&self, summary: &FeatureSummary, metadata: &ContentMetadata) -> Result<Evaluation> {
        evaluate(summary, metadata, &self.policy)
    }

    fn policy(&self) -> &Policy {
        &self.policy
    }
}

/// Reject summaries that break the shape contract
pub fn validate_summary(summary: &FeatureSummary, policy: &Policy) -> Result<()> {
    let fields = [
        ("latency_mean_ms", summary.latency_mean_ms),
        ("latency_variance_ms2", summary.latency_variance_ms2),
        ("clarification_ratio", summary.clarification_ratio),
        ("clarification_rate", summary.clarification_rate),
        ("error_rate", summary.error_rate),
    ];
    for (name, value) in fields {
        if !value.is_finite() {
            return Err(Error::InvalidFeatureSummary(format!("{} is not finite", name)));
        }
        if value < 0.0 {
            return Err(Error::InvalidFeatureSummary(format!("{} is negative", name)));
        }
    }

    for (name, rate) in [
        ("clarification_rate", summary.clarification_rate),
        ("error_rate", summary.error_rate),
    ] {
        if rate > 1.0 {
            return Err(Error::InvalidFeatureSummary(format!("{} exceeds 1", name)));
        }
    }

    if summary.max_consecutive_errors > summary.sample_count {
        return Err(Error::InvalidFeatureSummary(
            "error run longer than the window".to_string(),
        ));
    }
    if !summary.is_low_confidence() && summary.sample_count < policy.min_samples {
        return Err(Error::InvalidFeatureSummary(format!(
            "sufficient confidence claimed with {} samples",
            summary.sample_count
        )));
    }
    Ok(())
}

/// Normalized excess of `value` over `threshold`
fn excess(value: f64, threshold: f64, span: f64) -> f64 {
    ((value - threshold) / span).clamp(0.0, 1.0)
}

fn magnitude(severity: f64, levels: u8) -> u8 {
    let level = (severity * f64::from(levels)).ceil();
    (level as u8).clamp(1, levels)
}

/// `evaluate(summary, metadata) -> (decision, signal)` under `policy`
pub fn evaluate(summary: &FeatureSummary, metadata: &ContentMetadata, policy: &Policy) -> Result<Evaluation> {
    validate_summary(summary, policy)?;

    if summary.is_low_confidence() {
        return Ok(Evaluation::neutral());
    }

    let ratio_high = summary.clarification_ratio > policy.clarification_ratio_threshold;
    let variance_high = summary.latency_variance_ms2 > policy.latency_variance_threshold;

    let mut candidates: Vec<(BiasType, f64, AdaptationAction)> = Vec::with_capacity(3);

    if ratio_high && variance_high {
        let ratio = excess(
            summary.clarification_ratio,
            policy.clarification_ratio_threshold,
            policy.clarification_ratio_span,
        );
        let variance = excess(
            summary.latency_variance_ms2,
            policy.latency_variance_threshold,
            policy.latency_variance_span,
        );
        let content = if metadata.reading_grade.is_finite()
            && metadata.reading_grade > policy.high_complexity_grade
        {
            policy.content_weight
                * excess(metadata.reading_grade, policy.high_complexity_grade, policy.grade_span)
        } else {
            0.0
        };
        candidates.push((
            BiasType::LanguageComplexity,
            (ratio + variance) / 2.0 + content,
            AdaptationAction::Simplify,
        ));
    }

    if summary.max_consecutive_errors >= policy.consecutive_error_threshold {
        // The threshold run itself counts as the first step
        let run = f64::from(summary.max_consecutive_errors - policy.consecutive_error_threshold + 1);
        let severity = run / f64::from(policy.consecutive_error_span);
        candidates.push((BiasType::PaceMismatch, severity, AdaptationAction::AddExample));
    }

    let unclear_without_struggle = ratio_high && !variance_high;
    let error_prone = summary.error_rate > policy.error_rate_threshold;
    if unclear_without_struggle || error_prone {
        let mut severity: f64 = 0.0;
        if unclear_without_struggle {
            severity = severity.max(excess(
                summary.clarification_ratio,
                policy.clarification_ratio_threshold,
                policy.clarification_ratio_span,
            ));
        }
        if error_prone {
            severity = severity.max(excess(
                summary.error_rate,
                policy.error_rate_threshold,
                policy.error_rate_span,
            ));
        }
        let action = if metadata.has_examples {
            AdaptationAction::ChangeModality
        } else {
            AdaptationAction::AddExample
        };
        candidates.push((BiasType::ExposureGap, severity, action));
    }

    // Compared as reported; strictly greater keeps the earlier rule on ties
    let mut winner: Option<(BiasType, f64, AdaptationAction)> = None;
    for (bias_type, severity, action) in candidates {
        let severity = severity.clamp(0.0, 1.0);
        if winner.map_or(true, |(_, best, _)| severity > best) {
            winner = Some((bias_type, severity, action));
        }
    }

    Ok(match winner {
        Some((bias_type, severity, action)) => {
            let signal = BiasSignal::new(bias_type, severity);
            Evaluation {
                decision: AdaptationDecision {
                    action,
                    magnitude: magnitude(signal.severity, policy.simplification_levels),
                },
                signal,
            }
        }
        None => Evaluation::neutral(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Confidence;

    fn summary() -> FeatureSummary {
        FeatureSummary {
            sample_count: 6,
            latency_mean_ms: 2000.0,
            latency_variance_ms2: 250_000.0,
            clarification_ratio: 0.0,
            clarification_rate: 0.0,
            error_rate: 0.0,
            max_consecutive_errors: 0,
            confidence: Confidence::Sufficient,
        }
    }

    fn metadata() -> ContentMetadata {
        ContentMetadata {
            content_ref: "lesson-3".to_string(),
            course_id: "chem-201".to_string(),
            reading_grade: 9.0,
            word_count: 400,
            complex_word_ratio: 0.1,
            jargon_terms: Vec::new(),
            has_examples: false,
            is_structured: true,
        }
    }

    fn run(summary: &FeatureSummary, metadata: &ContentMetadata) -> Evaluation {
        evaluate(summary, metadata, &Policy::default()).unwrap()
    }

    #[test]
    fn test_quiet_session_is_neutral() {
        assert_eq!(run(&summary(), &metadata()), Evaluation::neutral());
    }

    #[test]
    fn test_low_confidence_is_neutral() {
        let result = run(&FeatureSummary::low_confidence(1), &metadata());
        assert!(result.decision.is_none());
        assert_eq!(result.signal.severity, 0.0);
    }

    #[test]
    fn test_language_complexity_simplifies() {
        let s = FeatureSummary {
            clarification_ratio: 3.0,
            clarification_rate: 1.0,
            latency_variance_ms2: 10_000_000.0,
            ..summary()
        };
        let result = run(&s, &metadata());
        assert_eq!(result.signal.bias_type, BiasType::LanguageComplexity);
        assert_eq!(result.decision.action, AdaptationAction::Simplify);
        assert!(result.signal.severity > 0.0);
        assert!((1..=3).contains(&result.decision.magnitude));
    }

    #[test]
    fn test_hard_content_raises_language_severity() {
        let s = FeatureSummary {
            clarification_ratio: 1.0,
            clarification_rate: 0.5,
            latency_variance_ms2: 6_000_000.0,
            ..summary()
        };
        let plain = run(&s, &metadata());
        let hard = run(
            &s,
            &ContentMetadata {
                reading_grade: 15.0,
                ..metadata()
            },
        );
        assert!(hard.signal.severity > plain.signal.severity);
    }

    #[test]
    fn test_pace_mismatch_adds_example() {
        let s = FeatureSummary {
            error_rate: 0.5,
            max_consecutive_errors: 3,
            ..summary()
        };
        let result = run(&s, &metadata());
        // pace 0.2 vs exposure (0.5 - 0.4) / 0.6
        assert_eq!(result.signal.bias_type, BiasType::PaceMismatch);
        assert_eq!(result.decision.action, AdaptationAction::AddExample);
        assert_eq!(result.decision.magnitude, 1);
    }

    #[test]
    fn test_exposure_gap_modality_when_examples_present() {
        let s = FeatureSummary {
            clarification_ratio: 2.0,
            clarification_rate: 0.6,
            ..summary()
        };
        let without = run(&s, &metadata());
        assert_eq!(without.signal.bias_type, BiasType::ExposureGap);
        assert_eq!(without.decision.action, AdaptationAction::AddExample);

        let with = run(
            &s,
            &ContentMetadata {
                has_examples: true,
                ..metadata()
            },
        );
        assert_eq!(with.decision.action, AdaptationAction::ChangeModality);
        assert_eq!(with.signal, without.signal);
    }

    #[test]
    fn test_severity_monotonic_in_excess() {
        let mut last = 0.0;
        for run_length in 3..=6 {
            let s = FeatureSummary {
                max_consecutive_errors: run_length,
                error_rate: 0.3,
                ..summary()
            };
            let severity = run(&s, &metadata()).signal.severity;
            assert!(severity > last);
            last = severity;
        }
    }

    #[test]
    fn test_ties_resolve_in_rule_order() {
        // Language: ratio excess 1.0, variance excess 1.0 -> 1.0
        // Pace: run of 7 with span 5 -> 1.0
        let s = FeatureSummary {
            sample_count: 8,
            clarification_ratio: 5.0,
            clarification_rate: 0.5,
            latency_variance_ms2: 50_000_000.0,
            max_consecutive_errors: 7,
            error_rate: 0.5,
            ..summary()
        };
        let result = run(&s, &metadata());
        assert_eq!(result.signal.severity, 1.0);
        assert_eq!(result.signal.bias_type, BiasType::LanguageComplexity);
        assert_eq!(result.decision.magnitude, 3);
    }

    #[test]
    fn test_saturated_severities_tie_in_rule_order() {
        // Pace: run of 8 -> 1.2 before clamping; language saturates at 1.0
        let s = FeatureSummary {
            sample_count: 10,
            clarification_ratio: 5.0,
            clarification_rate: 0.5,
            latency_variance_ms2: 50_000_000.0,
            max_consecutive_errors: 8,
            error_rate: 0.8,
            ..summary()
        };
        let result = run(&s, &metadata());
        assert_eq!(result.signal.bias_type, BiasType::LanguageComplexity);
        assert_eq!(result.signal.severity, 1.0);
        assert_eq!(result.decision.action, AdaptationAction::Simplify);
    }

    #[test]
    fn test_rejects_malformed_summaries() {
        let bad = [
            FeatureSummary {
                latency_mean_ms: f64::NAN,
                ..summary()
            },
            FeatureSummary {
                error_rate: 1.5,
                ..summary()
            },
            FeatureSummary {
                latency_variance_ms2: -1.0,
                ..summary()
            },
            FeatureSummary {
                max_consecutive_errors: 9,
                ..summary()
            },
            FeatureSummary {
                sample_count: 1,
                ..summary()
            },
        ];
        for s in bad {
            assert!(matches!(
                evaluate(&s, &metadata(), &Policy::default()),
                Err(Error::InvalidFeatureSummary(_))
            ));
        }
    }

    #[test]
    fn test_deterministic_across_serialization() {
        let s = FeatureSummary {
            sample_count: 7,
            latency_mean_ms: 3123.456789,
            latency_variance_ms2: 7_654_321.123,
            clarification_ratio: 1.0 / 3.0,
            clarification_rate: 2.0 / 7.0,
            error_rate: 3.0 / 7.0,
            max_consecutive_errors: 3,
            confidence: Confidence::Sufficient,
        };
        let m = ContentMetadata {
            reading_grade: 13.37,
            ..metadata()
        };
        let first = run(&s, &m);

        let s2: FeatureSummary = serde_json::from_str(&serde_json::to_string(&s).unwrap()).unwrap();
        let m2: ContentMetadata = serde_json::from_str(&serde_json::to_string(&m).unwrap()).unwrap();
        let replay = run(&s2, &m2);

        assert_eq!(first, replay);
        assert_eq!(first.signal.severity.to_bits(), replay.signal.severity.to_bits());
        for _ in 0..100 {
            assert_eq!(run(&s, &m), first);
        }
    }
}
