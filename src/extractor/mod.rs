//! Pattern extractor - interaction window to feature summary
//!
//! Summaries are recomputed from the bounded window on every call; nothing is
//! accumulated across calls. Windows below the minimum size produce a low-confidence
//! summary with zeroed statistics instead of made-up numbers.

use chrono::TimeDelta;

use crate::config::WindowConfig;
use crate::model::{ActionType, AnonymizedInteraction, Confidence, FeatureSummary, SessionFingerprint};

pub mod window;

pub use window::SlidingWindow;

/// Compute the feature summary for `fingerprint` from its recent history
///
/// Only the most recent `max_interactions` entries within `max_span_minutes` of the
/// newest entry are considered, however long the supplied history is. Entries
/// belonging to other fingerprints are ignored.
pub fn extract<'a>(
    fingerprint: &SessionFingerprint,
    history: impl IntoIterator<Item = &'a AnonymizedInteraction>,
    config: &WindowConfig,
) -> FeatureSummary {
    let own: Vec<&AnonymizedInteraction> = history
        .into_iter()
        .filter(|entry| &entry.fingerprint == fingerprint)
        .collect();

    let skip = own.len().saturating_sub(config.max_interactions);
    let recent = &own[skip..];

    let window: Vec<&AnonymizedInteraction> = match recent.iter().map(|e| e.bucket).max() {
        Some(newest) => {
            let horizon = newest
                .start()
                .checked_sub_signed(TimeDelta::minutes(i64::from(config.max_span_minutes)));
            recent
                .iter()
                .copied()
                .filter(|e| horizon.map_or(true, |h| e.bucket.start() >= h))
                .collect()
        }
        None => Vec::new(),
    };

    let n = window.len() as u32;
    if n < config.min_interactions.max(1) {
        return FeatureSummary::low_confidence(n);
    }

    summarize(&window)
}

fn summarize(window: &[&AnonymizedInteraction]) -> FeatureSummary {
    let n = window.len() as f64;

    let latencies: Vec<f64> = window.iter().map(|e| e.response_latency_ms as f64).collect();
    let mean = latencies.iter().sum::<f64>() / n;
    let variance = latencies.iter().map(|l| (l - mean).powi(2)).sum::<f64>() / n;

    let count = |action: ActionType| window.iter().filter(|e| e.action_type == action).count() as f64;
    let reads = count(ActionType::Read);
    let clarifies = count(ActionType::Clarify);
    let asks = count(ActionType::Ask);
    let errors = window.iter().filter(|e| e.action_type.is_error_like()).count() as f64;

    let mut longest_run = 0u32;
    let mut run = 0u32;
    for entry in window {
        if entry.action_type.is_error_like() {
            run += 1;
            longest_run = longest_run.max(run);
        } else {
            run = 0;
        }
    }

    FeatureSummary {
        sample_count: window.len() as u32,
        latency_mean_ms: mean,
        latency_variance_ms2: variance,
        clarification_ratio: clarifies / reads.max(1.0),
        clarification_rate: (clarifies + asks) / n,
        error_rate: errors / n,
        max_consecutive_errors: longest_run,
        confidence: Confidence::Sufficient,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::anonymizer::{fingerprint, time_bucket, Salt};
    use chrono::{TimeZone, Utc};

    fn fp(handle: &str) -> SessionFingerprint {
        fingerprint(handle, &Salt::from_bytes(0, [4u8; 32])).unwrap()
    }

    fn entry(owner: &SessionFingerprint, minute: i64, action: ActionType, latency: u64) -> AnonymizedInteraction {
        let at = Utc.with_ymd_and_hms(2026, 2, 2, 14, 0, 0).unwrap() + TimeDelta::minutes(minute);
        AnonymizedInteraction {
            fingerprint: owner.clone(),
            bucket: time_bucket(at, 15),
            action_type: action,
            response_latency_ms: latency,
            content_ref: "lesson-7".to_string(),
        }
    }

    #[test]
    fn test_low_confidence_below_minimum() {
        let owner = fp("sess-extract-1");
        let history = vec![entry(&owner, 0, ActionType::Read, 900), entry(&owner, 1, ActionType::Ask, 1500)];
        let summary = extract(&owner, &history, &WindowConfig::default());

        assert!(summary.is_low_confidence());
        assert_eq!(summary.sample_count, 2);
        assert_eq!(summary.latency_mean_ms, 0.0);
    }

    #[test]
    fn test_statistics() {
        let owner = fp("sess-extract-2");
        let history = vec![
            entry(&owner, 0, ActionType::Read, 1000),
            entry(&owner, 1, ActionType::Clarify, 3000),
            entry(&owner, 2, ActionType::Error, 2000),
            entry(&owner, 3, ActionType::Retry, 2000),
        ];
        let summary = extract(&owner, &history, &WindowConfig::default());

        assert_eq!(summary.confidence, Confidence::Sufficient);
        assert_eq!(summary.sample_count, 4);
        assert_eq!(summary.latency_mean_ms, 2000.0);
        assert_eq!(summary.latency_variance_ms2, 500_000.0);
        assert_eq!(summary.clarification_ratio, 1.0);
        assert_eq!(summary.clarification_rate, 0.25);
        assert_eq!(summary.error_rate, 0.5);
        assert_eq!(summary.max_consecutive_errors, 2);
    }

    #[test]
    fn test_ignores_history_beyond_count_bound() {
        let owner = fp("sess-extract-3");
        let config = WindowConfig {
            max_interactions: 3,
            max_span_minutes: 600,
            min_interactions: 3,
        };

        // Old errors followed by three reads; only the reads may be reflected
        let mut history: Vec<_> = (0..10).map(|i| entry(&owner, i, ActionType::Error, 9000)).collect();
        history.extend((10..13).map(|i| entry(&owner, i, ActionType::Read, 1000)));

        let summary = extract(&owner, &history, &config);
        assert_eq!(summary.sample_count, 3);
        assert_eq!(summary.error_rate, 0.0);
        assert_eq!(summary.max_consecutive_errors, 0);
        assert_eq!(summary.latency_mean_ms, 1000.0);
    }

    #[test]
    fn test_ignores_history_beyond_time_bound() {
        let owner = fp("sess-extract-4");
        let config = WindowConfig {
            max_interactions: 100,
            max_span_minutes: 30,
            min_interactions: 1,
        };

        let history = vec![
            entry(&owner, 0, ActionType::Clarify, 5000),
            entry(&owner, 90, ActionType::Read, 1000),
            entry(&owner, 95, ActionType::Read, 1000),
        ];
        let summary = extract(&owner, &history, &config);
        assert_eq!(summary.sample_count, 2);
        assert_eq!(summary.clarification_ratio, 0.0);
    }

    #[test]
    fn test_other_fingerprints_excluded() {
        let owner = fp("sess-extract-5");
        let other = fp("sess-extract-6");
        let history = vec![
            entry(&owner, 0, ActionType::Read, 1000),
            entry(&other, 0, ActionType::Error, 1000),
            entry(&owner, 1, ActionType::Read, 1000),
            entry(&other, 1, ActionType::Error, 1000),
            entry(&owner, 2, ActionType::Read, 1000),
        ];
        let summary = extract(&owner, &history, &WindowConfig::default());
        assert_eq!(summary.sample_count, 3);
        assert_eq!(summary.error_rate, 0.0);
    }
}
