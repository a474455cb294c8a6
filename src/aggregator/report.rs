//! Released aggregate reports and the analytics view over them

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Mutex;

use crate::model::BiasType;

/// Noised, threshold-gated statistics for one (course, window, bias type)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregateReport {
    pub course_id: String,
    pub window_start: DateTime<Utc>,
    pub window_minutes: u32,
    pub bias_type: BiasType,
    pub noised_contributors: u64,
    pub noised_mean_severity: f64,
    /// Noised contributor counts over equal-width severity bins in [0, 1]
    pub noised_histogram: Vec<f64>,
    pub epsilon_spent: f64,
}

/// Filter accepted by the analytics endpoints
///
/// Only group-level keys exist here. Anything else, a fingerprint or a handle in
/// particular, fails to deserialize.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AnalyticsQuery {
    pub course_id: Option<String>,
    pub bias_type: Option<BiasType>,
}

impl AnalyticsQuery {
    pub fn matches(&self, report: &AggregateReport) -> bool {
        self.course_id
            .as_ref()
            .map_or(true, |course| &report.course_id == course)
            && self.bias_type.map_or(true, |bias| report.bias_type == bias)
    }
}

/// Bounded history of published reports
#[derive(Debug)]
pub struct ReportBoard {
    reports: Mutex<VecDeque<AggregateReport>>,
    capacity: usize,
    alert_severity: f64,
}

impl ReportBoard {
    pub fn new(capacity: usize, alert_severity: f64) -> Self {
        Self {
            reports: Mutex::new(VecDeque::new()),
            capacity: capacity.max(1),
            alert_severity,
        }
    }

    pub fn publish(&self, report: AggregateReport) {
        let mut reports = self.reports.lock().unwrap_or_else(|p| p.into_inner());
        reports.push_back(report);
        while reports.len() > self.capacity {
            reports.pop_front();
        }
    }

    /// Matching reports, oldest first
    pub fn overview(&self, query: &AnalyticsQuery) -> Vec<AggregateReport> {
        let reports = self.reports.lock().unwrap_or_else(|p| p.into_inner());
        reports.iter().filter(|r| query.matches(r)).cloned().collect()
    }

    /// Matching reports at or above the alert severity, strongest first
    pub fn alerts(&self, query: &AnalyticsQuery) -> Vec<AggregateReport> {
        let mut alerts: Vec<AggregateReport> = self
            .overview(query)
            .into_iter()
            .filter(|r| r.bias_type != BiasType::None && r.noised_mean_severity >= self.alert_severity)
            .collect();
        alerts.sort_by(|a, b| b.noised_mean_severity.total_cmp(&a.noised_mean_severity));
        alerts
    }

    pub fn len(&self) -> usize {
        self.reports.lock().unwrap_or_else(|p| p.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn report(course: &str, bias: BiasType, severity: f64) -> AggregateReport {
        AggregateReport {
            course_id: course.to_string(),
            window_start: Utc.with_ymd_and_hms(2026, 3, 1, 10, 0, 0).unwrap(),
            window_minutes: 60,
            bias_type: bias,
            noised_contributors: 24,
            noised_mean_severity: severity,
            noised_histogram: vec![0.0; 5],
            epsilon_spent: 3.0,
        }
    }

    #[test]
    fn test_query_rejects_identity_filters() {
        let result: Result<AnalyticsQuery, _> =
            serde_json::from_str(r#"{"course_id": "c1", "fingerprint": "ab12"}"#);
        assert!(result.is_err());
        let result: Result<AnalyticsQuery, _> = serde_json::from_str(r#"{"handle": "sess-1234"}"#);
        assert!(result.is_err());

        let ok: AnalyticsQuery = serde_json::from_str(r#"{"bias_type": "pace_mismatch"}"#).unwrap();
        assert_eq!(ok.bias_type, Some(BiasType::PaceMismatch));
    }

    #[test]
    fn test_overview_filters_and_bounds() {
        let board = ReportBoard::new(2, 0.5);
        board.publish(report("c1", BiasType::PaceMismatch, 0.6));
        board.publish(report("c2", BiasType::ExposureGap, 0.2));
        board.publish(report("c1", BiasType::LanguageComplexity, 0.8));

        assert_eq!(board.len(), 2);
        let c1 = board.overview(&AnalyticsQuery {
            course_id: Some("c1".to_string()),
            bias_type: None,
        });
        assert_eq!(c1.len(), 1);
        assert_eq!(c1[0].bias_type, BiasType::LanguageComplexity);
    }

    #[test]
    fn test_alerts_sorted_by_severity() {
        let board = ReportBoard::new(10, 0.5);
        board.publish(report("c1", BiasType::PaceMismatch, 0.6));
        board.publish(report("c1", BiasType::ExposureGap, 0.3));
        board.publish(report("c1", BiasType::LanguageComplexity, 0.9));

        let alerts = board.alerts(&AnalyticsQuery::default());
        let severities: Vec<f64> = alerts.iter().map(|r| r.noised_mean_severity).collect();
        assert_eq!(severities, vec![0.9, 0.6]);
    }
}
