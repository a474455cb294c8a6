//! Wire types for the service socket
//!
//! One JSON object per line in each direction:
//! `{"command": "...", "args": {...}}` in, `{"success", "data", "error"}` out.

use serde::{Deserialize, Serialize};

use crate::aggregator::AnalyticsQuery;
use crate::anonymizer::SessionIdentity;
use crate::content::ContentMetadata;
use crate::model::{AdaptationDecision, FeatureSummary, Interaction};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "command", content = "args", rename_all = "kebab-case")]
pub enum ServiceRequest {
    AnalyzeInteraction {
        identity: SessionIdentity,
        interaction: Interaction,
    },
    DetectBias {
        summary: FeatureSummary,
        metadata: ContentMetadata,
    },
    GenerateAdaptation {
        decision: AdaptationDecision,
        base_content: String,
    },
    /// `args` may be `{}` but must be present
    #[serde(rename = "analytics/overview")]
    AnalyticsOverview(AnalyticsQuery),
    #[serde(rename = "analytics/bias-alerts")]
    AnalyticsBiasAlerts(AnalyticsQuery),
    RegisterContent {
        content_ref: String,
        course_id: String,
        text: String,
    },
    CloseSession {
        identity: SessionIdentity,
    },
    Status,
    Ping,
    Shutdown,
}

impl ServiceRequest {
    pub fn name(&self) -> &'static str {
        match self {
            ServiceRequest::AnalyzeInteraction { .. } => "analyze-interaction",
            ServiceRequest::DetectBias { .. } => "detect-bias",
            ServiceRequest::GenerateAdaptation { .. } => "generate-adaptation",
            ServiceRequest::AnalyticsOverview(_) => "analytics/overview",
            ServiceRequest::AnalyticsBiasAlerts(_) => "analytics/bias-alerts",
            ServiceRequest::RegisterContent { .. } => "register-content",
            ServiceRequest::CloseSession { .. } => "close-session",
            ServiceRequest::Status => "status",
            ServiceRequest::Ping => "ping",
            ServiceRequest::Shutdown => "shutdown",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DaemonResponse {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl DaemonResponse {
    pub fn ok(data: impl Serialize) -> Self {
        match serde_json::to_value(data) {
            Ok(value) => Self {
                success: true,
                data: Some(value),
                error: None,
            },
            Err(e) => Self::err(format!("Failed to serialize response: {}", e)),
        }
    }

    pub fn err(msg: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(msg.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ActionType;

    #[test]
    fn test_parse_analyze_interaction() {
        let line = r#"{"command":"analyze-interaction","args":{
            "identity":{"handle":"sess-9f8e7d6c"},
            "interaction":{"timestamp":"2026-03-01T10:04:00Z","action_type":"clarify",
                           "response_latency_ms":4200,"content_ref":"lesson-2"}}}"#;
        let request: ServiceRequest = serde_json::from_str(line).unwrap();
        match request {
            ServiceRequest::AnalyzeInteraction { identity, interaction } => {
                assert_eq!(identity, SessionIdentity::Handle("sess-9f8e7d6c".to_string()));
                assert_eq!(interaction.action_type, ActionType::Clarify);
            }
            other => panic!("unexpected request {:?}", other),
        }
    }

    #[test]
    fn test_parse_unit_commands() {
        let request: ServiceRequest = serde_json::from_str(r#"{"command":"ping"}"#).unwrap();
        assert_eq!(request.name(), "ping");
    }

    #[test]
    fn test_analytics_rejects_identity_filter() {
        let ok: ServiceRequest =
            serde_json::from_str(r#"{"command":"analytics/overview","args":{"course_id":"c1"}}"#).unwrap();
        assert_eq!(ok.name(), "analytics/overview");

        let rejected = serde_json::from_str::<ServiceRequest>(
            r#"{"command":"analytics/bias-alerts","args":{"fingerprint":"00ff"}}"#,
        );
        assert!(rejected.is_err());
    }

    #[test]
    fn test_response_shape() {
        let json = serde_json::to_string(&DaemonResponse::ok("pong")).unwrap();
        assert_eq!(json, r#"{"success":true,"data":"pong"}"#);

        let json = serde_json::to_string(&DaemonResponse::err("nope")).unwrap();
        assert_eq!(json, r#"{"success":false,"error":"nope"}"#);
    }
}
