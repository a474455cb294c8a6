//! Operational incident log
//!
//! Internal failures that were absorbed instead of surfaced to the learner. Bounded,
//! in memory, never carries a handle.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IncidentKind {
    UpstreamUnavailable,
    AuditAppendFailed,
    NoiseFault,
    InvalidSummary,
}

impl IncidentKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            IncidentKind::UpstreamUnavailable => "upstream_unavailable",
            IncidentKind::AuditAppendFailed => "audit_append_failed",
            IncidentKind::NoiseFault => "noise_fault",
            IncidentKind::InvalidSummary => "invalid_summary",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Incident {
    pub at: DateTime<Utc>,
    pub kind: IncidentKind,
    pub detail: String,
}

#[derive(Debug)]
pub struct IncidentLog {
    entries: Mutex<VecDeque<Incident>>,
    capacity: usize,
    total: AtomicU64,
}

impl IncidentLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Mutex::new(VecDeque::new()),
            capacity: capacity.max(1),
            total: AtomicU64::new(0),
        }
    }

    pub fn record(&self, kind: IncidentKind, detail: impl Into<String>) {
        let incident = Incident {
            at: Utc::now(),
            kind,
            detail: detail.into(),
        };
        warn!("Incident [{}]: {}", kind.as_str(), incident.detail);

        self.total.fetch_add(1, Ordering::Relaxed);
        let mut entries = self.entries.lock().unwrap_or_else(|p| p.into_inner());
        entries.push_back(incident);
        while entries.len() > self.capacity {
            entries.pop_front();
        }
    }

    /// Retained incidents, oldest first
    pub fn recent(&self) -> Vec<Incident> {
        self.entries
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .iter()
            .cloned()
            .collect()
    }

    pub fn count_of(&self, kind: IncidentKind) -> usize {
        self.entries
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .iter()
            .filter(|i| i.kind == kind)
            .count()
    }

    /// Incidents recorded since start, including evicted ones
    pub fn total(&self) -> u64 {
        self.total.load(Ordering::Relaxed)
    }
}
