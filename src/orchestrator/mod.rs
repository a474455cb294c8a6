//! Orchestrator - routes session traffic through the pipeline
//!
//! Each fingerprint owns one slot behind an async mutex, so evaluations on one
//! window never interleave while different fingerprints run in parallel. The
//! adaptation decision is returned to the caller; the bias signal goes to the
//! aggregator and the audit entry to the audit writer without waiting on either.
//!
//! Upstream failures degrade to a neutral decision plus an incident. They are never
//! recorded as a bias finding.

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tracing::{debug, info};

use crate::aggregator::{AggregateReport, Aggregator, AnalyticsQuery, Disposition, FlushOutcome, ReportBoard};
use crate::anonymizer::{Anonymizer, SessionIdentity};
use crate::audit::{ArchivedInputs, AuditEntry, AuditSink, IncidentKind, IncidentLog};
use crate::config::Config;
use crate::content::{self, AdaptedContent, ContentCatalog, ContentMetadata};
use crate::engine::Evaluator;
use crate::error::{Error, Result};
use crate::model::{AdaptationDecision, BiasSignal, FeatureSummary, Interaction, SessionFingerprint, TimeBucket};

mod session;

pub use session::{SessionSlot, SessionState};

type Slot = Arc<AsyncMutex<SessionSlot>>;

/// Snapshot for the `status` command
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceStatus {
    pub active_sessions: usize,
    pub closed_sessions: usize,
    pub open_buckets: usize,
    pub published_reports: usize,
    pub incidents: u64,
}

pub struct Orchestrator {
    config: Config,
    anonymizer: Anonymizer,
    evaluator: Arc<dyn Evaluator>,
    catalog: Arc<dyn ContentCatalog>,
    aggregator: Arc<Aggregator>,
    board: ReportBoard,
    audit: AuditSink,
    incidents: Arc<IncidentLog>,
    sessions: Mutex<HashMap<SessionFingerprint, Slot>>,
    /// Closed fingerprints and when they closed
    tombstones: Mutex<HashMap<SessionFingerprint, DateTime<Utc>>>,
}

impl Orchestrator {
    pub fn new(
        config: Config,
        evaluator: Arc<dyn Evaluator>,
        catalog: Arc<dyn ContentCatalog>,
        aggregator: Arc<Aggregator>,
        audit: AuditSink,
        incidents: Arc<IncidentLog>,
    ) -> Self {
        let board = ReportBoard::new(
            config.aggregator.report_retention,
            config.aggregator.alert_severity,
        );
        Self {
            anonymizer: Anonymizer::new(&config.anonymizer),
            config,
            evaluator,
            catalog,
            aggregator,
            board,
            audit,
            incidents,
            sessions: Mutex::new(HashMap::new()),
            tombstones: Mutex::new(HashMap::new()),
        }
    }

    pub fn anonymizer(&self) -> &Anonymizer {
        &self.anonymizer
    }

    pub fn incidents(&self) -> &IncidentLog {
        &self.incidents
    }

    fn is_tombstoned(&self, fingerprint: &SessionFingerprint) -> bool {
        self.tombstones
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .contains_key(fingerprint)
    }

    /// Live slot for `fingerprint`, created on first use
    ///
    /// The tombstone check and the insert happen under the `sessions` lock, which
    /// `close_fingerprint` also holds while tombstoning, so a closed session cannot
    /// be recreated by a request that raced the close.
    fn slot(&self, fingerprint: &SessionFingerprint, now: DateTime<Utc>) -> Result<Slot> {
        let mut sessions = self.sessions.lock().unwrap_or_else(|p| p.into_inner());
        if self.is_tombstoned(fingerprint) {
            return Err(Error::SessionClosed);
        }
        Ok(Arc::clone(
            sessions
                .entry(fingerprint.clone())
                .or_insert_with(|| Arc::new(AsyncMutex::new(SessionSlot::new(&self.config.window, now)))),
        ))
    }

    /// Feed one interaction and return the adaptation for the session's window
    pub async fn analyze_interaction(
        &self,
        identity: &SessionIdentity,
        interaction: Interaction,
    ) -> Result<AdaptationDecision> {
        let now = Utc::now();
        let anonymized = self.anonymizer.admit(identity, interaction, now)?;
        let fingerprint = anonymized.fingerprint.clone();

        let slot = self.slot(&fingerprint, now)?;
        let mut slot = slot.lock().await;
        // Closed while this request waited for the slot
        slot.begin(now)?;

        let bucket = anonymized.bucket;
        let content_ref = anonymized.content_ref.clone();
        slot.window.push(anonymized);

        slot.evaluating();
        let summary = slot.window.summarize(&fingerprint, &self.config.window);
        let result = self.evaluate_and_route(&fingerprint, bucket, &content_ref, summary);
        slot.finish();
        result
    }

    fn evaluate_and_route(
        &self,
        fingerprint: &SessionFingerprint,
        bucket: TimeBucket,
        content_ref: &str,
        summary: FeatureSummary,
    ) -> Result<AdaptationDecision> {
        let metadata = match self.catalog.metadata(content_ref) {
            Ok(metadata) => metadata,
            Err(Error::UpstreamUnavailable(detail)) => {
                self.incidents.record(IncidentKind::UpstreamUnavailable, detail);
                return Ok(AdaptationDecision::none());
            }
            Err(e) => return Err(e),
        };

        let evaluation = match self.evaluator.evaluate(&summary, &metadata) {
            Ok(evaluation) => evaluation,
            Err(Error::UpstreamUnavailable(detail)) => {
                self.incidents.record(IncidentKind::UpstreamUnavailable, detail);
                return Ok(AdaptationDecision::none());
            }
            Err(Error::InvalidFeatureSummary(detail)) => {
                // Produced internally, so this is our fault and not the caller's
                self.incidents.record(IncidentKind::InvalidSummary, detail);
                return Ok(AdaptationDecision::none());
            }
            Err(e) => return Err(e),
        };

        if evaluation.signal.is_detected() {
            let window = self.aggregator.window_of(bucket.start());
            self.aggregator
                .absorb(&metadata.course_id, window, fingerprint, evaluation.signal);
        }

        debug!(
            "Session {}: {} -> {} ({:.2})",
            fingerprint.short(),
            evaluation.signal.bias_type.as_str(),
            evaluation.decision.action.as_str(),
            evaluation.signal.severity
        );

        self.audit.submit(AuditEntry {
            bucket,
            fingerprint: fingerprint.clone(),
            inputs: ArchivedInputs {
                summary,
                metadata,
                policy: self.evaluator.policy().clone(),
            },
            evaluation,
        });

        Ok(evaluation.decision)
    }

    /// Stateless bias detection over a caller-supplied summary
    pub fn detect_bias(&self, summary: &FeatureSummary, metadata: &ContentMetadata) -> Result<BiasSignal> {
        match self.evaluator.evaluate(summary, metadata) {
            Ok(evaluation) => Ok(evaluation.signal),
            Err(Error::UpstreamUnavailable(detail)) => {
                self.incidents.record(IncidentKind::UpstreamUnavailable, detail);
                Ok(BiasSignal::none())
            }
            Err(e) => Err(e),
        }
    }

    pub fn generate_adaptation(&self, decision: &AdaptationDecision, base_content: &str) -> AdaptedContent {
        content::generate_adaptation(decision, base_content)
    }

    /// End a session; returns whether it had live state
    pub async fn close_session(&self, identity: &SessionIdentity) -> Result<bool> {
        let fingerprint = self.anonymizer.resolve(identity, Utc::now())?;
        Ok(self.close_fingerprint(&fingerprint).await)
    }

    async fn close_fingerprint(&self, fingerprint: &SessionFingerprint) -> bool {
        let slot = {
            let mut sessions = self.sessions.lock().unwrap_or_else(|p| p.into_inner());
            self.tombstones
                .lock()
                .unwrap_or_else(|p| p.into_inner())
                .insert(fingerprint.clone(), Utc::now());
            sessions.remove(fingerprint)
        };

        match slot {
            Some(slot) => {
                // Waits for an in-flight evaluation to complete
                slot.lock().await.close();
                info!("Closed session {}", fingerprint.short());
                true
            }
            None => false,
        }
    }

    /// Process a session's interactions in arrival order until the input ends
    ///
    /// Each result is sent on `results`. Stops early when the session is closed or
    /// the receiver of `results` is gone. Returns the number of interactions handled.
    pub async fn run_stream(
        &self,
        identity: SessionIdentity,
        mut interactions: mpsc::Receiver<Interaction>,
        results: mpsc::Sender<Result<AdaptationDecision>>,
    ) -> usize {
        let mut handled = 0;
        while let Some(interaction) = interactions.recv().await {
            let result = self.analyze_interaction(&identity, interaction).await;
            handled += 1;

            let closed = matches!(result, Err(Error::SessionClosed));
            if results.send(result).await.is_err() || closed {
                break;
            }
        }
        handled
    }

    /// Close sessions idle longer than the timeout and forget stale tombstones
    pub async fn reap_idle(&self, now: DateTime<Utc>) -> usize {
        let idle_after = TimeDelta::seconds(self.config.session.idle_timeout_secs as i64);
        let candidates: Vec<(SessionFingerprint, Slot)> = self
            .sessions
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .iter()
            .map(|(fp, slot)| (fp.clone(), Arc::clone(slot)))
            .collect();

        let mut reaped = 0;
        for (fingerprint, slot) in candidates {
            // Busy slots are not idle
            let idle = match slot.try_lock() {
                Ok(slot) => now - slot.last_seen() > idle_after,
                Err(_) => false,
            };
            if idle && self.close_fingerprint(&fingerprint).await {
                reaped += 1;
            }
        }

        let ttl = TimeDelta::seconds(self.config.session.tombstone_ttl_secs as i64);
        self.tombstones
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .retain(|_, closed_at| now - *closed_at <= ttl);

        if reaped > 0 {
            info!("Reaped {} idle sessions", reaped);
        }
        reaped
    }

    /// Flush ended aggregation windows and publish what was released
    pub fn flush_due(&self, now: DateTime<Utc>) -> Vec<FlushOutcome> {
        let outcomes = self.aggregator.flush_due(now);
        for outcome in &outcomes {
            match outcome {
                FlushOutcome::Report(report) => self.board.publish(report.clone()),
                FlushOutcome::Suppressed(suppressed) if suppressed.disposition == Disposition::NoiseFault => {
                    self.incidents.record(
                        IncidentKind::NoiseFault,
                        format!(
                            "{} {} window {} withheld",
                            suppressed.course_id,
                            suppressed.bias_type.as_str(),
                            suppressed.window_start
                        ),
                    );
                }
                FlushOutcome::Suppressed(_) => {}
            }
        }
        if !outcomes.is_empty() {
            debug!("Flushed {} aggregate buckets", outcomes.len());
        }
        outcomes
    }

    pub fn overview(&self, query: &AnalyticsQuery) -> Vec<AggregateReport> {
        self.board.overview(query)
    }

    pub fn bias_alerts(&self, query: &AnalyticsQuery) -> Vec<AggregateReport> {
        self.board.alerts(query)
    }

    /// Wait for queued audit entries to be written
    pub async fn sync_audit(&self) {
        self.audit.sync().await;
    }

    pub fn status(&self) -> ServiceStatus {
        ServiceStatus {
            active_sessions: self.sessions.lock().unwrap_or_else(|p| p.into_inner()).len(),
            closed_sessions: self.tombstones.lock().unwrap_or_else(|p| p.into_inner()).len(),
            open_buckets: self.aggregator.open_buckets(),
            published_reports: self.board.len(),
            incidents: self.incidents.total(),
        }
    }

    /// State of a live session, if any
    pub async fn session_state(&self, fingerprint: &SessionFingerprint) -> Option<SessionState> {
        let slot = self
            .sessions
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .get(fingerprint)
            .cloned();
        match slot {
            Some(slot) => Some(slot.lock().await.state()),
            None if self.is_tombstoned(fingerprint) => Some(SessionState::Closed),
            None => None,
        }
    }
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("status", &self.status())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::AuditLogger;
    use crate::content::InMemoryCatalog;
    use crate::engine::BiasEngine;
    use crate::model::ActionType;

    const LESSON: &str = "Atoms bond by sharing electrons. Covalent bonds are strong.";

    fn orchestrator() -> (Orchestrator, Arc<AuditLogger>) {
        let config = Config::default();
        let catalog = Arc::new(InMemoryCatalog::new());
        catalog.register("lesson-1", "chem-101", LESSON);

        let logger = Arc::new(AuditLogger::open_in_memory().unwrap());
        let incidents = Arc::new(IncidentLog::new(32));
        let (sink, _writer) = AuditSink::spawn(Arc::clone(&logger), Arc::clone(&incidents));

        let orchestrator = Orchestrator::new(
            config.clone(),
            Arc::new(BiasEngine::new(config.engine.clone())),
            catalog,
            Arc::new(Aggregator::new(config.aggregator.clone())),
            sink,
            incidents,
        );
        (orchestrator, logger)
    }

    fn handle(name: &str) -> SessionIdentity {
        SessionIdentity::Handle(format!("sess-orch-{}", name))
    }

    #[tokio::test]
    async fn test_state_returns_to_idle() {
        let (orch, _) = orchestrator();
        let id = handle("idle");
        orch.analyze_interaction(&id, Interaction::new(Utc::now(), ActionType::Read, 900, "lesson-1"))
            .await
            .unwrap();

        let fp = orch.anonymizer().resolve(&id, Utc::now()).unwrap();
        assert_eq!(orch.session_state(&fp).await, Some(SessionState::Idle));
    }

    #[tokio::test]
    async fn test_unknown_content_degrades_to_none() {
        let (orch, logger) = orchestrator();
        let decision = orch
            .analyze_interaction(&handle("gap"), Interaction::new(Utc::now(), ActionType::Error, 900, "missing"))
            .await
            .unwrap();
        orch.sync_audit().await;

        assert!(decision.is_none());
        assert_eq!(orch.incidents().count_of(IncidentKind::UpstreamUnavailable), 1);
        assert_eq!(logger.count().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_reap_idle_closes_sessions() {
        let (orch, _) = orchestrator();
        let id = handle("reap");
        orch.analyze_interaction(&id, Interaction::new(Utc::now(), ActionType::Read, 900, "lesson-1"))
            .await
            .unwrap();

        assert_eq!(orch.reap_idle(Utc::now()).await, 0);
        let later = Utc::now() + TimeDelta::hours(1);
        assert_eq!(orch.reap_idle(later).await, 1);
        assert!(matches!(
            orch.analyze_interaction(&id, Interaction::new(Utc::now(), ActionType::Read, 900, "lesson-1"))
                .await,
            Err(Error::SessionClosed)
        ));

        // Tombstones expire after their TTL
        orch.reap_idle(Utc::now() + TimeDelta::days(3)).await;
        assert_eq!(orch.status().closed_sessions, 0);
    }

    #[tokio::test]
    async fn test_rejects_invalid_handle() {
        let (orch, _) = orchestrator();
        let result = orch
            .analyze_interaction(
                &SessionIdentity::Handle("student@example.com".to_string()),
                Interaction::new(Utc::now(), ActionType::Read, 900, "lesson-1"),
            )
            .await;
        assert!(matches!(result, Err(Error::InvalidHandle(_))));
        assert_eq!(orch.status().active_sessions, 0);
    }

    #[tokio::test]
    async fn test_run_stream_in_order() {
        let (orch, logger) = orchestrator();
        let (in_tx, in_rx) = mpsc::channel(8);
        let (out_tx, mut out_rx) = mpsc::channel(8);

        for latency in [1000u64, 9000, 2000] {
            in_tx
                .send(Interaction::new(Utc::now(), ActionType::Clarify, latency, "lesson-1"))
                .await
                .unwrap();
        }
        drop(in_tx);

        let handled = orch.run_stream(handle("stream"), in_rx, out_tx).await;
        assert_eq!(handled, 3);

        let mut decisions = Vec::new();
        while let Some(result) = out_rx.recv().await {
            decisions.push(result.unwrap());
        }
        assert_eq!(decisions.len(), 3);
        assert!(decisions[0].is_none());
        assert!(decisions[1].is_none());

        orch.sync_audit().await;
        assert_eq!(logger.count().unwrap(), 3);
    }

    #[tokio::test]
    async fn test_close_without_live_slot_still_rejects() {
        let (orch, _) = orchestrator();
        let id = handle("never-seen");
        assert!(!orch.close_session(&id).await.unwrap());

        let result = orch
            .analyze_interaction(&id, Interaction::new(Utc::now(), ActionType::Read, 900, "lesson-1"))
            .await;
        assert!(matches!(result, Err(Error::SessionClosed)));
        assert_eq!(orch.status().active_sessions, 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_close_racing_analysis_leaves_no_session() {
        let (orch, _) = orchestrator();
        let orch = Arc::new(orch);
        let id = handle("race");

        let mut tasks = Vec::new();
        for _ in 0..32 {
            let orch = Arc::clone(&orch);
            let id = id.clone();
            tasks.push(tokio::spawn(async move {
                orch.analyze_interaction(&id, Interaction::new(Utc::now(), ActionType::Ask, 700, "lesson-1"))
                    .await
            }));
        }
        orch.close_session(&id).await.unwrap();

        for task in tasks {
            match task.await.unwrap() {
                Ok(_) | Err(Error::SessionClosed) => {}
                Err(e) => panic!("unexpected error {}", e),
            }
        }
        assert_eq!(orch.status().active_sessions, 0);
        let fp = orch.anonymizer().resolve(&id, Utc::now()).unwrap();
        assert_eq!(orch.session_state(&fp).await, Some(SessionState::Closed));
    }

    #[tokio::test]
    async fn test_rejects_far_future_timestamp() {
        let (orch, _) = orchestrator();
        let far = DateTime::<Utc>::MAX_UTC - TimeDelta::minutes(1);
        let result = orch
            .analyze_interaction(&handle("future"), Interaction::new(far, ActionType::Error, 900, "lesson-1"))
            .await;

        assert!(matches!(result, Err(Error::InvalidTimestamp(_))));
        assert_eq!(orch.status().active_sessions, 0);
        assert_eq!(orch.status().open_buckets, 0);
        assert!(orch.flush_due(Utc::now()).is_empty());
    }
}
