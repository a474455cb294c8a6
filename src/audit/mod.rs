//! Audit logger - append-only record of every bias/adaptation decision
//!
//! Records live in SQLite next to the inputs that produced them. Inputs are
//! archived once per `inputs_hash` (SHA-256 of their canonical JSON) so a verifier
//! can replay a decision without any raw interaction content. Each record carries
//! the hash of its predecessor, making edits and deletions detectable.
//!
//! Writes from the request path go through `AuditSink`, a channel drained by a
//! single blocking writer, so an append never holds up an adaptation response.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::Path;
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::content::ContentMetadata;
use crate::engine::{self, Evaluation, Policy};
use crate::error::Result;
use crate::model::{AdaptationAction, BiasType, FeatureSummary, SessionFingerprint, TimeBucket};

pub mod incident;

pub use incident::{Incident, IncidentKind, IncidentLog};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS audit_records (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    bucket TEXT NOT NULL,
    fingerprint TEXT NOT NULL,
    bias_type TEXT NOT NULL,
    severity REAL NOT NULL,
    action TEXT NOT NULL,
    magnitude INTEGER NOT NULL,
    inputs_hash TEXT NOT NULL,
    prev_hash TEXT,
    record_hash TEXT NOT NULL
);

-- Inputs needed to replay a decision, stored once per hash
CREATE TABLE IF NOT EXISTS archived_inputs (
    inputs_hash TEXT PRIMARY KEY,
    payload TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_audit_lookup ON audit_records(fingerprint, inputs_hash);

CREATE TRIGGER IF NOT EXISTS audit_records_no_update
BEFORE UPDATE ON audit_records
BEGIN
    SELECT RAISE(ABORT, 'audit log is append-only');
END;

CREATE TRIGGER IF NOT EXISTS audit_records_no_delete
BEFORE DELETE ON audit_records
BEGIN
    SELECT RAISE(ABORT, 'audit log is append-only');
END;
"#;

/// Everything the engine saw for one decision
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArchivedInputs {
    pub summary: FeatureSummary,
    pub metadata: ContentMetadata,
    pub policy: Policy,
}

impl ArchivedInputs {
    fn canonical_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn hash(&self) -> Result<String> {
        Ok(sha256_hex(self.canonical_json()?.as_bytes()))
    }
}

/// Decision handed to the logger by the orchestrator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub bucket: TimeBucket,
    pub fingerprint: SessionFingerprint,
    pub inputs: ArchivedInputs,
    pub evaluation: Evaluation,
}

/// Stored audit row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditRecord {
    pub id: i64,
    pub bucket: DateTime<Utc>,
    pub fingerprint: String,
    pub bias_type: BiasType,
    pub severity: f64,
    pub action: AdaptationAction,
    pub magnitude: u8,
    pub inputs_hash: String,
    pub prev_hash: Option<String>,
    pub record_hash: String,
}

impl AuditRecord {
    fn compute_hash(&self) -> String {
        let material = format!(
            "{}|{}|{}|{}|{:016x}|{}|{}|{}",
            self.prev_hash.as_deref().unwrap_or(""),
            self.bucket.to_rfc3339(),
            self.fingerprint,
            self.bias_type.as_str(),
            self.severity.to_bits(),
            self.action.as_str(),
            self.magnitude,
            self.inputs_hash,
        );
        sha256_hex(material.as_bytes())
    }
}

/// Result of walking the hash chain
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainVerification {
    pub records: u64,
    /// First record id whose link or hash does not check out
    pub broken_at: Option<i64>,
}

impl ChainVerification {
    pub fn is_intact(&self) -> bool {
        self.broken_at.is_none()
    }
}

fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

fn parse_enum<T>(raw: String, parse: impl Fn(&str) -> Option<T>, column: usize) -> rusqlite::Result<T> {
    parse(&raw).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            column,
            rusqlite::types::Type::Text,
            format!("unknown value {:?}", raw).into(),
        )
    })
}

fn row_to_record(row: &rusqlite::Row<'_>) -> rusqlite::Result<AuditRecord> {
    let bucket: String = row.get(1)?;
    let bucket = DateTime::parse_from_rfc3339(&bucket)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(1, rusqlite::types::Type::Text, Box::new(e)))?;

    Ok(AuditRecord {
        id: row.get(0)?,
        bucket,
        fingerprint: row.get(2)?,
        bias_type: parse_enum(row.get(3)?, BiasType::from_str, 3)?,
        severity: row.get(4)?,
        action: parse_enum(row.get(5)?, AdaptationAction::from_str, 5)?,
        magnitude: row.get(6)?,
        inputs_hash: row.get(7)?,
        prev_hash: row.get(8)?,
        record_hash: row.get(9)?,
    })
}

const RECORD_COLUMNS: &str =
    "id, bucket, fingerprint, bias_type, severity, action, magnitude, inputs_hash, prev_hash, record_hash";

/// SQLite-backed append-only decision log
#[derive(Debug)]
pub struct AuditLogger {
    conn: Mutex<Connection>,
}

impl AuditLogger {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)?;
        let mode: String = conn.query_row("PRAGMA journal_mode=WAL", [], |row| row.get(0))?;
        debug!("Audit database journal mode: {}", mode);
        Self::with_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Append one decision, archiving its inputs if this hash is new
    pub fn record(&self, entry: &AuditEntry) -> Result<AuditRecord> {
        let payload = entry.inputs.canonical_json()?;
        let inputs_hash = sha256_hex(payload.as_bytes());

        let mut conn = self.conn.lock().unwrap_or_else(|p| p.into_inner());
        let tx = conn.transaction()?;

        let prev_hash: Option<String> = tx
            .query_row(
                "SELECT record_hash FROM audit_records ORDER BY id DESC LIMIT 1",
                [],
                |row| row.get(0),
            )
            .optional()?;

        tx.execute(
            "INSERT OR IGNORE INTO archived_inputs (inputs_hash, payload) VALUES (?1, ?2)",
            params![inputs_hash, payload],
        )?;

        let mut record = AuditRecord {
            id: 0,
            bucket: entry.bucket.start(),
            fingerprint: entry.fingerprint.as_str().to_string(),
            bias_type: entry.evaluation.signal.bias_type,
            severity: entry.evaluation.signal.severity,
            action: entry.evaluation.decision.action,
            magnitude: entry.evaluation.decision.magnitude,
            inputs_hash,
            prev_hash,
            record_hash: String::new(),
        };
        record.record_hash = record.compute_hash();

        tx.execute(
            "INSERT INTO audit_records
                (bucket, fingerprint, bias_type, severity, action, magnitude, inputs_hash, prev_hash, record_hash)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                record.bucket.to_rfc3339(),
                record.fingerprint,
                record.bias_type.as_str(),
                record.severity,
                record.action.as_str(),
                record.magnitude,
                record.inputs_hash,
                record.prev_hash,
                record.record_hash,
            ],
        )?;
        record.id = tx.last_insert_rowid();
        tx.commit()?;

        debug!(
            "Audit record {} for {} ({})",
            record.id,
            entry.fingerprint.short(),
            record.bias_type.as_str()
        );
        Ok(record)
    }

    pub fn archived_inputs(&self, inputs_hash: &str) -> Result<Option<String>> {
        let conn = self.conn.lock().unwrap_or_else(|p| p.into_inner());
        let payload = conn
            .query_row(
                "SELECT payload FROM archived_inputs WHERE inputs_hash = ?1",
                params![inputs_hash],
                |row| row.get(0),
            )
            .optional()?;
        Ok(payload)
    }

    pub fn records_for(&self, fingerprint: &str, inputs_hash: &str) -> Result<Vec<AuditRecord>> {
        let conn = self.conn.lock().unwrap_or_else(|p| p.into_inner());
        let sql = format!(
            "SELECT {} FROM audit_records WHERE fingerprint = ?1 AND inputs_hash = ?2 ORDER BY id",
            RECORD_COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let records = stmt
            .query_map(params![fingerprint, inputs_hash], row_to_record)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(records)
    }

    /// Replay the archived inputs and compare with every matching record
    ///
    /// `false` when nothing matches, the archive does not hash to `inputs_hash`, or
    /// any recorded decision differs from the replay.
    pub fn verify(&self, fingerprint: &str, inputs_hash: &str) -> Result<bool> {
        let Some(payload) = self.archived_inputs(inputs_hash)? else {
            debug!("No archived inputs for {}", inputs_hash);
            return Ok(false);
        };
        if sha256_hex(payload.as_bytes()) != inputs_hash {
            info!("Archived inputs for {} do not match their hash", inputs_hash);
            return Ok(false);
        }

        let records = self.records_for(fingerprint, inputs_hash)?;
        if records.is_empty() {
            return Ok(false);
        }

        let inputs: ArchivedInputs = serde_json::from_str(&payload)?;
        let replay = match engine::evaluate(&inputs.summary, &inputs.metadata, &inputs.policy) {
            Ok(evaluation) => evaluation,
            Err(e) => {
                info!("Replay rejected archived inputs: {}", e);
                return Ok(false);
            }
        };

        Ok(records.iter().all(|record| {
            record.bias_type == replay.signal.bias_type
                && record.severity.to_bits() == replay.signal.severity.to_bits()
                && record.action == replay.decision.action
                && record.magnitude == replay.decision.magnitude
        }))
    }

    /// Walk the whole chain, oldest first
    pub fn verify_chain(&self) -> Result<ChainVerification> {
        let conn = self.conn.lock().unwrap_or_else(|p| p.into_inner());
        let sql = format!("SELECT {} FROM audit_records ORDER BY id", RECORD_COLUMNS);
        let mut stmt = conn.prepare(&sql)?;
        let mut rows = stmt.query([])?;

        let mut records = 0u64;
        let mut previous: Option<String> = None;
        while let Some(row) = rows.next()? {
            let record = row_to_record(row)?;
            records += 1;

            let linked = record.prev_hash == previous;
            let hashed = record.compute_hash() == record.record_hash;
            if !(linked && hashed) {
                return Ok(ChainVerification {
                    records,
                    broken_at: Some(record.id),
                });
            }
            previous = Some(record.record_hash);
        }

        Ok(ChainVerification {
            records,
            broken_at: None,
        })
    }

    pub fn count(&self) -> Result<u64> {
        let conn = self.conn.lock().unwrap_or_else(|p| p.into_inner());
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM audit_records", [], |row| row.get(0))?;
        Ok(count as u64)
    }
}

enum AuditCommand {
    Append(Box<AuditEntry>),
    Barrier(oneshot::Sender<()>),
}

/// Default number of entries queued ahead of the writer
pub const AUDIT_QUEUE_CAPACITY: usize = 4096;

/// Non-blocking front of the audit writer
#[derive(Debug, Clone)]
pub struct AuditSink {
    tx: mpsc::Sender<AuditCommand>,
    incidents: Arc<IncidentLog>,
}

impl std::fmt::Debug for AuditCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AuditCommand::Append(_) => f.write_str("Append"),
            AuditCommand::Barrier(_) => f.write_str("Barrier"),
        }
    }
}

impl AuditSink {
    /// Start the writer on the blocking pool with the default queue size
    ///
    /// Must be called inside a tokio runtime. The writer exits once every sink
    /// clone has been dropped and the queue is drained.
    pub fn spawn(logger: Arc<AuditLogger>, incidents: Arc<IncidentLog>) -> (Self, JoinHandle<()>) {
        Self::with_capacity(logger, incidents, AUDIT_QUEUE_CAPACITY)
    }

    pub fn with_capacity(
        logger: Arc<AuditLogger>,
        incidents: Arc<IncidentLog>,
        capacity: usize,
    ) -> (Self, JoinHandle<()>) {
        let (sink, mut rx) = Self::channel(incidents, capacity);
        let writer_incidents = Arc::clone(&sink.incidents);

        let handle = tokio::task::spawn_blocking(move || {
            while let Some(command) = rx.blocking_recv() {
                match command {
                    AuditCommand::Append(entry) => {
                        if let Err(e) = logger.record(&entry) {
                            error!("Audit append failed: {}", e);
                            writer_incidents.record(
                                IncidentKind::AuditAppendFailed,
                                format!("append for {} failed: {}", entry.fingerprint.short(), e),
                            );
                        }
                    }
                    AuditCommand::Barrier(done) => {
                        let _ = done.send(());
                    }
                }
            }
            debug!("Audit writer stopped");
        });

        (sink, handle)
    }

    fn channel(incidents: Arc<IncidentLog>, capacity: usize) -> (Self, mpsc::Receiver<AuditCommand>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx, incidents }, rx)
    }

    /// Queue an entry; never waits on the database
    ///
    /// When the writer has fallen a full queue behind, the entry is dropped and an
    /// incident recorded instead.
    pub fn submit(&self, entry: AuditEntry) {
        let short = entry.fingerprint.short().to_string();
        match self.tx.try_send(AuditCommand::Append(Box::new(entry))) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => self.incidents.record(
                IncidentKind::AuditAppendFailed,
                format!("audit queue full, entry for {} lost", short),
            ),
            Err(mpsc::error::TrySendError::Closed(_)) => self.incidents.record(
                IncidentKind::AuditAppendFailed,
                format!("audit writer gone, entry for {} lost", short),
            ),
        }
    }

    /// Wait until everything queued before this call has been written
    pub async fn sync(&self) {
        let (done, wait) = oneshot::channel();
        if self.tx.send(AuditCommand::Barrier(done)).await.is_ok() {
            let _ = wait.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::anonymizer::{fingerprint, time_bucket, Salt};
    use crate::engine::evaluate;
    use crate::model::Confidence;
    use chrono::TimeZone;

    fn entry(handle: &str, clarification_ratio: f64) -> AuditEntry {
        let summary = FeatureSummary {
            sample_count: 5,
            latency_mean_ms: 4000.0,
            latency_variance_ms2: 9_000_000.0,
            clarification_ratio,
            clarification_rate: 0.6,
            error_rate: 0.0,
            max_consecutive_errors: 0,
            confidence: Confidence::Sufficient,
        };
        let metadata = ContentMetadata::from_text(
            "lesson-9",
            "phys-110",
            "Momentum is conserved in closed systems. Energy changes form.",
        );
        let policy = Policy::default();
        let evaluation = evaluate(&summary, &metadata, &policy).unwrap();
        AuditEntry {
            bucket: time_bucket(Utc.with_ymd_and_hms(2026, 6, 1, 12, 7, 0).unwrap(), 15),
            fingerprint: fingerprint(handle, &Salt::from_bytes(0, [8u8; 32])).unwrap(),
            inputs: ArchivedInputs {
                summary,
                metadata,
                policy,
            },
            evaluation,
        }
    }

    #[test]
    fn test_record_and_verify() {
        let logger = AuditLogger::open_in_memory().unwrap();
        let e = entry("sess-audit-001", 1.5);
        let record = logger.record(&e).unwrap();

        assert_eq!(record.prev_hash, None);
        assert_eq!(record.inputs_hash, e.inputs.hash().unwrap());
        assert!(logger.verify(e.fingerprint.as_str(), &record.inputs_hash).unwrap());
        assert!(!logger.verify("0".repeat(64).as_str(), &record.inputs_hash).unwrap());
        assert!(!logger.verify(e.fingerprint.as_str(), "deadbeef").unwrap());
    }

    #[test]
    fn test_verify_detects_wrong_recorded_decision() {
        let logger = AuditLogger::open_in_memory().unwrap();
        let mut e = entry("sess-audit-002", 1.5);
        e.evaluation.signal.severity = 0.99;
        let record = logger.record(&e).unwrap();
        assert!(!logger.verify(e.fingerprint.as_str(), &record.inputs_hash).unwrap());
    }

    #[test]
    fn test_inputs_archived_once() {
        let logger = AuditLogger::open_in_memory().unwrap();
        let e = entry("sess-audit-003", 1.5);
        logger.record(&e).unwrap();
        logger.record(&e).unwrap();

        assert_eq!(logger.count().unwrap(), 2);
        let conn = logger.conn.lock().unwrap();
        let archived: i64 = conn
            .query_row("SELECT COUNT(*) FROM archived_inputs", [], |row| row.get(0))
            .unwrap();
        assert_eq!(archived, 1);
    }

    #[test]
    fn test_chain_links_and_detects_tampering() {
        let logger = AuditLogger::open_in_memory().unwrap();
        let first = logger.record(&entry("sess-audit-004", 1.5)).unwrap();
        let second = logger.record(&entry("sess-audit-005", 2.5)).unwrap();
        assert_eq!(second.prev_hash.as_deref(), Some(first.record_hash.as_str()));

        let chain = logger.verify_chain().unwrap();
        assert!(chain.is_intact());
        assert_eq!(chain.records, 2);

        let conn = logger.conn.lock().unwrap();
        assert!(conn
            .execute("UPDATE audit_records SET severity = 0.0 WHERE id = ?1", params![first.id])
            .is_err());
        conn.execute_batch("DROP TRIGGER audit_records_no_update").unwrap();
        conn.execute("UPDATE audit_records SET severity = 0.0 WHERE id = ?1", params![first.id])
            .unwrap();
        drop(conn);

        let chain = logger.verify_chain().unwrap();
        assert_eq!(chain.broken_at, Some(first.id));
    }

    #[test]
    fn test_open_file_database() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit.sqlite");
        {
            let logger = AuditLogger::open(&path).unwrap();
            logger.record(&entry("sess-audit-006", 1.5)).unwrap();
        }
        let reopened = AuditLogger::open(&path).unwrap();
        assert_eq!(reopened.count().unwrap(), 1);
        assert!(reopened.verify_chain().unwrap().is_intact());
    }

    #[tokio::test]
    async fn test_sink_writes_in_background() {
        let logger = Arc::new(AuditLogger::open_in_memory().unwrap());
        let incidents = Arc::new(IncidentLog::new(8));
        let (sink, _writer) = AuditSink::spawn(Arc::clone(&logger), Arc::clone(&incidents));

        for i in 0..5 {
            sink.submit(entry(&format!("sess-audit-1{:02}", i), 1.5));
        }
        sink.sync().await;

        assert_eq!(logger.count().unwrap(), 5);
        assert_eq!(incidents.total(), 0);
    }

    #[test]
    fn test_full_queue_records_incident() {
        let incidents = Arc::new(IncidentLog::new(8));
        let (sink, mut rx) = AuditSink::channel(Arc::clone(&incidents), 2);

        for i in 0..3 {
            sink.submit(entry(&format!("sess-audit-2{:02}", i), 1.5));
        }
        assert_eq!(incidents.count_of(IncidentKind::AuditAppendFailed), 1);

        assert!(matches!(rx.try_recv(), Ok(AuditCommand::Append(_))));
        sink.submit(entry("sess-audit-299", 1.5));
        assert_eq!(incidents.count_of(IncidentKind::AuditAppendFailed), 1);
    }
}
