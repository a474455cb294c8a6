//! Ananya service daemon
//!
//! Long-running process that owns the orchestrator and serves the analysis
//! boundary over a Unix socket.
//!
//! Architecture:
//! - tokio Unix socket server, one task per connection
//! - Background ticker flushing ended aggregation windows and reaping idle sessions
//! - Audit writes on a dedicated blocking writer
//!
//! Protocol:
//! - Request: JSON object with "command" and "args" fields, one per line
//! - Response: JSON object with "success" and "data" or "error" fields

use std::io::{BufRead, BufReader, Write};
use std::os::unix::net::UnixStream as StdUnixStream;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader as AsyncBufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::aggregator::Aggregator;
use crate::audit::{AuditLogger, AuditSink, IncidentLog};
use crate::config::Config;
use crate::content::InMemoryCatalog;
use crate::engine::BiasEngine;
use crate::error::Error;
use crate::orchestrator::Orchestrator;

pub mod protocol;

pub use protocol::{DaemonResponse, ServiceRequest};

/// Audit database file inside the data directory
pub const AUDIT_DB: &str = "audit.sqlite";

/// Socket path for daemon communication
pub fn socket_path(data_dir: &Path) -> PathBuf {
    data_dir.join("daemon.sock")
}

/// PID file path for daemon process tracking
pub fn pid_path(data_dir: &Path) -> PathBuf {
    data_dir.join("daemon.pid")
}

/// Everything a connection handler needs
pub struct ServiceState {
    pub orchestrator: Orchestrator,
    pub catalog: Arc<InMemoryCatalog>,
}

impl ServiceState {
    /// Wire the pipeline together; must run inside a tokio runtime
    pub fn build(config: Config, audit: Arc<AuditLogger>) -> Self {
        let incidents = Arc::new(IncidentLog::new(config.service.incident_capacity));
        let (sink, _writer) =
            AuditSink::with_capacity(audit, Arc::clone(&incidents), config.service.audit_queue_capacity);
        let catalog = Arc::new(InMemoryCatalog::new());

        let orchestrator = Orchestrator::new(
            config.clone(),
            Arc::new(BiasEngine::new(config.engine.clone())),
            catalog.clone(),
            Arc::new(Aggregator::new(config.aggregator.clone())),
            sink,
            incidents,
        );

        Self {
            orchestrator,
            catalog,
        }
    }

    /// Handle one request; the flag asks the server to stop
    pub async fn handle(&self, request: ServiceRequest) -> (DaemonResponse, bool) {
        let orch = &self.orchestrator;
        let response = match request {
            ServiceRequest::AnalyzeInteraction {
                identity,
                interaction,
            } => match orch.analyze_interaction(&identity, interaction).await {
                Ok(decision) => DaemonResponse::ok(decision),
                Err(e) => rejected(e),
            },
            ServiceRequest::DetectBias { summary, metadata } => {
                match orch.detect_bias(&summary, &metadata) {
                    Ok(signal) => DaemonResponse::ok(signal),
                    Err(e) => rejected(e),
                }
            }
            ServiceRequest::GenerateAdaptation {
                decision,
                base_content,
            } => DaemonResponse::ok(orch.generate_adaptation(&decision, &base_content)),
            ServiceRequest::AnalyticsOverview(query) => DaemonResponse::ok(orch.overview(&query)),
            ServiceRequest::AnalyticsBiasAlerts(query) => DaemonResponse::ok(orch.bias_alerts(&query)),
            ServiceRequest::RegisterContent {
                content_ref,
                course_id,
                text,
            } => DaemonResponse::ok(self.catalog.register(&content_ref, &course_id, &text)),
            ServiceRequest::CloseSession { identity } => match orch.close_session(&identity).await {
                Ok(existed) => DaemonResponse::ok(serde_json::json!({ "closed": existed })),
                Err(e) => rejected(e),
            },
            ServiceRequest::Status => DaemonResponse::ok(orch.status()),
            ServiceRequest::Ping => DaemonResponse::ok("pong"),
            ServiceRequest::Shutdown => {
                info!("Shutdown requested");
                return (DaemonResponse::ok("shutting down"), true);
            }
        };
        (response, false)
    }
}

/// Error response; faults on our side are logged, rejected input only traced
fn rejected(e: Error) -> DaemonResponse {
    if e.is_caller_fault() {
        debug!("Request rejected: {}", e);
    } else {
        error!("Request failed: {}", e);
    }
    DaemonResponse::err(e.to_string())
}

/// Bound daemon, ready to serve
pub struct Daemon {
    listener: UnixListener,
    state: Arc<ServiceState>,
    flush_interval: Duration,
    socket: PathBuf,
    pid_file: PathBuf,
}

impl Daemon {
    /// Open the audit log, build the pipeline and bind the socket
    pub async fn bind(data_dir: &Path, config: Config) -> Result<Self> {
        let socket = socket_path(data_dir);
        let pid_file = pid_path(data_dir);

        // Clean up stale socket
        if socket.exists() {
            std::fs::remove_file(&socket).context("Failed to remove stale socket")?;
        }

        std::fs::write(&pid_file, std::process::id().to_string()).context("Failed to write PID file")?;

        info!("Opening audit log...");
        let audit = AuditLogger::open(&data_dir.join(AUDIT_DB)).context("Failed to open audit database")?;

        let flush_interval = Duration::from_secs(config.service.flush_interval_secs.max(1));
        let state = Arc::new(ServiceState::build(config, Arc::new(audit)));

        info!("Starting daemon on {:?}", socket);
        let listener = UnixListener::bind(&socket).context("Failed to bind socket")?;

        Ok(Self {
            listener,
            state,
            flush_interval,
            socket,
            pid_file,
        })
    }

    pub fn state(&self) -> Arc<ServiceState> {
        Arc::clone(&self.state)
    }

    /// Serve until Ctrl-C or a `shutdown` request
    pub async fn run(self) -> Result<()> {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);

        let ticker_state = Arc::clone(&self.state);
        let mut ticker_shutdown = shutdown_rx.clone();
        let flush_interval = self.flush_interval;
        let ticker = tokio::spawn(async move {
            let mut interval = tokio::time::interval(flush_interval);
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        let now = Utc::now();
                        ticker_state.orchestrator.flush_due(now);
                        ticker_state.orchestrator.reap_idle(now).await;
                    }
                    _ = ticker_shutdown.changed() => break,
                }
            }
        });

        info!("Daemon ready, accepting connections");

        loop {
            tokio::select! {
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, _)) => {
                        let state = Arc::clone(&self.state);
                        let shutdown = shutdown_tx.clone();
                        tokio::spawn(async move {
                            handle_client(stream, state, shutdown).await;
                        });
                    }
                    Err(e) => error!("Accept error: {}", e),
                },
                _ = tokio::signal::ctrl_c() => {
                    info!("Received shutdown signal");
                    let _ = shutdown_tx.send(true);
                    break;
                }
                _ = shutdown_rx.changed() => break,
            }
        }

        info!("Daemon shutting down");
        let _ = ticker.await;
        self.state.orchestrator.sync_audit().await;
        let _ = std::fs::remove_file(&self.socket);
        let _ = std::fs::remove_file(&self.pid_file);

        Ok(())
    }
}

/// Start the daemon and block until it stops
pub async fn start_daemon(data_dir: &Path, config: Config) -> Result<()> {
    Daemon::bind(data_dir, config).await?.run().await
}

/// Handle a single client connection
async fn handle_client(stream: UnixStream, state: Arc<ServiceState>, shutdown: watch::Sender<bool>) {
    debug!("Client connected");
    let (reader, mut writer) = stream.into_split();
    let mut lines = AsyncBufReader::new(reader).lines();

    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                debug!("Client read error: {}", e);
                break;
            }
        };

        if line.trim().is_empty() {
            continue;
        }

        let (response, stop) = match serde_json::from_str::<ServiceRequest>(&line) {
            Ok(request) => {
                debug!("Request: {}", request.name());
                state.handle(request).await
            }
            Err(e) => (DaemonResponse::err(format!("Invalid request: {}", e)), false),
        };

        let mut response_json = match serde_json::to_string(&response) {
            Ok(json) => json,
            Err(e) => {
                error!("Failed to serialize response: {}", e);
                continue;
            }
        };
        response_json.push('\n');

        if let Err(e) = writer.write_all(response_json.as_bytes()).await {
            debug!("Failed to write response: {}", e);
            break;
        }

        if stop {
            let _ = shutdown.send(true);
            break;
        }
    }

    debug!("Client disconnected");
}

/// Check if daemon is running
pub fn is_running(data_dir: &Path) -> bool {
    let socket = socket_path(data_dir);
    if !socket.exists() {
        return false;
    }

    match send_request(data_dir, &ServiceRequest::Ping) {
        Ok(response) => response.success,
        Err(_) => false,
    }
}

/// Send a request to the daemon
pub fn send_request(data_dir: &Path, request: &ServiceRequest) -> Result<DaemonResponse> {
    let socket = socket_path(data_dir);

    let mut stream = StdUnixStream::connect(&socket).context("Failed to connect to daemon")?;

    stream
        .set_read_timeout(Some(Duration::from_secs(10)))
        .context("Failed to set timeout")?;

    let request_json = serde_json::to_string(request)?;
    writeln!(stream, "{}", request_json).context("Failed to send request")?;
    stream.flush().context("Failed to flush request")?;

    let mut reader = BufReader::new(stream);
    let mut response = String::new();
    reader
        .read_line(&mut response)
        .context("Failed to read response")?;

    serde_json::from_str(&response).context("Failed to parse response")
}

/// Stop the daemon
pub fn stop_daemon(data_dir: &Path) -> Result<()> {
    let socket = socket_path(data_dir);
    let pid_file = pid_path(data_dir);

    if !is_running(data_dir) {
        anyhow::bail!("Daemon is not running");
    }

    match send_request(data_dir, &ServiceRequest::Shutdown) {
        Ok(_) => info!("Shutdown command sent"),
        Err(e) => warn!("Failed to send shutdown: {}", e),
    }

    // Wait briefly for graceful shutdown
    std::thread::sleep(Duration::from_millis(500));

    // Force cleanup if needed
    if socket.exists() {
        std::fs::remove_file(&socket)?;
    }
    if pid_file.exists() {
        std::fs::remove_file(&pid_file)?;
    }

    Ok(())
}

/// Human-readable daemon status
pub fn daemon_status(data_dir: &Path) -> String {
    if !is_running(data_dir) {
        return "Not running".to_string();
    }

    match send_request(data_dir, &ServiceRequest::Status) {
        Ok(response) if response.success => match response.data {
            Some(data) => format!("Running | {}", data),
            None => "Running".to_string(),
        },
        Ok(response) => format!("Error: {}", response.error.unwrap_or_default()),
        Err(e) => format!("Connection error: {}", e),
    }
}
