//! Socket round trips against a daemon bound in a temporary directory

use std::path::PathBuf;

use ananya::daemon::{self, Daemon, DaemonResponse, ServiceRequest};
use ananya::Config;
use chrono::Utc;
use serde_json::json;

async fn request(data_dir: PathBuf, request: serde_json::Value) -> DaemonResponse {
    let request: ServiceRequest = serde_json::from_value(request).unwrap();
    tokio::task::spawn_blocking(move || daemon::send_request(&data_dir, &request))
        .await
        .unwrap()
        .unwrap()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_daemon_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let data_dir = dir.path().to_path_buf();

    let daemon = Daemon::bind(&data_dir, Config::default()).await.unwrap();
    let server = tokio::spawn(daemon.run());

    let pong = request(data_dir.clone(), json!({"command": "ping"})).await;
    assert_eq!(pong.data, Some(json!("pong")));

    let registered = request(
        data_dir.clone(),
        json!({"command": "register-content", "args": {
            "content_ref": "lesson-7", "course_id": "phys-201",
            "text": "Force equals mass times acceleration. For example, pushing a cart."
        }}),
    )
    .await;
    assert!(registered.success);
    assert_eq!(registered.data.as_ref().unwrap()["has_examples"], json!(true));
    assert!(registered.data.as_ref().unwrap().get("text").is_none());

    let now = Utc::now().to_rfc3339();
    for latency in [1000, 9000, 2000] {
        let analyzed = request(
            data_dir.clone(),
            json!({"command": "analyze-interaction", "args": {
                "identity": {"handle": "sess-daemon-01"},
                "interaction": {"timestamp": now, "action_type": "clarify",
                                "response_latency_ms": latency, "content_ref": "lesson-7"}
            }}),
        )
        .await;
        assert!(analyzed.success, "{:?}", analyzed.error);
    }

    let rejected = request(
        data_dir.clone(),
        json!({"command": "analyze-interaction", "args": {
            "identity": {"handle": "someone@school.edu"},
            "interaction": {"timestamp": now, "action_type": "read",
                            "response_latency_ms": 400, "content_ref": "lesson-7"}
        }}),
    )
    .await;
    assert!(!rejected.success);
    assert!(rejected.error.unwrap().contains("Invalid session handle"));

    let overview = request(data_dir.clone(), json!({"command": "analytics/overview", "args": {}})).await;
    assert_eq!(overview.data, Some(json!([])));

    let status = request(data_dir.clone(), json!({"command": "status"})).await;
    assert_eq!(status.data.unwrap()["active_sessions"], json!(1));

    let stopped = request(data_dir.clone(), json!({"command": "shutdown"})).await;
    assert!(stopped.success);

    server.await.unwrap().unwrap();
    assert!(!daemon::socket_path(&data_dir).exists());
    assert!(!daemon::pid_path(&data_dir).exists());

    // Everything analyzed before shutdown reached the audit log
    let audit = ananya::AuditLogger::open(&data_dir.join(daemon::AUDIT_DB)).unwrap();
    assert_eq!(audit.count().unwrap(), 3);
    assert!(audit.verify_chain().unwrap().is_intact());
}
