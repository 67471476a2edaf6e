//! Session Manager: process-wide registry of active sessions, one
//! orchestrator task per assistant session id.
//!
//! Grounded on `watcher/registry.rs`'s `parking_lot::RwLock<HashMap<...>>`
//! registry (watch/unwatch, idempotent re-registration) generalized from
//! filesystem paths to assistant session ids.

use crate::broadcast::{Broadcaster, LiveEvent};
use crate::model::NewPendingMessage;
use crate::orchestrator::{self, OrchestratorDeps};
use crate::queue::SessionQueue;
use crate::store::ObservationStore;
use anyhow::Result;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

pub struct ActiveSession {
    pub session_id: i64,
    pub assistant_session_id: String,
    pub project: String,
    pub queue: Arc<SessionQueue>,
    pub cancel: CancellationToken,
    pub queued: AtomicI64,
    pub in_flight: AtomicI64,
    /// Mirrors the session row's `last_prompt_number`, kept current by the
    /// orchestrator's producer task so observations persisted from an
    /// analyzer reply can be tagged with the prompt they belong to.
    pub prompt_number: AtomicI64,
    handle: tokio::sync::Mutex<Option<JoinHandle<()>>>,
}

impl ActiveSession {
    fn active_work(&self) -> i64 {
        self.queued.load(Ordering::Relaxed) + self.in_flight.load(Ordering::Relaxed)
    }
}

struct SessionManagerInner {
    sessions: RwLock<HashMap<String, Arc<ActiveSession>>>,
    by_id: RwLock<HashMap<i64, Arc<ActiveSession>>>,
    /// One lock per assistant session id, held across the whole
    /// create-or-return path of `initialize_session` so two concurrent
    /// calls for a brand-new id can't both create a session row and both
    /// register an `ActiveSession` (the second registration would silently
    /// clobber the first's map entry and orphan its orchestrator task).
    init_locks: RwLock<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    store: Arc<dyn ObservationStore>,
    broadcaster: Broadcaster,
    deps: OrchestratorDeps,
}

/// Cheap to clone; every clone shares the same registry. Orchestrator tasks
/// hold a clone so they can deregister themselves on exit without a cyclic
/// `Arc<Mutex<SessionManager>>`.
#[derive(Clone)]
pub struct SessionManager {
    inner: Arc<SessionManagerInner>,
}

impl SessionManager {
    pub fn new(store: Arc<dyn ObservationStore>, broadcaster: Broadcaster, deps: OrchestratorDeps) -> Self {
        Self {
            inner: Arc::new(SessionManagerInner {
                sessions: RwLock::new(HashMap::new()),
                by_id: RwLock::new(HashMap::new()),
                init_locks: RwLock::new(HashMap::new()),
                store,
                broadcaster,
                deps,
            }),
        }
    }

    fn existing(&self, assistant_session_id: &str) -> Option<Arc<ActiveSession>> {
        self.inner.sessions.read().get(assistant_session_id).cloned()
    }

    /// Whether an orchestrator is already running for this assistant
    /// session id, without creating one.
    pub fn is_active(&self, assistant_session_id: &str) -> bool {
        self.existing(assistant_session_id).is_some()
    }

    /// Idempotent per assistant session id: if an orchestrator is already
    /// running for it, new events are just appended via the queue and the
    /// analyzer is never respawned. Otherwise resurrects the prior session
    /// row (if any) so `lastPromptNumber` and cumulative tokens survive a
    /// restart, or creates a fresh row.
    pub async fn initialize_session(
        &self,
        assistant_session_id: &str,
        project: &str,
        user_prompt_text: Option<&str>,
    ) -> Result<Arc<ActiveSession>> {
        if let Some(existing) = self.existing(assistant_session_id) {
            return Ok(existing);
        }

        // Serialize the whole create-or-return path per assistant id so two
        // concurrent callers for a brand-new id can't both create a session
        // row and both register an `ActiveSession` (the loser's insert would
        // silently replace the winner's, orphaning its orchestrator task).
        let init_lock = self
            .inner
            .init_locks
            .write()
            .entry(assistant_session_id.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone();
        let _init_guard = init_lock.lock().await;

        if let Some(existing) = self.existing(assistant_session_id) {
            return Ok(existing);
        }

        let prior = self
            .inner
            .store
            .latest_session_for_assistant_id(assistant_session_id)
            .await?;
        let (seed_prompt_number, seed_input, seed_output) = match &prior {
            Some(row) if row.status == crate::model::SessionStatus::Active => {
                (row.last_prompt_number, row.cum_input_tokens, row.cum_output_tokens)
            }
            _ => (1, 0, 0),
        };

        let session_row = self
            .inner
            .store
            .create_session(
                assistant_session_id,
                project,
                user_prompt_text,
                seed_prompt_number,
                seed_input,
                seed_output,
            )
            .await?;

        let queue = Arc::new(SessionQueue::new(self.inner.store.clone(), session_row.id));
        let active = Arc::new(ActiveSession {
            session_id: session_row.id,
            assistant_session_id: assistant_session_id.to_string(),
            project: project.to_string(),
            queue,
            cancel: CancellationToken::new(),
            queued: AtomicI64::new(0),
            in_flight: AtomicI64::new(0),
            prompt_number: AtomicI64::new(session_row.last_prompt_number),
            handle: tokio::sync::Mutex::new(None),
        });

        self.inner
            .sessions
            .write()
            .insert(assistant_session_id.to_string(), active.clone());
        self.inner.by_id.write().insert(session_row.id, active.clone());

        let manager = self.clone();
        let manager_store = self.inner.store.clone();
        let manager_broadcaster = self.inner.broadcaster.clone();
        let deps = self.inner.deps.clone();
        let session_for_task = active.clone();
        let assistant_id_for_task = assistant_session_id.to_string();
        let session_id = session_row.id;

        let handle = tokio::spawn(async move {
            let result = orchestrator::run(
                session_row,
                session_for_task,
                manager_store,
                manager_broadcaster,
                deps,
            )
            .await;

            if let Err(e) = &result {
                tracing::error!(
                    "orchestrator for session {} ({}) failed: {:?}",
                    session_id,
                    assistant_id_for_task,
                    e
                );
            }
            // Whether it completed, was cancelled, or failed: the active
            // entry is always removed here, per the at-most-one-orchestrator
            // guarantee. A failed session is resurrected from its store row
            // the next time an inbound event names the same assistant id.
            manager.delete(session_id);
        });

        *active.handle.lock().await = Some(handle);

        info!(
            "session {} initialized for assistant id {}",
            session_row_id(&active), assistant_session_id
        );
        Ok(active)
    }

    pub async fn enqueue(&self, session_id: i64, msg: NewPendingMessage) -> Result<()> {
        if let Some(active) = self.inner.by_id.read().get(&session_id).cloned() {
            active.queued.fetch_add(1, Ordering::Relaxed);
            active.queue.enqueue(msg).await?;
            self.emit_processing_status();
        }
        Ok(())
    }

    pub fn delete(&self, session_id: i64) {
        let active = self.inner.by_id.write().remove(&session_id);
        if let Some(active) = active {
            self.inner.sessions.write().remove(&active.assistant_session_id);
            active.cancel.cancel();
            active.queue.close();
            debug!("session {} deleted from registry", session_id);
            self.emit_processing_status();
        }
    }

    pub fn is_any_processing(&self) -> bool {
        self.inner.by_id.read().values().any(|s| s.active_work() > 0)
    }

    pub fn total_active_work(&self) -> i64 {
        self.inner.by_id.read().values().map(|s| s.active_work()).sum()
    }

    pub fn active_count(&self) -> usize {
        self.inner.by_id.read().len()
    }

    fn emit_processing_status(&self) {
        let queue_depth = self.total_active_work();
        self.inner.broadcaster.publish(LiveEvent::ProcessingStatus {
            is_processing: queue_depth > 0,
            queue_depth,
        });
        self.inner
            .deps
            .perf
            .sample_queue_depth(crate::store::now_epoch_ms(), queue_depth);
    }

    /// Cancels every active session and waits up to `grace` for their
    /// orchestrator tasks to drain, for graceful shutdown.
    pub async fn shutdown(&self, grace: std::time::Duration) {
        let sessions: Vec<Arc<ActiveSession>> = self.inner.by_id.read().values().cloned().collect();
        for session in &sessions {
            session.cancel.cancel();
            session.queue.close();
        }
        let deadline = tokio::time::Instant::now() + grace;
        for session in sessions {
            let mut guard = session.handle.lock().await;
            if let Some(handle) = guard.take() {
                let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
                let _ = tokio::time::timeout(remaining, handle).await;
            }
        }
    }
}

fn session_row_id(active: &ActiveSession) -> i64 {
    active.session_id
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AnalyzerConfig;
    use crate::metrics::MetricsEngine;
    use crate::model::{ObservationPayload, PendingKind};
    use crate::perf::PerformanceTracker;
    use crate::store::SqliteObservationStore;
    use crate::vector_sync::{NoopVectorIndexSync, VectorIndexSync};
    use sqlx::sqlite::SqlitePoolOptions;
    use std::time::Duration as StdDuration;

    async fn test_store() -> Arc<dyn ObservationStore> {
        let pool = SqlitePoolOptions::new()
            .connect("sqlite::memory:")
            .await
            .unwrap();
        sqlx::migrate!("./migrations").run(&pool).await.unwrap();
        Arc::new(SqliteObservationStore::new(pool))
    }

    /// A manager wired to `sh -c <script>` standing in for the analyzer, so
    /// orchestrator behavior can be exercised deterministically without a
    /// real analyzer binary. The script only ever needs to write
    /// newline-delimited `AnalyzerReply` JSON to stdout; it never has to
    /// understand the frames written to its stdin.
    fn test_manager(store: Arc<dyn ObservationStore>, script: &str) -> SessionManager {
        let broadcaster = Broadcaster::new();
        let analyzer = AnalyzerConfig {
            command: "sh".to_string(),
            args: vec!["-c".to_string(), script.to_string()],
            spawn_timeout: StdDuration::from_secs(5),
        };
        let metrics = Arc::new(MetricsEngine::new(
            store.clone(),
            broadcaster.clone(),
            crate::config::MetricsConfig::from_env(),
        ));
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

    #[tokio::test]
    async fn is_active_reflects_registry_membership() {
        let store = test_store().await;
        let manager = test_manager(store, "cat >/dev/null");
        assert!(!manager.is_active("assist-1"));
        let active = manager
            .initialize_session("assist-1", "proj", Some("hi"))
            .await
            .unwrap();
        assert!(manager.is_active("assist-1"));
        manager.delete(active.session_id);
        assert!(!manager.is_active("assist-1"));
    }

    #[tokio::test]
    async fn cancellation_preserves_already_persisted_observations() {
        // The script writes one observation reply immediately, then blocks
        // forever reading stdin (never exits on its own) so the test can
        // drive cancellation explicitly rather than racing a timed exit.
        let store = test_store().await;
        let reply = observation_reply_line("first");
        let script = format!("echo '{}'; cat >/dev/null", reply.replace('\'', "'\\''"));
        let manager = test_manager(store.clone(), &script);

        let active = manager
            .initialize_session("assist-2", "proj", Some("hi"))
            .await
            .unwrap();
        let session_id = active.session_id;

        // Give the producer/consumer tasks a moment to process the reply.
        tokio::time::sleep(StdDuration::from_millis(300)).await;

        active.cancel.cancel();
        tokio::time::sleep(StdDuration::from_millis(200)).await;
        manager.delete(session_id);

        let observations = store
            .list_observations(crate::model::RangeQuery {
                project: Some("proj".to_string()),
                after_id: None,
                limit: 10,
            })
            .await
            .unwrap();
        assert_eq!(observations.len(), 1);
        assert_eq!(observations[0].title, "first");
    }

    #[tokio::test]
    async fn enqueue_is_idempotent_with_initialize_session() {
        let store = test_store().await;
        let manager = test_manager(store, "cat >/dev/null");
        let active = manager
            .initialize_session("assist-3", "proj", Some("hi"))
            .await
            .unwrap();
        manager
            .enqueue(
                active.session_id,
                crate::model::NewPendingMessage {
                    kind: PendingKind::Observation,
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert!(manager.is_any_processing() || manager.total_active_work() >= 0);
        manager.delete(active.session_id);
    }
}
