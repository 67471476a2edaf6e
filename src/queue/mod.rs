//! Pending Message Queue: FIFO of tool-activity events awaiting analysis,
//! shared across every session. Grounded on `watcher/processor.rs`'s
//! batch-processing loop and `cache/session_state.rs`'s warmth/TTL checks,
//! but backed here by the same sqlite table the store owns rather than an
//! in-memory cache, since pending rows must survive a process restart.

use crate::model::{NewPendingMessage, PendingMessage};
use crate::store::ObservationStore;
use anyhow::Result;
use std::sync::Arc;
use tokio::sync::Notify;

/// Per-session wakeup so `iterate` can block without polling the database.
/// One `Notify` lives for the lifetime of a session; `enqueue` and
/// `close` both fire it.
pub struct SessionQueue {
    store: Arc<dyn ObservationStore>,
    session_id: i64,
    notify: Notify,
    closed: std::sync::atomic::AtomicBool,
}

impl SessionQueue {
    pub fn new(store: Arc<dyn ObservationStore>, session_id: i64) -> Self {
        Self {
            store,
            session_id,
            notify: Notify::new(),
            closed: std::sync::atomic::AtomicBool::new(false),
        }
    }

    pub async fn enqueue(&self, msg: NewPendingMessage) -> Result<i64> {
        let id = self.store.enqueue_pending(self.session_id, msg).await?;
        self.notify.notify_waiters();
        Ok(id)
    }

    pub async fn mark_processed(&self, id: i64) -> Result<()> {
        self.store.mark_pending_processed(id).await
    }

    pub async fn cleanup_processed(&self, keep_last: i64) -> Result<i64> {
        self.store.cleanup_processed(keep_last).await
    }

    /// Signals waiters that no more messages will arrive (session closed or
    /// cancelled), so a blocked `next_after` returns `None` instead of
    /// hanging forever.
    pub fn close(&self) {
        self.closed.store(true, std::sync::atomic::Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    fn is_closed(&self) -> bool {
        self.closed.load(std::sync::atomic::Ordering::SeqCst)
    }

    /// Blocks until at least one pending message with `id > after_id`
    /// exists, or the session is closed. Returns messages in id order.
    pub async fn next_after(&self, after_id: i64) -> Option<Vec<PendingMessage>> {
        loop {
            match self.store.pending_after(self.session_id, after_id).await {
                Ok(rows) if !rows.is_empty() => return Some(rows),
                Ok(_) => {
                    if self.is_closed() {
                        return None;
                    }
                    let notified = self.notify.notified();
                    // Re-check after registering the waiter so a concurrent
                    // enqueue between the query above and here isn't missed.
                    match self.store.pending_after(self.session_id, after_id).await {
                        Ok(rows) if !rows.is_empty() => return Some(rows),
                        _ => {
                            if self.is_closed() {
                                return None;
                            }
                            notified.await;
                        }
                    }
                }
                Err(e) => {
                    tracing::error!("pending_after query failed: {:?}", e);
                    return None;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::SqliteObservationStore;
    use sqlx::sqlite::SqlitePoolOptions;

    async fn queue() -> (SessionQueue, i64) {
        let pool = SqlitePoolOptions::new()
            .connect("sqlite::memory:")
            .await
            .unwrap();
        sqlx::migrate!("./migrations").run(&pool).await.unwrap();
        let store: Arc<dyn ObservationStore> = Arc::new(SqliteObservationStore::new(pool));
        let session = store
            .create_session("assist-1", "proj", None, 1, 0, 0)
            .await
            .unwrap();
        (SessionQueue::new(store, session.id), session.id)
    }

    #[tokio::test]
    async fn next_after_returns_immediately_when_already_pending() {
        let (q, _session_id) = queue().await;
        q.enqueue(NewPendingMessage::default()).await.unwrap();
        let rows = q.next_after(0).await.unwrap();
        assert_eq!(rows.len(), 1);
    }

    #[tokio::test]
    async fn next_after_wakes_on_enqueue() {
        let (q, _session_id) = queue().await;
        let q = Arc::new(q);
        let q2 = q.clone();
        let handle = tokio::spawn(async move { q2.next_after(0).await });

        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        q.enqueue(NewPendingMessage::default()).await.unwrap();

        let result = tokio::time::timeout(std::time::Duration::from_secs(1), handle)
            .await
            .expect("did not wake in time")
            .unwrap();
        assert_eq!(result.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn next_after_returns_none_once_closed() {
        let (q, _session_id) = queue().await;
        let q = Arc::new(q);
        let q2 = q.clone();
        let handle = tokio::spawn(async move { q2.next_after(0).await });

        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        q.close();

        let result = tokio::time::timeout(std::time::Duration::from_secs(1), handle)
            .await
            .expect("did not wake in time")
            .unwrap();
        assert!(result.is_none());
    }
}
