//! Observation Store: the relational store over sessions, pending messages,
//! observations, summaries, and prompts.
//!
//! Grounded on `memory/storage/sqlite/store.rs` (a thin struct delegating to
//! the pool, trait-fronted for testability) and `session/manager.rs` (query
//! style: `sqlx::query`/`query_as` with explicit binds, no compile-time
//! `query!` macro so the crate builds without a live `DATABASE_URL`).

use crate::model::{
    NewPendingMessage, Observation, ObservationPayload, PendingKind, PendingMessage, PendingState,
    RangeQuery, SessionRow, SessionStatus, Summary, SummaryPayload, UserPrompt,
};
use anyhow::Result;
use async_trait::async_trait;
use sqlx::{Row, SqlitePool};
use std::time::{SystemTime, UNIX_EPOCH};

pub fn now_epoch_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

fn json_array(items: &[String]) -> String {
    serde_json::to_string(items).unwrap_or_else(|_| "[]".to_string())
}

fn parse_json_array(s: &str) -> Vec<String> {
    serde_json::from_str(s).unwrap_or_default()
}

/// Storage surface required by the rest of the pipeline. A trait so
/// orchestrator/metrics code can be exercised against an in-memory fake in
/// unit tests without pulling in sqlx.
#[async_trait]
pub trait ObservationStore: Send + Sync {
    async fn create_session(
        &self,
        assistant_session_id: &str,
        project: &str,
        current_prompt: Option<&str>,
        seed_last_prompt_number: i64,
        seed_cum_input_tokens: i64,
        seed_cum_output_tokens: i64,
    ) -> Result<SessionRow>;

    async fn mark_session_completed(&self, session_id: i64) -> Result<()>;

    async fn latest_session_for_assistant_id(
        &self,
        assistant_session_id: &str,
    ) -> Result<Option<SessionRow>>;

    async fn update_session_tokens(
        &self,
        session_id: i64,
        cum_input_tokens: i64,
        cum_output_tokens: i64,
    ) -> Result<()>;

    async fn update_last_prompt_number(&self, session_id: i64, prompt_number: i64) -> Result<()>;

    async fn insert_observation(
        &self,
        session_id: i64,
        assistant_session_id: &str,
        project: &str,
        payload: &ObservationPayload,
        prompt_number: Option<i64>,
        discovery_tokens: i64,
    ) -> Result<(i64, i64)>;

    async fn insert_summary(
        &self,
        session_id: i64,
        assistant_session_id: &str,
        project: &str,
        payload: &SummaryPayload,
    ) -> Result<(i64, i64)>;

    async fn insert_prompt(
        &self,
        assistant_session_id: &str,
        project: &str,
        prompt_number: i64,
        prompt_text: &str,
    ) -> Result<(i64, i64)>;

    async fn list_observations(&self, query: RangeQuery) -> Result<Vec<Observation>>;
    async fn list_summaries(&self, query: RangeQuery) -> Result<Vec<Summary>>;
    async fn list_prompts(&self, query: RangeQuery) -> Result<Vec<UserPrompt>>;

    /// All observations matching an optional project and lower-bound
    /// timestamp (ms epoch), oldest id to newest — used by C7 to aggregate
    /// in memory when the query can't be pushed down cheaply
    async fn observations_for_metrics(
        &self,
        project: Option<&str>,
        since_epoch_ms: Option<i64>,
    ) -> Result<Vec<Observation>>;

    /// Most recent N observations for a project, newest-first (used by the
    /// endless-mode projection).
    async fn recent_observations(&self, project: &str, limit: i64) -> Result<Vec<Observation>>;

    // -- Pending message queue (C2) lives on the same pool for atomicity with
    // observation inserts, but is exposed through crate::queue's own trait.
    async fn enqueue_pending(&self, session_id: i64, msg: NewPendingMessage) -> Result<i64>;
    async fn pending_after(&self, session_id: i64, after_id: i64) -> Result<Vec<PendingMessage>>;
    async fn mark_pending_processed(&self, id: i64) -> Result<()>;
    async fn cleanup_processed(&self, keep_last: i64) -> Result<i64>;
}

pub struct SqliteObservationStore {
    pool: SqlitePool,
}

impl SqliteObservationStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    fn row_to_observation(row: &sqlx::sqlite::SqliteRow) -> Observation {
        Observation {
            id: row.get::<i64, _>("id"),
            assistant_session_id: row.get::<String, _>("assistant_session_id"),
            project: row.get::<String, _>("project"),
            r#type: row.get::<String, _>("type"),
            title: row.get::<String, _>("title"),
            subtitle: row.get::<String, _>("subtitle"),
            narrative: row.get::<String, _>("narrative"),
            text: row.get::<String, _>("text"),
            facts: parse_json_array(&row.get::<String, _>("facts")),
            concepts: parse_json_array(&row.get::<String, _>("concepts")),
            files_read: parse_json_array(&row.get::<String, _>("files_read")),
            files_modified: parse_json_array(&row.get::<String, _>("files_modified")),
            prompt_number: row.get::<Option<i64>, _>("prompt_number"),
            created_at_epoch: row.get::<i64, _>("created_at_epoch"),
            discovery_tokens: row.get::<i64, _>("discovery_tokens"),
        }
    }

    fn row_to_summary(row: &sqlx::sqlite::SqliteRow) -> Summary {
        Summary {
            id: row.get::<i64, _>("id"),
            session_id: row.get::<i64, _>("session_id"),
            assistant_session_id: row.get::<String, _>("assistant_session_id"),
            project: row.get::<String, _>("project"),
            request: row.get::<Option<String>, _>("request"),
            investigated: row.get::<Option<String>, _>("investigated"),
            learned: row.get::<Option<String>, _>("learned"),
            completed: row.get::<Option<String>, _>("completed"),
            next_steps: row.get::<Option<String>, _>("next_steps"),
            notes: row.get::<Option<String>, _>("notes"),
            created_at_epoch: row.get::<i64, _>("created_at_epoch"),
        }
    }

    fn row_to_prompt(row: &sqlx::sqlite::SqliteRow) -> UserPrompt {
        UserPrompt {
            id: row.get::<i64, _>("id"),
            assistant_session_id: row.get::<String, _>("assistant_session_id"),
            project: row.get::<String, _>("project"),
            prompt_number: row.get::<i64, _>("prompt_number"),
            prompt_text: row.get::<String, _>("prompt_text"),
            created_at_epoch: row.get::<i64, _>("created_at_epoch"),
        }
    }

    fn row_to_pending(row: &sqlx::sqlite::SqliteRow) -> PendingMessage {
        let kind = PendingKind::from_str(&row.get::<String, _>("kind"))
            .unwrap_or(PendingKind::Observation);
        let state = if row.get::<String, _>("state") == "processed" {
            PendingState::Processed
        } else {
            PendingState::Pending
        };
        PendingMessage {
            id: row.get::<i64, _>("id"),
            session_id: row.get::<i64, _>("session_id"),
            kind,
            tool_name: row.get::<Option<String>, _>("tool_name"),
            tool_input: row.get::<Option<String>, _>("tool_input"),
            tool_response: row.get::<Option<String>, _>("tool_response"),
            cwd: row.get::<Option<String>, _>("cwd"),
            prompt_number: row.get::<Option<i64>, _>("prompt_number"),
            last_user_message: row.get::<Option<String>, _>("last_user_message"),
            last_assistant_message: row.get::<Option<String>, _>("last_assistant_message"),
            state,
            created_at_epoch: row.get::<i64, _>("created_at_epoch"),
        }
    }

    fn row_to_session(row: &sqlx::sqlite::SqliteRow) -> SessionRow {
        let status = if row.get::<String, _>("status") == "completed" {
            SessionStatus::Completed
        } else {
            SessionStatus::Active
        };
        SessionRow {
            id: row.get::<i64, _>("id"),
            analyzer_session_id: row.get::<Option<String>, _>("analyzer_session_id"),
            assistant_session_id: row.get::<String, _>("assistant_session_id"),
            project: row.get::<String, _>("project"),
            current_prompt: row.get::<Option<String>, _>("current_prompt"),
            last_prompt_number: row.get::<i64, _>("last_prompt_number"),
            cum_input_tokens: row.get::<i64, _>("cum_input_tokens"),
            cum_output_tokens: row.get::<i64, _>("cum_output_tokens"),
            started_at_epoch: row.get::<i64, _>("started_at_epoch"),
            status,
        }
    }
}

#[async_trait]
impl ObservationStore for SqliteObservationStore {
    async fn create_session(
        &self,
        assistant_session_id: &str,
        project: &str,
        current_prompt: Option<&str>,
        seed_last_prompt_number: i64,
        seed_cum_input_tokens: i64,
        seed_cum_output_tokens: i64,
    ) -> Result<SessionRow> {
        let started_at = now_epoch_ms() / 1000;
        let id = sqlx::query(
            r#"
            INSERT INTO sessions (
                assistant_session_id, project, current_prompt, last_prompt_number,
                cum_input_tokens, cum_output_tokens, started_at_epoch, status
            ) VALUES (?, ?, ?, ?, ?, ?, ?, 'active')
            "#,
        )
        .bind(assistant_session_id)
        .bind(project)
        .bind(current_prompt)
        .bind(seed_last_prompt_number)
        .bind(seed_cum_input_tokens)
        .bind(seed_cum_output_tokens)
        .bind(started_at)
        .execute(&self.pool)
        .await?
        .last_insert_rowid();

        Ok(SessionRow {
            id,
            analyzer_session_id: None,
            assistant_session_id: assistant_session_id.to_string(),
            project: project.to_string(),
            current_prompt: current_prompt.map(|s| s.to_string()),
            last_prompt_number: seed_last_prompt_number,
            cum_input_tokens: seed_cum_input_tokens,
            cum_output_tokens: seed_cum_output_tokens,
            started_at_epoch: started_at,
            status: SessionStatus::Active,
        })
    }

    async fn mark_session_completed(&self, session_id: i64) -> Result<()> {
        sqlx::query("UPDATE sessions SET status = 'completed' WHERE id = ?")
            .bind(session_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn latest_session_for_assistant_id(
        &self,
        assistant_session_id: &str,
    ) -> Result<Option<SessionRow>> {
        let row = sqlx::query(
            r#"
            SELECT * FROM sessions WHERE assistant_session_id = ? ORDER BY id DESC LIMIT 1
            "#,
        )
        .bind(assistant_session_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|r| Self::row_to_session(&r)))
    }

    async fn update_session_tokens(
        &self,
        session_id: i64,
        cum_input_tokens: i64,
        cum_output_tokens: i64,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE sessions SET cum_input_tokens = ?, cum_output_tokens = ? WHERE id = ?",
        )
        .bind(cum_input_tokens)
        .bind(cum_output_tokens)
        .bind(session_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn update_last_prompt_number(&self, session_id: i64, prompt_number: i64) -> Result<()> {
        sqlx::query(
            "UPDATE sessions SET last_prompt_number = ? WHERE id = ? AND last_prompt_number < ?",
        )
        .bind(prompt_number)
        .bind(session_id)
        .bind(prompt_number)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn insert_observation(
        &self,
        session_id: i64,
        assistant_session_id: &str,
        project: &str,
        payload: &ObservationPayload,
        prompt_number: Option<i64>,
        discovery_tokens: i64,
    ) -> Result<(i64, i64)> {
        let created_at = now_epoch_ms();
        let facts = json_array(&payload.facts);
        let concepts = json_array(&payload.concepts);
        let files_read = json_array(&payload.files_read);
        let files_modified = json_array(&payload.files_modified);

        let id = sqlx::query(
            r#"
            INSERT INTO observations (
                assistant_session_id, project, type, title, subtitle, narrative, text,
                facts, concepts, files_read, files_modified, prompt_number,
                created_at_epoch, discovery_tokens
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(assistant_session_id)
        .bind(project)
        .bind(&payload.r#type)
        .bind(&payload.title)
        .bind(&payload.subtitle)
        .bind(&payload.narrative)
        .bind(&payload.text)
        .bind(&facts)
        .bind(&concepts)
        .bind(&files_read)
        .bind(&files_modified)
        .bind(prompt_number)
        .bind(created_at)
        .bind(discovery_tokens)
        .execute(&self.pool)
        .await?
        .last_insert_rowid();

        let _ = session_id; // session linkage kept via assistant_session_id; id retained for callers needing it
        Ok((id, created_at))
    }

    async fn insert_summary(
        &self,
        session_id: i64,
        assistant_session_id: &str,
        project: &str,
        payload: &SummaryPayload,
    ) -> Result<(i64, i64)> {
        let created_at = now_epoch_ms();
        let id = sqlx::query(
            r#"
            INSERT INTO summaries (
                session_id, assistant_session_id, project, request, investigated,
                learned, completed, next_steps, notes, created_at_epoch
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(session_id)
        .bind(assistant_session_id)
        .bind(project)
        .bind(&payload.request)
        .bind(&payload.investigated)
        .bind(&payload.learned)
        .bind(&payload.completed)
        .bind(&payload.next_steps)
        .bind(&payload.notes)
        .bind(created_at)
        .execute(&self.pool)
        .await?
        .last_insert_rowid();

        Ok((id, created_at))
    }

    async fn insert_prompt(
        &self,
        assistant_session_id: &str,
        project: &str,
        prompt_number: i64,
        prompt_text: &str,
    ) -> Result<(i64, i64)> {
        let created_at = now_epoch_ms();
        let id = sqlx::query(
            r#"
            INSERT INTO user_prompts (
                assistant_session_id, project, prompt_number, prompt_text, created_at_epoch
            ) VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(assistant_session_id)
        .bind(project)
        .bind(prompt_number)
        .bind(prompt_text)
        .bind(created_at)
        .execute(&self.pool)
        .await?
        .last_insert_rowid();

        Ok((id, created_at))
    }

    async fn list_observations(&self, query: RangeQuery) -> Result<Vec<Observation>> {
        let limit = query.limit.max(1);
        let rows = match (&query.project, query.after_id) {
            (Some(project), Some(after)) => {
                sqlx::query(
                    "SELECT * FROM observations WHERE project = ? AND id < ? ORDER BY id DESC LIMIT ?",
                )
                .bind(project)
                .bind(after)
                .bind(limit)
                .fetch_all(&self.pool)
                .await?
            }
            (Some(project), None) => {
                sqlx::query("SELECT * FROM observations WHERE project = ? ORDER BY id DESC LIMIT ?")
                    .bind(project)
                    .bind(limit)
                    .fetch_all(&self.pool)
                    .await?
            }
            (None, Some(after)) => {
                sqlx::query("SELECT * FROM observations WHERE id < ? ORDER BY id DESC LIMIT ?")
                    .bind(after)
                    .bind(limit)
                    .fetch_all(&self.pool)
                    .await?
            }
            (None, None) => {
                sqlx::query("SELECT * FROM observations ORDER BY id DESC LIMIT ?")
                    .bind(limit)
                    .fetch_all(&self.pool)
                    .await?
            }
        };
        Ok(rows.iter().map(Self::row_to_observation).collect())
    }

    async fn list_summaries(&self, query: RangeQuery) -> Result<Vec<Summary>> {
        let limit = query.limit.max(1);
        let rows = match (&query.project, query.after_id) {
            (Some(project), Some(after)) => {
                sqlx::query(
                    "SELECT * FROM summaries WHERE project = ? AND id < ? ORDER BY id DESC LIMIT ?",
                )
                .bind(project)
                .bind(after)
                .bind(limit)
                .fetch_all(&self.pool)
                .await?
            }
            (Some(project), None) => {
                sqlx::query("SELECT * FROM summaries WHERE project = ? ORDER BY id DESC LIMIT ?")
                    .bind(project)
                    .bind(limit)
                    .fetch_all(&self.pool)
                    .await?
            }
            (None, Some(after)) => {
                sqlx::query("SELECT * FROM summaries WHERE id < ? ORDER BY id DESC LIMIT ?")
                    .bind(after)
                    .bind(limit)
                    .fetch_all(&self.pool)
                    .await?
            }
            (None, None) => {
                sqlx::query("SELECT * FROM summaries ORDER BY id DESC LIMIT ?")
                    .bind(limit)
                    .fetch_all(&self.pool)
                    .await?
            }
        };
        Ok(rows.iter().map(Self::row_to_summary).collect())
    }

    async fn list_prompts(&self, query: RangeQuery) -> Result<Vec<UserPrompt>> {
        let limit = query.limit.max(1);
        let rows = match (&query.project, query.after_id) {
            (Some(project), Some(after)) => {
                sqlx::query(
                    "SELECT * FROM user_prompts WHERE project = ? AND id < ? ORDER BY id DESC LIMIT ?",
                )
                .bind(project)
                .bind(after)
                .bind(limit)
                .fetch_all(&self.pool)
                .await?
            }
            (Some(project), None) => {
                sqlx::query("SELECT * FROM user_prompts WHERE project = ? ORDER BY id DESC LIMIT ?")
                    .bind(project)
                    .bind(limit)
                    .fetch_all(&self.pool)
                    .await?
            }
            (None, Some(after)) => {
                sqlx::query("SELECT * FROM user_prompts WHERE id < ? ORDER BY id DESC LIMIT ?")
                    .bind(after)
                    .bind(limit)
                    .fetch_all(&self.pool)
                    .await?
            }
            (None, None) => {
                sqlx::query("SELECT * FROM user_prompts ORDER BY id DESC LIMIT ?")
                    .bind(limit)
                    .fetch_all(&self.pool)
                    .await?
            }
        };
        Ok(rows.iter().map(Self::row_to_prompt).collect())
    }

    async fn observations_for_metrics(
        &self,
        project: Option<&str>,
        since_epoch_ms: Option<i64>,
    ) -> Result<Vec<Observation>> {
        let rows = match (project, since_epoch_ms) {
            (Some(project), Some(since)) => {
                sqlx::query(
                    "SELECT * FROM observations WHERE project = ? AND created_at_epoch >= ? ORDER BY id ASC",
                )
                .bind(project)
                .bind(since)
                .fetch_all(&self.pool)
                .await?
            }
            (Some(project), None) => {
                sqlx::query("SELECT * FROM observations WHERE project = ? ORDER BY id ASC")
                    .bind(project)
                    .fetch_all(&self.pool)
                    .await?
            }
            (None, Some(since)) => {
                sqlx::query("SELECT * FROM observations WHERE created_at_epoch >= ? ORDER BY id ASC")
                    .bind(since)
                    .fetch_all(&self.pool)
                    .await?
            }
            (None, None) => {
                sqlx::query("SELECT * FROM observations ORDER BY id ASC")
                    .fetch_all(&self.pool)
                    .await?
            }
        };
        Ok(rows.iter().map(Self::row_to_observation).collect())
    }

    async fn recent_observations(&self, project: &str, limit: i64) -> Result<Vec<Observation>> {
        let rows = sqlx::query(
            "SELECT * FROM observations WHERE project = ? ORDER BY id DESC LIMIT ?",
        )
        .bind(project)
        .bind(limit.max(1))
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(Self::row_to_observation).collect())
    }

    async fn enqueue_pending(&self, session_id: i64, msg: NewPendingMessage) -> Result<i64> {
        let created_at = now_epoch_ms();
        let id = sqlx::query(
            r#"
            INSERT INTO pending_messages (
                session_id, kind, tool_name, tool_input, tool_response, cwd,
                prompt_number, last_user_message, last_assistant_message,
                state, created_at_epoch
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, 'pending', ?)
            "#,
        )
        .bind(session_id)
        .bind(msg.kind.as_str())
        .bind(&msg.tool_name)
        .bind(&msg.tool_input)
        .bind(&msg.tool_response)
        .bind(&msg.cwd)
        .bind(msg.prompt_number)
        .bind(&msg.last_user_message)
        .bind(&msg.last_assistant_message)
        .bind(created_at)
        .execute(&self.pool)
        .await?
        .last_insert_rowid();
        Ok(id)
    }

    async fn pending_after(&self, session_id: i64, after_id: i64) -> Result<Vec<PendingMessage>> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM pending_messages
            WHERE session_id = ? AND state = 'pending' AND id > ?
            ORDER BY id ASC
            "#,
        )
        .bind(session_id)
        .bind(after_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(Self::row_to_pending).collect())
    }

    async fn mark_pending_processed(&self, id: i64) -> Result<()> {
        sqlx::query("UPDATE pending_messages SET state = 'processed' WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn cleanup_processed(&self, keep_last: i64) -> Result<i64> {
        let result = sqlx::query(
            r#"
            DELETE FROM pending_messages
            WHERE state = 'processed' AND id NOT IN (
                SELECT id FROM pending_messages WHERE state = 'processed'
                ORDER BY id DESC LIMIT ?
            )
            "#,
        )
        .bind(keep_last.max(0))
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() as i64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::sqlite::SqlitePoolOptions;

    async fn test_pool() -> SqlitePool {
        let pool = SqlitePoolOptions::new()
            .connect("sqlite::memory:")
            .await
            .unwrap();
        sqlx::migrate!("./migrations").run(&pool).await.unwrap();
        pool
    }

    #[tokio::test]
    async fn insert_and_list_observations_newest_first() {
        let pool = test_pool().await;
        let store = SqliteObservationStore::new(pool);

        let session = store
            .create_session("assist-1", "proj", Some("hi"), 1, 0, 0)
            .await
            .unwrap();

        let payload = ObservationPayload {
            r#type: "code".to_string(),
            title: "t1".to_string(),
            ..Default::default()
        };
        let (id1, _) = store
            .insert_observation(session.id, "assist-1", "proj", &payload, Some(1), 10)
            .await
            .unwrap();
        let (id2, _) = store
            .insert_observation(session.id, "assist-1", "proj", &payload, Some(1), 20)
            .await
            .unwrap();

        assert!(id2 > id1);

        let listed = store
            .list_observations(RangeQuery {
                project: Some("proj".to_string()),
                after_id: None,
                limit: 10,
            })
            .await
            .unwrap();

        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].id, id2);
        assert_eq!(listed[1].id, id1);
    }

    #[tokio::test]
    async fn cleanup_processed_keeps_exactly_n() {
        let pool = test_pool().await;
        let store = SqliteObservationStore::new(pool);
        let session = store
            .create_session("assist-1", "proj", None, 1, 0, 0)
            .await
            .unwrap();

        let mut ids = Vec::new();
        for _ in 0..5 {
            let id = store
                .enqueue_pending(session.id, NewPendingMessage::default())
                .await
                .unwrap();
            ids.push(id);
        }
        for id in &ids {
            store.mark_pending_processed(*id).await.unwrap();
        }

        let deleted = store.cleanup_processed(3).await.unwrap();
        assert_eq!(deleted, 2);

        let remaining = store.pending_after(session.id, 0).await.unwrap();
        // pending_after only returns 'pending' rows; all are processed now.
        assert_eq!(remaining.len(), 0);
    }
}
