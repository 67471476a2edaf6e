//! Shared data types for the observation pipeline.
//!
//! These are plain records; persistence lives in [`crate::store`], in-flight
//! session bookkeeping lives in [`crate::session`].

use serde::{Deserialize, Serialize};

/// One deferred analyzer input.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PendingKind {
    Observation,
    Summarize,
}

impl PendingKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            PendingKind::Observation => "observation",
            PendingKind::Summarize => "summarize",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "observation" => Some(PendingKind::Observation),
            "summarize" => Some(PendingKind::Summarize),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PendingState {
    Pending,
    Processed,
}

impl PendingState {
    pub fn as_str(&self) -> &'static str {
        match self {
            PendingState::Pending => "pending",
            PendingState::Processed => "processed",
        }
    }
}

/// A queued tool-activity event awaiting analysis.
#[derive(Debug, Clone)]
pub struct PendingMessage {
    pub id: i64,
    pub session_id: i64,
    pub kind: PendingKind,
    pub tool_name: Option<String>,
    pub tool_input: Option<String>,
    pub tool_response: Option<String>,
    pub cwd: Option<String>,
    pub prompt_number: Option<i64>,
    pub last_user_message: Option<String>,
    pub last_assistant_message: Option<String>,
    pub state: PendingState,
    pub created_at_epoch: i64,
}

/// Fields needed to enqueue a new pending message, already split by kind
/// and resolved to a session id.
#[derive(Debug, Clone, Default)]
pub struct NewPendingMessage {
    pub kind: PendingKind,
    pub tool_name: Option<String>,
    pub tool_input: Option<String>,
    pub tool_response: Option<String>,
    pub cwd: Option<String>,
    pub prompt_number: Option<i64>,
    pub last_user_message: Option<String>,
    pub last_assistant_message: Option<String>,
}

impl Default for PendingKind {
    fn default() -> Self {
        PendingKind::Observation
    }
}

/// One distilled finding. Immutable after insert.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Observation {
    pub id: i64,
    pub assistant_session_id: String,
    pub project: String,
    #[serde(rename = "type")]
    pub r#type: String,
    pub title: String,
    pub subtitle: String,
    pub narrative: String,
    pub text: String,
    pub facts: Vec<String>,
    pub concepts: Vec<String>,
    pub files_read: Vec<String>,
    pub files_modified: Vec<String>,
    pub prompt_number: Option<i64>,
    pub created_at_epoch: i64,
    pub discovery_tokens: i64,
}

/// Payload produced by the response parser for one observation, prior to
/// persistence (no id / timestamps / discovery_tokens assigned yet).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ObservationPayload {
    #[serde(rename = "type")]
    pub r#type: String,
    pub title: String,
    pub subtitle: String,
    pub narrative: String,
    pub text: String,
    pub facts: Vec<String>,
    pub concepts: Vec<String>,
    pub files_read: Vec<String>,
    pub files_modified: Vec<String>,
}

/// One end-of-session roll-up. Immutable after insert.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Summary {
    pub id: i64,
    pub session_id: i64,
    pub assistant_session_id: String,
    pub project: String,
    pub request: Option<String>,
    pub investigated: Option<String>,
    pub learned: Option<String>,
    pub completed: Option<String>,
    pub next_steps: Option<String>,
    pub notes: Option<String>,
    pub created_at_epoch: i64,
}

/// Payload produced by the response parser for a summary, prior to persistence.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SummaryPayload {
    pub request: Option<String>,
    pub investigated: Option<String>,
    pub learned: Option<String>,
    pub completed: Option<String>,
    pub next_steps: Option<String>,
    pub notes: Option<String>,
}

/// A recorded user utterance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserPrompt {
    pub id: i64,
    pub assistant_session_id: String,
    pub project: String,
    pub prompt_number: i64,
    pub prompt_text: String,
    pub created_at_epoch: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    Active,
    Completed,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Active => "active",
            SessionStatus::Completed => "completed",
        }
    }
}

/// Durable projection of a session row.
#[derive(Debug, Clone)]
pub struct SessionRow {
    pub id: i64,
    pub analyzer_session_id: Option<String>,
    pub assistant_session_id: String,
    pub project: String,
    pub current_prompt: Option<String>,
    pub last_prompt_number: i64,
    pub cum_input_tokens: i64,
    pub cum_output_tokens: i64,
    pub started_at_epoch: i64,
    pub status: SessionStatus,
}

/// Newest-first paginated range query shared by the three append-only tables.
#[derive(Debug, Clone, Default)]
pub struct RangeQuery {
    pub project: Option<String>,
    pub after_id: Option<i64>,
    pub limit: i64,
}
