//! Session Orchestrator: the event-driven pump that drives one analyzer
//! subprocess for the lifetime of a session.
//!
//! The producer/consumer split and the per-message translation into tagged
//! frames is grounded on `agents/executor/subprocess.rs`'s communication
//! loop; the two explicit capability interfaces referenced from the design
//! notes (`ObservationEvents`, `MetricsSink`) are folded here into the
//! concrete `Broadcaster` / `MetricsEngine` / `PerformanceTracker` handles
//! this orchestrator is constructed with, rather than extra trait
//! indirection nothing else in this codebase needs.

use crate::analyzer::{self, AnalyzerFrame, AnalyzerReply};
use crate::broadcast::{Broadcaster, LiveEvent};
use crate::config::AnalyzerConfig;
use crate::metrics::MetricsEngine;
use crate::model::{Observation, PendingKind, PendingMessage, SessionRow, Summary};
use crate::parser;
use crate::perf::{PerformanceTracker, ProcessingRecord};
use crate::session::ActiveSession;
use crate::store::ObservationStore;
use crate::vector_sync::{self, VectorIndexSync};
use anyhow::Result;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};
use tokio::time::Instant as TokioInstant;
use tracing::{debug, info};

const MODE: &str = "endless";
const DRAIN_GRACE: Duration = Duration::from_secs(5);

#[derive(Clone)]
pub struct OrchestratorDeps {
    pub analyzer: Arc<AnalyzerConfig>,
    pub metrics: Arc<MetricsEngine>,
    pub perf: Arc<PerformanceTracker>,
    pub vector_sync: Arc<dyn VectorIndexSync>,
    pub keep_processed: i64,
}

struct TokenState {
    cum_input: i64,
    cum_output: i64,
}

fn translate(msg: &PendingMessage) -> AnalyzerFrame {
    match msg.kind {
        PendingKind::Observation => AnalyzerFrame::Observation {
            tool_name: msg.tool_name.clone(),
            tool_input: msg.tool_input.clone(),
            tool_response: msg.tool_response.clone(),
            cwd: msg.cwd.clone(),
        },
        PendingKind::Summarize => AnalyzerFrame::Summarize {
            last_user_message: msg.last_user_message.clone(),
            last_assistant_message: msg.last_assistant_message.clone(),
        },
    }
}

fn now_epoch_ms() -> i64 {
    crate::store::now_epoch_ms()
}

pub async fn run(
    session_row: SessionRow,
    active: Arc<ActiveSession>,
    store: Arc<dyn ObservationStore>,
    broadcaster: Broadcaster,
    deps: OrchestratorDeps,
) -> Result<()> {
    let session_id = session_row.id;
    let project = session_row.project.clone();
    let assistant_session_id = session_row.assistant_session_id.clone();

    let mut handle = analyzer::spawn(&deps.analyzer).await?;

    let init_frame = if session_row.last_prompt_number > 1 {
        AnalyzerFrame::Continuation {
            project: project.clone(),
            assistant_session_id: assistant_session_id.clone(),
            user_prompt: session_row.current_prompt.clone().unwrap_or_default(),
            prompt_number: session_row.last_prompt_number,
            mode: MODE.to_string(),
        }
    } else {
        AnalyzerFrame::Init {
            project: project.clone(),
            assistant_session_id: assistant_session_id.clone(),
            user_prompt: session_row.current_prompt.clone().unwrap_or_default(),
            mode: MODE.to_string(),
        }
    };
    handle.frames_tx.send(init_frame).await.ok();

    let fed_ids: Arc<StdMutex<Vec<i64>>> = Arc::new(StdMutex::new(Vec::new()));

    // Producer: the only owner of `frames_tx` from here on, so dropping it
    // when the queue closes or cancellation fires is what signals EOF to
    // the analyzer's stdin.
    {
        let frames_tx = handle.frames_tx.clone();
        let producer_queue = active.queue.clone();
        let producer_cancel = active.cancel.clone();
        let producer_store = store.clone();
        let producer_fed_ids = fed_ids.clone();
        let producer_active = active.clone();
        tokio::spawn(async move {
            let mut after_id = 0i64;
            loop {
                if producer_cancel.is_cancelled() {
                    break;
                }
                let batch = tokio::select! {
                    biased;
                    _ = producer_cancel.cancelled() => break,
                    batch = producer_queue.next_after(after_id) => batch,
                };
                let Some(batch) = batch else { break };
                for msg in batch {
                    after_id = msg.id;
                    if let Some(prompt_number) = msg.prompt_number {
                        let _ = producer_store
                            .update_last_prompt_number(session_id, prompt_number)
                            .await;
                        producer_active
                            .prompt_number
                            .fetch_max(prompt_number, Ordering::Relaxed);
                    }
                    let frame = translate(&msg);
                    if frames_tx.send(frame).await.is_err() {
                        return;
                    }
                    producer_fed_ids.lock().unwrap().push(msg.id);
                    producer_active.queued.fetch_sub(1, Ordering::Relaxed);
                    producer_active.in_flight.fetch_add(1, Ordering::Relaxed);
                    if producer_cancel.is_cancelled() {
                        return;
                    }
                }
            }
            debug!("producer for session {} stopped", session_id);
        });
    }

    let mut state = TokenState {
        cum_input: session_row.cum_input_tokens,
        cum_output: session_row.cum_output_tokens,
    };
    let mut last_reply_end = Instant::now();
    let mut draining_deadline: Option<TokioInstant> = None;
    let mut completed_cleanly = false;
    let mut was_cancelled = false;

    loop {
        if let Some(deadline) = draining_deadline {
            tokio::select! {
                reply = handle.replies_rx.recv() => {
                    match reply {
                        None => { completed_cleanly = true; break; }
                        Some(Ok(r)) => {
                            let reply_start = last_reply_end;
                            process_reply(
                                r, reply_start, session_id, &project, &assistant_session_id,
                                &mut state, &store, &broadcaster, &deps, &fed_ids, &active,
                            ).await?;
                            last_reply_end = Instant::now();
                        }
                        Some(Err(e)) => return Err(e),
                    }
                }
                _ = tokio::time::sleep_until(deadline) => {
                    info!("session {} drain grace elapsed, aborting", session_id);
                    break;
                }
            }
        } else {
            tokio::select! {
                reply = handle.replies_rx.recv() => {
                    match reply {
                        None => { completed_cleanly = true; break; }
                        Some(Ok(r)) => {
                            let reply_start = last_reply_end;
                            process_reply(
                                r, reply_start, session_id, &project, &assistant_session_id,
                                &mut state, &store, &broadcaster, &deps, &fed_ids, &active,
                            ).await?;
                            last_reply_end = Instant::now();
                        }
                        Some(Err(e)) => return Err(e),
                    }
                }
                _ = active.cancel.cancelled() => {
                    info!("session {} cancelled, draining", session_id);
                    was_cancelled = true;
                    draining_deadline = Some(TokioInstant::now() + DRAIN_GRACE);
                }
            }
        }
    }

    handle.kill().await;

    // Only a clean close while running (never cancelled) reaches
    // `completed`; a cancelled session that then drains cleanly is still
    // `draining -> aborted`, not `draining -> completed`.
    if completed_cleanly && !was_cancelled {
        store.mark_session_completed(session_id).await?;
    }

    Ok(())
}

#[allow(clippy::too_many_arguments)]
async fn process_reply(
    reply: AnalyzerReply,
    reply_start: Instant,
    session_id: i64,
    project: &str,
    assistant_session_id: &str,
    state: &mut TokenState,
    store: &Arc<dyn ObservationStore>,
    broadcaster: &Broadcaster,
    deps: &OrchestratorDeps,
    fed_ids: &Arc<StdMutex<Vec<i64>>>,
    active: &Arc<ActiveSession>,
) -> Result<()> {
    let (body, usage) = match reply {
        AnalyzerReply::AssistantText { body, usage } => (body, usage),
        AnalyzerReply::Result { .. } => return Ok(()),
    };

    let tokens_before = state.cum_input + state.cum_output;
    state.cum_input += usage.input_tokens + usage.cache_creation_input_tokens;
    state.cum_output += usage.output_tokens;
    store
        .update_session_tokens(session_id, state.cum_input, state.cum_output)
        .await?;
    let discovery_tokens = (state.cum_input + state.cum_output) - tokens_before;

    let (observations, summary) = parser::parse_reply(&body);
    let prompt_number = Some(active.prompt_number.load(Ordering::Relaxed));

    if !observations.is_empty() || summary.is_some() {
        for payload in &observations {
            let (id, created_at) = store
                .insert_observation(session_id, assistant_session_id, project, payload, prompt_number, discovery_tokens)
                .await?;

            vector_sync::spawn_observation_sync(
                deps.vector_sync.clone(),
                id,
                session_id,
                project.to_string(),
                payload.clone(),
                prompt_number,
                created_at,
                discovery_tokens,
            );

            broadcaster.publish(LiveEvent::NewObservation {
                observation: Observation {
                    id,
                    assistant_session_id: assistant_session_id.to_string(),
                    project: project.to_string(),
                    r#type: payload.r#type.clone(),
                    title: payload.title.clone(),
                    subtitle: payload.subtitle.clone(),
                    narrative: payload.narrative.clone(),
                    text: payload.text.clone(),
                    facts: payload.facts.clone(),
                    concepts: payload.concepts.clone(),
                    files_read: payload.files_read.clone(),
                    files_modified: payload.files_modified.clone(),
                    prompt_number,
                    created_at_epoch: created_at,
                    discovery_tokens,
                },
            });

            deps.metrics.invalidate_cache(Some(project));
            deps.metrics.broadcast_token_update(Some(project)).await;
        }

        if let Some(summary_payload) = &summary {
            let (id, created_at) = store
                .insert_summary(session_id, assistant_session_id, project, summary_payload)
                .await?;

            vector_sync::spawn_summary_sync(
                deps.vector_sync.clone(),
                id,
                session_id,
                project.to_string(),
                summary_payload.clone(),
                created_at,
            );

            broadcaster.publish(LiveEvent::NewSummary {
                summary: Summary {
                    id,
                    session_id,
                    assistant_session_id: assistant_session_id.to_string(),
                    project: project.to_string(),
                    request: summary_payload.request.clone(),
                    investigated: summary_payload.investigated.clone(),
                    learned: summary_payload.learned.clone(),
                    completed: summary_payload.completed.clone(),
                    next_steps: summary_payload.next_steps.clone(),
                    notes: summary_payload.notes.clone(),
                    created_at_epoch: created_at,
                },
            });

            deps.metrics.invalidate_cache(Some(project));
        }

        deps.perf.record_processing(ProcessingRecord {
            timestamp_ms: now_epoch_ms(),
            duration_ms: reply_start.elapsed().as_millis() as i64,
            observation_count: observations.len() as i64,
            discovery_tokens,
        });
    }

    let drained: Vec<i64> = {
        let mut guard = fed_ids.lock().unwrap();
        std::mem::take(&mut *guard)
    };
    for id in &drained {
        active.queue.mark_processed(*id).await?;
    }
    active
        .in_flight
        .fetch_sub(drained.len() as i64, Ordering::Relaxed);
    let dropped = active.queue.cleanup_processed(deps.keep_processed).await?;
    if dropped > 0 {
        debug!(dropped, session_id, "pruned processed pending_messages");
    }

    let queue_depth = active.queued.load(Ordering::Relaxed) + active.in_flight.load(Ordering::Relaxed);
    broadcaster.publish(LiveEvent::ProcessingStatus {
        is_processing: queue_depth > 0,
        queue_depth,
    });
    deps.perf.sample_queue_depth(now_epoch_ms(), queue_depth);

    Ok(())
}
