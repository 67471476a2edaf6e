//! Analyzer subprocess protocol and executor.
//!
//! Line-delimited JSON over stdin/stdout, the same shape
//! `agents/executor/subprocess.rs` and `agents/protocol.rs` use for their
//! tool-calling subprocess peers: one tagged frame per line, a
//! `BufWriter`/`BufReader` pair, `kill_on_drop(true)` so a dropped handle
//! can't leak a process, and a `tokio::time::timeout` around each read.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, BufWriter};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::config::AnalyzerConfig;

/// Failure modes specific to spawning and talking to the analyzer
/// subprocess, as opposed to the generic `anyhow::Error` every fallible
/// function in this crate returns at its boundary.
#[derive(Debug, thiserror::Error)]
pub enum AnalyzerError {
    #[error("analyzer spawn timed out after {0:?}")]
    SpawnTimeout(Duration),
    #[error("failed to spawn analyzer subprocess")]
    Spawn(#[source] std::io::Error),
    #[error("analyzer {0} handle unavailable")]
    StdioUnavailable(&'static str),
    #[error("failed to decode analyzer reply")]
    Decode(#[source] serde_json::Error),
    #[error("analyzer read timed out after {0:?}")]
    ReadTimeout(Duration),
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "frame", rename_all = "snake_case")]
pub enum AnalyzerFrame {
    Init {
        project: String,
        assistant_session_id: String,
        user_prompt: String,
        mode: String,
    },
    Continuation {
        project: String,
        assistant_session_id: String,
        user_prompt: String,
        prompt_number: i64,
        mode: String,
    },
    Observation {
        tool_name: Option<String>,
        tool_input: Option<String>,
        tool_response: Option<String>,
        cwd: Option<String>,
    },
    Summarize {
        last_user_message: Option<String>,
        last_assistant_message: Option<String>,
    },
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct Usage {
    #[serde(default)]
    pub input_tokens: i64,
    #[serde(default)]
    pub output_tokens: i64,
    #[serde(default)]
    pub cache_creation_input_tokens: i64,
    #[serde(default)]
    pub cache_read_input_tokens: i64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "frame", rename_all = "snake_case")]
pub enum AnalyzerReply {
    AssistantText { body: String, usage: Usage },
    Result { status: Option<String> },
}

/// Handle to a running analyzer subprocess: a sender for frames and a
/// receiver for replies. Closing `frames_tx` signals EOF to the process;
/// dropping the handle kills the child (`kill_on_drop`).
pub struct AnalyzerHandle {
    pub frames_tx: mpsc::Sender<AnalyzerFrame>,
    pub replies_rx: mpsc::Receiver<Result<AnalyzerReply>>,
    child: Child,
}

impl AnalyzerHandle {
    pub async fn kill(&mut self) {
        let _ = self.child.start_kill();
    }
}

/// Spawns the analyzer subprocess and wires up the producer/consumer
/// tasks: one task drains `frames_tx` and writes lines to stdin, the main
/// reader loop below reads stdout lines and decodes replies.
pub async fn spawn(config: &AnalyzerConfig) -> Result<AnalyzerHandle> {
    let mut cmd = Command::new(&config.command);
    cmd.args(&config.args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = timeout(config.spawn_timeout, async { cmd.spawn() })
        .await
        .map_err(|_| AnalyzerError::SpawnTimeout(config.spawn_timeout))?
        .map_err(AnalyzerError::Spawn)?;

    let stdin = child
        .stdin
        .take()
        .ok_or(AnalyzerError::StdioUnavailable("stdin"))?;
    let stdout = child
        .stdout
        .take()
        .ok_or(AnalyzerError::StdioUnavailable("stdout"))?;
    let stderr = child.stderr.take();

    if let Some(stderr) = stderr {
        tokio::spawn(async move {
            let mut reader = BufReader::new(stderr);
            let mut line = String::new();
            while reader.read_line(&mut line).await.unwrap_or(0) > 0 {
                debug!("analyzer stderr: {}", line.trim());
                line.clear();
            }
        });
    }

    let (frames_tx, mut frames_rx) = mpsc::channel::<AnalyzerFrame>(64);
    tokio::spawn(async move {
        let mut writer = BufWriter::new(stdin);
        while let Some(frame) = frames_rx.recv().await {
            let Ok(line) = serde_json::to_string(&frame) else {
                continue;
            };
            if writer.write_all(line.as_bytes()).await.is_err() {
                break;
            }
            if writer.write_all(b"\n").await.is_err() {
                break;
            }
            if writer.flush().await.is_err() {
                break;
            }
        }
    });

    let (replies_tx, replies_rx) = mpsc::channel::<Result<AnalyzerReply>>(64);
    let read_timeout = Duration::from_secs(300);
    tokio::spawn(async move {
        let mut reader = BufReader::new(stdout);
        loop {
            let mut line = String::new();
            match timeout(read_timeout, reader.read_line(&mut line)).await {
                Ok(Ok(0)) => break, // EOF, analyzer closed its stream
                Ok(Ok(_)) => {
                    let trimmed = line.trim();
                    if trimmed.is_empty() {
                        continue;
                    }
                    let parsed = serde_json::from_str::<AnalyzerReply>(trimmed)
                        .map_err(|e| AnalyzerError::Decode(e).into());
                    if replies_tx.send(parsed).await.is_err() {
                        break;
                    }
                }
                Ok(Err(e)) => {
                    let _ = replies_tx.send(Err(e.into())).await;
                    break;
                }
                Err(_) => {
                    warn!("analyzer read timed out after {:?}", read_timeout);
                    let _ = replies_tx
                        .send(Err(AnalyzerError::ReadTimeout(read_timeout).into()))
                        .await;
                    break;
                }
            }
        }
    });

    Ok(AnalyzerHandle {
        frames_tx,
        replies_rx,
        child,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_frame_serializes_with_tag() {
        let frame = AnalyzerFrame::Init {
            project: "proj".to_string(),
            assistant_session_id: "a-1".to_string(),
            user_prompt: "hi".to_string(),
            mode: "endless".to_string(),
        };
        let json = serde_json::to_string(&frame).unwrap();
        assert!(json.contains("\"frame\":\"init\""));
    }

    #[test]
    fn assistant_text_reply_round_trips() {
        let json = r#"{"frame":"assistant_text","body":"hello","usage":{"input_tokens":10,"output_tokens":5,"cache_creation_input_tokens":0,"cache_read_input_tokens":2}}"#;
        let reply: AnalyzerReply = serde_json::from_str(json).unwrap();
        match reply {
            AnalyzerReply::AssistantText { body, usage } => {
                assert_eq!(body, "hello");
                assert_eq!(usage.input_tokens, 10);
                assert_eq!(usage.cache_read_input_tokens, 2);
            }
            _ => panic!("wrong variant"),
        }
    }
}
