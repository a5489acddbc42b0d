//! Agent adapter: normalizes one external agent invocation into tagged events
//!
//! The adapter contract: given an [`AdapterInvocation`], produce a finite
//! sequence of [`AdapterEvent`]s ending in exactly one `Result`. The shipped
//! [`ProcessAdapter`] spawns the configured CLI and parses its stdout line
//! protocol; lines that are not valid event JSON become `Output` events, and
//! a process that exits without emitting a `Result` gets one synthesized
//! from its exit status.

use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;

use crate::config::AdapterConfig;
use crate::error::{RelayError, Result};
use crate::types::{MessageRole, MessageType};

// ============================================================================
// Event protocol
// ============================================================================

/// One tagged event from an agent invocation
///
/// Wire format is line-delimited JSON on the agent's stdout:
/// `{"type":"message","role":"assistant","message_type":"chat","content":"..."}`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AdapterEvent {
    /// Free-form log text; not part of the conversation
    Output { line: String },

    /// A discrete conversational unit
    Message {
        role: MessageRole,
        message_type: MessageType,
        content: String,
        #[serde(default)]
        metadata: serde_json::Value,
    },

    /// Terminal event; exactly one per invocation
    Result {
        success: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
}

impl AdapterEvent {
    /// Whether this is the terminal `result` event
    pub fn is_result(&self) -> bool {
        matches!(self, AdapterEvent::Result { .. })
    }
}

/// Parameters for one agent invocation
#[derive(Debug, Clone)]
pub struct AdapterInvocation {
    /// The natural-language instruction to execute
    pub instruction: String,

    /// Working directory of the target project
    pub project_dir: PathBuf,

    /// Session id for this execution
    pub session_id: String,

    /// Whether this is the first instruction against the project
    pub initial_prompt: bool,

    /// Files attached to the instruction
    pub attachments: Vec<PathBuf>,
}

/// Wraps one external agent execution behind a uniform event stream
#[async_trait]
pub trait AgentAdapter: Send + Sync {
    /// Start the invocation and return the event stream
    ///
    /// The receiver yields events in emission order and closes after the
    /// terminal `Result`. Dropping the receiver cancels the invocation.
    async fn execute(&self, invocation: AdapterInvocation) -> Result<mpsc::Receiver<AdapterEvent>>;

    /// Adapter name (recorded as the message source tag)
    fn cli_type(&self) -> &str;
}

// ============================================================================
// Process-backed adapter
// ============================================================================

/// Adapter that spawns the configured agent CLI as a child process
///
/// The instruction is appended to the configured base arguments; session
/// context travels in `CODERELAY_*` environment variables so the argument
/// shape stays CLI-agnostic.
pub struct ProcessAdapter {
    config: AdapterConfig,
}

impl ProcessAdapter {
    pub fn new(config: AdapterConfig) -> Self {
        Self { config }
    }

    fn parse_line(line: &str) -> AdapterEvent {
        match serde_json::from_str::<AdapterEvent>(line) {
            Ok(event) => event,
            Err(_) => AdapterEvent::Output {
                line: line.to_string(),
            },
        }
    }
}

#[async_trait]
impl AgentAdapter for ProcessAdapter {
    async fn execute(&self, invocation: AdapterInvocation) -> Result<mpsc::Receiver<AdapterEvent>> {
        let mut cmd = Command::new(&self.config.program);
        cmd.args(&self.config.args)
            .arg(&invocation.instruction)
            .current_dir(&invocation.project_dir)
            .env("CODERELAY_SESSION_ID", &invocation.session_id)
            .env(
                "CODERELAY_INITIAL_PROMPT",
                if invocation.initial_prompt { "1" } else { "0" },
            )
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        if !invocation.attachments.is_empty() {
            let joined = invocation
                .attachments
                .iter()
                .map(|p| p.to_string_lossy().into_owned())
                .collect::<Vec<_>>()
                .join(":");
            cmd.env("CODERELAY_ATTACHMENTS", joined);
        }

        let mut child = cmd.spawn().map_err(|e| {
            RelayError::AdapterProtocol(format!(
                "Failed to spawn agent process '{}': {}",
                self.config.program, e
            ))
        })?;

        let stdout = child.stdout.take().ok_or_else(|| {
            RelayError::AdapterProtocol("Agent process has no stdout handle".to_string())
        })?;

        // Drain stderr into the log so the child never blocks on a full pipe
        if let Some(stderr) = child.stderr.take() {
            let session_id = invocation.session_id.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    tracing::warn!(session = %session_id, "agent stderr: {}", line);
                }
            });
        }

        let (tx, rx) = mpsc::channel(self.config.event_buffer);
        let session_id = invocation.session_id;

        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            let mut saw_result = false;

            while let Ok(Some(line)) = lines.next_line().await {
                if line.trim().is_empty() {
                    continue;
                }
                let event = Self::parse_line(&line);
                let terminal = event.is_result();

                if tx.send(event).await.is_err() {
                    // Consumer went away: cancel the invocation
                    tracing::debug!(session = %session_id, "adapter consumer dropped, killing agent process");
                    let _ = child.kill().await;
                    return;
                }
                if terminal {
                    saw_result = true;
                    break;
                }
            }

            if saw_result {
                // The consumer has its terminal event; an agent that keeps
                // writing past its result must not pin the stdout pipe open
                drop(lines);
                let _ = child.start_kill();
                let _ = child.wait().await;
                return;
            }

            // Protocol guard: the agent exited without a result
            let (success, error) = match child.wait().await {
                Ok(s) if s.success() => (true, None),
                Ok(s) => (false, Some(format!("agent process exited with {}", s))),
                Err(e) => (false, Some(format!("agent process wait failed: {}", e))),
            };
            tracing::warn!(
                session = %session_id,
                success,
                "agent exited without emitting a result, synthesizing one"
            );
            let _ = tx.send(AdapterEvent::Result { success, error }).await;
        });

        Ok(rx)
    }

    fn cli_type(&self) -> &str {
        &self.config.cli_type
    }
}
