//! Execution runner: wires one instruction through the whole pipeline
//!
//! Submission persists the user's message, opens the session/request pair,
//! announces the execution, and spawns the consumer task that drains the
//! adapter event stream. The consumer routes assistant prose through the
//! coalescer, persists discrete events directly (forcing an implicit commit
//! first so prose and tool activity keep their relative order), and always
//! forces a final commit before the session is closed, success or failure.

use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::adapter::{AdapterEvent, AdapterInvocation, AgentAdapter};
use crate::broadcast::Broadcaster;
use crate::coalescer::StreamCoalescer;
use crate::config::RelayConfig;
use crate::error::{RelayError, Result};
use crate::ledger::SessionLedger;
use crate::store::ProjectStore;
use crate::types::{
    prefixed_id, CompletionStatus, EventEnvelope, ExecutionComplete, ExecutionStart, Message,
    MessageRole, MessageType, RequestType, SessionStatus,
};

/// One instruction submission
#[derive(Debug, Clone)]
pub struct SubmitRequest {
    pub project_id: String,
    pub project_dir: PathBuf,
    pub instruction: String,
    pub request_type: RequestType,
    pub conversation_id: Option<String>,
    pub attachments: Vec<PathBuf>,
}

/// What the caller gets back immediately after submission
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitOutcome {
    pub session_id: String,
    pub conversation_id: String,
    pub request_id: String,
    pub status: SessionStatus,
}

/// Drives executions: one consumer task per submitted instruction
pub struct ExecutionRunner {
    store: Arc<dyn ProjectStore>,
    broadcaster: Arc<Broadcaster>,
    ledger: SessionLedger,
    adapter: Arc<dyn AgentAdapter>,
    config: RelayConfig,
}

impl ExecutionRunner {
    pub fn new(
        store: Arc<dyn ProjectStore>,
        broadcaster: Arc<Broadcaster>,
        adapter: Arc<dyn AgentAdapter>,
        config: RelayConfig,
    ) -> Self {
        Self {
            ledger: SessionLedger::new(store.clone()),
            store,
            broadcaster,
            adapter,
            config,
        }
    }

    pub fn ledger(&self) -> &SessionLedger {
        &self.ledger
    }

    /// Submit an instruction: persist the user echo, open the ledger pair,
    /// start the adapter, and spawn the consumer task
    pub async fn submit(&self, request: SubmitRequest) -> Result<SubmitOutcome> {
        let project_id = request.project_id.clone();
        let conversation_id = request
            .conversation_id
            .clone()
            .unwrap_or_else(|| prefixed_id("conv"));

        // First instruction against an empty conversation log?
        let initial_prompt = self
            .store
            .list_messages(&project_id, None)
            .await?
            .is_empty();

        let user_message = Message::new(
            &project_id,
            MessageRole::User,
            MessageType::User,
            &request.instruction,
        )
        .with_conversation(conversation_id.clone());
        self.store.append_message(&user_message).await?;

        let (session, user_request) = self
            .ledger
            .open(
                &project_id,
                self.adapter.cli_type(),
                &request.instruction,
                request.request_type,
                &user_message.id,
            )
            .await?;

        self.broadcaster
            .publish(&project_id, EventEnvelope::message(&user_message))
            .await;

        let events = match self
            .adapter
            .execute(AdapterInvocation {
                instruction: request.instruction.clone(),
                project_dir: request.project_dir.clone(),
                session_id: session.id.clone(),
                initial_prompt,
                attachments: request.attachments.clone(),
            })
            .await
        {
            Ok(rx) => rx,
            Err(e) => {
                // Could not even start: close immediately as failed
                self.ledger.close(&session.id, &user_request.id, false).await?;
                self.broadcaster
                    .publish(
                        &project_id,
                        EventEnvelope::complete(
                            request.request_type,
                            &ExecutionComplete {
                                status: CompletionStatus::Failed,
                                session_id: session.id.clone(),
                                error: Some(e.to_string()),
                                request_id: Some(user_request.id.clone()),
                            },
                        ),
                    )
                    .await;
                return Err(e);
            }
        };

        let coalescer = StreamCoalescer::new(
            self.store.clone(),
            self.config.commit_retry.clone(),
            self.config.commit_interval(),
            project_id.clone(),
            session.id.clone(),
            Some(conversation_id.clone()),
            Some(self.adapter.cli_type().to_string()),
        );

        self.broadcaster
            .publish(
                &project_id,
                EventEnvelope::start(
                    request.request_type,
                    &ExecutionStart {
                        session_id: session.id.clone(),
                        instruction: request.instruction.clone(),
                        request_id: Some(user_request.id.clone()),
                        stream_id: coalescer.stream_id().to_string(),
                    },
                ),
            )
            .await;

        let execution = Execution {
            store: self.store.clone(),
            broadcaster: self.broadcaster.clone(),
            ledger: self.ledger.clone(),
            config: self.config.clone(),
            project_id: project_id.clone(),
            session_id: session.id.clone(),
            request_id: user_request.id.clone(),
            request_type: request.request_type,
            conversation_id: conversation_id.clone(),
            source_tag: self.adapter.cli_type().to_string(),
        };
        tokio::spawn(execution.run(coalescer, events));

        Ok(SubmitOutcome {
            session_id: session.id,
            conversation_id,
            request_id: user_request.id,
            status: SessionStatus::Active,
        })
    }
}

/// Per-execution consumer state
struct Execution {
    store: Arc<dyn ProjectStore>,
    broadcaster: Arc<Broadcaster>,
    ledger: SessionLedger,
    config: RelayConfig,
    project_id: String,
    session_id: String,
    request_id: String,
    request_type: RequestType,
    conversation_id: String,
    source_tag: String,
}

impl Execution {
    async fn run(self, mut coalescer: StreamCoalescer, mut events: mpsc::Receiver<AdapterEvent>) {
        let (success, error) = self.consume(&mut coalescer, &mut events).await;

        // Converge persisted record and last-seen live content: a final
        // forced commit always runs before the terminal state is declared
        let (success, error) = match coalescer.commit().await {
            Ok(Some((_, envelope))) => {
                self.broadcaster.publish(&self.project_id, envelope).await;
                (success, error)
            }
            Ok(None) => (success, error),
            Err(e) => {
                tracing::error!(session = %self.session_id, error = %e, "final commit failed");
                (false, Some(error.unwrap_or_else(|| e.to_string())))
            }
        };

        if !success {
            self.surface_error(error.as_deref().unwrap_or("execution failed"))
                .await;
        }

        if let Err(e) = self
            .ledger
            .close(&self.session_id, &self.request_id, success)
            .await
        {
            tracing::error!(session = %self.session_id, error = %e, "failed to close ledger");
        }

        self.broadcaster
            .publish(
                &self.project_id,
                EventEnvelope::complete(
                    self.request_type,
                    &ExecutionComplete {
                        status: if success {
                            CompletionStatus::Ok
                        } else {
                            CompletionStatus::Failed
                        },
                        session_id: self.session_id.clone(),
                        error,
                        request_id: Some(self.request_id.clone()),
                    },
                ),
            )
            .await;
    }

    /// Drain adapter events until the terminal result (or a guard trips);
    /// returns the execution verdict
    async fn consume(
        &self,
        coalescer: &mut StreamCoalescer,
        events: &mut mpsc::Receiver<AdapterEvent>,
    ) -> (bool, Option<String>) {
        let idle_timeout = self.config.adapter.idle_timeout();

        loop {
            tokio::select! {
                event = events.recv() => match event {
                    Some(AdapterEvent::Output { line }) => {
                        tracing::debug!(session = %self.session_id, "agent output: {}", line);
                    }
                    Some(AdapterEvent::Message {
                        role: MessageRole::Assistant,
                        message_type: MessageType::Chat,
                        content,
                        ..
                    }) => {
                        let envelope = coalescer.add_delta(&content);
                        self.broadcaster.publish(&self.project_id, envelope).await;
                    }
                    Some(AdapterEvent::Message { role, message_type, content, metadata }) => {
                        if let Err(e) = self
                            .discrete_message(coalescer, role, message_type, content, metadata)
                            .await
                        {
                            return (false, Some(e.to_string()));
                        }
                    }
                    Some(AdapterEvent::Result { success, error }) => {
                        return (success, error);
                    }
                    None => {
                        // Adapter never emitted a result: protocol violation
                        let e = RelayError::AdapterProtocol(
                            "adapter stream ended without a result".to_string(),
                        );
                        tracing::error!(session = %self.session_id, "{}", e);
                        return (false, Some(e.to_string()));
                    }
                },
                _ = tokio::time::sleep_until(coalescer.next_deadline()), if coalescer.has_pending() => {
                    match coalescer.commit().await {
                        Ok(Some((_, envelope))) => {
                            self.broadcaster.publish(&self.project_id, envelope).await;
                        }
                        Ok(None) => {}
                        Err(e) => return (false, Some(e.to_string())),
                    }
                }
                _ = tokio::time::sleep(idle_timeout) => {
                    let e = RelayError::AdapterProtocol(format!(
                        "no adapter event within {:?}, synthesizing failure",
                        idle_timeout
                    ));
                    tracing::error!(session = %self.session_id, "{}", e);
                    return (false, Some(e.to_string()));
                }
            }
        }
    }

    /// Persist and broadcast a discrete (non-buffered) conversational event,
    /// forcing an implicit commit of any pending prose first
    async fn discrete_message(
        &self,
        coalescer: &mut StreamCoalescer,
        role: MessageRole,
        message_type: MessageType,
        content: String,
        metadata: serde_json::Value,
    ) -> Result<()> {
        if let Some((_, envelope)) = coalescer.commit().await? {
            self.broadcaster.publish(&self.project_id, envelope).await;
        }

        let message = Message::new(&self.project_id, role, message_type, content)
            .with_session(self.session_id.clone())
            .with_conversation(self.conversation_id.clone())
            .with_source_tag(self.source_tag.clone())
            .with_metadata(metadata);
        self.store.append_message(&message).await?;

        self.broadcaster
            .publish(&self.project_id, EventEnvelope::message(&message))
            .await;
        Ok(())
    }

    /// Surface a failure as a conversation-visible error message
    async fn surface_error(&self, detail: &str) {
        let message = Message::new(
            &self.project_id,
            MessageRole::System,
            MessageType::Error,
            RelayError::Execution(detail.to_string()).to_string(),
        )
        .with_session(self.session_id.clone())
        .with_conversation(self.conversation_id.clone())
        .with_source_tag(self.source_tag.clone());

        if let Err(e) = self.store.append_message(&message).await {
            tracing::error!(session = %self.session_id, error = %e, "failed to persist error message");
            return;
        }
        self.broadcaster
            .publish(&self.project_id, EventEnvelope::message(&message))
            .await;
    }
}
