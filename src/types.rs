//! Core data model and wire types for the relay pipeline
//!
//! All wire types use snake_case JSON serialization for compatibility with
//! the subscriber event protocol. Broadcast events travel inside an
//! [`EventEnvelope`]: `{ "type": ..., "data": ..., "timestamp": ISO-8601 }`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Generate a prefixed unique id (e.g. `sess-<uuid>`)
pub fn prefixed_id(prefix: &str) -> String {
    format!("{}-{}", prefix, uuid::Uuid::new_v4())
}

// ============================================================================
// Session
// ============================================================================

/// Lifecycle state of one agent execution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    /// Execution in progress
    Active,
    /// Adapter emitted a successful result
    Completed,
    /// Adapter emitted a failed result, or the pipeline gave up
    Failed,
}

impl SessionStatus {
    /// Whether this status is terminal (no further transitions allowed)
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionStatus::Completed | SessionStatus::Failed)
    }
}

/// One agent execution against a project
///
/// Created once per submitted instruction; its terminal status is set
/// exactly once when the adapter result arrives.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    /// Unique session identifier (`sess-<uuid>`)
    pub id: String,

    /// Project this execution runs against
    pub project_id: String,

    /// Which agent CLI produced this session (e.g. "claude", "cursor")
    pub cli_type: String,

    /// The instruction that started the execution
    pub instruction: String,

    /// Current lifecycle state
    pub status: SessionStatus,

    /// When the execution started
    pub started_at: DateTime<Utc>,

    /// When the execution reached a terminal state
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl Session {
    /// Create a new active session with a generated id
    pub fn new(
        project_id: impl Into<String>,
        cli_type: impl Into<String>,
        instruction: impl Into<String>,
    ) -> Self {
        Self {
            id: prefixed_id("sess"),
            project_id: project_id.into(),
            cli_type: cli_type.into(),
            instruction: instruction.into(),
            status: SessionStatus::Active,
            started_at: Utc::now(),
            completed_at: None,
        }
    }
}

// ============================================================================
// Message
// ============================================================================

/// Conversational role of a message author
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageRole {
    User,
    Assistant,
    System,
    Tool,
}

/// Kind of conversational unit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    /// Free-form prose (user or assistant)
    Chat,
    /// A tool invocation notice
    ToolUse,
    /// Output of a tool invocation
    ToolResult,
    /// System notice
    System,
    /// Conversation-visible error
    Error,
    /// Echo of the submitted user instruction
    User,
}

/// One immutable entry in a project conversation
///
/// `created_at` defines global display order within a conversation. Exactly
/// one message is produced per committed coalescer flush, and one per
/// discrete adapter event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    /// Unique message identifier (`msg-<uuid>`)
    pub id: String,

    /// Project this message belongs to
    pub project_id: String,

    /// Author role
    pub role: MessageRole,

    /// Kind of conversational unit
    pub message_type: MessageType,

    /// Message body
    pub content: String,

    /// Arbitrary JSON metadata (tool arguments, exit codes, ...)
    #[serde(default)]
    pub metadata: serde_json::Value,

    /// Message this one responds to (tool_result → tool_use)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_message_id: Option<String>,

    /// Session that produced this message
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,

    /// Conversation grouping within the project
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<String>,

    /// Origin tag (adapter name) for display filtering
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_tag: Option<String>,

    /// Creation time; defines display order
    pub created_at: DateTime<Utc>,
}

impl Message {
    /// Create a new message with a generated id and current timestamp
    pub fn new(
        project_id: impl Into<String>,
        role: MessageRole,
        message_type: MessageType,
        content: impl Into<String>,
    ) -> Self {
        Self {
            id: prefixed_id("msg"),
            project_id: project_id.into(),
            role,
            message_type,
            content: content.into(),
            metadata: serde_json::Value::Null,
            parent_message_id: None,
            session_id: None,
            conversation_id: None,
            source_tag: None,
            created_at: Utc::now(),
        }
    }

    /// Attach a session id
    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    /// Attach a conversation id
    pub fn with_conversation(mut self, conversation_id: impl Into<String>) -> Self {
        self.conversation_id = Some(conversation_id.into());
        self
    }

    /// Attach metadata
    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }

    /// Attach a parent message id
    pub fn with_parent(mut self, parent_id: impl Into<String>) -> Self {
        self.parent_message_id = Some(parent_id.into());
        self
    }

    /// Attach a source tag
    pub fn with_source_tag(mut self, tag: impl Into<String>) -> Self {
        self.source_tag = Some(tag.into());
        self
    }
}

// ============================================================================
// UserRequest
// ============================================================================

/// Kind of submitted instruction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestType {
    /// Instruction that modifies the project
    Act,
    /// Conversational question, no modification expected
    Chat,
}

impl RequestType {
    /// Broadcast event type emitted when an execution of this kind starts
    pub fn start_event(&self) -> &'static str {
        match self {
            RequestType::Act => "act_start",
            RequestType::Chat => "chat_start",
        }
    }

    /// Broadcast event type emitted when an execution of this kind concludes
    pub fn complete_event(&self) -> &'static str {
        match self {
            RequestType::Act => "act_complete",
            RequestType::Chat => "chat_complete",
        }
    }
}

/// User-facing tracking handle for one submitted instruction
///
/// Carries an identifier independent of session/stream ids so a client can
/// track "my request" across reconnects. Closed exactly once when the
/// session concludes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserRequest {
    /// Unique request identifier (`req-<uuid>`)
    pub id: String,

    /// Project the instruction targets
    pub project_id: String,

    /// The persisted echo of the user's instruction
    pub user_message_id: String,

    /// Session executing this request
    pub session_id: String,

    /// The submitted instruction text
    pub instruction: String,

    /// Act or chat
    pub request_type: RequestType,

    /// Whether the request has been closed
    pub is_completed: bool,

    /// Success flag, set when closed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_successful: Option<bool>,

    /// Submission time
    pub created_at: DateTime<Utc>,

    /// Close time
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl UserRequest {
    /// Create a new open request with a generated id
    pub fn new(
        project_id: impl Into<String>,
        user_message_id: impl Into<String>,
        session_id: impl Into<String>,
        instruction: impl Into<String>,
        request_type: RequestType,
    ) -> Self {
        Self {
            id: prefixed_id("req"),
            project_id: project_id.into(),
            user_message_id: user_message_id.into(),
            session_id: session_id.into(),
            instruction: instruction.into(),
            request_type,
            is_completed: false,
            is_successful: None,
            created_at: Utc::now(),
            completed_at: None,
        }
    }
}

/// Summary of open requests for a project, served to the polling fallback
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RequestSummary {
    pub has_active_requests: bool,
    pub active_count: usize,
}

// ============================================================================
// Broadcast envelope and payloads
// ============================================================================

/// Incremental content fragment for one in-progress stream
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamDelta {
    pub stream_id: String,
    pub seq: u64,
    pub role: MessageRole,
    pub message_type: MessageType,
    pub content_delta: String,
}

/// Terminal event for one stream: the full concatenated content, persisted
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamCommit {
    pub stream_id: String,
    pub message_id: String,
    pub created_at: DateTime<Utc>,
    pub role: MessageRole,
    pub message_type: MessageType,
    pub content_full: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
}

/// Payload for `act_start` / `chat_start`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionStart {
    pub session_id: String,
    pub instruction: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    pub stream_id: String,
}

/// Terminal status carried by `act_complete` / `chat_complete`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompletionStatus {
    Ok,
    Failed,
}

/// Payload for `act_complete` / `chat_complete`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionComplete {
    pub status: CompletionStatus,
    pub session_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
}

/// Wire envelope delivered to every attached subscriber
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventEnvelope {
    /// Event type tag (`message`, `message_delta`, `message_commit`,
    /// `act_start`, `act_complete`, `chat_start`, `chat_complete`,
    /// `project_status`)
    #[serde(rename = "type")]
    pub event_type: String,

    /// Type-specific payload
    pub data: serde_json::Value,

    /// Emission time
    pub timestamp: DateTime<Utc>,
}

impl EventEnvelope {
    fn wrap(event_type: &str, data: serde_json::Value) -> Self {
        Self {
            event_type: event_type.to_string(),
            data,
            timestamp: Utc::now(),
        }
    }

    /// A committed discrete message
    pub fn message(message: &Message) -> Self {
        Self::wrap("message", serde_json::to_value(message).unwrap_or_default())
    }

    /// An incremental stream fragment
    pub fn delta(delta: &StreamDelta) -> Self {
        Self::wrap(
            "message_delta",
            serde_json::to_value(delta).unwrap_or_default(),
        )
    }

    /// A stream commit
    pub fn commit(commit: &StreamCommit) -> Self {
        Self::wrap(
            "message_commit",
            serde_json::to_value(commit).unwrap_or_default(),
        )
    }

    /// Execution start (`act_start` or `chat_start`)
    pub fn start(request_type: RequestType, start: &ExecutionStart) -> Self {
        Self::wrap(
            request_type.start_event(),
            serde_json::to_value(start).unwrap_or_default(),
        )
    }

    /// Execution completion (`act_complete` or `chat_complete`)
    pub fn complete(request_type: RequestType, complete: &ExecutionComplete) -> Self {
        Self::wrap(
            request_type.complete_event(),
            serde_json::to_value(complete).unwrap_or_default(),
        )
    }

    /// Project-level status notice
    pub fn project_status(status: &str, message: Option<&str>) -> Self {
        Self::wrap(
            "project_status",
            serde_json::json!({ "status": status, "message": message }),
        )
    }
}
