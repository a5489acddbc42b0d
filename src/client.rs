//! Viewer-side live feed client
//!
//! Maintains a WebSocket subscription to one project's event feed, with
//! automatic reconnect (capped exponential backoff), REST backfill merge
//! after every (re)connect, and a polling fallback that consults the request
//! ledger until the feed delivers its first event. `ConversationView` is the
//! reconciliation core: it folds envelopes and backfill pages into one
//! deduplicated conversation, so replaying overlapping history is harmless.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::time::{interval, MissedTickBehavior};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_util::sync::CancellationToken;

use crate::config::{BackoffConfig, RelayConfig};
use crate::error::{RelayError, Result};
use crate::types::{
    EventEnvelope, Message, RequestSummary, Session, StreamCommit, StreamDelta,
};

/// Connection state of the live feed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedState {
    /// Attempting to establish (or re-establish) the WebSocket
    Connecting,
    /// Feed attached and receiving events
    Open,
    /// Intentionally closed; no reconnect will follow
    Closed,
}

/// Everything the feed surfaces to its consumer
#[derive(Debug, Clone)]
pub enum FeedEvent {
    StateChanged(FeedState),
    /// Committed history fetched after a (re)connect
    Backfill(Vec<Message>),
    /// One live envelope
    Envelope(EventEnvelope),
    /// Ledger summary from the polling fallback
    RequestSummary(RequestSummary),
}

// ============================================================================
// Conversation reconciliation
// ============================================================================

#[derive(Debug, Default)]
struct PendingStream {
    last_seq: u64,
    content: String,
    /// A sequence gap was observed; the buffer is no longer trustworthy and
    /// only the commit is authoritative
    broken: bool,
}

/// Client-side view of one project conversation
///
/// Messages are deduplicated by id, so the same message arriving via both a
/// commit envelope and a backfill page lands exactly once. In-progress
/// streams are tracked separately and resolved by their commit.
#[derive(Debug, Default)]
pub struct ConversationView {
    messages: Vec<Message>,
    seen: HashSet<String>,
    pending: HashMap<String, PendingStream>,
    active_execution: bool,
}

impl ConversationView {
    pub fn new() -> Self {
        Self::default()
    }

    /// Committed messages in display order
    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    /// Concatenated text of one in-progress stream, if trustworthy
    pub fn pending_text(&self, stream_id: &str) -> Option<&str> {
        self.pending
            .get(stream_id)
            .filter(|p| !p.broken)
            .map(|p| p.content.as_str())
    }

    /// Whether an execution is currently in flight per the live feed
    pub fn has_active_execution(&self) -> bool {
        self.active_execution
    }

    /// Fold one live envelope into the view
    pub fn apply(&mut self, envelope: &EventEnvelope) -> Result<()> {
        match envelope.event_type.as_str() {
            "message" => {
                let message: Message = serde_json::from_value(envelope.data.clone())?;
                self.insert(message);
            }
            "message_delta" => {
                let delta: StreamDelta = serde_json::from_value(envelope.data.clone())?;
                let pending = self.pending.entry(delta.stream_id.clone()).or_default();
                if delta.seq == pending.last_seq + 1 {
                    pending.content.push_str(&delta.content_delta);
                    pending.last_seq = delta.seq;
                } else {
                    tracing::warn!(
                        stream = %delta.stream_id,
                        expected = pending.last_seq + 1,
                        got = delta.seq,
                        "sequence gap in stream, waiting for commit"
                    );
                    pending.broken = true;
                    pending.last_seq = delta.seq;
                }
            }
            "message_commit" => {
                let commit: StreamCommit = serde_json::from_value(envelope.data.clone())?;
                self.pending.remove(&commit.stream_id);
                let mut message = Message::new(
                    String::new(),
                    commit.role,
                    commit.message_type,
                    commit.content_full,
                );
                message.id = commit.message_id;
                message.created_at = commit.created_at;
                message.conversation_id = commit.conversation_id;
                message.session_id = commit.session_id;
                self.insert(message);
            }
            "act_start" | "chat_start" => self.active_execution = true,
            "act_complete" | "chat_complete" => self.active_execution = false,
            "project_status" => {}
            other => {
                tracing::debug!(event_type = other, "ignoring unknown envelope type");
            }
        }
        Ok(())
    }

    /// Merge a backfill page into the view
    ///
    /// The durable record is authoritative: an already-seen id has its entry
    /// replaced, since a message materialized from a commit envelope lacks
    /// fields the store carries (project id, metadata, source tag).
    pub fn merge_backfill(&mut self, page: Vec<Message>) {
        for message in page {
            if self.seen.contains(&message.id) {
                if let Some(existing) = self.messages.iter_mut().find(|m| m.id == message.id) {
                    *existing = message;
                }
            } else {
                self.insert(message);
            }
        }
        self.sort();
    }

    fn insert(&mut self, message: Message) {
        if !self.seen.insert(message.id.clone()) {
            return;
        }
        self.messages.push(message);
        self.sort();
    }

    fn sort(&mut self) {
        self.messages
            .sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
    }
}

// ============================================================================
// Live feed driver
// ============================================================================

enum ConnectionEnd {
    Cancelled,
    Dropped,
}

/// Reconnecting feed client for one project
pub struct LiveFeed {
    http: reqwest::Client,
    base_url: String,
    project_id: String,
    backoff: BackoffConfig,
    handshake_timeout: Duration,
    poll_interval: Duration,
    cancel: CancellationToken,
}

impl LiveFeed {
    /// `base_url` is the server's HTTP origin, e.g. `http://127.0.0.1:8787`
    pub fn new(base_url: impl Into<String>, project_id: impl Into<String>, config: &RelayConfig) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            project_id: project_id.into(),
            backoff: config.backoff.clone(),
            handshake_timeout: config.handshake_timeout(),
            poll_interval: config.poll_interval(),
            cancel: CancellationToken::new(),
        }
    }

    /// Token that stops the feed; a cancelled feed closes and stays closed
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Intentionally close the feed; no reconnect follows
    pub fn close(&self) {
        self.cancel.cancel();
    }

    fn ws_url(&self) -> String {
        let origin = self
            .base_url
            .replacen("https://", "wss://", 1)
            .replacen("http://", "ws://", 1);
        format!("{}/ws/projects/{}", origin, self.project_id)
    }

    fn api_url(&self, tail: &str) -> String {
        format!("{}/api/projects/{}/{}", self.base_url, self.project_id, tail)
    }

    /// Fetch the committed conversation history
    pub async fn backfill(&self, conversation_id: Option<&str>) -> Result<Vec<Message>> {
        let mut request = self.http.get(self.api_url("messages"));
        if let Some(conv) = conversation_id {
            request = request.query(&[("conversation_id", conv)]);
        }
        let response = request
            .send()
            .await
            .map_err(|e| RelayError::Transport(e.to_string()))?
            .error_for_status()
            .map_err(|e| RelayError::Transport(e.to_string()))?;
        response
            .json()
            .await
            .map_err(|e| RelayError::Transport(e.to_string()))
    }

    /// Ledger summary of open requests
    pub async fn active_requests(&self) -> Result<RequestSummary> {
        self.get_json(self.api_url("requests/active")).await
    }

    /// The project's active session, if any
    pub async fn active_session(&self) -> Result<Option<Session>> {
        self.get_json(self.api_url("sessions/active")).await
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, url: String) -> Result<T> {
        self.http
            .get(url)
            .send()
            .await
            .map_err(|e| RelayError::Transport(e.to_string()))?
            .error_for_status()
            .map_err(|e| RelayError::Transport(e.to_string()))?
            .json()
            .await
            .map_err(|e| RelayError::Transport(e.to_string()))
    }

    /// Drive the feed until cancelled, emitting `FeedEvent`s to `events`
    ///
    /// Each connection attempt that fails (or a connection that drops) backs
    /// off exponentially with a cap; a successful attach resets the backoff.
    pub async fn run(&self, events: mpsc::UnboundedSender<FeedEvent>) {
        let mut attempt = 0u32;

        loop {
            if self.cancel.is_cancelled() {
                break;
            }

            let _ = events.send(FeedEvent::StateChanged(FeedState::Connecting));
            match self.connect_once(&events).await {
                Ok(ConnectionEnd::Cancelled) => break,
                Ok(ConnectionEnd::Dropped) => {
                    attempt = 0;
                    tracing::info!(project = %self.project_id, "feed dropped, reconnecting");
                }
                Err(e) => {
                    tracing::warn!(project = %self.project_id, error = %e, "feed connect failed");
                }
            }

            let delay = self.backoff.delay_for_attempt(attempt);
            attempt = attempt.saturating_add(1);
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        let _ = events.send(FeedEvent::StateChanged(FeedState::Closed));
    }

    async fn connect_once(
        &self,
        events: &mpsc::UnboundedSender<FeedEvent>,
    ) -> Result<ConnectionEnd> {
        let url = self.ws_url();
        let (socket, _) = tokio::time::timeout(self.handshake_timeout, connect_async(url.as_str()))
            .await
            .map_err(|_| RelayError::Timeout(format!("handshake to {} timed out", url)))?
            .map_err(|e| RelayError::Transport(e.to_string()))?;

        let _ = events.send(FeedEvent::StateChanged(FeedState::Open));
        tracing::info!(project = %self.project_id, "live feed connected");

        // Reconcile anything missed while detached
        match self.backfill(None).await {
            Ok(page) => {
                let _ = events.send(FeedEvent::Backfill(page));
            }
            Err(e) => {
                tracing::warn!(project = %self.project_id, error = %e, "backfill failed");
            }
        }

        let (mut sink, mut stream) = socket.split();
        let mut poll = interval(self.poll_interval);
        poll.set_missed_tick_behavior(MissedTickBehavior::Delay);
        poll.tick().await;
        // Poll the ledger only until the feed delivers its first event or
        // the ledger shows nothing running
        let mut poll_ledger = true;

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    let _ = sink.send(WsMessage::Close(None)).await;
                    return Ok(ConnectionEnd::Cancelled);
                }
                frame = stream.next() => {
                    match frame {
                        Some(Ok(WsMessage::Text(text))) => {
                            poll_ledger = false;
                            match serde_json::from_str::<EventEnvelope>(&text) {
                                Ok(envelope) => {
                                    let _ = events.send(FeedEvent::Envelope(envelope));
                                }
                                Err(e) => {
                                    tracing::warn!(error = %e, "unparseable feed frame");
                                }
                            }
                        }
                        Some(Ok(WsMessage::Ping(payload))) => {
                            let _ = sink.send(WsMessage::Pong(payload)).await;
                        }
                        Some(Ok(WsMessage::Close(_))) | None => {
                            return Ok(ConnectionEnd::Dropped);
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            tracing::debug!(error = %e, "feed socket error");
                            return Ok(ConnectionEnd::Dropped);
                        }
                    }
                }
                _ = poll.tick(), if poll_ledger => {
                    // Quiet feed: consult the ledger so a stalled socket is
                    // not mistaken for an idle project
                    match self.active_requests().await {
                        Ok(summary) => {
                            if !summary.has_active_requests {
                                poll_ledger = false;
                            }
                            let _ = events.send(FeedEvent::RequestSummary(summary));
                        }
                        Err(e) => {
                            tracing::debug!(error = %e, "polling fallback failed");
                        }
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{MessageRole, MessageType};
    use chrono::Utc;

    fn delta(stream_id: &str, seq: u64, text: &str) -> EventEnvelope {
        EventEnvelope::delta(&StreamDelta {
            stream_id: stream_id.to_string(),
            seq,
            role: MessageRole::Assistant,
            message_type: MessageType::Chat,
            content_delta: text.to_string(),
        })
    }

    fn commit(stream_id: &str, message_id: &str, full: &str) -> EventEnvelope {
        EventEnvelope::commit(&StreamCommit {
            stream_id: stream_id.to_string(),
            message_id: message_id.to_string(),
            created_at: Utc::now(),
            role: MessageRole::Assistant,
            message_type: MessageType::Chat,
            content_full: full.to_string(),
            conversation_id: Some("conv-1".to_string()),
            session_id: Some("sess-1".to_string()),
        })
    }

    #[test]
    fn test_deltas_accumulate_until_commit() {
        let mut view = ConversationView::new();
        view.apply(&delta("stream-1", 1, "Hel")).unwrap();
        view.apply(&delta("stream-1", 2, "lo ")).unwrap();
        view.apply(&delta("stream-1", 3, "world")).unwrap();

        assert_eq!(view.pending_text("stream-1"), Some("Hello world"));
        assert!(view.messages().is_empty());

        view.apply(&commit("stream-1", "msg-1", "Hello world")).unwrap();
        assert_eq!(view.pending_text("stream-1"), None);
        assert_eq!(view.messages().len(), 1);
        assert_eq!(view.messages()[0].content, "Hello world");
        assert_eq!(view.messages()[0].id, "msg-1");
    }

    #[test]
    fn test_sequence_gap_invalidates_pending_but_commit_recovers() {
        let mut view = ConversationView::new();
        view.apply(&delta("stream-1", 1, "Hel")).unwrap();
        // seq 2 lost in transit
        view.apply(&delta("stream-1", 3, "world")).unwrap();

        assert_eq!(view.pending_text("stream-1"), None);

        view.apply(&commit("stream-1", "msg-1", "Hello world")).unwrap();
        assert_eq!(view.messages()[0].content, "Hello world");
    }

    #[test]
    fn test_commit_and_backfill_deduplicate() {
        let mut view = ConversationView::new();
        view.apply(&commit("stream-1", "msg-1", "once")).unwrap();

        // The same message arrives again via REST backfill
        let mut duplicate = Message::new("proj-1", MessageRole::Assistant, MessageType::Chat, "once");
        duplicate.id = "msg-1".to_string();
        view.merge_backfill(vec![duplicate]);

        assert_eq!(view.messages().len(), 1);
    }

    #[test]
    fn test_backfill_enriches_commit_materialized_message() {
        let mut view = ConversationView::new();
        view.apply(&commit("stream-1", "msg-1", "the answer")).unwrap();
        // A commit envelope carries no project id or metadata
        assert_eq!(view.messages()[0].project_id, "");

        let mut durable =
            Message::new("proj-1", MessageRole::Assistant, MessageType::Chat, "the answer")
                .with_session("sess-1")
                .with_source_tag("claude")
                .with_metadata(serde_json::json!({"tokens": 42}));
        durable.id = "msg-1".to_string();
        view.merge_backfill(vec![durable]);

        // The durable copy replaced the envelope-derived one, still once
        assert_eq!(view.messages().len(), 1);
        assert_eq!(view.messages()[0].project_id, "proj-1");
        assert_eq!(view.messages()[0].source_tag.as_deref(), Some("claude"));
        assert_eq!(view.messages()[0].metadata["tokens"], 42);
    }

    #[test]
    fn test_backfill_ordering() {
        let mut view = ConversationView::new();
        let mut older = Message::new("proj-1", MessageRole::User, MessageType::User, "first");
        older.created_at = Utc::now() - chrono::Duration::seconds(10);
        let newer = Message::new("proj-1", MessageRole::Assistant, MessageType::Chat, "second");

        view.merge_backfill(vec![newer, older]);
        assert_eq!(view.messages()[0].content, "first");
        assert_eq!(view.messages()[1].content, "second");
    }

    #[test]
    fn test_execution_activity_tracking() {
        let mut view = ConversationView::new();
        assert!(!view.has_active_execution());

        let start = EventEnvelope::start(
            crate::types::RequestType::Act,
            &crate::types::ExecutionStart {
                session_id: "sess-1".to_string(),
                instruction: "do it".to_string(),
                request_id: None,
                stream_id: "stream-1".to_string(),
            },
        );
        view.apply(&start).unwrap();
        assert!(view.has_active_execution());

        let complete = EventEnvelope::complete(
            crate::types::RequestType::Act,
            &crate::types::ExecutionComplete {
                status: crate::types::CompletionStatus::Ok,
                session_id: "sess-1".to_string(),
                error: None,
                request_id: None,
            },
        );
        view.apply(&complete).unwrap();
        assert!(!view.has_active_execution());
    }

    #[test]
    fn test_unknown_envelope_is_ignored() {
        let mut view = ConversationView::new();
        let odd = EventEnvelope {
            event_type: "future_thing".to_string(),
            data: serde_json::json!({}),
            timestamp: Utc::now(),
        };
        view.apply(&odd).unwrap();
        assert!(view.messages().is_empty());
    }

    #[test]
    fn test_ws_url_derivation() {
        let feed = LiveFeed::new("http://127.0.0.1:8787/", "proj-1", &RelayConfig::default());
        assert_eq!(feed.ws_url(), "ws://127.0.0.1:8787/ws/projects/proj-1");

        let feed = LiveFeed::new("https://relay.example.com", "proj-2", &RelayConfig::default());
        assert_eq!(feed.ws_url(), "wss://relay.example.com/ws/projects/proj-2");
    }
}
