//! Stream coalescer: turns a firehose of text increments into low-latency
//! delta events plus a bounded number of durable writes
//!
//! One coalescer exists per execution and is exclusively owned by that
//! execution's consumer task, so no locking is involved. Deltas are
//! broadcast immediately; the buffered text is persisted as a single
//! `Message` on commit. Commits are deferred to a minimum inter-commit
//! interval, forced when a discrete event interleaves, and always forced
//! when the adapter result arrives.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;

use crate::config::CommitRetryConfig;
use crate::error::{RelayError, Result};
use crate::store::ProjectStore;
use crate::types::{
    prefixed_id, EventEnvelope, Message, MessageRole, MessageType, StreamCommit, StreamDelta,
};

/// Delta-buffering, periodic-commit converter for one execution's
/// assistant-text channel
pub struct StreamCoalescer {
    store: Arc<dyn ProjectStore>,
    retry: CommitRetryConfig,
    min_interval: Duration,

    project_id: String,
    session_id: String,
    conversation_id: Option<String>,
    source_tag: Option<String>,

    stream_id: String,
    buffer: String,
    seq: u64,
    last_commit: Instant,
}

impl StreamCoalescer {
    pub fn new(
        store: Arc<dyn ProjectStore>,
        retry: CommitRetryConfig,
        min_interval: Duration,
        project_id: impl Into<String>,
        session_id: impl Into<String>,
        conversation_id: Option<String>,
        source_tag: Option<String>,
    ) -> Self {
        Self {
            store,
            retry,
            min_interval,
            project_id: project_id.into(),
            session_id: session_id.into(),
            conversation_id,
            source_tag,
            stream_id: prefixed_id("stream"),
            buffer: String::new(),
            seq: 0,
            last_commit: Instant::now(),
        }
    }

    /// Current stream id (rotates after every commit)
    pub fn stream_id(&self) -> &str {
        &self.stream_id
    }

    /// Whether uncommitted text is buffered
    pub fn has_pending(&self) -> bool {
        !self.buffer.is_empty()
    }

    /// Earliest instant at which a periodic commit should run
    pub fn next_deadline(&self) -> Instant {
        self.last_commit + self.min_interval
    }

    /// Whether the minimum inter-commit interval has elapsed with text pending
    pub fn commit_due(&self) -> bool {
        self.has_pending() && Instant::now() >= self.next_deadline()
    }

    /// Append a text fragment and produce the delta event to broadcast
    ///
    /// Sequence numbers increase monotonically per stream, starting at 1.
    pub fn add_delta(&mut self, text: &str) -> EventEnvelope {
        self.buffer.push_str(text);
        self.seq += 1;
        EventEnvelope::delta(&StreamDelta {
            stream_id: self.stream_id.clone(),
            seq: self.seq,
            role: MessageRole::Assistant,
            message_type: MessageType::Chat,
            content_delta: text.to_string(),
        })
    }

    /// Persist the buffered text as one `Message` and close this stream
    ///
    /// Idempotent: an empty buffer is a no-op returning `None`. On success
    /// the buffer is cleared and the stream id rotates, so a stream never
    /// sees a second commit. Persistence failures are retried per the
    /// configured policy before propagating.
    pub async fn commit(&mut self) -> Result<Option<(Message, EventEnvelope)>> {
        if self.buffer.is_empty() {
            return Ok(None);
        }

        let mut message = Message::new(
            self.project_id.clone(),
            MessageRole::Assistant,
            MessageType::Chat,
            std::mem::take(&mut self.buffer),
        )
        .with_session(self.session_id.clone());
        if let Some(conv) = &self.conversation_id {
            message = message.with_conversation(conv.clone());
        }
        if let Some(tag) = &self.source_tag {
            message = message.with_source_tag(tag.clone());
        }

        if let Err(e) = self.persist_with_retry(&message).await {
            // Leave the content in place so a later forced commit can retry
            self.buffer = message.content;
            return Err(e);
        }

        let commit = StreamCommit {
            stream_id: self.stream_id.clone(),
            message_id: message.id.clone(),
            created_at: message.created_at,
            role: message.role,
            message_type: message.message_type,
            content_full: message.content.clone(),
            conversation_id: message.conversation_id.clone(),
            session_id: message.session_id.clone(),
        };
        let envelope = EventEnvelope::commit(&commit);

        tracing::debug!(
            stream = %self.stream_id,
            message = %message.id,
            seq = self.seq,
            bytes = message.content.len(),
            "committed stream buffer"
        );

        // The commit is terminal for this stream: rotate for any further text
        self.stream_id = prefixed_id("stream");
        self.seq = 0;
        self.last_commit = Instant::now();

        Ok(Some((message, envelope)))
    }

    async fn persist_with_retry(&self, message: &Message) -> Result<()> {
        let mut attempt = 0u32;
        loop {
            match self.store.append_message(message).await {
                Ok(()) => return Ok(()),
                Err(e) if attempt < self.retry.max_retries => {
                    let delay = self.retry.delay_for_attempt(attempt);
                    tracing::warn!(
                        message = %message.id,
                        attempt = attempt + 1,
                        max = self.retry.max_retries,
                        error = %e,
                        "commit persistence failed, retrying in {:?}",
                        delay
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => {
                    return Err(RelayError::Persistence(format!(
                        "Commit failed after {} attempts: {}",
                        attempt + 1,
                        e
                    )));
                }
            }
        }
    }
}
