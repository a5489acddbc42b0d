//! Durable project conversation store
//!
//! Provides pluggable persistence via the `ProjectStore` trait: an
//! append-only message log plus the session and request ledgers, keyed by
//! project. Terminal transitions (session finish, request close) are
//! compare-and-set operations returning whether the write took effect, which
//! is what the ledger uses to enforce terminal-once semantics.
//!
//! ## Implementations
//!
//! - `FileProjectStore`: one JSON document per project, written atomically
//!   (temp file + rename)
//! - `MemoryProjectStore`: in-memory, for tests and single-run use

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, RwLock};

use crate::error::{RelayError, Result};
use crate::types::{Message, Session, SessionStatus, UserRequest};

// ============================================================================
// Store trait
// ============================================================================

/// Durable storage for conversations, sessions, and requests
#[async_trait::async_trait]
pub trait ProjectStore: Send + Sync {
    /// Append one immutable message to the project's conversation log
    async fn append_message(&self, message: &Message) -> Result<()>;

    /// List messages for a project in `created_at` order, optionally
    /// filtered to one conversation
    async fn list_messages(
        &self,
        project_id: &str,
        conversation_id: Option<&str>,
    ) -> Result<Vec<Message>>;

    /// Record a newly created session
    async fn create_session(&self, session: &Session) -> Result<()>;

    /// Load a session by id
    async fn get_session(&self, id: &str) -> Result<Option<Session>>;

    /// The project's currently active session, if any
    async fn active_session(&self, project_id: &str) -> Result<Option<Session>>;

    /// Move a session to a terminal status
    ///
    /// Returns `Ok(true)` if the transition was applied, `Ok(false)` if the
    /// session was already terminal (the write is ignored).
    async fn finish_session(
        &self,
        id: &str,
        status: SessionStatus,
        completed_at: DateTime<Utc>,
    ) -> Result<bool>;

    /// Record a newly opened user request
    async fn create_request(&self, request: &UserRequest) -> Result<()>;

    /// Load a request by id
    async fn get_request(&self, id: &str) -> Result<Option<UserRequest>>;

    /// Close a request, carrying the session's success flag
    ///
    /// Returns `Ok(true)` if the close was applied, `Ok(false)` if the
    /// request was already closed.
    async fn close_request(
        &self,
        id: &str,
        successful: bool,
        completed_at: DateTime<Utc>,
    ) -> Result<bool>;

    /// All open requests for a project
    async fn active_requests(&self, project_id: &str) -> Result<Vec<UserRequest>>;

    /// Health check — verify the backend is reachable and writable
    async fn health_check(&self) -> Result<()> {
        Ok(())
    }

    /// Backend name for diagnostics
    fn backend_name(&self) -> &str {
        "unknown"
    }
}

fn sort_by_created(messages: &mut [Message]) {
    messages.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
}

// ============================================================================
// File-backed store
// ============================================================================

/// Everything persisted for one project
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
struct ProjectRecord {
    #[serde(default)]
    messages: Vec<Message>,
    #[serde(default)]
    sessions: Vec<Session>,
    #[serde(default)]
    requests: Vec<UserRequest>,
}

/// File-backed store: one JSON document per project
///
/// ```text
/// relay-data/
///   proj-1.json
///   proj-2.json
/// ```
pub struct FileProjectStore {
    dir: PathBuf,
    /// Serializes read-modify-write cycles across tasks
    write_lock: Mutex<()>,
}

impl FileProjectStore {
    /// Create a store rooted at `dir`, creating the directory if needed
    pub async fn new<P: AsRef<Path>>(dir: P) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir).await.map_err(|e| {
            RelayError::Persistence(format!(
                "Failed to create store directory {}: {}",
                dir.display(),
                e
            ))
        })?;
        Ok(Self {
            dir,
            write_lock: Mutex::new(()),
        })
    }

    fn project_path(&self, project_id: &str) -> PathBuf {
        // Sanitize to prevent path traversal
        let safe = project_id.replace(['/', '\\'], "_").replace("..", "_");
        self.dir.join(format!("{}.json", safe))
    }

    async fn load_record(&self, project_id: &str) -> Result<ProjectRecord> {
        let path = self.project_path(project_id);
        if !path.exists() {
            return Ok(ProjectRecord::default());
        }
        let raw = fs::read_to_string(&path).await.map_err(|e| {
            RelayError::Persistence(format!("Failed to read {}: {}", path.display(), e))
        })?;
        serde_json::from_str(&raw).map_err(|e| {
            RelayError::Persistence(format!("Failed to parse {}: {}", path.display(), e))
        })
    }

    async fn save_record(&self, project_id: &str, record: &ProjectRecord) -> Result<()> {
        let path = self.project_path(project_id);
        let json = serde_json::to_string_pretty(record)?;

        // Write atomically: temp file, then rename
        let temp_path = path.with_extension("json.tmp");
        let mut file = fs::File::create(&temp_path).await.map_err(|e| {
            RelayError::Persistence(format!("Failed to create {}: {}", temp_path.display(), e))
        })?;
        file.write_all(json.as_bytes()).await.map_err(|e| {
            RelayError::Persistence(format!("Failed to write {}: {}", temp_path.display(), e))
        })?;
        file.sync_all().await.map_err(|e| {
            RelayError::Persistence(format!("Failed to sync {}: {}", temp_path.display(), e))
        })?;
        fs::rename(&temp_path, &path).await.map_err(|e| {
            RelayError::Persistence(format!("Failed to rename {}: {}", path.display(), e))
        })?;

        tracing::debug!(project = %project_id, path = %path.display(), "saved project record");
        Ok(())
    }

    async fn project_ids(&self) -> Result<Vec<String>> {
        let mut ids = Vec::new();
        let mut entries = fs::read_dir(&self.dir).await.map_err(|e| {
            RelayError::Persistence(format!("Failed to read {}: {}", self.dir.display(), e))
        })?;
        while let Some(entry) = entries.next_entry().await.map_err(RelayError::Io)? {
            let path = entry.path();
            if path.extension().is_some_and(|ext| ext == "json") {
                if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                    ids.push(stem.to_string());
                }
            }
        }
        Ok(ids)
    }

    /// Find the project record containing a session with `id`
    async fn find_session_project(&self, id: &str) -> Result<Option<String>> {
        for project_id in self.project_ids().await? {
            let record = self.load_record(&project_id).await?;
            if record.sessions.iter().any(|s| s.id == id) {
                return Ok(Some(project_id));
            }
        }
        Ok(None)
    }

    async fn find_request_project(&self, id: &str) -> Result<Option<String>> {
        for project_id in self.project_ids().await? {
            let record = self.load_record(&project_id).await?;
            if record.requests.iter().any(|r| r.id == id) {
                return Ok(Some(project_id));
            }
        }
        Ok(None)
    }
}

#[async_trait::async_trait]
impl ProjectStore for FileProjectStore {
    async fn append_message(&self, message: &Message) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let mut record = self.load_record(&message.project_id).await?;
        record.messages.push(message.clone());
        self.save_record(&message.project_id, &record).await
    }

    async fn list_messages(
        &self,
        project_id: &str,
        conversation_id: Option<&str>,
    ) -> Result<Vec<Message>> {
        let record = self.load_record(project_id).await?;
        let mut messages: Vec<Message> = record
            .messages
            .into_iter()
            .filter(|m| match conversation_id {
                Some(conv) => m.conversation_id.as_deref() == Some(conv),
                None => true,
            })
            .collect();
        sort_by_created(&mut messages);
        Ok(messages)
    }

    async fn create_session(&self, session: &Session) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let mut record = self.load_record(&session.project_id).await?;
        record.sessions.push(session.clone());
        self.save_record(&session.project_id, &record).await
    }

    async fn get_session(&self, id: &str) -> Result<Option<Session>> {
        let Some(project_id) = self.find_session_project(id).await? else {
            return Ok(None);
        };
        let record = self.load_record(&project_id).await?;
        Ok(record.sessions.into_iter().find(|s| s.id == id))
    }

    async fn active_session(&self, project_id: &str) -> Result<Option<Session>> {
        let record = self.load_record(project_id).await?;
        Ok(record
            .sessions
            .into_iter()
            .find(|s| s.status == SessionStatus::Active))
    }

    async fn finish_session(
        &self,
        id: &str,
        status: SessionStatus,
        completed_at: DateTime<Utc>,
    ) -> Result<bool> {
        let _guard = self.write_lock.lock().await;
        let Some(project_id) = self.find_session_project(id).await? else {
            return Err(RelayError::NotFound(format!("Session not found: {}", id)));
        };
        let mut record = self.load_record(&project_id).await?;
        let session = record
            .sessions
            .iter_mut()
            .find(|s| s.id == id)
            .ok_or_else(|| RelayError::NotFound(format!("Session not found: {}", id)))?;

        if session.status.is_terminal() {
            return Ok(false);
        }
        session.status = status;
        session.completed_at = Some(completed_at);
        self.save_record(&project_id, &record).await?;
        Ok(true)
    }

    async fn create_request(&self, request: &UserRequest) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let mut record = self.load_record(&request.project_id).await?;
        record.requests.push(request.clone());
        self.save_record(&request.project_id, &record).await
    }

    async fn get_request(&self, id: &str) -> Result<Option<UserRequest>> {
        let Some(project_id) = self.find_request_project(id).await? else {
            return Ok(None);
        };
        let record = self.load_record(&project_id).await?;
        Ok(record.requests.into_iter().find(|r| r.id == id))
    }

    async fn close_request(
        &self,
        id: &str,
        successful: bool,
        completed_at: DateTime<Utc>,
    ) -> Result<bool> {
        let _guard = self.write_lock.lock().await;
        let Some(project_id) = self.find_request_project(id).await? else {
            return Err(RelayError::NotFound(format!("Request not found: {}", id)));
        };
        let mut record = self.load_record(&project_id).await?;
        let request = record
            .requests
            .iter_mut()
            .find(|r| r.id == id)
            .ok_or_else(|| RelayError::NotFound(format!("Request not found: {}", id)))?;

        if request.is_completed {
            return Ok(false);
        }
        request.is_completed = true;
        request.is_successful = Some(successful);
        request.completed_at = Some(completed_at);
        self.save_record(&project_id, &record).await?;
        Ok(true)
    }

    async fn active_requests(&self, project_id: &str) -> Result<Vec<UserRequest>> {
        let record = self.load_record(project_id).await?;
        Ok(record
            .requests
            .into_iter()
            .filter(|r| !r.is_completed)
            .collect())
    }

    async fn health_check(&self) -> Result<()> {
        let probe = self.dir.join(".health_check");
        fs::write(&probe, b"ok").await.map_err(|e| {
            RelayError::Persistence(format!(
                "Store directory not writable: {}: {}",
                self.dir.display(),
                e
            ))
        })?;
        let _ = fs::remove_file(&probe).await;
        Ok(())
    }

    fn backend_name(&self) -> &str {
        "file"
    }
}

// ============================================================================
// In-memory store
// ============================================================================

#[derive(Default)]
struct MemoryInner {
    messages: Vec<Message>,
    sessions: HashMap<String, Session>,
    requests: HashMap<String, UserRequest>,
}

/// In-memory store for tests and single-run use
#[derive(Default)]
pub struct MemoryProjectStore {
    inner: RwLock<MemoryInner>,
}

impl MemoryProjectStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl ProjectStore for MemoryProjectStore {
    async fn append_message(&self, message: &Message) -> Result<()> {
        let mut inner = self.inner.write().await;
        inner.messages.push(message.clone());
        Ok(())
    }

    async fn list_messages(
        &self,
        project_id: &str,
        conversation_id: Option<&str>,
    ) -> Result<Vec<Message>> {
        let inner = self.inner.read().await;
        let mut messages: Vec<Message> = inner
            .messages
            .iter()
            .filter(|m| m.project_id == project_id)
            .filter(|m| match conversation_id {
                Some(conv) => m.conversation_id.as_deref() == Some(conv),
                None => true,
            })
            .cloned()
            .collect();
        sort_by_created(&mut messages);
        Ok(messages)
    }

    async fn create_session(&self, session: &Session) -> Result<()> {
        let mut inner = self.inner.write().await;
        inner.sessions.insert(session.id.clone(), session.clone());
        Ok(())
    }

    async fn get_session(&self, id: &str) -> Result<Option<Session>> {
        let inner = self.inner.read().await;
        Ok(inner.sessions.get(id).cloned())
    }

    async fn active_session(&self, project_id: &str) -> Result<Option<Session>> {
        let inner = self.inner.read().await;
        Ok(inner
            .sessions
            .values()
            .find(|s| s.project_id == project_id && s.status == SessionStatus::Active)
            .cloned())
    }

    async fn finish_session(
        &self,
        id: &str,
        status: SessionStatus,
        completed_at: DateTime<Utc>,
    ) -> Result<bool> {
        let mut inner = self.inner.write().await;
        let session = inner
            .sessions
            .get_mut(id)
            .ok_or_else(|| RelayError::NotFound(format!("Session not found: {}", id)))?;
        if session.status.is_terminal() {
            return Ok(false);
        }
        session.status = status;
        session.completed_at = Some(completed_at);
        Ok(true)
    }

    async fn create_request(&self, request: &UserRequest) -> Result<()> {
        let mut inner = self.inner.write().await;
        inner.requests.insert(request.id.clone(), request.clone());
        Ok(())
    }

    async fn get_request(&self, id: &str) -> Result<Option<UserRequest>> {
        let inner = self.inner.read().await;
        Ok(inner.requests.get(id).cloned())
    }

    async fn close_request(
        &self,
        id: &str,
        successful: bool,
        completed_at: DateTime<Utc>,
    ) -> Result<bool> {
        let mut inner = self.inner.write().await;
        let request = inner
            .requests
            .get_mut(id)
            .ok_or_else(|| RelayError::NotFound(format!("Request not found: {}", id)))?;
        if request.is_completed {
            return Ok(false);
        }
        request.is_completed = true;
        request.is_successful = Some(successful);
        request.completed_at = Some(completed_at);
        Ok(true)
    }

    async fn active_requests(&self, project_id: &str) -> Result<Vec<UserRequest>> {
        let inner = self.inner.read().await;
        Ok(inner
            .requests
            .values()
            .filter(|r| r.project_id == project_id && !r.is_completed)
            .cloned()
            .collect())
    }

    fn backend_name(&self) -> &str {
        "memory"
    }
}

// ============================================================================
// Tests
// ============================================================================
