//! Session and request ledger
//!
//! Tracks one execution's lifecycle (`Session`) and the user-facing request
//! handle (`UserRequest`) as a pair: opened together at submission, closed
//! together exactly once when the session reaches a terminal state. The
//! ledger is the source of truth consulted by the client polling fallback.

use std::sync::Arc;

use chrono::Utc;

use crate::error::Result;
use crate::store::ProjectStore;
use crate::types::{RequestSummary, RequestType, Session, SessionStatus, UserRequest};

/// Lifecycle ledger over the durable store
#[derive(Clone)]
pub struct SessionLedger {
    store: Arc<dyn ProjectStore>,
}

impl SessionLedger {
    pub fn new(store: Arc<dyn ProjectStore>) -> Self {
        Self { store }
    }

    /// Open a session/request pair for a submitted instruction
    pub async fn open(
        &self,
        project_id: &str,
        cli_type: &str,
        instruction: &str,
        request_type: RequestType,
        user_message_id: &str,
    ) -> Result<(Session, UserRequest)> {
        let session = Session::new(project_id, cli_type, instruction);
        self.store.create_session(&session).await?;

        let request = UserRequest::new(
            project_id,
            user_message_id,
            &session.id,
            instruction,
            request_type,
        );
        self.store.create_request(&request).await?;

        tracing::info!(
            project = %project_id,
            session = %session.id,
            request = %request.id,
            "opened session and request"
        );
        Ok((session, request))
    }

    /// Close the pair once; repeated terminal transitions are no-ops
    pub async fn close(&self, session_id: &str, request_id: &str, success: bool) -> Result<()> {
        let status = if success {
            SessionStatus::Completed
        } else {
            SessionStatus::Failed
        };
        let now = Utc::now();

        let applied = self.store.finish_session(session_id, status, now).await?;
        if !applied {
            tracing::warn!(
                session = %session_id,
                "ignoring repeated terminal transition for already-closed session"
            );
        }

        let applied = self.store.close_request(request_id, success, now).await?;
        if !applied {
            tracing::warn!(
                request = %request_id,
                "ignoring repeated close for already-completed request"
            );
        }

        tracing::info!(session = %session_id, request = %request_id, success, "closed session and request");
        Ok(())
    }

    /// The project's currently active session, if any
    pub async fn active_session(&self, project_id: &str) -> Result<Option<Session>> {
        self.store.active_session(project_id).await
    }

    /// Look up one request (used by the polling fallback)
    pub async fn get_request(&self, request_id: &str) -> Result<Option<UserRequest>> {
        self.store.get_request(request_id).await
    }

    /// Summary of open requests for a project
    pub async fn request_summary(&self, project_id: &str) -> Result<RequestSummary> {
        let open = self.store.active_requests(project_id).await?;
        Ok(RequestSummary {
            has_active_requests: !open.is_empty(),
            active_count: open.len(),
        })
    }
}
