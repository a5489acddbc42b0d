//! Execution-to-delivery relay for coding agents
//!
//! Sits between a headless agent CLI and any number of attached viewers:
//! adapter output is normalized into typed events, assistant prose is
//! coalesced into low-latency deltas plus durable commits, and everything is
//! fanned out per project over WebSocket with REST backfill for reconnects.
//!
//! Pipeline, upstream to downstream:
//!
//! - [`adapter`]: spawn the agent CLI and normalize its stdout
//! - [`runner`]: one consumer task per execution, routing events
//! - [`coalescer`]: delta buffering and periodic durable commits
//! - [`ledger`] / [`store`]: session/request lifecycle over persistence
//! - [`broadcast`]: per-project fan-out to attached subscribers
//! - [`server`]: the HTTP/WebSocket surface
//! - [`client`]: viewer-side feed with reconnect and reconciliation

pub mod adapter;
pub mod broadcast;
pub mod client;
pub mod coalescer;
pub mod config;
pub mod error;
pub mod ledger;
pub mod runner;
pub mod server;
pub mod store;
pub mod types;

pub use adapter::{AdapterEvent, AdapterInvocation, AgentAdapter, ProcessAdapter};
pub use broadcast::{Broadcaster, SubscriberId};
pub use client::{ConversationView, FeedEvent, FeedState, LiveFeed};
pub use coalescer::StreamCoalescer;
pub use config::RelayConfig;
pub use error::{RelayError, Result};
pub use ledger::SessionLedger;
pub use runner::{ExecutionRunner, SubmitOutcome, SubmitRequest};
pub use server::{router, AppState};
pub use store::{FileProjectStore, MemoryProjectStore, ProjectStore};
pub use types::{
    EventEnvelope, Message, MessageRole, MessageType, RequestType, Session, SessionStatus,
    UserRequest,
};
