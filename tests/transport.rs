//! Live transport tests: a real server on an ephemeral port, a raw
//! WebSocket subscriber, and the viewer feed running against it

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;

use coderelay::adapter::{AdapterEvent, AdapterInvocation, AgentAdapter};
use coderelay::broadcast::Broadcaster;
use coderelay::client::{FeedEvent, FeedState, LiveFeed};
use coderelay::config::RelayConfig;
use coderelay::runner::ExecutionRunner;
use coderelay::server::{router, AppState};
use coderelay::store::{MemoryProjectStore, ProjectStore};
use coderelay::types::EventEnvelope;

struct IdleAdapter;

#[async_trait]
impl AgentAdapter for IdleAdapter {
    async fn execute(
        &self,
        _invocation: AdapterInvocation,
    ) -> coderelay::Result<mpsc::Receiver<AdapterEvent>> {
        let (tx, rx) = mpsc::channel(4);
        tokio::spawn(async move {
            let _ = tx
                .send(AdapterEvent::Result {
                    success: true,
                    error: None,
                })
                .await;
        });
        Ok(rx)
    }

    fn cli_type(&self) -> &str {
        "idle"
    }
}

async fn spawn_server(config: RelayConfig) -> (SocketAddr, Arc<AppState>) {
    let store: Arc<dyn ProjectStore> = Arc::new(MemoryProjectStore::new());
    let broadcaster = Arc::new(Broadcaster::new());
    let runner = Arc::new(ExecutionRunner::new(
        store.clone(),
        broadcaster.clone(),
        Arc::new(IdleAdapter),
        config.clone(),
    ));
    let state = Arc::new(AppState {
        store,
        broadcaster,
        runner,
        config,
    });

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let app = router(state.clone());
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (addr, state)
}

#[tokio::test]
async fn unanswered_heartbeat_unregisters_subscriber() {
    let mut config = RelayConfig::default();
    config.heartbeat_interval_secs = 1;
    config.heartbeat_timeout_secs = 1;
    let (addr, state) = spawn_server(config).await;

    let url = format!("ws://{}/ws/projects/proj-1", addr);
    let (mut socket, _) = connect_async(url.as_str()).await.unwrap();

    // Greeting arrives once the subscriber is registered
    let frame = tokio::time::timeout(Duration::from_secs(5), socket.next())
        .await
        .expect("no greeting within 5s")
        .unwrap()
        .unwrap();
    let envelope: EventEnvelope = serde_json::from_str(frame.to_text().unwrap()).unwrap();
    assert_eq!(envelope.event_type, "project_status");
    assert_eq!(envelope.data["status"], "connected");
    assert_eq!(state.broadcaster.subscriber_count("proj-1").await, 1);

    // Stop reading frames entirely: no pong ever answers the server's
    // pings, so the connection must be closed and unregistered
    for _ in 0..100 {
        if state.broadcaster.subscriber_count("proj-1").await == 0 {
            return;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    panic!("silent connection was never unregistered");
}

#[tokio::test]
async fn feed_close_unregisters_subscriber() {
    let (addr, state) = spawn_server(RelayConfig::default()).await;

    let feed = Arc::new(LiveFeed::new(
        format!("http://{}", addr),
        "proj-1",
        &RelayConfig::default(),
    ));
    let (tx, mut rx) = mpsc::unbounded_channel();
    let run = {
        let feed = feed.clone();
        tokio::spawn(async move { feed.run(tx).await })
    };

    // Wait for the feed to attach
    loop {
        let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("feed never opened")
            .unwrap();
        if matches!(event, FeedEvent::StateChanged(FeedState::Open)) {
            break;
        }
    }
    for _ in 0..100 {
        if state.broadcaster.subscriber_count("proj-1").await == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(state.broadcaster.subscriber_count("proj-1").await, 1);

    // Intentional close: the server prunes the handle, no reconnect follows
    feed.close();
    run.await.unwrap();
    for _ in 0..100 {
        if state.broadcaster.subscriber_count("proj-1").await == 0 {
            return;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    panic!("closed feed was never unregistered");
}

#[tokio::test]
async fn polling_fallback_stops_when_ledger_is_idle() {
    let (addr, _state) = spawn_server(RelayConfig::default()).await;

    let mut config = RelayConfig::default();
    config.poll_interval_ms = 50;
    let feed = Arc::new(LiveFeed::new(format!("http://{}", addr), "proj-1", &config));
    let (tx, mut rx) = mpsc::unbounded_channel();
    let run = {
        let feed = feed.clone();
        tokio::spawn(async move { feed.run(tx).await })
    };

    // A quiet feed spanning many poll intervals
    tokio::time::sleep(Duration::from_millis(500)).await;
    feed.close();
    run.await.unwrap();

    let mut states = Vec::new();
    let mut summaries = 0;
    while let Some(event) = rx.recv().await {
        match event {
            FeedEvent::StateChanged(state) => states.push(state),
            FeedEvent::RequestSummary(summary) => {
                assert!(!summary.has_active_requests);
                summaries += 1;
            }
            _ => {}
        }
    }

    assert_eq!(states.first(), Some(&FeedState::Connecting));
    assert!(states.contains(&FeedState::Open));
    assert_eq!(states.last(), Some(&FeedState::Closed));
    // One consultation showed nothing running; polling then stopped
    assert_eq!(summaries, 1);
}
