//! Relay configuration
//!
//! Deserialized from an optional JSON file; every field has a default so an
//! empty config is valid. CLI flags in the binary override the file.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{RelayError, Result};

/// Top-level configuration for the relay server
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayConfig {
    /// Address the HTTP/WebSocket server binds to
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    /// Directory for the file-backed project store
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Minimum interval between coalescer commits, in milliseconds
    #[serde(default = "default_commit_interval_ms")]
    pub commit_interval_ms: u64,

    /// Server-side heartbeat ping interval, in seconds
    #[serde(default = "default_heartbeat_interval_secs")]
    pub heartbeat_interval_secs: u64,

    /// Close a connection when no pong arrives within this window, in seconds
    #[serde(default = "default_heartbeat_timeout_secs")]
    pub heartbeat_timeout_secs: u64,

    /// WebSocket connect handshake timeout, in seconds
    #[serde(default = "default_handshake_timeout_secs")]
    pub handshake_timeout_secs: u64,

    /// Client polling-fallback interval, in milliseconds
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Adapter process settings
    #[serde(default)]
    pub adapter: AdapterConfig,

    /// Retry policy for coalescer commits against the store
    #[serde(default)]
    pub commit_retry: CommitRetryConfig,

    /// Client reconnect backoff policy
    #[serde(default)]
    pub backoff: BackoffConfig,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            data_dir: default_data_dir(),
            commit_interval_ms: default_commit_interval_ms(),
            heartbeat_interval_secs: default_heartbeat_interval_secs(),
            heartbeat_timeout_secs: default_heartbeat_timeout_secs(),
            handshake_timeout_secs: default_handshake_timeout_secs(),
            poll_interval_ms: default_poll_interval_ms(),
            adapter: AdapterConfig::default(),
            commit_retry: CommitRetryConfig::default(),
            backoff: BackoffConfig::default(),
        }
    }
}

impl RelayConfig {
    /// Load configuration from a JSON file
    pub async fn load(path: &Path) -> Result<Self> {
        let raw = tokio::fs::read_to_string(path).await.map_err(|e| {
            RelayError::Config(format!("Failed to read {}: {}", path.display(), e))
        })?;
        serde_json::from_str(&raw)
            .map_err(|e| RelayError::Config(format!("Failed to parse {}: {}", path.display(), e)))
    }

    pub fn commit_interval(&self) -> Duration {
        Duration::from_millis(self.commit_interval_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_secs(self.heartbeat_timeout_secs)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

/// Settings for the external agent CLI process
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdapterConfig {
    /// Program to spawn
    #[serde(default = "default_adapter_program")]
    pub program: String,

    /// Base arguments passed before the instruction
    #[serde(default)]
    pub args: Vec<String>,

    /// Adapter name recorded as the message source tag
    #[serde(default = "default_cli_type")]
    pub cli_type: String,

    /// Abort the execution when no event arrives within this window, in seconds
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,

    /// Capacity of the adapter event channel
    #[serde(default = "default_event_buffer")]
    pub event_buffer: usize,
}

impl Default for AdapterConfig {
    fn default() -> Self {
        Self {
            program: default_adapter_program(),
            args: Vec::new(),
            cli_type: default_cli_type(),
            idle_timeout_secs: default_idle_timeout_secs(),
            event_buffer: default_event_buffer(),
        }
    }
}

impl AdapterConfig {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }
}

/// Retry policy for persisting a coalescer commit
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommitRetryConfig {
    /// Maximum retry attempts after the initial failure (0 = no retries)
    #[serde(default = "default_commit_retries")]
    pub max_retries: u32,

    /// Base delay in milliseconds for exponential backoff between attempts
    #[serde(default = "default_commit_retry_base_ms")]
    pub base_delay_ms: u64,
}

impl Default for CommitRetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_commit_retries(),
            base_delay_ms: default_commit_retry_base_ms(),
        }
    }
}

impl CommitRetryConfig {
    /// Delay before retry `attempt` (0-indexed): `base * 2^attempt`
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        Duration::from_millis(self.base_delay_ms.saturating_mul(1u64 << attempt.min(10)))
    }
}

/// Client reconnect backoff: capped exponential with deterministic jitter
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackoffConfig {
    /// Base delay in milliseconds
    #[serde(default = "default_backoff_base_ms")]
    pub base_delay_ms: u64,

    /// Cap for exponential growth, in milliseconds
    #[serde(default = "default_backoff_max_ms")]
    pub max_delay_ms: u64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: default_backoff_base_ms(),
            max_delay_ms: default_backoff_max_ms(),
        }
    }
}

impl BackoffConfig {
    /// Calculate the delay for a given attempt number (0-indexed)
    ///
    /// Exponential backoff `base * 2^attempt`, capped at `max_delay_ms`,
    /// with deterministic ±25% jitter derived from the attempt number.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exp_delay = self.base_delay_ms.saturating_mul(1u64 << attempt.min(10));
        let capped = exp_delay.min(self.max_delay_ms);

        let jitter_range = capped / 4;
        let jittered = if jitter_range > 0 {
            let offset = (u64::from(attempt) * 7 + 3) % (jitter_range * 2 + 1);
            capped - jitter_range + offset
        } else {
            capped
        };

        Duration::from_millis(jittered)
    }
}

fn default_bind_addr() -> String {
    "127.0.0.1:8787".to_string()
}
fn default_data_dir() -> PathBuf {
    PathBuf::from("./relay-data")
}
fn default_commit_interval_ms() -> u64 {
    1000
}
fn default_heartbeat_interval_secs() -> u64 {
    25
}
fn default_heartbeat_timeout_secs() -> u64 {
    60
}
fn default_handshake_timeout_secs() -> u64 {
    5
}
fn default_poll_interval_ms() -> u64 {
    2000
}
fn default_adapter_program() -> String {
    "claude".to_string()
}
fn default_cli_type() -> String {
    "claude".to_string()
}
fn default_idle_timeout_secs() -> u64 {
    300
}
fn default_event_buffer() -> usize {
    256
}
fn default_commit_retries() -> u32 {
    3
}
fn default_commit_retry_base_ms() -> u64 {
    100
}
fn default_backoff_base_ms() -> u64 {
    500
}
fn default_backoff_max_ms() -> u64 {
    30_000
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = RelayConfig::default();
        assert_eq!(config.bind_addr, "127.0.0.1:8787");
        assert_eq!(config.commit_interval(), Duration::from_millis(1000));
        assert_eq!(config.heartbeat_interval(), Duration::from_secs(25));
        assert_eq!(config.heartbeat_timeout(), Duration::from_secs(60));
        assert_eq!(config.poll_interval(), Duration::from_millis(2000));
        assert_eq!(config.adapter.cli_type, "claude");
        assert_eq!(config.adapter.event_buffer, 256);
    }

    #[test]
    fn test_empty_json_is_valid() {
        let config: RelayConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config.commit_interval_ms, 1000);
        assert_eq!(config.commit_retry.max_retries, 3);
    }

    #[test]
    fn test_partial_override() {
        let config: RelayConfig = serde_json::from_str(
            r#"{"commit_interval_ms": 250, "adapter": {"program": "cursor-agent"}}"#,
        )
        .unwrap();
        assert_eq!(config.commit_interval_ms, 250);
        assert_eq!(config.adapter.program, "cursor-agent");
        // Untouched fields keep defaults
        assert_eq!(config.adapter.idle_timeout_secs, 300);
        assert_eq!(config.bind_addr, "127.0.0.1:8787");
    }

    #[test]
    fn test_backoff_exponential_and_capped() {
        let backoff = BackoffConfig {
            base_delay_ms: 500,
            max_delay_ms: 4000,
        };

        let d0 = backoff.delay_for_attempt(0).as_millis() as u64;
        assert!((375..=625).contains(&d0), "d0={}", d0);

        let d2 = backoff.delay_for_attempt(2).as_millis() as u64;
        assert!((1500..=2500).contains(&d2), "d2={}", d2);

        // Attempt 10 would be 512s uncapped; must stay within max + jitter
        let d10 = backoff.delay_for_attempt(10).as_millis() as u64;
        assert!(d10 <= 5000, "d10={}", d10);
    }

    #[test]
    fn test_commit_retry_delays() {
        let retry = CommitRetryConfig::default();
        assert_eq!(retry.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(retry.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(retry.delay_for_attempt(2), Duration::from_millis(400));
    }

    #[tokio::test]
    async fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("relay.json");
        tokio::fs::write(&path, r#"{"bind_addr": "0.0.0.0:9000"}"#)
            .await
            .unwrap();

        let config = RelayConfig::load(&path).await.unwrap();
        assert_eq!(config.bind_addr, "0.0.0.0:9000");
    }

    #[tokio::test]
    async fn test_load_missing_file() {
        let result = RelayConfig::load(Path::new("/nonexistent/relay.json")).await;
        assert!(matches!(result, Err(RelayError::Config(_))));
    }
}
