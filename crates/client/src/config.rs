//! Client configuration.
//!
//! Every field has a default, so an empty TOML document is a valid config.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ClientError;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// WebSocket endpoint of the relay server
    pub url: String,
    /// Stable id sent on register; generated per manager when unset.
    pub client_id: Option<String>,
    pub heartbeat_interval_ms: u64,
    pub auth_token: Option<String>,
    pub reconnect: ReconnectConfig,
    pub auto_approval: AutoApprovalConfig,
    pub auto_retry: AutoRetryConfig,
    pub dedup: DedupConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            url: "ws://127.0.0.1:4100/ws".to_string(),
            client_id: None,
            heartbeat_interval_ms: 15_000,
            auth_token: None,
            reconnect: ReconnectConfig::default(),
            auto_approval: AutoApprovalConfig::default(),
            auto_retry: AutoRetryConfig::default(),
            dedup: DedupConfig::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectConfig {
    pub base_interval_ms: u64,
    pub max_interval_ms: u64,
    pub max_attempts: u32,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            base_interval_ms: 1_000,
            max_interval_ms: 30_000,
            max_attempts: 10,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AutoApprovalConfig {
    pub enabled: bool,
    pub timeout_secs: u32,
}

impl Default for AutoApprovalConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            timeout_secs: 10,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AutoRetryConfig {
    pub enabled: bool,
    pub delays_ms: Vec<u64>,
    pub max_retries: u32,
}

impl Default for AutoRetryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            delays_ms: vec![10_000, 30_000, 60_000],
            max_retries: 3,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DedupConfig {
    /// Fingerprints kept before trimming to the newest half
    pub capacity: usize,
    /// Leading characters of message text that go into a fingerprint
    pub text_prefix_chars: usize,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            capacity: 1_000,
            text_prefix_chars: 64,
        }
    }
}

impl ClientConfig {
    pub fn from_toml_str(text: &str) -> Result<Self, ClientError> {
        Ok(toml::from_str(text)?)
    }

    pub fn load(path: &Path) -> Result<Self, ClientError> {
        let text = std::fs::read_to_string(path).map_err(|source| ClientError::ConfigRead {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&text)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms.max(1))
    }

    /// URL to dial, with `token` appended when an auth token is configured.
    pub fn connect_url(&self) -> String {
        match self.auth_token.as_deref().map(str::trim) {
            Some(token) if !token.is_empty() => {
                let separator = if self.url.contains('?') { '&' } else { '?' };
                format!("{}{}token={}", self.url, separator, token)
            }
            _ => self.url.clone(),
        }
    }
}
