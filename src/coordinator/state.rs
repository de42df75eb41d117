//! Platform lifecycle state

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use std::time::Duration;

use crate::config::RetryConfig;

/// Connection state of one platform
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PlatformState {
    Disconnected,
    Connecting,
    Connected,
    Subscribed,
    /// Retries exhausted; terminal
    Failed,
}

impl PlatformState {
    /// Numeric code exported as the `fx_platform_state` gauge
    pub fn code(&self) -> i64 {
        match self {
            PlatformState::Disconnected => 0,
            PlatformState::Connecting => 1,
            PlatformState::Connected => 2,
            PlatformState::Subscribed => 3,
            PlatformState::Failed => 4,
        }
    }

    /// Whether rate events from the platform are routed
    pub fn accepts_rates(&self) -> bool {
        !matches!(self, PlatformState::Disconnected | PlatformState::Failed)
    }
}

impl fmt::Display for PlatformState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PlatformState::Disconnected => "disconnected",
            PlatformState::Connecting => "connecting",
            PlatformState::Connected => "connected",
            PlatformState::Subscribed => "subscribed",
            PlatformState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Reconnection bookkeeping of one platform
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryState {
    pub platform: String,
    /// Consecutive failed attempts since the last successful connect
    pub attempts: u32,
    pub limit: u32,
    pub delay_secs: u64,
}

impl RetryState {
    pub fn new(platform: &str, policy: &RetryConfig) -> Self {
        Self {
            platform: platform.to_string(),
            attempts: 0,
            limit: policy.limit,
            delay_secs: policy.delay_secs,
        }
    }

    pub fn reset(&mut self) {
        self.attempts = 0;
    }

    /// No retries left
    pub fn exhausted(&self) -> bool {
        self.attempts >= self.limit
    }

    pub fn delay(&self) -> Duration {
        Duration::from_secs(self.delay_secs)
    }
}

/// Snapshot of a platform published for diagnostics
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PlatformStatus {
    pub platform: String,
    pub kind: String,
    pub state: PlatformState,
    pub attempts: u32,
    pub limit: u32,
    pub delay_secs: u64,
    pub subscriptions: Vec<String>,
    pub updated_at: DateTime<Utc>,
}
