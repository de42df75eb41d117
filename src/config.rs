//! Configuration module for the FX collector

use serde::Deserialize;
use std::collections::HashSet;
use std::env;
use std::time::Duration;

use crate::error::{CollectorError, Result};

/// Environment variable naming the configuration file
pub const CONFIG_FILE_ENV: &str = "FX_COLLECTOR_CONFIG";
const DEFAULT_CONFIG_FILE: &str = "config/collector";

/// Application configuration
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    /// Venues to connect to
    pub platforms: Vec<PlatformConfig>,

    /// Connection retry policy, shared by every platform
    #[serde(default)]
    pub retry: RetryConfig,

    #[serde(default)]
    pub cache: CacheConfig,

    #[serde(default)]
    pub derivation: DerivationConfig,

    /// IPC socket path for publishing rates
    #[serde(default = "default_ipc_socket_path")]
    pub ipc_socket_path: String,

    /// Port of the health/metrics HTTP server
    #[serde(default = "default_health_port")]
    pub health_port: u16,

    /// Optional webhook receiving connection failure alerts
    #[serde(default)]
    pub alert_webhook_url: Option<String>,
}

/// A single venue definition
#[derive(Debug, Clone, Deserialize)]
pub struct PlatformConfig {
    /// Platform name, also the feed prefix (`TCP` in `TCP_USDTRY`)
    pub name: String,

    /// Adapter tag looked up in the adapter registry ("streaming", "polling")
    pub kind: String,

    #[serde(default)]
    pub host: Option<String>,

    #[serde(default)]
    pub port: Option<u16>,

    #[serde(default)]
    pub base_url: Option<String>,

    pub username: String,
    pub password: String,

    /// Instruments subscribed after every successful connect
    pub instruments: Vec<String>,

    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    #[serde(default = "default_read_timeout_secs")]
    pub read_timeout_secs: u64,

    /// Consecutive poll failures tolerated before the platform is dropped
    #[serde(default = "default_max_poll_failures")]
    pub max_poll_failures: u32,
}

impl PlatformConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.read_timeout_secs)
    }

    /// `host:port` of a streaming venue
    pub fn socket_addr(&self) -> Result<String> {
        match (&self.host, self.port) {
            (Some(host), Some(port)) => Ok(format!("{}:{}", host, port)),
            _ => Err(CollectorError::Config(format!(
                "Platform {} requires host and port",
                self.name
            ))),
        }
    }

    /// Base URL of a polled venue, without trailing slash
    pub fn base_url(&self) -> Result<String> {
        self.base_url
            .as_deref()
            .filter(|url| !url.is_empty())
            .map(|url| url.trim_end_matches('/').to_string())
            .ok_or_else(|| {
                CollectorError::Config(format!("Platform {} requires base_url", self.name))
            })
    }
}

/// Fixed-interval retry policy
#[derive(Debug, Clone, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_retry_limit")]
    pub limit: u32,

    #[serde(default = "default_retry_delay_secs")]
    pub delay_secs: u64,
}

impl RetryConfig {
    pub fn delay(&self) -> Duration {
        Duration::from_secs(self.delay_secs)
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            limit: default_retry_limit(),
            delay_secs: default_retry_delay_secs(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
    #[serde(default = "default_cache_ttl_secs")]
    pub ttl_secs: u64,

    #[serde(default = "default_eviction_interval_secs")]
    pub eviction_interval_secs: u64,
}

impl CacheConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }

    pub fn eviction_interval(&self) -> Duration {
        Duration::from_secs(self.eviction_interval_secs)
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl_secs: default_cache_ttl_secs(),
            eviction_interval_secs: default_eviction_interval_secs(),
        }
    }
}

/// Cross-rate derivation: the anchor and the instruments re-based through it
#[derive(Debug, Clone, Deserialize)]
pub struct DerivationConfig {
    #[serde(default = "default_anchor")]
    pub anchor: String,

    #[serde(default = "default_dependents")]
    pub dependents: Vec<DependentRate>,
}

impl DerivationConfig {
    pub fn dependent(&self, source: &str) -> Option<&DependentRate> {
        self.dependents.iter().find(|d| d.source == source)
    }
}

impl Default for DerivationConfig {
    fn default() -> Self {
        Self {
            anchor: default_anchor(),
            dependents: default_dependents(),
        }
    }
}

/// A source instrument and the name of its re-based output (EURUSD -> EURTRY)
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct DependentRate {
    pub source: String,
    pub output: String,
}

impl DependentRate {
    pub fn new(source: &str, output: &str) -> Self {
        Self {
            source: source.to_string(),
            output: output.to_string(),
        }
    }
}

impl Settings {
    /// Load configuration from `.env`, an optional config file and `FX__*`
    /// environment variables, in increasing priority
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok();

        let (path, required) = match env::var(CONFIG_FILE_ENV) {
            Ok(path) => (path, true),
            Err(_) => (DEFAULT_CONFIG_FILE.to_string(), false),
        };
        Self::load_from(&path, required)
    }

    /// Load configuration from a specific file (extension optional)
    pub fn load_from(path: &str, required: bool) -> Result<Self> {
        let settings: Settings = config::Config::builder()
            .add_source(config::File::with_name(path).required(required))
            .add_source(
                config::Environment::with_prefix("FX")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;

        settings.validate()?;
        Ok(settings)
    }

    /// Reject partial or inconsistent configurations
    pub fn validate(&self) -> Result<()> {
        if self.platforms.is_empty() {
            return Err(CollectorError::Config("No platforms configured".to_string()));
        }

        let mut names = HashSet::new();
        for platform in &self.platforms {
            if platform.name.trim().is_empty() {
                return Err(CollectorError::Config("Platform with empty name".to_string()));
            }
            if !names.insert(platform.name.as_str()) {
                return Err(CollectorError::Config(format!(
                    "Duplicate platform: {}",
                    platform.name
                )));
            }
            // `_` separates platform and instrument in feed names
            if platform.name.contains('_') {
                return Err(CollectorError::Config(format!(
                    "Platform name {} must not contain '_'",
                    platform.name
                )));
            }
            if platform.read_timeout_secs == 0 {
                return Err(CollectorError::Config(format!(
                    "Platform {}: read_timeout_secs must be positive",
                    platform.name
                )));
            }
            if platform.poll_interval_ms == 0 {
                return Err(CollectorError::Config(format!(
                    "Platform {}: poll_interval_ms must be positive",
                    platform.name
                )));
            }
            if platform.instruments.is_empty() {
                return Err(CollectorError::Config(format!(
                    "Platform {} has no instruments",
                    platform.name
                )));
            }
        }

        if self.retry.delay_secs == 0 {
            return Err(CollectorError::Config(
                "retry.delay_secs must be positive".to_string(),
            ));
        }
        if self.cache.ttl_secs == 0 {
            return Err(CollectorError::Config("cache.ttl_secs must be positive".to_string()));
        }
        if self.cache.eviction_interval_secs == 0 {
            return Err(CollectorError::Config(
                "cache.eviction_interval_secs must be positive".to_string(),
            ));
        }

        Ok(())
    }
}

fn default_ipc_socket_path() -> String {
    "/tmp/fx-collector.sock".to_string()
}

fn default_health_port() -> u16 {
    9090
}

fn default_poll_interval_ms() -> u64 {
    500
}

fn default_read_timeout_secs() -> u64 {
    60
}

fn default_max_poll_failures() -> u32 {
    3
}

fn default_retry_limit() -> u32 {
    12
}

fn default_retry_delay_secs() -> u64 {
    10
}

fn default_cache_ttl_secs() -> u64 {
    30 * 60
}

fn default_eviction_interval_secs() -> u64 {
    60
}

fn default_anchor() -> String {
    "USDTRY".to_string()
}

fn default_dependents() -> Vec<DependentRate> {
    vec![
        DependentRate::new("EURUSD", "EURTRY"),
        DependentRate::new("GBPUSD", "GBPTRY"),
    ]
}
