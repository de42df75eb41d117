//! FX Collector
//!
//! Collects bid/ask quotes for currency pairs from several venues, validates
//! each update against what the other venues currently report, derives
//! consensus and cross rates, and publishes the results.

use dashmap::DashMap;
use prometheus::Registry;
use std::sync::Arc;

pub mod adapter;
pub mod cache;
pub mod calculation;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod health;
pub mod metrics;
pub mod model;
pub mod notifier;
pub mod protocol;
pub mod publisher;
pub mod rate_manager;

pub use adapter::{AdapterRegistry, EventSink, PlatformAdapter, PlatformEvent};
pub use cache::RateCache;
pub use config::Settings;
pub use coordinator::{Coordinator, CoordinatorHandle, PlatformState, PlatformStatus};
pub use error::{CollectorError, Result};
pub use metrics::PipelineMetrics;
pub use model::{CalculatedRate, Quote, Rate};
pub use notifier::{LogNotifier, Notifier, WebhookNotifier};
pub use publisher::{IpcPublisher, RatePublisher};
pub use rate_manager::{RateManager, UpdateOutcome};

/// Application state shared with the health server
pub struct AppState {
    pub registry: Registry,
    pub statuses: Arc<DashMap<String, PlatformStatus>>,
    pub cache: Arc<RateCache>,
}
