//! Adapter registry
//!
//! Maps the `kind` tag of a platform definition to a constructor, so new
//! transports can be plugged in without touching the coordinator.

use std::collections::HashMap;
use std::sync::Arc;

use super::{polling, streaming, EventSink, PlatformAdapter, PollingAdapter, StreamingAdapter};
use crate::config::PlatformConfig;
use crate::error::{CollectorError, Result};

/// Constructor for one adapter kind
pub type AdapterFactory =
    Arc<dyn Fn(&PlatformConfig, EventSink) -> Result<Arc<dyn PlatformAdapter>> + Send + Sync>;

/// Registry of adapter constructors keyed by kind
#[derive(Clone)]
pub struct AdapterRegistry {
    factories: HashMap<String, AdapterFactory>,
}

impl AdapterRegistry {
    /// Empty registry
    pub fn new() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    /// Registry with the built-in streaming and polling adapters
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(streaming::KIND, |config, events| {
            let adapter: Arc<dyn PlatformAdapter> = Arc::new(StreamingAdapter::new(config, events)?);
            Ok(adapter)
        });
        registry.register(polling::KIND, |config, events| {
            let adapter: Arc<dyn PlatformAdapter> = Arc::new(PollingAdapter::new(config, events)?);
            Ok(adapter)
        });
        registry
    }

    /// Register (or replace) the constructor for a kind
    pub fn register<F>(&mut self, kind: &str, factory: F)
    where
        F: Fn(&PlatformConfig, EventSink) -> Result<Arc<dyn PlatformAdapter>> + Send + Sync + 'static,
    {
        self.factories.insert(kind.to_string(), Arc::new(factory));
    }

    /// Build the adapter for a platform definition
    pub fn build(&self, config: &PlatformConfig, events: EventSink) -> Result<Arc<dyn PlatformAdapter>> {
        let factory = self
            .factories
            .get(&config.kind)
            .ok_or_else(|| CollectorError::UnknownAdapter {
                platform: config.name.clone(),
                kind: config.kind.clone(),
            })?;
        factory(config, events)
    }

    /// Registered kinds, sorted
    pub fn kinds(&self) -> Vec<String> {
        let mut kinds: Vec<String> = self.factories.keys().cloned().collect();
        kinds.sort();
        kinds
    }
}

impl Default for AdapterRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn platform(kind: &str) -> PlatformConfig {
        PlatformConfig {
            name: "TCP".to_string(),
            kind: kind.to_string(),
            host: None,
            port: None,
            base_url: None,
            username: "user".to_string(),
            password: "pw".to_string(),
            instruments: vec!["USDTRY".to_string()],
            poll_interval_ms: 500,
            read_timeout_secs: 60,
            max_poll_failures: 3,
        }
    }

    #[test]
    fn test_default_kinds() {
        assert_eq!(
            AdapterRegistry::with_defaults().kinds(),
            vec!["polling".to_string(), "streaming".to_string()]
        );
    }

    #[test]
    fn test_unknown_kind_is_rejected() {
        let registry = AdapterRegistry::with_defaults();
        let (events, _rx) = EventSink::channel("TCP");

        match registry.build(&platform("websocket"), events) {
            Err(CollectorError::UnknownAdapter { platform, kind }) => {
                assert_eq!(platform, "TCP");
                assert_eq!(kind, "websocket");
            }
            Err(e) => panic!("Expected UnknownAdapter, got {}", e),
            Ok(_) => panic!("Expected UnknownAdapter"),
        }
    }

    #[test]
    fn test_incomplete_definition_is_config_error() {
        let registry = AdapterRegistry::with_defaults();

        let (events, _rx) = EventSink::channel("TCP");
        assert!(matches!(
            registry.build(&platform("streaming"), events),
            Err(CollectorError::Config(_))
        ));

        let (events, _rx) = EventSink::channel("TCP");
        assert!(matches!(
            registry.build(&platform("polling"), events),
            Err(CollectorError::Config(_))
        ));
    }

    #[tokio::test]
    async fn test_build_streaming_adapter() {
        let registry = AdapterRegistry::with_defaults();
        let mut config = platform("streaming");
        config.host = Some("127.0.0.1".to_string());
        config.port = Some(8081);
        let (events, _rx) = EventSink::channel("TCP");

        let adapter = registry.build(&config, events).unwrap();
        assert_eq!(adapter.platform(), "TCP");
        assert_eq!(adapter.kind(), "streaming");
        assert!(adapter.subscriptions().is_empty());
    }
}
