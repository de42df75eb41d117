//! Prometheus metrics for the rate pipeline

use prometheus::{IntCounterVec, IntGaugeVec, Opts, Registry};

use crate::error::{CollectorError, Result};

/// Counters and gauges exported on `/metrics`
#[derive(Clone)]
pub struct PipelineMetrics {
    /// Quotes received, labelled `first` or `update`
    pub rates_received: IntCounterVec,
    pub rates_rejected: IntCounterVec,
    pub calculated_rates: IntCounterVec,
    pub connection_attempts: IntCounterVec,
    /// Current platform state code
    pub platform_state: IntGaugeVec,
}

impl PipelineMetrics {
    /// Create the metrics and register them into `registry`
    pub fn new(registry: &Registry) -> Result<Self> {
        let rates_received = IntCounterVec::new(
            Opts::new("fx_rates_received_total", "Quotes received from venues"),
            &["platform", "kind"],
        )?;
        let rates_rejected = IntCounterVec::new(
            Opts::new(
                "fx_rates_rejected_total",
                "Quotes rejected by cross-platform validation",
            ),
            &["platform", "instrument"],
        )?;
        let calculated_rates = IntCounterVec::new(
            Opts::new("fx_calculated_rates_total", "Calculated rates published"),
            &["instrument"],
        )?;
        let connection_attempts = IntCounterVec::new(
            Opts::new("fx_connection_attempts_total", "Venue connection attempts"),
            &["platform"],
        )?;
        let platform_state = IntGaugeVec::new(
            Opts::new(
                "fx_platform_state",
                "Platform state (0 disconnected, 1 connecting, 2 connected, 3 subscribed, 4 failed)",
            ),
            &["platform"],
        )?;

        registry.register(Box::new(rates_received.clone()))?;
        registry.register(Box::new(rates_rejected.clone()))?;
        registry.register(Box::new(calculated_rates.clone()))?;
        registry.register(Box::new(connection_attempts.clone()))?;
        registry.register(Box::new(platform_state.clone()))?;

        Ok(Self {
            rates_received,
            rates_rejected,
            calculated_rates,
            connection_attempts,
            platform_state,
        })
    }

    pub fn record_received(&self, platform: &str, first: bool) {
        let kind = if first { "first" } else { "update" };
        self.rates_received.with_label_values(&[platform, kind]).inc();
    }

    pub fn record_rejected(&self, platform: &str, instrument: &str) {
        self.rates_rejected
            .with_label_values(&[platform, instrument])
            .inc();
    }

    pub fn record_calculated(&self, instrument: &str) {
        self.calculated_rates.with_label_values(&[instrument]).inc();
    }

    pub fn record_connection_attempt(&self, platform: &str) {
        self.connection_attempts.with_label_values(&[platform]).inc();
    }

    pub fn set_platform_state(&self, platform: &str, code: i64) {
        self.platform_state.with_label_values(&[platform]).set(code);
    }
}

/// Render a registry in the Prometheus text format
pub fn encode(registry: &Registry) -> Result<String> {
    use prometheus::{Encoder, TextEncoder};

    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    encoder.encode(&registry.gather(), &mut buffer)?;
    String::from_utf8(buffer).map_err(|e| CollectorError::Metrics(e.to_string()))
}
