//! Rate manager
//!
//! Turns platform quotes into cached and published rates. The first quote of
//! an instrument on a platform is accepted as is; later ones must agree with
//! what every platform currently reports. Accepted quotes on the anchor or on
//! a dependent source instrument also refresh the calculated rates.

use rust_decimal::Decimal;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::cache::RateCache;
use crate::calculation;
use crate::config::{DependentRate, DerivationConfig};
use crate::metrics::PipelineMetrics;
use crate::model::{CalculatedRate, Rate};
use crate::publisher::RatePublisher;

/// What happened to a rate update
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOutcome {
    /// Validated against peers, stored and published
    Accepted,
    /// Deviated too far from peers; nothing stored
    Rejected,
    /// No live peers to validate against; stored as a first rate
    Seeded,
}

pub struct RateManager {
    cache: Arc<RateCache>,
    publisher: Arc<dyn RatePublisher>,
    derivation: DerivationConfig,
    metrics: PipelineMetrics,
}

impl RateManager {
    pub fn new(
        cache: Arc<RateCache>,
        publisher: Arc<dyn RatePublisher>,
        derivation: DerivationConfig,
        metrics: PipelineMetrics,
    ) -> Self {
        Self {
            cache,
            publisher,
            derivation,
            metrics,
        }
    }

    pub fn cache(&self) -> &Arc<RateCache> {
        &self.cache
    }

    /// Store and publish a platform's first quote for an instrument
    pub fn handle_first_rate(&self, platform: &str, instrument: &str, rate: Rate) {
        debug!(
            platform = %platform,
            instrument = %instrument,
            bid = %rate.bid,
            ask = %rate.ask,
            "First rate"
        );
        self.store_raw(platform, instrument, rate);
    }

    /// Validate a quote against all platforms' current rates and apply it
    pub fn handle_rate_update(&self, platform: &str, instrument: &str, rate: Rate) -> UpdateOutcome {
        let peers = self.cache.scan_by_instrument(instrument);
        if peers.is_empty() {
            debug!(platform = %platform, instrument = %instrument, "No live peers, seeding rate");
            self.handle_first_rate(platform, instrument, rate);
            return UpdateOutcome::Seeded;
        }

        let (bids, asks) = split_quotes(&peers);
        match calculation::is_valid(rate.bid, rate.ask, &bids, &asks) {
            Some(true) => {}
            Some(false) => {
                warn!(
                    platform = %platform,
                    instrument = %instrument,
                    bid = %rate.bid,
                    ask = %rate.ask,
                    peers = peers.len(),
                    "Rate rejected, deviates from peers"
                );
                self.metrics.record_rejected(platform, instrument);
                return UpdateOutcome::Rejected;
            }
            None => {
                warn!(
                    platform = %platform,
                    instrument = %instrument,
                    "Rate rejected, peer reference is not positive"
                );
                self.metrics.record_rejected(platform, instrument);
                return UpdateOutcome::Rejected;
            }
        }

        self.store_raw(platform, instrument, rate);

        if instrument == self.derivation.anchor {
            self.refresh_anchor();
            for dependent in &self.derivation.dependents {
                self.refresh_dependent(dependent);
            }
        } else if let Some(dependent) = self.derivation.dependent(instrument) {
            self.refresh_dependent(dependent);
        }

        UpdateOutcome::Accepted
    }

    fn store_raw(&self, platform: &str, instrument: &str, rate: Rate) {
        self.publisher.send_raw_rate(platform, &rate);
        self.cache.put_raw(platform, instrument, rate);
    }

    fn store_calculated(&self, rate: CalculatedRate) {
        debug!(instrument = %rate.instrument, bid = %rate.bid, ask = %rate.ask, "Calculated rate");
        self.metrics.record_calculated(&rate.instrument);
        self.publisher.send_calculated_rate(&rate);
        self.cache.put_calculated(rate);
    }

    /// Consensus mid of the anchor across platforms
    fn anchor_mid(&self) -> Option<Decimal> {
        let peers = self.cache.scan_by_instrument(&self.derivation.anchor);
        let (bids, asks) = split_quotes(&peers);
        calculation::aggregate(&bids, &asks).map(|quote| quote.mid())
    }

    fn refresh_anchor(&self) {
        let anchor = &self.derivation.anchor;
        let peers = self.cache.scan_by_instrument(anchor);
        let (bids, asks) = split_quotes(&peers);
        if let Some(quote) = calculation::aggregate(&bids, &asks) {
            self.store_calculated(CalculatedRate::now(anchor, quote));
        }
    }

    fn refresh_dependent(&self, dependent: &DependentRate) {
        let Some(anchor_mid) = self.anchor_mid() else {
            debug!(
                instrument = %dependent.output,
                anchor = %self.derivation.anchor,
                "No live anchor rates, skipping derivation"
            );
            return;
        };

        let peers = self.cache.scan_by_instrument(&dependent.source);
        let (bids, asks) = split_quotes(&peers);
        if let Some(quote) = calculation::dependent_rate(&bids, &asks, anchor_mid) {
            self.store_calculated(CalculatedRate::now(&dependent.output, quote));
        }
    }
}

fn split_quotes(rates: &[Rate]) -> (Vec<Decimal>, Vec<Decimal>) {
    rates.iter().map(|rate| (rate.bid, rate.ask)).unzip()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::publisher::{MockRatePublisher, PublishedRate};
    use chrono::Utc;
    use parking_lot::Mutex;
    use prometheus::Registry;
    use rust_decimal_macros::dec;

    #[derive(Default)]
    struct RecordingPublisher {
        published: Mutex<Vec<PublishedRate>>,
    }

    impl RecordingPublisher {
        fn calculated(&self) -> Vec<CalculatedRate> {
            self.published
                .lock()
                .iter()
                .filter_map(|p| match p {
                    PublishedRate::Calculated { rate } => Some(rate.clone()),
                    PublishedRate::Raw { .. } => None,
                })
                .collect()
        }
    }

    impl RatePublisher for RecordingPublisher {
        fn send_raw_rate(&self, platform: &str, rate: &Rate) {
            self.published.lock().push(PublishedRate::Raw {
                platform: platform.to_string(),
                rate: rate.clone(),
            });
        }

        fn send_calculated_rate(&self, rate: &CalculatedRate) {
            self.published
                .lock()
                .push(PublishedRate::Calculated { rate: rate.clone() });
        }
    }

    fn rate(instrument: &str, bid: Decimal, ask: Decimal) -> Rate {
        Rate::new(instrument, bid, ask, Utc::now())
    }

    fn manager(publisher: Arc<dyn RatePublisher>) -> (RateManager, PipelineMetrics) {
        let metrics = PipelineMetrics::new(&Registry::new()).unwrap();
        let manager = RateManager::new(
            Arc::new(RateCache::default()),
            publisher,
            DerivationConfig::default(),
            metrics.clone(),
        );
        (manager, metrics)
    }

    #[test]
    fn test_first_rate_bypasses_validation() {
        let mut publisher = MockRatePublisher::new();
        publisher
            .expect_send_raw_rate()
            .times(2)
            .returning(|_, _| ());
        publisher.expect_send_calculated_rate().never();
        let (manager, _) = manager(Arc::new(publisher));

        manager.handle_first_rate("TCP", "USDTRY", rate("USDTRY", dec!(32.0), dec!(32.4)));
        // Wildly off, still stored
        manager.handle_first_rate("REST", "USDTRY", rate("USDTRY", dec!(50.0), dec!(50.4)));

        assert_eq!(manager.cache().get_raw("REST", "USDTRY").unwrap().bid, dec!(50.0));
        assert_eq!(manager.cache().scan_by_instrument("USDTRY").len(), 2);
    }

    #[test]
    fn test_outlier_update_is_rejected() {
        let mut publisher = MockRatePublisher::new();
        publisher
            .expect_send_raw_rate()
            .withf(|_, rate| rate.bid != dec!(40.0))
            .times(2)
            .returning(|_, _| ());
        publisher.expect_send_calculated_rate().never();
        let (manager, metrics) = manager(Arc::new(publisher));

        manager.handle_first_rate("TCP", "USDTRY", rate("USDTRY", dec!(32.0), dec!(32.4)));
        manager.handle_first_rate("REST", "USDTRY", rate("USDTRY", dec!(32.2), dec!(32.6)));

        let outcome = manager.handle_rate_update("TCP", "USDTRY", rate("USDTRY", dec!(40.0), dec!(40.4)));

        assert_eq!(outcome, UpdateOutcome::Rejected);
        assert_eq!(manager.cache().get_raw("TCP", "USDTRY").unwrap().bid, dec!(32.0));
        assert!(manager.cache().get_calculated("USDTRY").is_none());
        assert_eq!(
            metrics.rates_rejected.with_label_values(&["TCP", "USDTRY"]).get(),
            1
        );
    }

    #[test]
    fn test_anchor_update_publishes_consensus() {
        let publisher = Arc::new(RecordingPublisher::default());
        let (manager, _) = manager(publisher.clone());

        manager.handle_first_rate("TCP", "USDTRY", rate("USDTRY", dec!(32.0), dec!(32.4)));
        manager.handle_first_rate("REST", "USDTRY", rate("USDTRY", dec!(32.2), dec!(32.6)));

        let outcome = manager.handle_rate_update("TCP", "USDTRY", rate("USDTRY", dec!(32.0), dec!(32.4)));
        assert_eq!(outcome, UpdateOutcome::Accepted);

        let consensus = manager.cache().get_calculated("USDTRY").unwrap();
        assert_eq!(consensus.bid, dec!(32.1));
        assert_eq!(consensus.ask, dec!(32.5));

        let calculated = publisher.calculated();
        assert_eq!(calculated.len(), 1);
        assert_eq!(calculated[0].instrument, "USDTRY");
        // No dependent source cached yet
        assert!(manager.cache().get_calculated("EURTRY").is_none());
    }

    #[test]
    fn test_dependent_update_rebases_on_anchor() {
        let publisher = Arc::new(RecordingPublisher::default());
        let (manager, metrics) = manager(publisher.clone());

        manager.handle_first_rate("TCP", "USDTRY", rate("USDTRY", dec!(32.0), dec!(32.4)));
        manager.handle_first_rate("REST", "USDTRY", rate("USDTRY", dec!(32.2), dec!(32.6)));
        manager.handle_first_rate("TCP", "EURUSD", rate("EURUSD", dec!(1.10), dec!(1.13)));
        manager.handle_first_rate("REST", "EURUSD", rate("EURUSD", dec!(1.12), dec!(1.15)));

        let outcome = manager.handle_rate_update("TCP", "EURUSD", rate("EURUSD", dec!(1.10), dec!(1.13)));
        assert_eq!(outcome, UpdateOutcome::Accepted);

        // Anchor mid 32.3, EURUSD means 1.11 / 1.14
        let eurtry = manager.cache().get_calculated("EURTRY").unwrap();
        assert_eq!(eurtry.bid, dec!(35.853));
        assert_eq!(eurtry.ask, dec!(36.822));
        assert!(manager.cache().get_calculated("EURUSD").is_none());
        assert_eq!(
            metrics.calculated_rates.with_label_values(&["EURTRY"]).get(),
            1
        );

        // An anchor update re-bases every dependent with live sources
        manager.handle_rate_update("REST", "USDTRY", rate("USDTRY", dec!(32.2), dec!(32.6)));
        let instruments: Vec<String> = publisher
            .calculated()
            .into_iter()
            .map(|r| r.instrument)
            .collect();
        assert_eq!(instruments, vec!["EURTRY", "USDTRY", "EURTRY"]);
        assert!(manager.cache().get_calculated("GBPTRY").is_none());
    }

    #[test]
    fn test_dependent_without_anchor_is_not_derived() {
        let publisher = Arc::new(RecordingPublisher::default());
        let (manager, _) = manager(publisher.clone());

        manager.handle_first_rate("TCP", "GBPUSD", rate("GBPUSD", dec!(1.25), dec!(1.26)));
        let outcome = manager.handle_rate_update("TCP", "GBPUSD", rate("GBPUSD", dec!(1.251), dec!(1.261)));

        assert_eq!(outcome, UpdateOutcome::Accepted);
        assert!(publisher.calculated().is_empty());
        assert_eq!(manager.cache().get_raw("TCP", "GBPUSD").unwrap().bid, dec!(1.251));
    }

    #[test]
    fn test_update_without_peers_is_seeded() {
        let mut publisher = MockRatePublisher::new();
        publisher
            .expect_send_raw_rate()
            .withf(|platform, rate| platform == "TCP" && rate.instrument == "USDTRY")
            .times(1)
            .returning(|_, _| ());
        let (manager, _) = manager(Arc::new(publisher));

        let outcome = manager.handle_rate_update("TCP", "USDTRY", rate("USDTRY", dec!(32.0), dec!(32.4)));

        assert_eq!(outcome, UpdateOutcome::Seeded);
        assert!(manager.cache().get_raw("TCP", "USDTRY").is_some());
    }
}
