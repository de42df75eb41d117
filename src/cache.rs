//! Time-bounded rate cache
//!
//! Raw rates are keyed by (platform, instrument); calculated rates by
//! instrument alone. Every entry carries an expiry deadline: reads treat an
//! expired entry as absent and a background task sweeps them out.

use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::debug;

use crate::model::{CalculatedRate, Rate};

/// Default time-to-live for cache entries (30 minutes)
pub const DEFAULT_TTL: Duration = Duration::from_secs(30 * 60);

/// Cache key scope
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum CacheKey {
    Raw { platform: String, instrument: String },
    Calculated { instrument: String },
}

impl CacheKey {
    pub fn raw(platform: &str, instrument: &str) -> Self {
        CacheKey::Raw {
            platform: platform.to_string(),
            instrument: instrument.to_string(),
        }
    }

    pub fn calculated(instrument: &str) -> Self {
        CacheKey::Calculated {
            instrument: instrument.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum CachedValue {
    Raw(Rate),
    Calculated(CalculatedRate),
}

#[derive(Debug, Clone)]
struct CacheEntry {
    value: CachedValue,
    expires_at: Instant,
}

impl CacheEntry {
    fn is_live(&self, now: Instant) -> bool {
        now < self.expires_at
    }
}

/// Concurrent TTL cache for raw and calculated rates
#[derive(Debug)]
pub struct RateCache {
    entries: DashMap<CacheKey, CacheEntry>,
    ttl: Duration,
}

impl RateCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            ttl,
        }
    }

    /// Standard TTL applied by the typed helpers
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Insert or overwrite a value with an explicit TTL
    pub fn put(&self, key: CacheKey, value: CachedValue, ttl: Duration) {
        let entry = CacheEntry {
            value,
            expires_at: Instant::now() + ttl,
        };
        self.entries.insert(key, entry);
    }

    /// Read a value, treating expired entries as absent
    pub fn get(&self, key: &CacheKey) -> Option<CachedValue> {
        let now = Instant::now();
        let entry = self.entries.get(key)?;
        if entry.is_live(now) {
            Some(entry.value.clone())
        } else {
            None
        }
    }

    pub fn put_raw(&self, platform: &str, instrument: &str, rate: Rate) {
        self.put(
            CacheKey::raw(platform, instrument),
            CachedValue::Raw(rate),
            self.ttl,
        );
    }

    pub fn put_calculated(&self, rate: CalculatedRate) {
        let key = CacheKey::calculated(&rate.instrument);
        self.put(key, CachedValue::Calculated(rate), self.ttl);
    }

    pub fn get_raw(&self, platform: &str, instrument: &str) -> Option<Rate> {
        match self.get(&CacheKey::raw(platform, instrument))? {
            CachedValue::Raw(rate) => Some(rate),
            CachedValue::Calculated(_) => None,
        }
    }

    pub fn get_calculated(&self, instrument: &str) -> Option<CalculatedRate> {
        match self.get(&CacheKey::calculated(instrument))? {
            CachedValue::Calculated(rate) => Some(rate),
            CachedValue::Raw(_) => None,
        }
    }

    /// All live raw rates for an instrument, across every platform
    pub fn scan_by_instrument(&self, instrument: &str) -> Vec<Rate> {
        let now = Instant::now();
        self.entries
            .iter()
            .filter(|entry| entry.value().is_live(now))
            .filter_map(|entry| match (entry.key(), &entry.value().value) {
                (CacheKey::Raw { instrument: i, .. }, CachedValue::Raw(rate)) if i == instrument => {
                    Some(rate.clone())
                }
                _ => None,
            })
            .collect()
    }

    /// Drop every expired entry, returning how many were removed
    pub fn evict_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries.retain(|_, entry| entry.is_live(now));
        before.saturating_sub(self.entries.len())
    }

    /// Number of stored entries, expired or not
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Start a background sweep of expired entries
    pub fn spawn_eviction(self: &Arc<Self>, every: Duration) -> JoinHandle<()> {
        let cache = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = interval(every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let evicted = cache.evict_expired();
                if evicted > 0 {
                    debug!(evicted, remaining = cache.len(), "Evicted expired cache entries");
                }
            }
        })
    }
}

impl Default for RateCache {
    fn default() -> Self {
        Self::new(DEFAULT_TTL)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use rust_decimal_macros::dec;

    fn rate(instrument: &str, bid: rust_decimal::Decimal) -> Rate {
        Rate::new(instrument, bid, bid + dec!(0.1), Utc::now())
    }

    #[tokio::test(start_paused = true)]
    async fn test_raw_rate_expires_lazily() {
        let cache = RateCache::new(Duration::from_secs(60));
        cache.put_raw("TCP", "USDTRY", rate("USDTRY", dec!(32.1)));

        assert!(cache.get_raw("TCP", "USDTRY").is_some());

        tokio::time::advance(Duration::from_secs(61)).await;
        assert!(cache.get_raw("TCP", "USDTRY").is_none());
        assert!(cache.scan_by_instrument("USDTRY").is_empty());
        // Still physically present until swept
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_evict_expired_removes_entries() {
        let cache = RateCache::new(Duration::from_secs(10));
        cache.put_raw("TCP", "USDTRY", rate("USDTRY", dec!(32.1)));
        cache.put(
            CacheKey::raw("REST", "USDTRY"),
            CachedValue::Raw(rate("USDTRY", dec!(32.2))),
            Duration::from_secs(100),
        );

        tokio::time::advance(Duration::from_secs(11)).await;
        assert_eq!(cache.evict_expired(), 1);
        assert_eq!(cache.len(), 1);
        assert!(cache.get_raw("REST", "USDTRY").is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_background_eviction() {
        let cache = Arc::new(RateCache::new(Duration::from_secs(5)));
        cache.put_raw("TCP", "EURUSD", rate("EURUSD", dec!(1.08)));
        let sweeper = cache.spawn_eviction(Duration::from_secs(1));

        tokio::time::sleep(Duration::from_secs(7)).await;
        assert!(cache.is_empty());
        sweeper.abort();
    }

    #[test]
    fn test_scan_by_instrument_spans_platforms() {
        let cache = RateCache::default();
        cache.put_raw("TCP", "USDTRY", rate("USDTRY", dec!(32.1)));
        cache.put_raw("REST", "USDTRY", rate("USDTRY", dec!(32.3)));
        cache.put_raw("TCP", "EURUSD", rate("EURUSD", dec!(1.08)));
        cache.put_calculated(CalculatedRate {
            instrument: "USDTRY".to_string(),
            bid: dec!(32.2),
            ask: dec!(32.3),
            computed_at: Utc::now(),
        });

        let mut bids: Vec<_> = cache
            .scan_by_instrument("USDTRY")
            .into_iter()
            .map(|r| r.bid)
            .collect();
        bids.sort();
        assert_eq!(bids, vec![dec!(32.1), dec!(32.3)]);
    }

    #[test]
    fn test_overwrite_is_last_write_wins() {
        let cache = RateCache::default();
        cache.put_raw("TCP", "USDTRY", rate("USDTRY", dec!(32.1)));
        cache.put_raw("TCP", "USDTRY", rate("USDTRY", dec!(32.4)));

        assert_eq!(cache.get_raw("TCP", "USDTRY").unwrap().bid, dec!(32.4));
        assert_eq!(cache.scan_by_instrument("USDTRY").len(), 1);
        assert!(cache.get_calculated("USDTRY").is_none());
    }
}
