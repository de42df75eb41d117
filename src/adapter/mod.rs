//! Venue adapters
//!
//! Each adapter owns exactly one venue connection and reports what happens on
//! it through an [`EventSink`]. Adapters never touch platform state: the
//! coordinator's worker for the platform is the only one deciding what an
//! event means.

mod polling;
mod registry;
mod streaming;

pub use polling::PollingAdapter;
pub use registry::{AdapterFactory, AdapterRegistry};
pub use streaming::StreamingAdapter;

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashSet;
use tokio::sync::mpsc;
use tracing::trace;

use crate::error::Result;
use crate::model::Rate;

/// Capability shared by every venue transport
#[async_trait]
pub trait PlatformAdapter: Send + Sync {
    /// Platform name this adapter serves
    fn platform(&self) -> &str;

    /// Adapter tag ("streaming", "polling")
    fn kind(&self) -> &str;

    /// Open the transport and authenticate
    ///
    /// Emits `Connected { ok }` in every case; on failure all transport
    /// resources are released before the event is sent.
    async fn connect(&self) -> Result<()>;

    /// Request the feed for one instrument; duplicates are a no-op
    async fn subscribe(&self, instrument: &str) -> Result<()>;

    /// Cancel the feed for one instrument; no-op when not subscribed
    async fn unsubscribe(&self, instrument: &str) -> Result<()>;

    /// Release every resource without emitting an event
    async fn disconnect(&self);

    /// Snapshot of the currently subscribed instruments
    fn subscriptions(&self) -> Vec<String>;
}

/// Event reported by an adapter to its platform worker
#[derive(Debug, Clone, PartialEq)]
pub enum PlatformEvent {
    Connected { ok: bool },
    Disconnected,
    RateAvailable { instrument: String, rate: Rate },
    RateUpdate { instrument: String, rate: Rate },
}

/// Per-platform handle adapters use to report events
#[derive(Debug, Clone)]
pub struct EventSink {
    platform: String,
    tx: mpsc::UnboundedSender<PlatformEvent>,
}

impl EventSink {
    pub fn new(platform: &str, tx: mpsc::UnboundedSender<PlatformEvent>) -> Self {
        Self {
            platform: platform.to_string(),
            tx,
        }
    }

    /// Create a sink together with the receiving end
    pub fn channel(platform: &str) -> (Self, mpsc::UnboundedReceiver<PlatformEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self::new(platform, tx), rx)
    }

    pub fn platform(&self) -> &str {
        &self.platform
    }

    pub fn on_connect(&self, ok: bool) {
        self.send(PlatformEvent::Connected { ok });
    }

    pub fn on_disconnect(&self) {
        self.send(PlatformEvent::Disconnected);
    }

    pub fn on_rate_available(&self, instrument: &str, rate: Rate) {
        self.send(PlatformEvent::RateAvailable {
            instrument: instrument.to_string(),
            rate,
        });
    }

    pub fn on_rate_update(&self, instrument: &str, rate: Rate) {
        self.send(PlatformEvent::RateUpdate {
            instrument: instrument.to_string(),
            rate,
        });
    }

    fn send(&self, event: PlatformEvent) {
        // Receiver is gone only once the coordinator has shut down
        if self.tx.send(event).is_err() {
            trace!(platform = %self.platform, "Event dropped, coordinator stopped");
        }
    }
}

/// Tracks which instruments have produced a quote since the last connect
///
/// The first quote of an instrument is reported as available, later ones as
/// updates.
#[derive(Debug, Default)]
pub(crate) struct FirstSeen {
    seen: Mutex<HashSet<String>>,
}

impl FirstSeen {
    /// Report a quote through the sink, picking the event kind
    pub(crate) fn dispatch(&self, events: &EventSink, instrument: &str, rate: Rate) {
        let first = self.seen.lock().insert(instrument.to_string());
        if first {
            events.on_rate_available(instrument, rate);
        } else {
            events.on_rate_update(instrument, rate);
        }
    }

    pub(crate) fn forget(&self, instrument: &str) {
        self.seen.lock().remove(instrument);
    }

    pub(crate) fn clear(&self) {
        self.seen.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use rust_decimal_macros::dec;

    #[test]
    fn test_first_seen_dispatch() {
        let (sink, mut rx) = EventSink::channel("TCP");
        let seen = FirstSeen::default();
        let rate = Rate::new("USDTRY", dec!(32.1), dec!(32.2), Utc::now());

        seen.dispatch(&sink, "USDTRY", rate.clone());
        seen.dispatch(&sink, "USDTRY", rate.clone());
        seen.clear();
        seen.dispatch(&sink, "USDTRY", rate);

        assert!(matches!(rx.try_recv().unwrap(), PlatformEvent::RateAvailable { .. }));
        assert!(matches!(rx.try_recv().unwrap(), PlatformEvent::RateUpdate { .. }));
        assert!(matches!(rx.try_recv().unwrap(), PlatformEvent::RateAvailable { .. }));
        assert!(rx.try_recv().is_err());
    }
}
