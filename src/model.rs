//! Rate types shared across the pipeline

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// A quote as reported by one platform for one instrument
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rate {
    pub instrument: String,
    pub bid: Decimal,
    pub ask: Decimal,
    pub observed_at: DateTime<Utc>,
}

impl Rate {
    pub fn new(instrument: &str, bid: Decimal, ask: Decimal, observed_at: DateTime<Utc>) -> Self {
        Self {
            instrument: instrument.to_string(),
            bid,
            ask,
            observed_at,
        }
    }
}

/// A consensus or re-based rate, not attributed to any single platform
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalculatedRate {
    pub instrument: String,
    pub bid: Decimal,
    pub ask: Decimal,
    pub computed_at: DateTime<Utc>,
}

impl CalculatedRate {
    /// Stamp a calculated quote with the current time
    pub fn now(instrument: &str, quote: Quote) -> Self {
        Self {
            instrument: instrument.to_string(),
            bid: quote.bid,
            ask: quote.ask,
            computed_at: Utc::now(),
        }
    }
}

/// Bid/ask pair produced by the calculation engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Quote {
    pub bid: Decimal,
    pub ask: Decimal,
}

impl Quote {
    pub fn new(bid: Decimal, ask: Decimal) -> Self {
        Self { bid, ask }
    }

    /// Mid price (average of bid and ask)
    pub fn mid(&self) -> Decimal {
        crate::calculation::mid_of(self.bid, self.ask)
    }
}
