//! Calculation engine
//!
//! Pure decimal arithmetic used to validate incoming quotes against their
//! peers and to derive consensus and cross rates. Nothing here touches the
//! cache or the network.

use rust_decimal::Decimal;
use rust_decimal_macros::dec;

use crate::model::Quote;

/// Maximum relative deviation of an incoming mid from the peer reference mid
pub const VALIDATION_TOLERANCE: Decimal = dec!(0.01);

/// Arithmetic mean, or `None` for an empty slice
pub fn mean(values: &[Decimal]) -> Option<Decimal> {
    if values.is_empty() {
        return None;
    }
    let total: Decimal = values.iter().copied().sum();
    Some(total / Decimal::from(values.len()))
}

/// Mid price of a bid/ask pair
pub fn mid_of(bid: Decimal, ask: Decimal) -> Decimal {
    (bid + ask) / Decimal::TWO
}

/// Reference mid built from cached peer bids and asks
pub fn reference_mid(peer_bids: &[Decimal], peer_asks: &[Decimal]) -> Option<Decimal> {
    Some(mid_of(mean(peer_bids)?, mean(peer_asks)?))
}

/// Check an incoming quote against the peer reference mid
///
/// Returns `None` when there is nothing to validate against: no peers, or a
/// reference mid that is not strictly positive.
pub fn is_valid(
    bid: Decimal,
    ask: Decimal,
    peer_bids: &[Decimal],
    peer_asks: &[Decimal],
) -> Option<bool> {
    let reference = reference_mid(peer_bids, peer_asks)?;
    if reference <= Decimal::ZERO {
        return None;
    }
    let deviation = (mid_of(bid, ask) - reference).abs() / reference;
    Some(deviation <= VALIDATION_TOLERANCE)
}

/// Consensus quote: mean of the peer bids and mean of the peer asks
pub fn aggregate(peer_bids: &[Decimal], peer_asks: &[Decimal]) -> Option<Quote> {
    Some(Quote::new(mean(peer_bids)?, mean(peer_asks)?))
}

/// Re-base a dependent instrument through the anchor instrument's mid
pub fn dependent_rate(
    peer_bids: &[Decimal],
    peer_asks: &[Decimal],
    anchor_mid: Decimal,
) -> Option<Quote> {
    Some(Quote::new(
        mean(peer_bids)? * anchor_mid,
        mean(peer_asks)? * anchor_mid,
    ))
}
