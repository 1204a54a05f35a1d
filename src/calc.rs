// 2.0: risk calculator. pure functions, no state, no I/O.
// isolated margin with no maintenance buffer: a position is liquidated when its loss
// equals its whole margin.
//
// every price comes back rounded to the instrument's price scale and every pnl to its
// quote scale, both with banker's rounding. arithmetic is checked: a result that does
// not fit in a Decimal comes back as `Overflow`.

use crate::types::{round_bankers, Leverage, Price, Quote, Side};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Decimal places used when rounding computed values for one instrument.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Precision {
    pub price_scale: u32,
    pub quote_scale: u32,
}

impl Default for Precision {
    fn default() -> Self {
        Self {
            price_scale: 2,
            quote_scale: 2,
        }
    }
}

/// A calculation whose result does not fit in a Decimal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("{0} out of range")]
pub struct Overflow(pub &'static str);

// 2.1: notional = margin * leverage
pub fn position_size(margin: Quote, leverage: Leverage) -> Result<Quote, Overflow> {
    margin
        .checked_mul(leverage.as_decimal())
        .ok_or(Overflow("position size"))
}

// 2.2: long: entry * (1 - 1/L). short: entry * (1 + 1/L).
// 1x long liquidates at zero, which Price can't hold, so it is clamped to one tick.
pub fn liquidation_price(
    entry: Price,
    leverage: Leverage,
    side: Side,
    precision: &Precision,
) -> Result<Price, Overflow> {
    let fraction = leverage.margin_fraction();
    let factor = match side {
        Side::Long => Decimal::ONE - fraction,
        Side::Short => Decimal::ONE + fraction,
    };
    let raw = entry
        .value()
        .checked_mul(factor)
        .ok_or(Overflow("liquidation price"))?;
    Ok(to_price(raw, precision))
}

// 2.3: ((mark - entry) / entry) * size * sign
pub fn pnl(
    entry: Price,
    mark: Price,
    margin: Quote,
    leverage: Leverage,
    side: Side,
    precision: &Precision,
) -> Result<Quote, Overflow> {
    let size = position_size(margin, leverage)?;
    let raw = mark
        .value()
        .checked_sub(entry.value())
        .and_then(|delta| delta.checked_div(entry.value()))
        .and_then(|change| change.checked_mul(size.value()))
        .ok_or(Overflow("pnl"))?;
    Ok(Quote::new(raw * side.sign()).round(precision.quote_scale))
}

// 2.4: losses are capped at the margin posted. a price gap past the liquidation level
// can't take more from the account than the position holds.
pub fn bounded_pnl(raw: Quote, margin: Quote) -> Quote {
    if raw.value() < -margin.value() {
        margin.negate()
    } else {
        raw
    }
}

// 2.5: margin-weighted average entry for two legs on the same side
pub fn merge_entry(m1: Quote, e1: Price, m2: Quote, e2: Price, precision: &Precision) -> Result<Price, Overflow> {
    let overflow = Overflow("merged entry");
    let total = m1.checked_add(m2).ok_or(overflow)?.value();
    if total.is_zero() {
        return Ok(e1);
    }
    let weighted = m1
        .value()
        .checked_mul(e1.value())
        .zip(m2.value().checked_mul(e2.value()))
        .and_then(|(a, b)| a.checked_add(b))
        .and_then(|sum| sum.checked_div(total))
        .ok_or(overflow)?;
    Ok(to_price(weighted, precision))
}

// 2.6: the merged position keeps the leverage of the larger-margin leg.
// a tie keeps the leverage already on the book.
pub fn merge_leverage(existing_margin: Quote, existing: Leverage, incoming_margin: Quote, incoming: Leverage) -> Leverage {
    if incoming_margin > existing_margin {
        incoming
    } else {
        existing
    }
}

fn to_price(raw: Decimal, precision: &Precision) -> Price {
    Price::new(round_bankers(raw, precision.price_scale)).unwrap_or_else(|| Price::tick(precision.price_scale))
}
