// 4.0: leveraged position tracking. isolated margin: each position holds its own margin
// and can lose at most that much. pnl = ((mark - entry) / entry) * margin * leverage.
// 4.1 has open/merge/close transitions at the bottom.

use crate::calc::{self, Overflow, Precision};
use crate::types::{AccountId, Instrument, Leverage, PositionId, Price, Quote, Side, Timestamp};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PositionStatus {
    Open,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CloseReason {
    Manual,
    StopLoss,
    TakeProfit,
    Liquidation,
}

impl std::fmt::Display for CloseReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            CloseReason::Manual => "manual",
            CloseReason::StopLoss => "stop_loss",
            CloseReason::TakeProfit => "take_profit",
            CloseReason::Liquidation => "liquidation",
        };
        f.write_str(label)
    }
}

/// Optional stop-loss and take-profit levels attached to an open position.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RiskLevels {
    pub stop_loss: Option<Price>,
    pub take_profit: Option<Price>,
}

impl RiskLevels {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn new(stop_loss: Option<Price>, take_profit: Option<Price>) -> Self {
        Self {
            stop_loss,
            take_profit,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.stop_loss.is_none() && self.take_profit.is_none()
    }

    /// Stop-loss must sit on the losing side of entry and take-profit on the winning side.
    pub fn validate(&self, side: Side, entry: Price) -> Result<(), RiskLevelViolation> {
        if let Some(sl) = self.stop_loss {
            let on_loss_side = match side {
                Side::Long => sl < entry,
                Side::Short => sl > entry,
            };
            if !on_loss_side {
                return Err(RiskLevelViolation::StopLossOnProfitSide { side, stop_loss: sl, entry });
            }
        }
        if let Some(tp) = self.take_profit {
            let on_profit_side = match side {
                Side::Long => tp > entry,
                Side::Short => tp < entry,
            };
            if !on_profit_side {
                return Err(RiskLevelViolation::TakeProfitOnLossSide { side, take_profit: tp, entry });
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RiskLevelViolation {
    #[error("stop loss {stop_loss} is not on the loss side of entry {entry} for a {side} position")]
    StopLossOnProfitSide { side: Side, stop_loss: Price, entry: Price },

    #[error("take profit {take_profit} is not on the profit side of entry {entry} for a {side} position")]
    TakeProfitOnLossSide { side: Side, take_profit: Price, entry: Price },
}

/// Input to the ledger. Not persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeRequest {
    pub account_id: AccountId,
    pub instrument: Instrument,
    pub side: Side,
    pub margin: Quote,
    // raw caller input; validated against the account limit on open
    pub leverage: u32,
    // mark quoted to the caller when the request was built
    pub entry_price: Price,
    pub requested_at: Timestamp,
}

impl TradeRequest {
    pub fn new(
        account_id: AccountId,
        instrument: impl Into<Instrument>,
        side: Side,
        margin: Quote,
        leverage: u32,
        entry_price: Price,
    ) -> Self {
        Self {
            account_id,
            instrument: instrument.into(),
            side,
            margin,
            leverage,
            entry_price,
            requested_at: Timestamp::now(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub id: PositionId,
    pub account_id: AccountId,
    pub instrument: Instrument,
    pub side: Side,
    pub margin: Quote,
    pub leverage: Leverage,
    pub entry_price: Price,
    pub liquidation_price: Price,
    pub risk_levels: RiskLevels,
    pub status: PositionStatus,
    pub exit_price: Option<Price>,
    pub realized_pnl: Option<Quote>,
    pub close_reason: Option<CloseReason>,
    pub unrealized_pnl: Quote,
    pub mark_price: Option<Price>,
    pub opened_at: Timestamp,
    pub updated_at: Timestamp,
    pub closed_at: Option<Timestamp>,
    // bumped by the store on every committed write
    pub version: u64,
}

impl Position {
    pub fn is_open(&self) -> bool {
        self.status == PositionStatus::Open
    }

    pub fn is_closed(&self) -> bool {
        self.status == PositionStatus::Closed
    }

    pub fn notional(&self) -> Result<Quote, Overflow> {
        calc::position_size(self.margin, self.leverage)
    }

    // 4.1: paper gains/losses at the given mark
    pub fn unrealized_at(&self, mark: Price, precision: &Precision) -> Result<Quote, Overflow> {
        calc::pnl(self.entry_price, mark, self.margin, self.leverage, self.side, precision)
    }

    // 4.2: margin + pnl. hits zero at the liquidation price
    pub fn equity_at(&self, mark: Price, precision: &Precision) -> Result<Quote, Overflow> {
        self.margin
            .checked_add(self.unrealized_at(mark, precision)?)
            .ok_or(Overflow("position equity"))
    }
}

// 4.3: fresh position from a validated request
pub fn open_position(
    id: PositionId,
    request: &TradeRequest,
    leverage: Leverage,
    precision: &Precision,
    timestamp: Timestamp,
) -> Result<Position, Overflow> {
    let entry = request.entry_price.round_to_tick(precision.price_scale);
    // sizes that can't be expressed are refused up front
    calc::position_size(request.margin, leverage)?;
    Ok(Position {
        id,
        account_id: request.account_id,
        instrument: request.instrument.clone(),
        side: request.side,
        margin: request.margin,
        leverage,
        entry_price: entry,
        liquidation_price: calc::liquidation_price(entry, leverage, request.side, precision)?,
        risk_levels: RiskLevels::none(),
        status: PositionStatus::Open,
        exit_price: None,
        realized_pnl: None,
        close_reason: None,
        unrealized_pnl: Quote::zero(),
        mark_price: Some(entry),
        opened_at: timestamp,
        updated_at: timestamp,
        closed_at: None,
        version: 0,
    })
}

// 4.4: adds a same-side leg. margin sums, entry averages by margin, leverage follows the
// larger leg, liquidation price is recomputed. risk levels carry over untouched.
pub fn merge_position(
    existing: &Position,
    added_margin: Quote,
    added_leverage: Leverage,
    fill_price: Price,
    precision: &Precision,
    timestamp: Timestamp,
) -> Result<Position, Overflow> {
    debug_assert!(existing.is_open(), "merge target must be open");

    let fill = fill_price.round_to_tick(precision.price_scale);
    let entry = calc::merge_entry(existing.margin, existing.entry_price, added_margin, fill, precision)?;
    let leverage = calc::merge_leverage(existing.margin, existing.leverage, added_margin, added_leverage);
    let merged_margin = existing
        .margin
        .checked_add(added_margin)
        .ok_or(Overflow("merged margin"))?;
    calc::position_size(merged_margin, leverage)?;

    let mut merged = Position {
        margin: merged_margin,
        leverage,
        entry_price: entry,
        liquidation_price: calc::liquidation_price(entry, leverage, existing.side, precision)?,
        updated_at: timestamp,
        ..existing.clone()
    };
    if let Some(mark) = existing.mark_price {
        merged.unrealized_pnl = merged.unrealized_at(mark, precision)?;
    }
    Ok(merged)
}

// 4.5: live re-pricing of an open position
pub fn reprice_position(
    position: &Position,
    mark: Price,
    precision: &Precision,
    timestamp: Timestamp,
) -> Result<Position, Overflow> {
    let mark = mark.round_to_tick(precision.price_scale);
    Ok(Position {
        unrealized_pnl: position.unrealized_at(mark, precision)?,
        mark_price: Some(mark),
        updated_at: timestamp,
        ..position.clone()
    })
}

#[derive(Debug, Clone)]
pub struct CloseOutcome {
    pub position: Position,
    // margin + bounded pnl, never negative
    pub payout: Quote,
}

// 4.6: terminal transition. realized pnl is bounded by the margin so the payout can't
// go below zero.
pub fn close_position(
    position: &Position,
    exit_price: Price,
    reason: CloseReason,
    precision: &Precision,
    timestamp: Timestamp,
) -> Result<CloseOutcome, Overflow> {
    debug_assert!(position.is_open(), "close target must be open");

    let exit = exit_price.round_to_tick(precision.price_scale);
    let raw = position.unrealized_at(exit, precision)?;
    let realized = calc::bounded_pnl(raw, position.margin);
    let payout = position
        .margin
        .checked_add(realized)
        .ok_or(Overflow("payout"))?;

    let closed = Position {
        status: PositionStatus::Closed,
        exit_price: Some(exit),
        realized_pnl: Some(realized),
        close_reason: Some(reason),
        unrealized_pnl: Quote::zero(),
        mark_price: Some(exit),
        updated_at: timestamp,
        closed_at: Some(timestamp),
        ..position.clone()
    };

    Ok(CloseOutcome {
        position: closed,
        payout,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn px(v: rust_decimal::Decimal) -> Price {
        Price::new_unchecked(v)
    }

    fn test_position(side: Side) -> Position {
        let request = TradeRequest::new(AccountId(1), "BTC-USD", side, Quote::new(dec!(50)), 10, px(dec!(100)));
        open_position(
            PositionId(1),
            &request,
            Leverage::new(10).unwrap(),
            &Precision::default(),
            Timestamp::from_millis(0),
        )
        .unwrap()
    }

    #[test]
    fn open_sets_liquidation_price() {
        assert_eq!(test_position(Side::Long).liquidation_price.value(), dec!(90));
        assert_eq!(test_position(Side::Short).liquidation_price.value(), dec!(110));
        assert!(test_position(Side::Long).is_open());
    }

    #[test]
    fn unrealized_pnl_long_and_short() {
        let p = Precision::default();
        assert_eq!(test_position(Side::Long).unrealized_at(px(dec!(110)), &p).unwrap().value(), dec!(50));
        assert_eq!(test_position(Side::Short).unrealized_at(px(dec!(110)), &p).unwrap().value(), dec!(-50));
        assert_eq!(test_position(Side::Short).unrealized_at(px(dec!(95)), &p).unwrap().value(), dec!(25));
    }

    #[test]
    fn equity_zero_at_liquidation() {
        let pos = test_position(Side::Long);
        let equity = pos.equity_at(pos.liquidation_price, &Precision::default()).unwrap();
        assert_eq!(equity.value(), dec!(0));
    }

    #[test]
    fn merge_averages_entry_and_sums_margin() {
        let pos = test_position(Side::Long);
        let merged = merge_position(
            &pos,
            Quote::new(dec!(50)),
            Leverage::new(10).unwrap(),
            px(dec!(110)),
            &Precision::default(),
            Timestamp::from_millis(1000),
        )
        .unwrap();

        assert_eq!(merged.margin.value(), dec!(100));
        assert_eq!(merged.entry_price.value(), dec!(105));
        assert_eq!(merged.liquidation_price.value(), dec!(94.5));
        assert_eq!(merged.id, pos.id);
        assert_eq!(merged.opened_at, pos.opened_at);
    }

    #[test]
    fn merge_keeps_larger_leg_leverage() {
        let pos = test_position(Side::Long); // 50 @ 10x
        let merged = merge_position(
            &pos,
            Quote::new(dec!(150)),
            Leverage::new(4).unwrap(),
            px(dec!(100)),
            &Precision::default(),
            Timestamp::from_millis(1000),
        )
        .unwrap();

        assert_eq!(merged.leverage.value(), 4);
        assert_eq!(merged.liquidation_price.value(), dec!(75));
    }

    #[test]
    fn close_books_realized_pnl() {
        let pos = test_position(Side::Long);
        let outcome = close_position(
            &pos,
            px(dec!(110)),
            CloseReason::Manual,
            &Precision::default(),
            Timestamp::from_millis(2000),
        )
        .unwrap();

        assert!(outcome.position.is_closed());
        assert_eq!(outcome.position.exit_price, Some(px(dec!(110))));
        assert_eq!(outcome.position.realized_pnl, Some(Quote::new(dec!(50))));
        assert_eq!(outcome.position.closed_at, Some(Timestamp::from_millis(2000)));
        assert_eq!(outcome.payout.value(), dec!(100));
    }

    #[test]
    fn close_past_liquidation_pays_nothing() {
        let pos = test_position(Side::Long);
        // gapped straight through 90
        let outcome = close_position(
            &pos,
            px(dec!(80)),
            CloseReason::Liquidation,
            &Precision::default(),
            Timestamp::from_millis(2000),
        )
        .unwrap();

        assert_eq!(outcome.position.realized_pnl, Some(Quote::new(dec!(-50))));
        assert_eq!(outcome.payout.value(), dec!(0));
    }

    #[test]
    fn sub_tick_exit_settles_at_one_tick() {
        let pos = test_position(Side::Long);
        let outcome = close_position(
            &pos,
            px(dec!(0.004)),
            CloseReason::Liquidation,
            &Precision::default(),
            Timestamp::from_millis(2000),
        )
        .unwrap();

        assert_eq!(outcome.position.exit_price, Some(px(dec!(0.01))));
        assert_eq!(outcome.position.realized_pnl, Some(Quote::new(dec!(-50))));
        assert_eq!(outcome.payout.value(), dec!(0));
    }

    #[test]
    fn reprice_rounds_mark_to_tick() {
        let pos = test_position(Side::Short);
        let repriced = reprice_position(&pos, px(dec!(0.001)), &Precision::default(), Timestamp::from_millis(5)).unwrap();
        assert_eq!(repriced.mark_price, Some(px(dec!(0.01))));
        // 99.99% down on a 10x short: the full notional
        assert_eq!(repriced.unrealized_pnl.value(), dec!(499.95));
    }

    #[test]
    fn unrepresentable_size_is_refused() {
        let request = TradeRequest::new(
            AccountId(1),
            "BTC-USD",
            Side::Long,
            Quote::new(rust_decimal::Decimal::MAX),
            10,
            px(dec!(100)),
        );
        let result = open_position(
            PositionId(1),
            &request,
            Leverage::new(10).unwrap(),
            &Precision::default(),
            Timestamp::from_millis(0),
        );
        assert_eq!(result.unwrap_err(), Overflow("position size"));
    }

    #[test]
    fn risk_level_sides() {
        let entry = px(dec!(100));
        let ok = RiskLevels::new(Some(px(dec!(95))), Some(px(dec!(120))));
        assert!(ok.validate(Side::Long, entry).is_ok());
        assert!(ok.validate(Side::Short, entry).is_err());

        let short_ok = RiskLevels::new(Some(px(dec!(105))), Some(px(dec!(90))));
        assert!(short_ok.validate(Side::Short, entry).is_ok());

        let at_entry = RiskLevels::new(Some(entry), None);
        assert!(matches!(
            at_entry.validate(Side::Long, entry),
            Err(RiskLevelViolation::StopLossOnProfitSide { .. })
        ));

        assert!(RiskLevels::none().validate(Side::Long, entry).is_ok());
    }
}
