//! Risk triggers: liquidation, stop-loss and take-profit checks.
//!
//! A trigger is a price condition on an open position. The checks here are pure; the
//! evaluator feeds them marks and asks the ledger to close whatever fires.

use crate::position::{CloseReason, Position};
use crate::types::{Price, Side};

/// How the mark must relate to the level for a trigger to fire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerCondition {
    /// Fires when the mark is at or above the level.
    AtOrAbove,
    /// Fires when the mark is at or below the level.
    AtOrBelow,
}

impl TriggerCondition {
    /// Adverse moves: down for longs, up for shorts.
    pub fn adverse(side: Side) -> Self {
        match side {
            Side::Long => TriggerCondition::AtOrBelow,
            Side::Short => TriggerCondition::AtOrAbove,
        }
    }

    pub fn favorable(side: Side) -> Self {
        match side {
            Side::Long => TriggerCondition::AtOrAbove,
            Side::Short => TriggerCondition::AtOrBelow,
        }
    }

    pub fn is_met(&self, mark: Price, level: Price) -> bool {
        match self {
            TriggerCondition::AtOrAbove => mark >= level,
            TriggerCondition::AtOrBelow => mark <= level,
        }
    }
}

pub fn should_liquidate(position: &Position, mark: Price) -> bool {
    TriggerCondition::adverse(position.side).is_met(mark, position.liquidation_price)
}

pub fn should_stop_loss(position: &Position, mark: Price) -> bool {
    position
        .risk_levels
        .stop_loss
        .map(|sl| TriggerCondition::adverse(position.side).is_met(mark, sl))
        .unwrap_or(false)
}

pub fn should_take_profit(position: &Position, mark: Price) -> bool {
    position
        .risk_levels
        .take_profit
        .map(|tp| TriggerCondition::favorable(position.side).is_met(mark, tp))
        .unwrap_or(false)
}

/// The one close reason that applies at `mark`, if any.
/// Liquidation beats stop-loss, stop-loss beats take-profit.
pub fn check_trigger(position: &Position, mark: Price) -> Option<CloseReason> {
    if !position.is_open() {
        return None;
    }
    if should_liquidate(position, mark) {
        Some(CloseReason::Liquidation)
    } else if should_stop_loss(position, mark) {
        Some(CloseReason::StopLoss)
    } else if should_take_profit(position, mark) {
        Some(CloseReason::TakeProfit)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calc::Precision;
    use crate::position::{close_position, open_position, RiskLevels, TradeRequest};
    use crate::types::{AccountId, Leverage, PositionId, Quote, Timestamp};
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;

    fn px(v: Decimal) -> Price {
        Price::new_unchecked(v)
    }

    fn position(side: Side, stop_loss: Option<Decimal>, take_profit: Option<Decimal>) -> Position {
        let request = TradeRequest::new(AccountId(1), "BTC-USD", side, Quote::new(dec!(50)), 10, px(dec!(100)));
        let mut pos = open_position(
            PositionId(1),
            &request,
            Leverage::new(10).unwrap(),
            &Precision::default(),
            Timestamp::from_millis(0),
        )
        .unwrap();
        pos.risk_levels = RiskLevels::new(stop_loss.map(px), take_profit.map(px));
        pos
    }

    #[test]
    fn liquidation_long_and_short() {
        let long = position(Side::Long, None, None);
        assert_eq!(check_trigger(&long, px(dec!(90.01))), None);
        assert_eq!(check_trigger(&long, px(dec!(90))), Some(CloseReason::Liquidation));
        assert_eq!(check_trigger(&long, px(dec!(80))), Some(CloseReason::Liquidation));

        let short = position(Side::Short, None, None);
        assert_eq!(check_trigger(&short, px(dec!(109.99))), None);
        assert_eq!(check_trigger(&short, px(dec!(110))), Some(CloseReason::Liquidation));
    }

    #[test]
    fn stop_loss_long() {
        let pos = position(Side::Long, Some(dec!(95)), None);
        assert_eq!(check_trigger(&pos, px(dec!(96))), None);
        assert_eq!(check_trigger(&pos, px(dec!(95))), Some(CloseReason::StopLoss));
    }

    #[test]
    fn stop_loss_short() {
        let pos = position(Side::Short, Some(dec!(104)), None);
        assert_eq!(check_trigger(&pos, px(dec!(103))), None);
        assert_eq!(check_trigger(&pos, px(dec!(104.5))), Some(CloseReason::StopLoss));
    }

    #[test]
    fn take_profit_both_sides() {
        let long = position(Side::Long, None, Some(dec!(120)));
        assert_eq!(check_trigger(&long, px(dec!(119))), None);
        assert_eq!(check_trigger(&long, px(dec!(120))), Some(CloseReason::TakeProfit));

        let short = position(Side::Short, None, Some(dec!(92)));
        assert_eq!(check_trigger(&short, px(dec!(91))), Some(CloseReason::TakeProfit));
    }

    #[test]
    fn liquidation_beats_other_levels() {
        // unvalidated levels can overlap the liquidation price
        let pos = position(Side::Long, Some(dec!(85)), Some(dec!(80)));
        assert_eq!(check_trigger(&pos, px(dec!(80))), Some(CloseReason::Liquidation));
    }

    #[test]
    fn stop_loss_beats_take_profit() {
        let pos = position(Side::Long, Some(dec!(95)), Some(dec!(94)));
        assert_eq!(check_trigger(&pos, px(dec!(93))), Some(CloseReason::StopLoss));
    }

    #[test]
    fn closed_positions_never_fire() {
        let pos = position(Side::Long, None, None);
        let closed = close_position(
            &pos,
            px(dec!(100)),
            CloseReason::Manual,
            &Precision::default(),
            Timestamp::from_millis(1),
        )
        .unwrap()
        .position;
        assert_eq!(check_trigger(&closed, px(dec!(50))), None);
    }
}
