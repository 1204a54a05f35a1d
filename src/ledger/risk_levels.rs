//! Stop-loss / take-profit management.

use super::core::{hold, Ledger};
use super::results::EngineError;
use crate::events::{EventPayload, RiskLevelsUpdatedEvent};
use crate::position::{Position, RiskLevels};
use crate::types::{PositionId, Price, Timestamp};
use tracing::info;

impl Ledger {
    /// Replaces both levels on an open position. `None` clears a level.
    pub fn set_risk_levels(
        &self,
        position_id: PositionId,
        stop_loss: Option<Price>,
        take_profit: Option<Price>,
    ) -> Result<Position, EngineError> {
        let position = self
            .store
            .position(position_id)
            .ok_or(EngineError::PositionNotFound(position_id))?;
        let precision = self.precision(&position.instrument)?;

        let lock = self.account_lock(position.account_id);
        let _held = hold(&lock);

        let levels = RiskLevels::new(
            round_level(stop_loss, precision.price_scale, "stop loss")?,
            round_level(take_profit, precision.price_scale, "take profit")?,
        );
        let validate = self.config.validate_risk_levels;
        let now = Timestamp::now();

        let (_, updated) = self.write_open_position(position, |current| {
            if validate {
                levels.validate(current.side, current.entry_price)?;
            }
            Ok(Position {
                risk_levels: levels,
                updated_at: now,
                ..current.clone()
            })
        })?;

        self.emit_event(EventPayload::RiskLevelsUpdated(RiskLevelsUpdatedEvent {
            position_id,
            stop_loss: levels.stop_loss,
            take_profit: levels.take_profit,
        }));
        info!(
            %position_id,
            stop_loss = ?levels.stop_loss.map(|p| p.value()),
            take_profit = ?levels.take_profit.map(|p| p.value()),
            "risk levels set"
        );
        Ok(updated)
    }
}

// a level that rounds to zero could never fire
fn round_level(level: Option<Price>, scale: u32, name: &str) -> Result<Option<Price>, EngineError> {
    level
        .map(|price| {
            price.round(scale).ok_or_else(|| EngineError::InvalidRequest {
                reason: format!("{name} {price} is below one tick"),
            })
        })
        .transpose()
}
