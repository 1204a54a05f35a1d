//! Opening and merging positions.
//!
//! Both paths run under the account lock and follow the same shape: validate, reserve
//! margin, write the position. If the write fails the reserve is credited back.

use super::core::{hold, Ledger};
use super::results::EngineError;
use crate::calc::{self, Precision};
use crate::events::{BalanceEvent, EventPayload, PositionMergedEvent, PositionOpenedEvent};
use crate::position::{merge_position, open_position, Position, TradeRequest};
use crate::types::{Leverage, PositionId, Timestamp};
use tracing::{info, warn};

// what survived validation
struct CheckedRequest {
    leverage: Leverage,
    precision: Precision,
}

impl Ledger {
    /// Opens a position, or merges into the open one on the same side.
    pub fn open(&self, request: TradeRequest) -> Result<Position, EngineError> {
        let lock = self.account_lock(request.account_id);
        let _held = hold(&lock);

        let checked = self.check_request(&request)?;

        let open = self.store.open_positions_for(request.account_id, &request.instrument);
        if let Some(other) = open.iter().find(|p| p.side != request.side) {
            return Err(EngineError::ConflictingDirection {
                account_id: request.account_id,
                instrument: request.instrument.clone(),
                open_side: other.side,
            });
        }

        match open.into_iter().find(|p| p.side == request.side) {
            Some(existing) => self.merge_checked(existing, &request, &checked),
            None => self.open_new(&request, &checked),
        }
    }

    /// Adds a same-side leg to a specific open position.
    pub fn merge(&self, position_id: PositionId, request: TradeRequest) -> Result<Position, EngineError> {
        let lock = self.account_lock(request.account_id);
        let _held = hold(&lock);

        let checked = self.check_request(&request)?;
        let existing = self
            .store
            .position(position_id)
            .ok_or(EngineError::PositionNotFound(position_id))?;

        if existing.account_id != request.account_id
            || existing.instrument != request.instrument
            || existing.side != request.side
        {
            return Err(EngineError::InvalidRequest {
                reason: format!("request does not match {position_id}"),
            });
        }
        if !existing.is_open() {
            return Err(EngineError::PositionNotOpen(position_id));
        }

        self.merge_checked(existing, &request, &checked)
    }

    // everything here runs before any mutation
    fn check_request(&self, request: &TradeRequest) -> Result<CheckedRequest, EngineError> {
        let precision = self.precision(&request.instrument)?;

        if !request.margin.is_positive() {
            return Err(EngineError::InvalidRequest {
                reason: format!("margin must be positive, got {}", request.margin),
            });
        }
        if request.entry_price.round(precision.price_scale).is_none() {
            return Err(EngineError::InvalidRequest {
                reason: format!(
                    "entry price {} is below one tick for {}",
                    request.entry_price, request.instrument
                ),
            });
        }

        let account = self
            .store
            .account(request.account_id)
            .ok_or(EngineError::AccountNotFound(request.account_id))?;

        let max = account.max_leverage.value();
        let leverage = Leverage::new(request.leverage)
            .filter(|l| l.value() <= max)
            .ok_or(EngineError::LeverageExceedsLimit {
                requested: request.leverage,
                max,
            })?;

        account.can_trade()?;
        calc::position_size(request.margin, leverage)?;

        if request.margin > account.balance {
            return Err(EngineError::InsufficientBalance {
                requested: request.margin,
                available: account.balance,
            });
        }

        Ok(CheckedRequest { leverage, precision })
    }

    fn open_new(&self, request: &TradeRequest, checked: &CheckedRequest) -> Result<Position, EngineError> {
        self.reserve(request)?;

        let inserted = open_position(
            self.store.next_position_id(),
            request,
            checked.leverage,
            &checked.precision,
            Timestamp::now(),
        )
        .map_err(EngineError::from)
        .and_then(|position| self.store.insert_position(position).map_err(EngineError::from));

        let position = match inserted {
            Ok(position) => position,
            Err(err) => {
                self.compensate(request);
                return Err(err);
            }
        };

        self.emit_event(EventPayload::PositionOpened(PositionOpenedEvent {
            position_id: position.id,
            account_id: position.account_id,
            instrument: position.instrument.clone(),
            side: position.side,
            margin: position.margin,
            leverage: position.leverage,
            entry_price: position.entry_price,
            liquidation_price: position.liquidation_price,
        }));
        info!(
            position_id = %position.id,
            account_id = %position.account_id,
            instrument = %position.instrument,
            side = %position.side,
            margin = %position.margin,
            leverage = %position.leverage,
            entry = %position.entry_price,
            liquidation = %position.liquidation_price,
            "position opened"
        );
        Ok(position)
    }

    fn merge_checked(
        &self,
        existing: Position,
        request: &TradeRequest,
        checked: &CheckedRequest,
    ) -> Result<Position, EngineError> {
        self.reserve(request)?;

        let now = Timestamp::now();
        let written = self.write_open_position(existing, |current| {
            merge_position(
                current,
                request.margin,
                checked.leverage,
                request.entry_price,
                &checked.precision,
                now,
            )
            .map_err(EngineError::from)
        });

        // closed under us (liquidated between the read and the write), overflowed, or the store failed
        let (before, merged) = match written {
            Ok(pair) => pair,
            Err(err) => {
                self.compensate(request);
                return Err(err);
            }
        };

        self.emit_event(EventPayload::PositionMerged(PositionMergedEvent {
            position_id: merged.id,
            account_id: merged.account_id,
            added_margin: request.margin,
            old_entry_price: before.entry_price,
            new_entry_price: merged.entry_price,
            new_margin: merged.margin,
            new_leverage: merged.leverage,
            new_liquidation_price: merged.liquidation_price,
        }));
        info!(
            position_id = %merged.id,
            added_margin = %request.margin,
            entry = %merged.entry_price,
            margin = %merged.margin,
            leverage = %merged.leverage,
            liquidation = %merged.liquidation_price,
            "position merged"
        );
        Ok(merged)
    }

    fn reserve(&self, request: &TradeRequest) -> Result<(), EngineError> {
        let account = self.guard.reserve_margin(request.account_id, request.margin)?;
        self.emit_event(EventPayload::MarginReserved(BalanceEvent {
            account_id: request.account_id,
            amount: request.margin,
            new_balance: account.balance,
        }));
        Ok(())
    }

    fn compensate(&self, request: &TradeRequest) {
        match self.guard.compensate(request.account_id, request.margin) {
            Ok(account) => self.emit_event(EventPayload::MarginCompensated(BalanceEvent {
                account_id: request.account_id,
                amount: request.margin,
                new_balance: account.balance,
            })),
            Err(err) => warn!(
                account_id = %request.account_id,
                margin = %request.margin,
                error = %err,
                "compensation failed, reserved margin not returned"
            ),
        }
    }
}
