// 8.5 ledger/close.rs: closing and re-pricing open positions.
// a close is one conditional write (status open + version). whoever loses the race gets
// PositionNotOpen and nothing is credited a second time.

use super::core::{hold, Ledger};
use super::results::EngineError;
use crate::account::{Account, AccountError};
use crate::events::{EventPayload, MarginReleasedEvent, PositionClosedEvent, PositionRepricedEvent};
use crate::position::{close_position, reprice_position, CloseReason, Position};
use crate::types::{AccountId, PositionId, Price, Quote, Timestamp};
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

/// Margin and pnl owed to an account for a position that closed while the account
/// write failed. Settled by `Ledger::settle_pending`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingCredit {
    pub account_id: AccountId,
    pub position_id: PositionId,
    pub margin: Quote,
    pub realized_pnl: Quote,
}

impl Ledger {
    /// Closes an open position and credits margin plus bounded pnl to its account.
    ///
    /// Once the close is written the call succeeds. If the credit can't be written it is
    /// kept as a [`PendingCredit`] and paid by a later `settle_pending`.
    pub fn close(&self, position_id: PositionId, exit_price: Price, reason: CloseReason) -> Result<Position, EngineError> {
        let position = self
            .store
            .position(position_id)
            .ok_or(EngineError::PositionNotFound(position_id))?;
        if !position.is_open() {
            return Err(EngineError::PositionNotOpen(position_id));
        }
        let precision = self.precision(&position.instrument)?;

        let lock = self.account_lock(position.account_id);
        let _held = hold(&lock);

        let now = Timestamp::now();
        let mut payout = Quote::zero();
        let (_, closed) = self.write_open_position(position, |current| {
            let outcome = close_position(current, exit_price, reason, &precision, now)?;
            payout = outcome.payout;
            Ok(outcome.position)
        })?;

        // the position is closed in the store from here on; only this caller credits
        let credit = PendingCredit {
            account_id: closed.account_id,
            position_id: closed.id,
            margin: closed.margin,
            realized_pnl: closed.realized_pnl.unwrap_or_else(Quote::zero),
        };
        let balance = match self.release(&credit) {
            Ok(account) => Some(account.balance),
            Err(err) => {
                error!(
                    position_id = %closed.id,
                    account_id = %closed.account_id,
                    margin = %closed.margin,
                    error = %err,
                    "position closed but margin release failed, credit kept pending"
                );
                self.pending_credits.insert(credit.position_id, credit);
                self.emit_event(EventPayload::MarginReleasePending(credit));
                None
            }
        };

        self.emit_event(EventPayload::PositionClosed(PositionClosedEvent {
            position_id: closed.id,
            account_id: closed.account_id,
            instrument: closed.instrument.clone(),
            exit_price: closed.exit_price.unwrap_or(exit_price),
            realized_pnl: credit.realized_pnl,
            margin_returned: payout,
            close_reason: reason,
        }));
        info!(
            position_id = %closed.id,
            account_id = %closed.account_id,
            instrument = %closed.instrument,
            %reason,
            exit = %exit_price,
            realized = %credit.realized_pnl,
            balance = ?balance.map(|b| b.value()),
            "position closed"
        );
        Ok(closed)
    }

    /// Retries every pending credit. Returns how many were paid; failures stay pending.
    pub fn settle_pending(&self) -> usize {
        let ids: Vec<PositionId> = self.pending_credits.iter().map(|entry| *entry.key()).collect();
        let mut settled = 0;
        for id in ids {
            // whoever removes the entry owns the credit
            let Some((_, credit)) = self.pending_credits.remove(&id) else {
                continue;
            };
            let lock = self.account_lock(credit.account_id);
            let _held = hold(&lock);
            match self.release(&credit) {
                Ok(account) => {
                    info!(
                        position_id = %credit.position_id,
                        account_id = %credit.account_id,
                        balance = %account.balance,
                        "pending credit settled"
                    );
                    settled += 1;
                }
                Err(err) => {
                    warn!(position_id = %credit.position_id, error = %err, "pending credit still unpaid");
                    self.pending_credits.insert(id, credit);
                }
            }
        }
        settled
    }

    pub fn pending_credits(&self) -> Vec<PendingCredit> {
        self.pending_credits.iter().map(|entry| *entry.value()).collect()
    }

    fn release(&self, credit: &PendingCredit) -> Result<Account, AccountError> {
        let account = self
            .guard
            .release_margin(credit.account_id, credit.margin, credit.realized_pnl)?;
        self.emit_event(EventPayload::MarginReleased(MarginReleasedEvent {
            account_id: credit.account_id,
            position_id: credit.position_id,
            margin: credit.margin,
            realized_pnl: credit.realized_pnl,
            new_balance: account.balance,
        }));
        Ok(account)
    }

    /// Marks an open position to `mark`. Doesn't touch the account.
    pub fn reprice(&self, position_id: PositionId, mark: Price) -> Result<Position, EngineError> {
        let position = self
            .store
            .position(position_id)
            .ok_or(EngineError::PositionNotFound(position_id))?;
        let precision = self.precision(&position.instrument)?;

        let now = Timestamp::now();
        let (_, repriced) = self.write_open_position(position, |current| {
            reprice_position(current, mark, &precision, now).map_err(EngineError::from)
        })?;

        self.emit_event(EventPayload::PositionRepriced(PositionRepricedEvent {
            position_id,
            mark_price: repriced.mark_price.unwrap_or(mark),
            unrealized_pnl: repriced.unrealized_pnl,
        }));
        Ok(repriced)
    }
}
