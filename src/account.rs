//! Account balances and trading status.
//!
//! Accounts hold free collateral. Margin moves out of `balance` when a position opens
//! and comes back, with bounded pnl, when it closes. The balance is never negative.

use crate::calc::{Overflow, Precision};
use crate::position::Position;
use crate::types::{AccountId, Instrument, Leverage, Price, Quote, Timestamp};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Account {
    pub id: AccountId,
    pub balance: Quote,
    pub max_leverage: Leverage,
    pub is_blocked: bool,
    pub is_frozen: bool,
    pub total_deposited: Quote,
    pub total_withdrawn: Quote,
    pub realized_pnl: Quote,
    pub created_at: Timestamp,
    // per-account sequence number, bumped by the store on every committed write
    pub version: u64,
}

impl Account {
    pub fn new(id: AccountId, max_leverage: Leverage, timestamp: Timestamp) -> Self {
        Self {
            id,
            balance: Quote::zero(),
            max_leverage,
            is_blocked: false,
            is_frozen: false,
            total_deposited: Quote::zero(),
            total_withdrawn: Quote::zero(),
            realized_pnl: Quote::zero(),
            created_at: timestamp,
            version: 0,
        }
    }

    pub fn can_trade(&self) -> Result<(), AccountError> {
        if self.is_blocked || self.is_frozen {
            return Err(AccountError::BlockedOrFrozen(self.id));
        }
        Ok(())
    }

    // totals are checked before anything is written so a failed deposit changes nothing
    pub fn deposit(&mut self, amount: Quote) -> Result<(), AccountError> {
        let balance = self.balance.checked_add(amount).ok_or(AccountError::Overflow(self.id))?;
        let total = self
            .total_deposited
            .checked_add(amount)
            .ok_or(AccountError::Overflow(self.id))?;
        self.balance = balance;
        self.total_deposited = total;
        Ok(())
    }

    pub fn withdraw(&mut self, amount: Quote) -> Result<(), AccountError> {
        self.can_trade()?;
        let total = self
            .total_withdrawn
            .checked_add(amount)
            .ok_or(AccountError::Overflow(self.id))?;
        self.debit(amount)?;
        self.total_withdrawn = total;
        Ok(())
    }

    pub fn debit(&mut self, amount: Quote) -> Result<(), AccountError> {
        if amount > self.balance {
            return Err(AccountError::InsufficientBalance {
                requested: amount,
                available: self.balance,
            });
        }
        // amount <= balance, both non-negative
        self.balance = Quote::new(self.balance.value() - amount.value());
        Ok(())
    }

    pub fn credit(&mut self, amount: Quote) -> Result<(), AccountError> {
        self.balance = self.balance.checked_add(amount).ok_or(AccountError::Overflow(self.id))?;
        Ok(())
    }

    // margin back plus whatever the position made or lost
    pub fn settle_close(&mut self, payout: Quote, realized: Quote) -> Result<(), AccountError> {
        let realized_total = self
            .realized_pnl
            .checked_add(realized)
            .ok_or(AccountError::Overflow(self.id))?;
        self.credit(payout)?;
        self.realized_pnl = realized_total;
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AccountError {
    #[error("Insufficient balance: requested {requested}, available {available}")]
    InsufficientBalance { requested: Quote, available: Quote },

    #[error("Account {0} is blocked or frozen")]
    BlockedOrFrozen(AccountId),

    #[error("Amount must be positive, got {0}")]
    InvalidAmount(Quote),

    #[error("Account {0} not found")]
    NotFound(AccountId),

    #[error("Account {0} kept changing under concurrent writers")]
    Contended(AccountId),

    #[error("Account {0} balance out of range")]
    Overflow(AccountId),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountSummary {
    pub account_id: AccountId,
    pub balance: Quote,
    pub margin_in_use: Quote,
    pub unrealized_pnl: Quote,
    pub equity: Quote,
    pub open_positions: usize,
}

// equity = free balance + margin posted + unrealized pnl.
// positions without a supplied mark fall back to their last re-priced pnl.
pub fn calculate_account_summary(
    account: &Account,
    open_positions: &[Position],
    marks: &HashMap<Instrument, Price>,
    precision_for: impl Fn(&Instrument) -> Precision,
) -> Result<AccountSummary, Overflow> {
    let overflow = Overflow("account summary");
    let mut margin_in_use = Quote::zero();
    let mut unrealized_pnl = Quote::zero();

    for position in open_positions.iter().filter(|p| p.is_open()) {
        margin_in_use = margin_in_use.checked_add(position.margin).ok_or(overflow)?;
        let pnl = match marks.get(&position.instrument) {
            Some(mark) => position.unrealized_at(*mark, &precision_for(&position.instrument))?,
            None => position.unrealized_pnl,
        };
        unrealized_pnl = unrealized_pnl.checked_add(pnl).ok_or(overflow)?;
    }

    let equity = account
        .balance
        .checked_add(margin_in_use)
        .and_then(|q| q.checked_add(unrealized_pnl))
        .ok_or(overflow)?;

    Ok(AccountSummary {
        account_id: account.id,
        balance: account.balance,
        margin_in_use,
        unrealized_pnl,
        equity,
        open_positions: open_positions.iter().filter(|p| p.is_open()).count(),
    })
}
