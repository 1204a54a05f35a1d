// 8.0.2: error type for ledger operations.

use crate::account::AccountError;
use crate::calc::Overflow;
use crate::position::RiskLevelViolation;
use crate::store::StoreError;
use crate::types::{AccountId, Instrument, PositionId, Quote, Side};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EngineError {
    #[error("Insufficient balance: requested {requested}, available {available}")]
    InsufficientBalance { requested: Quote, available: Quote },

    #[error("{account_id} already holds an open {open_side} position on {instrument}")]
    ConflictingDirection {
        account_id: AccountId,
        instrument: Instrument,
        open_side: Side,
    },

    #[error("Leverage {requested}x outside 1x..={max}x")]
    LeverageExceedsLimit { requested: u32, max: u32 },

    #[error("Account {0} is blocked or frozen")]
    AccountBlockedOrFrozen(AccountId),

    #[error("Position {0} is not open")]
    PositionNotOpen(PositionId),

    #[error("No usable price for {instrument}: {reason}")]
    PriceUnavailable { instrument: Instrument, reason: String },

    #[error("Account {0} not found")]
    AccountNotFound(AccountId),

    #[error("Position {0} not found")]
    PositionNotFound(PositionId),

    #[error("Instrument {0} is not configured")]
    UnknownInstrument(Instrument),

    #[error("Invalid request: {reason}")]
    InvalidRequest { reason: String },

    #[error("Invalid risk levels: {0}")]
    InvalidRiskLevels(#[from] RiskLevelViolation),

    #[error("Gave up on {0} after repeated write conflicts")]
    Contended(String),

    #[error("Store error: {0}")]
    Store(StoreError),
}

impl EngineError {
    /// Errors a caller may drop: a lost close race or a skipped price tick.
    pub fn is_benign(&self) -> bool {
        matches!(
            self,
            EngineError::PositionNotOpen(_) | EngineError::PriceUnavailable { .. }
        )
    }
}

impl From<AccountError> for EngineError {
    fn from(err: AccountError) -> Self {
        match err {
            AccountError::InsufficientBalance { requested, available } => {
                EngineError::InsufficientBalance { requested, available }
            }
            AccountError::BlockedOrFrozen(id) => EngineError::AccountBlockedOrFrozen(id),
            AccountError::InvalidAmount(amount) => EngineError::InvalidRequest {
                reason: format!("amount must be positive, got {amount}"),
            },
            AccountError::NotFound(id) => EngineError::AccountNotFound(id),
            AccountError::Contended(id) => EngineError::Contended(id.to_string()),
            AccountError::Overflow(id) => EngineError::InvalidRequest {
                reason: format!("{id} balance would leave the representable range"),
            },
        }
    }
}

impl From<Overflow> for EngineError {
    fn from(err: Overflow) -> Self {
        EngineError::InvalidRequest { reason: err.to_string() }
    }
}

impl From<StoreError> for EngineError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::AccountNotFound(id) => EngineError::AccountNotFound(id),
            StoreError::PositionNotFound(id) => EngineError::PositionNotFound(id),
            StoreError::PositionNotOpen(id) => EngineError::PositionNotOpen(id),
            other => EngineError::Store(other),
        }
    }
}
