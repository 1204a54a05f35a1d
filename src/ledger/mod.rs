// 8.0: position ledger. the only writer of position state. opens, merges, re-prices and
// closes positions and keeps account balances in step through the account guard.
// every committed change is emitted as an event.

mod close;
mod core;
mod open;
mod results;
mod risk_levels;

pub use self::close::PendingCredit;
pub use self::core::Ledger;
pub use results::EngineError;
