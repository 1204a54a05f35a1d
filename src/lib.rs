// margin-core: leveraged position risk engine.
// isolated margin, one open direction per instrument, trigger-driven closes.
// the ledger is synchronous; only the trigger evaluator and the oracle are async.
//
// file map (search X.0 for structs, X.1+ for logic):
//   1.x  types.rs: primitives: AccountId, Instrument, Side, Price, Quote, Leverage
//   2.x  calc.rs: liquidation price, pnl, merge math, rounding
//   3.x  guard.rs: account guard: margin reserve/release/compensate
//   4.x  position.rs: position struct, risk levels, open/merge/close transitions
//   5.x  store.rs: persistence trait + in-memory store with conditional writes
//   6.x  events.rs: change events, in-memory log, broadcast channel
//   7.x  config.rs: instruments, leverage defaults, evaluator timing, env presets
//   8.x  ledger/: open, merge, close, reprice, risk levels, account admin
//   9.x  oracle.rs: price oracle trait + mock
//   9.1  trigger.rs: liquidation / stop-loss / take-profit checks
//   9.2  evaluator.rs: per-instrument evaluation tasks
//   10.x account.rs: account balances + summary

pub mod account;
pub mod calc;
pub mod config;
pub mod events;
pub mod evaluator;
pub mod guard;
pub mod ledger;
pub mod oracle;
pub mod position;
pub mod store;
pub mod trigger;
pub mod types;

// re exports for convenience
pub use account::*;
pub use calc::{Overflow, Precision};
pub use config::{ConfigError, EngineConfig, Environment, EvaluatorConfig, InstrumentConfig};
pub use evaluator::{TriggerEvaluator, TriggerOutcome, TriggerStatus};
pub use events::*;
pub use guard::AccountGuard;
pub use ledger::{EngineError, Ledger, PendingCredit};
pub use oracle::{MockPriceOracle, OracleError, PriceOracle, PriceTick};
pub use position::*;
pub use store::{LedgerStore, MemoryStore, StoreError};
pub use trigger::check_trigger;
pub use types::*;
