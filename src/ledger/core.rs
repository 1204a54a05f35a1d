// 8.0 ledger/core.rs: the ledger struct, account admin, queries, event emission.

use super::close::PendingCredit;
use super::results::EngineError;
use crate::account::{calculate_account_summary, Account, AccountSummary};
use crate::calc::Precision;
use crate::config::{ConfigError, EngineConfig};
use crate::events::{
    AccountCreatedEvent, AccountStatusEvent, BalanceEvent, Event, EventEmitter, EventId, EventLog, EventPayload,
};
use crate::guard::AccountGuard;
use crate::position::Position;
use crate::store::{LedgerStore, MemoryStore, StoreError};
use crate::types::{AccountId, Instrument, Leverage, PositionId, Price, Quote, Timestamp};
use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, info};

const MAX_POSITION_WRITE_ATTEMPTS: usize = 64;

/** 8.1: owns every position transition. store and emitter are injected */
pub struct Ledger {
    pub(super) config: EngineConfig,
    pub(super) store: Arc<dyn LedgerStore>,
    pub(super) guard: AccountGuard,
    pub(super) emitter: Arc<dyn EventEmitter>,
    // credits owed for positions that closed while the account write failed
    pub(super) pending_credits: DashMap<PositionId, PendingCredit>,
    account_locks: DashMap<AccountId, Arc<Mutex<()>>>,
    next_event_id: AtomicU64,
}

impl Ledger {
    pub fn new(
        config: EngineConfig,
        store: Arc<dyn LedgerStore>,
        emitter: Arc<dyn EventEmitter>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            config,
            guard: AccountGuard::new(Arc::clone(&store)),
            store,
            emitter,
            pending_credits: DashMap::new(),
            account_locks: DashMap::new(),
            next_event_id: AtomicU64::new(1),
        })
    }

    /// In-memory store plus an event log sized by `max_events`.
    pub fn in_memory(config: EngineConfig) -> Result<(Self, Arc<EventLog>), ConfigError> {
        let log = Arc::new(EventLog::new(config.max_events));
        let ledger = Self::new(config, Arc::new(MemoryStore::new()), log.clone())?;
        Ok((ledger, log))
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn precision(&self, instrument: &Instrument) -> Result<Precision, EngineError> {
        self.config
            .instrument(instrument)
            .map(|c| c.precision())
            .ok_or_else(|| EngineError::UnknownInstrument(instrument.clone()))
    }

    // 8.2: account admin

    /// Creates an empty account. `None` gets the configured leverage cap, and nothing
    /// above the cap is accepted.
    pub fn create_account(&self, max_leverage: Option<u32>) -> Result<Account, EngineError> {
        let cap = self.config.default_max_leverage;
        let requested = max_leverage.unwrap_or(cap);
        let max_leverage = Leverage::new(requested)
            .filter(|l| l.value() <= cap)
            .ok_or(EngineError::LeverageExceedsLimit { requested, max: cap })?;

        let account = Account::new(self.store.next_account_id(), max_leverage, Timestamp::now());
        let account = self.store.insert_account(account)?;

        self.emit_event(EventPayload::AccountCreated(AccountCreatedEvent {
            account_id: account.id,
            max_leverage,
        }));
        info!(account_id = %account.id, %max_leverage, "account created");
        Ok(account)
    }

    pub fn deposit(&self, account_id: AccountId, amount: Quote) -> Result<Account, EngineError> {
        let lock = self.account_lock(account_id);
        let _held = hold(&lock);

        let account = self.guard.deposit(account_id, amount)?;
        self.emit_event(EventPayload::Deposit(BalanceEvent {
            account_id,
            amount,
            new_balance: account.balance,
        }));
        Ok(account)
    }

    // rejected while blocked or frozen
    pub fn withdraw(&self, account_id: AccountId, amount: Quote) -> Result<Account, EngineError> {
        let lock = self.account_lock(account_id);
        let _held = hold(&lock);

        let account = self.guard.withdraw(account_id, amount)?;
        self.emit_event(EventPayload::Withdrawal(BalanceEvent {
            account_id,
            amount,
            new_balance: account.balance,
        }));
        Ok(account)
    }

    pub fn set_blocked(&self, account_id: AccountId, blocked: bool) -> Result<Account, EngineError> {
        self.update_status(account_id, |account| (blocked, account.is_frozen))
    }

    pub fn set_frozen(&self, account_id: AccountId, frozen: bool) -> Result<Account, EngineError> {
        self.update_status(account_id, |account| (account.is_blocked, frozen))
    }

    fn update_status<F>(&self, account_id: AccountId, flags: F) -> Result<Account, EngineError>
    where
        F: Fn(&Account) -> (bool, bool),
    {
        let lock = self.account_lock(account_id);
        let _held = hold(&lock);

        let current = self
            .store
            .account(account_id)
            .ok_or(EngineError::AccountNotFound(account_id))?;
        let (is_blocked, is_frozen) = flags(&current);
        let account = self.guard.set_status(account_id, is_blocked, is_frozen)?;

        self.emit_event(EventPayload::AccountStatusChanged(AccountStatusEvent {
            account_id,
            is_blocked,
            is_frozen,
        }));
        info!(%account_id, is_blocked, is_frozen, "account status changed");
        Ok(account)
    }

    // 8.3: read-only queries

    pub fn account(&self, account_id: AccountId) -> Option<Account> {
        self.store.account(account_id)
    }

    pub fn position(&self, position_id: PositionId) -> Option<Position> {
        self.store.position(position_id)
    }

    pub fn positions_for_account(&self, account_id: AccountId) -> Vec<Position> {
        self.store.positions_for_account(account_id)
    }

    pub fn open_positions(&self, instrument: &Instrument) -> Vec<Position> {
        self.store.open_positions(instrument)
    }

    pub fn open_instruments(&self) -> Vec<Instrument> {
        self.store.open_instruments()
    }

    /// Equity view. Instruments missing from `marks` use the last re-priced pnl.
    pub fn account_summary(
        &self,
        account_id: AccountId,
        marks: &HashMap<Instrument, Price>,
    ) -> Result<AccountSummary, EngineError> {
        let account = self
            .store
            .account(account_id)
            .ok_or(EngineError::AccountNotFound(account_id))?;
        let open: Vec<Position> = self
            .store
            .positions_for_account(account_id)
            .into_iter()
            .filter(|p| p.is_open())
            .collect();

        let summary = calculate_account_summary(&account, &open, marks, |instrument| {
            self.precision(instrument).unwrap_or_default()
        })?;
        Ok(summary)
    }

    // 8.4: shared plumbing for the operation files

    pub(super) fn account_lock(&self, account_id: AccountId) -> Arc<Mutex<()>> {
        Arc::clone(
            self.account_locks
                .entry(account_id)
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .value(),
        )
    }

    /// Conditional write of an open position. On a version conflict the row is re-read
    /// and `change` runs again against the fresh copy. Returns (before, after).
    pub(super) fn write_open_position<F>(
        &self,
        mut current: Position,
        mut change: F,
    ) -> Result<(Position, Position), EngineError>
    where
        F: FnMut(&Position) -> Result<Position, EngineError>,
    {
        let id = current.id;
        for _ in 0..MAX_POSITION_WRITE_ATTEMPTS {
            if !current.is_open() {
                return Err(EngineError::PositionNotOpen(id));
            }
            let next = change(&current)?;
            match self.store.update_open_position(next, current.version) {
                Ok(written) => return Ok((current, written)),
                Err(StoreError::PositionVersionConflict { found, .. }) => {
                    debug!(position_id = %id, found, "position changed underneath, retrying");
                    current = self.store.position(id).ok_or(EngineError::PositionNotFound(id))?;
                }
                Err(err) => return Err(err.into()),
            }
        }
        Err(EngineError::Contended(id.to_string()))
    }

    pub(super) fn emit_event(&self, payload: EventPayload) {
        let id = EventId(self.next_event_id.fetch_add(1, Ordering::SeqCst));
        debug!(event_id = id.0, ?payload, "event");
        self.emitter.emit(Event::new(id, Timestamp::now(), payload));
    }
}

pub(super) fn hold(lock: &Mutex<()>) -> MutexGuard<'_, ()> {
    lock.lock().unwrap_or_else(PoisonError::into_inner)
}
