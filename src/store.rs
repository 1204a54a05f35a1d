// 5.0: persistence seam. the ledger only needs row reads and conditional writes, so that
// is all the trait asks for. every write carries the version the caller read; a stale
// version or a closed position rejects the write and nothing changes.
//
// MemoryStore keeps rows in dashmaps. a row's shard lock makes check-and-set atomic.

use crate::account::Account;
use crate::position::Position;
use crate::types::{AccountId, Instrument, PositionId, Side};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("account {0} not found")]
    AccountNotFound(AccountId),

    #[error("account {0} already exists")]
    DuplicateAccount(AccountId),

    #[error("position {0} not found")]
    PositionNotFound(PositionId),

    #[error("position {0} is not open")]
    PositionNotOpen(PositionId),

    #[error("account {id} changed: expected version {expected}, found {found}")]
    AccountVersionConflict { id: AccountId, expected: u64, found: u64 },

    #[error("position {id} changed: expected version {expected}, found {found}")]
    PositionVersionConflict { id: PositionId, expected: u64, found: u64 },

    #[error("{account_id} already holds an open {side} position on {instrument}")]
    DuplicateOpen { account_id: AccountId, instrument: Instrument, side: Side },

    #[error("store unavailable: {0}")]
    Unavailable(String),
}

pub trait LedgerStore: Send + Sync {
    fn next_account_id(&self) -> AccountId;

    fn next_position_id(&self) -> PositionId;

    fn insert_account(&self, account: Account) -> Result<Account, StoreError>;

    fn account(&self, id: AccountId) -> Option<Account>;

    /// Writes only if the stored row is still at `expected_version`.
    fn update_account(&self, account: Account, expected_version: u64) -> Result<Account, StoreError>;

    /// Rejects a second open row for the same (account, instrument, side).
    fn insert_position(&self, position: Position) -> Result<Position, StoreError>;

    fn position(&self, id: PositionId) -> Option<Position>;

    /// Writes only if the stored row is Open and still at `expected_version`.
    fn update_open_position(&self, position: Position, expected_version: u64) -> Result<Position, StoreError>;

    fn positions_for_account(&self, account_id: AccountId) -> Vec<Position>;

    fn open_positions_for(&self, account_id: AccountId, instrument: &Instrument) -> Vec<Position>;

    fn open_positions(&self, instrument: &Instrument) -> Vec<Position>;

    fn open_instruments(&self) -> Vec<Instrument>;
}

type OpenKey = (AccountId, Instrument, Side);

#[derive(Debug)]
pub struct MemoryStore {
    accounts: DashMap<AccountId, Account>,
    positions: DashMap<PositionId, Position>,
    open_index: DashMap<OpenKey, PositionId>,
    next_account_id: AtomicU64,
    next_position_id: AtomicU64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            accounts: DashMap::new(),
            positions: DashMap::new(),
            open_index: DashMap::new(),
            next_account_id: AtomicU64::new(1),
            next_position_id: AtomicU64::new(1),
        }
    }

    fn open_key(position: &Position) -> OpenKey {
        (position.account_id, position.instrument.clone(), position.side)
    }

    fn is_open(&self, id: &PositionId) -> bool {
        self.positions.get(id).map(|p| p.is_open()).unwrap_or(false)
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl LedgerStore for MemoryStore {
    fn next_account_id(&self) -> AccountId {
        AccountId(self.next_account_id.fetch_add(1, Ordering::SeqCst))
    }

    fn next_position_id(&self) -> PositionId {
        PositionId(self.next_position_id.fetch_add(1, Ordering::SeqCst))
    }

    fn insert_account(&self, account: Account) -> Result<Account, StoreError> {
        match self.accounts.entry(account.id) {
            Entry::Occupied(_) => Err(StoreError::DuplicateAccount(account.id)),
            Entry::Vacant(slot) => {
                slot.insert(account.clone());
                Ok(account)
            }
        }
    }

    fn account(&self, id: AccountId) -> Option<Account> {
        self.accounts.get(&id).map(|a| a.clone())
    }

    fn update_account(&self, mut account: Account, expected_version: u64) -> Result<Account, StoreError> {
        let mut stored = self
            .accounts
            .get_mut(&account.id)
            .ok_or(StoreError::AccountNotFound(account.id))?;

        if stored.version != expected_version {
            return Err(StoreError::AccountVersionConflict {
                id: account.id,
                expected: expected_version,
                found: stored.version,
            });
        }

        account.version = expected_version + 1;
        *stored = account.clone();
        Ok(account)
    }

    // lock order is always open_index then positions. update_open_position never holds a
    // positions guard while touching the index.
    fn insert_position(&self, position: Position) -> Result<Position, StoreError> {
        let key = Self::open_key(&position);
        match self.open_index.entry(key) {
            Entry::Occupied(mut slot) => {
                if self.is_open(slot.get()) {
                    return Err(StoreError::DuplicateOpen {
                        account_id: position.account_id,
                        instrument: position.instrument.clone(),
                        side: position.side,
                    });
                }
                // stale index entry left by a close that hasn't cleaned up yet
                self.positions.insert(position.id, position.clone());
                slot.insert(position.id);
            }
            Entry::Vacant(slot) => {
                self.positions.insert(position.id, position.clone());
                slot.insert(position.id);
            }
        }
        Ok(position)
    }

    fn position(&self, id: PositionId) -> Option<Position> {
        self.positions.get(&id).map(|p| p.clone())
    }

    fn update_open_position(&self, mut position: Position, expected_version: u64) -> Result<Position, StoreError> {
        let id = position.id;
        {
            let mut stored = self
                .positions
                .get_mut(&id)
                .ok_or(StoreError::PositionNotFound(id))?;

            if !stored.is_open() {
                return Err(StoreError::PositionNotOpen(id));
            }
            if stored.version != expected_version {
                return Err(StoreError::PositionVersionConflict {
                    id,
                    expected: expected_version,
                    found: stored.version,
                });
            }

            position.version = expected_version + 1;
            *stored = position.clone();
        }

        if position.is_closed() {
            self.open_index.remove_if(&Self::open_key(&position), |_, current| *current == id);
        }
        Ok(position)
    }

    fn positions_for_account(&self, account_id: AccountId) -> Vec<Position> {
        let mut positions: Vec<Position> = self
            .positions
            .iter()
            .filter(|p| p.account_id == account_id)
            .map(|p| p.clone())
            .collect();
        positions.sort_by_key(|p| p.id);
        positions
    }

    fn open_positions_for(&self, account_id: AccountId, instrument: &Instrument) -> Vec<Position> {
        [Side::Long, Side::Short]
            .into_iter()
            .filter_map(|side| {
                let id = *self.open_index.get(&(account_id, instrument.clone(), side))?;
                self.position(id)
            })
            .filter(|p| p.is_open())
            .collect()
    }

    fn open_positions(&self, instrument: &Instrument) -> Vec<Position> {
        let mut positions: Vec<Position> = self
            .positions
            .iter()
            .filter(|p| p.is_open() && &p.instrument == instrument)
            .map(|p| p.clone())
            .collect();
        positions.sort_by_key(|p| p.id);
        positions
    }

    fn open_instruments(&self) -> Vec<Instrument> {
        self.positions
            .iter()
            .filter(|p| p.is_open())
            .map(|p| p.instrument.clone())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calc::Precision;
    use crate::position::{close_position, open_position, CloseReason, TradeRequest};
    use crate::types::{Leverage, Price, Quote, Timestamp};
    use rust_decimal_macros::dec;

    fn new_position(store: &MemoryStore, side: Side) -> Position {
        let request = TradeRequest::new(
            AccountId(1),
            "ETH-USD",
            side,
            Quote::new(dec!(100)),
            5,
            Price::new_unchecked(dec!(2000)),
        );
        open_position(
            store.next_position_id(),
            &request,
            Leverage::new(5).unwrap(),
            &Precision::default(),
            Timestamp::from_millis(0),
        )
        .unwrap()
    }

    #[test]
    fn account_update_requires_current_version() {
        let store = MemoryStore::new();
        let account = Account::new(store.next_account_id(), Leverage::new(10).unwrap(), Timestamp::from_millis(0));
        store.insert_account(account.clone()).unwrap();

        let mut changed = account.clone();
        changed.deposit(Quote::new(dec!(10))).unwrap();
        let written = store.update_account(changed.clone(), 0).unwrap();
        assert_eq!(written.version, 1);

        let stale = store.update_account(changed, 0);
        assert!(matches!(stale, Err(StoreError::AccountVersionConflict { found: 1, .. })));
    }

    #[test]
    fn duplicate_open_rejected() {
        let store = MemoryStore::new();
        store.insert_position(new_position(&store, Side::Long)).unwrap();

        let again = store.insert_position(new_position(&store, Side::Long));
        assert!(matches!(again, Err(StoreError::DuplicateOpen { .. })));

        // other side is a separate slot at this layer
        assert!(store.insert_position(new_position(&store, Side::Short)).is_ok());
    }

    #[test]
    fn closed_position_rejects_further_writes() {
        let store = MemoryStore::new();
        let pos = store.insert_position(new_position(&store, Side::Long)).unwrap();

        let outcome = close_position(
            &pos,
            Price::new_unchecked(dec!(2100)),
            CloseReason::Manual,
            &Precision::default(),
            Timestamp::from_millis(1),
        )
        .unwrap();
        store.update_open_position(outcome.position.clone(), 0).unwrap();

        let second = store.update_open_position(outcome.position, 1);
        assert_eq!(second.unwrap_err(), StoreError::PositionNotOpen(pos.id));

        // slot is free again once closed
        assert!(store.open_positions_for(AccountId(1), &Instrument::new("ETH-USD")).is_empty());
        assert!(store.insert_position(new_position(&store, Side::Long)).is_ok());
    }

    #[test]
    fn open_instruments_are_distinct() {
        let store = MemoryStore::new();
        store.insert_position(new_position(&store, Side::Long)).unwrap();
        store.insert_position(new_position(&store, Side::Short)).unwrap();
        assert_eq!(store.open_instruments(), vec![Instrument::new("ETH-USD")]);
    }
}
