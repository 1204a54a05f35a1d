//! Account guard: the only path that changes an account balance.
//!
//! Each change is a read-modify-write against the account's version. If another writer
//! got there first the write is rejected by the store and the guard re-reads and tries
//! again, so two opens or closes on one account can't lose each other's update.

use crate::account::{Account, AccountError};
use crate::store::{LedgerStore, StoreError};
use crate::types::{AccountId, Quote};
use std::sync::Arc;
use tracing::{debug, warn};

const MAX_WRITE_ATTEMPTS: usize = 64;

#[derive(Clone)]
pub struct AccountGuard {
    store: Arc<dyn LedgerStore>,
}

impl AccountGuard {
    pub fn new(store: Arc<dyn LedgerStore>) -> Self {
        Self { store }
    }

    /// Debits `amount` for a new or merged position.
    pub fn reserve_margin(&self, account_id: AccountId, amount: Quote) -> Result<Account, AccountError> {
        require_positive(amount)?;
        let account = self.apply(account_id, |account| {
            account.can_trade()?;
            account.debit(amount)
        })?;
        debug!(%account_id, %amount, balance = %account.balance, "margin reserved");
        Ok(account)
    }

    /// Credits margin plus realized pnl when a position closes.
    /// A loss larger than the margin is clamped so the credit is never negative.
    pub fn release_margin(&self, account_id: AccountId, margin: Quote, realized_pnl: Quote) -> Result<Account, AccountError> {
        let payout = margin
            .checked_add(realized_pnl)
            .ok_or(AccountError::Overflow(account_id))?
            .max(Quote::zero());
        let booked = payout.checked_sub(margin).ok_or(AccountError::Overflow(account_id))?;
        // credits are allowed on blocked or frozen accounts
        let account = self.apply(account_id, |account| account.settle_close(payout, booked))?;
        debug!(%account_id, %payout, balance = %account.balance, "margin released");
        Ok(account)
    }

    /// Undoes a reserve whose position write failed.
    pub fn compensate(&self, account_id: AccountId, amount: Quote) -> Result<Account, AccountError> {
        let account = self.apply(account_id, |account| account.credit(amount))?;
        warn!(%account_id, %amount, "reserved margin returned after failed position write");
        Ok(account)
    }

    pub fn deposit(&self, account_id: AccountId, amount: Quote) -> Result<Account, AccountError> {
        require_positive(amount)?;
        self.apply(account_id, |account| account.deposit(amount))
    }

    pub fn withdraw(&self, account_id: AccountId, amount: Quote) -> Result<Account, AccountError> {
        require_positive(amount)?;
        self.apply(account_id, |account| account.withdraw(amount))
    }

    pub fn set_status(&self, account_id: AccountId, is_blocked: bool, is_frozen: bool) -> Result<Account, AccountError> {
        self.apply(account_id, |account| {
            account.is_blocked = is_blocked;
            account.is_frozen = is_frozen;
            Ok(())
        })
    }

    fn apply<F>(&self, account_id: AccountId, mutate: F) -> Result<Account, AccountError>
    where
        F: Fn(&mut Account) -> Result<(), AccountError>,
    {
        for _ in 0..MAX_WRITE_ATTEMPTS {
            let current = self
                .store
                .account(account_id)
                .ok_or(AccountError::NotFound(account_id))?;

            let mut next = current.clone();
            mutate(&mut next)?;

            match self.store.update_account(next, current.version) {
                Ok(written) => return Ok(written),
                Err(StoreError::AccountVersionConflict { .. }) => {
                    std::thread::yield_now();
                    continue;
                }
                Err(StoreError::AccountNotFound(_)) => return Err(AccountError::NotFound(account_id)),
                Err(other) => {
                    warn!(%account_id, error = %other, "unexpected store error on account write");
                    return Err(AccountError::Contended(account_id));
                }
            }
        }
        warn!(%account_id, "account write gave up after {} attempts", MAX_WRITE_ATTEMPTS);
        Err(AccountError::Contended(account_id))
    }
}

fn require_positive(amount: Quote) -> Result<(), AccountError> {
    if amount.is_positive() {
        Ok(())
    } else {
        Err(AccountError::InvalidAmount(amount))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use crate::types::{Leverage, Timestamp};
    use rust_decimal_macros::dec;

    fn setup(balance: rust_decimal::Decimal) -> (AccountGuard, Arc<MemoryStore>, AccountId) {
        let store = Arc::new(MemoryStore::new());
        let id = store.next_account_id();
        store
            .insert_account(Account::new(id, Leverage::new(10).unwrap(), Timestamp::from_millis(0)))
            .unwrap();
        let guard = AccountGuard::new(store.clone());
        guard.deposit(id, Quote::new(balance)).unwrap();
        (guard, store, id)
    }

    #[test]
    fn reserve_debits_balance() {
        let (guard, store, id) = setup(dec!(100));
        guard.reserve_margin(id, Quote::new(dec!(40))).unwrap();
        assert_eq!(store.account(id).unwrap().balance.value(), dec!(60));
    }

    #[test]
    fn reserve_more_than_balance_fails() {
        let (guard, store, id) = setup(dec!(100));
        let result = guard.reserve_margin(id, Quote::new(dec!(100.01)));
        assert!(matches!(result, Err(AccountError::InsufficientBalance { .. })));
        assert_eq!(store.account(id).unwrap().balance.value(), dec!(100));
    }

    #[test]
    fn reserve_on_blocked_or_frozen_fails() {
        let (guard, _store, id) = setup(dec!(100));
        guard.set_status(id, true, false).unwrap();
        assert_eq!(
            guard.reserve_margin(id, Quote::new(dec!(1))).unwrap_err(),
            AccountError::BlockedOrFrozen(id)
        );

        guard.set_status(id, false, true).unwrap();
        assert_eq!(
            guard.reserve_margin(id, Quote::new(dec!(1))).unwrap_err(),
            AccountError::BlockedOrFrozen(id)
        );
    }

    #[test]
    fn reserve_rejects_non_positive() {
        let (guard, _store, id) = setup(dec!(100));
        assert!(matches!(
            guard.reserve_margin(id, Quote::new(dec!(-5))),
            Err(AccountError::InvalidAmount(_))
        ));
    }

    #[test]
    fn release_clamps_loss_at_margin() {
        let (guard, store, id) = setup(dec!(100));
        guard.reserve_margin(id, Quote::new(dec!(50))).unwrap();

        // loss bigger than margin books as -50
        let account = guard.release_margin(id, Quote::new(dec!(50)), Quote::new(dec!(-75))).unwrap();
        assert_eq!(account.balance.value(), dec!(50));
        assert_eq!(account.realized_pnl.value(), dec!(-50));
        assert_eq!(store.account(id).unwrap().balance.value(), dec!(50));
    }

    #[test]
    fn release_works_on_frozen_account() {
        let (guard, _store, id) = setup(dec!(100));
        guard.reserve_margin(id, Quote::new(dec!(50))).unwrap();
        guard.set_status(id, false, true).unwrap();

        let account = guard.release_margin(id, Quote::new(dec!(50)), Quote::new(dec!(10))).unwrap();
        assert_eq!(account.balance.value(), dec!(110));
    }

    #[test]
    fn compensate_restores_reserve() {
        let (guard, _store, id) = setup(dec!(100));
        guard.reserve_margin(id, Quote::new(dec!(30))).unwrap();
        let account = guard.compensate(id, Quote::new(dec!(30))).unwrap();
        assert_eq!(account.balance.value(), dec!(100));
    }

    #[test]
    fn concurrent_reserves_never_overdraw() {
        let (guard, store, id) = setup(dec!(100));
        let handles: Vec<_> = (0..16)
            .map(|_| {
                let guard = guard.clone();
                std::thread::spawn(move || guard.reserve_margin(id, Quote::new(dec!(10))).is_ok())
            })
            .collect();

        let succeeded = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|ok| *ok)
            .count();
        assert_eq!(succeeded, 10);
        assert_eq!(store.account(id).unwrap().balance.value(), dec!(0));
    }

    #[test]
    fn deposit_past_decimal_range_is_refused() {
        let (guard, store, id) = setup(dec!(100));
        assert_eq!(
            guard.deposit(id, Quote::new(rust_decimal::Decimal::MAX)).unwrap_err(),
            AccountError::Overflow(id)
        );
        assert_eq!(store.account(id).unwrap().balance.value(), dec!(100));
    }

    #[test]
    fn unknown_account() {
        let (guard, _store, _id) = setup(dec!(100));
        assert_eq!(
            guard.deposit(AccountId(999), Quote::new(dec!(1))).unwrap_err(),
            AccountError::NotFound(AccountId(999))
        );
    }
}
