// 6.0: every committed change produces an event. used for audit trails and for telling the
// UI layer to refresh. the EventPayload enum lists all event types.
// emitters are injected into the ledger; nothing here is global.

use crate::ledger::PendingCredit;
use crate::position::CloseReason;
use crate::types::{AccountId, Instrument, Leverage, PositionId, Price, Quote, Side, Timestamp};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EventId(pub u64);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: EventId,
    pub timestamp: Timestamp,
    pub payload: EventPayload,
}

impl Event {
    pub fn new(id: EventId, timestamp: Timestamp, payload: EventPayload) -> Self {
        Self {
            id,
            timestamp,
            payload,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum EventPayload {
    // Account events
    AccountCreated(AccountCreatedEvent),
    Deposit(BalanceEvent),
    Withdrawal(BalanceEvent),
    AccountStatusChanged(AccountStatusEvent),

    // Margin events
    MarginReserved(BalanceEvent),
    MarginReleased(MarginReleasedEvent),
    MarginCompensated(BalanceEvent),
    MarginReleasePending(PendingCredit),

    // Position events
    PositionOpened(PositionOpenedEvent),
    PositionMerged(PositionMergedEvent),
    RiskLevelsUpdated(RiskLevelsUpdatedEvent),
    PositionRepriced(PositionRepricedEvent),
    PositionClosed(PositionClosedEvent),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountCreatedEvent {
    pub account_id: AccountId,
    pub max_leverage: Leverage,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BalanceEvent {
    pub account_id: AccountId,
    pub amount: Quote,
    pub new_balance: Quote,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountStatusEvent {
    pub account_id: AccountId,
    pub is_blocked: bool,
    pub is_frozen: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarginReleasedEvent {
    pub account_id: AccountId,
    pub position_id: PositionId,
    pub margin: Quote,
    pub realized_pnl: Quote,
    pub new_balance: Quote,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PositionOpenedEvent {
    pub position_id: PositionId,
    pub account_id: AccountId,
    pub instrument: Instrument,
    pub side: Side,
    pub margin: Quote,
    pub leverage: Leverage,
    pub entry_price: Price,
    pub liquidation_price: Price,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PositionMergedEvent {
    pub position_id: PositionId,
    pub account_id: AccountId,
    pub added_margin: Quote,
    pub old_entry_price: Price,
    pub new_entry_price: Price,
    pub new_margin: Quote,
    pub new_leverage: Leverage,
    pub new_liquidation_price: Price,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskLevelsUpdatedEvent {
    pub position_id: PositionId,
    pub stop_loss: Option<Price>,
    pub take_profit: Option<Price>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PositionRepricedEvent {
    pub position_id: PositionId,
    pub mark_price: Price,
    pub unrealized_pnl: Quote,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PositionClosedEvent {
    pub position_id: PositionId,
    pub account_id: AccountId,
    pub instrument: Instrument,
    pub exit_price: Price,
    pub realized_pnl: Quote,
    pub margin_returned: Quote,
    pub close_reason: CloseReason,
}

pub trait EventEmitter: Send + Sync {
    fn emit(&self, event: Event);
}

/// Bounded in-memory log. Oldest events are dropped past `max_events`.
#[derive(Debug)]
pub struct EventLog {
    events: Mutex<VecDeque<Event>>,
    max_events: usize,
}

impl EventLog {
    pub fn new(max_events: usize) -> Self {
        Self {
            events: Mutex::new(VecDeque::new()),
            max_events,
        }
    }

    pub fn events(&self) -> Vec<Event> {
        match self.events.lock() {
            Ok(events) => events.iter().cloned().collect(),
            Err(poisoned) => poisoned.into_inner().iter().cloned().collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.events.lock().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        if let Ok(mut events) = self.events.lock() {
            events.clear();
        }
    }
}

impl Default for EventLog {
    fn default() -> Self {
        Self::new(100_000)
    }
}

impl EventEmitter for EventLog {
    fn emit(&self, event: Event) {
        let mut events = match self.events.lock() {
            Ok(events) => events,
            Err(poisoned) => poisoned.into_inner(),
        };
        events.push_back(event);
        while events.len() > self.max_events {
            events.pop_front();
        }
    }
}

/// Change-notification channel for views that refresh on ledger changes.
#[derive(Debug, Clone)]
pub struct BroadcastEmitter {
    tx: broadcast::Sender<Event>,
}

impl BroadcastEmitter {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }
}

impl EventEmitter for BroadcastEmitter {
    fn emit(&self, event: Event) {
        // no subscribers is fine
        let _ = self.tx.send(event);
    }
}

/// Sends every event to each inner emitter in order.
#[derive(Default, Clone)]
pub struct FanoutEmitter {
    targets: Vec<Arc<dyn EventEmitter>>,
}

impl FanoutEmitter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, target: Arc<dyn EventEmitter>) -> Self {
        self.targets.push(target);
        self
    }
}

impl EventEmitter for FanoutEmitter {
    fn emit(&self, event: Event) {
        for target in &self.targets {
            target.emit(event.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn deposit_event(id: u64) -> Event {
        Event::new(
            EventId(id),
            Timestamp::from_millis(1000),
            EventPayload::Deposit(BalanceEvent {
                account_id: AccountId(1),
                amount: Quote::new(dec!(100)),
                new_balance: Quote::new(dec!(100)),
            }),
        )
    }

    #[test]
    fn event_log_is_bounded() {
        let log = EventLog::new(2);
        log.emit(deposit_event(1));
        log.emit(deposit_event(2));
        log.emit(deposit_event(3));

        let events = log.events();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].id, EventId(2));

        log.clear();
        assert!(log.is_empty());
    }

    #[test]
    fn broadcast_reaches_subscribers() {
        let emitter = BroadcastEmitter::new(8);
        let mut rx = emitter.subscribe();
        emitter.emit(deposit_event(7));

        let received = rx.try_recv().unwrap();
        assert_eq!(received.id, EventId(7));
    }

    #[test]
    fn fanout_copies_to_all() {
        let a = Arc::new(EventLog::default());
        let b = Arc::new(EventLog::default());
        let fanout = FanoutEmitter::new().with(a.clone()).with(b.clone());
        fanout.emit(deposit_event(1));
        assert_eq!(a.len(), 1);
        assert_eq!(b.len(), 1);
    }

    #[test]
    fn events_serialize() {
        let json = serde_json::to_string(&deposit_event(1)).unwrap();
        assert!(json.contains("Deposit"));
    }
}
