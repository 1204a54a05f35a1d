//! Trigger evaluator: watches prices and closes positions whose triggers fire.
//!
//! One task per instrument with open positions. Each task either polls the oracle on
//! the configured interval (`run_instrument`) or follows its push stream (`run_stream`).
//! A supervisor started with `spawn` keeps the set of polling tasks in line with the
//! instruments that currently have open positions.
//!
//! Ticks older than the newest one already evaluated, or older than
//! `max_price_age_ms`, are skipped. Missed intervals are not replayed.

use crate::config::{ConfigError, EvaluatorConfig};
use crate::ledger::{EngineError, Ledger};
use crate::oracle::{OracleError, PriceOracle, PriceTick};
use crate::position::CloseReason;
use crate::trigger::check_trigger;
use crate::types::{Instrument, PositionId, Price, Quote, Timestamp};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tokio::time::{interval, timeout, MissedTickBehavior};
use tracing::{debug, info, warn};

/// What happened to one fired trigger.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TriggerStatus {
    Closed { realized_pnl: Quote },
    /// Someone else closed it first.
    AlreadyClosed,
    Failed { reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TriggerOutcome {
    pub position_id: PositionId,
    pub reason: CloseReason,
    pub exit_price: Price,
    pub status: TriggerStatus,
}

pub struct TriggerEvaluator {
    ledger: Arc<Ledger>,
    oracle: Arc<dyn PriceOracle>,
    config: EvaluatorConfig,
    // newest tick timestamp evaluated per instrument
    last_ticks: DashMap<Instrument, Timestamp>,
    tasks: Mutex<HashMap<Instrument, JoinHandle<()>>>,
    supervisor: Mutex<Option<JoinHandle<()>>>,
    shutdown_tx: broadcast::Sender<()>,
}

impl TriggerEvaluator {
    pub fn new(
        ledger: Arc<Ledger>,
        oracle: Arc<dyn PriceOracle>,
        config: EvaluatorConfig,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let (shutdown_tx, _) = broadcast::channel(1);
        Ok(Self {
            ledger,
            oracle,
            config,
            last_ticks: DashMap::new(),
            tasks: Mutex::new(HashMap::new()),
            supervisor: Mutex::new(None),
            shutdown_tx,
        })
    }

    /// Evaluates every open position on `instrument` at `tick`.
    /// Fired positions are closed, the rest are re-priced.
    pub fn evaluate_at(&self, instrument: &Instrument, tick: PriceTick) -> Result<Vec<TriggerOutcome>, EngineError> {
        let age = tick.age_ms(Timestamp::now());
        if age > self.config.max_price_age_ms {
            return Err(unavailable(instrument, format!("tick is {age}ms old")));
        }

        match self.last_ticks.entry(instrument.clone()) {
            Entry::Occupied(mut newest) => {
                if tick.timestamp < *newest.get() {
                    return Err(unavailable(instrument, "tick older than last evaluated".to_string()));
                }
                newest.insert(tick.timestamp);
            }
            Entry::Vacant(slot) => {
                slot.insert(tick.timestamp);
            }
        }

        let mut outcomes = Vec::new();
        for position in self.ledger.open_positions(instrument) {
            let Some(reason) = check_trigger(&position, tick.price) else {
                if let Err(err) = self.ledger.reprice(position.id, tick.price) {
                    if !err.is_benign() {
                        warn!(position_id = %position.id, error = %err, "reprice failed");
                    }
                }
                continue;
            };

            let status = match self.ledger.close(position.id, tick.price, reason) {
                Ok(closed) => TriggerStatus::Closed {
                    realized_pnl: closed.realized_pnl.unwrap_or_else(Quote::zero),
                },
                Err(err) if err.is_benign() => TriggerStatus::AlreadyClosed,
                Err(err) => {
                    warn!(position_id = %position.id, %reason, error = %err, "triggered close failed");
                    TriggerStatus::Failed { reason: err.to_string() }
                }
            };
            outcomes.push(TriggerOutcome {
                position_id: position.id,
                reason,
                exit_price: tick.price,
                status,
            });
        }
        Ok(outcomes)
    }

    /// One pull-mode cycle. The oracle call is bounded by `price_timeout_ms`.
    pub async fn tick(&self, instrument: &Instrument) -> Result<Vec<TriggerOutcome>, EngineError> {
        let after_ms = self.config.price_timeout_ms;
        let tick = match timeout(Duration::from_millis(after_ms), self.oracle.get_price(instrument)).await {
            Ok(Ok(tick)) => tick,
            Ok(Err(err)) => return Err(unavailable(instrument, err.to_string())),
            Err(_) => {
                let err = OracleError::Timeout {
                    instrument: instrument.clone(),
                    after_ms,
                };
                return Err(unavailable(instrument, err.to_string()));
            }
        };
        self.evaluate_at(instrument, tick)
    }

    /// Polls the oracle every `interval_ms` until shutdown.
    pub async fn run_instrument(self: Arc<Self>, instrument: Instrument) {
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let mut ticker = interval(Duration::from_millis(self.config.interval_ms));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        info!(%instrument, interval_ms = self.config.interval_ms, "evaluator started");
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let result = self.tick(&instrument).await;
                    self.report(&instrument, result);
                }
                _ = shutdown_rx.recv() => break,
            }
        }
        info!(%instrument, "evaluator stopped");
    }

    /// Evaluates every tick pushed by the oracle until the stream ends or shutdown.
    pub async fn run_stream(self: Arc<Self>, instrument: Instrument) -> Result<(), EngineError> {
        let mut ticks = self
            .oracle
            .subscribe(&instrument)
            .map_err(|err| unavailable(&instrument, err.to_string()))?;
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        info!(%instrument, "stream evaluator started");
        loop {
            tokio::select! {
                received = ticks.recv() => match received {
                    Ok(tick) => {
                        let result = self.evaluate_at(&instrument, tick);
                        self.report(&instrument, result);
                    }
                    // dropped ticks are not replayed; the next one is the latest
                    Err(RecvError::Lagged(skipped)) => debug!(%instrument, skipped, "tick stream lagged"),
                    Err(RecvError::Closed) => break,
                },
                _ = shutdown_rx.recv() => break,
            }
        }
        info!(%instrument, "stream evaluator stopped");
        Ok(())
    }

    /// Starts the supervisor that runs one polling task per instrument with open positions.
    pub fn spawn(self: &Arc<Self>) {
        let this = Arc::clone(self);
        let handle = tokio::spawn(async move { this.supervise().await });
        if let Some(previous) = lock(&self.supervisor).replace(handle) {
            previous.abort();
        }
    }

    /// Stops the supervisor and every instrument task.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
        if let Some(handle) = lock(&self.supervisor).take() {
            handle.abort();
        }
        for (instrument, handle) in lock(&self.tasks).drain() {
            debug!(%instrument, "stopping evaluator task");
            handle.abort();
        }
        info!("trigger evaluator shut down");
    }

    pub fn running_instruments(&self) -> Vec<Instrument> {
        let mut instruments: Vec<Instrument> = lock(&self.tasks)
            .iter()
            .filter(|(_, handle)| !handle.is_finished())
            .map(|(instrument, _)| instrument.clone())
            .collect();
        instruments.sort();
        instruments
    }

    async fn supervise(self: Arc<Self>) {
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let mut discovery = interval(Duration::from_millis(self.config.discovery_interval_ms));
        discovery.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = discovery.tick() => self.reconcile(),
                _ = shutdown_rx.recv() => break,
            }
        }
    }

    // pay credits left over from failed account writes, start tasks for new instruments,
    // stop tasks whose instrument has nothing open
    fn reconcile(self: &Arc<Self>) {
        let settled = self.ledger.settle_pending();
        if settled > 0 {
            info!(settled, "pending credits paid");
        }

        let wanted: HashSet<Instrument> = self.ledger.open_instruments().into_iter().collect();
        let mut tasks = lock(&self.tasks);

        tasks.retain(|instrument, handle| {
            if handle.is_finished() {
                return false;
            }
            if !wanted.contains(instrument) {
                debug!(%instrument, "no open positions left");
                handle.abort();
                return false;
            }
            true
        });

        for instrument in wanted {
            if tasks.contains_key(&instrument) {
                continue;
            }
            let this = Arc::clone(self);
            let task_instrument = instrument.clone();
            let handle = tokio::spawn(async move { this.run_instrument(task_instrument).await });
            tasks.insert(instrument, handle);
        }
    }

    fn report(&self, instrument: &Instrument, result: Result<Vec<TriggerOutcome>, EngineError>) {
        match result {
            Ok(outcomes) => {
                for outcome in outcomes {
                    match &outcome.status {
                        TriggerStatus::Closed { realized_pnl } => info!(
                            %instrument,
                            position_id = %outcome.position_id,
                            reason = %outcome.reason,
                            exit = %outcome.exit_price,
                            realized = %realized_pnl,
                            "trigger fired"
                        ),
                        TriggerStatus::AlreadyClosed => debug!(
                            %instrument,
                            position_id = %outcome.position_id,
                            "trigger fired on a position already closed"
                        ),
                        TriggerStatus::Failed { .. } => {}
                    }
                }
            }
            Err(err) if err.is_benign() => debug!(%instrument, error = %err, "tick skipped"),
            Err(err) => warn!(%instrument, error = %err, "evaluation failed"),
        }
    }
}

fn unavailable(instrument: &Instrument, reason: String) -> EngineError {
    EngineError::PriceUnavailable {
        instrument: instrument.clone(),
        reason,
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::events::EventLog;
    use crate::oracle::MockPriceOracle;
    use crate::position::{Position, TradeRequest};
    use crate::store::MemoryStore;
    use crate::types::{AccountId, Side};
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;

    fn px(v: Decimal) -> Price {
        Price::new_unchecked(v)
    }

    fn btc() -> Instrument {
        Instrument::new("BTC-USD")
    }

    fn fast_config() -> EngineConfig {
        let mut config = EngineConfig::default();
        config.evaluator.interval_ms = 10;
        config.evaluator.discovery_interval_ms = 10;
        config.evaluator.price_timeout_ms = 50;
        config
    }

    struct Harness {
        ledger: Arc<Ledger>,
        oracle: Arc<MockPriceOracle>,
        evaluator: Arc<TriggerEvaluator>,
        account: AccountId,
    }

    fn harness(config: EngineConfig) -> Harness {
        let evaluator_config = config.evaluator.clone();
        let ledger = Arc::new(Ledger::new(config, Arc::new(MemoryStore::new()), Arc::new(EventLog::default())).unwrap());
        let oracle = Arc::new(MockPriceOracle::new());
        let evaluator = Arc::new(TriggerEvaluator::new(ledger.clone(), oracle.clone(), evaluator_config).unwrap());
        let account = ledger.create_account(Some(10)).unwrap().id;
        ledger.deposit(account, Quote::new(dec!(1000))).unwrap();
        Harness {
            ledger,
            oracle,
            evaluator,
            account,
        }
    }

    fn open(h: &Harness, side: Side) -> Position {
        h.ledger
            .open(TradeRequest::new(h.account, "BTC-USD", side, Quote::new(dec!(50)), 10, px(dec!(100))))
            .unwrap()
    }

    fn now_tick(price: Decimal) -> PriceTick {
        PriceTick::new(px(price), Timestamp::now())
    }

    async fn wait_closed(ledger: &Ledger, id: PositionId) -> bool {
        for _ in 0..200 {
            if ledger.position(id).map(|p| p.is_closed()).unwrap_or(false) {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        false
    }

    #[test]
    fn liquidation_closes_at_tick_price() {
        let h = harness(fast_config());
        let pos = open(&h, Side::Long);

        let outcomes = h.evaluator.evaluate_at(&btc(), now_tick(dec!(89))).unwrap();
        assert_eq!(outcomes.len(), 1);
        assert_eq!(outcomes[0].reason, CloseReason::Liquidation);
        assert_eq!(
            outcomes[0].status,
            TriggerStatus::Closed {
                realized_pnl: Quote::new(dec!(-50))
            }
        );
        assert_eq!(h.ledger.position(pos.id).unwrap().exit_price, Some(px(dec!(89))));
        assert_eq!(h.ledger.account(h.account).unwrap().balance.value(), dec!(950));
    }

    #[test]
    fn zero_interval_config_rejected() {
        let ledger = Arc::new(Ledger::new(fast_config(), Arc::new(MemoryStore::new()), Arc::new(EventLog::default())).unwrap());
        let mut config = fast_config().evaluator;
        config.interval_ms = 0;
        assert!(matches!(
            TriggerEvaluator::new(ledger, Arc::new(MockPriceOracle::new()), config),
            Err(ConfigError::InvalidEvaluator { .. })
        ));
    }

    #[tokio::test]
    async fn sub_tick_oracle_price_liquidates_at_one_tick() {
        let h = harness(fast_config());
        let long = open(&h, Side::Long);
        h.oracle.set_price(&btc(), px(dec!(0.004)));

        let outcomes = h.evaluator.tick(&btc()).await.unwrap();
        assert_eq!(outcomes.len(), 1);
        assert_eq!(outcomes[0].reason, CloseReason::Liquidation);
        assert_eq!(
            outcomes[0].status,
            TriggerStatus::Closed {
                realized_pnl: Quote::new(dec!(-50))
            }
        );
        let closed = h.ledger.position(long.id).unwrap();
        assert_eq!(closed.exit_price, Some(px(dec!(0.01))));
        assert_eq!(h.ledger.account(h.account).unwrap().balance.value(), dec!(950));
    }

    #[test]
    fn liquidation_wins_over_take_profit() {
        let mut config = fast_config();
        config.validate_risk_levels = false;
        let h = harness(config);
        let pos = open(&h, Side::Short);
        h.ledger.set_risk_levels(pos.id, None, Some(px(dec!(111)))).unwrap();

        let outcomes = h.evaluator.evaluate_at(&btc(), now_tick(dec!(112))).unwrap();
        assert_eq!(outcomes[0].reason, CloseReason::Liquidation);
        assert_eq!(
            h.ledger.position(pos.id).unwrap().close_reason,
            Some(CloseReason::Liquidation)
        );
    }

    #[test]
    fn quiet_tick_reprices() {
        let h = harness(fast_config());
        let pos = open(&h, Side::Long);
        h.ledger.set_risk_levels(pos.id, Some(px(dec!(95))), None).unwrap();

        let outcomes = h.evaluator.evaluate_at(&btc(), now_tick(dec!(102))).unwrap();
        assert!(outcomes.is_empty());
        let pos = h.ledger.position(pos.id).unwrap();
        assert!(pos.is_open());
        assert_eq!(pos.unrealized_pnl.value(), dec!(10));
    }

    #[test]
    fn stop_loss_fires() {
        let h = harness(fast_config());
        let pos = open(&h, Side::Long);
        h.ledger.set_risk_levels(pos.id, Some(px(dec!(95))), None).unwrap();

        let outcomes = h.evaluator.evaluate_at(&btc(), now_tick(dec!(94))).unwrap();
        assert_eq!(outcomes[0].reason, CloseReason::StopLoss);
        // 6% of 500 lost
        assert_eq!(h.ledger.account(h.account).unwrap().balance.value(), dec!(970));
    }

    #[test]
    fn older_tick_skipped() {
        let h = harness(fast_config());
        let pos = open(&h, Side::Long);
        let now = Timestamp::now();

        h.evaluator
            .evaluate_at(&btc(), PriceTick::new(px(dec!(100)), now))
            .unwrap();
        let late = PriceTick::new(px(dec!(50)), Timestamp::from_millis(now.as_millis() - 1_000));
        let err = h.evaluator.evaluate_at(&btc(), late).unwrap_err();
        assert!(err.is_benign());
        assert!(h.ledger.position(pos.id).unwrap().is_open());
    }

    #[test]
    fn aged_tick_skipped() {
        let h = harness(fast_config());
        let pos = open(&h, Side::Long);
        let old = PriceTick::new(px(dec!(50)), Timestamp::from_millis(Timestamp::now().as_millis() - 60_000));

        assert!(matches!(
            h.evaluator.evaluate_at(&btc(), old),
            Err(EngineError::PriceUnavailable { .. })
        ));
        assert!(h.ledger.position(pos.id).unwrap().is_open());
    }

    #[tokio::test]
    async fn disconnected_oracle_skips_tick() {
        let h = harness(fast_config());
        let pos = open(&h, Side::Long);
        h.oracle.set_price(&btc(), px(dec!(50)));
        h.oracle.set_healthy(false);

        let err = h.evaluator.tick(&btc()).await.unwrap_err();
        assert!(matches!(err, EngineError::PriceUnavailable { .. }));
        assert!(h.ledger.position(pos.id).unwrap().is_open());

        // reconnect: latest price only
        h.oracle.set_healthy(true);
        h.oracle.set_price(&btc(), px(dec!(89)));
        let outcomes = h.evaluator.tick(&btc()).await.unwrap();
        assert_eq!(outcomes[0].exit_price, px(dec!(89)));
    }

    #[tokio::test]
    async fn slow_oracle_times_out() {
        let h = harness(fast_config());
        open(&h, Side::Long);
        h.oracle.set_price(&btc(), px(dec!(50)));
        h.oracle.set_latency(Duration::from_millis(500));

        let err = h.evaluator.tick(&btc()).await.unwrap_err();
        match err {
            EngineError::PriceUnavailable { reason, .. } => assert!(reason.contains("timed out")),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn stream_mode_closes_on_push() {
        let h = harness(fast_config());
        let pos = open(&h, Side::Short);
        let task = tokio::spawn(Arc::clone(&h.evaluator).run_stream(btc()));

        let mut closed = false;
        for _ in 0..100 {
            h.oracle.set_price(&btc(), px(dec!(111)));
            if wait_closed(&h.ledger, pos.id).await {
                closed = true;
                break;
            }
        }
        assert!(closed);
        assert_eq!(
            h.ledger.position(pos.id).unwrap().close_reason,
            Some(CloseReason::Liquidation)
        );

        h.evaluator.shutdown();
        let _ = task.await;
    }

    #[tokio::test]
    async fn supervisor_discovers_and_stops() {
        let h = harness(fast_config());
        let pos = open(&h, Side::Long);
        h.oracle.set_price(&btc(), px(dec!(100)));
        h.evaluator.spawn();

        let mut started = false;
        for _ in 0..200 {
            if h.evaluator.running_instruments() == vec![btc()] {
                started = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(started);

        h.oracle.set_price(&btc(), px(dec!(85)));
        assert!(wait_closed(&h.ledger, pos.id).await);

        h.evaluator.shutdown();
        assert!(h.evaluator.running_instruments().is_empty());
    }
}
