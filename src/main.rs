//! Margin engine simulation.
//!
//! Scripted scenarios against the in-memory store and the mock oracle: opening and
//! merging, risk levels, a liquidation cascade under the live evaluator, and a close race.

use margin_core::*;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::collections::HashMap;
use std::error::Error;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::{self, error::TryRecvError};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "margin_core=info,margin_sim=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let mut config = EngineConfig::from_env()?;
    if config.environment == Environment::Development {
        // fast cycles so the cascade finishes in well under a second
        config.evaluator.interval_ms = 50;
        config.evaluator.discovery_interval_ms = 50;
    }
    info!(environment = ?config.environment, "margin engine simulation");

    scenario_1_open_and_merge(&config)?;
    scenario_2_risk_levels(&config).await?;
    scenario_3_liquidation_cascade(&config).await?;
    scenario_4_close_race(&config)?;

    info!("all simulations completed");
    Ok(())
}

fn px(value: Decimal) -> Price {
    Price::new_unchecked(value)
}

fn btc() -> Instrument {
    Instrument::new("BTC-USD")
}

const FEED_CAPACITY: usize = 1024;

type Feed = broadcast::Receiver<Event>;

// events go to the bounded log and to a live feed
fn new_ledger(config: &EngineConfig) -> Result<(Arc<Ledger>, Arc<EventLog>, Feed), ConfigError> {
    let log = Arc::new(EventLog::new(config.max_events));
    let feed = Arc::new(BroadcastEmitter::new(FEED_CAPACITY));
    let subscriber = feed.subscribe();
    let emitter = FanoutEmitter::new().with(log.clone()).with(feed);
    let ledger = Ledger::new(config.clone(), Arc::new(MemoryStore::new()), Arc::new(emitter))?;
    Ok((Arc::new(ledger), log, subscriber))
}

// liquidation closes seen on the feed so far
fn drain_liquidations(feed: &mut Feed) -> usize {
    let mut liquidated = 0;
    loop {
        match feed.try_recv() {
            Ok(event) => {
                if matches!(
                    &event.payload,
                    EventPayload::PositionClosed(closed) if closed.close_reason == CloseReason::Liquidation
                ) {
                    liquidated += 1;
                }
            }
            Err(TryRecvError::Lagged(skipped)) => warn!(skipped, "event feed lagged"),
            Err(_) => return liquidated,
        }
    }
}

fn funded_account(ledger: &Ledger, max_leverage: u32, amount: Decimal) -> Result<AccountId, EngineError> {
    let account = ledger.create_account(Some(max_leverage))?;
    ledger.deposit(account.id, Quote::new(amount))?;
    Ok(account.id)
}

/// Open a long, add a second leg at a higher price, then look at equity.
fn scenario_1_open_and_merge(config: &EngineConfig) -> Result<(), Box<dyn Error>> {
    info!("scenario 1: open and merge");
    let (ledger, log, _feed) = new_ledger(config)?;
    let trader = funded_account(&ledger, 10, dec!(1000))?;

    let first = ledger.open(TradeRequest::new(trader, "BTC-USD", Side::Long, Quote::new(dec!(50)), 10, px(dec!(100))))?;
    info!(entry = %first.entry_price, liquidation = %first.liquidation_price, "first leg");

    let merged = ledger.open(TradeRequest::new(trader, "BTC-USD", Side::Long, Quote::new(dec!(50)), 10, px(dec!(110))))?;
    info!(
        margin = %merged.margin,
        entry = %merged.entry_price,
        liquidation = %merged.liquidation_price,
        "after merge"
    );

    let rejected = ledger.open(TradeRequest::new(trader, "BTC-USD", Side::Short, Quote::new(dec!(10)), 5, px(dec!(105))));
    if let Err(err) = rejected {
        info!(error = %err, "opposite direction rejected");
    }

    let marks = HashMap::from([(btc(), px(dec!(108)))]);
    let summary = ledger.account_summary(trader, &marks)?;
    info!(
        balance = %summary.balance,
        margin_in_use = %summary.margin_in_use,
        unrealized = %summary.unrealized_pnl,
        equity = %summary.equity,
        events = log.len(),
        "account summary at 108"
    );
    Ok(())
}

/// Stop-loss and take-profit closing through single evaluator ticks.
async fn scenario_2_risk_levels(config: &EngineConfig) -> Result<(), Box<dyn Error>> {
    info!("scenario 2: risk levels");
    let (ledger, _log, _feed) = new_ledger(config)?;
    let oracle = Arc::new(MockPriceOracle::new());
    let evaluator = TriggerEvaluator::new(ledger.clone(), oracle.clone(), config.evaluator.clone())?;

    let cautious = funded_account(&ledger, 10, dec!(1000))?;
    let greedy = funded_account(&ledger, 10, dec!(1000))?;

    let long = ledger.open(TradeRequest::new(cautious, "ETH-USD", Side::Long, Quote::new(dec!(100)), 5, px(dec!(2000))))?;
    ledger.set_risk_levels(long.id, Some(px(dec!(1950))), Some(px(dec!(2200))))?;

    let short = ledger.open(TradeRequest::new(greedy, "ETH-USD", Side::Short, Quote::new(dec!(100)), 5, px(dec!(2000))))?;
    ledger.set_risk_levels(short.id, Some(px(dec!(2100))), Some(px(dec!(1940))))?;

    let eth = Instrument::new("ETH-USD");
    for price in [dec!(1990), dec!(1960), dec!(1935)] {
        oracle.set_price(&eth, px(price));
        let outcomes = evaluator.tick(&eth).await?;
        for outcome in outcomes {
            info!(position_id = %outcome.position_id, reason = %outcome.reason, exit = %outcome.exit_price, "closed");
        }
    }

    for account in [cautious, greedy] {
        if let Some(account) = ledger.account(account) {
            info!(account_id = %account.id, balance = %account.balance, realized = %account.realized_pnl, "final");
        }
    }
    Ok(())
}

/// Three leverage levels, a falling market, and the supervisor closing positions as they break.
async fn scenario_3_liquidation_cascade(config: &EngineConfig) -> Result<(), Box<dyn Error>> {
    info!("scenario 3: liquidation cascade");
    let (ledger, _log, mut feed) = new_ledger(config)?;
    let oracle = Arc::new(MockPriceOracle::new());
    let evaluator = Arc::new(TriggerEvaluator::new(ledger.clone(), oracle.clone(), config.evaluator.clone())?);

    let mut positions = Vec::new();
    for leverage in [2, 5, 10] {
        let trader = funded_account(&ledger, 10, dec!(10000))?;
        let pos = ledger.open(TradeRequest::new(trader, "BTC-USD", Side::Long, Quote::new(dec!(1000)), leverage, px(dec!(50000))))?;
        info!(%leverage, liquidation = %pos.liquidation_price, "opened");
        positions.push(pos.id);
    }

    oracle.set_price(&btc(), px(dec!(50000)));
    evaluator.spawn();

    let wait = Duration::from_millis(config.evaluator.interval_ms * 4);
    for price in [dec!(47000), dec!(44000), dec!(39000), dec!(24000)] {
        oracle.set_price(&btc(), px(price));
        tokio::time::sleep(wait).await;
        let open = ledger.open_positions(&btc()).len();
        let liquidated = drain_liquidations(&mut feed);
        info!(%price, open, liquidated, "market moved");
    }

    evaluator.shutdown();

    for id in positions {
        if let Some(pos) = ledger.position(id) {
            info!(
                position_id = %pos.id,
                status = ?pos.status,
                reason = ?pos.close_reason,
                realized = ?pos.realized_pnl.map(|q| q.value()),
                "result"
            );
        }
    }
    Ok(())
}

/// Two threads close the same position. Exactly one wins and the account is credited once.
fn scenario_4_close_race(config: &EngineConfig) -> Result<(), Box<dyn Error>> {
    info!("scenario 4: close race");
    let (ledger, _log, _feed) = new_ledger(config)?;
    let trader = funded_account(&ledger, 10, dec!(1000))?;
    let pos = ledger.open(TradeRequest::new(trader, "BTC-USD", Side::Short, Quote::new(dec!(100)), 10, px(dec!(100))))?;

    let racers: Vec<_> = [CloseReason::Manual, CloseReason::TakeProfit]
        .into_iter()
        .map(|reason| {
            let ledger = Arc::clone(&ledger);
            std::thread::spawn(move || ledger.close(pos.id, px(dec!(95)), reason))
        })
        .collect();

    for racer in racers {
        match racer.join() {
            Ok(Ok(closed)) => info!(reason = ?closed.close_reason, "won the close"),
            Ok(Err(err)) if err.is_benign() => info!(error = %err, "lost the close, no-op"),
            Ok(Err(err)) => return Err(err.into()),
            Err(_) => info!("close thread panicked"),
        }
    }

    if let Some(account) = ledger.account(trader) {
        info!(balance = %account.balance, "credited once");
    }
    Ok(())
}
