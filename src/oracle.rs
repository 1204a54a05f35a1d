// Price Oracle Integration
//
// The engine never talks to an exchange or data vendor directly. Anything that can
// answer "what is the price of X right now" implements PriceOracle and is injected into
// the trigger evaluator. Gaps and duplicate ticks are expected and tolerated downstream.

use crate::types::{Instrument, Price, Timestamp};
use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::broadcast;

/// Default buffer for each instrument's push channel
const TICK_CHANNEL_CAPACITY: usize = 256;

/// A single price observation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriceTick {
    pub price: Price,
    /// When the price was observed at the source
    pub timestamp: Timestamp,
}

impl PriceTick {
    pub fn new(price: Price, timestamp: Timestamp) -> Self {
        Self { price, timestamp }
    }

    pub fn age_ms(&self, now: Timestamp) -> i64 {
        now.millis_since(self.timestamp)
    }
}

/// Errors an oracle can report
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum OracleError {
    #[error("no price source for {0}")]
    UnknownInstrument(Instrument),

    #[error("price source for {0} is disconnected")]
    Unavailable(Instrument),

    #[error("price request for {instrument} timed out after {after_ms}ms")]
    Timeout { instrument: Instrument, after_ms: u64 },
}

/// Source of market prices. Implement this to wire in a real feed.
#[async_trait]
pub trait PriceOracle: Send + Sync {
    /// Pull the latest price
    async fn get_price(&self, instrument: &Instrument) -> Result<PriceTick, OracleError>;

    /// Push stream of ticks. Slow receivers may lag and lose old ticks
    fn subscribe(&self, instrument: &Instrument) -> Result<broadcast::Receiver<PriceTick>, OracleError>;
}

/// Scriptable oracle for tests and the simulator
pub struct MockPriceOracle {
    prices: DashMap<Instrument, PriceTick>,
    channels: DashMap<Instrument, broadcast::Sender<PriceTick>>,
    healthy: AtomicBool,
    /// Artificial delay on every pull, for exercising timeouts
    latency_ms: AtomicU64,
}

impl MockPriceOracle {
    pub fn new() -> Self {
        Self {
            prices: DashMap::new(),
            channels: DashMap::new(),
            healthy: AtomicBool::new(true),
            latency_ms: AtomicU64::new(0),
        }
    }

    /// Sets the price stamped with the current time and pushes it to subscribers
    pub fn set_price(&self, instrument: &Instrument, price: Price) -> PriceTick {
        self.set_price_at(instrument, price, Timestamp::now())
    }

    pub fn set_price_at(&self, instrument: &Instrument, price: Price, timestamp: Timestamp) -> PriceTick {
        let tick = PriceTick::new(price, timestamp);
        self.prices.insert(instrument.clone(), tick);

        // a disconnected feed pushes nothing
        if self.is_healthy() {
            if let Some(tx) = self.channels.get(instrument) {
                let _ = tx.send(tick);
            }
        }
        tick
    }

    pub fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::SeqCst);
    }

    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::SeqCst)
    }

    pub fn set_latency(&self, latency: Duration) {
        self.latency_ms.store(latency.as_millis() as u64, Ordering::SeqCst);
    }

    fn sender(&self, instrument: &Instrument) -> broadcast::Sender<PriceTick> {
        self.channels
            .entry(instrument.clone())
            .or_insert_with(|| broadcast::channel(TICK_CHANNEL_CAPACITY).0)
            .clone()
    }
}

impl Default for MockPriceOracle {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PriceOracle for MockPriceOracle {
    async fn get_price(&self, instrument: &Instrument) -> Result<PriceTick, OracleError> {
        let latency = self.latency_ms.load(Ordering::SeqCst);
        if latency > 0 {
            tokio::time::sleep(Duration::from_millis(latency)).await;
        }

        if !self.is_healthy() {
            return Err(OracleError::Unavailable(instrument.clone()));
        }
        self.prices
            .get(instrument)
            .map(|tick| *tick)
            .ok_or_else(|| OracleError::UnknownInstrument(instrument.clone()))
    }

    fn subscribe(&self, instrument: &Instrument) -> Result<broadcast::Receiver<PriceTick>, OracleError> {
        Ok(self.sender(instrument).subscribe())
    }
}
