//! Broker execution seam: the trait the engine talks to, the retrying
//! decorator, and the paper broker used for simulated orders.

use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::config::BrokerConfig;
use crate::error::BrokerError;
use crate::types::{ChainId, Direction, GroupId, LegId, LegKind, PositionLeg};

/// One leg's market order.
#[derive(Clone, Debug, PartialEq)]
pub struct LegOrder {
    pub group_id: GroupId,
    pub leg_id: LegId,
    pub kind: LegKind,
    pub symbol: String,
    pub direction: Direction,
    pub volume: f64,
    pub stop_loss: f64,
    pub take_profit: Option<f64>,
    pub chain_id: Option<ChainId>,
    pub level: u8,
}

impl LegOrder {
    pub fn for_leg(group_id: &GroupId, leg: &PositionLeg, chain_id: Option<ChainId>, level: u8) -> Self {
        LegOrder {
            group_id: group_id.clone(),
            leg_id: leg.id.clone(),
            kind: leg.kind,
            symbol: leg.symbol.clone(),
            direction: leg.direction,
            volume: leg.volume,
            stop_loss: leg.stop_loss,
            take_profit: leg.take_profit,
            chain_id,
            level,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Fill {
    pub order_id: String,
    pub price: f64,
}

/// Net live exposure the broker reports for one symbol and side.
#[derive(Clone, Debug, PartialEq)]
pub struct BrokerPosition {
    pub symbol: String,
    pub direction: Direction,
    pub volume: f64,
    pub avg_price: f64,
}

#[async_trait]
pub trait Broker: Send + Sync {
    /// Market order for one leg; `price` is the reference price of the request.
    async fn place_leg(&self, order: &LegOrder, price: f64) -> Result<Fill, BrokerError>;

    /// Flattens one leg. Returns the exit price.
    async fn close_leg(&self, leg: &PositionLeg, price: f64) -> Result<f64, BrokerError>;

    async fn modify_stop(&self, leg: &PositionLeg, stop: f64) -> Result<(), BrokerError>;

    async fn open_positions(&self) -> Result<Vec<BrokerPosition>, BrokerError>;

    /// `None` when the broker keeps no account of its own.
    async fn account_equity(&self) -> Result<Option<f64>, BrokerError>;

    async fn latest_price(&self, symbol: &str) -> Result<f64, BrokerError>;
}

// ── Retry ─────────────────────────────────────────────────────────────────────

#[derive(Clone, Debug, PartialEq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl From<&BrokerConfig> for RetryPolicy {
    fn from(config: &BrokerConfig) -> Self {
        RetryPolicy {
            max_retries: config.max_retries,
            initial_backoff: Duration::from_millis(config.initial_backoff_ms),
            max_backoff: Duration::from_millis(config.max_backoff_ms),
        }
    }
}

/// Retries rate limits and transient failures with exponential backoff.
/// Permanent errors return at once.
pub async fn with_retry<F, Fut, T>(policy: &RetryPolicy, what: &str, operation: F) -> Result<T, BrokerError>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T, BrokerError>>,
{
    let mut retries = 0;
    let mut delay = policy.initial_backoff;
    loop {
        match operation().await {
            Ok(r) => return Ok(r),
            Err(e) if !e.is_retryable() => return Err(e),
            Err(e) if retries >= policy.max_retries => {
                log::error!("{} failed after {} retries: {}", what, retries, e);
                return Err(e);
            }
            Err(BrokerError::RateLimit { retry_after }) => {
                let wait = Duration::from_secs(retry_after).min(policy.max_backoff);
                log::warn!("{}: rate limited, sleeping {:?} ({}/{})", what, wait, retries + 1, policy.max_retries);
                tokio::time::sleep(wait).await;
                retries += 1;
            }
            Err(e) => {
                log::warn!("{}: {}, retry in {:?} ({}/{})", what, e, delay, retries + 1, policy.max_retries);
                tokio::time::sleep(delay).await;
                delay = (delay * 2).min(policy.max_backoff);
                retries += 1;
            }
        }
    }
}

/// Wraps any broker so every call goes through [`with_retry`].
pub struct RetryingBroker {
    inner: Arc<dyn Broker>,
    policy: RetryPolicy,
}

impl RetryingBroker {
    pub fn new(inner: Arc<dyn Broker>, policy: RetryPolicy) -> Self {
        RetryingBroker { inner, policy }
    }
}

#[async_trait]
impl Broker for RetryingBroker {
    async fn place_leg(&self, order: &LegOrder, price: f64) -> Result<Fill, BrokerError> {
        let what = format!("[{}] place {} leg {}", order.symbol, order.kind, order.leg_id);
        with_retry(&self.policy, &what, || self.inner.place_leg(order, price)).await
    }

    async fn close_leg(&self, leg: &PositionLeg, price: f64) -> Result<f64, BrokerError> {
        let what = format!("[{}] close leg {}", leg.symbol, leg.id);
        with_retry(&self.policy, &what, || self.inner.close_leg(leg, price)).await
    }

    async fn modify_stop(&self, leg: &PositionLeg, stop: f64) -> Result<(), BrokerError> {
        let what = format!("[{}] move stop of {}", leg.symbol, leg.id);
        with_retry(&self.policy, &what, || self.inner.modify_stop(leg, stop)).await
    }

    async fn open_positions(&self) -> Result<Vec<BrokerPosition>, BrokerError> {
        with_retry(&self.policy, "position list", || self.inner.open_positions()).await
    }

    async fn account_equity(&self) -> Result<Option<f64>, BrokerError> {
        with_retry(&self.policy, "wallet balance", || self.inner.account_equity()).await
    }

    async fn latest_price(&self, symbol: &str) -> Result<f64, BrokerError> {
        let what = format!("[{}] ticker", symbol);
        with_retry(&self.policy, &what, || self.inner.latest_price(symbol)).await
    }
}

// ── Paper broker ──────────────────────────────────────────────────────────────

#[derive(Clone, Debug)]
struct PaperLeg {
    symbol: String,
    direction: Direction,
    volume: f64,
    entry: f64,
}

/// Fills every order at the reference price. Failures can be queued to
/// exercise retry and degraded paths.
#[derive(Default)]
pub struct PaperBroker {
    next_id: AtomicU64,
    legs: Mutex<HashMap<LegId, PaperLeg>>,
    prices: Mutex<HashMap<String, f64>>,
    failures: Mutex<VecDeque<BrokerError>>,
}

impl PaperBroker {
    pub fn new() -> Self {
        PaperBroker::default()
    }

    /// Symbols are keyed upper-cased, the way validated signals carry them.
    pub fn set_price(&self, symbol: &str, price: f64) {
        if let Ok(mut prices) = self.prices.lock() {
            prices.insert(symbol.trim().to_ascii_uppercase(), price);
        }
    }

    /// The next order calls (place or close) fail with these errors, in order.
    pub fn fail_next(&self, errors: impl IntoIterator<Item = BrokerError>) {
        if let Ok(mut failures) = self.failures.lock() {
            failures.extend(errors);
        }
    }

    /// Drops a leg as if it was closed outside the engine.
    pub fn forget_leg(&self, leg_id: &LegId) {
        if let Ok(mut legs) = self.legs.lock() {
            legs.remove(leg_id);
        }
    }

    pub fn open_leg_count(&self) -> usize {
        self.legs.lock().map(|l| l.len()).unwrap_or(0)
    }

    fn injected_failure(&self) -> Result<(), BrokerError> {
        match self.failures.lock() {
            Ok(mut failures) => failures.pop_front().map_or(Ok(()), Err),
            Err(_) => Err(BrokerError::Transient("paper broker poisoned".into())),
        }
    }

    fn lock_legs(&self) -> Result<std::sync::MutexGuard<'_, HashMap<LegId, PaperLeg>>, BrokerError> {
        self.legs.lock().map_err(|_| BrokerError::Transient("paper broker poisoned".into()))
    }
}

#[async_trait]
impl Broker for PaperBroker {
    async fn place_leg(&self, order: &LegOrder, price: f64) -> Result<Fill, BrokerError> {
        self.injected_failure()?;
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        self.lock_legs()?.insert(
            order.leg_id.clone(),
            PaperLeg { symbol: order.symbol.clone(), direction: order.direction, volume: order.volume, entry: price },
        );
        log::info!(
            "[{}] PAPER {} {} {:.4} @ {:.5} ({})",
            order.symbol, order.direction, order.kind, order.volume, price, order.leg_id
        );
        Ok(Fill { order_id: format!("paper-{id}"), price })
    }

    async fn close_leg(&self, leg: &PositionLeg, price: f64) -> Result<f64, BrokerError> {
        self.injected_failure()?;
        if self.lock_legs()?.remove(&leg.id).is_none() {
            return Err(BrokerError::Permanent(format!("leg {} has no open position", leg.id)));
        }
        log::info!("[{}] PAPER close {} @ {:.5}", leg.symbol, leg.id, price);
        Ok(price)
    }

    async fn modify_stop(&self, _leg: &PositionLeg, _stop: f64) -> Result<(), BrokerError> {
        Ok(())
    }

    async fn open_positions(&self) -> Result<Vec<BrokerPosition>, BrokerError> {
        let legs = self.lock_legs()?;
        let mut net: HashMap<(String, Direction), BrokerPosition> = HashMap::new();
        for leg in legs.values() {
            let pos = net.entry((leg.symbol.clone(), leg.direction)).or_insert_with(|| BrokerPosition {
                symbol: leg.symbol.clone(),
                direction: leg.direction,
                volume: 0.0,
                avg_price: 0.0,
            });
            let total = pos.volume + leg.volume;
            pos.avg_price = (pos.avg_price * pos.volume + leg.entry * leg.volume) / total;
            pos.volume = total;
        }
        Ok(net.into_values().collect())
    }

    async fn account_equity(&self) -> Result<Option<f64>, BrokerError> {
        Ok(None)
    }

    async fn latest_price(&self, symbol: &str) -> Result<f64, BrokerError> {
        self.prices
            .lock()
            .ok()
            .and_then(|p| p.get(&symbol.trim().to_ascii_uppercase()).copied())
            .ok_or_else(|| BrokerError::Transient(format!("no price for {symbol}")))
    }
}
