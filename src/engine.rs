//! Lifecycle engine: one ordering domain per symbol, one global risk gate.
//!
//! Every mutation of a symbol's groups, chains and re-entry contexts happens
//! while holding that symbol's book lock, so a chain break and a new entry
//! for the same symbol can never interleave. Different symbols run in
//! parallel. The risk gate sits behind its own short-lived lock and is never
//! held across an await.

use chrono::{DateTime, NaiveDate, Utc};
use futures_util::future::{join, join_all};
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::broker::{Broker, LegOrder};
use crate::config::EngineConfig;
use crate::error::{BrokerError, EngineError};
use crate::events::{LifecycleEvent, Notice};
use crate::exit_strategy;
use crate::position_manager::{leg_pnl, DualOrderManager, GroupBlueprint, LegAction};
use crate::profit_chain::{ChainEntryRequest, ChainOutcome, ProfitBookingChain, ProfitChainState};
use crate::reentry::{ReEntryContext, ReEntryEngine, ReEntryRequest};
use crate::risk_manager::{EntryProposal, RiskGate, RiskState};
use crate::router::{route, LogicVariant, TrendBook};
use crate::store::{EngineSnapshot, StateStore};
use crate::telegram::Notifier;
use crate::types::{
    ChainId, CloseReason, Direction, EntryOrigin, GroupId, LegId, LegStatus, PositionGroup,
    PositionLeg, Signal, SignalKind, Timeframe,
};
use crate::validator::validate_alert;

/// Everything one symbol owns.
pub struct SymbolBook {
    symbol: String,
    orders: DualOrderManager,
    chains: ProfitBookingChain,
    reentries: ReEntryEngine,
    trends: TrendBook,
    last_price: Option<f64>,
}

impl SymbolBook {
    fn new(symbol: &str, config: &EngineConfig) -> Self {
        SymbolBook {
            symbol: symbol.to_string(),
            orders: DualOrderManager::new(symbol),
            chains: ProfitBookingChain::new(config.profit_booking.clone()),
            reentries: ReEntryEngine::new(config.reentry.clone()),
            trends: TrendBook::default(),
            last_price: None,
        }
    }

    fn is_idle(&self) -> bool {
        self.orders.active_groups().next().is_none() && self.reentries.contexts().next().is_none()
    }
}

/// An entry to size and open, whoever asked for it.
struct EntryRequest {
    symbol: String,
    direction: Direction,
    logic: LogicVariant,
    timeframe: Timeframe,
    strategy: String,
    price: f64,
    origin: EntryOrigin,
    parent_group: Option<GroupId>,
    risk_budget: Option<f64>,
    stop_scale: f64,
    expires_at: Option<DateTime<Utc>>,
}

impl EntryRequest {
    fn fresh(signal: &Signal, logic: LogicVariant) -> Self {
        EntryRequest {
            symbol: signal.symbol.clone(),
            direction: signal.direction,
            logic,
            timeframe: signal.timeframe.clone(),
            strategy: signal.strategy.clone(),
            price: signal.price,
            origin: EntryOrigin::Fresh,
            parent_group: None,
            risk_budget: None,
            stop_scale: 1.0,
            expires_at: None,
        }
    }

    fn reentry(req: &ReEntryRequest) -> Self {
        EntryRequest {
            symbol: req.symbol.clone(),
            direction: req.direction,
            logic: req.logic,
            timeframe: req.timeframe.clone(),
            strategy: req.strategy.clone(),
            price: req.price,
            origin: req.origin(),
            parent_group: Some(req.origin_group.clone()),
            risk_budget: None,
            stop_scale: 1.0,
            expires_at: Some(req.expires_at),
        }
    }

    fn chain_level(req: &ChainEntryRequest, price: f64) -> Self {
        EntryRequest {
            symbol: req.symbol.clone(),
            direction: req.direction,
            logic: req.logic,
            timeframe: req.timeframe.clone(),
            strategy: req.strategy.clone(),
            price,
            origin: EntryOrigin::ChainLevel { chain_id: req.chain_id.clone(), level: req.level },
            parent_group: Some(req.parent_group.clone()),
            risk_budget: Some(req.risk_budget),
            stop_scale: req.stop_scale,
            expires_at: Some(req.expires_at),
        }
    }
}

/// Groups touched by one inbound signal.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct SignalOutcome {
    pub opened: Vec<GroupId>,
    pub closed: Vec<GroupId>,
}

fn last_exit_price(group: &PositionGroup) -> Option<f64> {
    group
        .legs()
        .iter()
        .filter_map(|l| l.closed_at.zip(l.exit_price))
        .max_by_key(|(at, _)| *at)
        .map(|(_, price)| price)
}

pub struct LifecycleEngine {
    config: EngineConfig,
    broker: Arc<dyn Broker>,
    notifier: Arc<dyn Notifier>,
    store: Option<StateStore>,
    /// Held from snapshot to rename so saves land in the order they were taken.
    saving: tokio::sync::Mutex<()>,
    risk: Mutex<RiskGate>,
    books: Mutex<HashMap<String, Arc<tokio::sync::Mutex<SymbolBook>>>>,
}

impl LifecycleEngine {
    pub fn new(
        config: EngineConfig,
        broker: Arc<dyn Broker>,
        notifier: Arc<dyn Notifier>,
        store: Option<StateStore>,
        today: NaiveDate,
    ) -> Self {
        let risk = RiskGate::new(config.risk.clone(), today);
        LifecycleEngine {
            config,
            broker,
            notifier,
            store,
            saving: tokio::sync::Mutex::new(()),
            risk: Mutex::new(risk),
            books: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    fn risk(&self) -> MutexGuard<'_, RiskGate> {
        self.risk.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn book(&self, symbol: &str) -> Arc<tokio::sync::Mutex<SymbolBook>> {
        let mut books = self.books.lock().unwrap_or_else(PoisonError::into_inner);
        books
            .entry(symbol.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(SymbolBook::new(symbol, &self.config))))
            .clone()
    }

    fn all_books(&self) -> Vec<Arc<tokio::sync::Mutex<SymbolBook>>> {
        let books = self.books.lock().unwrap_or_else(PoisonError::into_inner);
        books.values().cloned().collect()
    }

    pub fn risk_state(&self) -> RiskState {
        self.risk().state().clone()
    }

    // ── Inbound signals ──────────────────────────────────────────────────────

    /// Validates a raw alert and processes it.
    pub async fn handle_alert(&self, payload: &Value, now: DateTime<Utc>) -> Result<SignalOutcome, EngineError> {
        match validate_alert(payload, now) {
            Ok(signal) => self.handle_signal(signal, now).await,
            Err(e) => {
                let symbol = payload.get("symbol").and_then(Value::as_str).unwrap_or("?");
                let err = EngineError::from(e);
                self.surface(symbol, &err);
                Err(err)
            }
        }
    }

    /// Exits are evaluated before anything opens, so an opposite entry finds
    /// its variant's slot already free.
    pub async fn handle_signal(&self, signal: Signal, now: DateTime<Utc>) -> Result<SignalOutcome, EngineError> {
        let logic = if signal.kind == SignalKind::Entry {
            match route(&signal) {
                Ok(logic) => Some(logic),
                Err(e) => {
                    let err = EngineError::from(e);
                    self.surface(&signal.symbol, &err);
                    return Err(err);
                }
            }
        } else {
            None
        };
        log::info!(
            "[{}] {} {} {} @ {:.5} ({})",
            signal.symbol, signal.kind, signal.direction, signal.timeframe, signal.price, signal.strategy
        );

        let arc = self.book(&signal.symbol);
        let mut book = arc.lock().await;
        let mut outcome = SignalOutcome::default();
        book.trends.record(&signal);

        let decisions = exit_strategy::evaluate(
            &signal,
            book.orders.active_groups(),
            &book.trends,
            &self.config.exit_strategy,
            &self.config.logic,
        );
        let mut closes = Vec::new();
        for decision in decisions {
            log::info!("[{}] Exit engine: {} closes {}", signal.symbol, decision.condition, decision.group_id);
            for leg in book.orders.closable_legs(&decision.group_id) {
                closes.push((decision.group_id.clone(), leg, CloseReason::Signal));
            }
            outcome.closed.push(decision.group_id);
        }
        let events = self.close_legs(&mut book, closes, signal.price, now).await;
        outcome.opened.extend(self.drive(&mut book, events, now).await);

        let requests = book.reentries.on_signal(&signal, now);
        let continued: Vec<LogicVariant> = requests.iter().map(|r| r.logic).collect();
        outcome.opened.extend(self.run_reentries(&mut book, requests, now).await);

        let mut result = Ok(());
        if let Some(logic) = logic {
            if continued.contains(&logic) {
                log::info!("[{}] Entry taken up by TP continuation on {}", signal.symbol, logic);
            } else {
                match self.open_entry(&mut book, EntryRequest::fresh(&signal, logic), now).await {
                    Ok((group, events)) => {
                        outcome.opened.push(group.id);
                        outcome.opened.extend(self.drive(&mut book, events, now).await);
                    }
                    Err(e) => {
                        self.surface(&signal.symbol, &e);
                        result = Err(e);
                    }
                }
            }
        }
        drop(book);
        self.save_state().await;
        result.map(|_| outcome)
    }

    // ── Prices and broker reports ────────────────────────────────────────────

    /// Trails stops, closes legs whose stop or target was hit, books chain
    /// levels that reached their profit target, and checks SL-hunt contexts.
    /// Returns the groups opened as a consequence.
    pub async fn on_price(&self, symbol: &str, price: f64, now: DateTime<Utc>) -> Vec<GroupId> {
        let arc = self.book(symbol);
        let mut book = arc.lock().await;
        book.last_price = Some(price);

        let actions = book.orders.evaluate_price(price);
        let mut dirty = !actions.is_empty();
        let mut closes = Vec::new();
        for action in actions {
            match action {
                LegAction::MoveStop { group_id, leg_id, stop } => {
                    let Some(leg) = book.orders.get(&group_id).and_then(|g| g.leg(&leg_id)).cloned() else {
                        continue;
                    };
                    if let Err(e) = self.broker.modify_stop(&leg, stop).await {
                        log::warn!("[{}] Stop update for {} failed: {}", symbol, leg_id, e);
                    }
                }
                LegAction::Close { group_id, leg_id, reason, .. } => {
                    if let Some(leg) = book.orders.get(&group_id).and_then(|g| g.leg(&leg_id)).cloned() {
                        closes.push((group_id, leg, reason));
                    }
                }
            }
        }
        let events = self.close_legs(&mut book, closes, price, now).await;
        let mut opened = self.drive(&mut book, events, now).await;

        let bookings = self.profit_target_closes(&book, price);
        dirty |= !bookings.is_empty();
        let events = self.close_legs(&mut book, bookings, price, now).await;
        opened.extend(self.drive(&mut book, events, now).await);

        let requests = book.reentries.on_price(price, now);
        dirty |= !requests.is_empty();
        opened.extend(self.run_reentries(&mut book, requests, now).await);
        drop(book);
        if dirty {
            self.save_state().await;
        }
        opened
    }

    /// Open legs of chain levels whose combined P/L at `price` reached the
    /// level's target. A level with a leg under water is left alone, so
    /// booking never closes a losing leg.
    fn profit_target_closes(&self, book: &SymbolBook, price: f64) -> Vec<(GroupId, PositionLeg, CloseReason)> {
        let spec = self.config.symbol_spec(&book.symbol);
        let due = book.chains.targets_reached(|group_id| {
            let group = book.orders.get(group_id).filter(|g| g.is_active())?;
            let mut combined = 0.0;
            for leg in group.legs() {
                let pnl = match leg.realized_pnl {
                    Some(pnl) => pnl,
                    None if leg.is_open() => leg_pnl(leg, price, &spec),
                    None => return None,
                };
                if leg.is_open() && pnl <= 0.0 {
                    return None;
                }
                combined += pnl;
            }
            Some(combined)
        });
        due.into_iter()
            .flat_map(|(_, group_id, _)| {
                book.orders
                    .closable_legs(&group_id)
                    .into_iter()
                    .map(move |leg| (group_id.clone(), leg, CloseReason::ProfitBooking))
            })
            .collect()
    }

    /// A leg closed at the broker (stop, target or manual). `pnl` is computed
    /// from the symbol's contract data when the broker does not report it.
    pub async fn report_leg_closed(
        &self,
        symbol: &str,
        leg_id: &LegId,
        reason: CloseReason,
        exit_price: f64,
        pnl: Option<f64>,
        now: DateTime<Utc>,
    ) -> Vec<GroupId> {
        let arc = self.book(symbol);
        let mut book = arc.lock().await;
        let Some(leg) = book.orders.group_of_leg(leg_id).and_then(|g| g.leg(leg_id)).cloned() else {
            log::warn!("[{}] Close report for unknown leg {}", symbol, leg_id);
            return Vec::new();
        };
        let pnl = pnl.unwrap_or_else(|| leg_pnl(&leg, exit_price, &self.config.symbol_spec(symbol)));
        let events = book.orders.on_leg_closed(leg_id, reason, exit_price, pnl, now);
        let opened = self.drive(&mut book, events, now).await;
        drop(book);
        self.save_state().await;
        opened
    }

    // ── Control ──────────────────────────────────────────────────────────────

    /// Takes a group flat at the current price.
    pub async fn close_group(&self, symbol: &str, group_id: &GroupId, now: DateTime<Utc>) -> bool {
        let arc = self.book(symbol);
        let mut book = arc.lock().await;
        let legs = book.orders.closable_legs(group_id);
        if legs.is_empty() {
            return false;
        }
        let price = match self.broker.latest_price(symbol).await {
            Ok(p) => p,
            Err(_) => book.last_price.unwrap_or(legs[0].entry_price),
        };
        log::info!("[{}] Manual close of {} @ {:.5}", symbol, group_id, price);
        let closes = legs.into_iter().map(|l| (group_id.clone(), l, CloseReason::Manual)).collect();
        let events = self.close_legs(&mut book, closes, price, now).await;
        self.drive(&mut book, events, now).await;
        drop(book);
        self.save_state().await;
        true
    }

    pub async fn stop_chain(&self, symbol: &str, chain_id: &ChainId, now: DateTime<Utc>) -> bool {
        let arc = self.book(symbol);
        let mut book = arc.lock().await;
        let outcome = book.chains.stop_chain(chain_id, "stopped manually", now);
        let stopped = outcome.is_some();
        if let Some(outcome) = outcome {
            self.chain_outcome(outcome);
        }
        drop(book);
        self.save_state().await;
        stopped
    }

    pub fn set_risk_tier(&self, tier: Option<String>) {
        log::info!("Risk tier set to {:?}", tier);
        self.risk().set_risk_tier(tier);
    }

    pub fn reset_lifetime_loss(&self) {
        log::info!("Lifetime loss reset");
        self.risk().reset_lifetime_loss();
    }

    pub async fn refresh_equity(&self) {
        match self.broker.account_equity().await {
            Ok(Some(equity)) => self.risk().update_equity(equity),
            Ok(None) => {}
            Err(e) => log::warn!("Equity refresh failed: {}", e),
        }
    }

    // ── Time-driven transitions ──────────────────────────────────────────────

    /// Expires re-entry windows and forgets closed groups.
    pub async fn sweep(&self, now: DateTime<Utc>) {
        for arc in self.all_books() {
            let mut book = arc.lock().await;
            for ctx in book.reentries.sweep(now) {
                log::info!("[{}] {} context {} discarded", ctx.symbol, ctx.trigger, ctx.id);
            }
            let pruned = book.orders.prune_closed();
            if pruned > 0 {
                log::debug!("[{}] Pruned {} closed groups", book.symbol, pruned);
            }
        }
        self.save_state().await;
    }

    /// Trading-day boundary: reports yesterday and starts the daily figures over.
    pub async fn new_day(&self, today: NaiveDate) {
        let notice = {
            let mut risk = self.risk();
            let s = risk.state();
            let notice = Notice::DailySummary {
                daily_pnl: s.daily_pnl,
                trades: s.trades_today,
                wins: s.wins_today,
                equity: s.equity,
            };
            risk.new_day(today);
            notice
        };
        log::info!("New trading day {}", today);
        self.notifier.notify(notice);
        self.save_state().await;
    }

    // ── Reconciliation and persistence ───────────────────────────────────────

    /// Resolves groups in `Unknown` against the broker's live exposure.
    ///
    /// A degraded leg the broker still carries volume for is open again; one
    /// it does not is closed as manual, at its entry price if it never filled.
    pub async fn reconcile(&self, now: DateTime<Utc>) -> Result<usize, EngineError> {
        let positions = self.broker.open_positions().await?;
        let mut resolved = 0;
        for arc in self.all_books() {
            let mut book = arc.lock().await;
            let degraded = book.orders.degraded_groups();
            if degraded.is_empty() {
                continue;
            }
            let symbol = book.symbol.clone();
            let spec = self.config.symbol_spec(&symbol);
            let mut events = Vec::new();

            for group in degraded {
                let at_broker: Vec<_> = positions
                    .iter()
                    .filter(|p| p.symbol == symbol && p.direction == group.direction)
                    .collect();
                let broker_volume: f64 = at_broker.iter().map(|p| p.volume).sum();
                let avg_price = at_broker.first().map(|p| p.avg_price).unwrap_or(group.entry_price);
                let tracked: f64 = book
                    .orders
                    .active_groups()
                    .flat_map(|g| g.legs())
                    .filter(|l| l.is_open() && l.direction == group.direction)
                    .map(|l| l.volume)
                    .sum();
                let mut available = broker_volume - tracked;

                for leg in group.legs().into_iter().filter(|l| l.status == LegStatus::Unknown) {
                    if available + 1e-9 >= leg.volume {
                        available -= leg.volume;
                        if leg.order_id.is_some() {
                            book.orders.reinstate_leg(&group.id, &leg.id);
                        } else {
                            events.extend(book.orders.confirm_fill(&group.id, &leg.id, "reconciled", avg_price));
                        }
                        log::info!("[{}] Reconciled {} leg of {}: open at broker", symbol, leg.kind, group.id);
                    } else {
                        let (exit, pnl) = match leg.order_id {
                            Some(_) => {
                                let price = book.last_price.unwrap_or(leg.entry_price);
                                (price, leg_pnl(leg, price, &spec))
                            }
                            None => (leg.entry_price, 0.0),
                        };
                        log::info!("[{}] Reconciled {} leg of {}: gone at broker", symbol, leg.kind, group.id);
                        events.extend(book.orders.on_leg_closed(&leg.id, CloseReason::Manual, exit, pnl, now));
                    }
                }
                resolved += 1;
            }
            self.drive(&mut book, events, now).await;
        }
        self.save_state().await;
        Ok(resolved)
    }

    pub async fn snapshot(&self, now: DateTime<Utc>) -> EngineSnapshot {
        let risk = self.risk_state();
        let mut snapshot = EngineSnapshot {
            saved_at: now,
            risk,
            groups: Vec::new(),
            chains: Vec::new(),
            reentries: Vec::new(),
            trends: HashMap::new(),
        };
        for arc in self.all_books() {
            let book = arc.lock().await;
            snapshot.groups.extend(book.orders.active_groups().cloned());
            snapshot.chains.extend(book.chains.chains().cloned());
            snapshot.reentries.extend(book.reentries.contexts().cloned());
            snapshot.trends.insert(book.symbol.clone(), book.trends.clone());
        }
        snapshot
    }

    /// Persists the current snapshot; failures are logged, never fatal.
    pub async fn save_state(&self) {
        let Some(store) = &self.store else { return };
        let _saving = self.saving.lock().await;
        let snapshot = self.snapshot(Utc::now()).await;
        if let Err(e) = store.save(&snapshot) {
            log::error!("State save to {} failed: {}", store.path().display(), e);
        }
    }

    /// Loads the stored snapshot, if any, and restores it.
    pub async fn restore_from_store(&self, now: DateTime<Utc>) -> Result<bool, crate::error::StoreError> {
        let Some(store) = &self.store else { return Ok(false) };
        match store.load()? {
            Some(snapshot) => {
                self.restore(snapshot, now).await;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Rebuilds in-flight lifecycles. Open risk is re-reserved from the
    /// restored legs; chains without a live group are stopped and groups
    /// pointing at a vanished chain are detached from it.
    pub async fn restore(&self, snapshot: EngineSnapshot, now: DateTime<Utc>) {
        {
            let mut risk = self.risk();
            risk.restore(snapshot.risk, now.date_naive());
            for leg in snapshot.groups.iter().flat_map(|g| g.legs()) {
                if !leg.status.is_terminal() {
                    risk.reserve(leg.reserved_risk);
                }
            }
        }

        let mut groups: HashMap<String, Vec<PositionGroup>> = HashMap::new();
        for g in snapshot.groups.into_iter().filter(|g| g.is_active()) {
            groups.entry(g.symbol.clone()).or_default().push(g);
        }
        let mut chains: HashMap<String, Vec<ProfitChainState>> = HashMap::new();
        for c in snapshot.chains {
            chains.entry(c.symbol.clone()).or_default().push(c);
        }
        let mut contexts: HashMap<String, Vec<ReEntryContext>> = HashMap::new();
        for c in snapshot.reentries {
            contexts.entry(c.symbol.clone()).or_default().push(c);
        }
        let mut symbols: Vec<String> = groups.keys().chain(chains.keys()).chain(contexts.keys()).cloned().collect();
        symbols.extend(snapshot.trends.keys().cloned());
        symbols.sort();
        symbols.dedup();

        for symbol in symbols {
            let arc = self.book(&symbol);
            let mut guard = arc.lock().await;
            let book: &mut SymbolBook = &mut guard;
            for g in groups.remove(&symbol).unwrap_or_default() {
                book.orders.insert_restored(g);
            }
            book.chains.restore(chains.remove(&symbol).unwrap_or_default());
            book.reentries.restore(contexts.remove(&symbol).unwrap_or_default(), now);
            if let Some(trends) = snapshot.trends.get(&symbol) {
                book.trends = trends.clone();
            }

            let stalled = book.chains.stalled(|id| book.orders.get(id).is_some_and(|g| g.is_active()));
            for chain_id in stalled {
                if let Some(outcome) = book.chains.stop_chain(&chain_id, "level lost across restart", now) {
                    self.chain_outcome(outcome);
                }
            }
            book.orders.clear_orphan_chains(|id| book.chains.get(id).is_some());
            log::info!(
                "[{}] Restored {} groups, {} chains, {} re-entry contexts",
                symbol,
                book.orders.active_groups().count(),
                book.chains.chains().count(),
                book.reentries.contexts().count()
            );
        }
    }

    // ── Reporting ────────────────────────────────────────────────────────────

    /// Symbols that need price updates.
    pub async fn watched_symbols(&self) -> Vec<String> {
        let mut symbols = Vec::new();
        for arc in self.all_books() {
            let book = arc.lock().await;
            if !book.is_idle() {
                symbols.push(book.symbol.clone());
            }
        }
        symbols.sort();
        symbols
    }

    pub async fn active_groups(&self, symbol: &str) -> Vec<PositionGroup> {
        let arc = self.book(symbol);
        let book = arc.lock().await;
        book.orders.active_groups().cloned().collect()
    }

    pub async fn group(&self, symbol: &str, group_id: &GroupId) -> Option<PositionGroup> {
        let arc = self.book(symbol);
        let book = arc.lock().await;
        book.orders.get(group_id).cloned()
    }

    pub async fn chains(&self, symbol: &str) -> Vec<ProfitChainState> {
        let arc = self.book(symbol);
        let book = arc.lock().await;
        book.chains.chains().cloned().collect()
    }

    pub async fn reentry_contexts(&self, symbol: &str) -> Vec<ReEntryContext> {
        let arc = self.book(symbol);
        let book = arc.lock().await;
        book.reentries.contexts().cloned().collect()
    }

    pub async fn status_notice(&self) -> Notice {
        let mut lines = Vec::new();
        for arc in self.all_books() {
            let book = arc.lock().await;
            for g in book.orders.active_groups() {
                let price = book.last_price.unwrap_or(g.entry_price);
                lines.push(format!(
                    "<b>{}</b> {} {} L{} {:?} | entry {:.5} | now {:.5}",
                    g.symbol, g.logic, g.direction, g.level, g.status, g.entry_price, price
                ));
            }
            for c in book.chains.chains() {
                lines.push(format!("<b>{}</b> chain L{}/{} | booked {:+.2}", c.symbol, c.current_level, c.max_level, c.cumulative_profit));
            }
        }
        lines.sort();
        let risk = self.risk();
        let s = risk.state();
        Notice::Status {
            lines,
            equity: s.equity,
            daily_pnl: s.daily_pnl,
            trades_today: s.trades_today,
            trading_enabled: risk.check_caps().is_ok(),
        }
    }

    // ── Internals ────────────────────────────────────────────────────────────

    /// Reports a refused signal or entry. Broker failures are reported where
    /// they happen.
    fn surface(&self, symbol: &str, err: &EngineError) {
        log::warn!("[{}] Rejected: {}", symbol, err);
        let notice = match err {
            EngineError::Risk(e) if e.is_cap_breach() => Notice::RiskCapBreached {
                symbol: symbol.to_string(),
                reason: e.to_string(),
            },
            EngineError::BrokerExecution(_) => return,
            other => Notice::SignalRejected { reason: format!("{symbol}: {other}") },
        };
        self.notifier.notify(notice);
    }

    fn chain_outcome(&self, outcome: ChainOutcome) {
        if let ChainOutcome::Ended { chain_id, symbol, status, level, total_profit, reason } = outcome {
            self.notifier.notify(Notice::ChainEnded {
                symbol,
                chain_id,
                reason: format!("{status:?} at L{level} ({reason}), total {total_profit:+.2}"),
            });
        }
    }

    /// Sizes through the risk gate, then places both legs concurrently.
    ///
    /// When both orders are rejected outright the group is dropped and its
    /// risk released. Any other failure leaves the failed legs `Unknown` for
    /// reconciliation, with their risk still reserved.
    async fn open_entry(
        &self,
        book: &mut SymbolBook,
        req: EntryRequest,
        now: DateTime<Utc>,
    ) -> Result<(PositionGroup, Vec<LifecycleEvent>), EngineError> {
        if req.expires_at.is_some_and(|t| now > t) {
            return Err(EngineError::RequestExpired);
        }
        if let Some(active) = book.orders.active_for(req.logic) {
            log::debug!("[{}] {} slot held by {}", req.symbol, req.logic, active.id);
            return Err(EngineError::SlotOccupied { symbol: req.symbol.clone(), logic: req.logic.to_string() });
        }
        let params = req.logic.params(&self.config.logic).clone();
        if req.origin == EntryOrigin::Fresh {
            book.trends
                .confirm(&params, req.direction)
                .map_err(|reason| EngineError::EntryNotConfirmed { direction: req.direction, reason })?;
        }

        let spec = self.config.symbol_spec(&req.symbol);
        let stop_distance = spec.sl_pips * spec.pip_size * params.sl_multiplier * req.stop_scale;
        let proposal = EntryProposal {
            symbol: &req.symbol,
            direction: req.direction,
            entry_price: req.price,
            stop_distance,
            spec: &spec,
            risk_budget: req.risk_budget,
        };
        let approved = self.risk().approve(&proposal)?;

        let (level, chain_id) = match &req.origin {
            EntryOrigin::ChainLevel { chain_id, level } => (*level, Some(chain_id.clone())),
            _ if book.chains.is_enabled() => (1, Some(ChainId::generate())),
            _ => (1, None),
        };
        let blueprint = GroupBlueprint {
            direction: req.direction,
            logic: req.logic,
            timeframe: req.timeframe.clone(),
            strategy: req.strategy.clone(),
            entry_price: req.price,
            level,
            chain_id,
            parent_group: req.parent_group.clone(),
            origin: req.origin.clone(),
            trail_distance: params.trail_pips * spec.pip_size,
            tp_trail_activation: params.tp_trail_activation_r * stop_distance,
        };
        let group = book.orders.open(blueprint, &approved, now);
        let tp_order = LegOrder::for_leg(&group.id, &group.tp_trail, group.chain_id.clone(), level);
        let pt_order = LegOrder::for_leg(&group.id, &group.profit_trail, group.chain_id.clone(), level);

        let (tp, pt) = join(
            self.broker.place_leg(&tp_order, req.price),
            self.broker.place_leg(&pt_order, req.price),
        )
        .await;

        let mut events = Vec::new();
        let mut failure: Option<BrokerError> = None;
        match (tp, pt) {
            (Err(e @ BrokerError::Permanent(_)), Err(BrokerError::Permanent(_))) => {
                book.orders.discard(&group.id);
                self.risk().release(approved.risk_amount);
                log::error!("[{}] Both legs of {} rejected: {}", req.symbol, group.id, e);
                self.notifier.notify(Notice::SignalRejected {
                    reason: format!("{}: orders rejected by broker: {}", req.symbol, e),
                });
                return Err(EngineError::BrokerExecution(e));
            }
            (tp, pt) => {
                for (order, result) in [(&tp_order, tp), (&pt_order, pt)] {
                    match result {
                        Ok(fill) => {
                            events.extend(book.orders.confirm_fill(&group.id, &order.leg_id, &fill.order_id, fill.price));
                        }
                        Err(e) => {
                            book.orders.mark_unknown(&group.id, &order.leg_id);
                            self.notifier.notify(Notice::Degraded {
                                symbol: req.symbol.clone(),
                                group_id: group.id.clone(),
                                error: format!("{} leg: {}", order.kind, e),
                            });
                            failure = Some(e);
                        }
                    }
                }
            }
        }
        if let Some(e) = failure {
            return Err(EngineError::BrokerExecution(e));
        }
        let group = book.orders.get(&group.id).cloned().unwrap_or(group);
        Ok((group, events))
    }

    /// Closes legs at the broker and records the closes that went through.
    async fn close_legs(
        &self,
        book: &mut SymbolBook,
        legs: Vec<(GroupId, PositionLeg, CloseReason)>,
        price: f64,
        now: DateTime<Utc>,
    ) -> Vec<LifecycleEvent> {
        if legs.is_empty() {
            return Vec::new();
        }
        let spec = self.config.symbol_spec(&book.symbol);
        let results = join_all(legs.iter().map(|(_, leg, _)| self.broker.close_leg(leg, price))).await;
        let mut events = Vec::new();
        for ((group_id, leg, reason), result) in legs.iter().zip(results) {
            match result {
                Ok(exit) => {
                    let pnl = leg_pnl(leg, exit, &spec);
                    events.extend(book.orders.on_leg_closed(&leg.id, *reason, exit, pnl, now));
                }
                Err(e) => {
                    book.orders.mark_unknown(group_id, &leg.id);
                    self.notifier.notify(Notice::Degraded {
                        symbol: book.symbol.clone(),
                        group_id: group_id.clone(),
                        error: format!("close {} leg: {}", leg.kind, e),
                    });
                }
            }
        }
        events
    }

    /// Fans lifecycle events out to the risk gate, the chain and the
    /// re-entry engine, then opens whatever chain levels they requested.
    async fn drive(&self, book: &mut SymbolBook, events: Vec<LifecycleEvent>, now: DateTime<Utc>) -> Vec<GroupId> {
        let mut opened = Vec::new();
        let mut requests = self.process_events(book, events, now);
        while let Some((req, price)) = requests.pop_front() {
            match self.open_entry(book, EntryRequest::chain_level(&req, price), now).await {
                Ok((group, events)) => {
                    opened.push(group.id);
                    requests.extend(self.process_events(book, events, now));
                }
                Err(e) => {
                    self.surface(&req.symbol, &e);
                    if let Some(outcome) = book.chains.on_request_failed(&req.chain_id, &e.to_string(), now) {
                        self.chain_outcome(outcome);
                    }
                }
            }
        }
        opened
    }

    fn process_events(
        &self,
        book: &mut SymbolBook,
        events: Vec<LifecycleEvent>,
        now: DateTime<Utc>,
    ) -> VecDeque<(ChainEntryRequest, f64)> {
        let pip_size = self.config.symbol_spec(&book.symbol).pip_size;
        let mut requests = VecDeque::new();
        for event in events {
            match &event {
                LifecycleEvent::GroupOpened(g) => self.notifier.notify(Notice::GroupOpened {
                    symbol: g.symbol.clone(),
                    group_id: g.id.clone(),
                    logic: g.logic,
                    direction: g.direction,
                    level: g.level,
                    entry: g.entry_price,
                    volume_per_leg: g.tp_trail.volume,
                    stop_loss: g.tp_trail.stop_loss,
                    take_profit: g.tp_trail.take_profit.unwrap_or(g.entry_price),
                }),
                LifecycleEvent::LegClosed(lc) => {
                    self.risk().record_close(lc.pnl(), lc.leg.reserved_risk);
                    self.notifier.notify(Notice::LegClosed {
                        symbol: lc.leg.symbol.clone(),
                        group_id: lc.group_id.clone(),
                        leg: lc.leg.kind.to_string(),
                        direction: lc.leg.direction,
                        entry: lc.leg.entry_price,
                        exit: lc.leg.exit_price.unwrap_or(lc.leg.entry_price),
                        pnl: lc.pnl(),
                        reason: lc.reason(),
                    });
                }
                LifecycleEvent::GroupClosed(g) => self.notifier.notify(Notice::GroupClosed {
                    symbol: g.symbol.clone(),
                    group_id: g.id.clone(),
                    status: format!("{:?}", g.status),
                    pnl: g.realized_pnl(),
                }),
            }

            let advanced = match book.chains.on_event(&event, now) {
                Some(ChainOutcome::Advance(req)) => {
                    if let Some(chain) = book.chains.get(&req.chain_id) {
                        self.notifier.notify(Notice::ChainLevelReached {
                            symbol: chain.symbol.clone(),
                            chain_id: chain.chain_id.clone(),
                            level: req.level,
                            level_profit: chain.level_profit,
                            total_profit: chain.cumulative_profit,
                        });
                    }
                    let price = match &event {
                        LifecycleEvent::GroupClosed(g) => last_exit_price(g).unwrap_or(g.entry_price),
                        _ => book.last_price.unwrap_or_default(),
                    };
                    requests.push_back((req, price));
                    true
                }
                Some(outcome) => {
                    self.chain_outcome(outcome);
                    false
                }
                None => false,
            };

            if let LifecycleEvent::GroupClosed(g) = &event {
                if !advanced {
                    book.reentries.on_group_closed(g, pip_size, now);
                }
            }
        }
        requests
    }

    async fn run_reentries(&self, book: &mut SymbolBook, requests: Vec<ReEntryRequest>, now: DateTime<Utc>) -> Vec<GroupId> {
        let mut opened = Vec::new();
        for req in requests {
            self.notifier.notify(Notice::ReEntryTriggered {
                symbol: req.symbol.clone(),
                trigger: req.trigger,
                direction: req.direction,
                attempt: req.attempt,
                price: req.price,
            });
            match self.open_entry(book, EntryRequest::reentry(&req), now).await {
                Ok((group, events)) => {
                    opened.push(group.id);
                    opened.extend(self.drive(book, events, now).await);
                }
                Err(e) => {
                    log::warn!("[{}] {} re-entry discarded: {}", req.symbol, req.trigger, e);
                    self.surface(&req.symbol, &e);
                }
            }
        }
        opened
    }
}
