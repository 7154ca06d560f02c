//! Re-entry engine: reopens a closed group's idea under one of three
//! mutually exclusive triggers, bounded by a window and an attempt count.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::config::{ReEntryConfig, TriggerConfig};
use crate::router::LogicVariant;
use crate::types::{
    CloseReason, ContextId, Direction, EntryOrigin, GroupId, PositionGroup, ReEntryTrigger, Signal,
    SignalKind, Timeframe,
};

/// A closed group waiting for its re-entry condition.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ReEntryContext {
    pub id: ContextId,
    /// First group of the re-entry lineage; attempts are counted against it.
    pub origin_group: GroupId,
    pub closed_group: GroupId,
    pub symbol: String,
    pub direction: Direction,
    pub logic: LogicVariant,
    pub timeframe: Timeframe,
    pub strategy: String,
    pub trigger: ReEntryTrigger,
    pub entry_price: f64,
    /// SL hunt: price that must be crossed back through to re-enter.
    pub trigger_level: f64,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub attempts_so_far: u32,
    pub max_attempts: u32,
    /// Exit continuation: same-direction trend signals seen so far.
    pub confirmations: u32,
}

impl ReEntryContext {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at
    }
}

/// A re-entry that fired. Goes through the risk gate like any fresh entry.
#[derive(Clone, Debug, PartialEq)]
pub struct ReEntryRequest {
    pub context_id: ContextId,
    pub symbol: String,
    pub direction: Direction,
    pub logic: LogicVariant,
    pub timeframe: Timeframe,
    pub strategy: String,
    pub trigger: ReEntryTrigger,
    pub origin_group: GroupId,
    pub attempt: u32,
    pub price: f64,
    pub expires_at: DateTime<Utc>,
}

impl ReEntryRequest {
    pub fn origin(&self) -> EntryOrigin {
        EntryOrigin::ReEntry {
            trigger: self.trigger,
            origin_group: self.origin_group.clone(),
            attempt: self.attempt,
        }
    }
}

/// Picks the trigger from how the legs closed. A deliberate close (exit
/// signal or manual) wins over a target hit, which wins over a losing stop.
/// Legs that only trailed out in profit arm nothing.
fn trigger_for(group: &PositionGroup) -> Option<ReEntryTrigger> {
    let legs = group.legs();
    let closed_by = |wanted: &[CloseReason]| {
        legs.iter().any(|l| l.close_reason.is_some_and(|r| wanted.contains(&r)))
    };
    if closed_by(&[CloseReason::Signal, CloseReason::Manual]) {
        Some(ReEntryTrigger::ExitContinuation)
    } else if closed_by(&[CloseReason::TakeProfit, CloseReason::ProfitBooking]) {
        Some(ReEntryTrigger::TpContinuation)
    } else if legs.iter().any(|l| {
        matches!(l.close_reason, Some(CloseReason::StopLoss | CloseReason::TrailingStop))
            && l.realized_pnl.is_some_and(|p| p < 0.0)
    }) {
        Some(ReEntryTrigger::SlHunt)
    } else {
        None
    }
}

/// Re-entry contexts of one symbol.
pub struct ReEntryEngine {
    config: ReEntryConfig,
    contexts: BTreeMap<ContextId, ReEntryContext>,
}

impl ReEntryEngine {
    pub fn new(config: ReEntryConfig) -> Self {
        ReEntryEngine { config, contexts: BTreeMap::new() }
    }

    fn trigger_config(&self, trigger: ReEntryTrigger) -> &TriggerConfig {
        match trigger {
            ReEntryTrigger::SlHunt => &self.config.sl_hunt,
            ReEntryTrigger::TpContinuation => &self.config.tp_continuation,
            ReEntryTrigger::ExitContinuation => &self.config.exit_continuation,
        }
    }

    pub fn contexts(&self) -> impl Iterator<Item = &ReEntryContext> {
        self.contexts.values()
    }

    /// Arms a context for a closed group. Chain children never re-enter, and a
    /// lineage that used up its attempts is dropped.
    pub fn on_group_closed(&mut self, group: &PositionGroup, pip_size: f64, now: DateTime<Utc>) -> Option<ContextId> {
        if group.is_chain_child() {
            return None;
        }
        if !group.status.is_terminal() {
            return None;
        }
        let trigger = trigger_for(group)?;
        let cfg = self.trigger_config(trigger).clone();
        if !cfg.enabled {
            return None;
        }

        let (origin_group, attempts_so_far) = match &group.origin {
            EntryOrigin::ReEntry { origin_group, attempt, .. } => (origin_group.clone(), *attempt),
            _ => (group.id.clone(), 0),
        };
        if attempts_so_far >= cfg.max_attempts {
            log::info!(
                "[{}] {} for {} not armed: {}/{} attempts used",
                group.symbol, trigger, origin_group, attempts_so_far, cfg.max_attempts
            );
            return None;
        }

        // a newer close on the same slot supersedes older contexts
        self.contexts.retain(|_, c| c.logic != group.logic);

        let offset = self.config.sl_hunt_offset_pips * pip_size;
        let ctx = ReEntryContext {
            id: ContextId::generate(),
            origin_group,
            closed_group: group.id.clone(),
            symbol: group.symbol.clone(),
            direction: group.direction,
            logic: group.logic,
            timeframe: group.timeframe.clone(),
            strategy: group.strategy.clone(),
            trigger,
            entry_price: group.entry_price,
            trigger_level: group.entry_price + group.direction.sign() * offset,
            created_at: now,
            expires_at: now + Duration::seconds(cfg.window_secs),
            attempts_so_far,
            max_attempts: cfg.max_attempts,
            confirmations: 0,
        };
        log::info!(
            "[{}] {} armed for {} {} until {} (attempt {}/{})",
            ctx.symbol, trigger, ctx.logic, ctx.direction,
            ctx.expires_at.format("%H:%M:%S"), attempts_so_far + 1, cfg.max_attempts
        );
        let id = ctx.id.clone();
        self.contexts.insert(id.clone(), ctx);
        Some(id)
    }

    /// Removes and returns contexts whose window has passed.
    pub fn sweep(&mut self, now: DateTime<Utc>) -> Vec<ReEntryContext> {
        let expired: Vec<ContextId> = self
            .contexts
            .values()
            .filter(|c| c.is_expired(now))
            .map(|c| c.id.clone())
            .collect();
        expired
            .into_iter()
            .filter_map(|id| self.contexts.remove(&id))
            .inspect(|c| log::info!("[{}] {} window expired for {}", c.symbol, c.trigger, c.closed_group))
            .collect()
    }

    fn fire(&mut self, id: &ContextId, price: f64) -> Option<ReEntryRequest> {
        let ctx = self.contexts.remove(id)?;
        log::info!(
            "[{}] {} triggered: {} {} @ {:.5}",
            ctx.symbol, ctx.trigger, ctx.logic, ctx.direction, price
        );
        Some(ReEntryRequest {
            context_id: ctx.id,
            symbol: ctx.symbol,
            direction: ctx.direction,
            logic: ctx.logic,
            timeframe: ctx.timeframe,
            strategy: ctx.strategy,
            trigger: ctx.trigger,
            origin_group: ctx.origin_group,
            attempt: ctx.attempts_so_far + 1,
            price,
            expires_at: ctx.expires_at,
        })
    }

    /// SL hunt: price crossed back through the original entry (plus offset).
    pub fn on_price(&mut self, price: f64, now: DateTime<Utc>) -> Vec<ReEntryRequest> {
        self.sweep(now);
        let ready: Vec<ContextId> = self
            .contexts
            .values()
            .filter(|c| c.trigger == ReEntryTrigger::SlHunt)
            .filter(|c| (price - c.trigger_level) * c.direction.sign() >= 0.0)
            .map(|c| c.id.clone())
            .collect();
        ready.iter().filter_map(|id| self.fire(id, price)).collect()
    }

    /// TP continuation fires on a same-direction trend signal, or on an entry
    /// routed to the context's own variant; exit continuation once enough
    /// same-direction trend signals confirmed it.
    pub fn on_signal(&mut self, signal: &Signal, now: DateTime<Utc>) -> Vec<ReEntryRequest> {
        self.sweep(now);
        let needed = self.config.exit_continuation_confirmations.max(1);
        let entry_logic = LogicVariant::for_timeframe(&signal.timeframe).ok();
        let mut ready = Vec::new();
        for ctx in self.contexts.values_mut().filter(|c| c.direction == signal.direction) {
            match (ctx.trigger, signal.kind) {
                (ReEntryTrigger::TpContinuation, SignalKind::Trend) => {
                    ready.push(ctx.id.clone());
                }
                (ReEntryTrigger::TpContinuation, SignalKind::Entry) if entry_logic == Some(ctx.logic) => {
                    ready.push(ctx.id.clone());
                }
                (ReEntryTrigger::ExitContinuation, SignalKind::Trend | SignalKind::Reversal) => {
                    ctx.confirmations += 1;
                    log::debug!(
                        "[{}] Exit continuation {}/{} confirmations",
                        ctx.symbol, ctx.confirmations, needed
                    );
                    if ctx.confirmations >= needed {
                        ready.push(ctx.id.clone());
                    }
                }
                _ => {}
            }
        }
        ready.iter().filter_map(|id| self.fire(id, signal.price)).collect()
    }

    pub fn restore(&mut self, contexts: Vec<ReEntryContext>, now: DateTime<Utc>) {
        for ctx in contexts.into_iter().filter(|c| !c.is_expired(now)) {
            self.contexts.insert(ctx.id.clone(), ctx);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{GroupStatus, LegId, LegKind, LegStatus, PositionLeg, RiskSnapshot, TrailPolicy};
    use chrono::TimeZone;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 2, 10, 0, 0).unwrap()
    }

    fn leg(kind: LegKind, reason: CloseReason, pnl: f64) -> PositionLeg {
        PositionLeg {
            id: LegId::generate(),
            kind,
            symbol: "EURUSD".into(),
            direction: Direction::Buy,
            entry_price: 1.1,
            volume: 0.33,
            stop_loss: 1.0985,
            take_profit: None,
            trail: TrailPolicy { distance: 0.001, activation: 0.0, active: false, best_price: 1.1 },
            status: if pnl < 0.0 { LegStatus::ClosedLoss } else { LegStatus::ClosedProfit },
            reserved_risk: 49.5,
            order_id: None,
            exit_price: Some(1.1 + pnl / 33_000.0),
            realized_pnl: Some(pnl),
            close_reason: Some(reason),
            closed_at: Some(t0()),
        }
    }

    fn group_with(legs: [(CloseReason, f64); 2], origin: EntryOrigin) -> PositionGroup {
        let [(r1, p1), (r2, p2)] = legs;
        let status = if matches!(r1, CloseReason::Signal | CloseReason::Manual)
            || matches!(r2, CloseReason::Signal | CloseReason::Manual)
        {
            GroupStatus::ClosedManual
        } else if p1 + p2 > 0.0 {
            GroupStatus::ClosedProfit
        } else {
            GroupStatus::ClosedLoss
        };
        PositionGroup {
            id: GroupId::generate(),
            symbol: "EURUSD".into(),
            direction: Direction::Buy,
            logic: LogicVariant::Logic1,
            timeframe: Timeframe::parse("5m").unwrap(),
            strategy: "LOGIC1".into(),
            entry_price: 1.1,
            tp_trail: leg(LegKind::TpTrail, r1, p1),
            profit_trail: leg(LegKind::ProfitTrail, r2, p2),
            level: 1,
            chain_id: None,
            parent_group: None,
            origin,
            risk: RiskSnapshot { tier: "10000".into(), rr_ratio: 1.5, equity: 10_000.0, risk_amount: 99.0, stop_distance: 0.0015 },
            status,
            opened_at: t0(),
            closed_at: Some(t0()),
        }
    }

    fn stopped_out(origin: EntryOrigin) -> PositionGroup {
        group_with([(CloseReason::StopLoss, -49.5), (CloseReason::StopLoss, -49.5)], origin)
    }

    fn target_hit(origin: EntryOrigin) -> PositionGroup {
        group_with([(CloseReason::TakeProfit, 74.25), (CloseReason::TrailingStop, 33.0)], origin)
    }

    fn exited(origin: EntryOrigin) -> PositionGroup {
        group_with([(CloseReason::Signal, 20.0), (CloseReason::Signal, 20.0)], origin)
    }

    fn signal(kind: SignalKind, direction: Direction, price: f64) -> Signal {
        signal_on("5m", kind, direction, price)
    }

    fn signal_on(tf: &str, kind: SignalKind, direction: Direction, price: f64) -> Signal {
        Signal {
            kind,
            symbol: "EURUSD".into(),
            direction,
            timeframe: Timeframe::parse(tf).unwrap(),
            price,
            strategy: "test".into(),
            timestamp: t0(),
        }
    }

    #[test]
    fn trigger_follows_how_the_legs_closed() {
        let cases = [
            ([(CloseReason::StopLoss, -49.5), (CloseReason::StopLoss, -49.5)], Some(ReEntryTrigger::SlHunt)),
            ([(CloseReason::StopLoss, -49.5), (CloseReason::TrailingStop, -10.0)], Some(ReEntryTrigger::SlHunt)),
            // a target hit outranks the sibling's stop-out, even at a net loss
            ([(CloseReason::TakeProfit, 20.0), (CloseReason::StopLoss, -49.5)], Some(ReEntryTrigger::TpContinuation)),
            ([(CloseReason::ProfitBooking, 30.0), (CloseReason::ProfitBooking, 10.0)], Some(ReEntryTrigger::TpContinuation)),
            ([(CloseReason::TakeProfit, 74.25), (CloseReason::Manual, -5.0)], Some(ReEntryTrigger::ExitContinuation)),
            // trailed out in profit without touching the target
            ([(CloseReason::TrailingStop, 66.0), (CloseReason::TrailingStop, 16.5)], None),
            ([(CloseReason::TrailingStop, 0.0), (CloseReason::TrailingStop, 0.0)], None),
        ];
        for (legs, expected) in cases {
            let group = group_with(legs, EntryOrigin::Fresh);
            let mut engine = ReEntryEngine::new(ReEntryConfig::default());
            engine.on_group_closed(&group, 0.0001, t0());
            let armed = engine.contexts().next().map(|c| c.trigger);
            assert_eq!(armed, expected, "{legs:?}");
        }
    }

    #[test]
    fn open_group_arms_nothing() {
        let mut group = stopped_out(EntryOrigin::Fresh);
        group.status = GroupStatus::PartiallyClosed;
        let mut engine = ReEntryEngine::new(ReEntryConfig::default());
        assert!(engine.on_group_closed(&group, 0.0001, t0()).is_none());
    }

    #[test]
    fn sl_hunt_fires_when_price_reclaims_entry() {
        let mut engine = ReEntryEngine::new(ReEntryConfig::default());
        let group = stopped_out(EntryOrigin::Fresh);
        engine.on_group_closed(&group, 0.0001, t0()).unwrap();

        assert!(engine.on_price(1.0990, t0() + Duration::minutes(5)).is_empty());
        assert!(engine.on_price(1.10005, t0() + Duration::minutes(6)).is_empty());
        let fired = engine.on_price(1.1002, t0() + Duration::minutes(7));
        assert_eq!(fired.len(), 1);
        let req = &fired[0];
        assert_eq!(req.trigger, ReEntryTrigger::SlHunt);
        assert_eq!(req.direction, Direction::Buy);
        assert_eq!(req.attempt, 1);
        assert_eq!(req.origin_group, group.id);
        assert_eq!(engine.contexts().count(), 0);
    }

    #[test]
    fn expired_window_discards_context() {
        let mut engine = ReEntryEngine::new(ReEntryConfig::default());
        engine.on_group_closed(&stopped_out(EntryOrigin::Fresh), 0.0001, t0());
        assert!(engine.on_price(1.1010, t0() + Duration::minutes(31)).is_empty());
        assert_eq!(engine.contexts().count(), 0);
    }

    #[test]
    fn attempts_are_bounded_per_lineage() {
        let mut engine = ReEntryEngine::new(ReEntryConfig::default());
        let origin = GroupId::generate();
        let reentered = stopped_out(
            EntryOrigin::ReEntry { trigger: ReEntryTrigger::SlHunt, origin_group: origin.clone(), attempt: 1 },
        );
        // SL hunt allows one attempt
        assert!(engine.on_group_closed(&reentered, 0.0001, t0()).is_none());

        // TP continuation allows two: the second attempt is still armed
        let won = target_hit(
            EntryOrigin::ReEntry { trigger: ReEntryTrigger::TpContinuation, origin_group: origin.clone(), attempt: 1 },
        );
        engine.on_group_closed(&won, 0.0001, t0()).unwrap();
        let fired = engine.on_signal(&signal(SignalKind::Trend, Direction::Buy, 1.105), t0());
        assert_eq!(fired[0].attempt, 2);
        assert_eq!(fired[0].origin_group, origin);
    }

    #[test]
    fn tp_continuation_needs_same_direction() {
        let mut engine = ReEntryEngine::new(ReEntryConfig::default());
        engine.on_group_closed(&target_hit(EntryOrigin::Fresh), 0.0001, t0());
        assert!(engine.on_signal(&signal(SignalKind::Entry, Direction::Sell, 1.103), t0()).is_empty());
        assert!(engine.on_signal(&signal(SignalKind::Bias, Direction::Buy, 1.103), t0()).is_empty());
        assert!(engine.on_price(1.2, t0()).is_empty());
        let fired = engine.on_signal(&signal(SignalKind::Entry, Direction::Buy, 1.104), t0());
        assert_eq!(fired.len(), 1);
        assert_eq!(fired[0].trigger, ReEntryTrigger::TpContinuation);
        assert_eq!(fired[0].price, 1.104);
    }

    #[test]
    fn tp_continuation_ignores_entries_routed_elsewhere() {
        let mut engine = ReEntryEngine::new(ReEntryConfig::default());
        engine.on_group_closed(&target_hit(EntryOrigin::Fresh), 0.0001, t0());
        assert!(engine.on_signal(&signal_on("1h", SignalKind::Entry, Direction::Buy, 1.104), t0()).is_empty());
        assert!(engine.on_signal(&signal_on("15m", SignalKind::Entry, Direction::Buy, 1.104), t0()).is_empty());
        assert!(engine.on_signal(&signal_on("4h", SignalKind::Entry, Direction::Buy, 1.104), t0()).is_empty());
        assert_eq!(engine.contexts().count(), 1);

        // a higher-timeframe trend still confirms the move
        let fired = engine.on_signal(&signal_on("1h", SignalKind::Trend, Direction::Buy, 1.105), t0());
        assert_eq!(fired.len(), 1);
        assert_eq!(fired[0].logic, LogicVariant::Logic1);
    }

    #[test]
    fn exit_continuation_counts_trend_confirmations() {
        let mut config = ReEntryConfig::default();
        config.exit_continuation_confirmations = 2;
        let mut engine = ReEntryEngine::new(config);
        engine.on_group_closed(&exited(EntryOrigin::Fresh), 0.0001, t0());
        assert!(engine.on_signal(&signal(SignalKind::Entry, Direction::Buy, 1.1), t0()).is_empty());
        assert!(engine.on_signal(&signal(SignalKind::Trend, Direction::Buy, 1.1), t0()).is_empty());
        let fired = engine.on_signal(&signal(SignalKind::Trend, Direction::Buy, 1.101), t0());
        assert_eq!(fired.len(), 1);
        assert_eq!(fired[0].trigger, ReEntryTrigger::ExitContinuation);
    }

    #[test]
    fn chain_children_and_disabled_triggers_do_not_arm() {
        let mut config = ReEntryConfig::default();
        config.sl_hunt.enabled = false;
        let mut engine = ReEntryEngine::new(config);
        assert!(engine.on_group_closed(&stopped_out(EntryOrigin::Fresh), 0.0001, t0()).is_none());

        let child = target_hit(
            EntryOrigin::ChainLevel { chain_id: "PROFIT-x".into(), level: 2 },
        );
        assert!(engine.on_group_closed(&child, 0.0001, t0()).is_none());
    }

    #[test]
    fn restore_skips_expired_contexts() {
        let mut engine = ReEntryEngine::new(ReEntryConfig::default());
        engine.on_group_closed(&stopped_out(EntryOrigin::Fresh), 0.0001, t0());
        let saved: Vec<ReEntryContext> = engine.contexts().cloned().collect();

        let mut restored = ReEntryEngine::new(ReEntryConfig::default());
        restored.restore(saved.clone(), t0() + Duration::minutes(10));
        assert_eq!(restored.contexts().count(), 1);
        let mut late = ReEntryEngine::new(ReEntryConfig::default());
        late.restore(saved, t0() + Duration::hours(2));
        assert_eq!(late.contexts().count(), 0);
    }
}
