use chrono::{DateTime, Utc};
use std::collections::BTreeMap;

use crate::config::SymbolSpec;
use crate::events::{LegClosed, LifecycleEvent};
use crate::risk_manager::ApprovedEntry;
use crate::router::LogicVariant;
use crate::types::{
    ChainId, CloseReason, Direction, EntryOrigin, GroupId, GroupStatus, LegId, LegKind,
    LegStatus, PositionGroup, PositionLeg, Timeframe, TrailPolicy,
};

/// Everything about a new group that is not risk sizing.
#[derive(Clone, Debug)]
pub struct GroupBlueprint {
    pub direction: Direction,
    pub logic: LogicVariant,
    pub timeframe: Timeframe,
    pub strategy: String,
    pub entry_price: f64,
    pub level: u8,
    pub chain_id: Option<ChainId>,
    pub parent_group: Option<GroupId>,
    pub origin: EntryOrigin,
    /// Trailing distance in price units.
    pub trail_distance: f64,
    /// Profit (price units) before the TP-Trail leg starts trailing.
    pub tp_trail_activation: f64,
}

/// What the engine has to do after a price update.
#[derive(Clone, Debug, PartialEq)]
pub enum LegAction {
    MoveStop {
        group_id: GroupId,
        leg_id: LegId,
        stop: f64,
    },
    Close {
        group_id: GroupId,
        leg_id: LegId,
        reason: CloseReason,
        exit_price: f64,
    },
}

/// Realized P/L of closing `leg` at `exit_price`.
pub fn leg_pnl(leg: &PositionLeg, exit_price: f64, spec: &SymbolSpec) -> f64 {
    let pips = leg.excursion(exit_price) / spec.pip_size;
    pips * spec.pip_value_per_lot * leg.volume
}

fn new_leg(kind: LegKind, symbol: &str, bp: &GroupBlueprint, approved: &ApprovedEntry) -> PositionLeg {
    let (take_profit, activation) = match kind {
        LegKind::TpTrail => (Some(approved.take_profit), bp.tp_trail_activation),
        LegKind::ProfitTrail => (None, 0.0),
    };
    PositionLeg {
        id: LegId::generate(),
        kind,
        symbol: symbol.to_string(),
        direction: bp.direction,
        entry_price: bp.entry_price,
        volume: approved.volume_per_leg,
        stop_loss: approved.stop_loss,
        take_profit,
        trail: TrailPolicy {
            distance: bp.trail_distance,
            activation,
            active: false,
            best_price: bp.entry_price,
        },
        status: LegStatus::Pending,
        reserved_risk: approved.risk_amount / 2.0,
        order_id: None,
        exit_price: None,
        realized_pnl: None,
        close_reason: None,
        closed_at: None,
    }
}

/// Opens and tracks the two-leg groups of one symbol.
#[derive(Debug, Default)]
pub struct DualOrderManager {
    symbol: String,
    groups: BTreeMap<GroupId, PositionGroup>,
}

impl DualOrderManager {
    pub fn new(symbol: &str) -> Self {
        DualOrderManager { symbol: symbol.to_string(), groups: BTreeMap::new() }
    }

    pub fn get(&self, id: &GroupId) -> Option<&PositionGroup> {
        self.groups.get(id)
    }

    pub fn active_groups(&self) -> impl Iterator<Item = &PositionGroup> {
        self.groups.values().filter(|g| g.is_active())
    }

    /// The group holding the symbol's slot for `logic`, if any.
    pub fn active_for(&self, logic: LogicVariant) -> Option<&PositionGroup> {
        self.active_groups().find(|g| g.logic == logic)
    }

    pub fn group_of_leg(&self, leg_id: &LegId) -> Option<&PositionGroup> {
        self.groups.values().find(|g| g.leg(leg_id).is_some())
    }

    /// Creates the group with both legs pending. Broker placement follows.
    pub fn open(&mut self, bp: GroupBlueprint, approved: &ApprovedEntry, now: DateTime<Utc>) -> PositionGroup {
        let group = PositionGroup {
            id: GroupId::generate(),
            symbol: self.symbol.clone(),
            direction: bp.direction,
            logic: bp.logic,
            timeframe: bp.timeframe.clone(),
            strategy: bp.strategy.clone(),
            entry_price: bp.entry_price,
            tp_trail: new_leg(LegKind::TpTrail, &self.symbol, &bp, approved),
            profit_trail: new_leg(LegKind::ProfitTrail, &self.symbol, &bp, approved),
            level: bp.level,
            chain_id: bp.chain_id.clone(),
            parent_group: bp.parent_group.clone(),
            origin: bp.origin.clone(),
            risk: approved.snapshot.clone(),
            status: GroupStatus::Pending,
            opened_at: now,
            closed_at: None,
        };
        log::info!(
            "[{}] Group {} pending: {} {} L{} vol={:.4}x2 sl={:.5} tp={:.5}",
            self.symbol, group.id, group.logic, group.direction, group.level,
            approved.volume_per_leg, approved.stop_loss, approved.take_profit
        );
        self.groups.insert(group.id.clone(), group.clone());
        group
    }

    /// Broker confirmed a leg. Emits `GroupOpened` once both legs are open.
    pub fn confirm_fill(&mut self, group_id: &GroupId, leg_id: &LegId, order_id: &str, fill_price: f64) -> Vec<LifecycleEvent> {
        let Some(group) = self.groups.get_mut(group_id) else {
            log::warn!("[{}] Fill for unknown group {}", self.symbol, group_id);
            return Vec::new();
        };
        let Some(leg) = group.leg_mut(leg_id) else {
            return Vec::new();
        };
        if leg.status != LegStatus::Pending && leg.status != LegStatus::Unknown {
            return Vec::new();
        }
        // stop/target keep their distance from the real fill
        let shift = fill_price - leg.entry_price;
        leg.entry_price = fill_price;
        leg.stop_loss += shift;
        leg.take_profit = leg.take_profit.map(|tp| tp + shift);
        leg.trail.best_price = fill_price;
        leg.order_id = Some(order_id.to_string());
        leg.status = LegStatus::Open;

        let both_open = group.tp_trail.is_open() && group.profit_trail.is_open();
        if both_open {
            group.status = GroupStatus::OpenBoth;
            log::info!("[{}] Group {} open ({} {})", self.symbol, group.id, group.logic, group.direction);
            return vec![LifecycleEvent::GroupOpened(group.clone())];
        }
        Vec::new()
    }

    /// Broker outcome unknown after retries: the group needs reconciliation.
    pub fn mark_unknown(&mut self, group_id: &GroupId, leg_id: &LegId) {
        if let Some(group) = self.groups.get_mut(group_id) {
            if let Some(leg) = group.leg_mut(leg_id) {
                if !leg.status.is_terminal() {
                    leg.status = LegStatus::Unknown;
                }
            }
            group.status = GroupStatus::Unknown;
            log::error!("[{}] Group {} degraded: leg {} state unknown", self.symbol, group_id, leg_id);
        }
    }

    /// Drops a group whose legs never reached the broker.
    pub fn discard(&mut self, group_id: &GroupId) -> Option<PositionGroup> {
        self.groups.remove(group_id)
    }

    /// Records a leg close. A leg closes at most once; repeated reports for a
    /// terminal or never-filled leg yield no events.
    pub fn on_leg_closed(
        &mut self,
        leg_id: &LegId,
        reason: CloseReason,
        exit_price: f64,
        pnl: f64,
        now: DateTime<Utc>,
    ) -> Vec<LifecycleEvent> {
        let Some(group) = self.groups.values_mut().find(|g| g.leg(leg_id).is_some()) else {
            log::warn!("[{}] Close report for unknown leg {}", self.symbol, leg_id);
            return Vec::new();
        };
        let Some(leg) = group.leg_mut(leg_id) else {
            return Vec::new();
        };
        if !matches!(leg.status, LegStatus::Open | LegStatus::Unknown) {
            log::debug!("[{}] Ignoring close of leg {} in status {:?}", leg.symbol, leg_id, leg.status);
            return Vec::new();
        }

        leg.status = if matches!(reason, CloseReason::Manual | CloseReason::Signal) {
            LegStatus::ClosedManual
        } else if pnl > 0.0 {
            LegStatus::ClosedProfit
        } else {
            LegStatus::ClosedLoss
        };
        leg.exit_price = Some(exit_price);
        leg.realized_pnl = Some(pnl);
        leg.close_reason = Some(reason);
        leg.closed_at = Some(now);
        let leg = leg.clone();

        log::info!(
            "[{}] {} leg of {} closed @ {:.5} | {} | PnL {:+.2}",
            group.symbol, leg.kind, group.id, exit_price, reason, pnl
        );

        let sibling = if leg.kind == LegKind::TpTrail { &group.profit_trail } else { &group.tp_trail };
        let sibling_open = sibling.is_open();
        let sibling_status = sibling.status;

        let mut events = vec![LifecycleEvent::LegClosed(LegClosed {
            group_id: group.id.clone(),
            chain_id: group.chain_id.clone(),
            level: group.level,
            leg,
            sibling_open,
        })];

        if sibling_status.is_terminal() {
            let manual = group.legs().iter().any(|l| l.status == LegStatus::ClosedManual);
            group.status = if manual {
                GroupStatus::ClosedManual
            } else if group.realized_pnl() > 0.0 {
                GroupStatus::ClosedProfit
            } else {
                GroupStatus::ClosedLoss
            };
            group.closed_at = Some(now);
            log::info!(
                "[{}] Group {} closed {:?} | PnL {:+.2}",
                group.symbol, group.id, group.status, group.realized_pnl()
            );
            events.push(LifecycleEvent::GroupClosed(group.clone()));
        } else if sibling_status == LegStatus::Unknown {
            group.status = GroupStatus::Unknown;
        } else {
            group.status = GroupStatus::PartiallyClosed;
        }
        events
    }

    /// Updates trailing stops and detects stop/target hits at `price`.
    ///
    /// Hits are checked against the stop in force before this tick; the
    /// trail then follows the new price and never loosens.
    pub fn evaluate_price(&mut self, price: f64) -> Vec<LegAction> {
        let mut actions = Vec::new();
        for group in self.groups.values_mut().filter(|g| g.is_active()) {
            let group_id = group.id.clone();
            for leg in [&mut group.tp_trail, &mut group.profit_trail] {
                if !leg.is_open() {
                    continue;
                }
                let sign = leg.direction.sign();

                if (price - leg.stop_loss) * sign <= 0.0 {
                    let reason = if leg.trail.active { CloseReason::TrailingStop } else { CloseReason::StopLoss };
                    actions.push(LegAction::Close { group_id: group_id.clone(), leg_id: leg.id.clone(), reason, exit_price: price });
                    continue;
                }
                if let Some(tp) = leg.take_profit {
                    if (price - tp) * sign >= 0.0 {
                        actions.push(LegAction::Close {
                            group_id: group_id.clone(),
                            leg_id: leg.id.clone(),
                            reason: CloseReason::TakeProfit,
                            exit_price: price,
                        });
                        continue;
                    }
                }

                if (price - leg.trail.best_price) * sign > 0.0 {
                    leg.trail.best_price = price;
                }
                if !leg.trail.active && leg.excursion(leg.trail.best_price) >= leg.trail.activation {
                    leg.trail.active = true;
                }
                if leg.trail.active {
                    let candidate = leg.trail.best_price - sign * leg.trail.distance;
                    if (candidate - leg.stop_loss) * sign > 0.0 {
                        leg.stop_loss = candidate;
                        actions.push(LegAction::MoveStop { group_id: group_id.clone(), leg_id: leg.id.clone(), stop: candidate });
                    }
                }
            }
        }
        actions
    }

    /// Legs the engine must close to take a group flat.
    pub fn closable_legs(&self, group_id: &GroupId) -> Vec<PositionLeg> {
        self.groups
            .get(group_id)
            .map(|g| {
                g.legs()
                    .into_iter()
                    .filter(|l| matches!(l.status, LegStatus::Open | LegStatus::Unknown))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn degraded_groups(&self) -> Vec<PositionGroup> {
        self.groups.values().filter(|g| g.status == GroupStatus::Unknown).cloned().collect()
    }

    /// Marks an unknown leg open again after the broker confirmed it.
    pub fn reinstate_leg(&mut self, group_id: &GroupId, leg_id: &LegId) {
        if let Some(group) = self.groups.get_mut(group_id) {
            if let Some(leg) = group.leg_mut(leg_id) {
                if leg.status == LegStatus::Unknown {
                    leg.status = LegStatus::Open;
                }
            }
            let statuses = [group.tp_trail.status, group.profit_trail.status];
            if statuses.iter().all(|s| *s == LegStatus::Open) {
                group.status = GroupStatus::OpenBoth;
            } else if statuses.iter().any(|s| *s == LegStatus::Unknown || *s == LegStatus::Pending) {
                group.status = GroupStatus::Unknown;
            } else {
                group.status = GroupStatus::PartiallyClosed;
            }
        }
    }

    pub fn insert_restored(&mut self, group: PositionGroup) {
        self.groups.insert(group.id.clone(), group);
    }

    /// Drops chain references that no live chain answers to.
    pub fn clear_orphan_chains(&mut self, is_live: impl Fn(&ChainId) -> bool) -> usize {
        let mut cleared = 0;
        for group in self.groups.values_mut() {
            if group.chain_id.as_ref().is_some_and(|id| !is_live(id)) {
                log::info!("[{}] Group {} lost its chain {:?}", self.symbol, group.id, group.chain_id);
                group.chain_id = None;
                cleared += 1;
            }
        }
        cleared
    }

    /// Forgets closed groups once their events have been handled.
    pub fn prune_closed(&mut self) -> usize {
        let before = self.groups.len();
        self.groups.retain(|_, g| g.is_active());
        before - self.groups.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::types::RiskSnapshot;
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 2, 10, 0, 0).unwrap()
    }

    fn approved() -> ApprovedEntry {
        ApprovedEntry {
            volume_per_leg: 0.33,
            risk_amount: 99.0,
            stop_loss: 1.0985,
            take_profit: 1.10225,
            snapshot: RiskSnapshot {
                tier: "10000".into(),
                rr_ratio: 1.5,
                equity: 10_000.0,
                risk_amount: 99.0,
                stop_distance: 0.0015,
            },
        }
    }

    fn blueprint() -> GroupBlueprint {
        GroupBlueprint {
            direction: Direction::Buy,
            logic: LogicVariant::Logic1,
            timeframe: Timeframe::parse("5m").unwrap(),
            strategy: "LOGIC1".into(),
            entry_price: 1.1000,
            level: 1,
            chain_id: None,
            parent_group: None,
            origin: EntryOrigin::Fresh,
            trail_distance: 0.0010,
            tp_trail_activation: 0.00075,
        }
    }

    fn opened(mgr: &mut DualOrderManager) -> PositionGroup {
        let g = mgr.open(blueprint(), &approved(), now());
        assert!(mgr.confirm_fill(&g.id, &g.tp_trail.id, "o1", 1.1000).is_empty());
        let events = mgr.confirm_fill(&g.id, &g.profit_trail.id, "o2", 1.1000);
        assert!(matches!(events.as_slice(), [LifecycleEvent::GroupOpened(_)]));
        mgr.get(&g.id).unwrap().clone()
    }

    #[test]
    fn open_creates_two_independent_legs() {
        let mut mgr = DualOrderManager::new("EURUSD");
        let g = mgr.open(blueprint(), &approved(), now());
        assert_eq!(g.status, GroupStatus::Pending);
        assert_eq!(g.tp_trail.take_profit, Some(1.10225));
        assert_eq!(g.profit_trail.take_profit, None);
        assert_eq!(g.tp_trail.stop_loss, g.profit_trail.stop_loss);
        assert_eq!(g.tp_trail.entry_price, 1.1000);
        assert!(mgr.active_for(LogicVariant::Logic1).is_some());
        assert!(mgr.active_for(LogicVariant::Logic2).is_none());
    }

    #[test]
    fn group_closes_only_after_both_legs() {
        let mut mgr = DualOrderManager::new("EURUSD");
        let g = opened(&mut mgr);

        let events = mgr.on_leg_closed(&g.tp_trail.id, CloseReason::TakeProfit, 1.10225, 74.25, now());
        assert_eq!(events.len(), 1);
        match &events[0] {
            LifecycleEvent::LegClosed(lc) => assert!(lc.sibling_open),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(mgr.get(&g.id).unwrap().status, GroupStatus::PartiallyClosed);
        assert!(mgr.get(&g.id).unwrap().profit_trail.is_open());

        let events = mgr.on_leg_closed(&g.profit_trail.id, CloseReason::TrailingStop, 1.1010, 33.0, now());
        assert_eq!(events.len(), 2);
        match &events[1] {
            LifecycleEvent::GroupClosed(closed) => {
                assert_eq!(closed.status, GroupStatus::ClosedProfit);
                assert!((closed.realized_pnl() - 107.25).abs() < 1e-9);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(mgr.active_for(LogicVariant::Logic1).is_none());
    }

    #[test]
    fn duplicate_close_report_is_ignored() {
        let mut mgr = DualOrderManager::new("EURUSD");
        let g = opened(&mut mgr);
        assert!(!mgr.on_leg_closed(&g.tp_trail.id, CloseReason::StopLoss, 1.0985, -49.5, now()).is_empty());
        assert!(mgr.on_leg_closed(&g.tp_trail.id, CloseReason::StopLoss, 1.0985, -49.5, now()).is_empty());
    }

    #[test]
    fn manual_close_dominates_group_status() {
        let mut mgr = DualOrderManager::new("EURUSD");
        let g = opened(&mut mgr);
        mgr.on_leg_closed(&g.tp_trail.id, CloseReason::Signal, 1.1020, 66.0, now());
        let events = mgr.on_leg_closed(&g.profit_trail.id, CloseReason::Signal, 1.1020, 66.0, now());
        match events.last() {
            Some(LifecycleEvent::GroupClosed(closed)) => assert_eq!(closed.status, GroupStatus::ClosedManual),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn stop_hit_closes_both_legs() {
        let mut mgr = DualOrderManager::new("EURUSD");
        opened(&mut mgr);
        let actions = mgr.evaluate_price(1.0980);
        assert_eq!(actions.len(), 2);
        assert!(actions.iter().all(|a| matches!(a, LegAction::Close { reason: CloseReason::StopLoss, .. })));
    }

    #[test]
    fn trailing_rules_per_leg_kind() {
        let mut mgr = DualOrderManager::new("EURUSD");
        let g = opened(&mut mgr);

        // +5 pips: profit trail follows (stop 1.0995), tp trail not yet active
        let actions = mgr.evaluate_price(1.1005);
        assert_eq!(actions.len(), 1);
        match &actions[0] {
            LegAction::MoveStop { leg_id, stop, .. } => {
                assert_eq!(leg_id, &g.profit_trail.id);
                assert!((stop - 1.0995).abs() < 1e-9);
            }
            other => panic!("unexpected {other:?}"),
        }

        // +8 pips: both trail
        let actions = mgr.evaluate_price(1.1008);
        assert_eq!(actions.len(), 2);

        // pullback never loosens the stop
        assert!(mgr.evaluate_price(1.1001).is_empty());

        // TP hit on the TP-Trail leg; profit trail stop 1.0998 is not hit
        let actions = mgr.evaluate_price(1.10230);
        assert!(actions.contains(&LegAction::Close {
            group_id: g.id.clone(),
            leg_id: g.tp_trail.id.clone(),
            reason: CloseReason::TakeProfit,
            exit_price: 1.10230,
        }));
    }

    #[test]
    fn trailed_stop_reports_trailing_reason() {
        let mut mgr = DualOrderManager::new("EURUSD");
        let g = opened(&mut mgr);
        mgr.evaluate_price(1.1015);
        let actions = mgr.evaluate_price(1.1004);
        assert!(actions.contains(&LegAction::Close {
            group_id: g.id.clone(),
            leg_id: g.profit_trail.id.clone(),
            reason: CloseReason::TrailingStop,
            exit_price: 1.1004,
        }));
    }

    #[test]
    fn fill_shift_moves_stop_and_target() {
        let mut mgr = DualOrderManager::new("EURUSD");
        let g = mgr.open(blueprint(), &approved(), now());
        mgr.confirm_fill(&g.id, &g.tp_trail.id, "o1", 1.1002);
        let leg = mgr.get(&g.id).unwrap().tp_trail.clone();
        assert!((leg.stop_loss - 1.0987).abs() < 1e-9);
        assert!((leg.take_profit.unwrap() - 1.10245).abs() < 1e-9);
    }

    #[test]
    fn unknown_leg_degrades_group_until_reinstated() {
        let mut mgr = DualOrderManager::new("EURUSD");
        let g = mgr.open(blueprint(), &approved(), now());
        mgr.confirm_fill(&g.id, &g.tp_trail.id, "o1", 1.1000);
        mgr.mark_unknown(&g.id, &g.profit_trail.id);
        assert_eq!(mgr.degraded_groups().len(), 1);
        mgr.reinstate_leg(&g.id, &g.profit_trail.id);
        assert_eq!(mgr.get(&g.id).unwrap().status, GroupStatus::OpenBoth);
    }

    #[test]
    fn pnl_in_account_currency() {
        let mut mgr = DualOrderManager::new("EURUSD");
        let g = opened(&mut mgr);
        let spec = EngineConfig::default().symbol_spec("EURUSD");
        let pnl = leg_pnl(&g.tp_trail, 1.0985, &spec);
        assert!((pnl + 49.5).abs() < 1e-6);
    }
}
