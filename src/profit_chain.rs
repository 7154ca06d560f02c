//! Profit booking chain: pyramided compounding of realized profit, up to
//! five strictly sequential levels per chain.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::config::ProfitBookingConfig;
use crate::events::LifecycleEvent;
use crate::router::LogicVariant;
use crate::types::{ChainId, Direction, GroupId, GroupStatus, PositionGroup, Timeframe};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChainStatus {
    Active,
    Broken,
    Completed,
    Stopped,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ProfitChainState {
    pub chain_id: ChainId,
    pub symbol: String,
    pub direction: Direction,
    pub logic: LogicVariant,
    pub timeframe: Timeframe,
    pub strategy: String,
    pub current_level: u8,
    pub max_level: u8,
    pub cumulative_profit: f64,
    /// Profit realized so far by the current level's legs.
    pub level_profit: f64,
    pub status: ChainStatus,
    /// Group of the current level; `None` while the next level is requested.
    pub current_group: Option<GroupId>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Next-level entry, to be routed through the risk gate.
#[derive(Clone, Debug, PartialEq)]
pub struct ChainEntryRequest {
    pub chain_id: ChainId,
    pub symbol: String,
    pub direction: Direction,
    pub logic: LogicVariant,
    pub timeframe: Timeframe,
    pub strategy: String,
    pub level: u8,
    pub parent_group: GroupId,
    /// Risk allowed for the new level, derived from the prior level's profit.
    pub risk_budget: f64,
    /// Multiplier applied to the base stop distance (SL tightening per level).
    pub stop_scale: f64,
    pub expires_at: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq)]
pub enum ChainOutcome {
    Advance(ChainEntryRequest),
    Ended {
        chain_id: ChainId,
        symbol: String,
        status: ChainStatus,
        level: u8,
        total_profit: f64,
        reason: String,
    },
}

pub struct ProfitBookingChain {
    config: ProfitBookingConfig,
    chains: BTreeMap<ChainId, ProfitChainState>,
}

impl ProfitBookingChain {
    pub fn new(config: ProfitBookingConfig) -> Self {
        ProfitBookingChain { config, chains: BTreeMap::new() }
    }

    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    pub fn get(&self, id: &ChainId) -> Option<&ProfitChainState> {
        self.chains.get(id)
    }

    pub fn chains(&self) -> impl Iterator<Item = &ProfitChainState> {
        self.chains.values()
    }

    pub fn multiplier(&self, level: u8) -> f64 {
        self.config.multipliers.get(level.saturating_sub(1) as usize).copied().unwrap_or(1.0)
    }

    pub fn sl_reduction(&self, level: u8) -> f64 {
        self.config.sl_reductions.get(level.saturating_sub(1) as usize).copied().unwrap_or(0.0)
    }

    /// Booking target of `level`, if one is configured.
    pub fn profit_target(&self, level: u8) -> Option<f64> {
        self.config
            .profit_targets
            .get(level.saturating_sub(1) as usize)
            .copied()
            .filter(|t| *t > 0.0)
    }

    /// Current levels whose combined P/L reached their target. `combined_pnl`
    /// yields `None` for groups that must not be booked now.
    pub fn targets_reached(&self, combined_pnl: impl Fn(&GroupId) -> Option<f64>) -> Vec<(ChainId, GroupId, f64)> {
        self.chains
            .values()
            .filter_map(|c| {
                let group = c.current_group.as_ref()?;
                let target = self.profit_target(c.current_level)?;
                let pnl = combined_pnl(group)?;
                (pnl >= target).then(|| {
                    log::info!(
                        "[{}] Chain {} L{} target {:.2} reached ({:+.2})",
                        c.symbol, c.chain_id, c.current_level, target, pnl
                    );
                    (c.chain_id.clone(), group.clone(), pnl)
                })
            })
            .collect()
    }

    fn end(&mut self, chain_id: &ChainId, status: ChainStatus, reason: String, now: DateTime<Utc>) -> Option<ChainOutcome> {
        let mut chain = self.chains.remove(chain_id)?;
        chain.status = status;
        chain.updated_at = now;
        log::info!(
            "[{}] Chain {} {:?} at L{}: {} (total {:+.2})",
            chain.symbol, chain.chain_id, status, chain.current_level, reason, chain.cumulative_profit
        );
        Some(ChainOutcome::Ended {
            chain_id: chain.chain_id,
            symbol: chain.symbol,
            status,
            level: chain.current_level,
            total_profit: chain.cumulative_profit,
            reason,
        })
    }

    fn on_group_opened(&mut self, group: &PositionGroup, now: DateTime<Utc>) {
        let Some(chain_id) = &group.chain_id else { return };
        match self.chains.get_mut(chain_id) {
            Some(chain) => {
                chain.current_level = group.level;
                chain.current_group = Some(group.id.clone());
                chain.level_profit = 0.0;
                chain.updated_at = now;
                log::info!("[{}] Chain {} now at L{}", chain.symbol, chain_id, group.level);
            }
            None if group.level == 1 && self.config.enabled => {
                self.chains.insert(
                    chain_id.clone(),
                    ProfitChainState {
                        chain_id: chain_id.clone(),
                        symbol: group.symbol.clone(),
                        direction: group.direction,
                        logic: group.logic,
                        timeframe: group.timeframe.clone(),
                        strategy: group.strategy.clone(),
                        current_level: 1,
                        max_level: self.config.max_level,
                        cumulative_profit: 0.0,
                        level_profit: 0.0,
                        status: ChainStatus::Active,
                        current_group: Some(group.id.clone()),
                        created_at: now,
                        updated_at: now,
                    },
                );
                log::info!("[{}] Chain {} created from group {}", group.symbol, chain_id, group.id);
            }
            None => {}
        }
    }

    /// Reacts to one lifecycle transition.
    ///
    /// A losing leg anywhere in the chain breaks it at once, even while the
    /// sibling leg is still open. Level N+1 is requested only when the level N
    /// group has closed in profit, so at most one level is ever in flight.
    pub fn on_event(&mut self, event: &LifecycleEvent, now: DateTime<Utc>) -> Option<ChainOutcome> {
        match event {
            LifecycleEvent::GroupOpened(group) => {
                self.on_group_opened(group, now);
                None
            }
            LifecycleEvent::LegClosed(lc) => {
                let chain_id = lc.chain_id.as_ref()?;
                let pnl = lc.pnl();
                if pnl <= 0.0 {
                    let reason = format!("L{} {} leg closed at {:+.2}", lc.level, lc.leg.kind, pnl);
                    return self.end(chain_id, ChainStatus::Broken, reason, now);
                }
                if !lc.reason().is_price_driven() {
                    let reason = format!("L{} closed by {}", lc.level, lc.reason());
                    return self.end(chain_id, ChainStatus::Stopped, reason, now);
                }
                let chain = self.chains.get_mut(chain_id)?;
                if chain.current_group.as_ref() == Some(&lc.group_id) {
                    chain.level_profit += pnl;
                }
                chain.cumulative_profit += pnl;
                chain.updated_at = now;
                None
            }
            LifecycleEvent::GroupClosed(group) => {
                let chain_id = group.chain_id.as_ref()?;
                let chain = self.chains.get(chain_id)?;
                if chain.current_group.as_ref() != Some(&group.id) {
                    return None;
                }
                if group.status != GroupStatus::ClosedProfit {
                    let reason = format!("L{} group closed {:?}", group.level, group.status);
                    return self.end(chain_id, ChainStatus::Broken, reason, now);
                }
                if chain.current_level >= chain.max_level {
                    let reason = format!("max level {} closed in profit", chain.max_level);
                    return self.end(chain_id, ChainStatus::Completed, reason, now);
                }

                let next = chain.current_level + 1;
                let risk_budget = chain.level_profit * self.config.reinvest_fraction * self.multiplier(next);
                let stop_scale = 1.0 - self.sl_reduction(next) / 100.0;
                let request = ChainEntryRequest {
                    chain_id: chain_id.clone(),
                    symbol: chain.symbol.clone(),
                    direction: chain.direction,
                    logic: chain.logic,
                    timeframe: chain.timeframe.clone(),
                    strategy: chain.strategy.clone(),
                    level: next,
                    parent_group: group.id.clone(),
                    risk_budget,
                    stop_scale,
                    expires_at: now + Duration::seconds(self.config.request_ttl_secs),
                };
                if let Some(chain) = self.chains.get_mut(chain_id) {
                    chain.current_group = None;
                    chain.updated_at = now;
                }
                log::info!(
                    "[{}] Chain {} L{} booked {:+.2}, requesting L{} (budget {:.2}, SL x{:.2})",
                    group.symbol, chain_id, next - 1, group.realized_pnl(), next, risk_budget, stop_scale
                );
                Some(ChainOutcome::Advance(request))
            }
        }
    }

    /// The next-level request was refused, expired, or failed at the broker.
    pub fn on_request_failed(&mut self, chain_id: &ChainId, reason: &str, now: DateTime<Utc>) -> Option<ChainOutcome> {
        self.end(chain_id, ChainStatus::Stopped, format!("next level not opened: {reason}"), now)
    }

    pub fn stop_chain(&mut self, chain_id: &ChainId, reason: &str, now: DateTime<Utc>) -> Option<ChainOutcome> {
        self.end(chain_id, ChainStatus::Stopped, reason.to_string(), now)
    }

    /// Chains whose current level is not a live group (lost across a restart).
    pub fn stalled(&self, is_live: impl Fn(&GroupId) -> bool) -> Vec<ChainId> {
        self.chains
            .values()
            .filter(|c| c.current_group.as_ref().map_or(true, |g| !is_live(g)))
            .map(|c| c.chain_id.clone())
            .collect()
    }

    pub fn restore(&mut self, chains: Vec<ProfitChainState>) {
        for chain in chains.into_iter().filter(|c| c.status == ChainStatus::Active) {
            self.chains.insert(chain.chain_id.clone(), chain);
        }
    }
}
