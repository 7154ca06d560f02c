use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::config::{RiskConfig, RiskTier, SymbolSpec};
use crate::error::RiskError;
use crate::types::{Direction, RiskSnapshot};

/// Account-wide risk figures. Mutated only through [`RiskGate`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RiskState {
    pub trading_day: NaiveDate,
    pub equity: f64,
    pub daily_pnl: f64,
    /// Sum of absolute losses closed today; compared against the daily cap.
    pub daily_loss: f64,
    pub lifetime_pnl: f64,
    pub lifetime_loss: f64,
    /// Risk reserved by approved groups whose legs are not closed yet.
    pub open_risk: f64,
    pub trades_today: u32,
    pub wins_today: u32,
    pub total_trades: u32,
    pub winning_trades: u32,
    pub risk_tier: Option<String>,
    pub rr_ratio: f64,
}

/// What an upstream component wants opened.
#[derive(Clone, Debug)]
pub struct EntryProposal<'a> {
    pub symbol: &'a str,
    pub direction: Direction,
    pub entry_price: f64,
    /// Stop distance in price units.
    pub stop_distance: f64,
    pub spec: &'a SymbolSpec,
    /// Upper bound on the risk amount (chain children size from realized profit).
    pub risk_budget: Option<f64>,
}

/// A sized entry. `risk_amount` is already reserved in `open_risk`.
#[derive(Clone, Debug, PartialEq)]
pub struct ApprovedEntry {
    pub volume_per_leg: f64,
    pub risk_amount: f64,
    pub stop_loss: f64,
    pub take_profit: f64,
    pub snapshot: RiskSnapshot,
}

/// Daily/lifetime cap usage for status reporting.
#[derive(Clone, Debug, PartialEq)]
pub struct CapUsage {
    pub tier: String,
    pub daily_loss: f64,
    pub daily_limit: f64,
    pub lifetime_loss: f64,
    pub lifetime_limit: f64,
}

fn round_down(value: f64, step: f64) -> f64 {
    // epsilon absorbs float noise such as 0.33 / 0.01 = 32.999999
    ((value / step) + 1e-9).floor() * step
}

/// The single chokepoint every new group goes through.
pub struct RiskGate {
    config: RiskConfig,
    state: RiskState,
}

impl RiskGate {
    pub fn new(config: RiskConfig, today: NaiveDate) -> Self {
        let state = RiskState {
            trading_day: today,
            equity: config.fallback_equity,
            daily_pnl: 0.0,
            daily_loss: 0.0,
            lifetime_pnl: 0.0,
            lifetime_loss: 0.0,
            open_risk: 0.0,
            trades_today: 0,
            wins_today: 0,
            total_trades: 0,
            winning_trades: 0,
            risk_tier: config.risk_tier.clone(),
            rr_ratio: config.rr_ratio,
        };
        RiskGate { config, state }
    }

    pub fn state(&self) -> &RiskState {
        &self.state
    }

    /// Restores persisted figures; daily figures reset if `today` is a new day.
    pub fn restore(&mut self, mut state: RiskState, today: NaiveDate) {
        // open risk is rebuilt from the restored groups
        state.open_risk = 0.0;
        self.state = state;
        if self.state.trading_day != today {
            log::info!(
                "Stored trading day {} is stale, resetting daily figures",
                self.state.trading_day
            );
            self.new_day(today);
        }
    }

    /// Re-reserves risk of groups restored from storage.
    pub fn reserve(&mut self, amount: f64) {
        self.state.open_risk += amount.max(0.0);
    }

    pub fn update_equity(&mut self, equity: f64) {
        if equity.is_finite() && equity > 0.0 {
            self.state.equity = equity;
        }
    }

    pub fn set_risk_tier(&mut self, tier: Option<String>) {
        self.state.risk_tier = tier;
    }

    /// Pinned tier, else the largest balance tier not above equity
    /// (the smallest tier when equity is below all of them).
    pub fn resolve_tier(&self) -> Result<(String, &RiskTier), RiskError> {
        if let Some(pinned) = &self.state.risk_tier {
            return self
                .config
                .tiers
                .get(pinned)
                .map(|t| (pinned.clone(), t))
                .ok_or_else(|| RiskError::RiskTierInvalid(format!("tier `{pinned}` is not configured")));
        }

        let mut tiers: Vec<(f64, &String, &RiskTier)> = self
            .config
            .tiers
            .iter()
            .filter_map(|(k, t)| k.parse::<f64>().ok().map(|b| (b, k, t)))
            .collect();
        tiers.sort_by(|a, b| a.0.total_cmp(&b.0));

        tiers
            .iter()
            .rev()
            .find(|(balance, _, _)| self.state.equity >= *balance)
            .or_else(|| tiers.first())
            .map(|(_, k, t)| ((*k).clone(), *t))
            .ok_or_else(|| RiskError::RiskTierInvalid("no risk tiers configured".into()))
    }

    pub fn cap_usage(&self) -> Result<CapUsage, RiskError> {
        let (tier, params) = self.resolve_tier()?;
        Ok(CapUsage {
            tier,
            daily_loss: self.state.daily_loss,
            daily_limit: params.daily_loss_limit,
            lifetime_loss: self.state.lifetime_loss,
            lifetime_limit: params.max_total_loss,
        })
    }

    /// Fails when a cap has already been reached by realized losses.
    pub fn check_caps(&self) -> Result<(), RiskError> {
        let usage = self.cap_usage()?;
        if usage.lifetime_loss >= usage.lifetime_limit {
            return Err(RiskError::RiskCapExceeded {
                cap: "lifetime",
                losses: usage.lifetime_loss,
                limit: usage.lifetime_limit,
            });
        }
        if usage.daily_loss >= usage.daily_limit {
            return Err(RiskError::RiskCapExceeded {
                cap: "daily",
                losses: usage.daily_loss,
                limit: usage.daily_limit,
            });
        }
        Ok(())
    }

    /// Sizes a two-leg entry and reserves its risk.
    ///
    /// The budget is the smallest of the tier's per-trade risk, the caller's
    /// budget, and what remains under each cap after realized losses and the
    /// risk still open. A stop-out of every open leg therefore cannot push
    /// losses past a cap.
    pub fn approve(&mut self, proposal: &EntryProposal<'_>) -> Result<ApprovedEntry, RiskError> {
        let rr = self.state.rr_ratio;
        if !(rr.is_finite() && rr > 0.0) {
            return Err(RiskError::RiskTierInvalid(format!("rr ratio {rr} must be positive")));
        }
        self.check_caps()?;
        let (tier_key, tier) = self.resolve_tier()?;
        let tier = tier.clone();

        if !(proposal.stop_distance.is_finite() && proposal.stop_distance > 0.0) {
            return Err(RiskError::RiskTierInvalid(format!(
                "stop distance {} must be positive",
                proposal.stop_distance
            )));
        }

        let s = &self.state;
        let tier_risk = s.equity * tier.risk_per_trade_pct;
        let remaining_daily = tier.daily_loss_limit - s.daily_loss - s.open_risk;
        let remaining_lifetime = tier.max_total_loss - s.lifetime_loss - s.open_risk;
        let mut budget = tier_risk.min(remaining_daily).min(remaining_lifetime);
        if let Some(requested) = proposal.risk_budget {
            budget = budget.min(requested);
        }

        let spec = proposal.spec;
        let stop_pips = proposal.stop_distance / spec.pip_size;
        let risk_per_lot = stop_pips * spec.pip_value_per_lot;
        let raw_volume = if budget > 0.0 { budget / 2.0 / risk_per_lot } else { 0.0 };
        let volume = round_down(raw_volume.min(spec.max_volume), spec.volume_step);

        if volume < spec.min_volume || volume <= 0.0 {
            return Err(RiskError::BudgetExhausted {
                volume,
                min: spec.min_volume,
                budget: budget.max(0.0),
            });
        }

        let risk_amount = 2.0 * volume * risk_per_lot;
        let sign = proposal.direction.sign();
        let approved = ApprovedEntry {
            volume_per_leg: volume,
            risk_amount,
            stop_loss: proposal.entry_price - sign * proposal.stop_distance,
            take_profit: proposal.entry_price + sign * proposal.stop_distance * rr,
            snapshot: RiskSnapshot {
                tier: tier_key,
                rr_ratio: rr,
                equity: s.equity,
                risk_amount,
                stop_distance: proposal.stop_distance,
            },
        };
        self.state.open_risk += risk_amount;
        log::info!(
            "[{}] Risk approved {} vol={:.4}x2 risk={:.2} open_risk={:.2} tier={}",
            proposal.symbol,
            proposal.direction,
            volume,
            risk_amount,
            self.state.open_risk,
            approved.snapshot.tier
        );
        Ok(approved)
    }

    /// Returns reserved risk that never turned into an open position.
    pub fn release(&mut self, reserved: f64) {
        self.state.open_risk = (self.state.open_risk - reserved).max(0.0);
    }

    /// Books one closed leg. Callers guarantee one call per leg close.
    pub fn record_close(&mut self, pnl: f64, reserved: f64) {
        self.release(reserved);
        let s = &mut self.state;
        s.daily_pnl += pnl;
        s.lifetime_pnl += pnl;
        s.equity += pnl;
        s.trades_today += 1;
        s.total_trades += 1;
        if pnl > 0.0 {
            s.wins_today += 1;
            s.winning_trades += 1;
        } else {
            s.daily_loss += pnl.abs();
            s.lifetime_loss += pnl.abs();
        }
    }

    /// Trading-day boundary: daily figures start over, lifetime ones carry on.
    pub fn new_day(&mut self, today: NaiveDate) {
        let s = &mut self.state;
        s.trading_day = today;
        s.daily_pnl = 0.0;
        s.daily_loss = 0.0;
        s.trades_today = 0;
        s.wins_today = 0;
    }

    pub fn reset_lifetime_loss(&mut self) {
        self.state.lifetime_loss = 0.0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;

    fn day() -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 3, 2).unwrap()
    }

    fn gate() -> RiskGate {
        RiskGate::new(EngineConfig::default().risk, day())
    }

    fn eurusd() -> SymbolSpec {
        EngineConfig::default().symbol_spec("EURUSD")
    }

    fn proposal(spec: &SymbolSpec) -> EntryProposal<'_> {
        EntryProposal {
            symbol: "EURUSD",
            direction: Direction::Buy,
            entry_price: 1.1000,
            stop_distance: 0.0015,
            spec,
            risk_budget: None,
        }
    }

    #[test]
    fn sizes_both_legs_from_tier_risk() {
        let spec = eurusd();
        let mut g = gate();
        let a = g.approve(&proposal(&spec)).unwrap();
        // 10k equity, 1% → 100 risk; 15 pips × $10 = $150 per lot per leg
        assert!((a.volume_per_leg - 0.33).abs() < 1e-9);
        assert!((a.risk_amount - 99.0).abs() < 1e-6);
        assert!((a.stop_loss - 1.0985).abs() < 1e-9);
        assert!((a.take_profit - 1.10225).abs() < 1e-9);
        assert_eq!(a.snapshot.tier, "10000");
        assert!((g.state().open_risk - 99.0).abs() < 1e-6);
    }

    #[test]
    fn breached_daily_cap_refuses() {
        let spec = eurusd();
        let mut g = gate();
        g.record_close(-200.0, 0.0);
        // equity fell to 9800 → tier 5000, daily cap 100
        match g.approve(&proposal(&spec)) {
            Err(RiskError::RiskCapExceeded { cap, .. }) => assert_eq!(cap, "daily"),
            other => panic!("expected cap breach, got {other:?}"),
        }
        assert_eq!(g.state().open_risk, 0.0);
    }

    #[test]
    fn lifetime_cap_survives_new_day() {
        let spec = eurusd();
        let mut g = gate();
        g.set_risk_tier(Some("10000".into()));
        for _ in 0..6 {
            g.record_close(-180.0, 0.0);
            g.new_day(day());
        }
        assert_eq!(g.state().daily_loss, 0.0);
        assert!(matches!(
            g.approve(&proposal(&spec)),
            Err(RiskError::RiskCapExceeded { cap: "lifetime", .. })
        ));
        g.reset_lifetime_loss();
        assert!(g.approve(&proposal(&spec)).is_ok());
    }

    #[test]
    fn open_risk_consumes_remaining_budget() {
        let spec = eurusd();
        let mut g = gate();
        g.set_risk_tier(Some("10000".into()));
        // cap 200: two full entries fit, the third does not
        assert!(g.approve(&proposal(&spec)).is_ok());
        assert!(g.approve(&proposal(&spec)).is_ok());
        assert!(matches!(
            g.approve(&proposal(&spec)),
            Err(RiskError::BudgetExhausted { .. })
        ));
        g.release(99.0);
        assert!(g.approve(&proposal(&spec)).is_ok());
    }

    #[test]
    fn caller_budget_caps_size() {
        let spec = eurusd();
        let mut g = gate();
        let mut p = proposal(&spec);
        p.risk_budget = Some(30.0);
        let a = g.approve(&p).unwrap();
        assert!((a.volume_per_leg - 0.1).abs() < 1e-9);
        assert!(a.risk_amount <= 30.0 + 1e-9);
    }

    #[test]
    fn invalid_tier_and_rr() {
        let spec = eurusd();
        let mut g = gate();
        g.set_risk_tier(Some("123".into()));
        assert!(matches!(g.approve(&proposal(&spec)), Err(RiskError::RiskTierInvalid(_))));

        let mut config = EngineConfig::default().risk;
        config.rr_ratio = 0.0;
        let mut g = RiskGate::new(config, day());
        assert!(matches!(g.approve(&proposal(&spec)), Err(RiskError::RiskTierInvalid(_))));
    }

    #[test]
    fn tier_follows_equity() {
        let mut g = gate();
        g.update_equity(60_000.0);
        assert_eq!(g.resolve_tier().unwrap().0, "50000");
        g.update_equity(1_000.0);
        assert_eq!(g.resolve_tier().unwrap().0, "5000");
    }

    #[test]
    fn close_bookkeeping() {
        let mut g = gate();
        g.reserve(99.0);
        g.record_close(40.0, 49.5);
        g.record_close(-49.5, 49.5);
        let s = g.state();
        assert_eq!(s.open_risk, 0.0);
        assert_eq!(s.trades_today, 2);
        assert_eq!(s.wins_today, 1);
        assert!((s.daily_pnl + 9.5).abs() < 1e-9);
        assert!((s.daily_loss - 49.5).abs() < 1e-9);
        assert!((s.equity - 9_990.5).abs() < 1e-9);
    }

    #[test]
    fn restore_resets_stale_day() {
        let mut g = gate();
        g.record_close(-50.0, 0.0);
        let stored = g.state().clone();
        let mut fresh = gate();
        fresh.restore(stored.clone(), day());
        assert_eq!(fresh.state().daily_loss, 50.0);
        fresh.restore(stored, day().succ_opt().unwrap());
        assert_eq!(fresh.state().daily_loss, 0.0);
        assert_eq!(fresh.state().lifetime_loss, 50.0);
    }
}
