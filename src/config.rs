use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

use crate::error::ConfigError;

// ─── Bybit ────────────────────────────────────────────────────────────────────
pub const BYBIT_REST_URL: &str = "https://api-demo.bybit.com";
// BYBIT_API_KEY, BYBIT_SECRET, TELEGRAM_TOKEN, TELEGRAM_CHAT_ID
// are read from environment variables at runtime.

/// Env var naming a JSON config file. Defaults below apply when unset.
pub const CONFIG_ENV: &str = "SIGNAL_TRADER_CONFIG";

// ─── Risk ─────────────────────────────────────────────────────────────────────
pub const ACCOUNT_BALANCE: f64 = 10_000.0;
pub const DEFAULT_RR_RATIO: f64 = 1.5;
pub const MAX_CHAIN_LEVEL: u8 = 5;

// ─── Timing ───────────────────────────────────────────────────────────────────
pub const PRICE_POLL_SECS: u64 = 15;
pub const STATUS_INTERVAL_SECS: u64 = 5 * 60;
pub const CHAIN_REQUEST_TTL_SECS: i64 = 120;

// ─── Broker retry ─────────────────────────────────────────────────────────────
pub const BROKER_MAX_RETRIES: u32 = 3;
pub const BROKER_INITIAL_BACKOFF_MS: u64 = 1_000;
pub const BROKER_MAX_BACKOFF_MS: u64 = 60_000;

/// One balance tier: how much to risk per trade and where the loss caps sit.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RiskTier {
    /// Fraction of equity risked per position group (both legs together).
    pub risk_per_trade_pct: f64,
    pub daily_loss_limit: f64,
    pub max_total_loss: f64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RiskConfig {
    /// Pinned tier key. `None` selects the tier from equity.
    pub risk_tier: Option<String>,
    pub rr_ratio: f64,
    /// Equity used when the broker cannot report one.
    pub fallback_equity: f64,
    /// Tier key is the minimum balance (as a number string) the tier applies to.
    pub tiers: BTreeMap<String, RiskTier>,
}

impl Default for RiskConfig {
    fn default() -> Self {
        let tier = |risk_per_trade_pct, daily_loss_limit, max_total_loss| RiskTier {
            risk_per_trade_pct,
            daily_loss_limit,
            max_total_loss,
        };
        let mut tiers = BTreeMap::new();
        tiers.insert("5000".into(), tier(0.010, 100.0, 500.0));
        tiers.insert("10000".into(), tier(0.010, 200.0, 1_000.0));
        tiers.insert("25000".into(), tier(0.008, 400.0, 2_500.0));
        tiers.insert("50000".into(), tier(0.006, 750.0, 5_000.0));
        tiers.insert("100000".into(), tier(0.005, 1_500.0, 10_000.0));
        RiskConfig {
            risk_tier: None,
            rr_ratio: DEFAULT_RR_RATIO,
            fallback_equity: ACCOUNT_BALANCE,
            tiers,
        }
    }
}

/// Contract data for sizing and P/L.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SymbolSpec {
    pub pip_size: f64,
    /// Account currency per pip for 1.0 volume.
    pub pip_value_per_lot: f64,
    /// Base stop distance in pips before variant/level scaling.
    pub sl_pips: f64,
    pub volume_step: f64,
    pub min_volume: f64,
    pub max_volume: f64,
}

pub const fn spec(
    pip_size: f64, pip_value_per_lot: f64, sl_pips: f64,
    volume_step: f64, min_volume: f64, max_volume: f64,
) -> SymbolSpec {
    SymbolSpec { pip_size, pip_value_per_lot, sl_pips, volume_step, min_volume, max_volume }
}

//            Symbol   pip      $/pip   SL pips  step   min    max
fn default_symbol_spec(symbol: &str) -> SymbolSpec {
    match symbol {
        "EURUSD" => spec(0.0001, 10.0, 15.0, 0.01, 0.01, 50.0),
        "GBPUSD" => spec(0.0001, 10.0, 20.0, 0.01, 0.01, 50.0),
        "USDJPY" => spec(0.01,    9.0, 20.0, 0.01, 0.01, 50.0),
        "XAUUSD" => spec(0.1,    10.0, 40.0, 0.01, 0.01, 20.0),
        "BTCUSDT" => spec(1.0,    1.0, 300.0, 0.001, 0.001, 5.0),
        "ETHUSDT" => spec(0.1,    1.0, 150.0, 0.01, 0.01, 100.0),
        _         => spec(0.0001, 10.0, 20.0, 0.01, 0.01, 50.0), // fallback
    }
}

/// Strategy parameters of one logic variant, carried as data.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LogicParams {
    /// Timeframe whose latest bias must not contradict the entry.
    pub bias_timeframe: String,
    /// Timeframe whose latest trend must not contradict the entry.
    pub trend_timeframe: String,
    pub require_alignment: bool,
    /// Scales the symbol's base stop distance.
    pub sl_multiplier: f64,
    /// Trailing distance of both legs, in pips.
    pub trail_pips: f64,
    /// TP-Trail leg starts trailing after this many R of profit.
    pub tp_trail_activation_r: f64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogicConfig {
    pub logic1: LogicParams,
    pub logic2: LogicParams,
    pub logic3: LogicParams,
}

impl Default for LogicConfig {
    fn default() -> Self {
        let params = |bias: &str, trend: &str, sl_multiplier, trail_pips, activation| LogicParams {
            bias_timeframe: bias.into(),
            trend_timeframe: trend.into(),
            require_alignment: true,
            sl_multiplier,
            trail_pips,
            tp_trail_activation_r: activation,
        };
        LogicConfig {
            logic1: params("1h", "15m", 1.0, 10.0, 0.5),
            logic2: params("1h", "1h", 1.5, 15.0, 0.75),
            logic3: params("1d", "1h", 2.5, 25.0, 1.0),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProfitBookingConfig {
    pub enabled: bool,
    pub max_level: u8,
    /// Risk budget multiplier of each level, index 0 = level 1.
    pub multipliers: Vec<f64>,
    /// Stop distance reduction in percent per level, index 0 = level 1.
    pub sl_reductions: Vec<f64>,
    /// Fraction of the prior level's realized profit put at risk by the next level.
    pub reinvest_fraction: f64,
    pub request_ttl_secs: i64,
    /// Combined P/L (account currency) at which a level is booked, index 0 =
    /// level 1. Empty leaves booking to the legs' own stops and targets.
    pub profit_targets: Vec<f64>,
}

impl Default for ProfitBookingConfig {
    fn default() -> Self {
        ProfitBookingConfig {
            enabled: true,
            max_level: MAX_CHAIN_LEVEL,
            multipliers: vec![1.0, 2.0, 4.0, 8.0, 16.0],
            sl_reductions: vec![0.0, 10.0, 25.0, 40.0, 50.0],
            reinvest_fraction: 0.25,
            request_ttl_secs: CHAIN_REQUEST_TTL_SECS,
            profit_targets: Vec::new(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TriggerConfig {
    pub enabled: bool,
    /// Validity window of a context after the group closes.
    pub window_secs: i64,
    /// Re-entries allowed per originating group.
    pub max_attempts: u32,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReEntryConfig {
    pub sl_hunt: TriggerConfig,
    pub tp_continuation: TriggerConfig,
    pub exit_continuation: TriggerConfig,
    /// Extra pips beyond the original entry price required for an SL-hunt reversal.
    pub sl_hunt_offset_pips: f64,
    /// Same-direction trend signals needed to confirm an exit continuation.
    pub exit_continuation_confirmations: u32,
}

impl Default for ReEntryConfig {
    fn default() -> Self {
        let trigger = |window_secs, max_attempts| TriggerConfig { enabled: true, window_secs, max_attempts };
        ReEntryConfig {
            sl_hunt: trigger(30 * 60, 1),
            tp_continuation: trigger(60 * 60, 2),
            exit_continuation: trigger(60 * 60, 1),
            sl_hunt_offset_pips: 1.0,
            exit_continuation_confirmations: 1,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExitStrategyConfig {
    pub reversal: bool,
    pub early_warning: bool,
    pub trend_reversal: bool,
    pub opposite_signal: bool,
    /// Early-warning exits only lock in gains; losing groups ride to their stop.
    pub early_warning_requires_profit: bool,
}

impl Default for ExitStrategyConfig {
    fn default() -> Self {
        ExitStrategyConfig {
            reversal: true,
            early_warning: true,
            trend_reversal: true,
            opposite_signal: true,
            early_warning_requires_profit: true,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    /// Paper-trade instead of sending orders.
    pub simulate_orders: bool,
    pub max_retries: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        BrokerConfig {
            simulate_orders: false,
            max_retries: BROKER_MAX_RETRIES,
            initial_backoff_ms: BROKER_INITIAL_BACKOFF_MS,
            max_backoff_ms: BROKER_MAX_BACKOFF_MS,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub risk: RiskConfig,
    /// Overrides of the built-in symbol table.
    pub symbols: HashMap<String, SymbolSpec>,
    pub logic: LogicConfig,
    pub profit_booking: ProfitBookingConfig,
    pub reentry: ReEntryConfig,
    pub exit_strategy: ExitStrategyConfig,
    pub broker: BrokerConfig,
    pub state_path: PathBuf,
    pub price_poll_secs: u64,
    pub status_interval_secs: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            risk: RiskConfig::default(),
            symbols: HashMap::new(),
            logic: LogicConfig::default(),
            profit_booking: ProfitBookingConfig::default(),
            reentry: ReEntryConfig::default(),
            exit_strategy: ExitStrategyConfig::default(),
            broker: BrokerConfig::default(),
            state_path: PathBuf::from("data/engine_state.json"),
            price_poll_secs: PRICE_POLL_SECS,
            status_interval_secs: STATUS_INTERVAL_SECS,
        }
    }
}

impl EngineConfig {
    /// Loads the file named by `SIGNAL_TRADER_CONFIG`, or defaults when unset.
    pub fn load() -> Result<Self, ConfigError> {
        match std::env::var(CONFIG_ENV) {
            Ok(path) => Self::from_file(Path::new(&path)),
            Err(_) => {
                log::info!("{} not set, using built-in defaults", CONFIG_ENV);
                let config = EngineConfig::default();
                config.validate()?;
                Ok(config)
            }
        }
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        let config: EngineConfig = serde_json::from_str(&raw)?;
        config.validate()?;
        log::info!("Loaded config from {}", path.display());
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: String| Err(ConfigError::Invalid(msg));

        if !(self.risk.rr_ratio > 0.0) {
            return invalid(format!("rr_ratio must be positive, got {}", self.risk.rr_ratio));
        }
        if self.risk.tiers.is_empty() {
            return invalid("at least one risk tier is required".into());
        }
        for (key, tier) in &self.risk.tiers {
            if key.parse::<f64>().is_err() {
                return invalid(format!("risk tier key `{key}` is not a balance"));
            }
            if !(tier.risk_per_trade_pct > 0.0 && tier.risk_per_trade_pct < 1.0) {
                return invalid(format!("tier {key}: risk_per_trade_pct out of (0, 1)"));
            }
            if tier.daily_loss_limit <= 0.0 || tier.max_total_loss <= 0.0 {
                return invalid(format!("tier {key}: loss limits must be positive"));
            }
        }
        if let Some(pinned) = &self.risk.risk_tier {
            if !self.risk.tiers.contains_key(pinned) {
                return invalid(format!("pinned risk tier `{pinned}` is not configured"));
            }
        }

        let pb = &self.profit_booking;
        if pb.max_level == 0 || pb.max_level > MAX_CHAIN_LEVEL {
            return invalid(format!("profit_booking.max_level must be 1..={MAX_CHAIN_LEVEL}"));
        }
        if pb.multipliers.len() < pb.max_level as usize || pb.sl_reductions.len() < pb.max_level as usize {
            return invalid("profit_booking needs a multiplier and sl_reduction per level".into());
        }
        if pb.sl_reductions.iter().any(|r| !(0.0..100.0).contains(r)) {
            return invalid("profit_booking.sl_reductions must be within [0, 100)".into());
        }
        if pb.profit_targets.iter().any(|t| !t.is_finite() || *t <= 0.0) {
            return invalid("profit_booking.profit_targets must be positive".into());
        }

        for (name, params) in [
            ("logic1", &self.logic.logic1),
            ("logic2", &self.logic.logic2),
            ("logic3", &self.logic.logic3),
        ] {
            if params.sl_multiplier <= 0.0 || params.trail_pips <= 0.0 {
                return invalid(format!("{name}: sl_multiplier and trail_pips must be positive"));
            }
        }
        for (symbol, s) in &self.symbols {
            if s.pip_size <= 0.0 || s.pip_value_per_lot <= 0.0 || s.sl_pips <= 0.0 || s.volume_step <= 0.0 {
                return invalid(format!("symbol {symbol}: spec values must be positive"));
            }
        }
        Ok(())
    }

    /// Configured override, else built-in table, else fallback.
    pub fn symbol_spec(&self, symbol: &str) -> SymbolSpec {
        self.symbols
            .get(symbol)
            .cloned()
            .unwrap_or_else(|| default_symbol_spec(symbol))
    }
}
