use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::router::LogicVariant;

// ─── Ids ──────────────────────────────────────────────────────────────────────

macro_rules! id_type {
    ($name:ident, $prefix:literal) => {
        #[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            pub fn generate() -> Self {
                let raw = uuid::Uuid::new_v4().simple().to_string();
                $name(format!("{}-{}", $prefix, &raw[..12]))
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                $name(s.to_string())
            }
        }
    };
}

id_type!(GroupId, "G");
id_type!(LegId, "L");
id_type!(ChainId, "PROFIT");
id_type!(ContextId, "RE");

// ─── Signals ──────────────────────────────────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SignalKind {
    Entry,
    Bias,
    Trend,
    Reversal,
    Exit,
}

impl SignalKind {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "entry" => Some(SignalKind::Entry),
            "bias" => Some(SignalKind::Bias),
            "trend" => Some(SignalKind::Trend),
            "reversal" => Some(SignalKind::Reversal),
            "exit" => Some(SignalKind::Exit),
            _ => None,
        }
    }
}

impl fmt::Display for SignalKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SignalKind::Entry => "entry",
            SignalKind::Bias => "bias",
            SignalKind::Trend => "trend",
            SignalKind::Reversal => "reversal",
            SignalKind::Exit => "exit",
        };
        f.write_str(s)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Buy,
    Sell,
}

impl Direction {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "buy" | "bull" | "bullish" | "long" => Some(Direction::Buy),
            "sell" | "bear" | "bearish" | "short" => Some(Direction::Sell),
            _ => None,
        }
    }

    pub fn opposite(self) -> Self {
        match self {
            Direction::Buy => Direction::Sell,
            Direction::Sell => Direction::Buy,
        }
    }

    /// +1.0 for Buy, -1.0 for Sell. Multiply a price move by this to get P/L sign.
    pub fn sign(self) -> f64 {
        match self {
            Direction::Buy => 1.0,
            Direction::Sell => -1.0,
        }
    }

    /// Exchange-facing side label.
    pub fn side(self) -> &'static str {
        match self {
            Direction::Buy => "Buy",
            Direction::Sell => "Sell",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.side())
    }
}

/// A timeframe label of the form `<n>m`, `<n>h` or `<n>d`, lower-cased.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Timeframe(String);

impl Timeframe {
    /// Returns `None` for anything that is not a positive count followed by m/h/d.
    pub fn parse(raw: &str) -> Option<Self> {
        let label = raw.trim().to_ascii_lowercase();
        if label.len() < 2 || !label.is_ascii() {
            return None;
        }
        let (count, unit) = label.split_at(label.len() - 1);
        if !matches!(unit, "m" | "h" | "d") {
            return None;
        }
        match count.parse::<u32>() {
            Ok(n) if n > 0 && count.chars().all(|c| c.is_ascii_digit()) => Some(Timeframe(label)),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Timeframe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A validated inbound alert. Immutable once accepted.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Signal {
    pub kind: SignalKind,
    pub symbol: String,
    pub direction: Direction,
    pub timeframe: Timeframe,
    pub price: f64,
    pub strategy: String,
    pub timestamp: DateTime<Utc>,
}

// ─── Legs ─────────────────────────────────────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LegKind {
    /// Fixed take-profit, stop starts trailing once the leg is in profit.
    TpTrail,
    /// No take-profit, stop trails from the start.
    ProfitTrail,
}

impl fmt::Display for LegKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LegKind::TpTrail => f.write_str("TP_TRAIL"),
            LegKind::ProfitTrail => f.write_str("PROFIT_TRAIL"),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum LegStatus {
    Pending,
    Open,
    ClosedProfit,
    ClosedLoss,
    ClosedManual,
    /// Broker outcome unknown after retries were exhausted.
    Unknown,
}

impl LegStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            LegStatus::ClosedProfit | LegStatus::ClosedLoss | LegStatus::ClosedManual
        )
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CloseReason {
    StopLoss,
    TakeProfit,
    TrailingStop,
    /// Closed by the exit strategy engine.
    Signal,
    Manual,
    /// Closed because the chain level reached its profit target.
    ProfitBooking,
}

impl CloseReason {
    pub fn is_price_driven(self) -> bool {
        matches!(
            self,
            CloseReason::StopLoss
                | CloseReason::TakeProfit
                | CloseReason::TrailingStop
                | CloseReason::ProfitBooking
        )
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CloseReason::StopLoss => "Stop-loss hit",
            CloseReason::TakeProfit => "Take-profit reached",
            CloseReason::TrailingStop => "Trailing stop hit",
            CloseReason::Signal => "Exit signal",
            CloseReason::Manual => "Manual close",
            CloseReason::ProfitBooking => "Profit target booked",
        };
        f.write_str(s)
    }
}

/// How a leg's stop follows price.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TrailPolicy {
    /// Distance kept between the best price seen and the stop.
    pub distance: f64,
    /// Profit (price units) required before trailing starts. Zero trails immediately.
    pub activation: f64,
    pub active: bool,
    /// Most favourable price seen since the fill.
    pub best_price: f64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PositionLeg {
    pub id: LegId,
    pub kind: LegKind,
    pub symbol: String,
    pub direction: Direction,
    pub entry_price: f64,
    pub volume: f64,
    pub stop_loss: f64,
    pub take_profit: Option<f64>,
    pub trail: TrailPolicy,
    pub status: LegStatus,
    /// Share of the group's reserved risk carried by this leg.
    pub reserved_risk: f64,
    pub order_id: Option<String>,
    pub exit_price: Option<f64>,
    pub realized_pnl: Option<f64>,
    pub close_reason: Option<CloseReason>,
    pub closed_at: Option<DateTime<Utc>>,
}

impl PositionLeg {
    pub fn is_open(&self) -> bool {
        self.status == LegStatus::Open
    }

    /// Price units gained (positive) or lost (negative) at `price`.
    pub fn excursion(&self, price: f64) -> f64 {
        (price - self.entry_price) * self.direction.sign()
    }
}

// ─── Groups ───────────────────────────────────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum GroupStatus {
    Pending,
    OpenBoth,
    PartiallyClosed,
    ClosedProfit,
    ClosedLoss,
    ClosedManual,
    /// Degraded: a broker call failed permanently; needs reconciliation.
    Unknown,
}

impl GroupStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            GroupStatus::ClosedProfit | GroupStatus::ClosedLoss | GroupStatus::ClosedManual
        )
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReEntryTrigger {
    SlHunt,
    TpContinuation,
    ExitContinuation,
}

impl fmt::Display for ReEntryTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ReEntryTrigger::SlHunt => "SL Hunt",
            ReEntryTrigger::TpContinuation => "TP Continuation",
            ReEntryTrigger::ExitContinuation => "Exit Continuation",
        };
        f.write_str(s)
    }
}

/// Why a group was opened.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum EntryOrigin {
    Fresh,
    ReEntry {
        trigger: ReEntryTrigger,
        /// Group the re-entry lineage started from.
        origin_group: GroupId,
        attempt: u32,
    },
    ChainLevel {
        chain_id: ChainId,
        level: u8,
    },
}

/// Risk parameters frozen at approval time.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RiskSnapshot {
    pub tier: String,
    pub rr_ratio: f64,
    pub equity: f64,
    pub risk_amount: f64,
    pub stop_distance: f64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PositionGroup {
    pub id: GroupId,
    pub symbol: String,
    pub direction: Direction,
    pub logic: LogicVariant,
    pub timeframe: Timeframe,
    pub strategy: String,
    pub entry_price: f64,
    pub tp_trail: PositionLeg,
    pub profit_trail: PositionLeg,
    /// Pyramid level, 1..=5.
    pub level: u8,
    pub chain_id: Option<ChainId>,
    pub parent_group: Option<GroupId>,
    pub origin: EntryOrigin,
    pub risk: RiskSnapshot,
    pub status: GroupStatus,
    pub opened_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
}

impl PositionGroup {
    pub fn legs(&self) -> [&PositionLeg; 2] {
        [&self.tp_trail, &self.profit_trail]
    }

    pub fn leg(&self, id: &LegId) -> Option<&PositionLeg> {
        self.legs().into_iter().find(|l| &l.id == id)
    }

    pub fn leg_mut(&mut self, id: &LegId) -> Option<&mut PositionLeg> {
        if &self.tp_trail.id == id {
            Some(&mut self.tp_trail)
        } else if &self.profit_trail.id == id {
            Some(&mut self.profit_trail)
        } else {
            None
        }
    }

    /// Active groups occupy their symbol/variant slot.
    pub fn is_active(&self) -> bool {
        !self.status.is_terminal()
    }

    pub fn realized_pnl(&self) -> f64 {
        self.legs().iter().filter_map(|l| l.realized_pnl).sum()
    }

    /// Unrealized P/L in price units times volume at `price` (open legs only).
    pub fn unrealized_move(&self, price: f64) -> f64 {
        self.legs()
            .iter()
            .filter(|l| l.is_open())
            .map(|l| l.excursion(price) * l.volume)
            .sum()
    }

    pub fn is_chain_child(&self) -> bool {
        matches!(self.origin, EntryOrigin::ChainLevel { .. })
    }
}
