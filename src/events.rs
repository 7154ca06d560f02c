//! Lifecycle events emitted by the dual order manager, and the notices sent
//! to the notification channel.

use crate::router::LogicVariant;
use crate::types::{
    ChainId, CloseReason, Direction, GroupId, PositionGroup, PositionLeg, ReEntryTrigger,
};

/// Transitions of a group's state machine. Downstream engines subscribe to
/// these instead of reading each other's state.
#[derive(Clone, Debug, PartialEq)]
pub enum LifecycleEvent {
    /// Both legs confirmed by the broker.
    GroupOpened(PositionGroup),
    LegClosed(LegClosed),
    /// Emitted once, after the second leg reaches a terminal status.
    GroupClosed(PositionGroup),
}

#[derive(Clone, Debug, PartialEq)]
pub struct LegClosed {
    pub group_id: GroupId,
    pub chain_id: Option<ChainId>,
    pub level: u8,
    pub leg: PositionLeg,
    /// True when the sibling leg is still open.
    pub sibling_open: bool,
}

impl LegClosed {
    pub fn pnl(&self) -> f64 {
        self.leg.realized_pnl.unwrap_or(0.0)
    }

    pub fn reason(&self) -> CloseReason {
        self.leg.close_reason.unwrap_or(CloseReason::Manual)
    }
}

/// Fire-and-forget notifications; never part of lifecycle correctness.
#[derive(Clone, Debug, PartialEq)]
pub enum Notice {
    GroupOpened {
        symbol: String,
        group_id: GroupId,
        logic: LogicVariant,
        direction: Direction,
        level: u8,
        entry: f64,
        volume_per_leg: f64,
        stop_loss: f64,
        take_profit: f64,
    },
    LegClosed {
        symbol: String,
        group_id: GroupId,
        leg: String,
        direction: Direction,
        entry: f64,
        exit: f64,
        pnl: f64,
        reason: CloseReason,
    },
    GroupClosed {
        symbol: String,
        group_id: GroupId,
        status: String,
        pnl: f64,
    },
    ChainLevelReached {
        symbol: String,
        chain_id: ChainId,
        level: u8,
        level_profit: f64,
        total_profit: f64,
    },
    ChainEnded {
        symbol: String,
        chain_id: ChainId,
        reason: String,
    },
    ReEntryTriggered {
        symbol: String,
        trigger: ReEntryTrigger,
        direction: Direction,
        attempt: u32,
        price: f64,
    },
    RiskCapBreached {
        symbol: String,
        reason: String,
    },
    SignalRejected {
        reason: String,
    },
    Degraded {
        symbol: String,
        group_id: GroupId,
        error: String,
    },
    Status {
        lines: Vec<String>,
        equity: f64,
        daily_pnl: f64,
        trades_today: u32,
        trading_enabled: bool,
    },
    DailySummary {
        daily_pnl: f64,
        trades: u32,
        wins: u32,
        equity: f64,
    },
}
