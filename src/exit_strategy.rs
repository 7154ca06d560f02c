use std::fmt;

use crate::config::{ExitStrategyConfig, LogicConfig};
use crate::router::{LogicVariant, TrendBook};
use crate::types::{GroupId, PositionGroup, Signal, SignalKind};

/// Why the exit engine wants a group flat.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExitCondition {
    /// Reversal signal against the group.
    Reversal,
    /// Exit marker for the group's own side appeared before stop or target.
    EarlyWarning,
    /// Bias and trend of the variant's timeframes both turned against the group.
    TrendReversal,
    /// Entry the other way on the same variant.
    OppositeSignal,
}

impl fmt::Display for ExitCondition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ExitCondition::Reversal => "Reversal",
            ExitCondition::EarlyWarning => "Exit appeared early",
            ExitCondition::TrendReversal => "Trend reversal",
            ExitCondition::OppositeSignal => "Opposite signal",
        };
        f.write_str(s)
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct ExitDecision {
    pub group_id: GroupId,
    pub condition: ExitCondition,
}

/// Decides which open groups of the signal's symbol to close.
///
/// `trends` must already include `signal`. At most one condition is reported
/// per group, checked in the order of [`ExitCondition`]'s variants.
pub fn evaluate<'a>(
    signal: &Signal,
    open_groups: impl IntoIterator<Item = &'a PositionGroup>,
    trends: &TrendBook,
    config: &ExitStrategyConfig,
    logic: &LogicConfig,
) -> Vec<ExitDecision> {
    open_groups
        .into_iter()
        .filter(|g| g.is_active() && g.symbol == signal.symbol)
        .filter_map(|group| {
            condition_for(signal, group, trends, config, logic).map(|condition| ExitDecision {
                group_id: group.id.clone(),
                condition,
            })
        })
        .collect()
}

fn condition_for(
    signal: &Signal,
    group: &PositionGroup,
    trends: &TrendBook,
    config: &ExitStrategyConfig,
    logic: &LogicConfig,
) -> Option<ExitCondition> {
    let against = signal.direction == group.direction.opposite();

    if config.reversal && signal.kind == SignalKind::Reversal && against {
        return Some(ExitCondition::Reversal);
    }

    if config.early_warning && signal.kind == SignalKind::Exit && signal.direction == group.direction {
        let in_profit = group.unrealized_move(signal.price) > 0.0;
        if in_profit || !config.early_warning_requires_profit {
            return Some(ExitCondition::EarlyWarning);
        }
    }

    if config.trend_reversal && matches!(signal.kind, SignalKind::Trend | SignalKind::Bias) && against {
        let params = group.logic.params(logic);
        let opposite = Some(group.direction.opposite());
        if trends.bias(&params.bias_timeframe) == opposite && trends.trend(&params.trend_timeframe) == opposite {
            return Some(ExitCondition::TrendReversal);
        }
    }

    if config.opposite_signal && signal.kind == SignalKind::Entry && against {
        if LogicVariant::for_timeframe(&signal.timeframe).ok() == Some(group.logic) {
            return Some(ExitCondition::OppositeSignal);
        }
    }

    None
}
