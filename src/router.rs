use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

use crate::config::{LogicConfig, LogicParams};
use crate::error::RouteError;
use crate::types::{Direction, Signal, SignalKind, Timeframe};

/// Mutually exclusive strategy variants, selected once per entry by timeframe.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum LogicVariant {
    Logic1,
    Logic2,
    Logic3,
}

impl LogicVariant {
    /// Total over timeframes: exactly one variant or an error.
    pub fn for_timeframe(tf: &Timeframe) -> Result<Self, RouteError> {
        match tf.as_str() {
            "5m" => Ok(LogicVariant::Logic1),
            "15m" => Ok(LogicVariant::Logic2),
            "1h" => Ok(LogicVariant::Logic3),
            other => Err(RouteError::UnsupportedTimeframe(other.to_string())),
        }
    }

    pub fn params(self, config: &LogicConfig) -> &LogicParams {
        match self {
            LogicVariant::Logic1 => &config.logic1,
            LogicVariant::Logic2 => &config.logic2,
            LogicVariant::Logic3 => &config.logic3,
        }
    }
}

impl fmt::Display for LogicVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogicVariant::Logic1 => f.write_str("LOGIC1"),
            LogicVariant::Logic2 => f.write_str("LOGIC2"),
            LogicVariant::Logic3 => f.write_str("LOGIC3"),
        }
    }
}

/// Routes a validated entry signal to its variant.
pub fn route(signal: &Signal) -> Result<LogicVariant, RouteError> {
    if signal.kind != SignalKind::Entry {
        return Err(RouteError::NotAnEntry(signal.kind.to_string()));
    }
    LogicVariant::for_timeframe(&signal.timeframe)
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TrendReading {
    pub direction: Direction,
    pub at: DateTime<Utc>,
}

/// Latest bias and trend direction per timeframe for one symbol.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct TrendBook {
    bias: HashMap<String, TrendReading>,
    trend: HashMap<String, TrendReading>,
}

impl TrendBook {
    /// Records bias/trend/reversal readings; other kinds are ignored.
    /// A reversal overwrites both the bias and the trend of its timeframe.
    pub fn record(&mut self, signal: &Signal) {
        let reading = TrendReading { direction: signal.direction, at: signal.timestamp };
        let tf = signal.timeframe.as_str().to_string();
        match signal.kind {
            SignalKind::Bias => {
                self.bias.insert(tf, reading);
            }
            SignalKind::Trend => {
                self.trend.insert(tf, reading);
            }
            SignalKind::Reversal => {
                self.bias.insert(tf.clone(), reading.clone());
                self.trend.insert(tf, reading);
            }
            SignalKind::Entry | SignalKind::Exit => {}
        }
    }

    pub fn bias(&self, tf: &str) -> Option<Direction> {
        self.bias.get(tf).map(|r| r.direction)
    }

    pub fn trend(&self, tf: &str) -> Option<Direction> {
        self.trend.get(tf).map(|r| r.direction)
    }

    /// Checks the variant's confirmation rule. Missing readings never block;
    /// a recorded reading pointing the other way does.
    pub fn confirm(&self, params: &LogicParams, direction: Direction) -> Result<(), String> {
        if !params.require_alignment {
            return Ok(());
        }
        if let Some(bias) = self.bias(&params.bias_timeframe) {
            if bias != direction {
                return Err(format!("{} bias is {}", params.bias_timeframe, bias));
            }
        }
        if let Some(trend) = self.trend(&params.trend_timeframe) {
            if trend != direction {
                return Err(format!("{} trend is {}", params.trend_timeframe, trend));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn signal(kind: SignalKind, tf: &str, direction: Direction) -> Signal {
        Signal {
            kind,
            symbol: "EURUSD".into(),
            direction,
            timeframe: Timeframe::parse(tf).unwrap(),
            price: 1.1,
            strategy: "test".into(),
            timestamp: Utc.with_ymd_and_hms(2026, 1, 5, 12, 0, 0).unwrap(),
        }
    }

    #[test]
    fn routing_is_total_and_exclusive() {
        let cases = [("5m", Some(LogicVariant::Logic1)), ("15m", Some(LogicVariant::Logic2)), ("1h", Some(LogicVariant::Logic3))];
        for (tf, expected) in cases {
            assert_eq!(route(&signal(SignalKind::Entry, tf, Direction::Buy)).ok(), expected);
        }
        for tf in ["1m", "30m", "4h", "1d", "60m"] {
            assert_eq!(
                route(&signal(SignalKind::Entry, tf, Direction::Buy)),
                Err(RouteError::UnsupportedTimeframe(tf.into()))
            );
        }
    }

    #[test]
    fn only_entries_are_routed() {
        assert!(matches!(
            route(&signal(SignalKind::Trend, "5m", Direction::Buy)),
            Err(RouteError::NotAnEntry(_))
        ));
    }

    #[test]
    fn confirmation_blocks_only_on_contradiction() {
        let params = LogicConfig::default().logic1;
        let mut book = TrendBook::default();
        assert!(book.confirm(&params, Direction::Buy).is_ok());

        book.record(&signal(SignalKind::Bias, "1h", Direction::Buy));
        assert!(book.confirm(&params, Direction::Buy).is_ok());
        assert!(book.confirm(&params, Direction::Sell).is_err());

        book.record(&signal(SignalKind::Trend, "15m", Direction::Sell));
        assert!(book.confirm(&params, Direction::Buy).is_err());

        let mut relaxed = params.clone();
        relaxed.require_alignment = false;
        assert!(book.confirm(&relaxed, Direction::Buy).is_ok());
    }

    #[test]
    fn reversal_overwrites_bias_and_trend() {
        let mut book = TrendBook::default();
        book.record(&signal(SignalKind::Bias, "1h", Direction::Buy));
        book.record(&signal(SignalKind::Reversal, "1h", Direction::Sell));
        assert_eq!(book.bias("1h"), Some(Direction::Sell));
        assert_eq!(book.trend("1h"), Some(Direction::Sell));
    }
}
