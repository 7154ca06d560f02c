//! Inbound alert validation.
//!
//! Every field of the alert shape is required except `timestamp`, which is
//! stamped with the receipt time when absent. In particular `tf` is never
//! defaulted: an alert without it is rejected whatever its type.

use chrono::{DateTime, TimeZone, Utc};
use serde_json::Value;

use crate::error::ValidationError;
use crate::types::{Direction, Signal, SignalKind, Timeframe};

fn required_str<'a>(payload: &'a Value, field: &'static str) -> Result<&'a str, ValidationError> {
    match payload.get(field) {
        None | Some(Value::Null) => Err(ValidationError::MissingField(field)),
        Some(Value::String(s)) if s.trim().is_empty() => Err(ValidationError::MissingField(field)),
        Some(Value::String(s)) => Ok(s.as_str()),
        Some(other) => Err(ValidationError::InvalidField {
            field,
            reason: format!("expected string, got {other}"),
        }),
    }
}

fn required_price(payload: &Value) -> Result<f64, ValidationError> {
    let price = match payload.get("price") {
        None | Some(Value::Null) => return Err(ValidationError::MissingField("price")),
        Some(Value::Number(n)) => n.as_f64(),
        // TradingView placeholders arrive as strings
        Some(Value::String(s)) => s.trim().parse::<f64>().ok(),
        Some(_) => None,
    };
    match price {
        Some(p) if p.is_finite() && p > 0.0 => Ok(p),
        _ => Err(ValidationError::InvalidField {
            field: "price",
            reason: format!("expected a positive number, got {}", payload["price"]),
        }),
    }
}

fn optional_timestamp(payload: &Value, received_at: DateTime<Utc>) -> Result<DateTime<Utc>, ValidationError> {
    let invalid = |v: &Value| ValidationError::InvalidField {
        field: "timestamp",
        reason: format!("expected RFC 3339 or unix seconds, got {v}"),
    };
    match payload.get("timestamp") {
        None | Some(Value::Null) => Ok(received_at),
        Some(Value::String(s)) => DateTime::parse_from_rfc3339(s.trim())
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(|_| invalid(&payload["timestamp"])),
        Some(v @ Value::Number(n)) => n
            .as_i64()
            .and_then(|secs| Utc.timestamp_opt(secs, 0).single())
            .ok_or_else(|| invalid(v)),
        Some(v) => Err(invalid(v)),
    }
}

/// Normalizes a decoded alert payload into a [`Signal`].
///
/// Pure: no state is touched on either outcome.
pub fn validate_alert(payload: &Value, received_at: DateTime<Utc>) -> Result<Signal, ValidationError> {
    if !payload.is_object() {
        return Err(ValidationError::NotAnObject);
    }

    let kind_raw = required_str(payload, "type")?;
    let kind = SignalKind::parse(kind_raw).ok_or_else(|| ValidationError::InvalidField {
        field: "type",
        reason: format!("`{kind_raw}` is not one of entry|bias|trend|reversal|exit"),
    })?;

    // Checked before the remaining fields so a missing timeframe is always
    // reported as such.
    let tf_raw = required_str(payload, "tf")?;
    let timeframe = Timeframe::parse(tf_raw).ok_or_else(|| ValidationError::InvalidField {
        field: "tf",
        reason: format!("`{tf_raw}` is not a timeframe like 5m, 15m, 1h, 1d"),
    })?;

    let symbol = required_str(payload, "symbol")?.trim().to_ascii_uppercase();
    if !symbol.chars().all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-' | '/')) {
        return Err(ValidationError::InvalidField {
            field: "symbol",
            reason: format!("`{symbol}` contains unexpected characters"),
        });
    }

    let side_raw = required_str(payload, "signal")?;
    let direction = Direction::parse(side_raw).ok_or_else(|| ValidationError::InvalidField {
        field: "signal",
        reason: format!("`{side_raw}` is not buy or sell"),
    })?;

    let price = required_price(payload)?;
    let strategy = required_str(payload, "strategy")?.trim().to_string();
    let timestamp = optional_timestamp(payload, received_at)?;

    Ok(Signal { kind, symbol, direction, timeframe, price, strategy, timestamp })
}
