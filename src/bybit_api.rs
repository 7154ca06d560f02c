use async_trait::async_trait;
use hmac::{Hmac, Mac};
use reqwest::header::{HeaderMap, HeaderValue, CONTENT_TYPE};
use serde_json::Value;
use sha2::Sha256;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::broker::{Broker, BrokerPosition, Fill, LegOrder};
use crate::config::BYBIT_REST_URL;
use crate::error::BrokerError;
use crate::types::{Direction, PositionLeg};

type HmacSha256 = Hmac<Sha256>;

const RECV_WINDOW: &str = "5000";

/// Classify a Bybit retCode + HTTP status into a BrokerError.
fn classify_error(ret_code: i64, http_status: u16, msg: &str) -> BrokerError {
    match (ret_code, http_status) {
        (10006, _) | (_, 429) => BrokerError::RateLimit { retry_after: 10 },
        (10016, _) | (_, 500..=599) => BrokerError::Transient(msg.to_string()),
        _ => BrokerError::Permanent(format!("retCode={} msg={}", ret_code, msg)),
    }
}

/// HMAC-SHA256 over `timestamp + api_key + recv_window + payload`, hex encoded.
fn signature(secret: &str, ts: &str, api_key: &str, payload: &str) -> Result<String, BrokerError> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|e| BrokerError::Permanent(format!("HMAC init: {e}")))?;
    mac.update(format!("{}{}{}{}", ts, api_key, RECV_WINDOW, payload).as_bytes());
    Ok(hex::encode(mac.finalize().into_bytes()))
}

fn header(value: &str) -> Result<HeaderValue, BrokerError> {
    HeaderValue::from_str(value).map_err(|e| BrokerError::Permanent(format!("bad header value: {e}")))
}

fn fmt_price(price: f64) -> String {
    if price >= 100.0 {
        format!("{:.2}", price)
    } else {
        format!("{:.5}", price)
    }
}

fn num(v: &Value) -> Option<f64> {
    v.as_str().and_then(|s| s.parse().ok()).or_else(|| v.as_f64())
}

fn parse_positions(json: &Value) -> Vec<BrokerPosition> {
    let Some(list) = json["result"]["list"].as_array() else {
        return Vec::new();
    };
    list.iter()
        .filter_map(|entry| {
            let volume = num(&entry["size"]).unwrap_or(0.0);
            if volume == 0.0 {
                return None;
            }
            Some(BrokerPosition {
                symbol: entry["symbol"].as_str()?.to_string(),
                direction: Direction::parse(entry["side"].as_str()?)?,
                volume,
                avg_price: num(&entry["avgPrice"]).unwrap_or(0.0),
            })
        })
        .collect()
}

fn parse_equity(json: &Value) -> Option<f64> {
    num(&json["result"]["list"][0]["totalEquity"])
}

fn parse_last_price(json: &Value) -> Option<f64> {
    num(&json["result"]["list"][0]["lastPrice"])
}

// ── Client ────────────────────────────────────────────────────────────────────

/// Bybit V5 linear REST broker. Legs are placed with partial TP/SL so both
/// legs of a group can share one exchange position.
#[derive(Clone)]
pub struct BybitClient {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    api_secret: String,
}

impl BybitClient {
    /// `None` when `BYBIT_API_KEY` / `BYBIT_SECRET` are not set.
    pub fn from_env() -> Result<Option<Self>, BrokerError> {
        let (Ok(api_key), Ok(api_secret)) = (std::env::var("BYBIT_API_KEY"), std::env::var("BYBIT_SECRET")) else {
            return Ok(None);
        };
        let client = reqwest::Client::builder()
            .pool_max_idle_per_host(10)
            .timeout(Duration::from_secs(10))
            .connect_timeout(Duration::from_secs(5))
            .build()
            .map_err(|e| BrokerError::Permanent(format!("HTTP client build failed: {e}")))?;
        Ok(Some(BybitClient { client, base_url: BYBIT_REST_URL.to_string(), api_key, api_secret }))
    }

    fn timestamp_ms() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0)
    }

    fn signed_headers(&self, payload: &str) -> Result<HeaderMap, BrokerError> {
        let ts = Self::timestamp_ms().to_string();
        let sign = signature(&self.api_secret, &ts, &self.api_key, payload)?;

        let mut headers = HeaderMap::new();
        headers.insert("X-BAPI-API-KEY", header(&self.api_key)?);
        headers.insert("X-BAPI-TIMESTAMP", header(&ts)?);
        headers.insert("X-BAPI-SIGN", header(&sign)?);
        headers.insert("X-BAPI-RECV-WINDOW", HeaderValue::from_static(RECV_WINDOW));
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        Ok(headers)
    }

    async fn read(resp: reqwest::Response) -> Result<Value, BrokerError> {
        let http_status = resp.status().as_u16();
        let json: Value = resp
            .json()
            .await
            .map_err(|e| BrokerError::Transient(format!("Parse error: {}", e)))?;

        let ret_code = json["retCode"].as_i64().unwrap_or(-1);
        if ret_code == 0 {
            Ok(json)
        } else {
            let msg = json["retMsg"].as_str().unwrap_or("unknown");
            Err(classify_error(ret_code, http_status, msg))
        }
    }

    async fn post_signed(&self, path: &str, body: Value) -> Result<Value, BrokerError> {
        let body = body.to_string();
        let headers = self.signed_headers(&body)?;
        let resp = self
            .client
            .post(format!("{}{}", self.base_url, path))
            .headers(headers)
            .body(body)
            .send()
            .await
            .map_err(|e| BrokerError::Transient(format!("HTTP error: {}", e)))?;
        Self::read(resp).await
    }

    async fn get_signed(&self, path: &str, query: &str) -> Result<Value, BrokerError> {
        let headers = self.signed_headers(query)?;
        let resp = self
            .client
            .get(format!("{}{}?{}", self.base_url, path, query))
            .headers(headers)
            .send()
            .await
            .map_err(|e| BrokerError::Transient(format!("HTTP error: {}", e)))?;
        Self::read(resp).await
    }

    async fn get_public(&self, path: &str, query: &str) -> Result<Value, BrokerError> {
        let resp = self
            .client
            .get(format!("{}{}?{}", self.base_url, path, query))
            .send()
            .await
            .map_err(|e| BrokerError::Transient(format!("HTTP error: {}", e)))?;
        Self::read(resp).await
    }
}

#[async_trait]
impl Broker for BybitClient {
    async fn place_leg(&self, order: &LegOrder, price: f64) -> Result<Fill, BrokerError> {
        let mut body = serde_json::json!({
            "category":    "linear",
            "symbol":      order.symbol,
            "side":        order.direction.side(),
            "orderType":   "Market",
            "qty":         format!("{:.4}", order.volume),
            "stopLoss":    fmt_price(order.stop_loss),
            "slOrderType": "Market",
            "tpslMode":    "Partial",
            "orderLinkId": order.leg_id.as_str(),
            "timeInForce": "GTC"
        });
        if let Some(tp) = order.take_profit {
            body["takeProfit"] = Value::String(fmt_price(tp));
            body["tpOrderType"] = Value::String("Market".into());
        }

        let json = self.post_signed("/v5/order/create", body).await?;
        let order_id = json["result"]["orderId"].as_str().unwrap_or("unknown").to_string();
        log::info!(
            "[{}] Order placed: {} {} L{} qty={:.4} orderId={}",
            order.symbol, order.direction, order.kind, order.level, order.volume, order_id
        );
        Ok(Fill { order_id, price })
    }

    async fn close_leg(&self, leg: &PositionLeg, price: f64) -> Result<f64, BrokerError> {
        let body = serde_json::json!({
            "category":    "linear",
            "symbol":      leg.symbol,
            "side":        leg.direction.opposite().side(),
            "orderType":   "Market",
            "qty":         format!("{:.4}", leg.volume),
            "reduceOnly":  true,
            "timeInForce": "GTC"
        });
        let json = self.post_signed("/v5/order/create", body).await?;
        log::info!(
            "[{}] Leg {} closed orderId={}",
            leg.symbol, leg.id, json["result"]["orderId"].as_str().unwrap_or("unknown")
        );
        Ok(price)
    }

    async fn modify_stop(&self, leg: &PositionLeg, stop: f64) -> Result<(), BrokerError> {
        let body = serde_json::json!({
            "category":    "linear",
            "symbol":      leg.symbol,
            "tpslMode":    "Partial",
            "stopLoss":    fmt_price(stop),
            "slSize":      format!("{:.4}", leg.volume),
            "slOrderType": "Market",
            "positionIdx": 0
        });
        self.post_signed("/v5/position/trading-stop", body).await?;
        log::debug!("[{}] Stop of {} moved to {:.5}", leg.symbol, leg.id, stop);
        Ok(())
    }

    async fn open_positions(&self) -> Result<Vec<BrokerPosition>, BrokerError> {
        let json = self
            .get_signed("/v5/position/list", "category=linear&settleCoin=USDT&limit=200")
            .await?;
        Ok(parse_positions(&json))
    }

    async fn account_equity(&self) -> Result<Option<f64>, BrokerError> {
        let json = self.get_signed("/v5/account/wallet-balance", "accountType=UNIFIED").await?;
        Ok(parse_equity(&json))
    }

    async fn latest_price(&self, symbol: &str) -> Result<f64, BrokerError> {
        let query = format!("category=linear&symbol={}", symbol);
        let json = self.get_public("/v5/market/tickers", &query).await?;
        parse_last_price(&json).ok_or_else(|| BrokerError::Transient(format!("no lastPrice for {symbol}")))
    }
}
