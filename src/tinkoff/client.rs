// =============================================================================
// Tinkoff Invest REST client — reference data and minute candles
// =============================================================================
//
// Talks to the Invest public REST gateway (proto3-JSON transcoding): share
// lookup, last prices, and 1-minute candles. The token is sent as a Bearer
// header and never logged. Quota headers from every response feed the
// rate-limit tracker; when the quota is exhausted the non-essential candle
// fetch is blocked locally.
// =============================================================================

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::Deserialize;
use tracing::{debug, warn};

use crate::monitor::{CandleSource, ReferenceData};
use crate::tinkoff::rate_limit::RateLimitTracker;
use crate::types::{Instrument, MinuteCandle, MonitorError};

const BASE_URL: &str = "https://invest-public-api.tinkoff.ru/rest";
const API_PREFIX: &str = "tinkoff.public.invest.api.contract.v1";
const SERVICE: &str = "tinkoff";

// =============================================================================
// Quotation — proto3-JSON decimal
// =============================================================================

/// Money/price value as the gateway encodes it: int64 `units` serialized as a
/// JSON string plus an i32 `nano` fraction.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
pub struct Quotation {
    #[serde(default, deserialize_with = "de_int64")]
    pub units: i64,
    #[serde(default)]
    pub nano: i32,
}

impl Quotation {
    pub fn to_f64(self) -> f64 {
        self.units as f64 + self.nano as f64 / 1e9
    }
}

fn de_int64<'de, D>(deserializer: D) -> Result<i64, D::Error>
where
    D: serde::Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Int64 {
        Num(i64),
        Str(String),
    }

    match Int64::deserialize(deserializer)? {
        Int64::Num(n) => Ok(n),
        Int64::Str(s) => s.parse().map_err(serde::de::Error::custom),
    }
}

/// Parse a JSON value that may be an int64-as-string or a plain number.
fn parse_u64(val: &serde_json::Value) -> Option<u64> {
    match val {
        serde_json::Value::String(s) => s.parse().ok(),
        serde_json::Value::Number(n) => n.as_u64(),
        _ => None,
    }
}

// =============================================================================
// Response extraction (pure, testable)
// =============================================================================

/// Find `ticker` (case-insensitive) in an InstrumentsService/Shares response.
fn pick_share(body: &serde_json::Value, ticker: &str) -> Option<Instrument> {
    let instruments = body.get("instruments")?.as_array()?;

    instruments
        .iter()
        .find(|share| {
            share
                .get("ticker")
                .and_then(|v| v.as_str())
                .is_some_and(|t| t.eq_ignore_ascii_case(ticker))
        })
        .and_then(|share| {
            Some(Instrument {
                ticker: share.get("ticker")?.as_str()?.to_string(),
                figi: share.get("figi")?.as_str()?.to_string(),
                issue_size: share.get("issueSize").and_then(parse_u64),
            })
        })
}

/// Extract the single price from a GetLastPrices response.
fn last_price_from(body: &serde_json::Value) -> Option<f64> {
    let price = body.get("lastPrices")?.as_array()?.first()?.get("price")?;
    let quotation: Quotation = serde_json::from_value(price.clone()).ok()?;
    Some(quotation.to_f64())
}

/// Extract minute candles from a GetCandles response. Malformed entries are
/// skipped with a warning rather than failing the whole fetch.
fn candles_from(body: &serde_json::Value) -> Vec<MinuteCandle> {
    let raw = match body.get("candles").and_then(|v| v.as_array()) {
        Some(arr) => arr,
        None => return Vec::new(),
    };

    let mut candles = Vec::with_capacity(raw.len());
    for entry in raw {
        let time = entry
            .get("time")
            .and_then(|v| v.as_str())
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|t| t.with_timezone(&Utc));
        let volume = entry.get("volume").and_then(parse_u64);

        match (time, volume) {
            (Some(time), Some(volume)) => candles.push(MinuteCandle { time, volume }),
            _ => warn!("skipping malformed candle entry"),
        }
    }
    candles
}

// =============================================================================
// Client
// =============================================================================

#[derive(Clone)]
pub struct TinkoffClient {
    client: reqwest::Client,
    base_url: String,
    limits: Arc<RateLimitTracker>,
}

impl TinkoffClient {
    pub fn new(token: impl AsRef<str>, limits: Arc<RateLimitTracker>) -> Self {
        let mut default_headers = reqwest::header::HeaderMap::new();
        if let Ok(mut val) =
            reqwest::header::HeaderValue::from_str(&format!("Bearer {}", token.as_ref()))
        {
            val.set_sensitive(true);
            default_headers.insert(reqwest::header::AUTHORIZATION, val);
        }

        let client = reqwest::Client::builder()
            .default_headers(default_headers)
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .expect("failed to build reqwest client");

        Self {
            client,
            base_url: BASE_URL.to_string(),
            limits,
        }
    }

    /// POST one gateway method and return the decoded JSON body.
    async fn call(
        &self,
        method: &str,
        body: serde_json::Value,
    ) -> Result<serde_json::Value, MonitorError> {
        let url = format!("{}/{}.{}", self.base_url, API_PREFIX, method);

        let resp = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| MonitorError::upstream(SERVICE, e))?;

        self.limits.update_from_headers(resp.headers());

        let status = resp.status();
        let body: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| MonitorError::upstream(SERVICE, e))?;

        if !status.is_success() {
            return Err(MonitorError::Upstream {
                service: SERVICE,
                message: format!("{method} returned {status}: {body}"),
            });
        }

        debug!(method, "gateway call ok");
        Ok(body)
    }
}

#[async_trait]
impl ReferenceData for TinkoffClient {
    async fn resolve(&self, ticker: &str) -> Result<Option<Instrument>, MonitorError> {
        let body = self
            .call(
                "InstrumentsService/Shares",
                serde_json::json!({ "instrumentStatus": "INSTRUMENT_STATUS_BASE" }),
            )
            .await?;

        Ok(pick_share(&body, ticker))
    }

    async fn last_price(&self, figi: &str) -> Result<f64, MonitorError> {
        let body = self
            .call(
                "MarketDataService/GetLastPrices",
                serde_json::json!({ "figi": [figi] }),
            )
            .await?;

        last_price_from(&body).ok_or_else(|| MonitorError::Upstream {
            service: SERVICE,
            message: format!("GetLastPrices returned no price for {figi}"),
        })
    }
}

#[async_trait]
impl CandleSource for TinkoffClient {
    async fn minute_candles(
        &self,
        figi: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<MinuteCandle>, MonitorError> {
        if !self.limits.can_spend() {
            return Err(MonitorError::Upstream {
                service: SERVICE,
                message: "rate-limit quota exhausted, candle fetch skipped".into(),
            });
        }

        let body = self
            .call(
                "MarketDataService/GetCandles",
                serde_json::json!({
                    "figi": figi,
                    "from": from.to_rfc3339_opts(SecondsFormat::Secs, true),
                    "to": to.to_rfc3339_opts(SecondsFormat::Secs, true),
                    "interval": "CANDLE_INTERVAL_1_MIN",
                }),
            )
            .await?;

        Ok(candles_from(&body))
    }
}

impl std::fmt::Debug for TinkoffClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TinkoffClient")
            .field("base_url", &self.base_url)
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
