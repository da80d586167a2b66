// =============================================================================
// Shared types used across the stockwatch monitor
// =============================================================================

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// All exchange-local timestamps in this program are Moscow time.
pub const EXCHANGE_TZ: Tz = chrono_tz::Europe::Moscow;

/// A resolved security: ticker plus the stable identifier and share count
/// needed for capitalization.
#[derive(Debug, Clone, Serialize)]
pub struct Instrument {
    pub ticker: String,
    pub figi: String,
    /// Issued share count. `None` until the reference service reports it;
    /// capitalization is omitted (not zero) while unknown.
    pub issue_size: Option<u64>,
}

/// A validated intraday bar as it crosses from the wire into the monitor.
/// Only the timestamp and close price survive the stream boundary.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BarEvent {
    /// Bar open time in exchange-local (Moscow) time.
    pub time: DateTime<Tz>,
    pub close: f64,
}

/// One minute candle from the candle service, reduced to what the daily
/// volume aggregation needs.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MinuteCandle {
    pub time: DateTime<Utc>,
    /// Traded volume in lots.
    pub volume: u64,
}

/// A single point of the rendered price series.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChartPoint {
    /// Unix milliseconds of the bar time.
    pub at: i64,
    /// "HH:MM" label in exchange-local time.
    pub label: String,
    pub price: f64,
}

/// Everything the renderer needs to redraw the chart in place.
#[derive(Debug, Clone, Serialize)]
pub struct ChartFrame {
    pub title: String,
    pub subtitle: String,
    pub points: Vec<ChartPoint>,
    /// `issue_size × close`; absent while the share count is unknown.
    pub capitalization: Option<f64>,
    /// Total traded volume (lots) since the session pre-open.
    pub day_volume: u64,
    /// ISO 8601 timestamp of the frame build.
    pub updated_at: String,
}

/// Monitor error taxonomy.
///
/// `TickerNotFound` and `Upstream` are fatal during initialization and abort
/// startup. After initialization every variant is caught at the event-handler
/// boundary, logged, and substituted with stale or zero data.
#[derive(Debug, Error)]
pub enum MonitorError {
    #[error("ticker {0} not found")]
    TickerNotFound(String),

    #[error("{service} request failed: {message}")]
    Upstream {
        service: &'static str,
        message: String,
    },

    #[error("malformed bar event: {0}")]
    MalformedEvent(String),
}

impl MonitorError {
    pub fn upstream(service: &'static str, err: impl std::fmt::Display) -> Self {
        Self::Upstream {
            service,
            message: err.to_string(),
        }
    }
}
