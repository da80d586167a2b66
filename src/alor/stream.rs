// =============================================================================
// Alor bar stream — BarsGetAndSubscribe over WebSocket
// =============================================================================
//
// Connects to the Alor WebSocket gateway and subscribes to intraday bars for
// one symbol. Alor re-sends the in-progress bar on every trade, so a bar is
// committed downstream only when a strictly newer one arrives
// (commit-on-advance). Committed bars are validated into `BarEvent`s and fed
// into an mpsc channel; the consumer side is the single monitor loop.
//
// Runs until the socket drops (caller reconnects) or the shutdown signal
// fires, in which case the subscription is cancelled with an `unsubscribe`
// opcode before the socket closes.
// =============================================================================

use anyhow::{Context, Result};
use chrono::{TimeZone, Utc};
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::alor::auth::TokenProvider;
use crate::types::{BarEvent, MonitorError, EXCHANGE_TZ};

const WS_URL: &str = "wss://api.alor.ru/ws";

// =============================================================================
// Wire types
// =============================================================================

/// Subscription parameters supplied by the driver.
#[derive(Debug, Clone)]
pub struct StreamConfig {
    pub exchange: String,
    pub symbol: String,
    /// Bar timeframe in seconds.
    pub timeframe_secs: u32,
    /// Starting point of the history the server replays, UTC unix seconds.
    pub from_unix: i64,
    /// Server-side throttle in nanoseconds between pushes.
    pub frequency: u64,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct BarsSubscribeRequest<'a> {
    opcode: &'static str,
    exchange: &'a str,
    code: &'a str,
    tf: u32,
    from: i64,
    delayed: bool,
    skip_history: bool,
    frequency: u64,
    format: &'static str,
    token: &'a str,
    guid: &'a str,
}

#[derive(Serialize)]
struct UnsubscribeRequest<'a> {
    opcode: &'static str,
    token: &'a str,
    guid: &'a str,
}

/// A bar as Alor sends it in `Simple` format.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
pub struct AlorBar {
    /// Bar open time, UTC unix seconds.
    pub time: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: u64,
}

/// One decoded message off the socket.
#[derive(Debug, PartialEq)]
enum StreamMessage {
    /// Subscribe/unsubscribe acknowledgement; carries the gateway HTTP code.
    ServiceAck { http_code: i64, message: String },
    /// A bar belonging to our subscription.
    Bar(AlorBar),
    /// Data for some other guid.
    Skip,
}

// =============================================================================
// Commit-on-advance dedup
// =============================================================================

/// Holds the latest copy of the in-progress bar and releases it once a
/// strictly newer bar arrives. An equal timestamp replaces the held copy
/// (the newest version of a bar wins); a strictly older one is ignored —
/// the subscription replays history on reconnect, and those bars must not
/// evict the live in-progress bar.
#[derive(Debug, Default)]
pub struct BarDeduper {
    prev: Option<AlorBar>,
}

impl BarDeduper {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, bar: AlorBar) -> Option<AlorBar> {
        match self.prev {
            None => {
                self.prev = Some(bar);
                None
            }
            Some(prev) if bar.time > prev.time => {
                self.prev = Some(bar);
                Some(prev)
            }
            Some(prev) if bar.time == prev.time => {
                self.prev = Some(bar);
                None
            }
            // Stale (replayed) bar.
            Some(_) => None,
        }
    }
}

// =============================================================================
// Parsing & validation
// =============================================================================

fn parse_message(text: &str, guid: &str) -> Result<StreamMessage, MonitorError> {
    let root: serde_json::Value = serde_json::from_str(text)
        .map_err(|e| MonitorError::MalformedEvent(format!("invalid JSON: {e}")))?;

    // Service messages (subscribe/unsubscribe acks) carry no `data`.
    if root.get("data").is_none() {
        let http_code = root.get("httpCode").and_then(|v| v.as_i64()).unwrap_or(0);
        let message = root
            .get("message")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();
        return Ok(StreamMessage::ServiceAck { http_code, message });
    }

    if root.get("guid").and_then(|v| v.as_str()) != Some(guid) {
        return Ok(StreamMessage::Skip);
    }

    let bar: AlorBar = serde_json::from_value(root["data"].clone())
        .map_err(|e| MonitorError::MalformedEvent(format!("bad bar payload: {e}")))?;

    Ok(StreamMessage::Bar(bar))
}

/// Validate a committed wire bar into the event the monitor consumes.
pub fn to_event(bar: &AlorBar) -> Result<BarEvent, MonitorError> {
    if !bar.close.is_finite() {
        return Err(MonitorError::MalformedEvent(format!(
            "non-finite close price {}",
            bar.close
        )));
    }

    let time = Utc
        .timestamp_opt(bar.time, 0)
        .single()
        .ok_or_else(|| MonitorError::MalformedEvent(format!("invalid bar time {}", bar.time)))?;

    Ok(BarEvent {
        time: time.with_timezone(&EXCHANGE_TZ),
        close: bar.close,
    })
}

// =============================================================================
// Stream task
// =============================================================================

/// Connect, subscribe, and pump committed bars into `tx` until the socket
/// drops or `shutdown` flips to true.
///
/// Returns `Ok(())` after a clean unsubscribe on shutdown; any other exit is
/// an error so the supervising loop reconnects. The deduper lives with the
/// caller so an in-progress bar survives a reconnect.
pub async fn run_bar_stream(
    config: &StreamConfig,
    tokens: &TokenProvider,
    deduper: &mut BarDeduper,
    tx: &mpsc::Sender<BarEvent>,
    shutdown: &mut watch::Receiver<bool>,
) -> Result<()> {
    let token = tokens.access_token().await?;

    let (ws_stream, _response) = connect_async(WS_URL)
        .await
        .context("failed to connect to Alor WebSocket")?;
    let (mut write, mut read) = ws_stream.split();

    let guid = Uuid::new_v4().to_string();
    let request = BarsSubscribeRequest {
        opcode: "BarsGetAndSubscribe",
        exchange: &config.exchange,
        code: &config.symbol,
        tf: config.timeframe_secs,
        from: config.from_unix,
        delayed: false,
        skip_history: false,
        frequency: config.frequency,
        format: "Simple",
        token: &token,
        guid: &guid,
    };

    let payload =
        serde_json::to_string(&request).context("failed to serialize subscribe request")?;
    write
        .send(Message::Text(payload))
        .await
        .context("failed to send subscribe request")?;

    info!(
        exchange = %config.exchange,
        symbol = %config.symbol,
        tf = config.timeframe_secs,
        guid = %guid,
        "bar subscription activated"
    );

    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    unsubscribe(&mut write, tokens, &guid).await;
                    return Ok(());
                }
            }

            msg = read.next() => match msg {
                Some(Ok(Message::Text(text))) => match parse_message(&text, &guid) {
                    Ok(StreamMessage::Bar(bar)) => {
                        if let Some(committed) = deduper.push(bar) {
                            match to_event(&committed) {
                                Ok(event) => {
                                    if tx.send(event).await.is_err() {
                                        // Consumer gone; nothing left to do.
                                        return Ok(());
                                    }
                                }
                                Err(e) => warn!(error = %e, "dropping malformed bar"),
                            }
                        }
                    }
                    Ok(StreamMessage::ServiceAck { http_code, message }) => {
                        if http_code == 200 {
                            debug!(message = %message, "subscription acknowledged");
                        } else {
                            warn!(http_code, message = %message, "gateway reported an error");
                        }
                    }
                    Ok(StreamMessage::Skip) => {}
                    Err(e) => warn!(error = %e, "dropping unparseable stream message"),
                },
                Some(Ok(_)) => {
                    // Ping/Pong/Binary frames — tungstenite answers pings itself.
                }
                Some(Err(e)) => return Err(e).context("Alor WebSocket read error"),
                None => anyhow::bail!("Alor WebSocket stream ended"),
            }
        }
    }
}

async fn unsubscribe<S>(write: &mut S, tokens: &TokenProvider, guid: &str)
where
    S: SinkExt<Message> + Unpin,
    S::Error: std::fmt::Display,
{
    let token = match tokens.access_token().await {
        Ok(t) => t,
        Err(e) => {
            warn!(error = %e, "could not fetch JWT for unsubscribe, closing socket as-is");
            return;
        }
    };

    let request = UnsubscribeRequest {
        opcode: "unsubscribe",
        token: &token,
        guid,
    };

    match serde_json::to_string(&request) {
        Ok(payload) => {
            if let Err(e) = write.send(Message::Text(payload)).await {
                warn!(error = %e, "failed to send unsubscribe");
            } else {
                info!(guid = %guid, "subscription cancelled");
            }
        }
        Err(e) => warn!(error = %e, "failed to serialize unsubscribe request"),
    }
}

// =============================================================================
// Tests
// =============================================================================
