// =============================================================================
// Chart feed — WebSocket endpoint
// =============================================================================
//
// The browser page keeps one socket open on `/api/v1/ws`. It gets the full
// ChartSnapshot right after the upgrade, then again whenever a bar lands:
// the monitor loop bumps `state_version` through the renderer, and a 500 ms
// poll here notices the bump and pushes a fresh snapshot. There is no diffing
// — a frame is a few hundred points at most, so resending the whole snapshot
// is cheaper than tracking deltas.
// =============================================================================

use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::IntoResponse,
};
use tokio::time::{interval, Duration};
use tracing::{debug, info, warn};

use crate::app_state::AppState;

/// Interval at which a connection checks `state_version` for changes.
const PUSH_POLL: Duration = Duration::from_millis(500);

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    debug!("chart feed client connecting");
    ws.on_upgrade(move |socket| serve_chart_feed(socket, state))
}

/// Drive one chart-feed connection until the client goes away.
///
/// A single `tokio::select!` alternates between the version poll (outbound
/// snapshots) and the client's frames (pings and the eventual close). Browsers
/// send nothing else, so any text or binary frame is simply dropped.
async fn serve_chart_feed(socket: WebSocket, state: Arc<AppState>) {
    use futures_util::{SinkExt, StreamExt};
    let (mut sink, mut frames) = socket.split();

    if let Err(e) = push_snapshot(&mut sink, &state).await {
        warn!(error = %e, "chart feed: initial snapshot not delivered");
        return;
    }
    let mut sent_version = state.current_state_version();

    let mut poll = interval(PUSH_POLL);

    loop {
        tokio::select! {
            _ = poll.tick() => {
                let version = state.current_state_version();
                if version == sent_version {
                    continue;
                }
                match push_snapshot(&mut sink, &state).await {
                    Ok(()) => sent_version = version,
                    Err(e) => {
                        debug!(error = %e, "chart feed: push failed, dropping client");
                        break;
                    }
                }
            }

            frame = frames.next() => match frame {
                Some(Ok(Message::Ping(payload))) => {
                    if sink.send(Message::Pong(payload)).await.is_err() {
                        break;
                    }
                }
                Some(Ok(Message::Close(_))) | None => {
                    info!("chart feed client left");
                    break;
                }
                Some(Ok(_)) => {} // text/binary/pong: nothing expected here
                Some(Err(e)) => {
                    warn!(error = %e, "chart feed read error");
                    break;
                }
            }
        }
    }
}

/// Send the current snapshot, counting it in `ws_sequence_number`.
///
/// A snapshot that fails to serialize is logged and skipped rather than
/// killing the connection; only transport errors propagate.
async fn push_snapshot<S>(sink: &mut S, state: &Arc<AppState>) -> Result<(), axum::Error>
where
    S: futures_util::Sink<Message, Error = axum::Error> + Unpin,
{
    use futures_util::SinkExt;

    state
        .ws_sequence_number
        .fetch_add(1, std::sync::atomic::Ordering::Relaxed);

    let snapshot = state.build_snapshot();
    let json = match serde_json::to_string(&snapshot) {
        Ok(json) => json,
        Err(e) => {
            warn!(error = %e, "chart snapshot did not serialize");
            return Ok(());
        }
    };

    sink.send(Message::Text(json)).await?;
    debug!(version = snapshot.state_version, "chart snapshot pushed");
    Ok(())
}
