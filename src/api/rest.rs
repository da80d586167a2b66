// =============================================================================
// REST API Endpoints — Axum 0.7
// =============================================================================
//
// The dashboard is the chart window: `GET /` serves an embedded page that
// draws the price series over the WebSocket feed. All JSON endpoints live
// under `/api/v1/`. The server binds to localhost by default and carries no
// auth layer; CORS is permissive for development.
// =============================================================================

use std::sync::Arc;

use axum::{
    extract::State,
    response::{Html, IntoResponse},
    routing::get,
    Json, Router,
};
use serde::Serialize;
use tower_http::cors::{Any, CorsLayer};

use crate::app_state::AppState;

/// Build the full REST API router with CORS middleware and shared state.
pub fn router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/", get(index))
        .route("/api/v1/health", get(health))
        .route("/api/v1/chart", get(chart))
        .route("/api/v1/errors", get(errors))
        // ── WebSocket (handled in the ws module but mounted here) ────
        .route("/api/v1/ws", get(crate::api::ws::ws_handler))
        .layer(cors)
        .with_state(state)
}

async fn index() -> Html<&'static str> {
    Html(INDEX_HTML)
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    state_version: u64,
    server_time: i64,
}

async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok",
        state_version: state.current_state_version(),
        server_time: chrono::Utc::now().timestamp_millis(),
    })
}

/// Full snapshot: chart frame, instrument, rate limits, error ring.
async fn chart(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.build_snapshot())
}

async fn errors(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.recent_errors.read().clone())
}

const INDEX_HTML: &str = r#"<!DOCTYPE html>
<html lang="en">
<head>
<meta charset="utf-8">
<title>stockwatch</title>
<style>
  body { background: #101418; color: #d7dde4; font-family: monospace; margin: 2rem; }
  h1 { font-size: 1.2rem; margin: 0; }
  #subtitle { color: #7d8794; margin: 0.2rem 0 1rem; }
  #readouts { margin: 0.8rem 0; }
  #readouts span { margin-right: 2rem; }
  canvas { background: #161b22; border: 1px solid #2b3440; width: 100%; height: 420px; }
  #status { color: #7d8794; margin-top: 0.6rem; }
</style>
</head>
<body>
<h1 id="title">stockwatch</h1>
<p id="subtitle"></p>
<div id="readouts">
  <span>cap: <b id="cap">—</b></span>
  <span>day volume (lots): <b id="vol">—</b></span>
</div>
<canvas id="chart" width="1200" height="420"></canvas>
<p id="status">connecting…</p>
<script>
const canvas = document.getElementById('chart');
const ctx = canvas.getContext('2d');

function draw(points) {
  ctx.clearRect(0, 0, canvas.width, canvas.height);
  if (points.length < 1) return;
  const prices = points.map(p => p.price);
  let lo = Math.min(...prices), hi = Math.max(...prices);
  if (hi === lo) { hi += 0.5; lo -= 0.5; }
  const padX = 48, padY = 16;
  const w = canvas.width - padX - 8, h = canvas.height - 2 * padY;
  const x = i => padX + (points.length === 1 ? 0 : i / (points.length - 1) * w);
  const y = p => padY + (hi - p) / (hi - lo) * h;

  ctx.strokeStyle = '#2b3440';
  ctx.fillStyle = '#7d8794';
  ctx.font = '11px monospace';
  for (let g = 0; g <= 4; g++) {
    const price = hi - g / 4 * (hi - lo);
    const gy = y(price);
    ctx.beginPath(); ctx.moveTo(padX, gy); ctx.lineTo(padX + w, gy); ctx.stroke();
    ctx.fillText(price.toFixed(2), 2, gy + 4);
  }

  ctx.strokeStyle = '#4ea1ff';
  ctx.lineWidth = 1.5;
  ctx.beginPath();
  points.forEach((p, i) => i ? ctx.lineTo(x(i), y(p.price)) : ctx.moveTo(x(i), y(p.price)));
  ctx.stroke();

  const last = points[points.length - 1];
  ctx.fillStyle = '#d7dde4';
  ctx.fillText(last.label + '  ' + last.price.toFixed(2), x(points.length - 1) - 60, y(last.price) - 8);
}

function apply(snapshot) {
  const frame = snapshot.chart;
  if (!frame) return;
  document.getElementById('title').textContent = frame.title;
  document.getElementById('subtitle').textContent = frame.subtitle;
  document.getElementById('cap').textContent =
    frame.capitalization == null ? '—' : frame.capitalization.toLocaleString('ru-RU', {maximumFractionDigits: 2}) + ' RUB';
  document.getElementById('vol').textContent = frame.day_volume.toLocaleString('ru-RU');
  draw(frame.points);
}

function connect() {
  const ws = new WebSocket((location.protocol === 'https:' ? 'wss://' : 'ws://') + location.host + '/api/v1/ws');
  ws.onopen = () => { document.getElementById('status').textContent = 'live'; };
  ws.onmessage = e => apply(JSON.parse(e.data));
  ws.onclose = () => {
    document.getElementById('status').textContent = 'disconnected — retrying';
    setTimeout(connect, 2000);
  };
}
connect();
</script>
</body>
</html>
"#;
