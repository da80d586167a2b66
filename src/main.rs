// =============================================================================
// stockwatch — Main Entry Point
// =============================================================================
//
// Real-time price/capitalization logger for one MOEX-listed stock: resolves
// the ticker through the Tinkoff Invest gateway, subscribes to intraday bars
// over the Alor WebSocket, and serves a live chart on an embedded dashboard.
// =============================================================================

// ── Module declarations ──────────────────────────────────────────────────────
mod alor;
mod api;
mod app_state;
mod logging;
mod monitor;
mod render;
mod runtime_config;
mod tinkoff;
mod types;

use std::io::Write;
use std::sync::Arc;

use anyhow::Context;
use chrono::Utc;
use chrono_tz::Tz;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::alor::stream::{run_bar_stream, BarDeduper, StreamConfig};
use crate::alor::TokenProvider;
use crate::app_state::AppState;
use crate::logging::TzTimer;
use crate::monitor::{ExchangeClock, StockMonitor};
use crate::render::DashboardRenderer;
use crate::runtime_config::RuntimeConfig;
use crate::tinkoff::{RateLimitTracker, TinkoffClient};
use crate::types::EXCHANGE_TZ;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Environment & config ──────────────────────────────────────────
    let _ = dotenv::dotenv();

    let config_result = RuntimeConfig::load("stockwatch.json");
    let config = config_result.as_ref().ok().cloned().unwrap_or_default();

    let log_tz: Tz = config.log_timezone.parse().unwrap_or(EXCHANGE_TZ);
    tracing_subscriber::fmt()
        .with_timer(TzTimer::new(log_tz))
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    if let Err(e) = config_result {
        warn!(error = %e, "failed to load config, using defaults");
    }

    info!("╔══════════════════════════════════════════════════════════╗");
    info!("║        stockwatch — Starting Up                          ║");
    info!("╚══════════════════════════════════════════════════════════╝");

    // ── 2. Ticker & credentials ──────────────────────────────────────────
    let symbol = match std::env::var("STOCKWATCH_SYMBOL") {
        Ok(s) if !s.trim().is_empty() => s.trim().to_uppercase(),
        _ => prompt_for_ticker()?,
    };
    info!(symbol = %symbol, exchange = %config.exchange, "watching instrument");

    let alor_refresh_token =
        std::env::var("ALOR_REFRESH_TOKEN").context("ALOR_REFRESH_TOKEN is not set")?;
    let tinkoff_token = std::env::var("TINKOFF_TOKEN").context("TINKOFF_TOKEN is not set")?;

    // ── 3. Build shared state & clients ──────────────────────────────────
    let rate_limits = Arc::new(RateLimitTracker::new());
    let tinkoff = Arc::new(TinkoffClient::new(tinkoff_token, rate_limits.clone()));
    let state = Arc::new(AppState::new(config.clone(), rate_limits));
    let renderer = Arc::new(DashboardRenderer::new(state.clone()));

    // ── 4. Initialize the monitor (fatal on failure) ─────────────────────
    let mut monitor = match StockMonitor::initialize(
        &symbol,
        &config.exchange,
        tinkoff.clone(),
        tinkoff,
        renderer,
        Arc::new(ExchangeClock),
    )
    .await
    {
        Ok(m) => m,
        Err(e) => {
            error!(error = %e, "initialization failed");
            return Err(e.into());
        }
    };
    *state.instrument.write() = Some(monitor.instrument().clone());
    state.increment_version();

    // ── 5. Start the dashboard server ────────────────────────────────────
    let api_state = state.clone();
    let bind_addr = config.bind_addr.clone();
    tokio::spawn(async move {
        let app = api::rest::router(api_state);
        let listener = tokio::net::TcpListener::bind(&bind_addr)
            .await
            .expect("failed to bind dashboard server");
        info!(addr = %bind_addr, "dashboard listening");
        axum::serve(listener, app).await.expect("dashboard server failed");
    });

    // ── 6. Spawn the bar stream (reconnect loop) ─────────────────────────
    let (event_tx, mut event_rx) = tokio::sync::mpsc::channel(64);
    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);

    let stream_config = StreamConfig {
        exchange: config.exchange.clone(),
        symbol: symbol.clone(),
        timeframe_secs: config.timeframe_secs,
        from_unix: (Utc::now() - chrono::Duration::days(config.history_days)).timestamp(),
        frequency: config.throttle_frequency,
    };
    let tokens = TokenProvider::new(alor_refresh_token);
    let stream_state = state.clone();
    let mut stream_shutdown = shutdown_rx;

    tokio::spawn(async move {
        let mut deduper = BarDeduper::new();
        loop {
            match run_bar_stream(
                &stream_config,
                &tokens,
                &mut deduper,
                &event_tx,
                &mut stream_shutdown,
            )
            .await
            {
                Ok(()) => break, // clean unsubscribe
                Err(e) => {
                    error!(error = %e, "bar stream error — reconnecting in 5s");
                    stream_state.push_error(format!("bar stream: {e}"));
                }
            }
            if *stream_shutdown.borrow() {
                break;
            }
            tokio::time::sleep(tokio::time::Duration::from_secs(5)).await;
        }
        // event_tx drops here, which ends the monitor loop below.
    });

    info!("all subsystems running. Press Ctrl+C to stop.");

    // ── 7. Serialized monitor loop + graceful shutdown ───────────────────
    loop {
        tokio::select! {
            maybe_event = event_rx.recv() => match maybe_event {
                Some(event) => {
                    monitor.on_bar(event).await;
                    *state.instrument.write() = Some(monitor.instrument().clone());
                }
                None => break,
            },
            _ = tokio::signal::ctrl_c() => {
                warn!("shutdown signal received — stopping gracefully");
                let _ = shutdown_tx.send(true);
            }
        }
    }

    info!("stockwatch shut down complete.");
    Ok(())
}

fn prompt_for_ticker() -> anyhow::Result<String> {
    print!("Enter a ticker (e.g. SBER): ");
    std::io::stdout().flush().context("failed to flush stdout")?;

    let mut line = String::new();
    std::io::stdin()
        .read_line(&mut line)
        .context("failed to read ticker from stdin")?;

    let symbol = line.trim().to_uppercase();
    if symbol.is_empty() {
        anyhow::bail!("no ticker given");
    }
    Ok(symbol)
}
