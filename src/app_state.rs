// =============================================================================
// Central Application State — shared between the monitor loop and dashboard
// =============================================================================
//
// Single source of truth for everything the dashboard can see: the latest
// chart frame, the resolved instrument, the recent error ring, and the
// gateway rate-limit counters.
//
// Thread safety:
//   - Atomic counters for lock-free version tracking.
//   - parking_lot::RwLock for mutable shared values.
// =============================================================================

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::Utc;
use parking_lot::RwLock;
use serde::Serialize;

use crate::runtime_config::RuntimeConfig;
use crate::tinkoff::rate_limit::{RateLimitSnapshot, RateLimitTracker};
use crate::types::{ChartFrame, Instrument};

/// Maximum number of recent errors to retain.
const MAX_RECENT_ERRORS: usize = 50;

/// A recorded error event for the dashboard error log.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorRecord {
    /// Human-readable error message.
    pub message: String,
    /// Optional machine-readable code (e.g. gateway HTTP status).
    pub code: Option<String>,
    /// ISO 8601 timestamp.
    pub at: String,
}

/// Application state shared across async tasks via `Arc<AppState>`.
pub struct AppState {
    /// Monotonically increasing version counter. Incremented on every
    /// meaningful mutation; the WebSocket feed uses it to detect changes.
    pub state_version: AtomicU64,

    /// WebSocket message sequence number (incremented per message sent).
    pub ws_sequence_number: AtomicU64,

    pub config: RuntimeConfig,

    /// Filled once the monitor initializes; refreshed at most daily.
    pub instrument: RwLock<Option<Instrument>>,

    /// The latest rendered chart frame.
    pub chart: RwLock<Option<ChartFrame>>,

    pub recent_errors: RwLock<Vec<ErrorRecord>>,

    pub rate_limits: Arc<RateLimitTracker>,

    /// Process start, for uptime reporting.
    pub start_time: std::time::Instant,
}

/// Complete serialisable snapshot sent to the dashboard via REST and the
/// WebSocket push feed.
#[derive(Debug, Clone, Serialize)]
pub struct ChartSnapshot {
    pub state_version: u64,
    pub ws_sequence_number: u64,
    pub server_time: i64,
    pub uptime_secs: u64,
    pub exchange: String,
    pub instrument: Option<Instrument>,
    pub chart: Option<ChartFrame>,
    pub rate_limits: RateLimitSnapshot,
    pub recent_errors: Vec<ErrorRecord>,
}

impl AppState {
    pub fn new(config: RuntimeConfig, rate_limits: Arc<RateLimitTracker>) -> Self {
        Self {
            state_version: AtomicU64::new(1),
            ws_sequence_number: AtomicU64::new(0),
            config,
            instrument: RwLock::new(None),
            chart: RwLock::new(None),
            recent_errors: RwLock::new(Vec::new()),
            rate_limits,
            start_time: std::time::Instant::now(),
        }
    }

    // ── Version Management ──────────────────────────────────────────────

    /// Atomically increment the state version. Call after every meaningful
    /// mutation to signal WebSocket clients that fresh data is available.
    pub fn increment_version(&self) -> u64 {
        self.state_version.fetch_add(1, Ordering::SeqCst)
    }

    pub fn current_state_version(&self) -> u64 {
        self.state_version.load(Ordering::SeqCst)
    }

    // ── Error Logging ───────────────────────────────────────────────────

    /// Record an error message. The ring buffer is capped at
    /// [`MAX_RECENT_ERRORS`]; oldest entries are evicted at the limit.
    pub fn push_error(&self, msg: String) {
        self.push_error_with_code(msg, None);
    }

    pub fn push_error_with_code(&self, msg: String, code: Option<String>) {
        let record = ErrorRecord {
            message: msg,
            code,
            at: Utc::now().to_rfc3339(),
        };

        let mut errors = self.recent_errors.write();
        errors.push(record);
        while errors.len() > MAX_RECENT_ERRORS {
            errors.remove(0);
        }
        drop(errors);

        self.increment_version();
    }

    // ── Snapshot Builder ────────────────────────────────────────────────

    pub fn build_snapshot(&self) -> ChartSnapshot {
        ChartSnapshot {
            state_version: self.current_state_version(),
            ws_sequence_number: self.ws_sequence_number.load(Ordering::Relaxed),
            server_time: Utc::now().timestamp_millis(),
            uptime_secs: self.start_time.elapsed().as_secs(),
            exchange: self.config.exchange.clone(),
            instrument: self.instrument.read().clone(),
            chart: self.chart.read().clone(),
            rate_limits: self.rate_limits.snapshot(),
            recent_errors: self.recent_errors.read().clone(),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
