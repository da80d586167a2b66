// =============================================================================
// StockMonitor — per-bar update pipeline
// =============================================================================
//
// Owns the running price series and the reference-data refresh bookkeeping.
// For every committed bar it: refreshes reference data when stale, appends to
// the series, computes capitalization, re-aggregates the day's minute-bucketed
// traded volume, and hands a complete frame to the renderer.
//
// Error policy: initialization failures are fatal and surface to main; once
// running no error escapes `on_bar` — upstream failures degrade to stale or
// zero data and a log line.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use chrono_tz::Tz;
use tracing::{debug, error, info, warn};

use crate::types::{
    BarEvent, ChartFrame, ChartPoint, Instrument, MinuteCandle, MonitorError, EXCHANGE_TZ,
};

/// Reference data is re-fetched at most once per this interval.
const REFRESH_INTERVAL_HOURS: i64 = 23;

/// Session pre-open in exchange-local time; the daily volume window starts
/// here.
const SESSION_OPEN: (u32, u32) = (6, 50);

// =============================================================================
// Service seams
// =============================================================================

/// Resolves tickers to instruments and supplies last trade prices.
#[async_trait]
pub trait ReferenceData: Send + Sync {
    /// `Ok(None)` means the service answered but knows no such ticker.
    async fn resolve(&self, ticker: &str) -> Result<Option<Instrument>, MonitorError>;
    async fn last_price(&self, figi: &str) -> Result<f64, MonitorError>;
}

/// Supplies minute candles for a FIGI over a UTC time range.
#[async_trait]
pub trait CandleSource: Send + Sync {
    async fn minute_candles(
        &self,
        figi: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<MinuteCandle>, MonitorError>;
}

/// Redraws the chart in place. Side-effecting; no return value is consumed.
pub trait ChartRenderer: Send + Sync {
    fn render(&self, frame: ChartFrame);
}

/// Time source, injectable so the refresh schedule is testable.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Tz>;
}

/// Production clock: wall time in the exchange timezone.
pub struct ExchangeClock;

impl Clock for ExchangeClock {
    fn now(&self) -> DateTime<Tz> {
        Utc::now().with_timezone(&EXCHANGE_TZ)
    }
}

// =============================================================================
// Volume bucketing
// =============================================================================

/// Bucket per-minute volumes by their exchange-local "HH:MM" label.
///
/// A label normally appears once per fetch, but duplicates sum and the result
/// is independent of input order.
pub fn bucket_by_minute(candles: &[MinuteCandle]) -> HashMap<String, u64> {
    let mut buckets: HashMap<String, u64> = HashMap::new();
    for candle in candles {
        let label = candle
            .time
            .with_timezone(&EXCHANGE_TZ)
            .format("%H:%M")
            .to_string();
        *buckets.entry(label).or_insert(0) += candle.volume;
    }
    buckets
}

// =============================================================================
// StockMonitor
// =============================================================================

pub struct StockMonitor {
    exchange: String,
    instrument: Instrument,
    last_refresh: DateTime<Tz>,
    /// (time, close) pairs for the current trading day, append-only until the
    /// first bar of the next calendar day clears it.
    series: Vec<(DateTime<Tz>, f64)>,
    reference: Arc<dyn ReferenceData>,
    candles: Arc<dyn CandleSource>,
    renderer: Arc<dyn ChartRenderer>,
    clock: Arc<dyn Clock>,
}

impl StockMonitor {
    /// Resolve the ticker and fetch its last price. Must succeed before any
    /// bar event is processed; every failure here is fatal.
    pub async fn initialize(
        ticker: &str,
        exchange: &str,
        reference: Arc<dyn ReferenceData>,
        candles: Arc<dyn CandleSource>,
        renderer: Arc<dyn ChartRenderer>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, MonitorError> {
        let ticker = ticker.trim().to_uppercase();

        let instrument = reference
            .resolve(&ticker)
            .await?
            .ok_or_else(|| MonitorError::TickerNotFound(ticker.clone()))?;

        let last_price = reference.last_price(&instrument.figi).await?;

        info!(
            ticker = %instrument.ticker,
            figi = %instrument.figi,
            issue_size = ?instrument.issue_size,
            last_price,
            "instrument initialized"
        );

        Ok(Self {
            exchange: exchange.to_string(),
            instrument,
            last_refresh: clock.now(),
            series: Vec::new(),
            reference,
            candles,
            renderer,
            clock,
        })
    }

    pub fn instrument(&self) -> &Instrument {
        &self.instrument
    }

    /// Handle one committed bar. Never panics and never returns an error; a
    /// single bad event must not tear the stream down.
    pub async fn on_bar(&mut self, event: BarEvent) {
        self.maybe_refresh().await;

        info!(
            "{}.{} | {} | price: {:.2}",
            self.exchange,
            self.instrument.ticker,
            event.time.format("%d.%m.%Y %H:%M"),
            event.close
        );

        // The series keeps only the current trading day; the first bar of a
        // new calendar day starts it over.
        if let Some((last_time, _)) = self.series.last() {
            if last_time.date_naive() != event.time.date_naive() {
                debug!(
                    dropped_points = self.series.len(),
                    "new trading day, resetting price series"
                );
                self.series.clear();
            }
        }
        self.series.push((event.time, event.close));

        let capitalization = self
            .instrument
            .issue_size
            .map(|shares| shares as f64 * event.close);
        if let Some(cap) = capitalization {
            info!("capitalization: {cap:.2} RUB");
        }

        let profile = self.daily_volume(event.time).await;
        let day_volume: u64 = profile.values().sum();
        info!(lots = day_volume, "day traded volume");

        let frame = self.build_frame(event.time, capitalization, day_volume);
        self.renderer.render(frame);
    }

    /// Re-fetch the issued share count if the last successful refresh is 23 h
    /// or more in the past. On failure the stale value is kept and
    /// `last_refresh` does not advance, so the next bar retries naturally.
    async fn maybe_refresh(&mut self) {
        let now = self.clock.now();
        if now - self.last_refresh < Duration::hours(REFRESH_INTERVAL_HOURS) {
            return;
        }

        match self.reference.resolve(&self.instrument.ticker).await {
            Ok(Some(fresh)) => {
                self.instrument.issue_size = fresh.issue_size;
                self.last_refresh = now;
                debug!(issue_size = ?self.instrument.issue_size, "reference data refreshed");
            }
            Ok(None) => {
                error!(
                    ticker = %self.instrument.ticker,
                    "ticker vanished from reference data, keeping stale instrument"
                );
            }
            Err(e) => {
                error!(error = %e, "reference refresh failed, keeping stale data");
            }
        }
    }

    /// Aggregate minute volumes over `[06:50 local, target]` on target's
    /// calendar day. Failures degrade to an empty profile (total 0); an
    /// inverted window (target before pre-open) skips the fetch entirely.
    async fn daily_volume(&self, target: DateTime<Tz>) -> HashMap<String, u64> {
        let start = target
            .date_naive()
            .and_hms_opt(SESSION_OPEN.0, SESSION_OPEN.1, 0)
            .and_then(|naive| naive.and_local_timezone(EXCHANGE_TZ).single());

        let start = match start {
            Some(s) => s,
            None => {
                warn!(target = %target, "could not construct session open time");
                return HashMap::new();
            }
        };

        if target < start {
            debug!(target = %target, "bar before session pre-open, skipping volume fetch");
            return HashMap::new();
        }

        match self
            .candles
            .minute_candles(
                &self.instrument.figi,
                start.with_timezone(&Utc),
                target.with_timezone(&Utc),
            )
            .await
        {
            Ok(candles) => bucket_by_minute(&candles),
            Err(e) => {
                error!(error = %e, "minute candle fetch failed, reporting zero volume");
                HashMap::new()
            }
        }
    }

    fn build_frame(
        &self,
        target: DateTime<Tz>,
        capitalization: Option<f64>,
        day_volume: u64,
    ) -> ChartFrame {
        let points = self
            .series
            .iter()
            .map(|(time, price)| ChartPoint {
                at: time.timestamp_millis(),
                label: time.format("%H:%M").to_string(),
                price: *price,
            })
            .collect();

        ChartFrame {
            title: format!("{} — {}", self.instrument.ticker, target.format("%d.%m.%Y")),
            subtitle: format!("{}.{} close price, RUB", self.exchange, self.instrument.ticker),
            points,
            capitalization,
            day_volume,
            updated_at: Utc::now().to_rfc3339(),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

    fn msk(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> DateTime<Tz> {
        EXCHANGE_TZ.with_ymd_and_hms(y, mo, d, h, mi, 0).unwrap()
    }

    fn bar(time: DateTime<Tz>, close: f64) -> BarEvent {
        BarEvent { time, close }
    }

    // ── Fakes ────────────────────────────────────────────────────────────

    struct FakeReference {
        instrument: Mutex<Option<Instrument>>,
        resolve_calls: AtomicU32,
        fail: AtomicBool,
    }

    impl FakeReference {
        fn with(ticker: &str, figi: &str, issue_size: Option<u64>) -> Arc<Self> {
            Arc::new(Self {
                instrument: Mutex::new(Some(Instrument {
                    ticker: ticker.into(),
                    figi: figi.into(),
                    issue_size,
                })),
                resolve_calls: AtomicU32::new(0),
                fail: AtomicBool::new(false),
            })
        }

        fn resolve_calls(&self) -> u32 {
            self.resolve_calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl ReferenceData for FakeReference {
        async fn resolve(&self, _ticker: &str) -> Result<Option<Instrument>, MonitorError> {
            self.resolve_calls.fetch_add(1, Ordering::SeqCst);
            if self.fail.load(Ordering::SeqCst) {
                return Err(MonitorError::upstream("fake", "reference down"));
            }
            Ok(self.instrument.lock().clone())
        }

        async fn last_price(&self, _figi: &str) -> Result<f64, MonitorError> {
            Ok(100.0)
        }
    }

    struct FakeCandles {
        candles: Mutex<Vec<MinuteCandle>>,
        calls: AtomicU32,
        fail: AtomicBool,
    }

    impl FakeCandles {
        fn empty() -> Arc<Self> {
            Arc::new(Self {
                candles: Mutex::new(Vec::new()),
                calls: AtomicU32::new(0),
                fail: AtomicBool::new(false),
            })
        }

        fn set(&self, candles: Vec<MinuteCandle>) {
            *self.candles.lock() = candles;
        }
    }

    #[async_trait]
    impl CandleSource for FakeCandles {
        async fn minute_candles(
            &self,
            _figi: &str,
            _from: DateTime<Utc>,
            _to: DateTime<Utc>,
        ) -> Result<Vec<MinuteCandle>, MonitorError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail.load(Ordering::SeqCst) {
                return Err(MonitorError::upstream("fake", "candles down"));
            }
            Ok(self.candles.lock().clone())
        }
    }

    struct CapturingRenderer {
        frames: Mutex<Vec<ChartFrame>>,
    }

    impl CapturingRenderer {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                frames: Mutex::new(Vec::new()),
            })
        }

        fn last(&self) -> ChartFrame {
            self.frames.lock().last().cloned().expect("no frame rendered")
        }
    }

    impl ChartRenderer for CapturingRenderer {
        fn render(&self, frame: ChartFrame) {
            self.frames.lock().push(frame);
        }
    }

    struct ManualClock {
        now: Mutex<DateTime<Tz>>,
    }

    impl ManualClock {
        fn at(now: DateTime<Tz>) -> Arc<Self> {
            Arc::new(Self { now: Mutex::new(now) })
        }

        fn advance_hours(&self, hours: i64) {
            let mut now = self.now.lock();
            *now = *now + Duration::hours(hours);
        }
    }

    impl Clock for ManualClock {
        fn now(&self) -> DateTime<Tz> {
            *self.now.lock()
        }
    }

    struct Harness {
        reference: Arc<FakeReference>,
        candles: Arc<FakeCandles>,
        renderer: Arc<CapturingRenderer>,
        clock: Arc<ManualClock>,
        monitor: StockMonitor,
    }

    async fn harness(issue_size: Option<u64>) -> Harness {
        let reference = FakeReference::with("SBER", "BBG004730N88", issue_size);
        let candles = FakeCandles::empty();
        let renderer = CapturingRenderer::new();
        let clock = ManualClock::at(msk(2026, 8, 27, 10, 0));

        let monitor = StockMonitor::initialize(
            "sber",
            "MOEX",
            reference.clone(),
            candles.clone(),
            renderer.clone(),
            clock.clone(),
        )
        .await
        .expect("initialize");

        Harness {
            reference,
            candles,
            renderer,
            clock,
            monitor,
        }
    }

    // ── Initialization ───────────────────────────────────────────────────

    #[tokio::test]
    async fn initialize_uppercases_ticker_and_resolves_once() {
        let h = harness(Some(1_000_000)).await;
        assert_eq!(h.monitor.instrument().ticker, "SBER");
        assert_eq!(h.monitor.instrument().figi, "BBG004730N88");
        assert_eq!(h.reference.resolve_calls(), 1);
    }

    #[tokio::test]
    async fn initialize_fails_on_unknown_ticker() {
        let reference = FakeReference::with("SBER", "BBG004730N88", None);
        *reference.instrument.lock() = None;

        let result = StockMonitor::initialize(
            "NOPE",
            "MOEX",
            reference,
            FakeCandles::empty(),
            CapturingRenderer::new(),
            ManualClock::at(msk(2026, 8, 27, 10, 0)),
        )
        .await;

        assert!(matches!(result, Err(MonitorError::TickerNotFound(t)) if t == "NOPE"));
    }

    #[tokio::test]
    async fn initialize_fails_on_reference_error() {
        let reference = FakeReference::with("SBER", "BBG004730N88", None);
        reference.fail.store(true, Ordering::SeqCst);

        let result = StockMonitor::initialize(
            "SBER",
            "MOEX",
            reference,
            FakeCandles::empty(),
            CapturingRenderer::new(),
            ManualClock::at(msk(2026, 8, 27, 10, 0)),
        )
        .await;

        assert!(matches!(result, Err(MonitorError::Upstream { .. })));
    }

    // ── Series growth ────────────────────────────────────────────────────

    #[tokio::test]
    async fn series_grows_one_point_per_bar() {
        let mut h = harness(Some(1_000_000)).await;
        for minute in 0..5 {
            h.monitor
                .on_bar(bar(msk(2026, 8, 27, 10, 15 + minute), 250.0 + minute as f64))
                .await;
        }
        assert_eq!(h.renderer.last().points.len(), 5);
    }

    #[tokio::test]
    async fn new_day_resets_series() {
        let mut h = harness(Some(1_000_000)).await;
        h.monitor.on_bar(bar(msk(2026, 8, 27, 18, 40), 250.0)).await;
        h.monitor.on_bar(bar(msk(2026, 8, 28, 10, 0), 251.0)).await;

        let frame = h.renderer.last();
        assert_eq!(frame.points.len(), 1);
        assert_eq!(frame.points[0].label, "10:00");
    }

    // ── Capitalization ───────────────────────────────────────────────────

    #[tokio::test]
    async fn capitalization_is_issue_size_times_close() {
        let mut h = harness(Some(1_000_000)).await;
        h.monitor.on_bar(bar(msk(2026, 8, 27, 10, 15), 250.5)).await;
        assert_eq!(h.renderer.last().capitalization, Some(250_500_000.0));
    }

    #[tokio::test]
    async fn capitalization_omitted_when_issue_size_unknown() {
        let mut h = harness(None).await;
        h.monitor.on_bar(bar(msk(2026, 8, 27, 10, 15), 250.5)).await;
        assert_eq!(h.renderer.last().capitalization, None);
    }

    // ── Refresh schedule ─────────────────────────────────────────────────

    #[tokio::test]
    async fn no_refresh_within_23_hours() {
        let mut h = harness(Some(1_000_000)).await;
        h.clock.advance_hours(22);
        h.monitor.on_bar(bar(msk(2026, 8, 27, 10, 15), 250.0)).await;
        // Only the initialize-time resolve.
        assert_eq!(h.reference.resolve_calls(), 1);
    }

    #[tokio::test]
    async fn refresh_after_23_hours_picks_up_new_issue_size() {
        let mut h = harness(Some(1_000_000)).await;
        h.reference.instrument.lock().as_mut().unwrap().issue_size = Some(2_000_000);
        h.clock.advance_hours(24);

        h.monitor.on_bar(bar(msk(2026, 8, 28, 10, 15), 100.0)).await;
        assert_eq!(h.reference.resolve_calls(), 2);
        assert_eq!(h.renderer.last().capitalization, Some(200_000_000.0));

        // Refresh succeeded, so the next bar stays quiet.
        h.monitor.on_bar(bar(msk(2026, 8, 28, 10, 20), 100.0)).await;
        assert_eq!(h.reference.resolve_calls(), 2);
    }

    #[tokio::test]
    async fn failed_refresh_keeps_stale_data_and_retries_next_bar() {
        let mut h = harness(Some(1_000_000)).await;
        h.reference.fail.store(true, Ordering::SeqCst);
        h.clock.advance_hours(24);

        h.monitor.on_bar(bar(msk(2026, 8, 28, 10, 15), 250.5)).await;
        assert_eq!(h.reference.resolve_calls(), 2);
        // Stale issue_size still in use.
        assert_eq!(h.renderer.last().capitalization, Some(250_500_000.0));

        // last_refresh did not advance, so the next bar retries.
        h.monitor.on_bar(bar(msk(2026, 8, 28, 10, 20), 250.5)).await;
        assert_eq!(h.reference.resolve_calls(), 3);
    }

    // ── Daily volume ─────────────────────────────────────────────────────

    fn minute_candle(h: u32, m: u32, volume: u64) -> MinuteCandle {
        MinuteCandle {
            time: msk(2026, 8, 27, h, m).with_timezone(&Utc),
            volume,
        }
    }

    #[test]
    fn bucketing_is_order_independent_and_sums_duplicates() {
        let candles = vec![
            minute_candle(10, 0, 5),
            minute_candle(10, 1, 7),
            minute_candle(10, 0, 3), // duplicate label
        ];
        let mut permuted = candles.clone();
        permuted.reverse();

        let a = bucket_by_minute(&candles);
        let b = bucket_by_minute(&permuted);

        assert_eq!(a, b);
        assert_eq!(a.get("10:00"), Some(&8));
        assert_eq!(a.get("10:01"), Some(&7));
        assert_eq!(a.values().sum::<u64>(), 15);
    }

    #[test]
    fn bucket_labels_are_exchange_local() {
        // 07:30 UTC is 10:30 in Moscow.
        let candles = vec![MinuteCandle {
            time: Utc.with_ymd_and_hms(2026, 8, 27, 7, 30, 0).unwrap(),
            volume: 1,
        }];
        let buckets = bucket_by_minute(&candles);
        assert_eq!(buckets.get("10:30"), Some(&1));
    }

    #[tokio::test]
    async fn day_volume_sums_fetched_buckets() {
        let mut h = harness(Some(1_000_000)).await;
        h.candles.set(vec![
            minute_candle(9, 59, 100),
            minute_candle(10, 0, 50),
            minute_candle(10, 1, 25),
        ]);
        h.monitor.on_bar(bar(msk(2026, 8, 27, 10, 15), 250.0)).await;
        assert_eq!(h.renderer.last().day_volume, 175);
    }

    #[tokio::test]
    async fn candle_fetch_failure_reports_zero_volume() {
        let mut h = harness(Some(1_000_000)).await;
        h.candles.fail.store(true, Ordering::SeqCst);
        h.monitor.on_bar(bar(msk(2026, 8, 27, 10, 15), 250.0)).await;

        let frame = h.renderer.last();
        assert_eq!(frame.day_volume, 0);
        // The event itself was not dropped.
        assert_eq!(frame.points.len(), 1);
    }

    #[tokio::test]
    async fn bar_before_session_open_skips_volume_fetch() {
        let mut h = harness(Some(1_000_000)).await;
        h.candles.set(vec![minute_candle(6, 30, 999)]);
        h.monitor.on_bar(bar(msk(2026, 8, 27, 6, 30), 250.0)).await;

        assert_eq!(h.candles.calls.load(Ordering::SeqCst), 0);
        assert_eq!(h.renderer.last().day_volume, 0);
    }

    // ── End-to-end scenario ──────────────────────────────────────────────

    #[tokio::test]
    async fn sber_scenario() {
        let reference = FakeReference::with("SBER", "BBG004730N88", Some(21_586_948_000));
        let candles = FakeCandles::empty();
        let renderer = CapturingRenderer::new();
        let clock = ManualClock::at(msk(2026, 8, 27, 10, 0));

        let mut monitor = StockMonitor::initialize(
            "SBER",
            "MOEX",
            reference.clone(),
            candles,
            renderer.clone(),
            clock,
        )
        .await
        .expect("initialize");

        monitor.on_bar(bar(msk(2026, 8, 27, 10, 15), 285.30)).await;
        let cap = renderer.last().capitalization.expect("capitalization");
        let expected = 21_586_948_000.0 * 285.30;
        assert!((cap - expected).abs() / expected < 1e-12);

        monitor.on_bar(bar(msk(2026, 8, 27, 10, 20), 285.00)).await;
        assert_eq!(renderer.last().points.len(), 2);
        // No second reference resolution within 23 h.
        assert_eq!(reference.resolve_calls(), 1);
    }
}
