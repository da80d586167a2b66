// =============================================================================
// Rate-Limit Tracker — monitors Invest gateway quota to avoid 429s
// =============================================================================
//
// The Tinkoff Invest REST gateway reports its per-minute quota in the
// `x-ratelimit-limit` / `x-ratelimit-remaining` response headers. The tracker
// keeps atomic counters that any task may query lock-free; when the remaining
// quota runs out, non-essential requests (the per-bar candle fetch) are
// blocked locally and the monitor degrades to an empty volume profile.
// =============================================================================

use std::sync::atomic::{AtomicI64, Ordering};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Remaining-quota level at which a warning is logged.
const REMAINING_WARN_THRESHOLD: i64 = 10;

/// Counter value meaning "no header seen yet".
const UNKNOWN: i64 = -1;

/// Thread-safe quota tracker backed by atomic counters.
pub struct RateLimitTracker {
    limit: AtomicI64,
    remaining: AtomicI64,
}

/// Immutable snapshot of the current quota state for the dashboard payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitSnapshot {
    pub limit: Option<i64>,
    pub remaining: Option<i64>,
}

impl RateLimitTracker {
    pub fn new() -> Self {
        Self {
            limit: AtomicI64::new(UNKNOWN),
            remaining: AtomicI64::new(UNKNOWN),
        }
    }

    /// Update counters from the gateway's response headers.
    pub fn update_from_headers(&self, headers: &reqwest::header::HeaderMap) {
        if let Some(limit) = header_i64(headers, "x-ratelimit-limit") {
            self.limit.store(limit, Ordering::Relaxed);
        }

        if let Some(remaining) = header_i64(headers, "x-ratelimit-remaining") {
            let prev = self.remaining.swap(remaining, Ordering::Relaxed);
            if remaining <= REMAINING_WARN_THRESHOLD
                && (prev > REMAINING_WARN_THRESHOLD || prev == UNKNOWN)
            {
                warn!(remaining, "rate-limit quota running low");
            }
            debug!(remaining, "rate-limit quota updated from header");
        }
    }

    /// Return `true` if a non-essential request may still be sent. Before the
    /// first response the quota is unknown and requests are allowed.
    pub fn can_spend(&self) -> bool {
        let remaining = self.remaining.load(Ordering::Relaxed);
        let allowed = remaining == UNKNOWN || remaining > 0;
        if !allowed {
            warn!("request blocked locally — rate-limit quota exhausted");
        }
        allowed
    }

    pub fn snapshot(&self) -> RateLimitSnapshot {
        let to_opt = |v: i64| if v == UNKNOWN { None } else { Some(v) };
        RateLimitSnapshot {
            limit: to_opt(self.limit.load(Ordering::Relaxed)),
            remaining: to_opt(self.remaining.load(Ordering::Relaxed)),
        }
    }
}

impl Default for RateLimitTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for RateLimitTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimitTracker")
            .field("limit", &self.limit.load(Ordering::Relaxed))
            .field("remaining", &self.remaining.load(Ordering::Relaxed))
            .finish()
    }
}

fn header_i64(headers: &reqwest::header::HeaderMap, name: &str) -> Option<i64> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::{HeaderMap, HeaderValue};

    fn headers(limit: &str, remaining: &str) -> HeaderMap {
        let mut map = HeaderMap::new();
        map.insert("x-ratelimit-limit", HeaderValue::from_str(limit).unwrap());
        map.insert(
            "x-ratelimit-remaining",
            HeaderValue::from_str(remaining).unwrap(),
        );
        map
    }

    #[test]
    fn unknown_quota_allows_requests() {
        let tracker = RateLimitTracker::new();
        assert!(tracker.can_spend());
        assert_eq!(tracker.snapshot().remaining, None);
    }

    #[test]
    fn updates_counters_from_headers() {
        let tracker = RateLimitTracker::new();
        tracker.update_from_headers(&headers("200", "143"));

        let snap = tracker.snapshot();
        assert_eq!(snap.limit, Some(200));
        assert_eq!(snap.remaining, Some(143));
        assert!(tracker.can_spend());
    }

    #[test]
    fn exhausted_quota_blocks_requests() {
        let tracker = RateLimitTracker::new();
        tracker.update_from_headers(&headers("200", "0"));
        assert!(!tracker.can_spend());

        // Quota came back on the next response.
        tracker.update_from_headers(&headers("200", "200"));
        assert!(tracker.can_spend());
    }

    #[test]
    fn garbage_header_is_ignored() {
        let tracker = RateLimitTracker::new();
        tracker.update_from_headers(&headers("200", "abc"));
        assert_eq!(tracker.snapshot().remaining, None);
    }
}
