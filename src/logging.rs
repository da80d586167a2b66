// =============================================================================
// Log timestamp formatting in the exchange timezone
// =============================================================================

use chrono::Utc;
use chrono_tz::Tz;
use tracing_subscriber::fmt::format::Writer;
use tracing_subscriber::fmt::time::FormatTime;

/// `tracing_subscriber` timer that renders `dd.mm.yyyy HH:MM:SS` in a fixed
/// timezone, so log lines line up with exchange-local bar times.
pub struct TzTimer {
    tz: Tz,
}

impl TzTimer {
    pub fn new(tz: Tz) -> Self {
        Self { tz }
    }
}

impl FormatTime for TzTimer {
    fn format_time(&self, w: &mut Writer<'_>) -> std::fmt::Result {
        write!(
            w,
            "{}",
            Utc::now().with_timezone(&self.tz).format("%d.%m.%Y %H:%M:%S")
        )
    }
}
