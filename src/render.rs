// =============================================================================
// DashboardRenderer — chart output via the embedded dashboard
// =============================================================================

use std::sync::Arc;

use tracing::debug;

use crate::app_state::AppState;
use crate::monitor::ChartRenderer;
use crate::types::ChartFrame;

/// Renders by publishing the frame into shared state and bumping the state
/// version; the dashboard's WebSocket push loop picks the change up and the
/// browser redraws in place.
pub struct DashboardRenderer {
    state: Arc<AppState>,
}

impl DashboardRenderer {
    pub fn new(state: Arc<AppState>) -> Self {
        Self { state }
    }
}

impl ChartRenderer for DashboardRenderer {
    fn render(&self, frame: ChartFrame) {
        debug!(points = frame.points.len(), "chart frame published");
        *self.state.chart.write() = Some(frame);
        self.state.increment_version();
    }
}
