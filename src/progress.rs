//! Progress percentages reported while a job runs.
//!
//! Submission and draining use fixed checkpoints; polling maps elapsed time
//! linearly into the 30..=90 band.

use std::time::Duration;

pub const SUBMITTING: u8 = 10;
pub const SUBMITTED: u8 = 30;
pub const POLLING_CEILING: u8 = 90;
pub const COMPLETE: u8 = 100;

/// Progress estimate while polling: `min(90, 30 + elapsed / max_wait * 60)`.
pub fn polling_progress(elapsed: Duration, max_wait: Duration) -> u8 {
    let max = max_wait.as_secs_f64();
    if max <= 0.0 {
        return POLLING_CEILING;
    }
    let pct = f64::from(SUBMITTED) + elapsed.as_secs_f64() / max * 60.0;
    pct.min(f64::from(POLLING_CEILING)) as u8
}

/// Keeps reported progress non-decreasing and within 0..=100.
#[derive(Debug, Default, Clone, Copy)]
pub struct ProgressTracker {
    last: u8,
}

impl ProgressTracker {
    /// Returns the value to report: `pct`, unless an earlier report was higher.
    pub fn advance(&mut self, pct: u8) -> u8 {
        self.last = self.last.max(pct.min(COMPLETE));
        self.last
    }
}
