//! Progress reporting surface consumed by whatever front end observes the
//! upload list.

use crate::queue::ItemSnapshot;
use tracing::debug;

/// Receives a fresh snapshot of the upload list on every refresh tick and
/// after state changes worth redrawing.
pub trait ProgressObserver: Send + Sync {
    fn refresh(&self, items: &[ItemSnapshot]);
}

/// No-op observer for headless runs and tests.
pub struct NoopObserver;

impl ProgressObserver for NoopObserver {
    fn refresh(&self, _items: &[ItemSnapshot]) {}
}

/// Observer that mirrors the list into the log.
pub struct LogObserver;

impl ProgressObserver for LogObserver {
    fn refresh(&self, items: &[ItemSnapshot]) {
        for item in items {
            debug!(
                target: "queue",
                path = %item.abs_path.display(),
                state = item.state.text(),
                progress = %item.progress,
                "upload item"
            );
        }
    }
}

/// Percent display for a file that has `done` of `total` chunks accepted.
pub fn percent_text(done: u64, total: u64) -> String {
    if total == 0 {
        return "100.00%".to_string();
    }
    format!("{:.2}%", done as f64 * 100.0 / total as f64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn percent_formats_two_decimals() {
        assert_eq!(percent_text(0, 3), "0.00%");
        assert_eq!(percent_text(1, 3), "33.33%");
        assert_eq!(percent_text(3, 3), "100.00%");
        assert_eq!(percent_text(0, 0), "100.00%");
    }
}
