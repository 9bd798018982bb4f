//! Byte-level progress for concurrent downloads
//!
//! The tracker is shared by every download task. Each task opens a
//! [`ProgressHandle`] for its model; the handle counts toward the in-flight
//! total until it is dropped. State here is advisory and never decides whether
//! a download succeeded.

use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferStatus {
    Active,
    Completed,
    Failed,
}

#[derive(Debug, Clone)]
pub struct TransferState {
    pub downloaded: u64,
    pub total: Option<u64>,
    pub status: TransferStatus,
    pub started: Instant,
}

impl TransferState {
    #[must_use]
    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }
}

/// Totals across all transfers seen so far
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Overview {
    pub active: usize,
    pub completed: usize,
    pub failed: usize,
    pub bytes: u64,
}

#[derive(Debug, Default)]
struct Inner {
    transfers: HashMap<String, TransferState>,
    in_flight: usize,
    peak_in_flight: usize,
}

#[derive(Clone)]
pub struct ProgressTracker {
    inner: Arc<Mutex<Inner>>,
    bars: Option<MultiProgress>,
}

impl std::fmt::Debug for ProgressTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProgressTracker")
            .field("overview", &self.overview())
            .field("bars", &self.bars.is_some())
            .finish()
    }
}

impl Default for ProgressTracker {
    fn default() -> Self {
        Self::hidden()
    }
}

impl ProgressTracker {
    /// Tracker that renders console bars when `show_bars` is set
    #[must_use]
    pub fn new(show_bars: bool) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner::default())),
            bars: show_bars.then(MultiProgress::new),
        }
    }

    /// Tracker without console output
    #[must_use]
    pub fn hidden() -> Self {
        Self::new(false)
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Start tracking a transfer for `key`
    pub fn track(&self, key: &str) -> ProgressHandle {
        {
            let mut inner = self.lock();
            inner.transfers.insert(
                key.to_string(),
                TransferState {
                    downloaded: 0,
                    total: None,
                    status: TransferStatus::Active,
                    started: Instant::now(),
                },
            );
            inner.in_flight += 1;
            inner.peak_in_flight = inner.peak_in_flight.max(inner.in_flight);
        }

        let bar = self.bars.as_ref().map(|multi| {
            let bar = multi.add(ProgressBar::new(0));
            let style = ProgressStyle::default_bar()
                .template("{msg:32!} [{bar:30.cyan/blue}] {bytes}/{total_bytes} {bytes_per_sec} ({eta})")
                .map_or_else(|_| ProgressStyle::default_bar(), |s| s.progress_chars("#>-"));
            bar.set_style(style);
            bar.set_message(key.to_string());
            bar
        });

        ProgressHandle {
            tracker: self.clone(),
            key: key.to_string(),
            bar,
            downloaded: 0,
            total: None,
            logged_decile: 0,
            finished: false,
        }
    }

    #[must_use]
    pub fn overview(&self) -> Overview {
        let inner = self.lock();
        let mut overview = Overview::default();
        for state in inner.transfers.values() {
            overview.bytes += state.downloaded;
            match state.status {
                TransferStatus::Active => overview.active += 1,
                TransferStatus::Completed => overview.completed += 1,
                TransferStatus::Failed => overview.failed += 1,
            }
        }
        overview
    }

    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.lock().in_flight
    }

    /// Highest number of transfers that were open at the same time
    #[must_use]
    pub fn peak_in_flight(&self) -> usize {
        self.lock().peak_in_flight
    }

    #[must_use]
    pub fn state(&self, key: &str) -> Option<TransferState> {
        self.lock().transfers.get(key).cloned()
    }

    fn update(&self, key: &str, downloaded: u64, total: Option<u64>) {
        if let Some(state) = self.lock().transfers.get_mut(key) {
            state.downloaded = downloaded;
            state.total = total;
        }
    }

    fn close(&self, key: &str, status: TransferStatus) {
        let mut inner = self.lock();
        if let Some(state) = inner.transfers.get_mut(key) {
            state.status = status;
        }
        inner.in_flight = inner.in_flight.saturating_sub(1);
    }
}

/// Progress of one model's transfer.
///
/// Dropping a handle without calling [`finish`](Self::finish) marks the
/// transfer failed.
pub struct ProgressHandle {
    tracker: ProgressTracker,
    key: String,
    bar: Option<ProgressBar>,
    downloaded: u64,
    total: Option<u64>,
    logged_decile: u64,
    finished: bool,
}

impl ProgressHandle {
    pub fn set_total(&mut self, total: u64) {
        self.total = Some(total);
        if let Some(bar) = &self.bar {
            bar.set_length(total);
        }
        self.tracker.update(&self.key, self.downloaded, self.total);
    }

    /// Grow the expected size, for transfers made of several files
    pub fn add_total(&mut self, extra: u64) {
        self.set_total(self.total.unwrap_or(0) + extra);
    }

    pub fn advance(&mut self, bytes: u64) {
        self.downloaded += bytes;
        if let Some(bar) = &self.bar {
            bar.set_position(self.downloaded);
        }
        self.tracker.update(&self.key, self.downloaded, self.total);

        if let Some(total) = self.total.filter(|t| *t > 0) {
            let decile = (self.downloaded.saturating_mul(10) / total).min(10);
            if decile > self.logged_decile {
                self.logged_decile = decile;
                tracing::debug!(
                    "{}: {}% ({} / {})",
                    self.key,
                    decile * 10,
                    format_bytes(self.downloaded),
                    format_bytes(total)
                );
            }
        }
    }

    #[must_use]
    pub const fn downloaded(&self) -> u64 {
        self.downloaded
    }

    #[must_use]
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Mark the transfer complete
    pub fn finish(mut self) {
        self.finished = true;
        if let Some(bar) = &self.bar {
            bar.finish_with_message(format!("{} done", self.key));
        }
    }
}

impl Drop for ProgressHandle {
    fn drop(&mut self) {
        let status = if self.finished {
            TransferStatus::Completed
        } else {
            if let Some(bar) = &self.bar {
                bar.abandon_with_message(format!("{} failed", self.key));
            }
            TransferStatus::Failed
        };
        self.tracker.close(&self.key, status);
    }
}

/// Byte count with a binary unit, e.g. `6.46 GB` for a checkpoint
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: [(&str, u64); 3] = [("GB", 1 << 30), ("MB", 1 << 20), ("KB", 1 << 10)];

    UNITS
        .iter()
        .find(|(_, size)| bytes >= *size)
        .map_or_else(
            || format!("{bytes} B"),
            |(unit, size)| format!("{:.2} {unit}", bytes as f64 / *size as f64),
        )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(0), "0 B");
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(1023), "1023 B");
        assert_eq!(format_bytes(1024), "1.00 KB");
        assert_eq!(format_bytes(1536), "1.50 KB");
        assert_eq!(format_bytes(1_048_575), "1024.00 KB");
        assert_eq!(format_bytes(1_048_576), "1.00 MB");
        assert_eq!(format_bytes(334_641_164), "319.14 MB");
        assert_eq!(format_bytes(1_073_741_824), "1.00 GB");
        assert_eq!(format_bytes(6_938_078_334), "6.46 GB");
    }

    #[test]
    fn test_handle_lifecycle() {
        let tracker = ProgressTracker::hidden();
        let mut handle = tracker.track("lora/style");
        handle.set_total(100);
        handle.advance(40);
        handle.advance(60);

        let state = tracker.state("lora/style").unwrap();
        assert_eq!(state.downloaded, 100);
        assert_eq!(state.total, Some(100));
        assert_eq!(state.status, TransferStatus::Active);
        assert_eq!(tracker.in_flight(), 1);

        handle.finish();
        assert_eq!(tracker.in_flight(), 0);
        assert_eq!(
            tracker.state("lora/style").unwrap().status,
            TransferStatus::Completed
        );
    }

    #[test]
    fn test_drop_without_finish_marks_failed() {
        let tracker = ProgressTracker::hidden();
        {
            let mut handle = tracker.track("vae/fix");
            handle.advance(5);
        }
        assert_eq!(
            tracker.state("vae/fix").unwrap().status,
            TransferStatus::Failed
        );
        let overview = tracker.overview();
        assert_eq!(overview.failed, 1);
        assert_eq!(overview.bytes, 5);
    }

    #[test]
    fn test_peak_in_flight() {
        let tracker = ProgressTracker::hidden();
        let a = tracker.track("a");
        let b = tracker.track("b");
        drop(a);
        let c = tracker.track("c");
        assert_eq!(tracker.in_flight(), 2);
        c.finish();
        b.finish();
        assert_eq!(tracker.in_flight(), 0);
        assert_eq!(tracker.peak_in_flight(), 2);
        assert_eq!(
            tracker.overview(),
            Overview {
                active: 0,
                completed: 2,
                failed: 1,
                bytes: 0
            }
        );
    }

    #[test]
    fn test_add_total() {
        let tracker = ProgressTracker::hidden();
        let mut handle = tracker.track("snapshot");
        handle.add_total(10);
        handle.add_total(15);
        assert_eq!(tracker.state("snapshot").unwrap().total, Some(25));
        handle.finish();
    }
}
