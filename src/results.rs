use crate::progress::format_bytes;
use chrono::{DateTime, Utc};
use std::path::PathBuf;

/// Outcome of one model entry. Produced exactly once per entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadResult {
    pub model_name: String,
    pub category: String,
    pub success: bool,
    /// Not transferred: either already on disk or gated without access
    pub skipped: bool,
    pub error: Option<String>,
    pub path: Option<PathBuf>,
    pub bytes: Option<u64>,
}

impl DownloadResult {
    #[must_use]
    pub fn succeeded(
        model_name: impl Into<String>,
        category: impl Into<String>,
        path: PathBuf,
        bytes: u64,
        already_present: bool,
    ) -> Self {
        Self {
            model_name: model_name.into(),
            category: category.into(),
            success: true,
            skipped: already_present,
            error: None,
            path: Some(path),
            bytes: Some(bytes),
        }
    }

    #[must_use]
    pub fn failed(
        model_name: impl Into<String>,
        category: impl Into<String>,
        error: impl Into<String>,
        skipped: bool,
    ) -> Self {
        Self {
            model_name: model_name.into(),
            category: category.into(),
            success: false,
            skipped,
            error: Some(error.into()),
            path: None,
            bytes: None,
        }
    }

    /// Dry-run outcome: the entry parsed and would have been dispatched
    #[must_use]
    pub fn validated(model_name: impl Into<String>, category: impl Into<String>) -> Self {
        Self {
            model_name: model_name.into(),
            category: category.into(),
            success: true,
            skipped: false,
            error: None,
            path: None,
            bytes: None,
        }
    }

    #[must_use]
    pub fn key(&self) -> String {
        format!("{}/{}", self.category, self.model_name)
    }
}

/// Aggregate of a whole run
#[derive(Debug, Clone)]
pub struct ProvisioningSummary {
    pub results: Vec<DownloadResult>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub dry_run: bool,
}

impl ProvisioningSummary {
    #[must_use]
    pub fn new(results: Vec<DownloadResult>, started_at: DateTime<Utc>, dry_run: bool) -> Self {
        Self {
            results,
            started_at,
            finished_at: Utc::now(),
            dry_run,
        }
    }

    #[must_use]
    pub fn total(&self) -> usize {
        self.results.len()
    }

    #[must_use]
    pub fn succeeded(&self) -> usize {
        self.results.iter().filter(|r| r.success).count()
    }

    #[must_use]
    pub fn failed(&self) -> usize {
        self.results.iter().filter(|r| !r.success).count()
    }

    #[must_use]
    pub fn skipped(&self) -> usize {
        self.results.iter().filter(|r| r.skipped).count()
    }

    #[must_use]
    pub fn bytes(&self) -> u64 {
        self.results.iter().filter_map(|r| r.bytes).sum()
    }

    /// Percentage of successful results; 100 for an empty run
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn success_rate(&self) -> f64 {
        if self.results.is_empty() {
            100.0
        } else {
            self.succeeded() as f64 * 100.0 / self.total() as f64
        }
    }

    /// A run succeeds iff no entry failed
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.failed() == 0
    }

    #[must_use]
    pub fn duration(&self) -> chrono::Duration {
        self.finished_at - self.started_at
    }

    pub fn log(&self) {
        let mode = if self.dry_run { " (dry run)" } else { "" };
        tracing::info!("==================== Provisioning summary{mode} ====================");
        tracing::info!(
            "Total: {}  Succeeded: {}  Failed: {}  Skipped: {}",
            self.total(),
            self.succeeded(),
            self.failed(),
            self.skipped()
        );
        tracing::info!(
            "Success rate: {:.1}%  Downloaded: {}  Duration: {}s",
            self.success_rate(),
            format_bytes(self.bytes()),
            self.duration().num_seconds()
        );

        // Reasons were logged when each entry finished
        for result in self.results.iter().filter(|r| !r.success) {
            let skipped = if result.skipped { " (skipped)" } else { "" };
            tracing::error!("  FAILED {}{skipped}", result.key());
        }
        tracing::info!("Finished at {}", self.finished_at.to_rfc3339());
    }
}
