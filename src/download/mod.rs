pub mod direct;
pub mod hub;
pub mod registry;
pub mod stream;

use crate::config::{ModelEntry, Source};
use crate::error::{DownloadError, Result};
use crate::progress::ProgressTracker;
use crate::settings::Settings;
use async_trait::async_trait;
use std::path::{Path, PathBuf};

pub use direct::DirectDownloader;
pub use hub::HubDownloader;
pub use registry::RegistryDownloader;
pub use stream::TargetClaims;

/// What a successful download left on disk
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadOutcome {
    /// File, or directory for whole-repository snapshots
    pub path: PathBuf,
    pub bytes: u64,
    /// Nothing was transferred because the target already existed
    pub already_present: bool,
}

impl DownloadOutcome {
    #[must_use]
    pub const fn downloaded(path: PathBuf, bytes: u64) -> Self {
        Self {
            path,
            bytes,
            already_present: false,
        }
    }

    #[must_use]
    pub const fn present(path: PathBuf, bytes: u64) -> Self {
        Self {
            path,
            bytes,
            already_present: true,
        }
    }
}

/// Unified interface for model sources
#[async_trait]
pub trait Downloader: Send + Sync {
    /// Fetch `entry` into `target_dir`
    ///
    /// # Errors
    /// Every failure is returned as a `DownloadError`; implementations never
    /// abort the run.
    async fn download(
        &self,
        entry: &ModelEntry,
        target_dir: &Path,
        progress: &ProgressTracker,
    ) -> std::result::Result<DownloadOutcome, DownloadError>;

    /// Source name for logging
    fn name(&self) -> &'static str;
}

/// One downloader per source kind, sharing a single HTTP client
#[derive(Debug)]
pub struct Downloaders {
    hub: HubDownloader,
    registry: RegistryDownloader,
    direct: DirectDownloader,
}

impl Downloaders {
    /// Downloaders for one run; no two entries may write the same target path
    pub fn new(settings: &Settings) -> Result<Self> {
        let client = settings.http_client()?;
        let claims = TargetClaims::default();
        Ok(Self {
            hub: HubDownloader::new(client.clone(), settings).with_claims(claims.clone()),
            registry: RegistryDownloader::new(client.clone(), settings)
                .with_claims(claims.clone()),
            direct: DirectDownloader::new(client, settings).with_claims(claims),
        })
    }

    /// Downloader responsible for `source`; `None` for unresolved sources
    #[must_use]
    pub fn for_source(&self, source: &Source) -> Option<&dyn Downloader> {
        match source {
            Source::Hub { .. } => Some(&self.hub),
            Source::Registry { .. } => Some(&self.registry),
            Source::Direct { .. } => Some(&self.direct),
            Source::Unresolved { .. } => None,
        }
    }
}

/// Routes each entry to the downloader for its source kind
#[async_trait]
impl Downloader for Downloaders {
    async fn download(
        &self,
        entry: &ModelEntry,
        target_dir: &Path,
        progress: &ProgressTracker,
    ) -> std::result::Result<DownloadOutcome, DownloadError> {
        match self.for_source(&entry.source) {
            Some(downloader) => {
                tracing::debug!("{} handled by {} downloader", entry.key(), downloader.name());
                downloader.download(entry, target_dir, progress).await
            }
            None => Err(unresolved(entry)),
        }
    }

    fn name(&self) -> &'static str {
        "dispatch"
    }
}

/// Error for an entry handed to a downloader it does not belong to
pub(crate) fn unresolved(entry: &ModelEntry) -> DownloadError {
    match &entry.source {
        Source::Unresolved { reason } => DownloadError::UnresolvedSource(reason.clone()),
        other => DownloadError::UnresolvedSource(format!(
            "{} cannot be handled here ({})",
            entry.key(),
            other.kind()
        )),
    }
}

/// Bare file name for an entry: configured name, else `fallback`, else `<name>.safetensors`
pub(crate) fn pick_filename(
    entry: &ModelEntry,
    configured: Option<&str>,
    fallback: Option<String>,
) -> String {
    configured
        .and_then(crate::urls::sanitize_filename)
        .or(fallback)
        .or_else(|| crate::urls::sanitize_filename(&format!("{}.safetensors", entry.name)))
        .unwrap_or_else(|| "model.safetensors".to_string())
}
