//! Provisioning run: parse, validate tokens, download concurrently, report
//!
//! Every entry yields exactly one [`DownloadResult`]. A failing or panicking
//! download only fails its own entry.

use crate::config::{self, Config, ModelEntry, Source};
use crate::download::{DownloadOutcome, Downloader, Downloaders};
use crate::error::{DownloadError, Result, Service};
use crate::progress::{format_bytes, ProgressTracker};
use crate::results::{DownloadResult, ProvisioningSummary};
use crate::settings::Settings;
use crate::tokens::{TokenStatus, TokenValidator};
use chrono::Utc;
use futures_util::FutureExt;
use std::any::Any;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

pub struct Provisioner {
    settings: Settings,
    progress: ProgressTracker,
    downloader: Option<Arc<dyn Downloader>>,
}

impl std::fmt::Debug for Provisioner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Provisioner")
            .field("settings", &self.settings)
            .field("progress", &self.progress)
            .finish_non_exhaustive()
    }
}

impl Provisioner {
    #[must_use]
    pub fn new(settings: Settings) -> Self {
        let progress = ProgressTracker::new(settings.show_progress);
        Self {
            settings,
            progress,
            downloader: None,
        }
    }

    /// Route every download through `downloader` instead of the built-in sources
    #[must_use]
    pub fn with_downloader(mut self, downloader: Arc<dyn Downloader>) -> Self {
        self.downloader = Some(downloader);
        self
    }

    #[must_use]
    pub const fn settings(&self) -> &Settings {
        &self.settings
    }

    #[must_use]
    pub const fn progress(&self) -> &ProgressTracker {
        &self.progress
    }

    /// Provision every model described by the config at `source`.
    ///
    /// Only run-level problems (config fetch/parse, workspace, HTTP client)
    /// are errors. Per-model failures are reported in the summary.
    pub async fn run(&self, source: &str, dry_run: bool) -> Result<ProvisioningSummary> {
        let started = Utc::now();
        tracing::info!(
            "Starting model provisioning{} (workspace: {})",
            if dry_run { " [dry run]" } else { "" },
            self.settings.workspace.display()
        );

        if !dry_run {
            self.prepare_workspace()?;
        }

        let config = config::fetch_and_parse(source, &self.settings).await?;

        if dry_run {
            let summary = ProvisioningSummary::new(Self::validate_only(&config), started, true);
            summary.log();
            return Ok(summary);
        }

        let tokens = TokenValidator::new(self.settings.http_client()?, &self.settings)
            .validate(&config)
            .await;
        for entry in gated_without_token(&config, &tokens) {
            tracing::warn!(
                "{} is gated and has no valid token for {}",
                entry.key(),
                entry.source.describe()
            );
        }

        let results = self.dispatch(&config).await?;
        let summary = ProvisioningSummary::new(results, started, false);
        summary.log();
        Ok(summary)
    }

    fn prepare_workspace(&self) -> Result<()> {
        let models = self.settings.models_dir();
        std::fs::create_dir_all(&models)?;
        std::fs::create_dir_all(self.settings.logs_dir())?;
        tracing::debug!("Models root: {}", models.display());
        Ok(())
    }

    fn validate_only(config: &Config) -> Vec<DownloadResult> {
        config
            .entries()
            .map(|entry| {
                tracing::info!(
                    "[dry run] {} -> {}: {}",
                    entry.key(),
                    entry.directory,
                    entry.source.describe()
                );
                DownloadResult::validated(&entry.name, &entry.category)
            })
            .collect()
    }

    async fn dispatch(&self, config: &Config) -> Result<Vec<DownloadResult>> {
        let downloader: Arc<dyn Downloader> = match &self.downloader {
            Some(downloader) => Arc::clone(downloader),
            None => Arc::new(Downloaders::new(&self.settings)?),
        };
        let limit = self.settings.max_concurrent.max(1);
        let semaphore = Arc::new(Semaphore::new(limit));

        let entries: Vec<&ModelEntry> = config.entries().collect();
        let mut slots: Vec<Option<DownloadResult>> = vec![None; entries.len()];
        let mut tasks = JoinSet::new();

        tracing::info!(
            "Downloading {} model(s), at most {limit} at a time",
            entries.len()
        );

        for (index, entry) in entries.iter().enumerate() {
            if let Source::Unresolved { reason } = &entry.source {
                let error = DownloadError::UnresolvedSource(reason.clone());
                tracing::error!("✗ {}: {error}", entry.key());
                slots[index] = Some(DownloadResult::failed(
                    &entry.name,
                    &entry.category,
                    error.to_string(),
                    false,
                ));
                continue;
            }

            let entry = (*entry).clone();
            let target = self.settings.category_dir(&entry.directory);
            let downloader = Arc::clone(&downloader);
            let semaphore = Arc::clone(&semaphore);
            let progress = self.progress.clone();

            tasks.spawn(async move {
                let Ok(_permit) = semaphore.acquire_owned().await else {
                    let error = DownloadError::Panicked("download queue closed".to_string());
                    return (index, into_result(&entry, Err(error)));
                };

                tracing::info!("→ {} ({})", entry.key(), entry.source.describe());
                let outcome = AssertUnwindSafe(downloader.download(&entry, &target, &progress))
                    .catch_unwind()
                    .await
                    .unwrap_or_else(|panic| Err(DownloadError::Panicked(panic_message(&*panic))));

                (index, into_result(&entry, outcome))
            });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((index, result)) => slots[index] = Some(result),
                Err(e) => tracing::error!("Download task could not be joined: {e}"),
            }
        }

        Ok(slots
            .into_iter()
            .zip(entries)
            .map(|(slot, entry)| {
                slot.unwrap_or_else(|| {
                    DownloadResult::failed(
                        &entry.name,
                        &entry.category,
                        DownloadError::Panicked("task ended without a result".to_string())
                            .to_string(),
                        false,
                    )
                })
            })
            .collect())
    }
}

/// Turn a download outcome into the entry's result, logging it once
fn into_result(
    entry: &ModelEntry,
    outcome: std::result::Result<DownloadOutcome, DownloadError>,
) -> DownloadResult {
    match outcome {
        Ok(outcome) => {
            if outcome.already_present {
                tracing::info!(
                    "✓ {} already present at {}",
                    entry.key(),
                    outcome.path.display()
                );
            } else {
                tracing::info!(
                    "✓ {} downloaded ({}) to {}",
                    entry.key(),
                    format_bytes(outcome.bytes),
                    outcome.path.display()
                );
            }
            DownloadResult::succeeded(
                &entry.name,
                &entry.category,
                outcome.path,
                outcome.bytes,
                outcome.already_present,
            )
        }
        Err(error) => {
            tracing::error!("✗ {}: {error}", entry.key());
            DownloadResult::failed(&entry.name, &entry.category, error.to_string(), error.is_gated())
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| (*s).to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "download task panicked".to_string())
}

/// Gated entries whose service has no valid credential
fn gated_without_token<'a>(
    config: &'a Config,
    tokens: &HashMap<Service, TokenStatus>,
) -> Vec<&'a ModelEntry> {
    config
        .gated_entries()
        .filter(|entry| {
            let service = match entry.source {
                Source::Hub { .. } => Service::Hub,
                Source::Registry { .. } => Service::Registry,
                Source::Direct { .. } | Source::Unresolved { .. } => return false,
            };
            !tokens.get(&service).is_some_and(TokenStatus::valid)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::io::Write;
    use std::path::Path;
    use std::time::Duration;

    /// Writes a small file per entry, panics for entries named "boom"
    struct FakeDownloader;

    #[async_trait]
    impl Downloader for FakeDownloader {
        async fn download(
            &self,
            entry: &ModelEntry,
            target_dir: &Path,
            progress: &ProgressTracker,
        ) -> std::result::Result<DownloadOutcome, DownloadError> {
            assert!(entry.name != "boom", "simulated crash in {}", entry.name);
            let handle = progress.track(&entry.key());
            tokio::time::sleep(Duration::from_millis(20)).await;
            if entry.name == "missing" {
                return Err(DownloadError::NotFound(entry.name.clone()));
            }
            let path = target_dir.join(format!("{}.bin", entry.name));
            tokio::fs::create_dir_all(target_dir).await?;
            tokio::fs::write(&path, b"ok").await?;
            handle.finish();
            Ok(DownloadOutcome::downloaded(path, 2))
        }

        fn name(&self) -> &'static str {
            "fake"
        }
    }

    fn write_config(text: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(text.as_bytes()).unwrap();
        file
    }

    #[tokio::test]
    async fn test_failures_and_panics_are_isolated() {
        let config = write_config(
            r#"
            [models.lora]
            a = "https://example.com/a.safetensors"
            boom = "https://example.com/boom.safetensors"
            missing = "https://example.com/missing.safetensors"
            odd = { source = "unknown-thing" }
            b = "https://example.com/b.safetensors"
            "#,
        );
        let workspace = tempfile::tempdir().unwrap();
        let provisioner = Provisioner::new(Settings::for_workspace(workspace.path()))
            .with_downloader(Arc::new(FakeDownloader));

        let summary = provisioner
            .run(config.path().to_str().unwrap(), false)
            .await
            .unwrap();

        let names: Vec<&str> = summary.results.iter().map(|r| r.model_name.as_str()).collect();
        assert_eq!(names, vec!["a", "boom", "missing", "odd", "b"]);
        assert_eq!(summary.succeeded(), 2);
        assert_eq!(summary.failed(), 3);
        assert!(!summary.is_success());

        let boom = &summary.results[1];
        assert!(boom.error.as_deref().unwrap().contains("simulated crash"));
        let odd = &summary.results[3];
        assert!(odd.error.as_deref().unwrap().contains("unknown-thing"));
        assert!(workspace.path().join("forge/models/Lora/b.bin").exists());
    }

    #[tokio::test]
    async fn test_concurrency_cap() {
        let mut text = String::from("[models.vae]\n");
        for i in 0..12 {
            text.push_str(&format!("m{i} = \"https://example.com/m{i}.bin\"\n"));
        }
        let config = write_config(&text);
        let workspace = tempfile::tempdir().unwrap();
        let mut settings = Settings::for_workspace(workspace.path());
        settings.max_concurrent = 3;

        let provisioner = Provisioner::new(settings).with_downloader(Arc::new(FakeDownloader));
        let summary = provisioner
            .run(config.path().to_str().unwrap(), false)
            .await
            .unwrap();

        assert!(summary.is_success());
        assert_eq!(summary.total(), 12);
        assert!(provisioner.progress().peak_in_flight() <= 3);
        assert!(provisioner.progress().peak_in_flight() >= 1);
    }

    #[tokio::test]
    async fn test_dry_run_creates_nothing() {
        let config = write_config(
            r#"
            [models.checkpoints]
            sd = { repo = "a/b", file = "c.safetensors" }
            bad = { source = "nope" }
            "#,
        );
        let workspace = tempfile::tempdir().unwrap();
        let root = workspace.path().join("ws");
        let provisioner = Provisioner::new(Settings::for_workspace(&root))
            .with_downloader(Arc::new(FakeDownloader));

        let summary = provisioner
            .run(config.path().to_str().unwrap(), true)
            .await
            .unwrap();

        assert!(summary.dry_run);
        assert_eq!(summary.total(), 2);
        assert!(summary.is_success());
        assert!(!root.exists());
        assert_eq!(provisioner.progress().peak_in_flight(), 0);
    }

    #[tokio::test]
    async fn test_config_errors_are_fatal() {
        let workspace = tempfile::tempdir().unwrap();
        let provisioner = Provisioner::new(Settings::for_workspace(workspace.path()));
        let err = provisioner
            .run("/nonexistent/provisioning.toml", false)
            .await
            .unwrap_err();
        assert!(matches!(err, crate::error::ProvisionError::ConfigFetch(_)));
    }

    #[test]
    fn test_gated_without_token() {
        use crate::tokens::TokenState;

        let config = Config::parse_with_env(
            r#"
            [models.checkpoints]
            flux = { repo = "black-forest-labs/FLUX.1-dev", file = "flux1-dev.safetensors", gated = true }
            open = { repo = "a/b", file = "c.safetensors" }

            [models.lora]
            paid = { version_id = 7, gated = true }
            "#,
            |_| None,
        )
        .unwrap();

        let mut tokens = HashMap::new();
        tokens.insert(
            Service::Hub,
            TokenStatus {
                service: Service::Hub,
                state: TokenState::Absent,
            },
        );
        tokens.insert(
            Service::Registry,
            TokenStatus {
                service: Service::Registry,
                state: TokenState::Valid,
            },
        );

        let keys: Vec<String> = gated_without_token(&config, &tokens)
            .into_iter()
            .map(ModelEntry::key)
            .collect();
        assert_eq!(keys, vec!["checkpoints/flux"]);
    }

    #[test]
    fn test_panic_message() {
        let payload: Box<dyn Any + Send> = Box::new("static str");
        assert_eq!(panic_message(&*payload), "static str");
        let payload: Box<dyn Any + Send> = Box::new(String::from("owned"));
        assert_eq!(panic_message(&*payload), "owned");
        let payload: Box<dyn Any + Send> = Box::new(7_u8);
        assert_eq!(panic_message(&*payload), "download task panicked");
    }
}
