use crate::config::{ModelEntry, Source};
use crate::download::stream::{self, TargetClaims};
use crate::download::{unresolved, DownloadOutcome, Downloader};
use crate::error::DownloadError;
use crate::progress::{ProgressHandle, ProgressTracker};
use crate::settings::Settings;
use crate::urls;
use async_trait::async_trait;
use hf_hub::api::tokio::{Api, ApiBuilder, ApiError, ApiRepo};
use hf_hub::{Cache, Repo, RepoType};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Hugging Face Hub downloader.
///
/// `hf-hub` addresses the repository; bytes are streamed straight into the
/// category directory instead of the hub cache.
pub struct HubDownloader {
    client: reqwest::Client,
    endpoint: String,
    token: Option<String>,
    cache_dir: PathBuf,
    read_timeout: Duration,
    request_timeout: Duration,
    claims: TargetClaims,
}

impl std::fmt::Debug for HubDownloader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HubDownloader")
            .field("endpoint", &self.endpoint)
            .field("token", &self.token.as_ref().map(|_| "***"))
            .field("read_timeout", &self.read_timeout)
            .finish_non_exhaustive()
    }
}

impl HubDownloader {
    #[must_use]
    pub fn new(client: reqwest::Client, settings: &Settings) -> Self {
        Self {
            client,
            endpoint: settings.hub_endpoint.clone(),
            token: settings.hf_token.clone(),
            cache_dir: settings.workspace.join(".cache").join("huggingface"),
            read_timeout: settings.read_timeout,
            request_timeout: settings.request_timeout,
            claims: TargetClaims::default(),
        }
    }

    /// Share target path reservations with the other downloaders of a run
    #[must_use]
    pub fn with_claims(mut self, claims: TargetClaims) -> Self {
        self.claims = claims;
        self
    }

    fn api(&self) -> Result<Api, DownloadError> {
        ApiBuilder::from_cache(Cache::new(self.cache_dir.clone()))
            .with_endpoint(self.endpoint.clone())
            .with_token(self.token.clone())
            .with_progress(false)
            .build()
            .map_err(|e| DownloadError::Api(format!("Failed to initialize HuggingFace API: {e}")))
    }

    fn get(&self, url: &str) -> reqwest::RequestBuilder {
        let request = self.client.get(url);
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    async fn fetch_file(
        &self,
        api_repo: &ApiRepo,
        repo: &str,
        file: &str,
        dest: &Path,
        handle: &mut ProgressHandle,
    ) -> Result<u64, DownloadError> {
        let url = api_repo.url(file);
        tracing::debug!("GET {url}");

        let response = stream::send(self.get(&url), self.read_timeout).await?;
        stream::check_status(&response, Some(DownloadError::gated_hub(repo)))?;
        stream::stream_to_file(response, dest, handle, self.read_timeout).await
    }

    /// Paths of every file in the repository revision
    async fn list_files(&self, api_repo: &ApiRepo, repo: &str) -> Result<Vec<String>, DownloadError> {
        let info = tokio::time::timeout(self.request_timeout, api_repo.info())
            .await
            .map_err(|_| {
                DownloadError::Network(format!(
                    "no file listing for {repo} within {}s",
                    self.request_timeout.as_secs()
                ))
            })?
            .map_err(|e| listing_error(repo, &e))?;
        Ok(info.siblings.into_iter().map(|s| s.rfilename).collect())
    }

    async fn download_file(
        &self,
        entry: &ModelEntry,
        api_repo: &ApiRepo,
        repo: &str,
        file: &str,
        target_dir: &Path,
        progress: &ProgressTracker,
    ) -> Result<DownloadOutcome, DownloadError> {
        let relative = urls::sanitize_relative_path(file)
            .ok_or_else(|| DownloadError::InvalidRequest(format!("unsafe file path '{file}'")))?;
        let dest = target_dir.join(relative);
        self.claims.claim(&dest, &entry.key())?;

        if let Some(size) = stream::existing_size(&dest).await {
            return Ok(DownloadOutcome::present(dest, size));
        }

        let mut handle = progress.track(&entry.key());
        let bytes = self.fetch_file(api_repo, repo, file, &dest, &mut handle).await?;
        handle.finish();
        Ok(DownloadOutcome::downloaded(dest, bytes))
    }

    /// Every file of the repository under `<target>/<repo name>/`
    async fn download_snapshot(
        &self,
        entry: &ModelEntry,
        api_repo: &ApiRepo,
        repo_id: &str,
        target_dir: &Path,
        progress: &ProgressTracker,
    ) -> Result<DownloadOutcome, DownloadError> {
        let name = urls::sanitize_filename(repo_id)
            .ok_or_else(|| DownloadError::InvalidRequest(format!("unusable repo id '{repo_id}'")))?;
        let root = target_dir.join(name);

        let files = self.list_files(api_repo, repo_id).await?;
        if files.is_empty() {
            return Err(DownloadError::NotFound(format!("no files in {repo_id}")));
        }
        tracing::info!("{}: snapshot of {} file(s) from {repo_id}", entry.key(), files.len());

        let mut handle = progress.track(&entry.key());
        let mut bytes = 0;
        let mut transferred = false;

        for file in &files {
            let Some(relative) = urls::sanitize_relative_path(file) else {
                tracing::warn!("Skipping unsafe path '{file}' in {repo_id}");
                continue;
            };
            let dest = root.join(relative);
            self.claims.claim(&dest, &entry.key())?;
            if let Some(size) = stream::existing_size(&dest).await {
                bytes += size;
                continue;
            }
            bytes += self
                .fetch_file(api_repo, repo_id, file, &dest, &mut handle)
                .await?;
            transferred = true;
        }

        handle.finish();
        Ok(DownloadOutcome {
            path: root,
            bytes,
            already_present: !transferred,
        })
    }
}

/// Map a failed `ApiRepo::info` call; 401/403 mean the repository is gated
fn listing_error(repo: &str, error: &ApiError) -> DownloadError {
    let status = match error {
        ApiError::RequestError(e) => e.status().map(|s| s.as_u16()),
        _ => None,
    };
    match status {
        Some(401 | 403) => DownloadError::gated_hub(repo),
        Some(404) => DownloadError::NotFound(format!("HuggingFace repository {repo}")),
        _ => DownloadError::Api(format!("Cannot list files of {repo}: {error}")),
    }
}

#[async_trait]
impl Downloader for HubDownloader {
    async fn download(
        &self,
        entry: &ModelEntry,
        target_dir: &Path,
        progress: &ProgressTracker,
    ) -> Result<DownloadOutcome, DownloadError> {
        let Source::Hub {
            repo,
            file,
            revision,
        } = &entry.source
        else {
            return Err(unresolved(entry));
        };

        if entry.gated && self.token.is_none() {
            return Err(DownloadError::gated_hub(repo));
        }

        let api_repo =
            self.api()?
                .repo(Repo::with_revision(repo.clone(), RepoType::Model, revision.clone()));

        match file {
            Some(file) => {
                self.download_file(entry, &api_repo, repo, file, target_dir, progress)
                    .await
            }
            None => {
                self.download_snapshot(entry, &api_repo, repo, target_dir, progress)
                    .await
            }
        }
    }

    fn name(&self) -> &'static str {
        "huggingface"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::prelude::*;

    fn hub_entry(repo: &str, file: Option<&str>, gated: bool) -> ModelEntry {
        ModelEntry {
            name: "model".to_string(),
            category: "checkpoints".to_string(),
            directory: "Stable-diffusion".to_string(),
            source: Source::Hub {
                repo: repo.to_string(),
                file: file.map(str::to_string),
                revision: "main".to_string(),
            },
            gated,
        }
    }

    fn settings_for(server: &MockServer, workspace: &Path) -> Settings {
        let mut settings = Settings::for_workspace(workspace);
        settings.hub_endpoint = server.base_url();
        settings
    }

    #[tokio::test]
    async fn test_download_single_file() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(GET)
                    .path("/org/model/resolve/main/unet/model.safetensors")
                    .header("authorization", "Bearer hf_test");
                then.status(200).body("safetensors-bytes");
            })
            .await;

        let dir = tempfile::tempdir().unwrap();
        let mut settings = settings_for(&server, dir.path());
        settings.hf_token = Some("hf_test".to_string());
        let downloader = HubDownloader::new(settings.http_client().unwrap(), &settings);

        let entry = hub_entry("org/model", Some("unet/model.safetensors"), true);
        let outcome = downloader
            .download(&entry, dir.path(), &ProgressTracker::hidden())
            .await
            .unwrap();

        mock.assert_async().await;
        assert_eq!(outcome.path, dir.path().join("unet").join("model.safetensors"));
        assert_eq!(outcome.bytes, 17);
        assert!(!outcome.already_present);
    }

    #[tokio::test]
    async fn test_gated_without_token_makes_no_request() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.any_request();
                then.status(200);
            })
            .await;

        let dir = tempfile::tempdir().unwrap();
        let settings = settings_for(&server, dir.path());
        let downloader = HubDownloader::new(settings.http_client().unwrap(), &settings);

        let entry = hub_entry("black-forest-labs/FLUX.1-dev", Some("flux1-dev.safetensors"), true);
        let err = downloader
            .download(&entry, dir.path(), &ProgressTracker::hidden())
            .await
            .unwrap_err();

        assert!(err.is_gated());
        assert!(err.to_string().contains("black-forest-labs/FLUX.1-dev"));
        assert_eq!(mock.hits_async().await, 0);
    }

    #[tokio::test]
    async fn test_forbidden_maps_to_gated() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/org/locked/resolve/main/w.safetensors");
                then.status(403);
            })
            .await;

        let dir = tempfile::tempdir().unwrap();
        let mut settings = settings_for(&server, dir.path());
        settings.hf_token = Some("hf_test".to_string());
        let downloader = HubDownloader::new(settings.http_client().unwrap(), &settings);

        let entry = hub_entry("org/locked", Some("w.safetensors"), false);
        let err = downloader
            .download(&entry, dir.path(), &ProgressTracker::hidden())
            .await
            .unwrap_err();
        assert!(err.is_gated());
        assert!(!dir.path().join("w.safetensors.part").exists());
    }

    #[tokio::test]
    async fn test_existing_file_is_skipped() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.any_request();
                then.status(200).body("new");
            })
            .await;

        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("model.safetensors"), b"old-bytes").unwrap();
        let settings = settings_for(&server, dir.path());
        let downloader = HubDownloader::new(settings.http_client().unwrap(), &settings);

        let entry = hub_entry("org/model", Some("model.safetensors"), false);
        let outcome = downloader
            .download(&entry, dir.path(), &ProgressTracker::hidden())
            .await
            .unwrap();

        assert!(outcome.already_present);
        assert_eq!(outcome.bytes, 9);
        assert_eq!(mock.hits_async().await, 0);
    }

    #[tokio::test]
    async fn test_snapshot_downloads_all_siblings() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/api/models/org/upscaler/revision/main");
                then.status(200).json_body(serde_json::json!({
                    "sha": "0123abcd",
                    "siblings": [
                        { "rfilename": "config.json" },
                        { "rfilename": "weights/model.bin" }
                    ]
                }));
            })
            .await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/org/upscaler/resolve/main/config.json");
                then.status(200).body("{}");
            })
            .await;
        server
            .mock_async(|when, then| {
                when.method(GET)
                    .path("/org/upscaler/resolve/main/weights/model.bin");
                then.status(200).body("0123456789");
            })
            .await;

        let dir = tempfile::tempdir().unwrap();
        let settings = settings_for(&server, dir.path());
        let downloader = HubDownloader::new(settings.http_client().unwrap(), &settings);

        let entry = hub_entry("org/upscaler", None, false);
        let outcome = downloader
            .download(&entry, dir.path(), &ProgressTracker::hidden())
            .await
            .unwrap();

        assert_eq!(outcome.path, dir.path().join("upscaler"));
        assert_eq!(outcome.bytes, 12);
        assert!(dir.path().join("upscaler/weights/model.bin").exists());
        assert!(dir.path().join("upscaler/config.json").exists());
    }

    #[tokio::test]
    async fn test_snapshot_listing_denied_is_gated() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/api/models/org/private/revision/main");
                then.status(401);
            })
            .await;

        let dir = tempfile::tempdir().unwrap();
        let settings = settings_for(&server, dir.path());
        let downloader = HubDownloader::new(settings.http_client().unwrap(), &settings);

        let err = downloader
            .download(&hub_entry("org/private", None, false), dir.path(), &ProgressTracker::hidden())
            .await
            .unwrap_err();
        assert!(err.is_gated());
        assert!(!dir.path().join("private").exists());
    }
}
