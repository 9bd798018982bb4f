use crate::config::{ModelEntry, Source};
use crate::download::stream::{self, TargetClaims};
use crate::download::{pick_filename, unresolved, DownloadOutcome, Downloader};
use crate::error::DownloadError;
use crate::progress::ProgressTracker;
use crate::settings::Settings;
use crate::urls;
use async_trait::async_trait;
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

/// Subset of `GET /api/v1/model-versions/<id>`
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VersionInfo {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub download_url: Option<String>,
    #[serde(default)]
    pub files: Vec<VersionFile>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VersionFile {
    pub name: String,
    #[serde(default)]
    pub primary: bool,
    #[serde(default)]
    pub download_url: Option<String>,
    #[serde(default, rename = "sizeKB")]
    pub size_kb: Option<f64>,
}

impl VersionInfo {
    /// The file flagged primary, else the first one listed
    #[must_use]
    pub fn primary_file(&self) -> Option<&VersionFile> {
        self.files
            .iter()
            .find(|f| f.primary)
            .or_else(|| self.files.first())
    }
}

/// CivitAI downloader addressing models by version id
pub struct RegistryDownloader {
    client: reqwest::Client,
    endpoint: String,
    token: Option<String>,
    read_timeout: Duration,
    request_timeout: Duration,
    claims: TargetClaims,
}

impl std::fmt::Debug for RegistryDownloader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegistryDownloader")
            .field("endpoint", &self.endpoint)
            .field("token", &self.token.as_ref().map(|_| "***"))
            .finish_non_exhaustive()
    }
}

impl RegistryDownloader {
    #[must_use]
    pub fn new(client: reqwest::Client, settings: &Settings) -> Self {
        Self {
            client,
            endpoint: settings.registry_endpoint.trim_end_matches('/').to_string(),
            token: settings.civitai_token.clone(),
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

    fn get(&self, url: &str) -> reqwest::RequestBuilder {
        let request = self.client.get(url);
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    /// Fetch version metadata
    pub async fn version_info(&self, version_id: &str) -> Result<VersionInfo, DownloadError> {
        let url = format!(
            "{}/api/v1/model-versions/{}",
            self.endpoint,
            urlencoding::encode(version_id)
        );
        let response = self.get(&url).timeout(self.request_timeout).send().await?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(DownloadError::NotFound(format!(
                "CivitAI model version {version_id}"
            )));
        }
        stream::check_status(&response, Some(DownloadError::gated_registry(version_id)))?;

        response
            .json()
            .await
            .map_err(|e| DownloadError::Api(format!("Invalid CivitAI version payload: {e}")))
    }

    fn fallback_url(&self, version_id: &str) -> String {
        format!(
            "{}/api/download/models/{}",
            self.endpoint,
            urlencoding::encode(version_id)
        )
    }
}

#[async_trait]
impl Downloader for RegistryDownloader {
    async fn download(
        &self,
        entry: &ModelEntry,
        target_dir: &Path,
        progress: &ProgressTracker,
    ) -> Result<DownloadOutcome, DownloadError> {
        let Source::Registry {
            version_id,
            filename,
        } = &entry.source
        else {
            return Err(unresolved(entry));
        };

        if entry.gated && self.token.is_none() {
            return Err(DownloadError::gated_registry(version_id));
        }

        let info = self.version_info(version_id).await?;
        let primary = info.primary_file();
        if let Some(name) = &info.name {
            tracing::debug!("{}: CivitAI version {version_id} is '{name}'", entry.key());
        }

        let remote_name = primary.and_then(|f| urls::sanitize_filename(&f.name));
        let dest = target_dir.join(pick_filename(entry, filename.as_deref(), remote_name));
        self.claims.claim(&dest, &entry.key())?;

        if let Some(size) = stream::existing_size(&dest).await {
            return Ok(DownloadOutcome::present(dest, size));
        }

        let url = info
            .download_url
            .clone()
            .or_else(|| primary.and_then(|f| f.download_url.clone()))
            .unwrap_or_else(|| self.fallback_url(version_id));
        tracing::debug!("GET {url}");

        let mut handle = progress.track(&entry.key());
        let response = stream::send(self.get(&url), self.read_timeout).await?;
        stream::check_status(&response, Some(DownloadError::gated_registry(version_id)))?;
        let bytes = stream::stream_to_file(response, &dest, &mut handle, self.read_timeout).await?;
        handle.finish();

        Ok(DownloadOutcome::downloaded(dest, bytes))
    }

    fn name(&self) -> &'static str {
        "civitai"
    }
}
