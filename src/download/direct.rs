use crate::config::{ModelEntry, Source};
use crate::download::stream::{self, TargetClaims};
use crate::download::{pick_filename, unresolved, DownloadOutcome, Downloader};
use crate::error::DownloadError;
use crate::progress::ProgressTracker;
use crate::settings::Settings;
use crate::urls;
use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_DISPOSITION, CONTENT_TYPE};
use reqwest::{Response, Url};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

/// Drive warning pages followed before giving up
const MAX_CONFIRM_HOPS: usize = 3;

/// Downloads arbitrary URLs, including Google Drive shares
pub struct DirectDownloader {
    client: reqwest::Client,
    drive_endpoint: String,
    read_timeout: Duration,
    claims: TargetClaims,
}

impl std::fmt::Debug for DirectDownloader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DirectDownloader")
            .field("drive_endpoint", &self.drive_endpoint)
            .field("read_timeout", &self.read_timeout)
            .finish_non_exhaustive()
    }
}

impl DirectDownloader {
    #[must_use]
    pub fn new(client: reqwest::Client, settings: &Settings) -> Self {
        Self {
            client,
            drive_endpoint: settings.drive_endpoint.clone(),
            read_timeout: settings.read_timeout,
            claims: TargetClaims::default(),
        }
    }

    /// Share target path reservations with the other downloaders of a run
    #[must_use]
    pub fn with_claims(mut self, claims: TargetClaims) -> Self {
        self.claims = claims;
        self
    }

    /// GET `url`, stepping through Drive's virus-scan page when one comes back
    async fn open(
        &self,
        url: &str,
        from_drive: bool,
        headers: &HeaderMap,
    ) -> Result<Response, DownloadError> {
        let mut current = url.to_string();

        for _ in 0..=MAX_CONFIRM_HOPS {
            let request = self.client.get(&current).headers(headers.clone());
            let response = stream::send(request, self.read_timeout).await?;
            stream::check_status(&response, None)?;

            if !(from_drive && is_html(&response)) {
                return Ok(response);
            }

            let base = response.url().clone();
            let body = response.text().await?;
            if !urls::is_interstitial(&body) {
                return Err(DownloadError::Api(format!(
                    "Google Drive returned a web page instead of the file for {url}; check that it is shared as 'Anyone with the link'"
                )));
            }
            let next = urls::confirm_url(&body, &base).ok_or_else(|| {
                DownloadError::Api(format!(
                    "Google Drive warning page for {url} has no download link"
                ))
            })?;
            tracing::info!("Following Google Drive confirmation link");
            current = next.to_string();
        }

        Err(DownloadError::Api(format!(
            "gave up after {MAX_CONFIRM_HOPS} Google Drive confirmation pages for {url}"
        )))
    }
}

fn is_html(response: &Response) -> bool {
    response
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.contains("text/html"))
}

fn header_map(headers: &BTreeMap<String, String>) -> Result<HeaderMap, DownloadError> {
    let mut map = HeaderMap::with_capacity(headers.len());
    for (name, value) in headers {
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|e| DownloadError::InvalidRequest(format!("header name '{name}': {e}")))?;
        let mut value = HeaderValue::from_str(value)
            .map_err(|e| DownloadError::InvalidRequest(format!("value of header '{name}': {e}")))?;
        value.set_sensitive(true);
        map.insert(name, value);
    }
    Ok(map)
}

fn disposition_name(response: &Response) -> Option<String> {
    response
        .headers()
        .get(CONTENT_DISPOSITION)
        .and_then(|v| v.to_str().ok())
        .and_then(urls::filename_from_content_disposition)
}

#[async_trait]
impl Downloader for DirectDownloader {
    async fn download(
        &self,
        entry: &ModelEntry,
        target_dir: &Path,
        progress: &ProgressTracker,
    ) -> Result<DownloadOutcome, DownloadError> {
        let Source::Direct {
            url,
            filename,
            headers,
        } = &entry.source
        else {
            return Err(unresolved(entry));
        };

        let from_drive = urls::is_drive_link(url);
        let fetch_url = urls::rewrite_sharing_link(url, &self.drive_endpoint);
        Url::parse(&fetch_url)
            .map_err(|e| DownloadError::InvalidRequest(format!("invalid URL {fetch_url}: {e}")))?;
        let headers = header_map(headers)?;

        // Names known up front let an existing file short-circuit the request
        let known_name = filename
            .as_deref()
            .and_then(urls::sanitize_filename)
            .or_else(|| urls::filename_from_url(url));
        if let Some(name) = &known_name {
            let dest = target_dir.join(name);
            self.claims.claim(&dest, &entry.key())?;
            if let Some(size) = stream::existing_size(&dest).await {
                return Ok(DownloadOutcome::present(dest, size));
            }
        }

        let response = self.open(&fetch_url, from_drive, &headers).await?;

        let name = match known_name {
            Some(name) => name,
            None => pick_filename(entry, None, disposition_name(&response)),
        };
        let dest = target_dir.join(name);
        self.claims.claim(&dest, &entry.key())?;
        if let Some(size) = stream::existing_size(&dest).await {
            return Ok(DownloadOutcome::present(dest, size));
        }

        let mut handle = progress.track(&entry.key());
        let bytes = stream::stream_to_file(response, &dest, &mut handle, self.read_timeout).await?;
        handle.finish();

        Ok(DownloadOutcome::downloaded(dest, bytes))
    }

    fn name(&self) -> &'static str {
        "url"
    }
}
