use crate::error::{ProvisionError, Result};
use crate::settings::Settings;
use crate::urls;
use reqwest::header::CONTENT_TYPE;
use reqwest::Url;
use std::path::Path;

/// Interstitial pages followed before giving up
pub const MAX_CONFIRM_HOPS: usize = 3;

/// Read the config document from a local path or an http(s) URL
pub async fn fetch_document(
    source: &str,
    settings: &Settings,
    client: &reqwest::Client,
) -> Result<String> {
    if urls::is_url(source) {
        fetch_remote(source, settings, client).await
    } else {
        read_local(Path::new(source)).await
    }
}

async fn read_local(path: &Path) -> Result<String> {
    tracing::debug!("Reading config from {}", path.display());
    tokio::fs::read_to_string(path).await.map_err(|e| {
        ProvisionError::ConfigFetch(format!("cannot read {}: {e}", path.display()))
    })
}

async fn fetch_remote(
    source: &str,
    settings: &Settings,
    client: &reqwest::Client,
) -> Result<String> {
    let mut url = urls::rewrite_sharing_link(source, &settings.drive_endpoint);
    let from_drive = urls::is_drive_link(source);
    if url != source {
        tracing::info!("Rewrote Google Drive sharing link to {url}");
    }

    for hop in 0..=MAX_CONFIRM_HOPS {
        tracing::debug!("Fetching config from {url} (attempt {})", hop + 1);

        let response = client
            .get(&url)
            .timeout(settings.request_timeout)
            .send()
            .await
            .map_err(|e| ProvisionError::ConfigFetch(format!("request to {url} failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            return Err(ProvisionError::ConfigFetch(format!(
                "HTTP {status} from {url}"
            )));
        }

        let is_html = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| v.contains("text/html"));

        let body = response
            .text()
            .await
            .map_err(|e| ProvisionError::ConfigFetch(format!("reading body of {url}: {e}")))?;

        if !(from_drive && is_html && urls::is_interstitial(&body)) {
            return Ok(body);
        }

        let base = Url::parse(&url)
            .map_err(|e| ProvisionError::ConfigFetch(format!("invalid URL {url}: {e}")))?;
        let next = urls::confirm_url(&body, &base).ok_or_else(|| {
            ProvisionError::ConfigFetch(format!(
                "Google Drive returned a warning page without a download link for {source}"
            ))
        })?;
        tracing::info!("Following Google Drive confirmation link");
        url = next.to_string();
    }

    Err(ProvisionError::ConfigFetch(format!(
        "gave up after {MAX_CONFIRM_HOPS} Google Drive confirmation pages for {source}"
    )))
}
