//! Streaming writer shared by all downloaders
//!
//! Bodies are written to `<dest>.part` and renamed into place only after the
//! whole stream has been consumed, so a file at its final path is always
//! complete.

use crate::error::DownloadError;
use crate::progress::ProgressHandle;
use futures_util::StreamExt;
use reqwest::{RequestBuilder, Response, StatusCode};
use std::collections::HashMap;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::io::AsyncWriteExt;

/// Temporary path a download is streamed into
#[must_use]
pub fn part_path(dest: &Path) -> PathBuf {
    let mut name = OsString::from(dest.as_os_str());
    name.push(".part");
    PathBuf::from(name)
}

/// Final paths reserved by the entries of one run
#[derive(Debug, Clone, Default)]
pub struct TargetClaims {
    claimed: Arc<Mutex<HashMap<PathBuf, String>>>,
}

impl TargetClaims {
    /// Reserve `dest` for the entry `key`.
    ///
    /// Must be called before looking at or writing `dest`. Fails when a
    /// different entry already holds the path.
    pub fn claim(&self, dest: &Path, key: &str) -> Result<(), DownloadError> {
        let mut claimed = self.claimed.lock().unwrap_or_else(PoisonError::into_inner);
        match claimed.get(dest) {
            Some(owner) if owner != key => Err(DownloadError::DuplicateTarget {
                path: dest.display().to_string(),
                owner: owner.clone(),
            }),
            Some(_) => Ok(()),
            None => {
                claimed.insert(dest.to_path_buf(), key.to_string());
                Ok(())
            }
        }
    }
}

/// Send `request`, failing when no response headers arrive within `wait`
pub async fn send(request: RequestBuilder, wait: Duration) -> Result<Response, DownloadError> {
    tokio::time::timeout(wait, request.send())
        .await
        .map_err(|_| {
            DownloadError::Network(format!("no response within {}s", wait.as_secs()))
        })?
        .map_err(DownloadError::from)
}

/// Size of `dest` if a complete file is already there
pub async fn existing_size(dest: &Path) -> Option<u64> {
    tokio::fs::metadata(dest)
        .await
        .ok()
        .filter(std::fs::Metadata::is_file)
        .map(|m| m.len())
}

/// Map a non-2xx response to a `DownloadError`.
///
/// 401/403 become `denied` when given, plain `Http` otherwise.
pub fn check_status(response: &Response, denied: Option<DownloadError>) -> Result<(), DownloadError> {
    let status = response.status();
    if status.is_success() {
        return Ok(());
    }

    let url = response.url().to_string();
    Err(match (status, denied) {
        (StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN, Some(denied)) => denied,
        (StatusCode::NOT_FOUND, _) => DownloadError::NotFound(url),
        _ => DownloadError::Http {
            status: status.as_u16(),
            url,
        },
    })
}

/// Stream `response` into `dest`, returning the number of bytes written.
///
/// Each chunk must arrive within `read_timeout`. The `.part` file is removed
/// on any failure.
pub async fn stream_to_file(
    response: Response,
    dest: &Path,
    handle: &mut ProgressHandle,
    read_timeout: Duration,
) -> Result<u64, DownloadError> {
    if let Some(parent) = dest.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }

    let part = part_path(dest);
    let written = match write_part(response, &part, handle, read_timeout).await {
        Ok(written) => written,
        Err(e) => {
            remove_part(&part).await;
            return Err(e);
        }
    };

    if let Err(e) = tokio::fs::rename(&part, dest).await {
        remove_part(&part).await;
        return Err(e.into());
    }

    tracing::debug!("Wrote {} bytes to {}", written, dest.display());
    Ok(written)
}

async fn write_part(
    response: Response,
    part: &Path,
    handle: &mut ProgressHandle,
    read_timeout: Duration,
) -> Result<u64, DownloadError> {
    let expected = response.content_length();
    if let Some(len) = expected {
        handle.add_total(len);
    }

    let mut file = tokio::fs::File::create(part).await?;
    let mut stream = response.bytes_stream();
    let mut written: u64 = 0;

    loop {
        let next = tokio::time::timeout(read_timeout, stream.next())
            .await
            .map_err(|_| {
                DownloadError::Network(format!(
                    "no data received for {}s after {written} bytes",
                    read_timeout.as_secs()
                ))
            })?;
        let Some(chunk) = next else {
            break;
        };
        let chunk = chunk?;
        file.write_all(&chunk).await?;
        written += chunk.len() as u64;
        handle.advance(chunk.len() as u64);
    }

    file.flush().await?;
    file.sync_all().await?;

    if let Some(expected) = expected {
        if written != expected {
            return Err(DownloadError::Network(format!(
                "stream ended after {written} of {expected} bytes"
            )));
        }
    }

    Ok(written)
}

async fn remove_part(part: &Path) {
    if let Err(e) = tokio::fs::remove_file(part).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            tracing::warn!("Could not remove {}: {e}", part.display());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::progress::ProgressTracker;
    use httpmock::prelude::*;

    #[test]
    fn test_part_path() {
        assert_eq!(
            part_path(Path::new("/ws/Lora/style.safetensors")),
            PathBuf::from("/ws/Lora/style.safetensors.part")
        );
    }

    #[test]
    fn test_claims_reject_second_owner() {
        let claims = TargetClaims::default();
        let dest = Path::new("/ws/Lora/model.safetensors");

        claims.claim(dest, "lora/first").unwrap();
        claims.claim(dest, "lora/first").unwrap();
        claims
            .claim(Path::new("/ws/Lora/other.safetensors"), "lora/second")
            .unwrap();

        let err = claims.claim(dest, "lora/second").unwrap_err();
        assert!(matches!(err, DownloadError::DuplicateTarget { ref owner, .. } if owner == "lora/first"));
        assert!(err.to_string().contains("model.safetensors"));
    }

    #[tokio::test]
    async fn test_send_times_out_on_silent_server() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let silent = tokio::spawn(async move {
            let mut held = Vec::new();
            loop {
                let (socket, _) = listener.accept().await.unwrap();
                held.push(socket);
            }
        });

        let request = reqwest::Client::new().get(format!("http://{addr}/x.safetensors"));
        let err = tokio::time::timeout(
            Duration::from_secs(10),
            send(request, Duration::from_secs(1)),
        )
        .await
        .expect("send must give up on its own")
        .unwrap_err();
        silent.abort();

        assert!(matches!(err, DownloadError::Network(ref m) if m.contains("no response")));
    }

    #[tokio::test]
    async fn test_stream_writes_and_renames() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/blob");
                then.status(200).body("weights-bytes");
            })
            .await;

        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("nested").join("model.bin");
        let tracker = ProgressTracker::hidden();
        let mut handle = tracker.track("t");

        let response = reqwest::get(server.url("/blob")).await.unwrap();
        check_status(&response, None).unwrap();
        let written = stream_to_file(response, &dest, &mut handle, Duration::from_secs(5))
            .await
            .unwrap();
        handle.finish();

        assert_eq!(written, 13);
        assert_eq!(std::fs::read_to_string(&dest).unwrap(), "weights-bytes");
        assert!(!part_path(&dest).exists());
        assert_eq!(existing_size(&dest).await, Some(13));
        assert_eq!(tracker.overview().bytes, 13);
    }

    #[tokio::test]
    async fn test_check_status_mapping() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.path("/denied");
                then.status(403);
            })
            .await;
        server
            .mock_async(|when, then| {
                when.path("/missing");
                then.status(404);
            })
            .await;
        server
            .mock_async(|when, then| {
                when.path("/broken");
                then.status(502);
            })
            .await;

        let denied = reqwest::get(server.url("/denied")).await.unwrap();
        let err = check_status(&denied, Some(DownloadError::gated_hub("a/b"))).unwrap_err();
        assert!(err.is_gated());

        let denied = reqwest::get(server.url("/denied")).await.unwrap();
        assert!(matches!(
            check_status(&denied, None),
            Err(DownloadError::Http { status: 403, .. })
        ));

        let missing = reqwest::get(server.url("/missing")).await.unwrap();
        assert!(matches!(
            check_status(&missing, None),
            Err(DownloadError::NotFound(_))
        ));

        let broken = reqwest::get(server.url("/broken")).await.unwrap();
        assert!(matches!(
            check_status(&broken, None),
            Err(DownloadError::Http { status: 502, .. })
        ));
    }

    #[tokio::test]
    async fn test_storage_failure_leaves_no_part() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.path("/blob");
                then.status(200).body("data");
            })
            .await;

        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("blocker");
        std::fs::write(&blocker, b"file, not a directory").unwrap();
        let dest = blocker.join("model.bin");

        let tracker = ProgressTracker::hidden();
        let mut handle = tracker.track("blocked");
        let response = reqwest::get(server.url("/blob")).await.unwrap();
        let err = stream_to_file(response, &dest, &mut handle, Duration::from_secs(5))
            .await
            .unwrap_err();
        drop(handle);

        assert!(matches!(err, DownloadError::Storage(_)));
        assert!(!part_path(&dest).exists());
        assert_eq!(tracker.overview().failed, 1);
    }
}
