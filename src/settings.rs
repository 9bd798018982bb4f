//! Runtime settings for a provisioning run
//!
//! Built once at startup from CLI flags and the environment, then passed by
//! reference into every component. Downloaders never read the environment
//! themselves.

use crate::error::{ProvisionError, Result};
use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_WORKSPACE: &str = "/workspace";
pub const DEFAULT_HUB_ENDPOINT: &str = "https://huggingface.co";
pub const DEFAULT_REGISTRY_ENDPOINT: &str = "https://civitai.com";
pub const DEFAULT_DRIVE_ENDPOINT: &str = "https://drive.google.com";
pub const DEFAULT_MAX_CONCURRENT: usize = 5;

const USER_AGENT: &str = concat!("provisioner/", env!("CARGO_PKG_VERSION"));

#[derive(Clone)]
pub struct Settings {
    pub workspace: PathBuf,
    pub hf_token: Option<String>,
    pub civitai_token: Option<String>,
    pub max_concurrent: usize,
    pub connect_timeout: Duration,
    /// Longest silence tolerated between two chunks of a streamed body
    pub read_timeout: Duration,
    /// Budget for small metadata requests (API lookups, token checks, config fetch)
    pub request_timeout: Duration,
    pub hub_endpoint: String,
    pub registry_endpoint: String,
    pub drive_endpoint: String,
    pub show_progress: bool,
}

impl std::fmt::Debug for Settings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Settings")
            .field("workspace", &self.workspace)
            .field("hf_token", &self.hf_token.as_ref().map(|_| "***"))
            .field("civitai_token", &self.civitai_token.as_ref().map(|_| "***"))
            .field("max_concurrent", &self.max_concurrent)
            .field("connect_timeout", &self.connect_timeout)
            .field("read_timeout", &self.read_timeout)
            .field("request_timeout", &self.request_timeout)
            .field("hub_endpoint", &self.hub_endpoint)
            .field("registry_endpoint", &self.registry_endpoint)
            .field("drive_endpoint", &self.drive_endpoint)
            .field("show_progress", &self.show_progress)
            .finish()
    }
}

impl Settings {
    /// Settings rooted at `workspace` with defaults and no credentials
    #[must_use]
    pub fn for_workspace(workspace: impl Into<PathBuf>) -> Self {
        Self {
            workspace: workspace.into(),
            hf_token: None,
            civitai_token: None,
            max_concurrent: DEFAULT_MAX_CONCURRENT,
            connect_timeout: Duration::from_secs(30),
            read_timeout: Duration::from_secs(300),
            request_timeout: Duration::from_secs(60),
            hub_endpoint: DEFAULT_HUB_ENDPOINT.to_string(),
            registry_endpoint: DEFAULT_REGISTRY_ENDPOINT.to_string(),
            drive_endpoint: DEFAULT_DRIVE_ENDPOINT.to_string(),
            show_progress: false,
        }
    }

    /// Read `WORKSPACE`, `HF_TOKEN`, `CIVITAI_TOKEN` and `HF_ENDPOINT`.
    ///
    /// An explicit `workspace` wins over the environment. Empty tokens count as unset.
    #[must_use]
    pub fn from_env(workspace: Option<PathBuf>) -> Self {
        let workspace = workspace
            .or_else(|| non_empty_env("WORKSPACE").map(PathBuf::from))
            .unwrap_or_else(|| PathBuf::from(DEFAULT_WORKSPACE));

        let mut settings = Self::for_workspace(workspace);
        settings.hf_token = non_empty_env("HF_TOKEN");
        settings.civitai_token = non_empty_env("CIVITAI_TOKEN");
        if let Some(endpoint) = non_empty_env("HF_ENDPOINT") {
            settings.hub_endpoint = endpoint.trim_end_matches('/').to_string();
        }
        settings
    }

    /// Root all model categories are written under
    #[must_use]
    pub fn models_dir(&self) -> PathBuf {
        self.workspace.join("forge").join("models")
    }

    #[must_use]
    pub fn logs_dir(&self) -> PathBuf {
        self.workspace.join("logs")
    }

    #[must_use]
    pub fn log_file(&self) -> PathBuf {
        self.logs_dir().join("provision.log")
    }

    /// Directory a category's files land in
    #[must_use]
    pub fn category_dir(&self, directory: &str) -> PathBuf {
        self.models_dir().join(directory)
    }

    /// Shared HTTP client for the whole run
    pub fn http_client(&self) -> Result<reqwest::Client> {
        reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .connect_timeout(self.connect_timeout)
            .build()
            .map_err(|e| ProvisionError::Http(format!("Failed to create HTTP client: {e}")))
    }
}

fn non_empty_env(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}
