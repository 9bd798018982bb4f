use std::fmt;
use thiserror::Error;

/// Run-level errors. Any of these aborts provisioning before a single model is fetched.
#[derive(Error, Debug)]
pub enum ProvisionError {
    #[error("Config fetch error: {0}\n\nTroubleshooting:\n- Check that the config path exists and is readable\n- For remote configs, verify the URL opens in a browser\n- Google Drive links must be shared as 'Anyone with the link'")]
    ConfigFetch(String),

    #[error("Config parse error: {0}\n\nTroubleshooting:\n- The document must be TOML with a top-level [models] table\n- Each category must be a table of model entries\n- Run with --dry-run to validate without downloading")]
    ConfigParse(String),

    #[error("HTTP client error: {0}")]
    Http(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Remote service a credential belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Service {
    Hub,
    Registry,
}

impl Service {
    #[must_use]
    pub const fn display_name(self) -> &'static str {
        match self {
            Self::Hub => "HuggingFace",
            Self::Registry => "CivitAI",
        }
    }

    /// Environment variable the credential is read from
    #[must_use]
    pub const fn token_env(self) -> &'static str {
        match self {
            Self::Hub => "HF_TOKEN",
            Self::Registry => "CIVITAI_TOKEN",
        }
    }
}

impl fmt::Display for Service {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.display_name())
    }
}

/// Per-model errors. These never escape a download task; the orchestrator
/// turns each one into a failed `DownloadResult`.
#[derive(Error, Debug)]
pub enum DownloadError {
    #[error("Unresolved source: {0}")]
    UnresolvedSource(String),

    #[error("Gated model access denied\nModel: {resource}\nPlatform: {service}\nReason: Terms of Service not accepted or missing/invalid token\nAction: {remediation}")]
    GatedAccess {
        service: Service,
        resource: String,
        remediation: String,
    },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("HTTP {status} from {url}")]
    Http { status: u16, url: String },

    #[error("Network error: {0}\n\nTroubleshooting:\n- Check internet connection\n- Re-run provisioning; files already on disk are skipped")]
    Network(String),

    #[error("Storage error: {0}")]
    Storage(#[from] std::io::Error),

    #[error("API error: {0}")]
    Api(String),

    #[error("Duplicate target: {path} is already claimed by {owner}")]
    DuplicateTarget { path: String, owner: String },

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Download task aborted: {0}")]
    Panicked(String),
}

impl DownloadError {
    /// Gated failure for a hub repository
    #[must_use]
    pub fn gated_hub(repo: &str) -> Self {
        Self::GatedAccess {
            service: Service::Hub,
            resource: repo.to_string(),
            remediation: format!(
                "Visit https://huggingface.co/{repo} and click 'Agree and access repository', then export {} with a token that has read access",
                Service::Hub.token_env()
            ),
        }
    }

    /// Gated failure for a registry model version
    #[must_use]
    pub fn gated_registry(version_id: &str) -> Self {
        Self::GatedAccess {
            service: Service::Registry,
            resource: format!("model version {version_id}"),
            remediation: format!(
                "Create an API key at https://civitai.com/user/account and export {}",
                Service::Registry.token_env()
            ),
        }
    }

    /// Whether the entry was never attempted (reported as skipped)
    #[must_use]
    pub const fn is_gated(&self) -> bool {
        matches!(self, Self::GatedAccess { .. })
    }
}

impl From<reqwest::Error> for DownloadError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            Self::Network(format!("request timed out: {e}"))
        } else {
            Self::Network(e.to_string())
        }
    }
}

/// Credential check failure. Logged as a warning, never surfaced as a run failure.
#[derive(Error, Debug)]
pub enum TokenValidationError {
    #[error("{service} token rejected: HTTP {status}")]
    Rejected { service: Service, status: u16 },

    #[error("{service} token check failed: {reason}")]
    Unreachable { service: Service, reason: String },
}

pub type Result<T> = std::result::Result<T, ProvisionError>;
