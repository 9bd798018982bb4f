//! Credential checks for gated models
//!
//! Validation only annotates the run. A missing or rejected token never stops
//! provisioning; the affected gated entries fail on their own.

use crate::config::Config;
use crate::error::{Service, TokenValidationError};
use crate::settings::Settings;
use reqwest::StatusCode;
use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenState {
    Valid,
    Invalid,
    Absent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TokenStatus {
    pub service: Service,
    pub state: TokenState,
}

impl TokenStatus {
    #[must_use]
    pub fn valid(&self) -> bool {
        self.state == TokenState::Valid
    }
}

#[derive(Debug, Deserialize)]
struct WhoAmI {
    #[serde(default)]
    name: Option<String>,
}

pub struct TokenValidator {
    client: reqwest::Client,
    hub_endpoint: String,
    registry_endpoint: String,
    hf_token: Option<String>,
    civitai_token: Option<String>,
    timeout: Duration,
}

impl std::fmt::Debug for TokenValidator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenValidator")
            .field("hub_endpoint", &self.hub_endpoint)
            .field("registry_endpoint", &self.registry_endpoint)
            .field("hf_token", &self.hf_token.as_ref().map(|_| "***"))
            .field("civitai_token", &self.civitai_token.as_ref().map(|_| "***"))
            .finish_non_exhaustive()
    }
}

impl TokenValidator {
    #[must_use]
    pub fn new(client: reqwest::Client, settings: &Settings) -> Self {
        Self {
            client,
            hub_endpoint: settings.hub_endpoint.trim_end_matches('/').to_string(),
            registry_endpoint: settings.registry_endpoint.trim_end_matches('/').to_string(),
            hf_token: settings.hf_token.clone(),
            civitai_token: settings.civitai_token.clone(),
            timeout: settings.request_timeout,
        }
    }

    /// Status of each credential. Empty, with no network traffic, when no entry is gated.
    pub async fn validate(&self, config: &Config) -> HashMap<Service, TokenStatus> {
        if !config.has_gated() {
            tracing::debug!("No gated models, skipping token validation");
            return HashMap::new();
        }

        tracing::info!("Validating authentication tokens...");
        let (hub, registry) = tokio::join!(
            self.check(Service::Hub, self.hf_token.as_deref()),
            self.check(Service::Registry, self.civitai_token.as_deref()),
        );

        let statuses: HashMap<Service, TokenStatus> = [hub, registry]
            .into_iter()
            .map(|status| (status.service, status))
            .collect();

        let present = statuses.values().filter(|s| s.state != TokenState::Absent).count();
        let valid = statuses.values().filter(|s| s.valid()).count();
        if present == 0 {
            tracing::warn!("No authentication tokens found; gated models will fail");
        } else if valid == present {
            tracing::info!("All {valid} token(s) are valid");
        } else {
            tracing::warn!("{valid}/{present} token(s) are valid");
        }

        statuses
    }

    async fn check(&self, service: Service, token: Option<&str>) -> TokenStatus {
        let Some(token) = token else {
            tracing::warn!("No {} environment variable found", service.token_env());
            return TokenStatus {
                service,
                state: TokenState::Absent,
            };
        };

        let state = match self.verify(service, token).await {
            Ok(()) => TokenState::Valid,
            Err(e) => {
                tracing::warn!("{e}");
                TokenState::Invalid
            }
        };
        TokenStatus { service, state }
    }

    async fn verify(&self, service: Service, token: &str) -> Result<(), TokenValidationError> {
        let url = match service {
            Service::Hub => format!("{}/api/whoami-v2", self.hub_endpoint),
            Service::Registry => format!("{}/api/v1/models?limit=1&hidden=1", self.registry_endpoint),
        };

        let response = self
            .client
            .get(&url)
            .bearer_auth(token)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| TokenValidationError::Unreachable {
                service,
                reason: e.to_string(),
            })?;

        let status = response.status();
        if status != StatusCode::OK {
            return Err(TokenValidationError::Rejected {
                service,
                status: status.as_u16(),
            });
        }

        match service {
            Service::Hub => {
                let user = response
                    .json::<WhoAmI>()
                    .await
                    .ok()
                    .and_then(|w| w.name)
                    .unwrap_or_else(|| "unknown".to_string());
                tracing::info!("HuggingFace token valid for user: {user}");
            }
            Service::Registry => tracing::info!("CivitAI token is valid"),
        }
        Ok(())
    }
}
