#![allow(clippy::multiple_crate_versions)]

pub mod config;
pub mod download;
pub mod error;
pub mod logging;
pub mod orchestrator;
pub mod progress;
pub mod results;
pub mod settings;
pub mod tokens;
pub mod urls;

pub use error::{DownloadError, ProvisionError, Result};
pub use orchestrator::Provisioner;
pub use results::{DownloadResult, ProvisioningSummary};
pub use settings::Settings;
