//! Provisioning config
//!
//! The document is TOML with a top-level `[models]` table. Each sub-table is a
//! category and each key inside it a model:
//!
//! ```toml
//! [models.checkpoints]
//! sdxl = { repo = "stabilityai/stable-diffusion-xl-base-1.0", file = "sd_xl_base_1.0.safetensors" }
//!
//! [models.lora]
//! detail = { version_id = 128713 }
//! style = "https://example.com/style.safetensors"
//! ```
//!
//! A bare string is shorthand for `{ source = "url", url = "..." }`. The
//! document can live on disk, behind a URL, or in a Google Drive share.

pub mod categories;
pub mod fetch;
pub mod schema;

pub use schema::{Category, Config, ModelEntry, Source, SourceKind};

use crate::error::Result;
use crate::settings::Settings;

/// Fetch the document at `source` and normalize it
pub async fn fetch_and_parse(source: &str, settings: &Settings) -> Result<Config> {
    let client = settings.http_client()?;
    let text = fetch::fetch_document(source, settings, &client).await?;
    let config = Config::parse(&text)?;
    log_overview(&config);
    Ok(config)
}

fn log_overview(config: &Config) {
    tracing::info!(
        "Parsed {} model(s) in {} categor{}",
        config.len(),
        config.categories.len(),
        if config.categories.len() == 1 { "y" } else { "ies" }
    );
    for category in &config.categories {
        tracing::info!(
            "  {} -> {}: {} model(s)",
            category.name,
            category.directory,
            category.entries.len()
        );
    }

    let gated = config.gated_entries().count();
    if gated > 0 {
        tracing::info!("{gated} gated model(s) require credentials");
    }

    let unresolved = config.entries().filter(|e| !e.source.is_resolved()).count();
    if unresolved > 0 {
        tracing::info!("{unresolved} model(s) cannot be downloaded as configured");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[tokio::test]
    async fn test_fetch_and_parse_local() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"
            [models.clip]
            l = {{ repo = "comfyanonymous/flux_text_encoders", file = "clip_l.safetensors" }}
            "#
        )
        .unwrap();

        let settings = Settings::for_workspace("/tmp/unused");
        let config = fetch_and_parse(file.path().to_str().unwrap(), &settings)
            .await
            .unwrap();

        assert_eq!(config.len(), 1);
        assert_eq!(config.categories[0].directory, "text_encoder");
    }

    #[tokio::test]
    async fn test_fetch_and_parse_rejects_bad_document() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "[settings]\nfoo = 1\n").unwrap();

        let settings = Settings::for_workspace("/tmp/unused");
        let err = fetch_and_parse(file.path().to_str().unwrap(), &settings)
            .await
            .unwrap_err();
        assert!(matches!(err, crate::error::ProvisionError::ConfigParse(_)));
    }
}
