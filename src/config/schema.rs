use crate::config::categories::{category_dir, is_known};
use crate::error::{ProvisionError, Result};
use crate::urls;
use serde::Deserialize;
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use toml::{Table, Value};

const DEFAULT_REVISION: &str = "main";

/// Which backend an entry is fetched from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SourceKind {
    Hub,
    Registry,
    Url,
    Unknown,
}

impl SourceKind {
    /// Parse an explicit `source = "..."` value
    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "huggingface" | "hf" | "hub" => Some(Self::Hub),
            "civitai" | "registry" => Some(Self::Registry),
            "url" | "direct" => Some(Self::Url),
            _ => None,
        }
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Hub => "huggingface",
            Self::Registry => "civitai",
            Self::Url => "url",
            Self::Unknown => "unknown",
        }
    }
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Source of a model, decided once while parsing
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Source {
    /// A file (or, with no `file`, every file) of a hub repository
    Hub {
        repo: String,
        file: Option<String>,
        revision: String,
    },
    /// One downloadable artifact of a registry model, addressed by version id
    Registry {
        version_id: String,
        filename: Option<String>,
    },
    Direct {
        url: String,
        filename: Option<String>,
        headers: BTreeMap<String, String>,
    },
    /// Cannot be downloaded; reported as a failure without touching the network
    Unresolved { reason: String },
}

impl Source {
    #[must_use]
    pub const fn kind(&self) -> SourceKind {
        match self {
            Self::Hub { .. } => SourceKind::Hub,
            Self::Registry { .. } => SourceKind::Registry,
            Self::Direct { .. } => SourceKind::Url,
            Self::Unresolved { .. } => SourceKind::Unknown,
        }
    }

    #[must_use]
    pub const fn is_resolved(&self) -> bool {
        !matches!(self, Self::Unresolved { .. })
    }

    /// Short human description for log lines
    #[must_use]
    pub fn describe(&self) -> String {
        match self {
            Self::Hub { repo, file, .. } => match file {
                Some(file) => format!("HuggingFace {repo} ({file})"),
                None => format!("HuggingFace {repo} (snapshot)"),
            },
            Self::Registry { version_id, .. } => format!("CivitAI version {version_id}"),
            Self::Direct { url, .. } => format!("URL {url}"),
            Self::Unresolved { reason } => format!("unresolved source: {reason}"),
        }
    }
}

/// One model to provision
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelEntry {
    pub name: String,
    pub category: String,
    /// On-disk directory after alias resolution
    pub directory: String,
    pub source: Source,
    pub gated: bool,
}

impl ModelEntry {
    /// Unique key within a run
    #[must_use]
    pub fn key(&self) -> String {
        format!("{}/{}", self.category, self.name)
    }

    /// Source-specific parameters as plain strings. Header values are omitted.
    #[must_use]
    pub fn params(&self) -> BTreeMap<String, String> {
        let mut params = BTreeMap::new();
        params.insert("source".to_string(), self.source.kind().to_string());
        match &self.source {
            Source::Hub {
                repo,
                file,
                revision,
            } => {
                params.insert("repo".to_string(), repo.clone());
                params.insert("revision".to_string(), revision.clone());
                if let Some(file) = file {
                    params.insert("file".to_string(), file.clone());
                }
            }
            Source::Registry {
                version_id,
                filename,
            } => {
                params.insert("version_id".to_string(), version_id.clone());
                if let Some(filename) = filename {
                    params.insert("filename".to_string(), filename.clone());
                }
            }
            Source::Direct {
                url,
                filename,
                headers,
            } => {
                params.insert("url".to_string(), url.clone());
                if let Some(filename) = filename {
                    params.insert("filename".to_string(), filename.clone());
                }
                if !headers.is_empty() {
                    let names: Vec<&str> = headers.keys().map(String::as_str).collect();
                    params.insert("headers".to_string(), names.join(","));
                }
            }
            Source::Unresolved { reason } => {
                params.insert("reason".to_string(), reason.clone());
            }
        }
        params
    }
}

/// Models of one config category, in document order
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Category {
    pub name: String,
    pub directory: String,
    pub entries: Vec<ModelEntry>,
}

/// Normalized provisioning document
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Config {
    pub categories: Vec<Category>,
}

impl Config {
    /// Parse a TOML document, expanding `${VAR}` header references from the process environment
    pub fn parse(text: &str) -> Result<Self> {
        Self::parse_with_env(text, |name| std::env::var(name).ok())
    }

    /// Parse a TOML document with an explicit variable lookup
    pub fn parse_with_env<F>(text: &str, lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let doc: RawDocument = toml::from_str(text)
            .map_err(|e| ProvisionError::ConfigParse(format!("invalid config: {e}")))?;

        let mut seen: HashSet<(String, String)> = HashSet::new();
        let mut categories = Vec::with_capacity(doc.models.len());

        for (category, value) in doc.models {
            let Value::Table(table) = value else {
                return Err(ProvisionError::ConfigParse(format!(
                    "invalid config: category '{category}' must be a table"
                )));
            };
            let directory = category_dir(&category).to_string();
            if !is_known(&category) {
                tracing::debug!("Category '{category}' has no alias, using it as directory name");
            }

            let mut entries = Vec::with_capacity(table.len());
            for (name, raw) in table {
                if name.trim().is_empty() {
                    return Err(ProvisionError::ConfigParse(format!(
                        "category '{category}' contains a model with an empty name"
                    )));
                }

                let (mut source, gated) = normalize_entry(raw, &lookup);

                if !seen.insert((directory.clone(), name.clone())) {
                    tracing::debug!(
                        "Model '{name}' in category '{category}' collides with an earlier entry in directory '{directory}'"
                    );
                    source = Source::Unresolved {
                        reason: format!(
                            "duplicate model name '{name}' in directory '{directory}' (first definition wins)"
                        ),
                    };
                }

                entries.push(ModelEntry {
                    name,
                    category: category.clone(),
                    directory: directory.clone(),
                    source,
                    gated,
                });
            }

            categories.push(Category {
                name: category,
                directory,
                entries,
            });
        }

        Ok(Self { categories })
    }

    pub fn entries(&self) -> impl Iterator<Item = &ModelEntry> {
        self.categories.iter().flat_map(|c| c.entries.iter())
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.categories.iter().map(|c| c.entries.len()).sum()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn gated_entries(&self) -> impl Iterator<Item = &ModelEntry> {
        self.entries().filter(|e| e.gated)
    }

    #[must_use]
    pub fn has_gated(&self) -> bool {
        self.gated_entries().next().is_some()
    }

    /// Find an entry by category and model name
    #[must_use]
    pub fn find(&self, category: &str, name: &str) -> Option<&ModelEntry> {
        self.entries()
            .find(|e| e.category == category && e.name == name)
    }
}

/// Document shape: `[models.<category>]` tables of `<name> = <entry>`.
/// Entries stay untyped here so one bad entry cannot fail the whole document.
#[derive(Deserialize, Debug)]
struct RawDocument {
    models: Table,
}

/// A bare URL string or a table of source fields
#[derive(Deserialize, Debug)]
#[serde(untagged)]
enum RawEntry {
    Url(String),
    Table(RawModel),
}

#[derive(Deserialize, Debug, Default)]
struct RawModel {
    source: Option<String>,
    // huggingface
    repo: Option<String>,
    file: Option<String>,
    revision: Option<String>,
    // civitai; `model_id` is the legacy spelling
    version_id: Option<RawId>,
    model_id: Option<RawId>,
    // url
    url: Option<String>,
    #[serde(default)]
    headers: BTreeMap<String, String>,
    auth_header: Option<String>,
    // civitai and url
    filename: Option<String>,
    #[serde(default)]
    gated: bool,
}

/// Identifier written as a TOML integer or string
#[derive(Deserialize, Debug, Clone)]
#[serde(untagged)]
enum RawId {
    Number(i64),
    Text(String),
}

impl RawId {
    fn into_string(self) -> Option<String> {
        match self {
            Self::Number(n) => Some(n.to_string()),
            Self::Text(s) => non_empty(Some(s)),
        }
    }
}

/// Trimmed value; empty strings count as absent
fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

/// Expand shorthand, infer the source and validate its fields.
///
/// Problems local to one entry become `Source::Unresolved` instead of errors.
fn normalize_entry<F>(raw: Value, lookup: &F) -> (Source, bool)
where
    F: Fn(&str) -> Option<String>,
{
    match raw.try_into::<RawEntry>() {
        Ok(RawEntry::Url(url)) => (direct_shorthand(&url), false),
        Ok(RawEntry::Table(model)) => {
            let gated = model.gated;
            let source = model
                .resolve(lookup)
                .unwrap_or_else(|reason| Source::Unresolved { reason });
            (source, gated)
        }
        Err(e) => (
            Source::Unresolved {
                reason: format!("entry must be a URL string or a table of source fields ({e})"),
            },
            false,
        ),
    }
}

fn direct_shorthand(url: &str) -> Source {
    if urls::is_url(url) {
        Source::Direct {
            url: url.to_string(),
            filename: None,
            headers: BTreeMap::new(),
        }
    } else {
        Source::Unresolved {
            reason: format!("shorthand value '{url}' must start with http:// or https://"),
        }
    }
}

impl RawModel {
    /// Explicit `source` wins; otherwise the first of `repo`, `version_id`/`model_id`, `url`
    fn kind(&self) -> std::result::Result<SourceKind, String> {
        if let Some(source) = &self.source {
            return SourceKind::parse(source).ok_or_else(|| {
                format!("unknown source '{source}' (expected huggingface, civitai or url)")
            });
        }
        Ok(if self.repo.is_some() {
            SourceKind::Hub
        } else if self.version_id.is_some() || self.model_id.is_some() {
            SourceKind::Registry
        } else if self.url.is_some() {
            SourceKind::Url
        } else {
            SourceKind::Unknown
        })
    }

    fn resolve<F>(self, lookup: &F) -> std::result::Result<Source, String>
    where
        F: Fn(&str) -> Option<String>,
    {
        match self.kind()? {
            SourceKind::Hub => {
                let repo = non_empty(self.repo)
                    .ok_or_else(|| "huggingface entries require 'repo'".to_string())?;
                if !repo.contains('/') {
                    return Err(format!("'repo' must be in 'owner/name' form, got '{repo}'"));
                }
                Ok(Source::Hub {
                    repo,
                    file: non_empty(self.file),
                    revision: non_empty(self.revision)
                        .unwrap_or_else(|| DEFAULT_REVISION.to_string()),
                })
            }
            SourceKind::Registry => {
                let version_id = self
                    .version_id
                    .and_then(RawId::into_string)
                    .or_else(|| self.model_id.and_then(RawId::into_string))
                    .ok_or_else(|| "civitai entries require 'version_id'".to_string())?;
                Ok(Source::Registry {
                    version_id,
                    filename: non_empty(self.filename),
                })
            }
            SourceKind::Url => {
                let url = non_empty(self.url)
                    .ok_or_else(|| "url entries require 'url'".to_string())?;
                if !urls::is_url(&url) {
                    return Err(format!("'url' must start with http:// or https://, got '{url}'"));
                }
                let headers = expand_headers(self.headers, non_empty(self.auth_header), lookup);
                Ok(Source::Direct {
                    url,
                    filename: non_empty(self.filename),
                    headers,
                })
            }
            SourceKind::Unknown => Err(
                "no 'source' given and none of 'repo', 'version_id' or 'url' present".to_string(),
            ),
        }
    }
}

/// Expand `${VAR}` references; `auth_header` becomes `Authorization`
fn expand_headers<F>(
    headers: BTreeMap<String, String>,
    auth_header: Option<String>,
    lookup: &F,
) -> BTreeMap<String, String>
where
    F: Fn(&str) -> Option<String>,
{
    headers
        .into_iter()
        .chain(auth_header.map(|auth| ("Authorization".to_string(), auth)))
        .filter_map(|(name, value)| match urls::expand_env_refs(&value, lookup) {
            Ok(expanded) => Some((name, expanded)),
            Err(var) => {
                tracing::warn!("Header '{name}' references unset variable ${{{var}}}, dropping it");
                None
            }
        })
        .collect()
}
