//! URL helpers shared by the config fetcher and the direct downloader
//!
//! Google Drive sharing links (`/file/d/<id>/view`, `open?id=`, `uc?id=`) are
//! rewritten to the `uc?export=download` endpoint. Files Drive cannot virus-scan
//! come back as an HTML warning page; [`confirm_url`] digs the real download
//! link out of that page.

use regex::Regex;
use reqwest::Url;
use std::path::PathBuf;
use std::sync::OnceLock;

const DRIVE_HOSTS: &[&str] = &[
    "drive.google.com",
    "docs.google.com",
    "drive.usercontent.google.com",
];

/// Longest filename accepted from a URL or header
const MAX_FILENAME_LEN: usize = 255;

fn drive_patterns() -> &'static [Regex] {
    static PATTERNS: OnceLock<Vec<Regex>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        [
            r"drive\.google\.com/file/d/([a-zA-Z0-9_-]+)",
            r"(?:drive|docs)\.google\.com/(?:uc|open)\?(?:[^#]*&)?id=([a-zA-Z0-9_-]+)",
        ]
        .iter()
        .filter_map(|p| Regex::new(p).ok())
        .collect()
    })
}

/// Whether `source` should be fetched over HTTP rather than read from disk
#[must_use]
pub fn is_url(source: &str) -> bool {
    source.starts_with("http://") || source.starts_with("https://")
}

/// File id of a Google Drive sharing link, if `url` is one
#[must_use]
pub fn drive_file_id(url: &str) -> Option<String> {
    drive_patterns()
        .iter()
        .find_map(|re| re.captures(url))
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_string())
}

#[must_use]
pub fn is_drive_host(url: &str) -> bool {
    Url::parse(url)
        .ok()
        .and_then(|u| u.host_str().map(str::to_ascii_lowercase))
        .is_some_and(|host| DRIVE_HOSTS.contains(&host.as_str()))
}

/// Whether a response for `url` may be a Drive page rather than the file
#[must_use]
pub fn is_drive_link(url: &str) -> bool {
    drive_file_id(url).is_some() || is_drive_host(url)
}

/// Rewrite a Drive sharing link to the direct-download endpoint.
///
/// Any other URL comes back unchanged.
#[must_use]
pub fn rewrite_sharing_link(url: &str, drive_endpoint: &str) -> String {
    match drive_file_id(url) {
        Some(id) => format!(
            "{}/uc?export=download&id={id}",
            drive_endpoint.trim_end_matches('/')
        ),
        None => url.to_string(),
    }
}

/// Whether an HTML body is Drive's "cannot scan this file for viruses" page
#[must_use]
pub fn is_interstitial(body: &str) -> bool {
    body.contains("Virus scan warning")
        || body.contains("id=\"download-form\"")
        || body.contains("uc-download-link")
        || body.contains("can't scan this file for viruses")
}

/// Extract the confirmation download link from a Drive interstitial page.
///
/// Older pages carry an `href` with a `confirm=` token, newer ones a
/// `download-form` whose hidden inputs make up the query string.
#[must_use]
pub fn confirm_url(body: &str, base: &Url) -> Option<Url> {
    static HREF: OnceLock<Option<Regex>> = OnceLock::new();
    static FORM: OnceLock<Option<Regex>> = OnceLock::new();
    static ACTION: OnceLock<Option<Regex>> = OnceLock::new();
    static INPUT: OnceLock<Option<Regex>> = OnceLock::new();
    static NAME: OnceLock<Option<Regex>> = OnceLock::new();
    static VALUE: OnceLock<Option<Regex>> = OnceLock::new();

    let href = HREF
        .get_or_init(|| Regex::new(r#"href="([^"]*confirm=[^"]*)""#).ok())
        .as_ref()?;
    if let Some(link) = href.captures(body).and_then(|c| c.get(1)) {
        return base.join(&html_unescape(link.as_str())).ok();
    }

    let form = FORM
        .get_or_init(|| Regex::new(r#"<form[^>]*id="download-form"[^>]*>"#).ok())
        .as_ref()?;
    let action = ACTION
        .get_or_init(|| Regex::new(r#"action="([^"]+)""#).ok())
        .as_ref()?;
    let input = INPUT
        .get_or_init(|| Regex::new(r#"<input[^>]*type="hidden"[^>]*>"#).ok())
        .as_ref()?;
    let name = NAME
        .get_or_init(|| Regex::new(r#"name="([^"]*)""#).ok())
        .as_ref()?;
    let value = VALUE
        .get_or_init(|| Regex::new(r#"value="([^"]*)""#).ok())
        .as_ref()?;

    let form_tag = form.find(body)?;
    let target = action.captures(form_tag.as_str())?.get(1)?.as_str();
    let mut url = base.join(&html_unescape(target)).ok()?;

    let rest = &body[form_tag.end()..];
    let rest = rest.split("</form>").next().unwrap_or(rest);
    {
        let mut query = url.query_pairs_mut();
        for tag in input.find_iter(rest) {
            let tag = tag.as_str();
            let Some(key) = name.captures(tag).and_then(|c| c.get(1)) else {
                continue;
            };
            let val = value
                .captures(tag)
                .and_then(|c| c.get(1))
                .map_or(String::new(), |m| html_unescape(m.as_str()));
            query.append_pair(key.as_str(), &val);
        }
    }
    Some(url)
}

fn html_unescape(s: &str) -> String {
    s.replace("&amp;", "&")
        .replace("&#x3D;", "=")
        .replace("&#61;", "=")
        .replace("&quot;", "\"")
}

/// Last path segment of `url` when it looks like a file name
#[must_use]
pub fn filename_from_url(url: &str) -> Option<String> {
    let parsed = Url::parse(url).ok()?;
    let segment = parsed.path_segments()?.last()?;
    let decoded = urlencoding::decode(segment).ok()?;
    if !decoded.contains('.') || decoded.len() >= MAX_FILENAME_LEN {
        return None;
    }
    sanitize_filename(&decoded)
}

/// File name announced by a `Content-Disposition` header
#[must_use]
pub fn filename_from_content_disposition(header: &str) -> Option<String> {
    static EXTENDED: OnceLock<Option<Regex>> = OnceLock::new();
    static PLAIN: OnceLock<Option<Regex>> = OnceLock::new();

    let extended = EXTENDED
        .get_or_init(|| Regex::new(r"(?i)filename\*\s*=\s*(?:[a-z0-9_-]+)?'[^']*'([^;]+)").ok())
        .as_ref()?;
    if let Some(m) = extended.captures(header).and_then(|c| c.get(1)) {
        if let Ok(decoded) = urlencoding::decode(m.as_str().trim()) {
            if let Some(name) = sanitize_filename(&decoded) {
                return Some(name);
            }
        }
    }

    let plain = PLAIN
        .get_or_init(|| Regex::new(r#"(?i)filename\s*=\s*"?([^";\r\n]+)"?"#).ok())
        .as_ref()?;
    let m = plain.captures(header)?.get(1)?;
    sanitize_filename(m.as_str())
}

/// Reduce a remote-supplied name to a bare file name.
///
/// Returns `None` for empty names and `.`/`..`.
#[must_use]
pub fn sanitize_filename(name: &str) -> Option<String> {
    let trimmed = name.trim().trim_matches(|c| c == '"' || c == '\'');
    let base = trimmed.rsplit(['/', '\\']).next()?.trim();
    if base.is_empty() || base == "." || base == ".." || base.len() >= MAX_FILENAME_LEN {
        return None;
    }
    Some(base.to_string())
}

/// Turn a repository-relative path into a relative `PathBuf`, rejecting traversal
#[must_use]
pub fn sanitize_relative_path(path: &str) -> Option<PathBuf> {
    let mut out = PathBuf::new();
    for part in path.split(['/', '\\']) {
        match part {
            "" | "." => {}
            ".." => return None,
            other => out.push(other),
        }
    }
    if out.as_os_str().is_empty() {
        None
    } else {
        Some(out)
    }
}

/// Expand `${VAR}` references using `lookup`.
///
/// Fails with the name of the first variable `lookup` cannot resolve.
pub fn expand_env_refs<F>(value: &str, lookup: F) -> Result<String, String>
where
    F: Fn(&str) -> Option<String>,
{
    static VAR: OnceLock<Option<Regex>> = OnceLock::new();
    let Some(re) = VAR
        .get_or_init(|| Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}").ok())
        .as_ref()
    else {
        return Ok(value.to_string());
    };

    let mut out = String::with_capacity(value.len());
    let mut last = 0;
    for caps in re.captures_iter(value) {
        let (Some(whole), Some(name)) = (caps.get(0), caps.get(1)) else {
            continue;
        };
        let resolved = lookup(name.as_str()).ok_or_else(|| name.as_str().to_string())?;
        out.push_str(&value[last..whole.start()]);
        out.push_str(&resolved);
        last = whole.end();
    }
    out.push_str(&value[last..]);
    Ok(out)
}
