//! Upstream extraction from rendered backend configs
//!
//! Every template must emit exactly one `proxy_pass <url>;` directive. It is
//! the only place a backend's upstream is recorded, so duplicate detection
//! and the access control update both read it back from the file body.

use crate::error::BackendError;
use regex::Regex;
use std::fs;
use std::path::Path;
use std::sync::LazyLock;

static PROXY_PASS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"proxy_pass\s+(http[^\s;]+);").expect("Invalid regex pattern"));

/// URL of the first `proxy_pass` directive, path included
pub fn proxy_pass(content: &str) -> Option<&str> {
    PROXY_PASS
        .captures(content)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str())
}

/// `scheme://host:port` part of a URL; any path is dropped.
///
/// Strings without a `://` separator are returned unchanged.
pub fn origin(url: &str) -> &str {
    let Some(scheme_end) = url.find("://") else {
        return url;
    };
    let authority_start = scheme_end + 3;
    match url[authority_start..].find('/') {
        Some(slash) => &url[..authority_start + slash],
        None => url,
    }
}

/// Read a backend config and return its upstream origin
pub fn extract(path: &Path) -> Result<String, BackendError> {
    let content = fs::read_to_string(path).map_err(|e| {
        BackendError::NotFound(format!(
            "Could not read backend file {}: {}",
            path.display(),
            e
        ))
    })?;

    proxy_pass(&content)
        .map(|url| origin(url).to_string())
        .ok_or_else(|| {
            BackendError::NotFound(format!(
                "Could not extract proxy_pass from {}",
                path.display()
            ))
        })
}
