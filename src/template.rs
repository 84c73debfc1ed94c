//! Backend config templates
//!
//! Templates live in one directory as `{name}%{version}.conf` files and are
//! rendered with `minijinja`.

use crate::codec::EXTENSION;
use crate::error::BackendError;
use minijinja::Environment;
use serde::Serialize;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, error};

/// A template available on disk
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TemplateInfo {
    pub name: String,
    pub version: String,
}

/// Values a backend template can refer to
#[derive(Debug, Clone, Serialize)]
pub struct Bindings<'a> {
    /// Full location key, e.g. `myapp_100`
    pub key_url: &'a str,
    pub owner: &'a str,
    pub backend_id: u64,
    pub upstream_url: &'a str,
    /// Older templates use this name for the upstream
    pub location_url: &'a str,
    pub auth_enabled: bool,
    pub backend_path: &'a str,
    /// Older templates use this name for the backend directory
    pub forc_backend_path: &'a str,
    pub user_path: &'a str,
}

#[derive(Debug, Clone)]
pub struct TemplateStore {
    dir: PathBuf,
}

impl TemplateStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn file_name(name: &str, version: &str) -> String {
        format!("{}%{}{}", name, version, EXTENSION)
    }

    /// Render `{name}%{version}.conf` with the given bindings
    pub fn render(
        &self,
        name: &str,
        version: &str,
        bindings: &Bindings<'_>,
    ) -> Result<String, BackendError> {
        let file_name = Self::file_name(name, version);
        let path = self.dir.join(&file_name);

        let source = match fs::read_to_string(&path) {
            Ok(source) => source,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                error!(path = %path.display(), "Template file not found");
                return Err(BackendError::NotFound(format!(
                    "Template {} version {} was not found.",
                    name, version
                )));
            }
            Err(e) => {
                return Err(BackendError::io(
                    format!("Failed to read template {}", path.display()),
                    e,
                ))
            }
        };

        let mut env = Environment::new();
        env.set_keep_trailing_newline(true);
        env.add_template(&file_name, &source)
            .map_err(|e| BackendError::Template(format!("Invalid template {}: {}", file_name, e)))?;

        let rendered = env
            .get_template(&file_name)
            .and_then(|template| template.render(bindings))
            .map_err(|e| {
                BackendError::Template(format!("Failed to render template {}: {}", file_name, e))
            })?;

        debug!(template = %file_name, key_url = bindings.key_url, "Rendered backend template");
        Ok(rendered)
    }

    /// Templates on disk, optionally filtered by name and version.
    ///
    /// An unreadable directory yields an empty list.
    pub fn list(&self, name: Option<&str>, version: Option<&str>) -> Vec<TemplateInfo> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) => {
                error!(path = %self.dir.display(), error = %e, "Not able to access configured template path");
                return Vec::new();
            }
        };

        let mut templates: Vec<TemplateInfo> = entries
            .filter_map(Result::ok)
            .filter_map(|entry| entry.file_name().into_string().ok())
            .filter_map(|file_name| {
                let stem = file_name.strip_suffix(EXTENSION)?;
                let (n, v) = stem.rsplit_once('%')?;
                Some(TemplateInfo {
                    name: n.to_string(),
                    version: v.to_string(),
                })
            })
            .filter(|t| name.map_or(true, |n| t.name == n))
            .filter(|t| version.map_or(true, |v| t.version == v))
            .collect();

        templates.sort_by(|a, b| (&a.name, &a.version).cmp(&(&b.name, &b.version)));
        templates
    }
}
