//! Backend records and the request types that produce them

use crate::error::BackendError;
use crate::validate;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

/// Lowest suffix handed out for a location key prefix
pub const SUFFIX_MIN: u16 = 100;
/// Highest suffix handed out for a location key prefix
pub const SUFFIX_MAX: u16 = 999;

/// A single proxy location, as encoded in the name of its config file.
///
/// `file_path` is derived from where the file lives and is not part of the
/// record's identity: two records compare equal when every encoded field
/// matches, wherever their files are.
#[derive(Debug, Clone, Serialize)]
pub struct BackendRecord {
    pub id: u64,
    pub owner: String,
    pub location_url: String,
    pub template: String,
    pub template_version: String,
    pub auth_enabled: bool,
    #[serde(skip)]
    pub file_path: PathBuf,
}

impl PartialEq for BackendRecord {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
            && self.owner == other.owner
            && self.location_url == other.location_url
            && self.template == other.template
            && self.template_version == other.template_version
            && self.auth_enabled == other.auth_enabled
    }
}

impl Eq for BackendRecord {}

impl BackendRecord {
    /// Parsed location key, if the stored one has the `{prefix}_{suffix}` shape
    pub fn location_key(&self) -> Option<LocationKey> {
        LocationKey::parse(&self.location_url)
    }
}

/// Public path token of a backend: user chosen prefix plus numeric suffix
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LocationKey {
    pub prefix: String,
    pub suffix: u16,
}

impl LocationKey {
    pub fn new(prefix: impl Into<String>, suffix: u16) -> Self {
        Self {
            prefix: prefix.into(),
            suffix,
        }
    }

    /// Split on the last `_`. Returns `None` when there is no separator or the
    /// suffix is not exactly three digits, so a parsed key always displays
    /// back to `raw`.
    pub fn parse(raw: &str) -> Option<Self> {
        let (prefix, suffix) = raw.rsplit_once('_')?;
        if prefix.is_empty() || suffix.len() != 3 || !suffix.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        let suffix = suffix.parse().ok()?;
        Some(Self::new(prefix, suffix))
    }
}

impl fmt::Display for LocationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{:03}", self.prefix, self.suffix)
    }
}

/// Request to create a new backend
#[derive(Debug, Clone, Deserialize)]
pub struct NewBackend {
    pub owner: String,
    /// Prefix of the location key, chosen by the user
    pub user_key_url: String,
    /// Full URL (with scheme) of the service the proxy forwards to
    pub upstream_url: String,
    pub template: String,
    pub template_version: String,
    #[serde(default = "default_auth_enabled")]
    pub auth_enabled: bool,
}

fn default_auth_enabled() -> bool {
    true
}

impl NewBackend {
    /// Check every field before anything touches the registry
    pub fn validate(&self) -> Result<(), BackendError> {
        validate::owner(&self.owner)?;
        validate::key_prefix(&self.user_key_url)?;
        validate::upstream_url(&self.upstream_url)?;
        validate::template_field("template", &self.template)?;
        validate::template_field("template_version", &self.template_version)?;
        Ok(())
    }
}

/// Body of the access control toggle
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct AuthUpdate {
    pub auth_enabled: bool,
}
