use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Environment variable overriding `server.api_key`
pub const ENV_API_KEY: &str = "ROUTEKEEPER_API_KEY";
/// Environment variable overriding `paths.backend_dir`
pub const ENV_BACKEND_DIR: &str = "ROUTEKEEPER_BACKEND_DIR";
/// Environment variable overriding `paths.template_dir`
pub const ENV_TEMPLATE_DIR: &str = "ROUTEKEEPER_TEMPLATE_DIR";

/// Global configuration for the control plane
#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    /// API server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Backend, template and user directories
    #[serde(default)]
    pub paths: PathsConfig,

    /// How the proxy is told to pick up changes
    #[serde(default)]
    pub reload: ReloadConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    /// Bind address (default: 0.0.0.0)
    #[serde(default = "default_bind_address")]
    pub bind: String,

    /// API port (default: 8000)
    #[serde(default = "default_port")]
    pub port: u16,

    /// Shared secret expected in the X-API-KEY header.
    /// If not set, a random key is generated at startup and logged
    pub api_key: Option<String>,

    /// Path to PID file (optional)
    pub pid_file: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind_address(),
            port: default_port(),
            api_key: None,
            pid_file: None,
        }
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct PathsConfig {
    /// Directory holding the rendered backend configs
    #[serde(default)]
    pub backend_dir: String,

    /// Directory holding `{name}%{version}.conf` templates
    #[serde(default)]
    pub template_dir: String,

    /// Directory of per-backend user allow-lists (default: {backend_dir}/users)
    pub user_dir: Option<String>,

    /// Appended to user ids to form allow-list file names
    #[serde(default = "default_user_suffix")]
    pub user_suffix: String,
}

impl PathsConfig {
    pub fn backend_dir(&self) -> PathBuf {
        PathBuf::from(&self.backend_dir)
    }

    pub fn template_dir(&self) -> PathBuf {
        PathBuf::from(&self.template_dir)
    }

    pub fn user_dir(&self) -> PathBuf {
        match &self.user_dir {
            Some(dir) => PathBuf::from(dir),
            None => self.backend_dir().join("users"),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ReloadConfig {
    /// Run the reload command after every change (default: true)
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Command line that makes the proxy re-read its config
    #[serde(default = "default_reload_command")]
    pub command: String,
}

impl Default for ReloadConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            command: default_reload_command(),
        }
    }
}

// Default value functions
fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8000
}

fn default_user_suffix() -> String {
    "@elixir-europe.org".to_string()
}

fn default_true() -> bool {
    true
}

fn default_reload_command() -> String {
    "sudo openresty -s reload".to_string()
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let mut config: Config = toml::from_str(&content)?;
        config.apply_overrides(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    /// Let environment variables win over the file
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(key) = lookup(ENV_API_KEY) {
            self.server.api_key = Some(key);
        }
        if let Some(dir) = lookup(ENV_BACKEND_DIR) {
            self.paths.backend_dir = dir;
        }
        if let Some(dir) = lookup(ENV_TEMPLATE_DIR) {
            self.paths.template_dir = dir;
        }
    }

    /// Validate all configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        let mut errors = Vec::new();

        if self.paths.backend_dir.is_empty() {
            errors.push(format!("paths.backend_dir is required (or set {})", ENV_BACKEND_DIR));
        }
        if self.paths.template_dir.is_empty() {
            errors.push(format!("paths.template_dir is required (or set {})", ENV_TEMPLATE_DIR));
        }
        if matches!(&self.server.api_key, Some(key) if key.is_empty()) {
            errors.push("server.api_key cannot be empty".to_string());
        }
        if self.reload.enabled && shell_words::split(&self.reload.command).map_or(true, |w| w.is_empty()) {
            errors.push(format!("reload.command is not a valid command line: '{}'", self.reload.command));
        }

        if !errors.is_empty() {
            anyhow::bail!("Configuration errors:\n  - {}", errors.join("\n  - "));
        }

        Ok(())
    }
}
