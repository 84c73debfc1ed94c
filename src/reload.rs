//! Proxy reload trigger
//!
//! Reloads are fire-and-forget. The backend files on disk are what counts;
//! a failed reload is logged and the proxy picks the change up on the next
//! successful one.

use std::process::Stdio;
use tokio::process::Command;
use tracing::{debug, error, info, warn};

/// Something that tells the proxy to re-read its configuration
pub trait Reload: Send + Sync {
    /// Start a reload without waiting for it
    fn reload(&self);
}

/// Runs a shell-style command line such as `sudo openresty -s reload`
#[derive(Debug, Clone)]
pub struct CommandReloader {
    program: String,
    args: Vec<String>,
}

impl CommandReloader {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    /// Split a command line into program and arguments
    pub fn from_command_line(command: &str) -> anyhow::Result<Self> {
        let mut words = shell_words::split(command)
            .map_err(|e| anyhow::anyhow!("Invalid reload command '{}': {}", command, e))?;
        if words.is_empty() {
            anyhow::bail!("Reload command cannot be empty");
        }
        let program = words.remove(0);
        Ok(Self::new(program, words))
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    pub fn args(&self) -> &[String] {
        &self.args
    }
}

impl Reload for CommandReloader {
    fn reload(&self) {
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            warn!(program = %self.program, "No async runtime available, skipping proxy reload");
            return;
        };

        info!("Reloading proxy config after backend change");
        let program = self.program.clone();
        let args = self.args.clone();
        handle.spawn(async move {
            let status = Command::new(&program)
                .args(&args)
                .stdin(Stdio::null())
                .stdout(Stdio::null())
                .status()
                .await;
            match status {
                Ok(status) if status.success() => info!("Proxy reload successful"),
                Ok(status) => {
                    error!(program = %program, code = ?status.code(), "Proxy reload command failed")
                }
                Err(e) => error!(program = %program, error = %e, "Was not able to reload proxy"),
            }
        });
    }
}

/// Reloader for setups where the proxy watches its own config
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopReloader;

impl Reload for NoopReloader {
    fn reload(&self) {
        debug!("Proxy reload disabled, skipping");
    }
}
