//! Per-backend user allow-lists
//!
//! Each backend with access control has a directory `{user_dir}/{id}` holding
//! one empty file per allowed user, named `{user}{suffix}`. The proxy's access
//! check looks the files up directly.

use crate::error::BackendError;
use crate::validate;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// One allow-list entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub user: String,
}

#[derive(Debug, Clone)]
pub struct UserStore {
    dir: PathBuf,
    suffix: String,
}

impl UserStore {
    pub fn new(dir: impl Into<PathBuf>, suffix: impl Into<String>) -> Self {
        Self {
            dir: dir.into(),
            suffix: suffix.into(),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn backend_dir(&self, backend_id: u64) -> PathBuf {
        self.dir.join(backend_id.to_string())
    }

    fn file_name(&self, user: &str) -> String {
        format!("{}{}", user, self.suffix)
    }

    /// Users allowed on a backend; empty when it has no allow-list
    pub fn list(&self, backend_id: u64) -> Vec<User> {
        let path = self.backend_dir(backend_id);
        let entries = match fs::read_dir(&path) {
            Ok(entries) => entries,
            Err(e) => {
                if e.kind() != io::ErrorKind::NotFound {
                    warn!(path = %path.display(), error = %e, "Not able to access user path");
                }
                return Vec::new();
            }
        };

        let mut users: Vec<User> = entries
            .filter_map(Result::ok)
            .filter_map(|entry| entry.file_name().into_string().ok())
            .map(|name| User {
                user: name
                    .strip_suffix(self.suffix.as_str())
                    .map(str::to_string)
                    .unwrap_or(name),
            })
            .collect();
        users.sort_by(|a, b| a.user.cmp(&b.user));
        users
    }

    pub fn add(&self, backend_id: u64, user: &str) -> Result<User, BackendError> {
        validate::user_id(user)?;

        let path = self.backend_dir(backend_id);
        fs::create_dir_all(&path).map_err(|e| {
            BackendError::io(format!("Not able to create user directory for backend {}", backend_id), e)
        })?;

        let file = path.join(self.file_name(user));
        match fs::OpenOptions::new().write(true).create_new(true).open(&file) {
            Ok(_) => {
                info!(backend_id, user, "Added user to backend");
                Ok(User { user: user.to_string() })
            }
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => Err(BackendError::Conflict(format!(
                "User {} already added to backend {}.",
                user, backend_id
            ))),
            Err(e) => Err(BackendError::io(
                format!("Could not add {} to {}", user, backend_id),
                e,
            )),
        }
    }

    /// Remove one user. Removing the last one drops the whole allow-list.
    pub fn remove(&self, backend_id: u64, user: &str) -> Result<(), BackendError> {
        validate::user_id(user)?;

        let path = self.backend_dir(backend_id);
        let file = path.join(self.file_name(user));
        if !file.exists() {
            return Err(BackendError::NotFound(format!(
                "No user {} found for backend {}.",
                user, backend_id
            )));
        }

        info!(backend_id, user, "Deleting user from backend");
        if self.list(backend_id).len() <= 1 {
            return self.remove_all(backend_id);
        }
        fs::remove_file(&file).map_err(|e| {
            BackendError::io(format!("Not able to delete user {} from backend {}", user, backend_id), e)
        })
    }

    /// Drop a backend's allow-list. A backend without one is not an error.
    pub fn remove_all(&self, backend_id: u64) -> Result<(), BackendError> {
        let path = self.backend_dir(backend_id);
        match fs::remove_dir_all(&path) {
            Ok(()) => {
                info!(backend_id, "Deleted user allow-list");
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(BackendError::io(
                format!("Not able to delete users for backend {}", backend_id),
                e,
            )),
        }
    }
}
