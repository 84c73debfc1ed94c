//! Backend lifecycle: create, delete and access control updates
//!
//! All mutations run under one lock around the registry, so allocation,
//! duplicate cleanup and the file write of one request never interleave with
//! another's. The proxy reload is triggered after the lock is released.

use crate::allocator;
use crate::codec;
use crate::duplicates;
use crate::error::BackendError;
use crate::record::{BackendRecord, LocationKey, NewBackend};
use crate::registry::Registry;
use crate::reload::Reload;
use crate::template::{Bindings, TemplateStore};
use crate::upstream;
use parking_lot::Mutex;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, error, info};

/// Identity carried over when a backend is replaced
struct Pinned {
    id: u64,
    suffix: u16,
    /// File name of the record being replaced
    replaces: String,
}

pub struct BackendService {
    registry: Mutex<Registry>,
    templates: TemplateStore,
    reloader: Arc<dyn Reload>,
    /// Passed to templates so access checks can find the allow-lists
    user_dir: PathBuf,
}

impl BackendService {
    pub fn new(
        registry: Registry,
        templates: TemplateStore,
        reloader: Arc<dyn Reload>,
        user_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            registry: Mutex::new(registry),
            templates,
            reloader,
            user_dir: user_dir.into(),
        }
    }

    pub fn templates(&self) -> &TemplateStore {
        &self.templates
    }

    pub fn list(&self) -> Vec<BackendRecord> {
        self.registry.lock().list()
    }

    pub fn get(&self, id: u64) -> Result<BackendRecord, BackendError> {
        self.registry.lock().find_by_id(id).cloned()
    }

    pub fn list_by_owner(&self, owner: &str) -> Vec<BackendRecord> {
        self.registry
            .lock()
            .records()
            .filter(|r| r.owner == owner)
            .cloned()
            .collect()
    }

    pub fn list_by_template(&self, template: &str) -> Vec<BackendRecord> {
        self.registry
            .lock()
            .records()
            .filter(|r| r.template == template)
            .cloned()
            .collect()
    }

    /// Rebuild the index from the backend directory
    pub fn rescan(&self) -> usize {
        self.registry.lock().rescan()
    }

    /// Create a backend with a fresh id and location key.
    ///
    /// Existing backends for the same upstream are deleted first.
    pub fn create(&self, input: &NewBackend) -> Result<BackendRecord, BackendError> {
        input.validate()?;
        debug!(
            owner = %input.owner,
            template = %input.template,
            version = %input.template_version,
            "Creating backend"
        );

        let record = {
            let mut registry = self.registry.lock();
            self.create_locked(&mut registry, input, None)?
        };

        info!(id = record.id, location = %record.location_url, "Created backend");
        self.reloader.reload();
        Ok(record)
    }

    /// Delete the backend with `id`
    pub fn delete(&self, id: u64) -> Result<BackendRecord, BackendError> {
        let record = self.registry.lock().remove(id)?;
        self.reloader.reload();
        Ok(record)
    }

    /// Re-render a backend with a new access control flag.
    ///
    /// Id, owner, location key, template and upstream are kept. The new file
    /// is written before the old one is removed.
    pub fn update_auth(&self, id: u64, auth_enabled: bool) -> Result<BackendRecord, BackendError> {
        let record = {
            let mut registry = self.registry.lock();
            let current = registry.find_by_id(id)?.clone();

            let upstream_url = upstream::extract(&current.file_path).map_err(|e| {
                error!(id, error = %e, "Could not extract upstream url for updating authorization");
                BackendError::InvalidState(format!(
                    "Could not extract upstream url from backend {}",
                    id
                ))
            })?;
            let key = current.location_key().ok_or_else(|| {
                error!(id, location = %current.location_url, "location_url has no suffix pattern");
                BackendError::InvalidState(format!(
                    "Location url {} of backend {} has no suffix",
                    current.location_url, id
                ))
            })?;

            let input = NewBackend {
                owner: current.owner.clone(),
                user_key_url: key.prefix,
                upstream_url,
                template: current.template.clone(),
                template_version: current.template_version.clone(),
                auth_enabled,
            };
            input.validate()?;

            let pinned = Pinned {
                id,
                suffix: key.suffix,
                replaces: codec::encode(&current),
            };
            self.create_locked(&mut registry, &input, Some(pinned))?
        };

        info!(id, auth_enabled, "Updated backend authorization");
        self.reloader.reload();
        Ok(record)
    }

    fn create_locked(
        &self,
        registry: &mut Registry,
        input: &NewBackend,
        pinned: Option<Pinned>,
    ) -> Result<BackendRecord, BackendError> {
        let (id, suffix) = match &pinned {
            Some(p) => (p.id, p.suffix),
            None => (
                allocator::allocate_id(registry)?,
                allocator::allocate_suffix(registry, &input.user_key_url)?,
            ),
        };
        let location = LocationKey::new(input.user_key_url.clone(), suffix).to_string();
        debug!(id, location = %location, "Assigned backend id and location");

        if let Some(holder) = registry.find_by_location(&location) {
            if holder.id != id {
                return Err(BackendError::Conflict(format!(
                    "Location {} is already used by backend {}",
                    location, holder.id
                )));
            }
        }

        let backend_path = registry.dir().to_string_lossy().into_owned();
        let user_path = self.user_dir.to_string_lossy().into_owned();
        let bindings = Bindings {
            key_url: &location,
            owner: &input.owner,
            backend_id: id,
            upstream_url: &input.upstream_url,
            location_url: &input.upstream_url,
            auth_enabled: input.auth_enabled,
            backend_path: &backend_path,
            forc_backend_path: &backend_path,
            user_path: &user_path,
        };
        let contents = self
            .templates
            .render(&input.template, &input.template_version, &bindings)?;
        if contents.trim().is_empty() {
            return Err(BackendError::Template(
                "Server was not able to template a new backend.".to_string(),
            ));
        }

        if !duplicates::resolve(registry, &input.upstream_url, pinned.as_ref().map(|p| p.id)) {
            return Err(BackendError::Internal(
                "Server was not able to delete duplicate backends before creating a new one."
                    .to_string(),
            ));
        }

        let record = BackendRecord {
            id,
            owner: input.owner.clone(),
            location_url: location,
            template: input.template.clone(),
            template_version: input.template_version.clone(),
            auth_enabled: input.auth_enabled,
            file_path: PathBuf::new(),
        };
        let record = registry.write(record, &contents)?;

        if let Some(p) = pinned {
            if p.replaces != codec::encode(&record) {
                registry.remove_file(&p.replaces).map_err(|e| {
                    error!(id, error = %e, "New backend file written but old one could not be removed");
                    e
                })?;
            }
        }

        Ok(record)
    }
}
