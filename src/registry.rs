//! Backend registry
//!
//! The backend directory is the only persistent state. [`list_all`] decodes
//! it from scratch; [`Registry`] keeps an index built from such a scan and
//! updated in step with every file this process writes or removes.

use crate::codec;
use crate::error::BackendError;
use crate::record::BackendRecord;
use crate::upstream;
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, error, info, warn};

/// Decode every backend file in `dir`.
///
/// An unreadable directory yields an empty list, same as an empty one.
/// Entries that do not decode are skipped.
pub fn list_all(dir: &Path) -> Vec<BackendRecord> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) => {
            error!(path = %dir.display(), error = %e, "Not able to access configured backend path");
            return Vec::new();
        }
    };

    let mut backends = Vec::new();
    for entry in entries {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                warn!(path = %dir.display(), error = %e, "Failed to read backend directory entry");
                continue;
            }
        };

        let file_name = entry.file_name();
        let Some(name) = file_name.to_str() else {
            warn!(file = ?file_name, "Found a backend file with a non UTF-8 name, skipping it");
            continue;
        };

        if let Some(mut record) = codec::decode(name) {
            record.file_path = dir.join(name);
            debug!(id = record.id, location = %record.location_url, "Discovered backend");
            backends.push(record);
        }
    }

    backends.sort_by(|a, b| a.file_path.cmp(&b.file_path));
    backends
}

/// Index over the backend directory
#[derive(Debug)]
pub struct Registry {
    dir: PathBuf,
    /// Records keyed by file name
    records: BTreeMap<String, BackendRecord>,
    /// File names per backend id; more than one means the directory is corrupt
    by_id: HashMap<u64, Vec<String>>,
    by_location: HashMap<String, u64>,
}

impl Registry {
    /// Build the index from a scan of `dir`
    pub fn open(dir: impl Into<PathBuf>) -> Self {
        let mut registry = Self {
            dir: dir.into(),
            records: BTreeMap::new(),
            by_id: HashMap::new(),
            by_location: HashMap::new(),
        };
        registry.rescan();
        registry
    }

    /// Throw the index away and rebuild it from disk. Returns the backend count.
    pub fn rescan(&mut self) -> usize {
        self.records.clear();
        self.by_id.clear();
        self.by_location.clear();

        for record in list_all(&self.dir) {
            self.index(record);
        }

        for (id, names) in &self.by_id {
            if names.len() > 1 {
                warn!(id, files = ?names, "Multiple backend files share one id");
            }
        }

        info!(path = %self.dir.display(), backends = self.records.len(), "Backend registry loaded");
        self.records.len()
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn records(&self) -> impl Iterator<Item = &BackendRecord> {
        self.records.values()
    }

    /// Snapshot of all records, ordered by file name
    pub fn list(&self) -> Vec<BackendRecord> {
        self.records.values().cloned().collect()
    }

    pub fn contains_id(&self, id: u64) -> bool {
        self.by_id.contains_key(&id)
    }

    pub fn find_by_id(&self, id: u64) -> Result<&BackendRecord, BackendError> {
        self.by_id
            .get(&id)
            .and_then(|names| names.first())
            .and_then(|name| self.records.get(name))
            .ok_or_else(|| BackendError::NotFound(format!("Backend with id {} was not found.", id)))
    }

    pub fn find_by_location(&self, location_url: &str) -> Option<&BackendRecord> {
        self.by_location
            .get(location_url)
            .and_then(|id| self.find_by_id(*id).ok())
    }

    /// Group records by the upstream origin found in their config body.
    ///
    /// Records whose file has no readable `proxy_pass` are left out.
    pub fn group_by_upstream(&self) -> HashMap<String, Vec<BackendRecord>> {
        let mut groups: HashMap<String, Vec<BackendRecord>> = HashMap::new();

        for record in self.records.values() {
            match upstream::extract(&record.file_path) {
                Ok(origin) => groups.entry(origin).or_default().push(record.clone()),
                Err(e) => {
                    warn!(id = record.id, error = %e, "Skipping backend without upstream");
                }
            }
        }

        groups
    }

    /// Persist a rendered config under the record's encoded name and index it.
    ///
    /// The body is written to a `.routekeeper-` temporary file in the same
    /// directory and then renamed into place, so readers never see a partial
    /// config. An existing file with the same name is replaced.
    pub fn write(
        &mut self,
        mut record: BackendRecord,
        contents: &str,
    ) -> Result<BackendRecord, BackendError> {
        let name = codec::encode(&record);
        let path = self.dir.join(&name);

        let mut tmp = tempfile::Builder::new()
            .prefix(codec::TEMP_PREFIX)
            .tempfile_in(&self.dir)
            .map_err(|e| {
                BackendError::io(
                    format!("Failed to create temporary file in {}", self.dir.display()),
                    e,
                )
            })?;
        tmp.write_all(contents.as_bytes())
            .map_err(|e| BackendError::io("Failed to write backend file", e))?;
        tmp.as_file()
            .sync_all()
            .map_err(|e| BackendError::io("Failed to flush backend file", e))?;

        // Temporary files are created owner-only; the proxy must be able to read configs
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            tmp.as_file()
                .set_permissions(fs::Permissions::from_mode(0o644))
                .map_err(|e| BackendError::io("Failed to set backend file permissions", e))?;
        }

        tmp.persist(&path).map_err(|e| {
            BackendError::io(format!("Failed to persist backend file {}", path.display()), e.error)
        })?;

        info!(id = record.id, path = %path.display(), "Backend file written");

        record.file_path = path;
        self.unindex(&name);
        self.index(record.clone());
        Ok(record)
    }

    /// Delete the single file belonging to `id`
    pub fn remove(&mut self, id: u64) -> Result<BackendRecord, BackendError> {
        let names = self.by_id.get(&id).cloned().unwrap_or_default();
        match names.as_slice() {
            [] => Err(BackendError::NotFound(format!("Backend {} was not found.", id))),
            [name] => self.remove_file(name),
            _ => {
                error!(id, files = ?names, "Found multiple backend files for backend id, cannot delete");
                Err(BackendError::Conflict(format!(
                    "Found {} backend files for id {}, cannot delete.",
                    names.len(),
                    id
                )))
            }
        }
    }

    /// Delete one backend file by name
    pub fn remove_file(&mut self, file_name: &str) -> Result<BackendRecord, BackendError> {
        let Some(record) = self.records.get(file_name).cloned() else {
            return Err(BackendError::NotFound(format!(
                "Backend file {} was not found.",
                file_name
            )));
        };

        match fs::remove_file(&record.file_path) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                // Removed behind our back; the index was stale
                warn!(id = record.id, path = %record.file_path.display(), "Backend file already gone");
                self.unindex(file_name);
                return Err(BackendError::NotFound(format!(
                    "Backend {} was not found.",
                    record.id
                )));
            }
            Err(e) => {
                warn!(id = record.id, error = %e, "Was not able to delete backend");
                return Err(BackendError::io(
                    format!("Failed to delete backend {}", record.id),
                    e,
                ));
            }
        }

        info!(id = record.id, path = %record.file_path.display(), "Deleted backend");
        self.unindex(file_name);
        Ok(record)
    }

    fn index(&mut self, record: BackendRecord) {
        let name = codec::encode(&record);
        if let Some(other) = self.by_location.get(&record.location_url) {
            if *other != record.id {
                warn!(
                    location = %record.location_url,
                    id = record.id,
                    other = *other,
                    "Location key used by more than one backend"
                );
            }
        }
        self.by_id.entry(record.id).or_default().push(name.clone());
        self.by_location.insert(record.location_url.clone(), record.id);
        self.records.insert(name, record);
    }

    fn unindex(&mut self, file_name: &str) {
        let Some(record) = self.records.remove(file_name) else {
            return;
        };

        if let Some(names) = self.by_id.get_mut(&record.id) {
            names.retain(|n| n != file_name);
            if names.is_empty() {
                self.by_id.remove(&record.id);
            }
        }

        // Keep the location mapping if another file of the same id still holds it
        let still_held = self
            .by_id
            .get(&record.id)
            .into_iter()
            .flatten()
            .filter_map(|n| self.records.get(n))
            .any(|r| r.location_url == record.location_url);
        if !still_held && self.by_location.get(&record.location_url) == Some(&record.id) {
            self.by_location.remove(&record.location_url);
        }
    }
}
