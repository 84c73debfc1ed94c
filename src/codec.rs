//! Backend config file names
//!
//! A backend's identity lives entirely in the name of its config file:
//!
//! ```text
//! {id}%{owner}%{location_url}%{template}%{template_version}%{0|1}.conf
//! ```
//!
//! The last field is the access control flag. Decoding is total: any name
//! that does not fit the pattern is reported as [`FileEntry::Malformed`] or,
//! for the directories that share the backend folder, [`FileEntry::Reserved`].

use crate::record::BackendRecord;
use regex::Regex;
use std::path::PathBuf;
use std::sync::LazyLock;
use tracing::{debug, warn};

/// Non-backend entries expected in the backend directory
pub const RESERVED_NAMES: [&str; 2] = ["users", "scripts"];

/// File extension of rendered backend configs
pub const EXTENSION: &str = ".conf";

/// Prefix of the temporary files a backend write goes through
pub const TEMP_PREFIX: &str = ".routekeeper-";

static BACKEND_FILE_NAME: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(\d+)%([a-z0-9\-@.]*?)%([^%]*)%([^%]*)%([^%]*)%([01])\.conf$")
        .expect("Invalid regex pattern")
});

/// What a directory entry turned out to be
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileEntry {
    Backend(BackendRecord),
    Reserved,
    /// Leftover of an interrupted write
    Temporary,
    Malformed,
}

/// Build the file name for a record.
///
/// Callers must hand in a complete record; empty identity fields are a bug in
/// the caller, not a runtime condition.
pub fn encode(record: &BackendRecord) -> String {
    debug_assert!(!record.owner.is_empty(), "owner must be set before encoding");
    debug_assert!(
        !record.location_url.is_empty(),
        "location_url must be set before encoding"
    );
    debug_assert!(!record.template.is_empty(), "template must be set before encoding");
    debug_assert!(
        !record.template_version.is_empty(),
        "template_version must be set before encoding"
    );

    format!(
        "{}%{}%{}%{}%{}%{}{}",
        record.id,
        record.owner,
        record.location_url,
        record.template,
        record.template_version,
        u8::from(record.auth_enabled),
        EXTENSION
    )
}

/// Classify a file name without logging.
///
/// The returned record's `file_path` is the bare file name; the registry
/// joins it onto its directory.
pub fn classify(file_name: &str) -> FileEntry {
    if RESERVED_NAMES.contains(&file_name) {
        return FileEntry::Reserved;
    }
    if file_name.starts_with(TEMP_PREFIX) {
        return FileEntry::Temporary;
    }

    let Some(caps) = BACKEND_FILE_NAME.captures(file_name) else {
        return FileEntry::Malformed;
    };

    // More digits than fit in a u64 is not a name we produced
    let Ok(id) = caps[1].parse::<u64>() else {
        return FileEntry::Malformed;
    };

    FileEntry::Backend(BackendRecord {
        id,
        owner: caps[2].to_string(),
        location_url: caps[3].to_string(),
        template: caps[4].to_string(),
        template_version: caps[5].to_string(),
        auth_enabled: &caps[6] == "1",
        file_path: PathBuf::from(file_name),
    })
}

/// Decode a file name, warning about anything that is neither a backend nor
/// one of the reserved entries.
pub fn decode(file_name: &str) -> Option<BackendRecord> {
    match classify(file_name) {
        FileEntry::Backend(record) => Some(record),
        FileEntry::Reserved => None,
        FileEntry::Temporary => {
            debug!(file = file_name, "Skipping temporary backend file");
            None
        }
        FileEntry::Malformed => {
            warn!(file = file_name, "Found a backend file with wrong naming, skipping it");
            None
        }
    }
}
