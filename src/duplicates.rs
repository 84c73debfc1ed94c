//! Retiring backends that front the same upstream
//!
//! An upstream service is served by at most one backend. Before a backend
//! for an upstream is written, every other backend bound to that upstream is
//! deleted.

use crate::codec;
use crate::registry::Registry;
use crate::upstream;
use tracing::{error, info};

/// Delete every backend bound to `upstream_url`, except `keep`.
///
/// Best effort: all deletions are attempted and `false` is returned if any of
/// them failed.
pub fn resolve(registry: &mut Registry, upstream_url: &str, keep: Option<u64>) -> bool {
    let origin = upstream::origin(upstream_url);
    let mut groups = registry.group_by_upstream();
    let Some(bound) = groups.remove(origin) else {
        return true;
    };

    let mut success = true;
    for record in bound.iter().filter(|r| Some(r.id) != keep) {
        info!(
            id = record.id,
            upstream = origin,
            "Deleting existing backend with same upstream url"
        );
        let file_name = codec::encode(record);
        if let Err(e) = registry.remove_file(&file_name) {
            error!(id = record.id, error = %e, "Failed to delete duplicate backend");
            success = false;
        }
    }

    success
}
