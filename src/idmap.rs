//! # ID-Mapping Builder
//!
//! Fakeroot maps the invoking user to container root and appends the
//! administrator-allocated subordinate range:
//!
//! ```text
//! containerID  hostID   size
//! 0            1000     1        <- invoking UID/GID
//! 1            100000   65536    <- /etc/subuid range
//! ```
//!
//! Outside the setuid workflow the mappings are written by the external
//! `newuidmap` / `newgidmap` helpers, which must be root-owned.

use crate::constants::{DEFAULT_SEARCH_PATH, MAX_MAP_SIZE, MAX_PATH_SIZE};
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt::Write as _;
use std::os::unix::fs::{MetadataExt, PermissionsExt};
use std::path::{Path, PathBuf};
use tracing::debug;

/// One user-namespace mapping entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IdMapping {
    pub container_id: u32,
    pub host_id: u32,
    pub size: u32,
}

impl IdMapping {
    pub const fn new(container_id: u32, host_id: u32, size: u32) -> Self {
        Self {
            container_id,
            host_id,
            size,
        }
    }
}

/// Serializes mappings as newline-delimited `containerID hostID size`
/// triples, bounded by the starter map buffer.
pub fn serialize_map(field: &str, mappings: &[IdMapping]) -> Result<String> {
    let mut text = String::new();
    for m in mappings {
        // Writing into a String cannot fail.
        let _ = writeln!(text, "{} {} {}", m.container_id, m.host_id, m.size);
    }
    if text.len() >= MAX_MAP_SIZE - 1 {
        return Err(Error::CapacityExceeded {
            field: field.to_string(),
            limit: MAX_MAP_SIZE - 1,
        });
    }
    Ok(text)
}

// =============================================================================
// Subordinate ID Files
// =============================================================================

/// A subordinate ID allocation (`name:start:count`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubIdEntry {
    /// User name or numeric UID as written in the file.
    pub owner: String,
    pub start: u32,
    pub count: u32,
}

/// Parsed `/etc/subuid` or `/etc/subgid`.
#[derive(Debug, Clone, Default)]
pub struct SubIdFile {
    pub entries: Vec<SubIdEntry>,
}

impl SubIdFile {
    /// Parses file content. Comments, blank and malformed lines are skipped.
    pub fn parse(content: &str) -> Self {
        let entries = content
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty() && !l.starts_with('#'))
            .filter_map(|line| {
                let mut fields = line.split(':');
                let owner = fields.next()?.to_string();
                let start = fields.next()?.trim().parse().ok()?;
                let count = fields.next()?.trim().parse().ok()?;
                Some(SubIdEntry {
                    owner,
                    start,
                    count,
                })
            })
            .collect();
        Self { entries }
    }

    /// Loads and parses `path`.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| Error::path_io(path, e))?;
        Ok(Self::parse(&content))
    }

    /// Returns the first usable range allocated to `username` or `uid`.
    pub fn range_for(&self, username: &str, uid: u32) -> Option<&SubIdEntry> {
        self.entries.iter().find(|e| {
            e.count > 0
                && ((!username.is_empty() && e.owner == username)
                    || e.owner.parse::<u32>().is_ok_and(|id| id == uid))
        })
    }
}

// =============================================================================
// Fakeroot Mapping
// =============================================================================

/// How mappings will be applied by the process-creation stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MappingMode {
    /// The setuid starter writes `/proc/<pid>/{uid,gid}_map` itself.
    Setuid,
    /// The unprivileged starter runs these helpers.
    Helper {
        newuidmap: PathBuf,
        newgidmap: PathBuf,
    },
}

/// UID and GID maps for a fakeroot container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FakerootMaps {
    pub uid_map: Vec<IdMapping>,
    pub gid_map: Vec<IdMapping>,
    pub mode: MappingMode,
}

/// Builds fakeroot mappings for the invoking user.
///
/// Both ranges are looked up by the invoking user's name or UID.
pub fn fakeroot_maps(
    uid: u32,
    gid: u32,
    username: &str,
    subuid: &SubIdFile,
    subgid: &SubIdFile,
    mode: MappingMode,
) -> Result<FakerootMaps> {
    let uid_range = subuid.range_for(username, uid).ok_or_else(|| {
        Error::ConfigurationDisallowed(format!(
            "fakeroot: no subordinate UID range configured for {} ({})",
            username, uid
        ))
    })?;
    let gid_range = subgid.range_for(username, uid).ok_or_else(|| {
        Error::ConfigurationDisallowed(format!(
            "fakeroot: no subordinate GID range configured for {} ({})",
            username, uid
        ))
    })?;

    debug!(
        "fakeroot ranges: uid {}+{} gid {}+{}",
        uid_range.start, uid_range.count, gid_range.start, gid_range.count
    );

    Ok(FakerootMaps {
        uid_map: vec![
            IdMapping::new(0, uid, 1),
            IdMapping::new(1, uid_range.start, uid_range.count),
        ],
        gid_map: vec![
            IdMapping::new(0, gid, 1),
            IdMapping::new(1, gid_range.start, gid_range.count),
        ],
        mode,
    })
}

// =============================================================================
// Helper Lookup
// =============================================================================

/// Locates an executable in `search_path` (colon-separated).
pub fn find_in_path(name: &str, search_path: Option<&str>) -> Option<PathBuf> {
    let search = search_path
        .filter(|p| !p.is_empty())
        .unwrap_or(DEFAULT_SEARCH_PATH);
    search
        .split(':')
        .filter(|dir| !dir.is_empty())
        .map(|dir| Path::new(dir).join(name))
        .find(|candidate| {
            std::fs::metadata(candidate)
                .is_ok_and(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        })
}

/// Locates a root-owned ID-mapping helper.
pub fn find_idmap_helper(name: &str, search_path: Option<&str>) -> Result<PathBuf> {
    let path = find_in_path(name, search_path).ok_or_else(|| Error::ResourceUnavailable {
        resource: name.to_string(),
        reason: format!(
            "not found in PATH ({}), required with fakeroot and unprivileged installation",
            search_path.unwrap_or(DEFAULT_SEARCH_PATH)
        ),
    })?;

    let meta = std::fs::metadata(&path).map_err(|e| Error::path_io(&path, e))?;
    if meta.uid() != 0 {
        return Err(Error::ResourceUnavailable {
            resource: name.to_string(),
            reason: format!(
                "{} must be owned by the root user to setup fakeroot ID mappings in an unprivileged installation",
                path.display()
            ),
        });
    }
    if path.as_os_str().len() >= MAX_PATH_SIZE - 1 {
        return Err(Error::CapacityExceeded {
            field: format!("{} path", name),
            limit: MAX_PATH_SIZE - 1,
        });
    }
    Ok(path)
}

/// Resolves the mapping mode: setuid starters map directly, everything else
/// goes through the helpers.
pub fn mapping_mode(is_suid: bool, search_path: Option<&str>) -> Result<MappingMode> {
    if is_suid {
        return Ok(MappingMode::Setuid);
    }
    debug!("Fakeroot requested with unprivileged workflow, fallback to newuidmap/newgidmap");
    Ok(MappingMode::Helper {
        newuidmap: find_idmap_helper("newuidmap", search_path)?,
        newgidmap: find_idmap_helper("newgidmap", search_path)?,
    })
}
