//! Autofs descriptor pinning.
//!
//! Autofs mount points may expire once the container mount namespace is
//! entered. Every path the container needs from under an autofs mount is
//! opened beforehand and the descriptor kept across process creation.

use crate::error::{Error, Result};
use std::fs::File;
use std::path::{Path, PathBuf};
use tracing::debug;

/// One `/proc/self/mountinfo` entry (fields used here only).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountInfoEntry {
    pub mount_point: PathBuf,
    pub fs_type: String,
    pub source: String,
}

/// Parses mountinfo content.
///
/// Format: `id parent major:minor root mountpoint options [optional...] - fstype source superopts`.
pub fn parse_mountinfo(content: &str) -> Vec<MountInfoEntry> {
    content
        .lines()
        .filter_map(|line| {
            let (pre, post) = line.split_once(" - ")?;
            let mount_point = pre.split_whitespace().nth(4)?;
            let mut post = post.split_whitespace();
            let fs_type = post.next()?.to_string();
            let source = post.next().unwrap_or_default().to_string();
            Some(MountInfoEntry {
                mount_point: PathBuf::from(unescape_octal(mount_point)),
                fs_type,
                source,
            })
        })
        .collect()
}

/// mountinfo escapes space, tab, newline and backslash as `\NNN`.
fn unescape_octal(field: &str) -> String {
    let bytes = field.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\'
            && i + 3 < bytes.len()
            && bytes[i + 1..i + 4].iter().all(|b| (b'0'..=b'7').contains(b))
            && let Ok(value) = u8::from_str_radix(&field[i + 1..i + 4], 8)
        {
            out.push(value);
            i += 4;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}

/// Autofs mount points listed in `mountinfo`.
pub fn autofs_points(mountinfo: &Path) -> Result<Vec<PathBuf>> {
    let content = std::fs::read_to_string(mountinfo).map_err(|e| Error::path_io(mountinfo, e))?;
    let points: Vec<PathBuf> = parse_mountinfo(&content)
        .into_iter()
        .filter(|e| e.fs_type == "autofs")
        .map(|e| {
            debug!("Found {} as autofs mount point", e.mount_point.display());
            e.mount_point
        })
        .collect();
    if points.is_empty() {
        debug!("No autofs mount point found");
    }
    Ok(points)
}

/// Opens `source` if it resolves under one of `points`.
///
/// Returns `Ok(None)` when the path is not under any autofs mount.
pub fn pin(source: &Path, points: &[PathBuf]) -> Result<Option<File>> {
    let resolved = std::fs::canonicalize(source).map_err(|e| Error::path_io(source, e))?;
    if !points.iter().any(|p| resolved.starts_with(p)) {
        return Ok(None);
    }
    debug!("Open file descriptor for {}", resolved.display());
    let file = File::open(&resolved).map_err(|e| Error::path_io(&resolved, e))?;
    Ok(Some(file))
}

/// Pins every candidate path, skipping (with a debug message) the ones that
/// cannot be resolved or opened.
pub fn pin_all<'a>(
    candidates: impl IntoIterator<Item = (&'a str, &'a Path)>,
    points: &[PathBuf],
) -> Vec<File> {
    if points.is_empty() {
        return Vec::new();
    }
    candidates
        .into_iter()
        .filter_map(|(what, path)| match pin(path, points) {
            Ok(file) => file,
            Err(e) => {
                debug!("Could not keep file descriptor for {} {}: {}", what, path.display(), e);
                None
            }
        })
        .collect()
}
