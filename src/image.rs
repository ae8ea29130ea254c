//! # Image Resolver
//!
//! Opens and classifies container image sources and applies the
//! administrator's image policy.
//!
//! ## Classification
//!
//! | Format | Detection |
//! |--------|-----------|
//! | sandbox | path is a directory |
//! | squashfs | `hsqs` at offset 0 |
//! | ext3 | superblock magic `0xEF53` at offset 1080 |
//! | SIF | `SIF_MAGIC` at offset 32 |
//! | OCI-SIF | SIF carrying an OCI root index descriptor |
//!
//! ## Path Resolution
//!
//! The policy path check runs against the target of `/proc/self/fd/<fd>`
//! of the *opened* descriptor, never against the user-supplied path. A
//! symlink swapped in after the open, or a deleted-and-replaced file, cannot
//! alias an allowed location.
//!
//! ## Authorization
//!
//! Four independent checks, any failure is [`Error::ConfigurationDisallowed`]:
//!
//! 1. `limit-container-paths` prefix
//! 2. `limit-container-groups` owning group
//! 3. `limit-container-owners` owning user
//! 4. per-format `allow-container-*` toggle (encrypted and unencrypted SIF
//!    are toggled separately)

use crate::error::{Error, Result};
use crate::policy::AdminPolicy;
use nix::unistd::{AccessFlags, Group, User};
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::os::fd::{AsRawFd, RawFd};
use std::os::unix::fs::{FileExt, MetadataExt, OpenOptionsExt};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Suffix the kernel may append to `/proc/self/fd` link targets.
const DELETED_SUFFIX: &str = " (deleted)";

const SQUASHFS_MAGIC: &[u8; 4] = b"hsqs";
const EXT_MAGIC: u16 = 0xEF53;
const EXT_MAGIC_OFFSET: u64 = 1080;
const SIF_MAGIC: &[u8; 9] = b"SIF_MAGIC";
const SIF_MAGIC_OFFSET: u64 = 32;

// =============================================================================
// Image Types
// =============================================================================

/// On-disk image format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageFormat {
    Squashfs,
    Ext3,
    Sandbox,
    Sif,
    OciSif,
}

impl std::fmt::Display for ImageFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Squashfs => write!(f, "squashfs"),
            Self::Ext3 => write!(f, "ext3"),
            Self::Sandbox => write!(f, "sandbox"),
            Self::Sif => write!(f, "SIF"),
            Self::OciSif => write!(f, "OCI-SIF"),
        }
    }
}

/// Role of an image in the stack.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Usage {
    #[default]
    Root,
    Overlay,
    Data,
}

/// Filesystem held by a partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PartitionFs {
    Squashfs,
    Ext3,
    EncryptedSquashfs,
    Sandbox,
    Other,
}

/// Purpose of a partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PartitionRole {
    System,
    PrimarySystem,
    Data,
    Overlay,
    Other,
}

/// One filesystem inside an image. Bare images have a single primary one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Partition {
    pub fs: PartitionFs,
    pub role: PartitionRole,
    pub offset: u64,
    pub size: u64,
}

/// An opened, classified and authorized image.
#[derive(Debug)]
pub struct Image {
    pub format: ImageFormat,
    /// Canonical path of the opened descriptor.
    pub path: PathBuf,
    /// `/proc/self/fd/<fd>` alias usable by later stages.
    pub source: PathBuf,
    pub file: File,
    pub writable: bool,
    pub partitions: Vec<Partition>,
    pub usage: Usage,
}

impl Image {
    pub fn fd(&self) -> RawFd {
        self.file.as_raw_fd()
    }

    /// Primary root filesystem partition.
    pub fn root_fs_partition(&self) -> Result<&Partition> {
        self.partitions
            .iter()
            .find(|p| p.role == PartitionRole::PrimarySystem)
            .ok_or_else(|| {
                Error::InvalidConfiguration(format!(
                    "no root filesystem partition found in {}",
                    self.path.display()
                ))
            })
    }

    /// Overlay partitions embedded in a SIF.
    pub fn overlay_partitions(&self) -> impl Iterator<Item = &Partition> {
        self.partitions
            .iter()
            .filter(|p| p.role == PartitionRole::Overlay)
    }

    /// True if the image embeds an ext3 overlay partition.
    pub fn has_ext3_overlay(&self) -> bool {
        self.overlay_partitions().any(|p| p.fs == PartitionFs::Ext3)
    }

    pub fn has_encrypted_root_fs(&self) -> bool {
        self.root_fs_partition()
            .is_ok_and(|p| p.fs == PartitionFs::EncryptedSquashfs)
    }
}

// =============================================================================
// SIF Inspection
// =============================================================================

/// Partition table of a SIF file.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SifLayout {
    pub partitions: Vec<Partition>,
    /// Carries an OCI root index (OCI-SIF).
    pub oci: bool,
}

/// Reads the descriptor table of a SIF file.
pub trait SifInspector: Send + Sync {
    fn inspect(&self, file: &File) -> Result<SifLayout>;
}

/// Reads SIF v2 global header and descriptors directly.
#[derive(Debug, Clone, Copy, Default)]
pub struct SifDescriptorReader;

mod sif {
    pub const HEADER_SIZE: usize = 128;
    pub const DESCRIPTOR_SIZE: usize = 585;
    pub const DESCRIPTORS_TOTAL: usize = 88;
    pub const DESCRIPTORS_OFFSET: usize = 96;

    pub const DATA_PARTITION: i32 = 0x4004;
    pub const DATA_OCI_ROOT_INDEX: i32 = 0x400a;

    pub const FS_SQUASH: i32 = 1;
    pub const FS_EXT3: i32 = 2;
    pub const FS_ENCRYPTED_SQUASHFS: i32 = 5;

    pub const PART_SYSTEM: i32 = 1;
    pub const PART_PRIM_SYS: i32 = 2;
    pub const PART_DATA: i32 = 3;
    pub const PART_OVERLAY: i32 = 4;

    /// Upper bound on descriptors read from an untrusted header.
    pub const MAX_DESCRIPTORS: i64 = 4096;
}

fn le_i32(buf: &[u8], at: usize) -> i32 {
    let mut b = [0u8; 4];
    b.copy_from_slice(&buf[at..at + 4]);
    i32::from_le_bytes(b)
}

fn le_i64(buf: &[u8], at: usize) -> i64 {
    let mut b = [0u8; 8];
    b.copy_from_slice(&buf[at..at + 8]);
    i64::from_le_bytes(b)
}

impl SifInspector for SifDescriptorReader {
    fn inspect(&self, file: &File) -> Result<SifLayout> {
        let mut header = [0u8; sif::HEADER_SIZE];
        file.read_exact_at(&mut header, 0)?;

        let total = le_i64(&header, sif::DESCRIPTORS_TOTAL);
        let offset = le_i64(&header, sif::DESCRIPTORS_OFFSET);
        if !(0..=sif::MAX_DESCRIPTORS).contains(&total) || offset < 0 {
            return Err(Error::InvalidConfiguration(format!(
                "corrupted SIF header: {} descriptors at offset {}",
                total, offset
            )));
        }

        let mut table = vec![0u8; total as usize * sif::DESCRIPTOR_SIZE];
        file.read_exact_at(&mut table, offset as u64)?;

        let mut layout = SifLayout::default();
        for raw in table.chunks_exact(sif::DESCRIPTOR_SIZE) {
            // datatype(4) used(1) id(4) groupid(4) link(4) offset(8) size(8) ...
            let used = raw[4] != 0;
            if !used {
                continue;
            }
            match le_i32(raw, 0) {
                sif::DATA_OCI_ROOT_INDEX => layout.oci = true,
                sif::DATA_PARTITION => {
                    // extra starts after name: 4+1+4+4+4 + 7*8 + 128
                    let extra = 4 + 1 + 4 + 4 + 4 + 7 * 8 + 128;
                    let fs = match le_i32(raw, extra) {
                        sif::FS_SQUASH => PartitionFs::Squashfs,
                        sif::FS_EXT3 => PartitionFs::Ext3,
                        sif::FS_ENCRYPTED_SQUASHFS => PartitionFs::EncryptedSquashfs,
                        _ => PartitionFs::Other,
                    };
                    let role = match le_i32(raw, extra + 4) {
                        sif::PART_SYSTEM => PartitionRole::System,
                        sif::PART_PRIM_SYS => PartitionRole::PrimarySystem,
                        sif::PART_DATA => PartitionRole::Data,
                        sif::PART_OVERLAY => PartitionRole::Overlay,
                        _ => PartitionRole::Other,
                    };
                    layout.partitions.push(Partition {
                        fs,
                        role,
                        offset: le_i64(raw, 17).max(0) as u64,
                        size: le_i64(raw, 25).max(0) as u64,
                    });
                }
                _ => {}
            }
        }
        Ok(layout)
    }
}

// =============================================================================
// Opening and Classification
// =============================================================================

/// Classifies an opened regular file by its magic bytes.
pub fn classify(file: &File) -> Result<Option<ImageFormat>> {
    let mut head = [0u8; 4];
    if file.read_at(&mut head, 0)? == 4 && &head == SQUASHFS_MAGIC {
        return Ok(Some(ImageFormat::Squashfs));
    }

    let mut sif_magic = [0u8; 9];
    if file.read_at(&mut sif_magic, SIF_MAGIC_OFFSET)? == 9 && &sif_magic == SIF_MAGIC {
        return Ok(Some(ImageFormat::Sif));
    }

    let mut ext = [0u8; 2];
    if file.read_at(&mut ext, EXT_MAGIC_OFFSET)? == 2 && u16::from_le_bytes(ext) == EXT_MAGIC {
        return Ok(Some(ImageFormat::Ext3));
    }
    Ok(None)
}

/// Opens `path`, read-write if `writable`.
///
/// Returns [`Error::ReadOnlyFilesystem`] when write access is refused by a
/// read-only mount, so callers can fall back to a read-only open.
pub fn open_image_file(path: &Path, writable: bool) -> Result<File> {
    let meta = std::fs::metadata(path).map_err(|e| Error::path_io(path, e))?;
    if meta.is_dir() {
        return OpenOptions::new()
            .read(true)
            .custom_flags(libc::O_DIRECTORY)
            .open(path)
            .map_err(|e| Error::path_io(path, e));
    }

    match OpenOptions::new().read(true).write(writable).open(path) {
        Ok(file) => Ok(file),
        Err(e) if e.raw_os_error() == Some(libc::EROFS) => Err(Error::ReadOnlyFilesystem {
            path: path.to_path_buf(),
        }),
        Err(e) => Err(Error::path_io(path, e)),
    }
}

/// Resolves the canonical path of an opened descriptor.
fn descriptor_path(source: &Path) -> Result<PathBuf> {
    let target = std::fs::read_link(source).map_err(|e| Error::path_io(source, e))?;
    let text = target.to_string_lossy();
    Ok(match text.strip_suffix(DELETED_SUFFIX) {
        Some(trimmed) => PathBuf::from(trimmed),
        None => target,
    })
}

// =============================================================================
// Resolver
// =============================================================================

/// Loads images under an administrator policy.
pub struct ImageResolver<'a> {
    policy: &'a AdminPolicy,
    inspector: &'a dyn SifInspector,
}

impl<'a> ImageResolver<'a> {
    pub fn new(policy: &'a AdminPolicy, inspector: &'a dyn SifInspector) -> Self {
        Self { policy, inspector }
    }

    /// Opens, classifies and authorizes an image.
    ///
    /// A writable request on a read-only filesystem is downgraded to a
    /// read-only image with a warning; callers that require writability check
    /// [`Image::writable`].
    pub fn load(&self, path: &Path, writable: bool) -> Result<Image> {
        let (file, writable) = match open_image_file(path, writable) {
            Ok(file) => (file, writable),
            Err(Error::ReadOnlyFilesystem { path: ro }) => {
                warn!("{} is on a read-only filesystem, opening read-only", ro.display());
                (open_image_file(path, false)?, false)
            }
            Err(e) => return Err(e),
        };

        let source = PathBuf::from(format!("/proc/self/fd/{}", file.as_raw_fd()));
        let resolved = descriptor_path(&source)?;
        if resolved != path {
            debug!("Replacing image resolved path {} by {}", path.display(), resolved.display());
        }

        let meta = file.metadata().map_err(|e| Error::path_io(&resolved, e))?;
        let (format, partitions, writable) = if meta.is_dir() {
            let writable = writable
                && nix::unistd::access(&resolved, AccessFlags::W_OK).is_ok();
            (
                ImageFormat::Sandbox,
                vec![bare_partition(PartitionFs::Sandbox)],
                writable,
            )
        } else {
            match classify(&file)? {
                Some(ImageFormat::Sif) => {
                    let layout = self.inspector.inspect(&file)?;
                    let format = if layout.oci {
                        ImageFormat::OciSif
                    } else {
                        ImageFormat::Sif
                    };
                    (format, layout.partitions, writable)
                }
                Some(ImageFormat::Squashfs) => (
                    ImageFormat::Squashfs,
                    vec![bare_partition(PartitionFs::Squashfs)],
                    writable,
                ),
                Some(ImageFormat::Ext3) => (
                    ImageFormat::Ext3,
                    vec![bare_partition(PartitionFs::Ext3)],
                    writable,
                ),
                _ => {
                    return Err(Error::InvalidConfiguration(format!(
                        "{}: unknown image format",
                        resolved.display()
                    )));
                }
            }
        };

        let image = Image {
            format,
            path: resolved,
            source,
            file,
            writable,
            partitions,
            usage: Usage::Root,
        };
        self.authorize(&image, meta.uid(), meta.gid())?;
        Ok(image)
    }

    fn authorize(&self, image: &Image, owner_uid: u32, owner_gid: u32) -> Result<()> {
        let policy = self.policy;

        if !policy.limit_container_paths.is_empty()
            && !policy
                .limit_container_paths
                .iter()
                .any(|prefix| image.path.starts_with(prefix))
        {
            return Err(Error::ConfigurationDisallowed(
                "images outside of the configured container paths".to_string(),
            ));
        }
        if !policy.limit_container_groups.is_empty()
            && !policy
                .limit_container_groups
                .iter()
                .any(|g| group_matches(g, owner_gid))
        {
            return Err(Error::ConfigurationDisallowed(
                "images not owned by the required group(s)".to_string(),
            ));
        }
        if !policy.limit_container_owners.is_empty()
            && !policy
                .limit_container_owners
                .iter()
                .any(|u| owner_matches(u, owner_uid))
        {
            return Err(Error::ConfigurationDisallowed(
                "images not owned by the required user(s)".to_string(),
            ));
        }

        let allowed = match image.format {
            ImageFormat::Squashfs => policy.allow_container_squashfs,
            ImageFormat::Ext3 => policy.allow_container_extfs,
            ImageFormat::Sandbox => policy.allow_container_dir,
            ImageFormat::Sif | ImageFormat::OciSif if image.has_encrypted_root_fs() => {
                if !policy.allow_container_encrypted {
                    return Err(Error::ConfigurationDisallowed(
                        "users from running encrypted SIF containers".to_string(),
                    ));
                }
                true
            }
            ImageFormat::Sif | ImageFormat::OciSif => policy.allow_container_sif,
        };
        if !allowed {
            let what = match image.format {
                ImageFormat::Squashfs => "squashFS",
                ImageFormat::Ext3 => "extFS",
                ImageFormat::Sandbox => "sandbox",
                ImageFormat::Sif | ImageFormat::OciSif => "unencrypted SIF",
            };
            return Err(Error::ConfigurationDisallowed(format!(
                "users from running {} containers",
                what
            )));
        }
        Ok(())
    }
}

fn bare_partition(fs: PartitionFs) -> Partition {
    Partition {
        fs,
        role: PartitionRole::PrimarySystem,
        offset: 0,
        size: 0,
    }
}

fn owner_matches(entry: &str, uid: u32) -> bool {
    let entry = entry.trim();
    if let Ok(id) = entry.parse::<u32>() {
        return id == uid;
    }
    matches!(User::from_name(entry), Ok(Some(u)) if u.uid.as_raw() == uid)
}

fn group_matches(entry: &str, gid: u32) -> bool {
    let entry = entry.trim();
    if let Ok(id) = entry.parse::<u32>() {
        return id == gid;
    }
    matches!(Group::from_name(entry), Ok(Some(g)) if g.gid.as_raw() == gid)
}

// =============================================================================
// Overlay Specs
// =============================================================================

/// A `--overlay path[:ro|rw]` entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OverlaySpec {
    pub path: PathBuf,
    pub writable: bool,
}

impl OverlaySpec {
    /// Parses `path[:ro|rw]`; overlays are writable unless `:ro` is given.
    pub fn parse(spec: &str) -> Self {
        match spec.split_once(':') {
            Some((path, mode)) => Self {
                path: PathBuf::from(path),
                writable: mode != "ro",
            },
            None => Self {
                path: PathBuf::from(spec),
                writable: true,
            },
        }
    }
}
