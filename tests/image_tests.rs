//! Tests for image module.
//!
//! Covers classification, descriptor-based path resolution and the
//! administrator image policy.

use stagehand::Error;
use stagehand::image::{
    ImageFormat, ImageResolver, Partition, PartitionFs, PartitionRole, SifInspector, SifLayout,
};
use stagehand::policy::AdminPolicy;
use std::fs::File;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

/// Returns a fixed partition table for every SIF.
struct FixedLayout(SifLayout);

impl SifInspector for FixedLayout {
    fn inspect(&self, _file: &File) -> stagehand::Result<SifLayout> {
        Ok(self.0.clone())
    }
}

fn partition(fs: PartitionFs, role: PartitionRole) -> Partition {
    Partition {
        fs,
        role,
        offset: 4096,
        size: 4096,
    }
}

fn squashfs_layout() -> FixedLayout {
    FixedLayout(SifLayout {
        partitions: vec![partition(PartitionFs::Squashfs, PartitionRole::PrimarySystem)],
        oci: false,
    })
}

fn write_sif(dir: &Path, name: &str) -> PathBuf {
    let mut data = vec![0u8; 256];
    data[32..41].copy_from_slice(b"SIF_MAGIC");
    let path = dir.join(name);
    std::fs::write(&path, data).unwrap();
    path
}

fn write_squashfs(dir: &Path, name: &str) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, b"hsqs\0\0\0\0\0\0\0\0").unwrap();
    path
}

// =============================================================================
// Classification Tests
// =============================================================================

#[test]
fn test_sandbox_resolves_through_descriptor() {
    let dir = TempDir::new().unwrap();
    let rootfs = dir.path().join("rootfs");
    std::fs::create_dir(&rootfs).unwrap();
    let link = dir.path().join("current");
    std::os::unix::fs::symlink(&rootfs, &link).unwrap();

    let policy = AdminPolicy::default();
    let inspector = squashfs_layout();
    let image = ImageResolver::new(&policy, &inspector)
        .load(&link, false)
        .unwrap();

    assert_eq!(image.format, ImageFormat::Sandbox);
    assert_eq!(image.path, rootfs.canonicalize().unwrap());
    assert_eq!(
        image.source,
        PathBuf::from(format!("/proc/self/fd/{}", image.fd()))
    );
    assert_eq!(image.partitions[0].fs, PartitionFs::Sandbox);
}

#[test]
fn test_squashfs_and_sif_formats() {
    let dir = TempDir::new().unwrap();
    let policy = AdminPolicy::default();
    let inspector = squashfs_layout();
    let resolver = ImageResolver::new(&policy, &inspector);

    let squash = resolver
        .load(&write_squashfs(dir.path(), "c.sqfs"), false)
        .unwrap();
    assert_eq!(squash.format, ImageFormat::Squashfs);

    let sif = resolver.load(&write_sif(dir.path(), "c.sif"), false).unwrap();
    assert_eq!(sif.format, ImageFormat::Sif);
    assert_eq!(
        sif.root_fs_partition().unwrap().fs,
        PartitionFs::Squashfs
    );
}

#[test]
fn test_oci_root_index_marks_oci_sif() {
    let dir = TempDir::new().unwrap();
    let policy = AdminPolicy::default();
    let inspector = FixedLayout(SifLayout {
        partitions: vec![partition(PartitionFs::Squashfs, PartitionRole::PrimarySystem)],
        oci: true,
    });
    let image = ImageResolver::new(&policy, &inspector)
        .load(&write_sif(dir.path(), "oci.sif"), false)
        .unwrap();
    assert_eq!(image.format, ImageFormat::OciSif);
}

#[test]
fn test_unknown_format_rejected() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("random.bin");
    std::fs::write(&path, vec![7u8; 2048]).unwrap();

    let policy = AdminPolicy::default();
    let inspector = squashfs_layout();
    let err = ImageResolver::new(&policy, &inspector)
        .load(&path, false)
        .unwrap_err();
    assert!(err.to_string().contains("unknown image format"));
}

#[test]
fn test_missing_image() {
    let dir = TempDir::new().unwrap();
    let policy = AdminPolicy::default();
    let inspector = squashfs_layout();
    let err = ImageResolver::new(&policy, &inspector)
        .load(&dir.path().join("absent.sif"), false)
        .unwrap_err();
    assert!(matches!(err, Error::PathIo { .. }));
}

// =============================================================================
// Authorization Tests
// =============================================================================

#[test]
fn test_limit_container_paths_uses_resolved_path() {
    let allowed = TempDir::new().unwrap();
    let outside = TempDir::new().unwrap();
    let image = write_squashfs(outside.path(), "c.sqfs");
    let link = allowed.path().join("c.sqfs");
    std::os::unix::fs::symlink(&image, &link).unwrap();

    let policy = AdminPolicy {
        limit_container_paths: vec![allowed.path().canonicalize().unwrap()],
        ..Default::default()
    };
    let inspector = squashfs_layout();
    let err = ImageResolver::new(&policy, &inspector)
        .load(&link, false)
        .unwrap_err();
    assert!(matches!(err, Error::ConfigurationDisallowed(_)));
}

#[test]
fn test_limit_container_owners() {
    let dir = TempDir::new().unwrap();
    let path = write_squashfs(dir.path(), "c.sqfs");
    let me = nix::unistd::geteuid().as_raw();
    let inspector = squashfs_layout();

    let owner = AdminPolicy {
        limit_container_owners: vec![me.to_string()],
        ..Default::default()
    };
    ImageResolver::new(&owner, &inspector)
        .load(&path, false)
        .unwrap();

    let other = AdminPolicy {
        limit_container_owners: vec![(me + 1).to_string()],
        ..Default::default()
    };
    assert!(
        ImageResolver::new(&other, &inspector)
            .load(&path, false)
            .is_err()
    );
}

#[test]
fn test_encrypted_sif_toggled_separately() {
    let dir = TempDir::new().unwrap();
    let path = write_sif(dir.path(), "enc.sif");
    let inspector = FixedLayout(SifLayout {
        partitions: vec![partition(
            PartitionFs::EncryptedSquashfs,
            PartitionRole::PrimarySystem,
        )],
        oci: false,
    });

    let no_encrypted = AdminPolicy {
        allow_container_encrypted: false,
        ..Default::default()
    };
    let err = ImageResolver::new(&no_encrypted, &inspector)
        .load(&path, false)
        .unwrap_err();
    assert!(err.to_string().contains("encrypted"));

    let no_plain_sif = AdminPolicy {
        allow_container_sif: false,
        ..Default::default()
    };
    ImageResolver::new(&no_plain_sif, &inspector)
        .load(&path, false)
        .unwrap();
}

#[test]
fn test_format_toggles() {
    let dir = TempDir::new().unwrap();
    let path = write_squashfs(dir.path(), "c.sqfs");
    let inspector = squashfs_layout();
    let policy = AdminPolicy {
        allow_container_squashfs: false,
        ..Default::default()
    };
    let err = ImageResolver::new(&policy, &inspector)
        .load(&path, false)
        .unwrap_err();
    assert!(err.to_string().contains("squashFS"));
}
