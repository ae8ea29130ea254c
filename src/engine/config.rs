//! Engine configuration.
//!
//! One [`EngineConfig`] describes one launch request. It is owned by a single
//! preparation, mutated while the plan is built, and finally serialized as
//! the opaque payload the next stage re-parses.

use crate::capabilities::OciCapabilities;
use crate::error::{Error, Result};
use crate::fuse::FuseMount;
use crate::identity::UserInfo;
use crate::idmap::IdMapping;
use crate::image::{ImageFormat, Usage};
use crate::namespace::NamespaceSet;
use crate::session::SessionLayer;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Container process settings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ProcessConfig {
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub capabilities: OciCapabilities,
    pub no_new_privileges: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub selinux_label: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub apparmor_profile: Option<String>,
    /// Loaded seccomp profile.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seccomp: Option<serde_json::Value>,
}

/// A user bind mount.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BindPath {
    pub source: PathBuf,
    pub destination: PathBuf,
    pub readonly: bool,
    /// Path inside a data image to bind (`image-src=`).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image_src: Option<String>,
    /// Partition ID of a data image (`id=`).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<u32>,
}

impl BindPath {
    /// The source names an image rather than a host directory.
    pub fn is_image(&self) -> bool {
        self.image_src.is_some() || self.id.is_some()
    }
}

/// An image kept open for the container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageEntry {
    pub path: PathBuf,
    pub source: PathBuf,
    pub format: ImageFormat,
    pub usage: Usage,
    pub writable: bool,
    pub fd: i32,
}

/// Launch request plus the decisions recorded during preparation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EngineConfig {
    // -------------------------------------------------------------------------
    // Request
    // -------------------------------------------------------------------------
    pub image: PathBuf,
    pub writable_image: bool,
    pub writable_tmpfs: bool,
    /// `path[:ro|rw]` entries.
    pub overlay_images: Vec<String>,
    pub bind_paths: Vec<BindPath>,
    pub fuse_mounts: Vec<FuseMount>,
    pub namespaces: NamespaceSet,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
    /// `selinux:<label>`, `apparmor:<profile>`, `seccomp:<file>`.
    pub security: Vec<String>,
    pub add_caps: Vec<String>,
    pub drop_caps: Vec<String>,
    pub no_privs: bool,
    pub keep_privs: bool,
    pub fakeroot: bool,
    pub no_setgroups: bool,
    pub instance: bool,
    /// Name of the instance to join.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instance_join: Option<String>,
    /// Explicit instance record location.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instance_file: Option<PathBuf>,
    pub target_uid: u32,
    pub target_gids: Vec<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cwd: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub home_source: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub home_dest: Option<PathBuf>,
    pub contain: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub workdir: Option<PathBuf>,
    /// Root image is a FUSE mount on the host.
    pub image_fuse: bool,
    /// Temporary directory holding the FUSE mount point.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delete_temp_dir: Option<PathBuf>,
    /// Temporary directory of an implicit image pull.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delete_pull_temp_dir: Option<PathBuf>,
    pub nv_ccli: bool,
    /// User-supplied administrator configuration override.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub configuration_file: Option<PathBuf>,
    pub process: ProcessConfig,
    pub uid_mappings: Vec<IdMapping>,
    pub gid_mappings: Vec<IdMapping>,

    // -------------------------------------------------------------------------
    // Decisions
    // -------------------------------------------------------------------------
    pub session_layer: SessionLayer,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_info: Option<UserInfo>,
    pub image_list: Vec<ImageEntry>,
    pub signal_propagation: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unix_socket_pair: Option<(i32, i32)>,
    pub open_fds: Vec<i32>,
}

impl EngineConfig {
    /// Parses a configuration from JSON text.
    pub fn from_json(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }

    /// Reads a configuration file.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| Error::path_io(path, e))?;
        Self::from_json(&text)
    }

    pub fn to_json(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Value of the `key:` entry in the security options.
    pub fn security_param(&self, key: &str) -> Option<&str> {
        self.security.iter().find_map(|entry| {
            entry
                .split_once(':')
                .filter(|(k, _)| *k == key)
                .map(|(_, v)| v)
                .filter(|v| !v.is_empty())
        })
    }
}
