//! Administrator policy.
//!
//! The policy is split across three inputs, all owned by the administrator:
//!
//! | Input | Format | Type |
//! |-------|--------|------|
//! | main configuration | YAML, kebab-case keys | [`AdminPolicy`] |
//! | capability authorization table | JSON | [`CapabilityConfig`] |
//! | subordinate ID ranges | `/etc/subuid` lines | [`crate::idmap::SubIdFile`] |
//!
//! When the launcher runs setuid every input must be owned by root before
//! its contents are trusted; [`PolicySources::load`] enforces that before
//! parsing anything.

use crate::constants::{DEFAULT_CAPABILITY_FILE, DEFAULT_POLICY_FILE, SUBGID_FILE, SUBUID_FILE};
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use tracing::debug;

// =============================================================================
// Policy Directives
// =============================================================================

/// `enable-overlay` directive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OverlayMode {
    Yes,
    #[default]
    Try,
    No,
}

impl OverlayMode {
    /// Returns true if overlay may be attempted.
    pub fn enabled(self) -> bool {
        matches!(self, Self::Yes | Self::Try)
    }
}

impl std::fmt::Display for OverlayMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Yes => write!(f, "yes"),
            Self::Try => write!(f, "try"),
            Self::No => write!(f, "no"),
        }
    }
}

/// `root-default-capabilities` directive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RootCapsMode {
    /// Grant every capability.
    #[default]
    Full,
    /// Look up "root" and root's groups in the capability table.
    File,
    /// No default capabilities.
    #[serde(alias = "none")]
    No,
}

fn yes() -> bool {
    true
}

/// Accepts YAML booleans as well as the `yes`/`no` spelling of the
/// configuration file.
fn yes_no<'de, D>(deserializer: D) -> std::result::Result<bool, D::Error>
where
    D: serde::Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Bool(bool),
        Text(String),
    }

    match Raw::deserialize(deserializer)? {
        Raw::Bool(b) => Ok(b),
        Raw::Text(text) => match text.trim().to_ascii_lowercase().as_str() {
            "yes" | "true" | "on" => Ok(true),
            "no" | "false" | "off" => Ok(false),
            other => Err(serde::de::Error::custom(format!(
                "expected yes or no, found {:?}",
                other
            ))),
        },
    }
}

fn default_bind_paths() -> Vec<String> {
    vec!["/etc/localtime".to_string(), "/etc/hosts".to_string()]
}

/// Parsed administrator configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct AdminPolicy {
    /// Allow the setuid workflow at all.
    #[serde(deserialize_with = "yes_no")]
    pub allow_setuid: bool,

    #[serde(deserialize_with = "yes_no")]
    pub allow_pid_ns: bool,
    #[serde(deserialize_with = "yes_no")]
    pub allow_ipc_ns: bool,
    #[serde(deserialize_with = "yes_no")]
    pub allow_uts_ns: bool,
    #[serde(deserialize_with = "yes_no")]
    pub allow_user_ns: bool,

    #[serde(deserialize_with = "yes_no")]
    pub allow_container_squashfs: bool,
    #[serde(deserialize_with = "yes_no")]
    pub allow_container_extfs: bool,
    #[serde(deserialize_with = "yes_no")]
    pub allow_container_dir: bool,
    #[serde(deserialize_with = "yes_no")]
    pub allow_container_encrypted: bool,
    #[serde(deserialize_with = "yes_no")]
    pub allow_container_sif: bool,

    /// Image path prefixes users may run from (empty = any).
    pub limit_container_paths: Vec<PathBuf>,
    /// Groups that must own images (empty = any).
    pub limit_container_groups: Vec<String>,
    /// Users that must own images (empty = any).
    pub limit_container_owners: Vec<String>,

    pub enable_overlay: OverlayMode,
    #[serde(deserialize_with = "yes_no")]
    pub enable_underlay: bool,
    pub root_default_capabilities: RootCapsMode,

    /// Propagate host mounts into the container (`rslave`) rather than `rprivate`.
    #[serde(deserialize_with = "yes_no")]
    pub mount_slave: bool,
    #[serde(deserialize_with = "yes_no")]
    pub enable_fusemount: bool,
    #[serde(deserialize_with = "yes_no")]
    pub user_bind_control: bool,

    /// System bind paths (`src[:dst]`).
    pub bind_path: Vec<String>,

    /// Users (names or UIDs) allowed to join network namespaces.
    pub allow_net_users: Vec<String>,
    /// Groups (names or GIDs) allowed to join network namespaces.
    pub allow_net_groups: Vec<String>,
    /// Network namespace paths users may join.
    pub allow_netns_paths: Vec<PathBuf>,
}

impl Default for AdminPolicy {
    fn default() -> Self {
        Self {
            allow_setuid: yes(),
            allow_pid_ns: yes(),
            allow_ipc_ns: yes(),
            allow_uts_ns: yes(),
            allow_user_ns: yes(),
            allow_container_squashfs: yes(),
            allow_container_extfs: yes(),
            allow_container_dir: yes(),
            allow_container_encrypted: yes(),
            allow_container_sif: yes(),
            limit_container_paths: Vec::new(),
            limit_container_groups: Vec::new(),
            limit_container_owners: Vec::new(),
            enable_overlay: OverlayMode::default(),
            enable_underlay: yes(),
            root_default_capabilities: RootCapsMode::default(),
            mount_slave: yes(),
            enable_fusemount: yes(),
            user_bind_control: yes(),
            bind_path: default_bind_paths(),
            allow_net_users: Vec::new(),
            allow_net_groups: Vec::new(),
            allow_netns_paths: Vec::new(),
        }
    }
}

impl AdminPolicy {
    /// Parses a policy from YAML text.
    pub fn from_yaml(text: &str) -> Result<Self> {
        if text.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_yaml::from_str(text)?)
    }

    /// Returns the mount propagation mode applied to the container root.
    pub fn mount_propagation(&self) -> &'static str {
        if self.mount_slave { "rslave" } else { "rprivate" }
    }
}

// =============================================================================
// Capability Authorization Table
// =============================================================================

/// Per-user and per-group capability grants.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapabilityConfig {
    #[serde(default)]
    pub users: BTreeMap<String, Vec<String>>,
    #[serde(default)]
    pub groups: BTreeMap<String, Vec<String>>,
}

impl CapabilityConfig {
    /// Parses a capability table from JSON text.
    pub fn from_json(text: &str) -> Result<Self> {
        if text.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_json::from_str(text)?)
    }

    /// Lists capabilities granted to `user`.
    pub fn list_user_caps(&self, user: &str) -> Vec<String> {
        self.users.get(user).cloned().unwrap_or_default()
    }

    /// Lists capabilities granted to `group`.
    pub fn list_group_caps(&self, group: &str) -> Vec<String> {
        self.groups.get(group).cloned().unwrap_or_default()
    }

    /// Splits `caps` into those granted to `user` and those that are not.
    pub fn check_user_caps(&self, user: &str, caps: &[String]) -> (Vec<String>, Vec<String>) {
        split_granted(self.users.get(user), caps)
    }

    /// Splits `caps` into those granted to `group` and those that are not.
    pub fn check_group_caps(&self, group: &str, caps: &[String]) -> (Vec<String>, Vec<String>) {
        split_granted(self.groups.get(group), caps)
    }
}

fn split_granted(granted: Option<&Vec<String>>, caps: &[String]) -> (Vec<String>, Vec<String>) {
    let granted = granted.map(Vec::as_slice).unwrap_or_default();
    caps.iter()
        .cloned()
        .partition(|c| granted.iter().any(|g| g.eq_ignore_ascii_case(c)))
}

// =============================================================================
// Policy Sources
// =============================================================================

/// Locations of the administrator inputs.
#[derive(Debug, Clone)]
pub struct PolicySources {
    pub config_file: PathBuf,
    pub capability_file: PathBuf,
    pub subuid_file: PathBuf,
    pub subgid_file: PathBuf,
}

impl Default for PolicySources {
    fn default() -> Self {
        Self {
            config_file: PathBuf::from(DEFAULT_POLICY_FILE),
            capability_file: PathBuf::from(DEFAULT_CAPABILITY_FILE),
            subuid_file: PathBuf::from(SUBUID_FILE),
            subgid_file: PathBuf::from(SUBGID_FILE),
        }
    }
}

/// Policy inputs after ownership verification and parsing.
#[derive(Debug, Clone, Default)]
pub struct LoadedPolicy {
    pub file: AdminPolicy,
    pub capabilities: CapabilityConfig,
    pub subuid_file: PathBuf,
    pub subgid_file: PathBuf,
}

impl PolicySources {
    /// Applies a user-supplied configuration file override.
    ///
    /// The override is honoured only by an unprivileged installation, or when
    /// the effective UID is already root.
    pub fn with_override(mut self, file: Option<&Path>, suid_install: bool, euid: u32) -> Self {
        if let Some(file) = file
            && (!suid_install || euid == 0)
        {
            self.config_file = file.to_path_buf();
        }
        self
    }

    /// Verifies ownership (when `is_suid`) and parses every input.
    ///
    /// A missing capability file is treated as an empty table; a missing
    /// main configuration is an error.
    pub fn load(&self, is_suid: bool) -> Result<LoadedPolicy> {
        if is_suid {
            ensure_root_owned(&self.config_file)?;
            if self.capability_file.exists() {
                ensure_root_owned(&self.capability_file)?;
            }
        }

        let text = std::fs::read_to_string(&self.config_file)
            .map_err(|e| Error::path_io(&self.config_file, e))?;
        let file = AdminPolicy::from_yaml(&text).map_err(|e| Error::InvalidConfiguration(
            format!("unable to parse {}: {}", self.config_file.display(), e),
        ))?;

        let capabilities = match std::fs::read_to_string(&self.capability_file) {
            Ok(text) => CapabilityConfig::from_json(&text)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(
                    "capability file {} not found, using empty table",
                    self.capability_file.display()
                );
                CapabilityConfig::default()
            }
            Err(e) => return Err(Error::path_io(&self.capability_file, e)),
        };

        debug!("loaded administrator policy from {}", self.config_file.display());
        Ok(LoadedPolicy {
            file,
            capabilities,
            subuid_file: self.subuid_file.clone(),
            subgid_file: self.subgid_file.clone(),
        })
    }
}

/// Fails with [`Error::PolicyIntegrity`] unless `path` is owned by root.
pub fn ensure_root_owned(path: &Path) -> Result<()> {
    let meta = std::fs::metadata(path).map_err(|e| Error::PolicyIntegrity {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })?;
    if meta.uid() != 0 {
        return Err(Error::PolicyIntegrity {
            path: path.to_path_buf(),
            reason: format!("must be owned by root, owned by UID {}", meta.uid()),
        });
    }
    Ok(())
}
