//! # Capability Resolver
//!
//! Computes the capability set of the container process. Resolution is a
//! pure function of its inputs, so running it twice yields the same bits.
//!
//! ## Decision Matrix
//!
//! | Caller | Setuid (enforced) | Source of added capabilities |
//! |--------|-------------------|------------------------------|
//! | root | n/a | policy default (`full` / `file` / none) + every add |
//! | non-root | yes | adds authorized for the user or any of its groups |
//! | non-root | no | every add (no setuid boundary exists) |
//!
//! Drops always win, whatever the source of a capability.
//!
//! ## Flattening
//!
//! The resolved set is written identically into all five classes
//! (permitted, effective, inheritable, bounding, ambient). See
//! [`OciCapabilities::flattened`].

use crate::identity::Identity;
use crate::policy::{CapabilityConfig, RootCapsMode};
use caps::Capability;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use tracing::{debug, warn};

// =============================================================================
// Capability Set
// =============================================================================

/// A set of Linux capabilities stored as a kernel-style bitmask.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct CapabilitySet(u64);

impl CapabilitySet {
    /// The empty set.
    pub const fn empty() -> Self {
        Self(0)
    }

    /// Every capability known to this build.
    pub fn full() -> Self {
        caps::all().into_iter().collect()
    }

    /// Builds a set from its raw bitmask.
    pub const fn from_bits(bits: u64) -> Self {
        Self(bits)
    }

    /// Raw bitmask, bit N = capability index N.
    pub const fn bits(&self) -> u64 {
        self.0
    }

    pub fn insert(&mut self, cap: Capability) {
        self.0 |= cap.bitmask();
    }

    pub fn remove(&mut self, cap: Capability) {
        self.0 &= !cap.bitmask();
    }

    pub fn contains(&self, cap: Capability) -> bool {
        self.0 & cap.bitmask() != 0
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    pub fn is_subset(&self, other: &Self) -> bool {
        self.0 & !other.0 == 0
    }

    pub fn union(&self, other: &Self) -> Self {
        Self(self.0 | other.0)
    }

    pub fn intersection(&self, other: &Self) -> Self {
        Self(self.0 & other.0)
    }

    pub fn difference(&self, other: &Self) -> Self {
        Self(self.0 & !other.0)
    }

    /// Capabilities in ascending index order.
    pub fn iter(&self) -> impl Iterator<Item = Capability> + '_ {
        let mut all: Vec<Capability> = caps::all().into_iter().collect();
        all.sort_by_key(|c| c.index());
        all.into_iter().filter(|c| self.contains(*c))
    }

    /// Canonical `CAP_*` names in ascending index order.
    pub fn names(&self) -> Vec<String> {
        self.iter().map(|c| c.to_string()).collect()
    }

    /// Parses names, ignoring unknown ones.
    pub fn from_names<S: AsRef<str>>(names: &[S]) -> Self {
        split(names).0
    }
}

impl FromIterator<Capability> for CapabilitySet {
    fn from_iter<I: IntoIterator<Item = Capability>>(iter: I) -> Self {
        let mut set = Self::empty();
        for cap in iter {
            set.insert(cap);
        }
        set
    }
}

/// Normalizes a user-supplied name (`sys_admin`, `CAP_SYS_ADMIN`, ` Net_Raw `).
pub fn normalize(name: &str) -> String {
    let upper = name.trim().to_ascii_uppercase();
    if upper.starts_with("CAP_") {
        upper
    } else {
        format!("CAP_{}", upper)
    }
}

/// Splits a list of names into known capabilities and unknown names.
///
/// Entries may be comma-separated; `ALL` expands to every capability.
pub fn split<S: AsRef<str>>(names: &[S]) -> (CapabilitySet, Vec<String>) {
    let mut set = CapabilitySet::empty();
    let mut unknown = Vec::new();
    for entry in names {
        for name in entry.as_ref().split(',').filter(|n| !n.trim().is_empty()) {
            let normalized = normalize(name);
            if normalized == "CAP_ALL" {
                set = set.union(&CapabilitySet::full());
                continue;
            }
            match Capability::from_str(&normalized) {
                Ok(cap) => set.insert(cap),
                Err(_) => unknown.push(name.trim().to_string()),
            }
        }
    }
    (set, unknown)
}

// =============================================================================
// OCI Capability Classes
// =============================================================================

/// The five capability classes of an OCI process, as `CAP_*` names.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OciCapabilities {
    #[serde(default)]
    pub permitted: Vec<String>,
    #[serde(default)]
    pub effective: Vec<String>,
    #[serde(default)]
    pub inheritable: Vec<String>,
    #[serde(default)]
    pub bounding: Vec<String>,
    #[serde(default)]
    pub ambient: Vec<String>,
}

impl OciCapabilities {
    /// Writes `set` into all five classes.
    pub fn flattened(set: CapabilitySet) -> Self {
        let names = set.names();
        Self {
            permitted: names.clone(),
            effective: names.clone(),
            inheritable: names.clone(),
            bounding: names.clone(),
            ambient: names,
        }
    }

    /// Bitmasks in starter order: permitted, effective, inheritable,
    /// bounding, ambient. Unknown names are ignored.
    pub fn bitmasks(&self) -> CapabilityMasks {
        CapabilityMasks {
            permitted: CapabilitySet::from_names(&self.permitted).bits(),
            effective: CapabilitySet::from_names(&self.effective).bits(),
            inheritable: CapabilitySet::from_names(&self.inheritable).bits(),
            bounding: CapabilitySet::from_names(&self.bounding).bits(),
            ambient: CapabilitySet::from_names(&self.ambient).bits(),
        }
    }
}

/// Raw bitmasks as written to the starter channel.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapabilityMasks {
    pub permitted: u64,
    pub effective: u64,
    pub inheritable: u64,
    pub bounding: u64,
    pub ambient: u64,
}

// =============================================================================
// Resolver
// =============================================================================

/// User-side capability request.
#[derive(Debug, Clone, Default)]
pub struct CapabilityRequest {
    /// `--add-caps` entries.
    pub add: Vec<String>,
    /// `--drop-caps` entries.
    pub drop: Vec<String>,
    /// Capabilities already present on the process (e.g. restored from an instance).
    pub existing: Vec<String>,
    /// `--no-privs`.
    pub no_privs: bool,
    /// `--keep-privs`.
    pub keep_privs: bool,
    /// Root asked to run as another UID/GID.
    pub target_ids: bool,
}

/// Outcome of capability resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolvedCapabilities {
    pub set: CapabilitySet,
    /// The process must run with `no_new_privs`.
    pub no_new_privileges: bool,
}

/// Resolves capabilities for a root caller.
pub fn resolve_root(
    identity: &Identity,
    table: &CapabilityConfig,
    default_mode: RootCapsMode,
    request: &CapabilityRequest,
) -> ResolvedCapabilities {
    let mut mode = default_mode;
    if request.target_ids {
        mode = RootCapsMode::No;
    }
    if request.no_privs {
        debug!("--no-privs requested, no new privileges enabled");
        mode = RootCapsMode::No;
    } else if request.keep_privs {
        debug!("--keep-privs requested");
        mode = RootCapsMode::Full;
    }
    debug!("Root {:?} capabilities", mode);

    let mut no_new_privileges = false;
    let mut set = match mode {
        RootCapsMode::Full => CapabilitySet::full(),
        RootCapsMode::File => {
            let mut set = CapabilitySet::from_names(&table.list_user_caps("root"));
            for group in identity.group_names() {
                let granted = CapabilitySet::from_names(&table.list_group_caps(group));
                if !granted.is_empty() {
                    debug!("{} group capabilities {:?} added", group, granted.names());
                }
                set = set.union(&granted);
            }
            set
        }
        RootCapsMode::No => {
            no_new_privileges = true;
            CapabilitySet::empty()
        }
    };

    let (adds, unknown) = split(&request.add);
    if !unknown.is_empty() {
        warn!("won't add unknown capability: {}", unknown.join(","));
    }
    for cap in adds.difference(&set).iter() {
        debug!("Root capability {} added", cap);
    }
    set = set.union(&adds);

    set = apply_drops(set, &request.drop, "Root capability");
    ResolvedCapabilities {
        set,
        no_new_privileges,
    }
}

/// Resolves capabilities for a non-root caller.
///
/// With `enforced` (setuid install) every added capability must be granted
/// to the username or one of its groups; the rest are dropped with a warning.
pub fn resolve_user(
    identity: &Identity,
    table: &CapabilityConfig,
    enforced: bool,
    request: &CapabilityRequest,
) -> ResolvedCapabilities {
    let (mut requested, unknown) = split(&request.add);
    if !unknown.is_empty() {
        warn!("won't add unknown capability: {}", unknown.join(","));
    }
    requested = requested.union(&CapabilitySet::from_names(&request.existing));

    let granted = if enforced {
        let names = requested.names();
        let mut authorized =
            CapabilitySet::from_names(&table.check_user_caps(&identity.username, &names).0);
        if !authorized.is_empty() {
            debug!("User capabilities {:?} added", authorized.names());
        }
        for group in identity.group_names() {
            let by_group = CapabilitySet::from_names(&table.check_group_caps(group, &names).0);
            if !by_group.is_empty() {
                debug!("{} group capabilities {:?} added", group, by_group.names());
            }
            authorized = authorized.union(&by_group);
        }

        let denied = requested.difference(&authorized);
        if !denied.is_empty() {
            warn!("not authorized to add capability: {}", denied.names().join(","));
        }
        authorized
    } else {
        requested
    };

    ResolvedCapabilities {
        set: apply_drops(granted, &request.drop, "Capability"),
        no_new_privileges: true,
    }
}

fn apply_drops(set: CapabilitySet, drop: &[String], label: &str) -> CapabilitySet {
    let (drops, unknown) = split(drop);
    if !unknown.is_empty() {
        warn!("won't drop unknown capability: {}", unknown.join(","));
    }
    for cap in drops.intersection(&set).iter() {
        debug!("{} {} dropped", label, cap);
    }
    set.difference(&drops)
}
