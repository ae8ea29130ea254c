//! Invoking user identity and allow-list membership.

use crate::error::{Error, Result};
use nix::unistd::{Gid, Group, Uid, User};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::debug;

/// A supplementary group of the invoking user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupEntry {
    pub gid: u32,
    pub name: String,
}

/// Identity of the process running the preparation stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    /// Real UID.
    pub uid: u32,
    /// Real GID.
    pub gid: u32,
    /// Effective UID.
    pub euid: u32,
    /// Login name (empty if the UID has no passwd entry).
    pub username: String,
    pub home: String,
    pub shell: String,
    pub gecos: String,
    /// Supplementary groups, resolved to names where possible.
    pub groups: Vec<GroupEntry>,
}

impl Identity {
    /// Samples the identity of the current process.
    pub fn current() -> Result<Self> {
        let uid = nix::unistd::getuid();
        let gid = nix::unistd::getgid();
        let euid = nix::unistd::geteuid();

        let user = User::from_uid(uid).map_err(|e| Error::sys("getpwuid", e))?;
        let gids = nix::unistd::getgroups().map_err(|e| Error::sys("getgroups", e))?;

        let mut groups = Vec::with_capacity(gids.len());
        for g in gids {
            match Group::from_gid(g) {
                Ok(Some(group)) => groups.push(GroupEntry {
                    gid: g.as_raw(),
                    name: group.name,
                }),
                Ok(None) => debug!("Ignoring group {}: no group entry", g),
                Err(e) => debug!("Ignoring group {}: {}", g, e),
            }
        }

        let (username, home, shell, gecos) = match user {
            Some(u) => (
                u.name,
                u.dir.to_string_lossy().into_owned(),
                u.shell.to_string_lossy().into_owned(),
                u.gecos.to_string_lossy().into_owned(),
            ),
            None => Default::default(),
        };

        Ok(Self {
            uid: uid.as_raw(),
            gid: gid.as_raw(),
            euid: euid.as_raw(),
            username,
            home,
            shell,
            gecos,
            groups,
        })
    }

    /// Returns true for real root.
    pub fn is_root(&self) -> bool {
        self.uid == 0
    }

    /// Names of all supplementary groups.
    pub fn group_names(&self) -> impl Iterator<Item = &str> {
        self.groups.iter().map(|g| g.name.as_str())
    }

    /// Returns true if the user appears in `list` by name or numeric UID.
    pub fn in_user_list(&self, list: &[String]) -> bool {
        list.iter().any(|entry| {
            let entry = entry.trim();
            entry == self.username || entry.parse::<u32>().is_ok_and(|id| id == self.uid)
        })
    }

    /// Returns true if the primary or any supplementary group appears in
    /// `list` by name or numeric GID.
    pub fn in_any_group(&self, list: &[String]) -> bool {
        list.iter().any(|entry| {
            let entry = entry.trim();
            match entry.parse::<u32>() {
                Ok(id) => id == self.gid || self.groups.iter().any(|g| g.gid == id),
                Err(_) => self.groups.iter().any(|g| g.name == entry),
            }
        })
    }
}

/// User information handed to the next stage for passwd/group generation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserInfo {
    pub username: String,
    pub gecos: String,
    pub uid: u32,
    pub gid: u32,
    pub shell: String,
    pub home: String,
    pub groups: BTreeMap<u32, String>,
}

impl UserInfo {
    /// Builds user information for the container process.
    ///
    /// With `target` IDs the passwd entry of the target UID is used and the
    /// target GIDs replace the caller's supplementary groups; HOME always
    /// comes from the caller.
    pub fn resolve(identity: &Identity, target: Option<(u32, &[u32])>) -> Self {
        let mut info = UserInfo {
            home: identity.home.clone(),
            ..Default::default()
        };

        let mut gids: Vec<u32> = match target {
            Some((uid, gids)) => {
                if let Ok(Some(pw)) = User::from_uid(Uid::from_raw(uid)) {
                    info.username = pw.name;
                    info.gecos = pw.gecos.to_string_lossy().into_owned();
                    info.uid = pw.uid.as_raw();
                    info.gid = pw.gid.as_raw();
                    info.shell = pw.shell.to_string_lossy().into_owned();
                } else {
                    info.uid = uid;
                }
                gids.to_vec()
            }
            None => {
                info.username = identity.username.clone();
                info.gecos = identity.gecos.clone();
                info.uid = identity.uid;
                info.gid = identity.gid;
                info.shell = identity.shell.clone();
                for g in &identity.groups {
                    info.groups.insert(g.gid, g.name.clone());
                }
                identity.groups.iter().map(|g| g.gid).collect()
            }
        };
        gids.push(info.gid);

        for gid in gids {
            if info.groups.contains_key(&gid) {
                continue;
            }
            if let Ok(Some(group)) = Group::from_gid(Gid::from_raw(gid)) {
                info.groups.insert(gid, group.name);
            }
        }
        info
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn alice() -> Identity {
        Identity {
            uid: 1000,
            gid: 1000,
            euid: 1000,
            username: "alice".into(),
            home: "/home/alice".into(),
            shell: "/bin/sh".into(),
            gecos: String::new(),
            groups: vec![GroupEntry {
                gid: 27,
                name: "sudo".into(),
            }],
        }
    }

    #[test]
    fn test_user_list_by_name_or_uid() {
        let id = alice();
        assert!(id.in_user_list(&["bob".into(), "alice".into()]));
        assert!(id.in_user_list(&["1000".into()]));
        assert!(!id.in_user_list(&["1001".into()]));
    }

    #[test]
    fn test_group_list_by_name_or_gid() {
        let id = alice();
        assert!(id.in_any_group(&["sudo".into()]));
        assert!(id.in_any_group(&["1000".into()]));
        assert!(!id.in_any_group(&["wheel".into()]));
    }

    #[test]
    fn test_user_info_without_target_keeps_caller() {
        let info = UserInfo::resolve(&alice(), None);
        assert_eq!(info.username, "alice");
        assert_eq!(info.home, "/home/alice");
        assert_eq!(info.groups.get(&27).map(String::as_str), Some("sudo"));
    }
}
