//! Fresh-container preparation.

use super::Preparation;
use crate::autofs;
use crate::capabilities::{CapabilitySet, OciCapabilities};
use crate::error::{Error, Result};
use crate::idmap::{self, IdMapping, MappingMode, SubIdFile};
use crate::namespace::{self, Namespace, NamespaceType};
use std::path::Path;
use tracing::debug;

impl Preparation<'_> {
    /// Namespaces, capabilities, fakeroot mappings and security options for
    /// a new container.
    pub(super) fn prepare_fresh(&mut self, target_ids: bool) -> Result<()> {
        let is_suid = self.engine.host.is_suid;

        namespace::apply_policy(
            &mut self.config.namespaces,
            &self.policy.file,
            self.engine.host.suid_install,
            self.config.hostname.is_some(),
        )?;
        if let Some(path) = namespace::authorize_netns_join(
            &self.config.namespaces,
            &self.policy.file,
            &self.engine.host.identity,
        )? {
            debug!("Joining network namespace {}", path.display());
        }

        self.resolve_capabilities(is_suid, target_ids);

        let propagation = self.policy.file.mount_propagation();
        debug!("Set mount propagation to {}", propagation);
        self.plan.set_mount_propagation(propagation);

        if self.config.fakeroot {
            self.prepare_fakeroot()?;
        }

        // The starter only acts on this with CLONE_NEWNET.
        self.plan.bring_loopback_interface = true;
        self.plan.is_instance = self.config.instance;

        self.plan.set_namespace_flags(&self.config.namespaces);
        self.plan.set_namespace_paths(&self.config.namespaces);

        if self.config.namespaces.has(NamespaceType::User) && self.config.uid_mappings.is_empty() {
            let identity = &self.engine.host.identity;
            self.config.uid_mappings = vec![IdMapping::new(identity.uid, identity.uid, 1)];
            self.config.gid_mappings = vec![IdMapping::new(identity.gid, identity.gid, 1)];
        }
        self.plan.uid_map = self.config.uid_mappings.clone();
        self.plan.gid_map = self.config.gid_mappings.clone();

        self.apply_security()
    }

    /// Root inside a user namespace, mapped onto the caller's subordinate
    /// ID ranges.
    fn prepare_fakeroot(&mut self) -> Result<()> {
        if !self.policy.file.allow_user_ns {
            return Err(Error::ConfigurationDisallowed(
                "user namespace, required by --fakeroot".to_string(),
            ));
        }

        let identity = &self.engine.host.identity;
        let mode = idmap::mapping_mode(self.engine.host.is_suid, self.engine.search_path.as_deref())?;
        let subuid = SubIdFile::load(&self.policy.subuid_file)?;
        let subgid = SubIdFile::load(&self.policy.subgid_file)?;
        let maps = idmap::fakeroot_maps(
            identity.uid,
            identity.gid,
            &identity.username,
            &subuid,
            &subgid,
            mode,
        )?;

        if let MappingMode::Helper {
            newuidmap,
            newgidmap,
        } = &maps.mode
        {
            self.plan.newuidmap_path = Some(newuidmap.clone());
            self.plan.newgidmap_path = Some(newgidmap.clone());
        }
        self.config.uid_mappings = maps.uid_map;
        self.config.gid_mappings = maps.gid_map;

        self.config.process.capabilities = OciCapabilities::flattened(CapabilitySet::full());
        self.config
            .namespaces
            .add_or_replace(Namespace::create(NamespaceType::User));

        self.plan.hybrid_workflow = true;
        self.plan.allow_setgroups = true;
        self.plan.no_setgroups = self.config.no_setgroups;
        self.plan.target_uid = 0;
        self.plan.set_target_gids(&[0]);
        debug!("fakeroot mappings prepared for {}", identity.username);
        Ok(())
    }

    /// Pins bind sources, home and working directory that live under autofs.
    pub(super) fn pin_autofs(&mut self) -> Result<()> {
        let points = match autofs::autofs_points(&self.engine.host.mountinfo) {
            Ok(points) => points,
            Err(e) => {
                debug!("Could not read autofs mount points: {}", e);
                return Ok(());
            }
        };
        if points.is_empty() {
            return Ok(());
        }

        let mut candidates: Vec<(&str, &Path)> = Vec::new();
        if self.policy.file.user_bind_control {
            for bind in &self.config.bind_paths {
                if !bind.is_image() {
                    candidates.push(("bind source", bind.source.as_path()));
                }
            }
        }
        if !self.config.contain {
            for entry in &self.policy.file.bind_path {
                let source = entry.split(':').next().unwrap_or_default();
                if !source.is_empty() {
                    candidates.push(("bind path", Path::new(source)));
                }
            }
            if let Some(home) = &self.config.home_source {
                candidates.push(("home", home.as_path()));
            }
            if let Some(cwd) = &self.config.cwd {
                candidates.push(("current working directory", cwd.as_path()));
            }
        } else if let Some(workdir) = &self.config.workdir {
            candidates.push(("workdir", workdir.as_path()));
        }

        let pinned = autofs::pin_all(candidates, &points);
        for file in pinned {
            self.hold(file)?;
        }
        Ok(())
    }
}
