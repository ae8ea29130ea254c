//! Joining a running instance.

use super::Preparation;
use super::config::EngineConfig;
use crate::error::{Error, Result};
use crate::instance::{self, InstanceRecord, ProcDir, ProofContext};
use std::path::PathBuf;
use tracing::{debug, info};

impl Preparation<'_> {
    /// Prepares to enter the namespaces of an existing instance.
    ///
    /// Nothing under `/proc` is opened until the setuid expectation and the
    /// recorded process IDs have been checked.
    pub(super) fn prepare_join(&mut self) -> Result<()> {
        let engine = self.engine;
        let identity = &engine.host.identity;
        let record_path = self.instance_record_path()?;
        let record = InstanceRecord::load(&record_path)?;

        let suid_required = instance::check_join_privilege(identity.uid, engine.host.is_suid, &record)?;

        let proc = ProcDir::open(record.pid)?;
        if suid_required {
            instance::verify(
                &proc,
                &ProofContext {
                    uid: identity.uid,
                    gid: identity.gid,
                    ppid: record.ppid,
                },
            )?;
            debug!("instance {} passed integrity proofs", record.name);
        }

        let instance: EngineConfig = serde_json::from_value(record.config.clone()).map_err(|e| {
            Error::InstanceIntegrity(format!("unreadable engine configuration: {}", e))
        })?;

        let dir = proc.into_file();
        let fd = self.hold(dir)?;
        self.plan.working_directory_fd = Some(fd);
        self.plan.image_fd = Some(fd);

        self.plan.join_only = true;
        let mut namespaces = instance.namespaces.clone();
        namespaces.relative_to_proc();
        self.plan.set_namespace_paths(&namespaces);
        self.config.namespaces = namespaces;

        self.config.process.capabilities = instance.process.capabilities.clone();
        self.resolve_capabilities(suid_required, false);

        if instance.fakeroot {
            self.plan.target_uid = 0;
            self.plan.set_target_gids(&[0]);
        }

        if let Some(home) = &instance.home_dest {
            self.config
                .process
                .env
                .insert("HOME".to_string(), home.to_string_lossy().into_owned());
        }

        // Each confinement field is restored unless overridden on its own.
        self.apply_security()?;
        if self.config.security_param("selinux").is_none() {
            self.config.process.selinux_label = instance.process.selinux_label.clone();
        }
        if self.config.security_param("apparmor").is_none() {
            self.config.process.apparmor_profile = instance.process.apparmor_profile.clone();
        }
        if self.config.security_param("seccomp").is_none() {
            self.config.process.seccomp = instance.process.seccomp.clone();
        }
        self.set_user_info(false);

        if record.cgroup {
            let parent = nix::unistd::getppid().as_raw();
            instance::join_cgroup(record.pid, parent.unsigned_abs())?;
        }

        self.config.process.no_new_privileges = if identity.is_root() {
            instance.process.no_new_privileges
        } else {
            true
        };

        info!("joining instance {} (pid {})", record.name, record.pid);
        Ok(())
    }

    fn instance_record_path(&self) -> Result<PathBuf> {
        if let Some(path) = &self.config.instance_file {
            return Ok(path.clone());
        }
        let name = self.config.instance_join.as_deref().unwrap_or_default();
        let hostname = nix::unistd::gethostname()
            .map_err(|e| Error::sys("gethostname", e))?
            .to_string_lossy()
            .into_owned();
        let home = PathBuf::from(&self.engine.host.identity.home);
        Ok(InstanceRecord::path_for(&home, &hostname, name))
    }
}
