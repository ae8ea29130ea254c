//! # Engine Preparation Pipeline
//!
//! Turns one [`EngineConfig`] and the administrator policy into a complete
//! [`StarterPlan`], or fails without leaving anything applied.
//!
//! ## Steps
//!
//! ```text
//! 1. load policy          (root ownership verified when setuid)
//! 2. setuid allowed?      (allow-setuid)
//! 3. instance join  ──────► join::prepare_join
//!    fresh container ─────► fresh::prepare_fresh ─► images::load_images
//! 4. capability bitmasks into the plan
//! 5. signal propagation   (controlling terminal process group)
//! 6. /dev/fuse handles    (enable-fusemount)
//! 7. socket pair          (both ends kept)
//! ```
//!
//! Every descriptor the plan references is owned by the returned
//! [`Prepared`] so it stays open until the plan is published and the next
//! stage has inherited it.
//!
//! ## Privilege
//!
//! Preparation runs after the starter has dropped what it does not need.
//! Nothing in this module raises privileges; it only reads state, opens
//! descriptors and computes values.

mod config;
mod fresh;
mod images;
mod join;

pub use config::{BindPath, EngineConfig, ImageEntry, ProcessConfig};

use crate::capabilities::{self, CapabilityRequest, OciCapabilities};
use crate::error::{Error, Result};
use crate::fuse;
use crate::host::HostState;
use crate::image::{Image, SifDescriptorReader, SifInspector};
use crate::policy::{LoadedPolicy, PolicySources};
use crate::starter::{StarterPlan, StarterRegion};
use nix::sys::socket::{AddressFamily, SockFlag, SockType, socketpair};
use std::fs::File;
use std::os::fd::{AsRawFd, OwnedFd};
use std::path::PathBuf;
use tracing::{debug, info, warn};

/// The preparation pipeline and its host-level collaborators.
pub struct Engine {
    sources: PolicySources,
    host: HostState,
    inspector: Box<dyn SifInspector>,
    fuse_device: PathBuf,
    search_path: Option<String>,
}

impl Engine {
    /// Creates an engine for a sampled host.
    pub fn new(sources: PolicySources, host: HostState) -> Self {
        Self {
            sources,
            host,
            inspector: Box::new(SifDescriptorReader),
            fuse_device: PathBuf::from(crate::constants::DEV_FUSE),
            search_path: std::env::var("PATH").ok(),
        }
    }

    /// Replaces the SIF descriptor reader.
    pub fn with_sif_inspector(mut self, inspector: Box<dyn SifInspector>) -> Self {
        self.inspector = inspector;
        self
    }

    /// Overrides the FUSE device path.
    pub fn with_fuse_device(mut self, device: impl Into<PathBuf>) -> Self {
        self.fuse_device = device.into();
        self
    }

    /// Overrides the search path for ID-mapping helpers.
    pub fn with_search_path(mut self, path: impl Into<String>) -> Self {
        self.search_path = Some(path.into());
        self
    }

    pub fn host(&self) -> &HostState {
        &self.host
    }

    /// Builds the launch plan for `config`.
    pub fn prepare(&self, config: EngineConfig) -> Result<Prepared> {
        let is_suid = self.host.is_suid;
        let identity = &self.host.identity;

        // 1. policy
        let sources = self.sources.clone().with_override(
            config.configuration_file.as_deref(),
            self.host.suid_install,
            identity.euid,
        );
        let policy = sources.load(is_suid)?;

        // 2. setuid permission
        if is_suid && !policy.file.allow_setuid {
            return Err(Error::ConfigurationDisallowed(
                "the setuid workflow (allow-setuid: no)".to_string(),
            ));
        }

        let mut prep = Preparation {
            engine: self,
            policy,
            config,
            plan: StarterPlan::new(),
            images: Vec::new(),
            held: Vec::new(),
        };
        prep.capture_cwd();
        if prep.config.process.args.is_empty() {
            return Err(Error::InvalidConfiguration(
                "container process arguments not found".to_string(),
            ));
        }

        let target_ids = prep.apply_root_target_ids();

        // 3. join or fresh
        if prep.config.instance_join.is_some() {
            prep.prepare_join()?;
        } else {
            prep.set_user_info(target_ids);
            prep.prepare_fresh(target_ids)?;
            prep.load_images()?;
            prep.pin_autofs()?;
        }

        prep.plan.master_propagate_mount = true;
        prep.plan.no_new_privs = prep.config.process.no_new_privileges;

        // 4. capabilities
        prep.plan.set_capabilities(&prep.config.process.capabilities);

        // 5. signals
        prep.config.signal_propagation = self.host.process_groups.needs_signal_propagation();
        debug!("signal propagation: {}", prep.config.signal_propagation);

        // 6. FUSE
        prep.open_fuse()?;

        // 7. socket pair
        let (a, b) = socketpair(
            AddressFamily::Unix,
            SockType::Stream,
            None,
            SockFlag::SOCK_CLOEXEC,
        )
        .map_err(|e| Error::sys("socketpair", e))?;
        prep.plan.keep_fd(a.as_raw_fd())?;
        prep.plan.keep_fd(b.as_raw_fd())?;
        prep.config.unix_socket_pair = Some((a.as_raw_fd(), b.as_raw_fd()));

        if prep.config.nv_ccli {
            prep.plan.nv_ccli_caps = true;
        }

        info!(
            "prepared launch of {} ({} images, {} kept descriptors)",
            prep.config.image.display(),
            prep.images.len(),
            prep.plan.kept_fds.len()
        );

        Ok(Prepared {
            plan: prep.plan,
            config: prep.config,
            images: prep.images,
            held: prep.held,
            socket_pair: (a, b),
        })
    }
}

/// A finished plan together with every descriptor it references.
#[derive(Debug)]
pub struct Prepared {
    pub plan: StarterPlan,
    pub config: EngineConfig,
    pub images: Vec<Image>,
    /// Working-directory, autofs and FUSE descriptors.
    pub held: Vec<File>,
    pub socket_pair: (OwnedFd, OwnedFd),
}

impl Prepared {
    /// Engine configuration payload for the next stage.
    pub fn engine_json(&self) -> Result<Vec<u8>> {
        self.config.to_json()
    }

    /// Copies the plan and payload into the shared region.
    pub fn publish(&self, region: &mut StarterRegion) -> Result<()> {
        let payload = self.engine_json()?;
        region.publish(&self.plan, &payload)
    }
}

// =============================================================================
// Preparation State
// =============================================================================

/// Mutable state of one preparation.
pub(crate) struct Preparation<'a> {
    engine: &'a Engine,
    policy: LoadedPolicy,
    config: EngineConfig,
    plan: StarterPlan,
    images: Vec<Image>,
    held: Vec<File>,
}

impl Preparation<'_> {
    fn host(&self) -> &HostState {
        &self.engine.host
    }

    /// Keeps `file` open and registered in the plan; returns its descriptor.
    fn hold(&mut self, file: File) -> Result<i32> {
        let fd = file.as_raw_fd();
        self.plan.keep_fd(fd)?;
        self.held.push(file);
        Ok(fd)
    }

    fn capture_cwd(&mut self) {
        if self.config.cwd.is_some() {
            return;
        }
        self.config.cwd = Some(match std::env::current_dir() {
            Ok(cwd) => cwd,
            Err(_) => {
                warn!("can't determine current working directory");
                PathBuf::from("/")
            }
        });
    }

    /// Root asking for another UID/GID gets them, with no new privileges.
    fn apply_root_target_ids(&mut self) -> bool {
        let uid = self.config.target_uid;
        let gids = self.config.target_gids.clone();
        if self.host().identity.is_root() && (uid != 0 || !gids.is_empty()) {
            self.plan.target_uid = uid;
            self.plan.set_target_gids(&gids);
            self.config.process.no_new_privileges = true;
            return true;
        }
        false
    }

    fn set_user_info(&mut self, use_target_ids: bool) {
        let identity = &self.engine.host.identity;
        let target =
            use_target_ids.then(|| (self.config.target_uid, self.config.target_gids.as_slice()));
        self.config.user_info = Some(crate::identity::UserInfo::resolve(identity, target));
    }

    /// Resolves capabilities for the caller into the process configuration.
    fn resolve_capabilities(&mut self, enforced: bool, target_ids: bool) {
        let identity = &self.engine.host.identity;
        let request = CapabilityRequest {
            add: self.config.add_caps.clone(),
            drop: self.config.drop_caps.clone(),
            existing: self.config.process.capabilities.permitted.clone(),
            no_privs: self.config.no_privs,
            keep_privs: self.config.keep_privs,
            target_ids: target_ids && !self.config.fakeroot,
        };
        let resolved = if identity.is_root() {
            capabilities::resolve_root(
                identity,
                &self.policy.capabilities,
                self.policy.file.root_default_capabilities,
                &request,
            )
        } else {
            capabilities::resolve_user(identity, &self.policy.capabilities, enforced, &request)
        };
        if resolved.no_new_privileges {
            self.config.process.no_new_privileges = true;
        }
        self.config.process.capabilities = OciCapabilities::flattened(resolved.set);
    }

    /// Applies `selinux:`, `apparmor:` and `seccomp:` security options.
    fn apply_security(&mut self) -> Result<()> {
        if let Some(label) = self.config.security_param("selinux").map(str::to_string) {
            debug!("Applying SELinux context {}", label);
            self.config.process.selinux_label = Some(label);
        }
        if let Some(profile) = self.config.security_param("apparmor").map(str::to_string) {
            debug!("Applying Apparmor profile {}", profile);
            self.config.process.apparmor_profile = Some(profile);
        }
        if let Some(file) = self.config.security_param("seccomp").map(PathBuf::from) {
            debug!("Applying seccomp rule from {}", file.display());
            let text = std::fs::read_to_string(&file).map_err(|e| Error::path_io(&file, e))?;
            self.config.process.seccomp = Some(serde_json::from_str(&text)?);
        }
        Ok(())
    }

    fn open_fuse(&mut self) -> Result<()> {
        let handles = fuse::open_fuse_devices_at(
            &self.engine.fuse_device,
            &mut self.config.fuse_mounts,
            self.policy.file.enable_fusemount,
            self.engine.host.is_suid,
            self.config.fakeroot,
        )?;
        if handles.send_fd {
            debug!("FUSE descriptors will be passed to the master process");
        }
        for file in handles.files {
            self.hold(file)?;
        }
        Ok(())
    }
}
