//! # Host-Side Lifecycle Handshake
//!
//! Two single-shot protocols run by a host process that shares the
//! launcher's namespaces:
//!
//! | Protocol | Action |
//! |----------|--------|
//! | post-start | lazily unmount the FUSE image mount and remove its temporary directory |
//! | cleanup | same FUSE teardown if still needed, then remove the image pull directory |
//!
//! Each waits for one trigger byte on a connected stream socket (the value
//! is not inspected), runs its action and answers with exactly one status
//! byte: [`LIFECYCLE_COMPLETE`] or [`LIFECYCLE_FAILED`].
//!
//! ## Idempotence
//!
//! Every action checks whether there is anything left to do before acting,
//! so a second cleanup over already-cleaned state succeeds without issuing
//! another unmount. Cleanup attempts every independent action and reports
//! all failures together as [`Error::Cleanup`].
//!
//! # Example
//!
//! ```rust,ignore
//! use stagehand::fuse::Fusermount;
//! use stagehand::lifecycle::{HostCleanupState, Lifecycle, serve};
//!
//! let state = HostCleanupState::from(&engine_config);
//! let lifecycle = Lifecycle::new(state, Box::new(Fusermount::default()));
//! serve(&mut stream, None, || lifecycle.cleanup_host()).await?;
//! ```

use crate::constants::{LIFECYCLE_COMPLETE, LIFECYCLE_FAILED, LIFECYCLE_REPLY_TIMEOUT};
use crate::engine::EngineConfig;
use crate::error::{Error, Result};
use crate::fuse::Unmounter;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

/// The part of the engine configuration the host handlers need.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HostCleanupState {
    /// Root image is mounted through FUSE on the host.
    pub image_fuse: bool,
    /// FUSE mount point of the image.
    pub image: PathBuf,
    /// Temporary directory that holds the FUSE mount point.
    pub delete_temp_dir: Option<PathBuf>,
    /// Temporary directory of an implicit image pull.
    pub delete_pull_temp_dir: Option<PathBuf>,
}

impl From<&EngineConfig> for HostCleanupState {
    fn from(config: &EngineConfig) -> Self {
        Self {
            image_fuse: config.image_fuse,
            image: config.image.clone(),
            delete_temp_dir: config.delete_temp_dir.clone(),
            delete_pull_temp_dir: config.delete_pull_temp_dir.clone(),
        }
    }
}

/// Post-start and cleanup actions over one launch's host state.
pub struct Lifecycle {
    state: HostCleanupState,
    unmounter: Box<dyn Unmounter>,
}

impl Lifecycle {
    pub fn new(state: HostCleanupState, unmounter: Box<dyn Unmounter>) -> Self {
        Self { state, unmounter }
    }

    pub fn state(&self) -> &HostCleanupState {
        &self.state
    }

    /// Tears down the FUSE image mount once the container has started.
    pub async fn post_start_host(&self) -> Result<()> {
        if !self.state.image_fuse {
            return Ok(());
        }
        let Some(temp_dir) = &self.state.delete_temp_dir else {
            return Ok(());
        };
        if !temp_dir.exists() {
            debug!("FUSE temporary directory {} already removed", temp_dir.display());
            return Ok(());
        }

        self.unmounter.unmount_lazy(&self.state.image).await?;
        remove_tree(temp_dir)?;
        info!("removed FUSE temporary directory {}", temp_dir.display());
        Ok(())
    }

    /// Removes whatever host state the container left behind.
    ///
    /// Every action is attempted; failures are collected.
    pub async fn cleanup_host(&self) -> Result<()> {
        let mut errors = Vec::new();

        if self.state.image_fuse
            && let Some(temp_dir) = &self.state.delete_temp_dir
            && temp_dir.exists()
        {
            debug!("Unmounting FUSE image {}", self.state.image.display());
            if let Err(e) = self.unmounter.unmount_lazy(&self.state.image).await {
                errors.push(format!("while unmounting fuse directory {}: {}", self.state.image.display(), e));
            }
            if let Err(e) = remove_tree(temp_dir) {
                errors.push(format!("while removing temp directory {}: {}", temp_dir.display(), e));
            }
        }

        if let Some(pull_dir) = &self.state.delete_pull_temp_dir {
            debug!("Removing image pull directory {}", pull_dir.display());
            if let Err(e) = remove_tree(pull_dir) {
                errors.push(format!("while removing pull directory {}: {}", pull_dir.display(), e));
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            for e in &errors {
                warn!("cleanup: {}", e);
            }
            Err(Error::Cleanup(errors))
        }
    }
}

/// `remove_dir_all` that treats a missing directory as done.
fn remove_tree(path: &Path) -> Result<()> {
    match std::fs::remove_dir_all(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(Error::path_io(path, e)),
    }
}

// =============================================================================
// Socket Protocol
// =============================================================================

/// Waits for the trigger, runs `action` and reports its outcome.
///
/// `trigger_timeout` bounds the wait for the trigger byte; `None` waits
/// until the peer writes or closes. A peer that closes before sending the
/// trigger is an error and the action does not run. Returns the action's
/// own result once the status byte is written.
pub async fn serve<S, F, Fut>(stream: &mut S, trigger_timeout: Option<Duration>, action: F) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<()>>,
{
    let mut trigger = [0u8; 1];
    let read = stream.read(&mut trigger);
    let n = match trigger_timeout {
        Some(limit) => match timeout(limit, read).await {
            Ok(res) => res?,
            Err(_) => {
                return Err(Error::Timeout {
                    operation: "waiting for lifecycle trigger".to_string(),
                    duration: limit,
                });
            }
        },
        None => read.await?,
    };
    if n == 0 {
        debug!("lifecycle peer closed before triggering");
        return Err(Error::Io(std::io::Error::new(
            std::io::ErrorKind::UnexpectedEof,
            "lifecycle peer closed before sending the trigger",
        )));
    }

    let outcome = action().await;
    let status = match &outcome {
        Ok(()) => LIFECYCLE_COMPLETE,
        Err(e) => {
            error!("lifecycle action failed: {}", e);
            LIFECYCLE_FAILED
        }
    };

    let reply = async {
        stream.write_all(&[status]).await?;
        stream.flush().await
    };
    match timeout(LIFECYCLE_REPLY_TIMEOUT, reply).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => {
            warn!("could not send lifecycle status: {}", e);
            return outcome.and(Err(Error::Io(e)));
        }
        Err(_) => {
            return outcome.and(Err(Error::Timeout {
                operation: "sending lifecycle status".to_string(),
                duration: LIFECYCLE_REPLY_TIMEOUT,
            }));
        }
    }
    outcome
}
