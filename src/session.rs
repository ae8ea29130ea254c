//! # Session-Layer Selector
//!
//! Chooses how the root filesystem view is assembled: an overlay mount, an
//! underlay (bind-mount stacking), or no composition layer at all.
//!
//! ## Decision Order
//!
//! ```text
//! 1. --writable + --overlay                  -> error
//! 2. user namespace without rootless overlay -> underlay | none
//! 3. kernel overlay + enable-overlay         -> overlay, unless writable image
//!                                               without an ext3 SIF overlay
//! 4. overlay candidate, incompatible sandbox -> underlay | none
//!                                               (writable-tmpfs and overlay
//!                                               images disabled)
//! 5. otherwise                               -> underlay if enabled and not
//!                                               writable, else none
//! ```
//!
//! The order is load-bearing: it reconciles conflicting requests without the
//! caller knowing about individual filesystems. [`select`] is total over its
//! boolean inputs and never panics.

use crate::error::{Error, Result};
use crate::policy::OverlayMode;
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::{debug, warn};

/// Filesystem composition technique.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionLayer {
    #[default]
    None,
    Overlay,
    Underlay,
}

impl std::fmt::Display for SessionLayer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::None => write!(f, "none"),
            Self::Overlay => write!(f, "overlay"),
            Self::Underlay => write!(f, "underlay"),
        }
    }
}

/// Everything the selector depends on.
#[derive(Debug, Clone, Default)]
pub struct LayerInputs {
    pub writable_image: bool,
    pub overlay_images: bool,
    pub writable_tmpfs: bool,
    pub enable_overlay: OverlayMode,
    pub enable_underlay: bool,
    /// `overlay` is listed in `/proc/filesystems`.
    pub kernel_overlay: bool,
    /// Running in, or requesting, a user namespace.
    pub user_namespace: bool,
    /// Kernel mounts overlay inside a user namespace.
    pub rootless_overlay: bool,
    /// The root image is a SIF with an ext3 overlay partition.
    pub sif_ext3_overlay: bool,
    /// The sandbox cannot be an overlay lower directory; the reason, if so.
    pub lower_incompatible: Option<String>,
}

/// Selected layer plus the request changes the fallback forced.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LayerDecision {
    pub layer: SessionLayer,
    pub disable_writable_tmpfs: bool,
    pub drop_overlay_images: bool,
}

impl LayerDecision {
    fn only(layer: SessionLayer) -> Self {
        Self {
            layer,
            ..Default::default()
        }
    }
}

/// Selects the session layer.
pub fn select(inputs: &LayerInputs) -> Result<LayerDecision> {
    if inputs.writable_image && inputs.overlay_images {
        return Err(Error::InvalidConfiguration(
            "you could not use --overlay in conjunction with --writable".to_string(),
        ));
    }

    let overlay_enabled = inputs.enable_overlay.enabled();
    let rootless = overlay_enabled && inputs.rootless_overlay;

    if inputs.user_namespace && !rootless {
        if !inputs.enable_underlay {
            debug!("Not attempting to use underlay with user namespace: disabled by configuration");
            return Ok(LayerDecision::only(SessionLayer::None));
        }
        if !inputs.writable_image {
            debug!("Using underlay layer: user namespace requested");
            return Ok(finish(inputs, SessionLayer::Underlay));
        }
        debug!("Not attempting to use overlay or underlay: writable flag requested");
        return Ok(LayerDecision::only(SessionLayer::None));
    }

    if inputs.kernel_overlay {
        if overlay_enabled {
            if inputs.writable_image && !inputs.sif_ext3_overlay {
                debug!("Not attempting to use overlay or underlay: writable flag requested");
                return Ok(LayerDecision::only(SessionLayer::None));
            }
            return Ok(match &inputs.lower_incompatible {
                None => {
                    debug!("Attempting to use overlayfs (enable overlay = {})", inputs.enable_overlay);
                    LayerDecision::only(SessionLayer::Overlay)
                }
                Some(reason) => fallback_for_incompatible_lower(inputs, reason),
            });
        }
        if inputs.overlay_images {
            return Err(Error::ConfigurationDisabled {
                feature: "overlay images".to_string(),
                directive: "enable-overlay: no".to_string(),
            });
        }
        if inputs.writable_tmpfs {
            return Err(Error::ConfigurationDisabled {
                feature: "--writable-tmpfs".to_string(),
                directive: "enable-overlay: no".to_string(),
            });
        }
        debug!("Could not use overlay, disabled by configuration");
    } else {
        if inputs.writable_tmpfs {
            return Err(Error::ResourceUnavailable {
                resource: "overlay".to_string(),
                reason: "--writable-tmpfs requires overlay kernel support".to_string(),
            });
        }
        if inputs.overlay_images {
            return Err(Error::ResourceUnavailable {
                resource: "overlay".to_string(),
                reason: "overlay images require overlay kernel support".to_string(),
            });
        }
    }

    if !inputs.writable_image && inputs.enable_underlay {
        debug!("Attempting to use underlay (enable underlay = yes)");
        return Ok(finish(inputs, SessionLayer::Underlay));
    }
    if inputs.writable_image {
        debug!("Not attempting to use overlay or underlay: writable flag requested");
    } else {
        debug!("Not attempting to use overlay or underlay: both disabled by administrator");
    }
    Ok(LayerDecision::only(SessionLayer::None))
}

/// Falls back from an overlay candidate whose lower directory cannot be used.
pub fn fallback_for_incompatible_lower(inputs: &LayerInputs, reason: &str) -> LayerDecision {
    let layer = if inputs.enable_underlay {
        SessionLayer::Underlay
    } else {
        warn!("Could not fallback to underlay, disabled by configuration");
        SessionLayer::None
    };

    let mut decision = LayerDecision::only(layer);
    if inputs.writable_tmpfs || inputs.overlay_images {
        warn!("Fallback to {} layer: {}", layer, reason);
        if inputs.writable_tmpfs {
            warn!("--writable-tmpfs disabled due to sandbox filesystem incompatibility with overlay");
            decision.disable_writable_tmpfs = true;
        }
        if inputs.overlay_images {
            warn!("overlay image(s) not loaded due to sandbox filesystem incompatibility with overlay");
            decision.drop_overlay_images = true;
        }
    } else {
        debug!("Fallback to {} layer: {}", layer, reason);
    }
    decision
}

/// Underlay cannot provide a writable tmpfs.
fn finish(inputs: &LayerInputs, layer: SessionLayer) -> LayerDecision {
    let mut decision = LayerDecision::only(layer);
    if layer == SessionLayer::Underlay && inputs.writable_tmpfs {
        warn!("Disabling --writable-tmpfs as it can't be used in conjunction with underlay");
        decision.disable_writable_tmpfs = true;
    }
    decision
}

// =============================================================================
// Lower Directory Probe
// =============================================================================

/// Filesystems that cannot serve as an overlay lower directory.
const INCOMPATIBLE_LOWER: &[(i64, &str)] = &[
    (0x0BD0_0BD0, "Lustre"),
    (0x4750_4653, "GPFS"),
    (0xAAD7_AAEA, "PanFS"),
    (0xF15F, "ecryptfs"),
];

/// Returns the filesystem name when `path` sits on a filesystem overlay
/// refuses as a lower directory.
pub fn check_lower(path: &Path) -> Result<Option<&'static str>> {
    let stat = nix::sys::statfs::statfs(path).map_err(|e| Error::sys("statfs", e))?;
    // f_type width differs across libc targets.
    #[allow(clippy::unnecessary_cast)]
    let magic = stat.filesystem_type().0 as i64;
    Ok(incompatible_lower_name(magic))
}

/// Looks up a statfs magic number in the incompatibility table.
pub fn incompatible_lower_name(magic: i64) -> Option<&'static str> {
    INCOMPATIBLE_LOWER
        .iter()
        .find(|(m, _)| *m == magic)
        .map(|(_, name)| *name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_writable_with_overlay_fails_first() {
        let inputs = LayerInputs {
            writable_image: true,
            overlay_images: true,
            kernel_overlay: false,
            writable_tmpfs: true,
            ..Default::default()
        };
        let err = select(&inputs).unwrap_err().to_string();
        assert!(err.contains("--overlay"));
        assert!(err.contains("--writable"));
    }

    #[test]
    fn test_overlay_preferred() {
        let inputs = LayerInputs {
            kernel_overlay: true,
            enable_underlay: true,
            ..Default::default()
        };
        assert_eq!(select(&inputs).unwrap().layer, SessionLayer::Overlay);
    }

    #[test]
    fn test_incompatible_lower_drops_tmpfs() {
        let inputs = LayerInputs {
            kernel_overlay: true,
            enable_underlay: true,
            writable_tmpfs: true,
            lower_incompatible: Some("GPFS".into()),
            ..Default::default()
        };
        let d = select(&inputs).unwrap();
        assert_eq!(d.layer, SessionLayer::Underlay);
        assert!(d.disable_writable_tmpfs);
    }

    #[test]
    fn test_incompatible_lower_table() {
        assert_eq!(incompatible_lower_name(0x4750_4653), Some("GPFS"));
        assert_eq!(incompatible_lower_name(0xEF53), None);
    }
}
