//! Tests for session module.
//!
//! Exercises the layer selector over every combination of its boolean
//! inputs, plus the individual configuration errors.

use stagehand::Error;
use stagehand::policy::OverlayMode;
use stagehand::session::{LayerInputs, SessionLayer, select};

/// Every combination of the selector inputs.
fn all_inputs() -> Vec<LayerInputs> {
    let mut out = Vec::new();
    for bits in 0u32..(1 << 9) {
        let b = |n: u32| bits & (1 << n) != 0;
        for mode in [OverlayMode::Yes, OverlayMode::Try, OverlayMode::No] {
            out.push(LayerInputs {
                writable_image: b(0),
                overlay_images: b(1),
                writable_tmpfs: b(2),
                enable_overlay: mode,
                enable_underlay: b(3),
                kernel_overlay: b(4),
                user_namespace: b(5),
                rootless_overlay: b(6),
                sif_ext3_overlay: b(7),
                lower_incompatible: b(8).then(|| "GPFS".to_string()),
            });
        }
    }
    out
}

// =============================================================================
// Totality Tests
// =============================================================================

#[test]
fn test_select_is_total() {
    for inputs in all_inputs() {
        let _ = select(&inputs);
    }
}

#[test]
fn test_writable_and_overlay_always_conflict() {
    for inputs in all_inputs()
        .into_iter()
        .filter(|i| i.writable_image && i.overlay_images)
    {
        let err = select(&inputs).unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("--overlay") && msg.contains("--writable"), "{:?}", inputs);
    }
}

#[test]
fn test_overlay_needs_kernel_and_policy() {
    for inputs in all_inputs() {
        if let Ok(decision) = select(&inputs)
            && decision.layer == SessionLayer::Overlay
        {
            assert!(inputs.kernel_overlay, "{:?}", inputs);
            assert!(inputs.enable_overlay.enabled(), "{:?}", inputs);
        }
    }
}

#[test]
fn test_underlay_needs_policy_and_drops_tmpfs() {
    for inputs in all_inputs() {
        if let Ok(decision) = select(&inputs)
            && decision.layer == SessionLayer::Underlay
        {
            assert!(inputs.enable_underlay, "{:?}", inputs);
            if inputs.writable_tmpfs {
                assert!(decision.disable_writable_tmpfs, "{:?}", inputs);
            }
        }
    }
}

// =============================================================================
// Scenario Tests
// =============================================================================

#[test]
fn test_overlay_disabled_rejects_overlay_images() {
    let inputs = LayerInputs {
        overlay_images: true,
        enable_overlay: OverlayMode::No,
        kernel_overlay: true,
        ..Default::default()
    };
    let err = select(&inputs).unwrap_err();
    assert!(matches!(err, Error::ConfigurationDisabled { .. }));
}

#[test]
fn test_missing_kernel_overlay_rejects_writable_tmpfs() {
    let inputs = LayerInputs {
        writable_tmpfs: true,
        kernel_overlay: false,
        enable_underlay: true,
        ..Default::default()
    };
    let err = select(&inputs).unwrap_err();
    assert!(matches!(err, Error::ResourceUnavailable { .. }));
}

#[test]
fn test_user_namespace_without_rootless_overlay_uses_underlay() {
    let inputs = LayerInputs {
        kernel_overlay: true,
        enable_underlay: true,
        user_namespace: true,
        rootless_overlay: false,
        writable_tmpfs: true,
        ..Default::default()
    };
    let decision = select(&inputs).unwrap();
    assert_eq!(decision.layer, SessionLayer::Underlay);
    assert!(decision.disable_writable_tmpfs);
}

#[test]
fn test_rootless_overlay_in_user_namespace() {
    let inputs = LayerInputs {
        kernel_overlay: true,
        user_namespace: true,
        rootless_overlay: true,
        ..Default::default()
    };
    assert_eq!(select(&inputs).unwrap().layer, SessionLayer::Overlay);
}

#[test]
fn test_writable_sif_with_ext3_overlay_keeps_overlay() {
    let inputs = LayerInputs {
        writable_image: true,
        kernel_overlay: true,
        sif_ext3_overlay: true,
        ..Default::default()
    };
    assert_eq!(select(&inputs).unwrap().layer, SessionLayer::Overlay);
}

#[test]
fn test_writable_image_gets_no_layer() {
    let inputs = LayerInputs {
        writable_image: true,
        kernel_overlay: true,
        enable_underlay: true,
        ..Default::default()
    };
    assert_eq!(select(&inputs).unwrap().layer, SessionLayer::None);
}

#[test]
fn test_incompatible_lower_without_underlay_drops_overlay_images() {
    let inputs = LayerInputs {
        overlay_images: true,
        kernel_overlay: true,
        enable_underlay: false,
        lower_incompatible: Some("Lustre".to_string()),
        ..Default::default()
    };
    let decision = select(&inputs).unwrap();
    assert_eq!(decision.layer, SessionLayer::None);
    assert!(decision.drop_overlay_images);
}
