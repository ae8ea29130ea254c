//! # stagehand
//!
//! **Privilege-Separated Container Launch Preparation**
//!
//! This crate is the decision core that runs between a setuid (or
//! unprivileged) native starter and the stage that actually clones the
//! container process. It reads the launch request and the administrator
//! policy, decides namespaces, capabilities, ID mappings and the image stack,
//! and hands a fixed-layout plan to the next stage through shared memory.
//! It performs no privileged action itself.
//!
//! # Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────┐
//! │                           stagehand                                 │
//! ├─────────────────────────────────────────────────────────────────────┤
//! │  ┌─────────────────────────────────────────────────────────────┐    │
//! │  │                 Engine::prepare(EngineConfig)               │    │
//! │  │   policy → join | fresh → images → caps → fuse → sockets    │    │
//! │  └─────────────────────────────────────────────────────────────┘    │
//! │          │              │              │              │             │
//! │  ┌───────▼──────┐ ┌─────▼──────┐ ┌─────▼──────┐ ┌─────▼──────┐      │
//! │  │ capabilities │ │   idmap    │ │ namespace  │ │   image    │      │
//! │  │ root / user  │ │ fakeroot   │ │ policy     │ │ + session  │      │
//! │  │ authorize    │ │ subuid     │ │ netns join │ │ + autofs   │      │
//! │  └──────────────┘ └────────────┘ └────────────┘ └────────────┘      │
//! │                              │                                      │
//! │  ┌───────────────────────────▼───────────────────────────────┐      │
//! │  │        StarterPlan ──publish──► StarterRegion (mmap)      │      │
//! │  └───────────────────────────────────────────────────────────┘      │
//! ├─────────────────────────────────────────────────────────────────────┤
//! │  lifecycle: post-start / cleanup over a one-byte socket protocol    │
//! └─────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Security Model
//!
//! | Input | Trust | Guard |
//! |-------|-------|-------|
//! | administrator policy | trusted once verified | root ownership when setuid ([`policy::ensure_root_owned`]) |
//! | launch request | untrusted | every feature checked against policy |
//! | instance record | untrusted unless root | procfs integrity proofs ([`instance::verify`]) |
//! | image paths | untrusted | policy applied to the opened descriptor's path |
//!
//! ## Key Properties
//!
//! - **All-or-nothing plans**: preparation fills a local [`StarterPlan`];
//!   [`StarterRegion::publish`] validates every bounded field before copying,
//!   so an error never leaves a half-written region.
//! - **Enforced capabilities**: in the setuid workflow a non-root caller only
//!   receives capabilities granted by the authorization table.
//! - **Race-free joins**: instance namespaces are opened relative to a
//!   descriptor on `/proc/<pid>`, never by absolute path.
//! - **Bounded waits**: lazy FUSE unmounts and lifecycle replies run under
//!   explicit timeouts.
//!
//! # Example
//!
//! ```rust,ignore
//! use stagehand::{Engine, EngineConfig, HostState, PolicySources, StarterRegion};
//!
//! let host = HostState::sample(region.is_suid())?;
//! let engine = Engine::new(PolicySources::default(), host);
//! let prepared = engine.prepare(EngineConfig::load(path)?)?;
//! prepared.publish(&mut region)?;
//! ```

pub mod autofs;
pub mod capabilities;
pub mod constants;
pub mod engine;
pub mod error;
pub mod fuse;
pub mod host;
pub mod identity;
pub mod idmap;
pub mod image;
pub mod instance;
pub mod lifecycle;
pub mod namespace;
pub mod policy;
pub mod session;
pub mod starter;

// Re-exports
pub use capabilities::{CapabilitySet, OciCapabilities};
pub use constants::*;
pub use engine::{Engine, EngineConfig, Prepared};
pub use error::{Error, ErrorCategory, Result};
pub use host::HostState;
pub use identity::{Identity, UserInfo};
pub use idmap::IdMapping;
pub use image::{Image, ImageFormat};
pub use instance::InstanceRecord;
pub use lifecycle::{HostCleanupState, Lifecycle};
pub use namespace::{Namespace, NamespaceSet, NamespaceType};
pub use policy::{AdminPolicy, PolicySources};
pub use session::SessionLayer;
pub use starter::{StageInfo, StarterPlan, StarterRegion};
