//! Image stack loading: root image, session layer, overlays and data binds.

use super::Preparation;
use super::config::ImageEntry;
use crate::error::{Error, Result};
use crate::image::{Image, ImageFormat, ImageResolver, OverlaySpec, PartitionFs, Usage};
use crate::namespace::NamespaceType;
use crate::session::{self, LayerInputs, SessionLayer};
use std::fs::{File, OpenOptions};
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

impl Preparation<'_> {
    /// Opens every image of the stack and records them in the plan.
    pub(super) fn load_images(&mut self) -> Result<()> {
        let policy = self.policy.file.clone();
        let engine = self.engine;
        let resolver = ImageResolver::new(&policy, engine.inspector.as_ref());
        let writable = self.config.writable_image;
        if writable && !self.config.overlay_images.is_empty() {
            return Err(Error::InvalidConfiguration(
                "you could not use --overlay in conjunction with --writable".to_string(),
            ));
        }

        let root = resolver.load(&self.config.image, writable)?;
        if writable && !root.writable {
            return Err(Error::InvalidConfiguration(format!(
                "could not use {} for writing, you don't have write permissions",
                root.path.display()
            )));
        }

        self.select_session_layer(&root)?;
        let overlay_layer = self.config.session_layer == SessionLayer::Overlay;
        check_sif_writable(&root, writable, overlay_layer)?;

        let mut writable_overlay: Option<PathBuf> = None;
        let mut overlays = Vec::new();
        if overlay_layer {
            if matches!(root.format, ImageFormat::Sif | ImageFormat::OciSif)
                && writable
                && root.has_ext3_overlay()
            {
                writable_overlay = Some(root.path.clone());
            }

            for spec in self.config.overlay_images.iter().map(|s| OverlaySpec::parse(s)) {
                let mut image = resolver.load(&spec.path, spec.writable)?;
                image.usage = Usage::Overlay;
                if spec.writable && image.writable {
                    if let Some(existing) = &writable_overlay {
                        return Err(Error::InvalidConfiguration(format!(
                            "you can't specify more than one writable overlay, {} contains a writable overlay, requires to use '--overlay {}:ro'",
                            existing.display(),
                            image.path.display()
                        )));
                    }
                    writable_overlay = Some(image.path.clone());
                }
                overlays.push(image);
            }

            if self.config.writable_tmpfs
                && let Some(path) = &writable_overlay
            {
                return Err(Error::InvalidConfiguration(format!(
                    "you can't specify --writable-tmpfs with another writable overlay image ({})",
                    path.display()
                )));
            }
        }

        let binds = self.load_bind_images(&resolver)?;

        self.plan.image_fd = Some(root.fd());
        if root.format == ImageFormat::Sandbox {
            self.prepare_sandbox(&root)?;
        }

        for image in std::iter::once(root).chain(overlays).chain(binds) {
            self.plan.keep_fd(image.fd())?;
            self.config.image_list.push(ImageEntry {
                path: image.path.clone(),
                source: image.source.clone(),
                format: image.format,
                usage: image.usage,
                writable: image.writable,
                fd: image.fd(),
            });
            self.images.push(image);
        }
        debug!("image stack of {} image(s) loaded", self.images.len());
        Ok(())
    }

    fn select_session_layer(&mut self, root: &Image) -> Result<()> {
        let features = &self.engine.host.features;
        let lower_incompatible = if root.format == ImageFormat::Sandbox {
            match session::check_lower(&root.path) {
                Ok(found) => found.map(|fs| format!("{} is not supported as an overlay lower directory", fs)),
                Err(e) => {
                    debug!("Could not probe {} filesystem: {}", root.path.display(), e);
                    None
                }
            }
        } else {
            None
        };

        let inputs = LayerInputs {
            writable_image: self.config.writable_image,
            overlay_images: !self.config.overlay_images.is_empty(),
            writable_tmpfs: self.config.writable_tmpfs,
            enable_overlay: self.policy.file.enable_overlay,
            enable_underlay: self.policy.file.enable_underlay,
            kernel_overlay: features.has_overlay(),
            user_namespace: features.in_user_namespace
                || self.config.namespaces.has(NamespaceType::User),
            rootless_overlay: features.rootless_overlay,
            sif_ext3_overlay: root.has_ext3_overlay(),
            lower_incompatible,
        };
        let decision = session::select(&inputs)?;
        if decision.disable_writable_tmpfs {
            self.config.writable_tmpfs = false;
        }
        if decision.drop_overlay_images {
            self.config.overlay_images.clear();
        }
        debug!("session layer: {}", decision.layer);
        self.config.session_layer = decision.layer;
        Ok(())
    }

    /// A sandbox root is entered through its own descriptor.
    fn prepare_sandbox(&mut self, root: &Image) -> Result<()> {
        if root.path == Path::new("/") {
            return Err(Error::ConfigurationDisallowed("/ as a sandbox".to_string()));
        }
        if self.config.image_fuse {
            let parent = root.path.parent().unwrap_or(Path::new("/"));
            debug!("Using FUSE mount parent {} as working directory", parent.display());
            let dir = open_dir(parent)?;
            let fd = self.hold(dir)?;
            self.plan.working_directory_fd = Some(fd);
        } else {
            self.plan.working_directory_fd = Some(root.fd());
        }
        Ok(())
    }

    /// Bind entries naming an image are opened as data images.
    fn load_bind_images(&mut self, resolver: &ImageResolver<'_>) -> Result<Vec<Image>> {
        let mut images = Vec::new();
        for bind in self.config.bind_paths.iter_mut().filter(|b| b.is_image()) {
            let mut image = resolver.load(&bind.source, !bind.readonly)?;
            image.usage = Usage::Data;
            if !bind.readonly && !image.writable {
                warn!(
                    "{} is not writable, binding {} read-only",
                    image.path.display(),
                    bind.destination.display()
                );
                bind.readonly = true;
            }
            if let Some(id) = bind.id
                && (id == 0 || id as usize > image.partitions.len())
            {
                return Err(Error::InvalidConfiguration(format!(
                    "partition ID {} not found in {}",
                    id,
                    image.path.display()
                )));
            }
            debug!("Binding data image {} to {}", image.path.display(), bind.destination.display());
            bind.source = image.source.clone();
            images.push(image);
        }
        Ok(images)
    }
}

/// A writable SIF needs an ext3 root filesystem, or an ext3 overlay
/// partition mounted through the overlay session layer.
fn check_sif_writable(root: &Image, writable: bool, overlay_layer: bool) -> Result<()> {
    if !writable || !matches!(root.format, ImageFormat::Sif | ImageFormat::OciSif) {
        return Ok(());
    }
    let ext3_root = root.root_fs_partition()?.fs == PartitionFs::Ext3;
    if !ext3_root && !(overlay_layer && root.has_ext3_overlay()) {
        return Err(Error::InvalidConfiguration(format!(
            "no SIF writable overlay partition found in {}",
            root.path.display()
        )));
    }
    Ok(())
}

fn open_dir(path: &Path) -> Result<File> {
    OpenOptions::new()
        .read(true)
        .custom_flags(libc::O_DIRECTORY)
        .open(path)
        .map_err(|e| Error::path_io(path, e))
}
