//! Which mount path an apply takes, decided once up front.

use crate::format::{ImageFormat, ImageHandle};

/// How the root gets mounted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum MountFlow {
    /// Attach the filesystem image directly and mount it.
    Plain,
    /// Wrap the filesystem in a temporary partitioned container and attach
    /// the companion EFI image alongside it.
    PlainWithEfi,
    /// Attach with partition scanning and locate root and EFI partitions.
    Disk,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Flow {
    /// Decode into a raw intermediate first, re-encode after success.
    pub(crate) sparse: bool,
    pub(crate) mount: MountFlow,
    /// A companion EFI image was given but has no use in this flow.
    pub(crate) ignores_efi_image: bool,
    /// Sector size to attach a disk image with, when not the default.
    pub(crate) disk_sector_size: Option<u32>,
}

impl Flow {
    /// The flow for an image of `format`. A sparse image always wraps a
    /// bare filesystem.
    pub(crate) fn select(format: ImageFormat, efi_image: bool) -> Self {
        let mount = match (format, efi_image) {
            (ImageFormat::Disk, _) => MountFlow::Disk,
            (ImageFormat::Plain | ImageFormat::Sparse, true) => MountFlow::PlainWithEfi,
            (ImageFormat::Plain | ImageFormat::Sparse, false) => MountFlow::Plain,
        };
        Self {
            sparse: format == ImageFormat::Sparse,
            mount,
            ignores_efi_image: efi_image && mount == MountFlow::Disk,
            disk_sector_size: None,
        }
    }

    /// The flow for a detected image.
    pub(crate) fn for_image(image: &ImageHandle, efi_image: bool) -> Self {
        let flow = Self::select(image.format, efi_image);
        Self {
            disk_sector_size: image.sector_size.filter(|_| flow.mount == MountFlow::Disk),
            ..flow
        }
    }
}

/// Interactive stops around the overlay step.
#[derive(clap::ValueEnum, Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum DebugMode {
    /// Apply without stopping.
    #[default]
    Off,
    /// Open a shell on the host in the mounted root before applying.
    #[value(alias = "pre-apply")]
    Pre,
    /// Apply, then open a shell chrooted into the mounted root.
    #[value(alias = "post-apply")]
    Post,
}
