//! A throwaway partitioned disk wrapping a bare root filesystem.
//!
//! Some overlays install a bootloader and expect a real disk with the root
//! in partition 1 plus a separate EFI device. For a plain root image with a
//! companion EFI image we build such a disk next to the image: a GPT with a
//! single Linux partition holding a copy of the root filesystem. Changes
//! are copied back into the original image only after everything succeeded.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};

use anyhow::{Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use fn_error_context::context;
use indicatif::{ProgressBar, ProgressStyle};
use rootpatch_blockdev::SinglePartitionLayout;

use crate::error::ApplyError;
use crate::host::ImageTools;

const SECTOR: u64 = 512;
/// The partition starts at 1 MiB, leaving room for the primary GPT.
pub(crate) const PARTITION_START_SECTOR: u64 = 2048;
/// The backup GPT: header plus a 128-entry array.
const BACKUP_GPT_SECTORS: u64 = 33;
const PARTITION_NAME: &str = "rootfs";

/// Placement of the root filesystem inside the container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ContainerLayout {
    pub(crate) total_bytes: u64,
    pub(crate) root_bytes: u64,
    pub(crate) partition: SinglePartitionLayout,
}

impl ContainerLayout {
    /// The container for a root filesystem of `root_bytes` plus `slack`.
    pub(crate) fn new(root_bytes: u64, slack: u64) -> Result<Self> {
        let size_sectors = root_bytes.div_ceil(SECTOR);
        let total_bytes = size_sectors * SECTOR + slack;
        let needed = (PARTITION_START_SECTOR + size_sectors + BACKUP_GPT_SECTORS) * SECTOR;
        if total_bytes < needed {
            return Err(ApplyError::InvalidArguments(format!(
                "container slack of {slack} bytes cannot hold a partition table"
            ))
            .into());
        }
        Ok(Self {
            total_bytes,
            root_bytes,
            partition: SinglePartitionLayout {
                start_sector: PARTITION_START_SECTOR,
                size_sectors,
                name: PARTITION_NAME.into(),
            },
        })
    }

    pub(crate) fn partition_offset(&self) -> u64 {
        self.partition.start_sector * SECTOR
    }
}

fn progress(len: u64, msg: &'static str) -> ProgressBar {
    let pb = ProgressBar::new(len).with_message(msg);
    if let Ok(style) = ProgressStyle::with_template("{msg} [{bar:30}] {bytes}/{total_bytes}") {
        pb.set_style(style);
    }
    pb
}

/// Copy `len` bytes from `src` at `src_off` to `dst` at `dst_off`.
fn copy_range(
    src: &mut File,
    src_off: u64,
    dst: &mut File,
    dst_off: u64,
    len: u64,
    msg: &'static str,
) -> Result<()> {
    src.seek(SeekFrom::Start(src_off))?;
    dst.seek(SeekFrom::Start(dst_off))?;
    let pb = progress(len, msg);
    let mut reader = pb.wrap_read(src.take(len));
    let copied = std::io::copy(&mut reader, dst)?;
    pb.finish_and_clear();
    anyhow::ensure!(copied == len, "Short copy: {copied} of {len} bytes");
    dst.flush()?;
    dst.sync_all()?;
    Ok(())
}

/// The container file; removed on [`Self::discard`] or drop.
#[derive(Debug)]
pub(crate) struct TemporaryContainer {
    path: Utf8PathBuf,
    layout: ContainerLayout,
    removed: bool,
}

impl TemporaryContainer {
    /// Build a container at `path` holding a copy of `root_image`.
    #[context("Creating container {path}")]
    pub(crate) fn create<T: ImageTools>(
        tools: &T,
        root_image: &Utf8Path,
        path: &Utf8Path,
        slack: u64,
    ) -> Result<Self> {
        let mut src = File::open(root_image).with_context(|| format!("Opening {root_image}"))?;
        let layout = ContainerLayout::new(src.metadata()?.len(), slack)?;
        let mut dst = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(path)?;
        // From here on the file is ours to clean up
        let container = Self {
            path: path.to_owned(),
            layout,
            removed: false,
        };
        dst.set_len(container.layout.total_bytes)?;
        tools.write_partition_table(&container.path, &container.layout.partition)?;
        copy_range(
            &mut src,
            0,
            &mut dst,
            container.layout.partition_offset(),
            container.layout.root_bytes,
            "Copying root filesystem into container",
        )?;
        tracing::debug!(
            "Created {} ({} bytes, root at sector {})",
            container.path,
            container.layout.total_bytes,
            PARTITION_START_SECTOR
        );
        Ok(container)
    }

    pub(crate) fn path(&self) -> &Utf8Path {
        &self.path
    }

    /// Write the (possibly modified) root filesystem back over `root_image`.
    #[context("Copying container contents back to {root_image}")]
    pub(crate) fn copy_back(&self, root_image: &Utf8Path) -> Result<()> {
        let mut src = File::open(&self.path)?;
        let mut dst = OpenOptions::new().write(true).open(root_image)?;
        copy_range(
            &mut src,
            self.layout.partition_offset(),
            &mut dst,
            0,
            self.layout.root_bytes,
            "Copying root filesystem back",
        )
    }

    fn remove(&mut self) -> Result<()> {
        if self.removed {
            return Ok(());
        }
        self.removed = true;
        std::fs::remove_file(&self.path).with_context(|| format!("Removing {}", self.path))
    }

    /// Delete the container.
    pub(crate) fn discard(mut self) -> Result<()> {
        self.remove()
    }
}

impl Drop for TemporaryContainer {
    fn drop(&mut self) {
        if let Err(e) = self.remove() {
            tracing::warn!("{e:#}");
        }
    }
}
