//! The operating-system seam.
//!
//! Everything that touches loop devices, mounts, partition nodes or
//! external tools goes through these traits, so the lifecycle logic can be
//! exercised against a recording fake. [`LinuxHost`] is the real thing.

use std::io::Write;
use std::time::Duration;

use anyhow::{Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use rootpatch_blockdev::{LoopOptions, LoopbackDevice, Probe, SinglePartitionLayout};
use rootpatch_mount::Unmount;
use rootpatch_utils::{is_busy_error, CommandRunExt, Retry};

use crate::config::Config;
use crate::overlay::{command_from_argv, DebugShell, OverlayInvocation};
use crate::sparse;
use crate::task::Task;

/// An attached loop device.
pub(crate) trait LoopDevice: std::fmt::Debug {
    fn path(&self) -> &Utf8Path;
    /// Partition nodes were created through device-mapper and must be
    /// removed before detaching.
    fn set_partitions_mapped(&mut self);
    fn close(self) -> Result<()>;
}

/// How an image is attached.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct AttachOptions {
    /// Ask the kernel to expose the image's partitions.
    pub(crate) partscan: bool,
    /// Logical sector size; the kernel default of 512 if unset.
    pub(crate) sector_size: Option<u32>,
}

impl AttachOptions {
    /// A bare filesystem.
    pub(crate) const PLAIN: Self = Self {
        partscan: false,
        sector_size: None,
    };

    /// A partitioned disk whose table was written for `sector_size`.
    pub(crate) fn partitioned(sector_size: Option<u32>) -> Self {
        Self {
            partscan: true,
            sector_size,
        }
    }
}

pub(crate) trait LoopOps {
    type Device: LoopDevice;
    /// Attach `image` to a free loop device.
    fn attach(&self, image: &Utf8Path, opts: AttachOptions) -> Result<Self::Device>;
}

pub(crate) trait MountOps {
    fn mount(&self, source: &Utf8Path, target: &Utf8Path, fstype: &str) -> Result<()>;
    fn bind_mount(&self, source: &Utf8Path, target: &Utf8Path) -> Result<()>;
    fn unmount(&self, target: &Utf8Path) -> Result<Unmount>;
    /// Mount points at or under `dir`, deepest first.
    fn mounts_under(&self, dir: &Utf8Path) -> Result<Vec<Utf8PathBuf>>;
}

pub(crate) trait PartitionProbe {
    /// Wait for pending device events.
    fn settle(&self) -> Result<()>;
    fn node_exists(&self, path: &Utf8Path) -> bool;
    fn probe(&self, path: &Utf8Path) -> Result<Probe>;
    /// Partition nodes the kernel exposes for `device`.
    fn kernel_partitions(&self, device: &Utf8Path) -> Result<Vec<Utf8PathBuf>>;
    /// Create device-mapper nodes for the partitions of `device`.
    fn map_partitions(&self, device: &Utf8Path) -> Result<Vec<Utf8PathBuf>>;
}

pub(crate) trait ImageTools {
    fn sparse_to_raw(&self, sparse: &Utf8Path, raw: &Utf8Path) -> Result<()>;
    fn raw_to_sparse(&self, raw: &Utf8Path, sparse: &Utf8Path) -> Result<()>;
    /// Forced, non-interactive check; returns the checker's exit code.
    fn check_filesystem(&self, raw: &Utf8Path) -> Result<i32>;
    /// Smallest size in bytes the filesystem can be shrunk to.
    fn minimum_size(&self, raw: &Utf8Path) -> Result<u64>;
    fn resize_filesystem(&self, raw: &Utf8Path, bytes: u64) -> Result<()>;
    fn write_partition_table(&self, path: &Utf8Path, layout: &SinglePartitionLayout) -> Result<()>;
}

pub(crate) trait OverlayOps {
    fn apply_overlay(&self, invocation: &OverlayInvocation) -> Result<()>;
    /// Blocks until the operator leaves the shell.
    fn interactive_shell(&self, shell: &DebugShell) -> Result<()>;
}

/// Everything an apply needs from the system.
pub(crate) trait Host: LoopOps + MountOps + PartitionProbe + ImageTools + OverlayOps {}

impl<T> Host for T where T: LoopOps + MountOps + PartitionProbe + ImageTools + OverlayOps {}

impl LoopDevice for LoopbackDevice {
    fn path(&self) -> &Utf8Path {
        LoopbackDevice::path(self)
    }

    fn set_partitions_mapped(&mut self) {
        LoopbackDevice::set_partitions_mapped(self)
    }

    fn close(self) -> Result<()> {
        LoopbackDevice::close(self)
    }
}

/// The running system.
#[derive(Debug)]
pub(crate) struct LinuxHost {
    retry: Retry,
    settle_timeout: Duration,
    collaborator: Vec<String>,
    shell: String,
}

impl LinuxHost {
    pub(crate) fn new(config: &Config) -> Self {
        Self {
            retry: config.retry(),
            settle_timeout: config.settle_timeout(),
            collaborator: config.collaborator.clone(),
            shell: config.shell.clone(),
        }
    }
}

impl LoopOps for LinuxHost {
    type Device = LoopbackDevice;

    fn attach(&self, image: &Utf8Path, opts: AttachOptions) -> Result<LoopbackDevice> {
        let opts = LoopOptions {
            partscan: opts.partscan,
            sector_size: opts.sector_size,
            retry: self.retry,
        };
        LoopbackDevice::new(image.as_std_path(), &opts)
    }
}

impl MountOps for LinuxHost {
    fn mount(&self, source: &Utf8Path, target: &Utf8Path, fstype: &str) -> Result<()> {
        rootpatch_mount::mount(source, target, fstype)
    }

    fn bind_mount(&self, source: &Utf8Path, target: &Utf8Path) -> Result<()> {
        rootpatch_mount::bind_mount(source, target)
    }

    fn unmount(&self, target: &Utf8Path) -> Result<Unmount> {
        match rootpatch_mount::unmount(target, false) {
            Err(e) if is_busy_error(&e) => {
                tracing::warn!("{target} is busy; detaching lazily");
                rootpatch_mount::unmount(target, true)
            }
            r => r,
        }
    }

    fn mounts_under(&self, dir: &Utf8Path) -> Result<Vec<Utf8PathBuf>> {
        rootpatch_mount::mounts_under(dir)
    }
}

impl PartitionProbe for LinuxHost {
    fn settle(&self) -> Result<()> {
        rootpatch_blockdev::udev_settle(self.settle_timeout)
    }

    fn node_exists(&self, path: &Utf8Path) -> bool {
        path.exists()
    }

    fn probe(&self, path: &Utf8Path) -> Result<Probe> {
        rootpatch_blockdev::probe(path)
    }

    fn kernel_partitions(&self, device: &Utf8Path) -> Result<Vec<Utf8PathBuf>> {
        let dev = rootpatch_blockdev::list_dev(device)?;
        Ok(dev.children().iter().map(|c| c.path().into()).collect())
    }

    fn map_partitions(&self, device: &Utf8Path) -> Result<Vec<Utf8PathBuf>> {
        rootpatch_blockdev::map_partitions(device)
    }
}

impl ImageTools for LinuxHost {
    fn sparse_to_raw(&self, sparse: &Utf8Path, raw: &Utf8Path) -> Result<()> {
        Task::new(format!("Decoding sparse image {sparse}"), "simg2img")
            .args([sparse, raw])
            .run()
    }

    fn raw_to_sparse(&self, raw: &Utf8Path, sparse: &Utf8Path) -> Result<()> {
        Task::new(format!("Encoding sparse image {sparse}"), "img2simg")
            .args([raw, sparse])
            .run()
    }

    fn check_filesystem(&self, raw: &Utf8Path) -> Result<i32> {
        let st = Task::new(format!("Checking filesystem in {raw}"), "e2fsck")
            .args(["-f", "-y"])
            .arg(raw)
            .status()?;
        st.code()
            .ok_or_else(|| anyhow::anyhow!("e2fsck terminated by signal: {st:?}"))
    }

    fn minimum_size(&self, raw: &Utf8Path) -> Result<u64> {
        let blocks = Task::new("Estimating minimum filesystem size", "resize2fs")
            .quiet()
            .arg("-P")
            .arg(raw)
            .read()?;
        let blocks = sparse::parse_minimum_blocks(&blocks)?;
        let header = Task::new("Reading filesystem block size", "dumpe2fs")
            .quiet()
            .arg("-h")
            .arg(raw)
            .read()?;
        let block_size = sparse::parse_block_size(&header)?;
        Ok(blocks * block_size)
    }

    fn resize_filesystem(&self, raw: &Utf8Path, bytes: u64) -> Result<()> {
        let size = format!("{}K", bytes / 1024);
        Task::new_and_run(
            format!("Resizing filesystem in {raw}"),
            "resize2fs",
            [raw.as_str(), size.as_str()],
        )
    }

    fn write_partition_table(&self, path: &Utf8Path, layout: &SinglePartitionLayout) -> Result<()> {
        rootpatch_blockdev::write_partition_table(path, layout)
    }
}

impl OverlayOps for LinuxHost {
    fn apply_overlay(&self, invocation: &OverlayInvocation) -> Result<()> {
        let mut cmd = command_from_argv(&self.collaborator);
        cmd.args(invocation.args());
        tracing::info!("Applying overlay: {}", cmd.to_string_pretty());
        cmd.run_inherited()
    }

    fn interactive_shell(&self, shell: &DebugShell) -> Result<()> {
        let mut cmd = shell.command(&self.shell);
        {
            let mut out = std::io::stdout().lock();
            writeln!(
                out,
                "Entering debug shell for {}; exit the shell to continue.",
                shell.mount_point()
            )?;
            out.flush()?;
        }
        cmd.log_debug();
        let st = cmd
            .status()
            .with_context(|| format!("Spawning {}", cmd.to_string_pretty()))?;
        if !st.success() {
            tracing::info!("Debug shell exited with {st:?}; continuing");
        }
        Ok(())
    }
}
