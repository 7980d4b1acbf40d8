//! The mounted view of an image: root filesystem, host pseudo-filesystems
//! bound inside it, an optional EFI partition, and the bootloader device map.
//!
//! Every acquisition is pushed onto a stack; [`MountSession::release`]
//! pops and releases it in reverse, tolerating individual failures, then
//! sweeps anything still mounted below the mount point.

use anyhow::{Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use rootpatch_mount::Unmount;

use crate::error::{ApplyError, TeardownWarning};
use crate::host::MountOps;
use crate::partitions::ROOT_FSTYPE;

/// Host pseudo-filesystems bound into the root, relative to `/`, in
/// acquisition order; `dev/pts` must follow `dev`.
pub(crate) const PSEUDO_FILESYSTEMS: &[&str] = &["dev", "proc", "sys", "run", "dev/pts"];

const EFI_MOUNT: &str = "boot/efi";
const EFI_FSTYPE: &str = "vfat";
const GRUB_DIR: &str = "boot/grub";
const DEVICE_MAP: &str = "device.map";

#[derive(Debug, Clone, PartialEq, Eq)]
enum Acquired {
    Root(Utf8PathBuf),
    Bind(Utf8PathBuf),
    Efi(Utf8PathBuf),
    DeviceMap(Utf8PathBuf),
}

impl Acquired {
    fn path(&self) -> &Utf8Path {
        match self {
            Acquired::Root(p) | Acquired::Bind(p) | Acquired::Efi(p) | Acquired::DeviceMap(p) => p,
        }
    }
}

/// Lifecycle of a [`MountSession`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SessionState {
    Empty,
    RootMounted,
    PseudoFsBound,
    EfiMounted,
    Active,
    Unwinding,
}

/// Render a GRUB device map; `disks` are in BIOS order.
pub(crate) fn device_map(disks: &[Utf8PathBuf]) -> String {
    disks
        .iter()
        .enumerate()
        .map(|(i, d)| format!("(hd{i})\t{d}\n"))
        .collect()
}

#[derive(Debug)]
pub(crate) struct MountSession<'h, M: MountOps> {
    host: &'h M,
    mountpoint: Utf8PathBuf,
    stack: Vec<Acquired>,
    state: SessionState,
}

impl<'h, M: MountOps> MountSession<'h, M> {
    pub(crate) fn new(host: &'h M, mountpoint: &Utf8Path) -> Self {
        Self {
            host,
            mountpoint: mountpoint.to_owned(),
            stack: Vec::new(),
            state: SessionState::Empty,
        }
    }

    /// Mount the root filesystem from `device` at the mount point.
    pub(crate) fn acquire_root(&mut self, device: &Utf8Path) -> Result<()> {
        anyhow::ensure!(
            self.state == SessionState::Empty,
            "Root already mounted at {}",
            self.mountpoint
        );
        self.host
            .mount(device, &self.mountpoint, ROOT_FSTYPE)
            .map_err(|e| ApplyError::mount(format!("root filesystem {device}"), e))?;
        tracing::debug!("Mounted {device} at {}", self.mountpoint);
        self.stack.push(Acquired::Root(self.mountpoint.clone()));
        self.state = SessionState::RootMounted;
        Ok(())
    }

    /// Bind the host's pseudo-filesystems into the root.
    pub(crate) fn bind_pseudo_filesystems(&mut self) -> Result<()> {
        anyhow::ensure!(
            self.state == SessionState::RootMounted,
            "No root filesystem mounted at {}",
            self.mountpoint
        );
        for rel in PSEUDO_FILESYSTEMS {
            let source = Utf8Path::new("/").join(rel);
            let target = self.mountpoint.join(rel);
            std::fs::create_dir_all(&target)
                .with_context(|| format!("Creating {target}"))
                .and_then(|()| self.host.bind_mount(&source, &target))
                .map_err(|e| ApplyError::mount(format!("{source} at {target}"), e))?;
            self.stack.push(Acquired::Bind(target));
        }
        self.state = SessionState::PseudoFsBound;
        Ok(())
    }

    /// Mount an EFI partition at `boot/efi`. Failure is logged and the
    /// session goes on without it.
    pub(crate) fn mount_efi(&mut self, device: &Utf8Path) -> bool {
        let target = self.mountpoint.join(EFI_MOUNT);
        let r = std::fs::create_dir_all(&target)
            .with_context(|| format!("Creating {target}"))
            .and_then(|()| self.host.mount(device, &target, EFI_FSTYPE));
        match r {
            Ok(()) => {
                tracing::debug!("Mounted EFI partition {device} at {target}");
                self.stack.push(Acquired::Efi(target));
                self.state = SessionState::EfiMounted;
                true
            }
            Err(e) => {
                tracing::info!("Continuing without EFI partition: {e:#}");
                false
            }
        }
    }

    /// Write `boot/grub/device.map` naming `disks`, if the root has a
    /// GRUB directory. Best effort.
    pub(crate) fn write_device_map(&mut self, disks: &[Utf8PathBuf]) {
        let grub = self.mountpoint.join(GRUB_DIR);
        if !grub.is_dir() {
            tracing::debug!("No {GRUB_DIR} in image; not writing a device map");
            return;
        }
        let path = grub.join(DEVICE_MAP);
        if path.exists() {
            tracing::debug!("{path} exists; leaving it alone");
            return;
        }
        match std::fs::write(&path, device_map(disks)) {
            Ok(()) => self.stack.push(Acquired::DeviceMap(path)),
            Err(e) => tracing::warn!("Writing {path}: {e}"),
        }
    }

    /// Everything is in place for the overlay to run.
    pub(crate) fn activate(&mut self) {
        self.state = SessionState::Active;
    }

    fn release_one(&self, entry: &Acquired) -> Result<()> {
        match entry {
            Acquired::DeviceMap(p) => match std::fs::remove_file(p) {
                Ok(()) => Ok(()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
                Err(e) => Err(e).with_context(|| format!("Removing {p}")),
            },
            Acquired::Root(p) | Acquired::Bind(p) | Acquired::Efi(p) => {
                if self.host.unmount(p)? == Unmount::NotMounted {
                    tracing::debug!("{p} was already unmounted");
                }
                Ok(())
            }
        }
    }

    /// Release everything in reverse order of acquisition. Failures do not
    /// stop the unwind; they are logged and returned. Calling this again
    /// is harmless.
    pub(crate) fn release(&mut self) -> Vec<TeardownWarning> {
        let mut warnings = Vec::new();
        self.state = SessionState::Unwinding;
        while let Some(entry) = self.stack.pop() {
            if let Err(error) = self.release_one(&entry) {
                warnings.push(TeardownWarning {
                    resource: entry.path().to_string(),
                    error,
                });
            }
        }
        // Anything still below us: a failed unmount above, or something
        // mounted behind our back.
        match self.host.mounts_under(&self.mountpoint) {
            Ok(stale) => {
                for p in stale {
                    tracing::warn!("Unmounting leftover {p}");
                    if let Err(error) = self.host.unmount(&p) {
                        warnings.push(TeardownWarning {
                            resource: p.to_string(),
                            error,
                        });
                    }
                }
            }
            Err(error) => warnings.push(TeardownWarning {
                resource: format!("mounts under {}", self.mountpoint),
                error,
            }),
        }
        for w in &warnings {
            tracing::warn!("{w}");
        }
        self.state = SessionState::Empty;
        warnings
    }
}

impl<M: MountOps> Drop for MountSession<'_, M> {
    fn drop(&mut self) {
        if !self.stack.is_empty() {
            let _ = self.release();
        }
    }
}
