//! A recording stand-in for [`crate::host::Host`].

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use anyhow::{anyhow, Result};
use camino::{Utf8Path, Utf8PathBuf};
use rootpatch_blockdev::{kernel_partition_path, mapper_partition_path, Probe, SinglePartitionLayout};
use rootpatch_mount::Unmount;

use crate::format::fixtures;
use crate::host::{
    AttachOptions, ImageTools, LoopDevice, LoopOps, MountOps, OverlayOps, PartitionProbe,
};
use crate::overlay::{DebugShell, OverlayInvocation};

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Op {
    /// Image, partition scan, sector size
    Attach(Utf8PathBuf, bool, Option<u32>),
    Unmap(Utf8PathBuf),
    Detach(Utf8PathBuf),
    MapPartitions(Utf8PathBuf),
    Mount(Utf8PathBuf, Utf8PathBuf, String),
    Bind(Utf8PathBuf),
    Unmount(Utf8PathBuf),
    Decode(Utf8PathBuf),
    Check(Utf8PathBuf),
    MinimumSize(Utf8PathBuf),
    Resize(Utf8PathBuf, u64),
    Encode(Utf8PathBuf, Utf8PathBuf),
    PartitionTable(Utf8PathBuf, SinglePartitionLayout),
    Overlay(OverlayInvocation),
    Shell(DebugShell),
}

pub(crate) type Ops = Rc<RefCell<Vec<Op>>>;

#[derive(Debug)]
pub(crate) struct FakeLoop {
    pub(crate) path: Utf8PathBuf,
    pub(crate) mapped: bool,
    fail_detach: bool,
    ops: Ops,
}

impl LoopDevice for FakeLoop {
    fn path(&self) -> &Utf8Path {
        &self.path
    }

    fn set_partitions_mapped(&mut self) {
        self.mapped = true;
    }

    fn close(self) -> Result<()> {
        let mut ops = self.ops.borrow_mut();
        if self.mapped {
            ops.push(Op::Unmap(self.path.clone()));
        }
        ops.push(Op::Detach(self.path.clone()));
        if self.fail_detach {
            return Err(anyhow!("{}: Device or resource busy", self.path));
        }
        Ok(())
    }
}

/// Every knob defaults to the happy path.
pub(crate) struct FakeHost {
    pub(crate) ops: Ops,
    pub(crate) next_loop: Cell<u32>,
    pub(crate) disks: RefCell<Vec<Utf8PathBuf>>,
    pub(crate) mapped: RefCell<Vec<Utf8PathBuf>>,
    pub(crate) mounted: RefCell<Vec<Utf8PathBuf>>,
    /// Written by the fake sparse decoder.
    pub(crate) decode_output: Vec<u8>,
    pub(crate) fsck_code: i32,
    pub(crate) minimum_size: u64,
    pub(crate) fail_resize: bool,
    pub(crate) fail_encode: bool,
    /// Whether partition nodes show up without device-mapper.
    pub(crate) kernel_nodes: bool,
    /// Partitions of every partition-scanned image, by number.
    pub(crate) partitions: Vec<(u32, Probe)>,
    pub(crate) fail_kpartx: bool,
    /// Mount targets (last component) that refuse to mount.
    pub(crate) fail_mount: Vec<&'static str>,
    /// Bind targets (last component) that refuse to mount.
    pub(crate) fail_bind: Vec<&'static str>,
    /// Unmounts of this target fail, once.
    pub(crate) fail_unmount_once: RefCell<Option<Utf8PathBuf>>,
    pub(crate) fail_detach: bool,
    pub(crate) fail_collaborator: bool,
    /// Runs inside the fake collaborator.
    pub(crate) on_overlay: Option<Box<dyn Fn(&OverlayInvocation)>>,
    /// Runs while the fake debug shell is open.
    pub(crate) on_shell: Option<Box<dyn Fn(&DebugShell)>>,
}

impl Default for FakeHost {
    fn default() -> Self {
        Self {
            ops: Default::default(),
            next_loop: Cell::new(0),
            disks: Default::default(),
            mapped: Default::default(),
            mounted: Default::default(),
            decode_output: fixtures::ext4(8192),
            fsck_code: 0,
            minimum_size: 4 * 1024 * 1024,
            fail_resize: false,
            fail_encode: false,
            kernel_nodes: true,
            partitions: Vec::new(),
            fail_kpartx: false,
            fail_mount: Vec::new(),
            fail_bind: Vec::new(),
            fail_unmount_once: RefCell::new(None),
            fail_detach: false,
            fail_collaborator: false,
            on_overlay: None,
            on_shell: None,
        }
    }
}

impl FakeHost {
    fn record(&self, op: Op) {
        self.ops.borrow_mut().push(op);
    }

    /// Everything recorded so far, clearing the record.
    pub(crate) fn take_ops(&self) -> Vec<Op> {
        std::mem::take(&mut *self.ops.borrow_mut())
    }

    /// Currently mounted targets, in mount order.
    pub(crate) fn mounted(&self) -> Vec<Utf8PathBuf> {
        self.mounted.borrow().clone()
    }

    fn partition_of(&self, node: &Utf8Path) -> Option<&Probe> {
        let disks = self.disks.borrow();
        let mapped = self.mapped.borrow();
        self.partitions.iter().find_map(|(n, probe)| {
            disks
                .iter()
                .any(|d| {
                    (self.kernel_nodes && kernel_partition_path(d, *n).as_path() == node)
                        || (mapped.iter().any(|m| m.as_path() == node)
                            && mapper_partition_path(d, *n).as_path() == node)
                })
                .then_some(probe)
        })
    }

    fn refuses(list: &[&str], target: &Utf8Path) -> bool {
        list.iter().any(|l| target.file_name() == Some(*l))
    }
}

impl LoopOps for FakeHost {
    type Device = FakeLoop;

    fn attach(&self, image: &Utf8Path, opts: AttachOptions) -> Result<FakeLoop> {
        let AttachOptions {
            partscan,
            sector_size,
        } = opts;
        self.record(Op::Attach(image.to_owned(), partscan, sector_size));
        let n = self.next_loop.get();
        self.next_loop.set(n + 1);
        let path = Utf8PathBuf::from(format!("/dev/loop{n}"));
        if partscan {
            self.disks.borrow_mut().push(path.clone());
        }
        Ok(FakeLoop {
            path,
            mapped: false,
            fail_detach: self.fail_detach,
            ops: self.ops.clone(),
        })
    }
}

impl MountOps for FakeHost {
    fn mount(&self, source: &Utf8Path, target: &Utf8Path, fstype: &str) -> Result<()> {
        self.record(Op::Mount(source.to_owned(), target.to_owned(), fstype.to_owned()));
        if Self::refuses(&self.fail_mount, target) {
            return Err(anyhow!("mount {source} on {target}: Invalid argument"));
        }
        self.mounted.borrow_mut().push(target.to_owned());
        Ok(())
    }

    fn bind_mount(&self, _source: &Utf8Path, target: &Utf8Path) -> Result<()> {
        self.record(Op::Bind(target.to_owned()));
        if Self::refuses(&self.fail_bind, target) {
            return Err(anyhow!("bind mount on {target}: Permission denied"));
        }
        self.mounted.borrow_mut().push(target.to_owned());
        Ok(())
    }

    fn unmount(&self, target: &Utf8Path) -> Result<Unmount> {
        self.record(Op::Unmount(target.to_owned()));
        let mut fail = self.fail_unmount_once.borrow_mut();
        if fail.as_deref() == Some(target) {
            *fail = None;
            return Err(anyhow!("umount {target}: Device or resource busy"));
        }
        let mut mounted = self.mounted.borrow_mut();
        match mounted.iter().rposition(|m| m == target) {
            Some(i) => {
                mounted.remove(i);
                Ok(Unmount::Unmounted)
            }
            None => Ok(Unmount::NotMounted),
        }
    }

    fn mounts_under(&self, dir: &Utf8Path) -> Result<Vec<Utf8PathBuf>> {
        let mut r: Vec<_> = self
            .mounted
            .borrow()
            .iter()
            .filter(|m| m.starts_with(dir))
            .cloned()
            .collect();
        r.reverse();
        r.sort_by_key(|p| std::cmp::Reverse(p.components().count()));
        Ok(r)
    }
}

impl PartitionProbe for FakeHost {
    fn settle(&self) -> Result<()> {
        Ok(())
    }

    fn node_exists(&self, path: &Utf8Path) -> bool {
        self.partition_of(path).is_some()
    }

    fn probe(&self, path: &Utf8Path) -> Result<Probe> {
        Ok(self.partition_of(path).cloned().unwrap_or_default())
    }

    fn kernel_partitions(&self, device: &Utf8Path) -> Result<Vec<Utf8PathBuf>> {
        if !self.kernel_nodes {
            return Ok(Vec::new());
        }
        Ok(self
            .partitions
            .iter()
            .map(|(n, _)| kernel_partition_path(device, *n))
            .collect())
    }

    fn map_partitions(&self, device: &Utf8Path) -> Result<Vec<Utf8PathBuf>> {
        self.record(Op::MapPartitions(device.to_owned()));
        if self.fail_kpartx {
            return Err(anyhow!("kpartx: {device}: failed to stat()"));
        }
        let nodes: Vec<_> = self
            .partitions
            .iter()
            .map(|(n, _)| mapper_partition_path(device, *n))
            .collect();
        self.mapped.borrow_mut().extend(nodes.iter().cloned());
        Ok(nodes)
    }
}

impl ImageTools for FakeHost {
    fn sparse_to_raw(&self, sparse: &Utf8Path, raw: &Utf8Path) -> Result<()> {
        self.record(Op::Decode(sparse.to_owned()));
        std::fs::write(raw, &self.decode_output)?;
        Ok(())
    }

    fn raw_to_sparse(&self, raw: &Utf8Path, sparse: &Utf8Path) -> Result<()> {
        self.record(Op::Encode(raw.to_owned(), sparse.to_owned()));
        if self.fail_encode {
            std::fs::write(sparse, b"truncated")?;
            return Err(anyhow!("img2simg: write failed"));
        }
        std::fs::write(sparse, fixtures::sparse_header())?;
        Ok(())
    }

    fn check_filesystem(&self, raw: &Utf8Path) -> Result<i32> {
        self.record(Op::Check(raw.to_owned()));
        Ok(self.fsck_code)
    }

    fn minimum_size(&self, raw: &Utf8Path) -> Result<u64> {
        self.record(Op::MinimumSize(raw.to_owned()));
        Ok(self.minimum_size)
    }

    fn resize_filesystem(&self, raw: &Utf8Path, bytes: u64) -> Result<()> {
        self.record(Op::Resize(raw.to_owned(), bytes));
        if self.fail_resize {
            return Err(anyhow!("resize2fs: No space left on device"));
        }
        Ok(())
    }

    fn write_partition_table(&self, path: &Utf8Path, layout: &SinglePartitionLayout) -> Result<()> {
        self.record(Op::PartitionTable(path.to_owned(), layout.clone()));
        Ok(())
    }
}

impl OverlayOps for FakeHost {
    fn apply_overlay(&self, invocation: &OverlayInvocation) -> Result<()> {
        self.record(Op::Overlay(invocation.clone()));
        if let Some(f) = self.on_overlay.as_ref() {
            f(invocation);
        }
        if self.fail_collaborator {
            return Err(anyhow!("overlay-apply failed: exit status: 1"));
        }
        Ok(())
    }

    fn interactive_shell(&self, shell: &DebugShell) -> Result<()> {
        self.record(Op::Shell(shell.clone()));
        if let Some(f) = self.on_shell.as_ref() {
            f(shell);
        }
        Ok(())
    }
}
