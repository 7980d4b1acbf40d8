//! Finding the root and EFI partitions of an attached disk image.
//!
//! Partition nodes are not always there right away, and on some hosts the
//! kernel never creates them for loop devices. Each lookup therefore runs
//! an ordered list of named strategies, stopping at the first that finds
//! something.

use anyhow::Result;
use camino::{Utf8Path, Utf8PathBuf};
use rootpatch_blockdev::{kernel_partition_path, mapper_partition_path, Probe};

use crate::error::ApplyError;
use crate::host::{LoopDevice, PartitionProbe};

/// The filesystem we patch.
pub(crate) const ROOT_FSTYPE: &str = "ext4";

/// GPT type of an EFI system partition.
pub(crate) const ESP_GUID: &str = "C12A7328-F81F-11D2-BA4B-00A0C93EC93B";

/// Labels (filesystem or partition) conventionally given to an ESP.
const ESP_LABELS: &[&str] = &[
    "EFI",
    "ESP",
    "EFI-SYSTEM",
    "EFI SYSTEM",
    "EFI System Partition",
    "SYSTEM-BOOT",
];

const FAT_TYPES: &[&str] = &["vfat", "fat", "fat12", "fat16", "fat32", "msdos"];

fn is_fat(p: &Probe) -> bool {
    p.fstype
        .as_deref()
        .is_some_and(|t| FAT_TYPES.iter().any(|f| f.eq_ignore_ascii_case(t)))
}

fn looks_like_esp(p: &Probe) -> bool {
    if p.fstype.as_deref() == Some(ROOT_FSTYPE) {
        return false;
    }
    let labelled = |l: &Option<String>| {
        l.as_deref()
            .is_some_and(|l| ESP_LABELS.iter().any(|e| e.eq_ignore_ascii_case(l)))
    };
    is_fat(p)
        || labelled(&p.label)
        || labelled(&p.partlabel)
        || p.parttype
            .as_deref()
            .is_some_and(|t| t.eq_ignore_ascii_case(ESP_GUID))
}

/// The partitions to mount.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct PartitionSet {
    pub(crate) root: Utf8PathBuf,
    pub(crate) efi: Option<Utf8PathBuf>,
}

/// Which partition slots to try first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Slots {
    pub(crate) root: u32,
    pub(crate) efi: u32,
}

type Strategy<'a, P, D> = fn(&mut Locator<'a, P, D>) -> Result<Option<Utf8PathBuf>>;

#[derive(Debug)]
pub(crate) struct Locator<'a, P: PartitionProbe, D: LoopDevice> {
    probe: &'a P,
    device: &'a mut D,
    slots: Slots,
    /// Nodes created through device-mapper, if that strategy ran.
    mapped: Option<Vec<Utf8PathBuf>>,
}

impl<'a, P: PartitionProbe, D: LoopDevice> Locator<'a, P, D> {
    pub(crate) fn new(probe: &'a P, device: &'a mut D, slots: Slots) -> Self {
        Self {
            probe,
            device,
            slots,
            mapped: None,
        }
    }

    fn device(&self) -> Utf8PathBuf {
        self.device.path().to_owned()
    }

    fn settle(&self) {
        if let Err(e) = self.probe.settle() {
            tracing::debug!("Waiting for device events: {e:#}");
        }
    }

    /// `node` as the root, unless it is known to hold another filesystem.
    fn accept_root(&self, node: Utf8PathBuf) -> Result<Option<Utf8PathBuf>> {
        let probed = self.probe.probe(&node)?;
        match probed.fstype.as_deref() {
            Some(t) if t != ROOT_FSTYPE => {
                tracing::debug!("{node} holds {t}, not {ROOT_FSTYPE}");
                Ok(None)
            }
            _ => Ok(Some(node)),
        }
    }

    fn root_from_kernel_node(&mut self) -> Result<Option<Utf8PathBuf>> {
        self.settle();
        let node = kernel_partition_path(&self.device(), self.slots.root);
        if !self.probe.node_exists(&node) {
            return Ok(None);
        }
        self.accept_root(node)
    }

    fn ensure_mapped(&mut self) -> Result<&[Utf8PathBuf]> {
        if self.mapped.is_none() {
            let device = self.device();
            // Mark first: a failure can still leave some mappings behind
            self.device.set_partitions_mapped();
            let nodes = self.probe.map_partitions(&device)?;
            self.settle();
            self.mapped = Some(nodes);
        }
        Ok(self.mapped.as_deref().unwrap_or_default())
    }

    fn root_from_device_mapper(&mut self) -> Result<Option<Utf8PathBuf>> {
        let node = mapper_partition_path(&self.device(), self.slots.root);
        let known = self.ensure_mapped()?.contains(&node);
        if !known && !self.probe.node_exists(&node) {
            return Ok(None);
        }
        self.accept_root(node)
    }

    /// Every partition node we know of, kernel-created first.
    fn all_partitions(&self) -> Vec<Utf8PathBuf> {
        let mut r = match self.probe.kernel_partitions(self.device.path()) {
            Ok(r) => r,
            Err(e) => {
                tracing::debug!("{e:#}");
                Vec::new()
            }
        };
        r.extend(self.mapped.iter().flatten().cloned());
        r
    }

    fn root_from_scan(&mut self) -> Result<Option<Utf8PathBuf>> {
        for node in self.all_partitions() {
            if self.probe.probe(&node)?.fstype.as_deref() == Some(ROOT_FSTYPE) {
                return Ok(Some(node));
            }
        }
        Ok(None)
    }

    fn root_strategies() -> [(&'static str, Strategy<'a, P, D>); 3] {
        [
            ("kernel partition node", Self::root_from_kernel_node),
            ("device-mapper", Self::root_from_device_mapper),
            ("filesystem scan", Self::root_from_scan),
        ]
    }

    fn run_strategies(
        &mut self,
        what: &str,
        strategies: &[(&str, Strategy<'a, P, D>)],
    ) -> Option<Utf8PathBuf> {
        for (name, strategy) in strategies {
            match strategy(&mut *self) {
                Ok(Some(node)) => {
                    tracing::debug!("Found {what} partition {node} via {name}");
                    return Some(node);
                }
                Ok(None) => tracing::debug!("No {what} partition via {name}"),
                Err(e) => tracing::debug!("Looking up {what} partition via {name}: {e:#}"),
            }
        }
        None
    }

    /// What a failed search saw.
    fn observed(&self) -> Vec<String> {
        self.all_partitions()
            .into_iter()
            .map(|node| match self.probe.probe(&node) {
                Ok(p) => format!("{node} ({})", p.fstype.as_deref().unwrap_or("unknown")),
                Err(_) => format!("{node} (unprobed)"),
            })
            .collect()
    }

    pub(crate) fn locate_root(&mut self) -> Result<Utf8PathBuf> {
        if let Some(root) = self.run_strategies("root", &Self::root_strategies()) {
            return Ok(root);
        }
        Err(ApplyError::RootPartitionNotFound {
            device: self.device(),
            observed: self.observed(),
        }
        .into())
    }

    fn efi_from_slot(&mut self) -> Result<Option<Utf8PathBuf>> {
        let device = self.device();
        let node = match self.mapped {
            Some(_) => mapper_partition_path(&device, self.slots.efi),
            None => kernel_partition_path(&device, self.slots.efi),
        };
        if !self.probe.node_exists(&node) || !is_fat(&self.probe.probe(&node)?) {
            return Ok(None);
        }
        Ok(Some(node))
    }

    fn efi_from_scan(&mut self) -> Result<Option<Utf8PathBuf>> {
        for node in self.all_partitions() {
            if looks_like_esp(&self.probe.probe(&node)?) {
                return Ok(Some(node));
            }
        }
        Ok(None)
    }

    /// The EFI partition, if any; its absence is not an error.
    pub(crate) fn locate_efi(&mut self, root: &Utf8Path) -> Option<Utf8PathBuf> {
        let strategies: [(&str, Strategy<'a, P, D>); 2] = [
            ("partition slot", Self::efi_from_slot),
            ("label scan", Self::efi_from_scan),
        ];
        let r = self
            .run_strategies("EFI", &strategies)
            .filter(|node| node != root);
        if r.is_none() {
            tracing::info!("No EFI partition on {}", self.device.path());
        }
        r
    }

    pub(crate) fn locate(&mut self) -> Result<PartitionSet> {
        let root = self.locate_root()?;
        let efi = self.locate_efi(&root);
        Ok(PartitionSet { root, efi })
    }
}
