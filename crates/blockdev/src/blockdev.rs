use std::env;
use std::io::Write;
use std::path::Path;
use std::process::{Command, Stdio};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use fn_error_context::context;
use serde::Deserialize;
use tokio::signal::unix::{signal, SignalKind};

use rootpatch_utils::{is_busy_error, CommandRunExt, Retry};

/// Set in the environment of the loopback cleanup helper process.
pub const CLEANUP_HELPER_ENV: &str = "ROOTPATCH_LOOPBACK_CLEANUP_HELPER";

/// GPT partition type for a generic Linux filesystem.
pub const LINUX_FILESYSTEM_GUID: &str = "0FC63DAF-8483-4772-8E79-3D69D8477DE4";

#[derive(Debug, Deserialize)]
struct DevicesOutput {
    blockdevices: Vec<Device>,
}

/// A block device (and its children) as reported by `lsblk`.
#[derive(Debug, Deserialize)]
pub struct Device {
    /// Kernel name, e.g. `loop3p1`
    pub name: String,
    /// GPT partition name
    pub partlabel: Option<String>,
    /// Partition type GUID (or MBR type code)
    pub parttype: Option<String>,
    /// Partitions (or other holders) of this device
    pub children: Option<Vec<Device>>,
    /// Size in bytes
    pub size: u64,

    // Filesystem-related properties
    /// Filesystem label
    pub label: Option<String>,
    /// Filesystem type, as known to udev
    pub fstype: Option<String>,
    /// Device node; missing on very old util-linux
    pub path: Option<String>,
}

impl Device {
    /// Path to the device node, falling back to `/dev/<name>`.
    pub fn path(&self) -> String {
        self.path.clone().unwrap_or(format!("/dev/{}", &self.name))
    }

    /// Child devices; empty if there are none.
    pub fn children(&self) -> &[Device] {
        self.children.as_deref().unwrap_or_default()
    }
}

/// Run `lsblk` on a single device, including its children.
#[context("Listing device {dev}")]
pub fn list_dev(dev: &Utf8Path) -> Result<Device> {
    let devs: DevicesOutput = Command::new("lsblk")
        .args(["-J", "-b", "-O"])
        .arg(dev)
        .log_debug()
        .run_and_parse_json()?;
    devs.blockdevices
        .into_iter()
        .next()
        .ok_or_else(|| anyhow!("no device output from lsblk for {dev}"))
}

#[derive(Debug, Deserialize)]
struct SfDiskOutput {
    partitiontable: PartitionTable,
}

/// A partition as reported by `sfdisk --json`.
#[derive(Debug, Deserialize)]
pub struct Partition {
    /// Device node (or `<image>N` when run against a plain file)
    pub node: String,
    /// Start, in sectors
    pub start: u64,
    /// Size, in sectors
    pub size: u64,
    /// Partition type
    #[serde(rename = "type")]
    pub parttype: String,
    /// Partition UUID (GPT only)
    pub uuid: Option<String>,
    /// Partition name (GPT only)
    pub name: Option<String>,
}

/// The kind of partition table.
#[derive(Debug, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum PartitionType {
    /// MBR
    Dos,
    /// GUID partition table
    Gpt,
    /// Anything else sfdisk knows about
    Unknown(String),
}

/// A partition table as reported by `sfdisk --json`.
#[derive(Debug, Deserialize)]
pub struct PartitionTable {
    /// Table type
    pub label: PartitionType,
    /// Disk identifier
    pub id: String,
    /// The device (or file) that was inspected
    pub device: String,
    /// Sector size in bytes; older sfdisk omits it
    pub sectorsize: Option<u64>,
    /// All partitions, in table order
    pub partitions: Vec<Partition>,
}

impl PartitionTable {
    /// Size of a sector in bytes.
    pub fn sector_size(&self) -> u64 {
        self.sectorsize.unwrap_or(512)
    }
}

/// Read the partition table of a block device or disk image file.
#[context("Listing partitions of {dev}")]
pub fn partitions_of(dev: &Utf8Path) -> Result<PartitionTable> {
    let o: SfDiskOutput = Command::new("sfdisk")
        .args(["-J", dev.as_str()])
        .log_debug()
        .run_and_parse_json()?;
    Ok(o.partitiontable)
}

/// A GPT with exactly one partition, as written by [`write_partition_table`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SinglePartitionLayout {
    /// First sector of the partition
    pub start_sector: u64,
    /// Length of the partition in 512-byte sectors
    pub size_sectors: u64,
    /// GPT partition name
    pub name: String,
}

impl SinglePartitionLayout {
    /// Render the layout as an `sfdisk` script.
    pub fn to_sfdisk_script(&self) -> String {
        format!(
            "label: gpt\nunit: sectors\nsector-size: 512\n\nstart={}, size={}, type={}, name=\"{}\"\n",
            self.start_sector, self.size_sectors, LINUX_FILESYSTEM_GUID, self.name
        )
    }
}

/// Write a fresh partition table onto `dev`, which may be a plain file.
#[context("Writing partition table to {dev}")]
pub fn write_partition_table(dev: &Utf8Path, layout: &SinglePartitionLayout) -> Result<()> {
    let mut cmd = Command::new("sfdisk");
    cmd.args(["--quiet", "--no-reread", "--no-tell-kernel", "--wipe", "always"])
        .arg(dev)
        .stdin(Stdio::piped())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .log_debug();
    let mut child = cmd.spawn().context("Spawning sfdisk")?;
    {
        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| anyhow!("sfdisk stdin unavailable"))?;
        stdin.write_all(layout.to_sfdisk_script().as_bytes())?;
    }
    let o = child.wait_with_output()?;
    if !o.status.success() {
        let stderr = String::from_utf8_lossy(&o.stderr);
        anyhow::bail!("sfdisk failed: {:?}\n{}", o.status, stderr.trim());
    }
    Ok(())
}

/// Filesystem and partition-entry properties reported by `blkid -p`.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Probe {
    /// Filesystem type (`TYPE`)
    pub fstype: Option<String>,
    /// Filesystem label (`LABEL`)
    pub label: Option<String>,
    /// GPT partition name (`PART_ENTRY_NAME`)
    pub partlabel: Option<String>,
    /// Partition type (`PART_ENTRY_TYPE`)
    pub parttype: Option<String>,
}

fn parse_blkid_export(s: &str) -> Probe {
    let mut r = Probe::default();
    for line in s.lines() {
        let Some((k, v)) = line.split_once('=') else {
            continue;
        };
        let v = Some(v.to_string());
        match k {
            "TYPE" => r.fstype = v,
            "LABEL" => r.label = v,
            "PART_ENTRY_NAME" => r.partlabel = v,
            "PART_ENTRY_TYPE" => r.parttype = v,
            _ => {}
        }
    }
    r
}

/// Probe a device directly (bypassing the udev database, which may lag
/// behind freshly created loop partitions).
#[context("Probing {dev}")]
pub fn probe(dev: &Utf8Path) -> Result<Probe> {
    let o = Command::new("blkid")
        .args(["-p", "-o", "export"])
        .arg(dev)
        .log_debug()
        .output()?;
    match o.status.code() {
        Some(0) => Ok(parse_blkid_export(&String::from_utf8_lossy(&o.stdout))),
        // Nothing could be identified
        Some(2) => Ok(Probe::default()),
        _ => {
            let stderr = String::from_utf8_lossy(&o.stderr);
            anyhow::bail!("blkid failed: {:?}\n{}", o.status, stderr.trim())
        }
    }
}

/// The kernel's name for partition `partno` of `dev`, e.g. `/dev/loop3p1`.
pub fn kernel_partition_path(dev: &Utf8Path, partno: u32) -> Utf8PathBuf {
    let s = dev.as_str();
    if s.ends_with(|c: char| c.is_ascii_digit()) {
        format!("{s}p{partno}").into()
    } else {
        format!("{s}{partno}").into()
    }
}

/// The device-mapper node kpartx creates for partition `partno` of `dev`.
pub fn mapper_partition_path(dev: &Utf8Path, partno: u32) -> Utf8PathBuf {
    let name = dev.file_name().unwrap_or(dev.as_str());
    format!("/dev/mapper/{name}p{partno}").into()
}

fn parse_kpartx_output(s: &str) -> Vec<Utf8PathBuf> {
    s.lines()
        .filter_map(|l| l.strip_prefix("add map "))
        .filter_map(|l| l.split_whitespace().next())
        .map(|name| Utf8PathBuf::from(format!("/dev/mapper/{name}")))
        .collect()
}

/// Ask device-mapper to expose the partitions of `dev`; returns the new nodes.
#[context("Mapping partitions of {dev}")]
pub fn map_partitions(dev: &Utf8Path) -> Result<Vec<Utf8PathBuf>> {
    let out = Command::new("kpartx")
        .args(["-a", "-v", "-s"])
        .arg(dev)
        .log_debug()
        .run_get_string()?;
    Ok(parse_kpartx_output(&out))
}

/// Remove device-mapper partition mappings created by [`map_partitions`].
#[context("Removing partition mappings of {dev}")]
pub fn unmap_partitions(dev: &Utf8Path) -> Result<()> {
    Command::new("kpartx")
        .args(["-d", dev.as_str()])
        .log_debug()
        .run_capture_stderr()
}

/// Wait for udev to finish processing queued events, e.g. new partition nodes.
pub fn udev_settle(timeout: Duration) -> Result<()> {
    Command::new("udevadm")
        .arg("settle")
        .arg(format!("--timeout={}", timeout.as_secs().max(1)))
        .log_debug()
        .run_capture_stderr()
}

/// Options controlling how an image is attached to a loop device.
#[derive(Debug, Clone, Default)]
pub struct LoopOptions {
    /// Ask the kernel to scan the partition table (`losetup -P`).
    pub partscan: bool,
    /// Logical sector size of the loop device; the kernel default is 512.
    pub sector_size: Option<u32>,
    /// Retry policy for transient attach/detach failures.
    pub retry: Retry,
}

impl LoopOptions {
    fn losetup_args(&self, direct_io: &str) -> Vec<String> {
        let mut args = vec!["--show".to_string(), format!("--direct-io={direct_io}")];
        if self.partscan {
            args.push("-P".into());
        }
        if let Some(sz) = self.sector_size {
            args.push(format!("--sector-size={sz}"));
        }
        args.push("--find".into());
        args
    }
}

/// A loop device backed by a file, detached on [`LoopbackDevice::close`] or drop.
#[derive(Debug)]
pub struct LoopbackDevice {
    /// The device node; `None` once detached.
    pub dev: Option<Utf8PathBuf>,
    partitions_mapped: bool,
    retry: Retry,
    // Handle to the cleanup helper process
    cleanup_handle: Option<LoopbackCleanupHandle>,
}

/// Handle to manage the cleanup helper process for loopback devices
#[derive(Debug)]
struct LoopbackCleanupHandle {
    /// Child process handle
    child: std::process::Child,
}

impl LoopbackDevice {
    /// Create a new loopback block device targeting the provided file path.
    pub fn new(path: &Path, opts: &LoopOptions) -> Result<Self> {
        let direct_io = match env::var("ROOTPATCH_DIRECT_IO") {
            Ok(val) if val == "on" => "on",
            _ => "off",
        };
        let args = opts.losetup_args(direct_io);

        let dev = opts.retry.run(
            &format!("Attaching {}", path.display()),
            || {
                Command::new("losetup")
                    .args(&args)
                    .arg(path)
                    .log_debug()
                    .run_get_string()
            },
            is_busy_error,
        )?;
        let dev = Utf8PathBuf::from(dev.trim());
        tracing::debug!("Allocated loopback {dev} for {}", path.display());

        // Try to spawn cleanup helper, but don't fail if it doesn't work
        let cleanup_handle = match Self::spawn_cleanup_helper(dev.as_str()) {
            Ok(handle) => Some(handle),
            Err(e) => {
                tracing::warn!(
                    "Failed to spawn loopback cleanup helper for {}: {}. \
                     Loopback device may not be cleaned up if process is interrupted.",
                    dev,
                    e
                );
                None
            }
        };

        Ok(Self {
            dev: Some(dev),
            partitions_mapped: false,
            retry: opts.retry,
            cleanup_handle,
        })
    }

    /// Access the path to the loopback block device.
    pub fn path(&self) -> &Utf8Path {
        // The option is only taken when closing, which consumes or drops us
        self.dev.as_deref().unwrap_or(Utf8Path::new(""))
    }

    /// Record that device-mapper partition mappings were created for this
    /// device; they are removed before the device is detached.
    pub fn set_partitions_mapped(&mut self) {
        self.partitions_mapped = true;
    }

    /// Spawn a cleanup helper process that will clean up the loopback device
    /// if the parent process dies unexpectedly
    fn spawn_cleanup_helper(device_path: &str) -> Result<LoopbackCleanupHandle> {
        let self_path = rootpatch_utils::reexec::executable_path()
            .context("Failed to locate our own binary for cleanup helper")?;

        let mut cmd = Command::new(self_path);
        cmd.args(["internals", "loopback-cleanup-helper", "--device", device_path]);
        cmd.env(CLEANUP_HELPER_ENV, "1");
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::null());
        // Don't redirect stderr so we can see error messages

        let child = cmd
            .spawn()
            .context("Failed to spawn loopback cleanup helper")?;

        Ok(LoopbackCleanupHandle { child })
    }

    // Shared backend for our `close` and `drop` implementations.
    fn impl_close(&mut self) -> Result<()> {
        let Some(dev) = self.dev.take() else {
            tracing::trace!("loopback device already deallocated");
            return Ok(());
        };

        // We're cleaning up normally, the helper has nothing left to do
        if let Some(mut cleanup_handle) = self.cleanup_handle.take() {
            let _ = cleanup_handle.child.kill();
            let _ = cleanup_handle.child.wait();
        }

        if self.partitions_mapped {
            // A leftover mapping keeps the loop device busy; still try the detach
            if let Err(e) = unmap_partitions(&dev) {
                tracing::warn!("{e:#}");
            }
        }

        self.retry.run(
            &format!("Detaching {dev}"),
            || {
                Command::new("losetup")
                    .args(["-d", dev.as_str()])
                    .log_debug()
                    .run_capture_stderr()
            },
            is_busy_error,
        )
    }

    /// Consume this device, detaching it.
    pub fn close(mut self) -> Result<()> {
        self.impl_close()
    }
}

impl Drop for LoopbackDevice {
    fn drop(&mut self) {
        // Best effort to detach if we're dropped without invoking `close`
        let _ = self.impl_close();
    }
}

/// Main function for the loopback cleanup helper process
/// This function does not return - it either exits normally or via signal
pub async fn run_loopback_cleanup_helper(device_path: &str) -> Result<()> {
    if std::env::var(CLEANUP_HELPER_ENV).is_err() {
        anyhow::bail!("This function should only be called as a cleanup helper");
    }

    // Set up death signal notification - we want to be notified when parent dies
    rustix::process::set_parent_process_death_signal(Some(rustix::process::Signal::TERM))
        .context("Failed to set parent death signal")?;

    // Wait for SIGTERM (parent death); a normal close kills us outright
    let mut sigterm = signal(SignalKind::terminate()).context("Failed to create signal stream")?;
    // Ctrl-C at a debug shell reaches our whole process group
    let mut sigint = signal(SignalKind::interrupt()).context("Failed to create signal stream")?;
    loop {
        tokio::select! {
            _ = sigterm.recv() => break,
            _ = sigint.recv() => tracing::debug!("Ignoring SIGINT"),
        }
    }

    // Mappings may or may not exist; they'd keep the device busy
    let _ = Command::new("kpartx")
        .args(["-d", device_path])
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status();

    let output = Command::new("losetup").args(["-d", device_path]).output();

    match output {
        Ok(output) if output.status.success() => {
            tracing::info!("Cleaned up leaked loopback device {}", device_path);
            std::process::exit(0);
        }
        Ok(output) => {
            let stderr = String::from_utf8_lossy(&output.stderr);
            tracing::error!(
                "Failed to clean up loopback device {}: {}. Stderr: {}",
                device_path,
                output.status,
                stderr.trim()
            );
            std::process::exit(1);
        }
        Err(e) => {
            tracing::error!(
                "Error executing losetup to clean up loopback device {}: {}",
                device_path,
                e
            );
            std::process::exit(1);
        }
    }
}

/// Parse a string into mibibytes
pub fn parse_size_mib(mut s: &str) -> Result<u64> {
    let suffixes = [
        ("MiB", 1u64),
        ("M", 1u64),
        ("GiB", 1024),
        ("G", 1024),
        ("TiB", 1024 * 1024),
        ("T", 1024 * 1024),
    ];
    let mut mul = 1u64;
    for (suffix, imul) in suffixes {
        if let Some((sv, rest)) = s.rsplit_once(suffix) {
            if !rest.is_empty() {
                anyhow::bail!("Trailing text after size: {rest}");
            }
            s = sv;
            mul = imul;
        }
    }
    let v = s.parse::<u64>()?;
    Ok(v * mul)
}
