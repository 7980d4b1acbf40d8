//! # rootpatch command line
//!
//! Command line tool to customize root filesystem images in place.

use std::ffi::OsString;
use std::io::Write;

use anyhow::{Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use clap::{ArgGroup, Parser, Subcommand};
use rootpatch_blockdev::PartitionType;
use rootpatch_utils::CommandRunExt;
use serde::Serialize;

use crate::apply::{self, ApplyRequest};
use crate::config::Config;
use crate::error::ApplyError;
use crate::flow::DebugMode;
use crate::format::{self, ImageFormat};
use crate::interrupt::{Interrupt, SignalWatch};
use crate::overlay::{command_from_argv, listing_args, Listing, OverlayTarget};

/// Perform an apply: mount the image, run the overlay tool inside it,
/// and write the result back.
#[derive(Debug, Clone, clap::Args, PartialEq, Eq)]
#[command(group(ArgGroup::new("target").required(true).args(["stack", "overlay"])))]
pub(crate) struct ApplyOpts {
    /// Image to modify: a plain ext4 filesystem, an Android sparse image,
    /// or a partitioned disk image.
    #[clap(long)]
    pub(crate) image: Utf8PathBuf,

    /// FAT image to expose as the EFI system partition next to a plain
    /// root image. Ignored for disk images.
    #[clap(long)]
    pub(crate) efi_image: Option<Utf8PathBuf>,

    /// Name of the stack to apply.
    #[clap(long)]
    pub(crate) stack: Option<String>,

    /// Name of a single overlay to apply.
    #[clap(long)]
    pub(crate) overlay: Option<String>,

    /// Directory of resources made available to the overlays.
    #[clap(long)]
    pub(crate) resources: Option<Utf8PathBuf>,

    /// Overlay search roots, in priority order. May be colon separated
    /// or repeated.
    #[clap(long, value_delimiter = ':')]
    pub(crate) overlay_dirs: Vec<Utf8PathBuf>,

    /// Open an interactive shell before or after applying.
    #[clap(long, value_enum, default_value_t)]
    pub(crate) debug: DebugMode,

    /// Where to mount the root filesystem; defaults to a temporary
    /// directory.
    #[clap(long)]
    pub(crate) mount_point: Option<Utf8PathBuf>,
}

impl ApplyOpts {
    fn into_request(self) -> Result<ApplyRequest> {
        let target = match (self.stack, self.overlay) {
            (Some(s), None) => OverlayTarget::Stack(s),
            (None, Some(o)) => OverlayTarget::Overlay(o),
            _ => {
                return Err(ApplyError::InvalidArguments(
                    "exactly one of --stack or --overlay is required".into(),
                )
                .into())
            }
        };
        Ok(ApplyRequest {
            image: self.image,
            efi_image: self.efi_image,
            target,
            resources: self.resources,
            overlay_dirs: self.overlay_dirs,
            debug: self.debug,
            mount_point: self.mount_point,
        })
    }
}

/// Show what an image is.
#[derive(Debug, Clone, clap::Args, PartialEq, Eq)]
pub(crate) struct InspectOpts {
    /// Image to inspect.
    pub(crate) image: Utf8PathBuf,

    /// Output JSON.
    #[clap(long)]
    pub(crate) json: bool,
}

/// List what the overlay tool can find.
#[derive(Debug, Clone, clap::Args, PartialEq, Eq)]
pub(crate) struct ListOpts {
    /// Include descriptions and contents.
    #[clap(long, short = 'v')]
    pub(crate) verbose: bool,

    /// Overlay search roots, in priority order.
    #[clap(long, value_delimiter = ':')]
    pub(crate) overlay_dirs: Vec<Utf8PathBuf>,
}

/// Hidden, internal only options
#[derive(Debug, Subcommand, PartialEq, Eq)]
pub(crate) enum InternalsOpts {
    /// Detach a loop device once our parent exits.
    LoopbackCleanupHelper {
        /// Device path
        #[clap(long)]
        device: String,
    },
}

/// Customize root filesystem images by applying overlays inside them.
#[derive(Debug, Parser, PartialEq, Eq)]
#[clap(name = "rootpatch", version)]
pub(crate) struct Cli {
    /// Configuration file; defaults to $ROOTPATCH_CONFIG or
    /// /etc/rootpatch/config.toml.
    #[clap(long, global = true)]
    pub(crate) config: Option<Utf8PathBuf>,

    #[clap(subcommand)]
    pub(crate) cmd: Opt,
}

#[derive(Debug, Subcommand, PartialEq, Eq)]
pub(crate) enum Opt {
    /// Apply a stack or overlay to an image.
    ///
    /// The image is modified in place and keeps its format. Requires root.
    Apply(ApplyOpts),
    /// Print the detected format of an image, and the partitions of a
    /// disk image.
    Inspect(InspectOpts),
    /// List the stacks available in the overlay search roots.
    ListStacks(ListOpts),
    /// List the overlays available in the overlay search roots.
    ListOverlays(ListOpts),
    #[clap(subcommand)]
    #[clap(hide = true)]
    Internals(InternalsOpts),
}

#[derive(Debug, Serialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
struct PartitionSummary {
    node: String,
    start: u64,
    size: u64,
    #[serde(rename = "type")]
    parttype: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    name: Option<String>,
}

#[derive(Debug, Serialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
struct Inspection {
    path: Utf8PathBuf,
    format: ImageFormat,
    size: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    partition_table: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    sector_size: Option<u64>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    partitions: Vec<PartitionSummary>,
}

fn table_label(t: &PartitionType) -> String {
    match t {
        PartitionType::Dos => "dos".into(),
        PartitionType::Gpt => "gpt".into(),
        PartitionType::Unknown(s) => s.clone(),
    }
}

fn inspect(path: &Utf8Path) -> Result<Inspection> {
    let image = format::detect(path)?;
    let mut r = Inspection {
        path: image.path,
        format: image.format,
        size: image.size,
        partition_table: None,
        sector_size: None,
        partitions: Vec::new(),
    };
    if image.format == ImageFormat::Disk {
        let table = rootpatch_blockdev::partitions_of(&r.path)?;
        r.partition_table = Some(table_label(&table.label));
        r.sector_size = Some(table.sector_size());
        r.partitions = table
            .partitions
            .into_iter()
            .map(|p| PartitionSummary {
                node: p.node,
                start: p.start,
                size: p.size,
                parttype: p.parttype,
                name: p.name,
            })
            .collect();
    }
    Ok(r)
}

fn print_inspection(out: &mut impl Write, i: &Inspection, json: bool) -> Result<()> {
    if json {
        serde_json::to_writer_pretty(&mut *out, i)?;
        writeln!(out)?;
        return Ok(());
    }
    writeln!(out, "{}: {} image, {} bytes", i.path, i.format, i.size)?;
    if let Some(label) = i.partition_table.as_deref() {
        write!(out, "Partition table: {label}")?;
        if let Some(sz) = i.sector_size {
            write!(out, ", {sz}-byte sectors")?;
        }
        writeln!(out)?;
    }
    for p in &i.partitions {
        write!(out, "  {}  start={} size={} type={}", p.node, p.start, p.size, p.parttype)?;
        if let Some(name) = p.name.as_deref() {
            write!(out, " name={name}")?;
        }
        writeln!(out)?;
    }
    Ok(())
}

fn list(config: &Config, what: Listing, opts: &ListOpts) -> Result<()> {
    let mut cmd = command_from_argv(&config.collaborator);
    cmd.args(listing_args(what, opts.verbose, &opts.overlay_dirs));
    cmd.run_inherited()
}

async fn run_apply(config: Config, opts: ApplyOpts) -> Result<()> {
    if !rustix::process::getuid().is_root() {
        return Err(ApplyError::InvalidArguments("apply must be run as root".into()).into());
    }
    let req = opts.into_request()?;
    let interrupt = Interrupt::default();
    // Installed before the apply starts so no signal takes the default action
    let signals = SignalWatch::install()?;
    let watcher = tokio::spawn(signals.forward(interrupt.clone()));
    let r = tokio::task::spawn_blocking(move || apply::apply(&config, &req, &interrupt)).await;
    watcher.abort();
    r.context("Waiting for apply")?
}

/// Parse the provided arguments and execute.
/// Calls [`clap::Error::exit`] on failure, printing the error message and aborting the program.
pub async fn run_from_iter<I>(args: I) -> Result<()>
where
    I: IntoIterator,
    I::Item: Into<OsString> + Clone,
{
    run_from_opt(Cli::parse_from(args)).await
}

async fn run_from_opt(cli: Cli) -> Result<()> {
    if let Opt::Internals(InternalsOpts::LoopbackCleanupHelper { device }) = &cli.cmd {
        return rootpatch_blockdev::run_loopback_cleanup_helper(device).await;
    }
    let config = Config::load(cli.config.as_deref())?;
    match cli.cmd {
        Opt::Apply(opts) => run_apply(config, opts).await,
        Opt::Inspect(opts) => {
            let i = inspect(&opts.image)?;
            let mut out = std::io::stdout().lock();
            print_inspection(&mut out, &i, opts.json)?;
            out.flush()?;
            Ok(())
        }
        Opt::ListStacks(opts) => list(&config, Listing::Stacks, &opts),
        Opt::ListOverlays(opts) => list(&config, Listing::Overlays, &opts),
        Opt::Internals(_) => Ok(()),
    }
}
