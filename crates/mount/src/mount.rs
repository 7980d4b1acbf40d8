//! Helpers for mounting, bind mounting and unmounting, plus a `findmnt`
//! query to find what is mounted beneath a directory.

use std::process::Command;

use anyhow::Result;
use camino::{Utf8Path, Utf8PathBuf};
use fn_error_context::context;
use rootpatch_utils::CommandRunExt;
use rustix::io::Errno;
use rustix::mount::{MountFlags, UnmountFlags};
use serde::Deserialize;

/// Outcome of a successful [`unmount`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Unmount {
    /// The target was mounted and is now gone.
    Unmounted,
    /// Nothing was mounted there (or the path no longer exists).
    NotMounted,
}

/// A mounted filesystem as reported by `findmnt`, with its submounts.
#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub struct Filesystem {
    /// Mount source, e.g. a device node
    pub source: String,
    /// Mount point
    pub target: String,
    /// Filesystem type
    pub fstype: String,
    /// Mounts stacked beneath this one
    pub children: Option<Vec<Filesystem>>,
}

/// Output of `findmnt -J`.
#[derive(Deserialize, Debug, Default)]
pub struct Findmnt {
    /// Top-level mounts
    pub filesystems: Vec<Filesystem>,
}

impl Findmnt {
    /// Every mount in the tree, parents before their children.
    pub fn flatten(&self) -> Vec<&Filesystem> {
        fn walk<'a>(fs: &'a [Filesystem], out: &mut Vec<&'a Filesystem>) {
            for f in fs {
                out.push(f);
                walk(f.children.as_deref().unwrap_or_default(), out);
            }
        }
        let mut out = Vec::new();
        walk(&self.filesystems, &mut out);
        out
    }
}

/// Run `findmnt` with JSON output and the columns [`Filesystem`] knows.
pub fn run_findmnt(args: &[&str], path: Option<&str>) -> Result<Findmnt> {
    let o: Findmnt = Command::new("findmnt")
        .args(["-J", "-v", "--output=SOURCE,TARGET,FSTYPE"])
        .args(args)
        .args(path)
        .log_debug()
        .run_and_parse_json()?;
    Ok(o)
}

/// Mount the filesystem on `source` (a block device) at `target`.
#[context("Mounting {source} ({fstype}) at {target}")]
pub fn mount(source: &Utf8Path, target: &Utf8Path, fstype: &str) -> Result<()> {
    tracing::debug!("mount -t {fstype} {source} {target}");
    rustix::mount::mount(
        source.as_std_path(),
        target.as_std_path(),
        fstype,
        MountFlags::empty(),
        None,
    )?;
    Ok(())
}

/// Non-recursively bind mount `source` onto `target`.
#[context("Bind mounting {source} at {target}")]
pub fn bind_mount(source: &Utf8Path, target: &Utf8Path) -> Result<()> {
    tracing::debug!("mount --bind {source} {target}");
    rustix::mount::mount_bind(source.as_std_path(), target.as_std_path())?;
    Ok(())
}

/// Unmount `target`. Not being mounted is reported, not treated as an error.
#[context("Unmounting {target}")]
pub fn unmount(target: &Utf8Path, lazy: bool) -> Result<Unmount> {
    let flags = if lazy {
        UnmountFlags::DETACH
    } else {
        UnmountFlags::empty()
    };
    tracing::debug!("umount{} {target}", if lazy { " -l" } else { "" });
    match rustix::mount::unmount(target.as_std_path(), flags) {
        Ok(()) => Ok(Unmount::Unmounted),
        Err(Errno::INVAL) | Err(Errno::NOENT) => Ok(Unmount::NotMounted),
        Err(e) => Err(std::io::Error::from(e).into()),
    }
}

/// Of `mounts`, the mount points at or beneath `dir`, deepest first, so
/// that unmounting them in order never hits a busy parent.
pub fn filter_mounts_under(mounts: &Findmnt, dir: &Utf8Path) -> Vec<Utf8PathBuf> {
    let mut r: Vec<Utf8PathBuf> = mounts
        .flatten()
        .into_iter()
        .map(|fs| Utf8PathBuf::from(&fs.target))
        .filter(|target| target.starts_with(dir))
        .collect();
    // Later mounts stack over earlier ones at the same point; keep
    // mount order reversed within equal depth.
    r.reverse();
    r.sort_by_key(|p| std::cmp::Reverse(p.components().count()));
    r
}

/// Every mount point at or beneath `dir` in our mount namespace, deepest
/// first. `dir` must be absolute and free of symlinks.
#[context("Listing mounts under {dir}")]
pub fn mounts_under(dir: &Utf8Path) -> Result<Vec<Utf8PathBuf>> {
    let mounts = run_findmnt(&[], None)?;
    Ok(filter_mounts_under(&mounts, dir))
}
