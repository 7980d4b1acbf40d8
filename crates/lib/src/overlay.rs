//! The contract with the external overlay tool, and the debug shells
//! that can be opened around it.

use std::process::Command;

use camino::{Utf8Path, Utf8PathBuf};

/// What to apply: a named stack of overlays, or a single overlay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum OverlayTarget {
    Stack(String),
    Overlay(String),
}

/// One invocation of the overlay tool against a mounted root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct OverlayInvocation {
    pub(crate) mount_point: Utf8PathBuf,
    pub(crate) target: OverlayTarget,
    pub(crate) resources: Option<Utf8PathBuf>,
    /// Searched in order; the first root that has a match wins.
    pub(crate) overlay_dirs: Vec<Utf8PathBuf>,
}

/// The overlay tool's `--overlay-dirs` takes a single colon-separated list.
fn join_dirs(dirs: &[Utf8PathBuf]) -> String {
    dirs.iter()
        .map(|d| d.as_str())
        .collect::<Vec<_>>()
        .join(":")
}

impl OverlayInvocation {
    pub(crate) fn args(&self) -> Vec<String> {
        let mut r = vec![
            "apply".to_string(),
            "--mount-point".into(),
            self.mount_point.to_string(),
        ];
        match &self.target {
            OverlayTarget::Stack(s) => r.extend(["--stack".into(), s.clone()]),
            OverlayTarget::Overlay(o) => r.extend(["--overlay".into(), o.clone()]),
        }
        if let Some(res) = self.resources.as_ref() {
            r.extend(["--resources".into(), res.to_string()]);
        }
        if !self.overlay_dirs.is_empty() {
            r.extend(["--overlay-dirs".into(), join_dirs(&self.overlay_dirs)]);
        }
        r
    }
}

/// The listing subcommands forwarded to the overlay tool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Listing {
    Stacks,
    Overlays,
}

pub(crate) fn listing_args(what: Listing, verbose: bool, overlay_dirs: &[Utf8PathBuf]) -> Vec<String> {
    let mut r = vec![match what {
        Listing::Stacks => "list-stacks".to_string(),
        Listing::Overlays => "list-overlays".to_string(),
    }];
    if verbose {
        r.push("--verbose".into());
    }
    if !overlay_dirs.is_empty() {
        r.extend(["--overlay-dirs".into(), join_dirs(overlay_dirs)]);
    }
    r
}

/// A command whose program is `argv[0]` and which starts with the rest of `argv`.
pub(crate) fn command_from_argv(argv: &[String]) -> Command {
    let mut c = Command::new(argv.first().map(String::as_str).unwrap_or("overlay-apply"));
    c.args(argv.iter().skip(1));
    c
}

/// Where an interactive debug shell runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum DebugShell {
    /// On the host, in the mounted root; before the overlay is applied.
    Host(Utf8PathBuf),
    /// Inside the mounted root via chroot; after the overlay is applied.
    Chroot(Utf8PathBuf),
}

impl DebugShell {
    pub(crate) fn mount_point(&self) -> &Utf8Path {
        match self {
            DebugShell::Host(p) | DebugShell::Chroot(p) => p,
        }
    }

    pub(crate) fn command(&self, shell: &str) -> Command {
        match self {
            DebugShell::Host(mnt) => {
                let mut c = Command::new(shell);
                c.current_dir(mnt)
                    .env("ROOTPATCH_MOUNT_POINT", mnt)
                    .env("PS1", "(rootpatch pre-apply) \\w \\$ ");
                c
            }
            DebugShell::Chroot(mnt) => {
                let mut c = Command::new("chroot");
                c.arg(mnt)
                    .arg(shell)
                    .env("PS1", "(rootpatch post-apply) \\w \\$ ");
                c
            }
        }
    }
}
