//! A named external command, logged before it runs.

use std::ffi::OsStr;
use std::process::{Command, ExitStatus, Stdio};

use anyhow::{Context, Result};
use rootpatch_utils::CommandRunExt;

#[derive(Debug)]
pub(crate) struct Task {
    description: String,
    quiet: bool,
    pub(crate) cmd: Command,
}

impl Task {
    pub(crate) fn new(description: impl AsRef<str>, exe: impl AsRef<str>) -> Self {
        let description = description.as_ref().to_string();
        let mut cmd = Command::new(exe.as_ref());
        cmd.stdin(Stdio::null());
        Self {
            description,
            quiet: false,
            cmd,
        }
    }

    /// Log at debug level instead of info.
    pub(crate) fn quiet(mut self) -> Self {
        self.quiet = true;
        self
    }

    pub(crate) fn args<S: AsRef<OsStr>>(mut self, args: impl IntoIterator<Item = S>) -> Self {
        self.cmd.args(args);
        self
    }

    pub(crate) fn arg<S: AsRef<OsStr>>(mut self, arg: S) -> Self {
        self.cmd.arg(arg);
        self
    }

    fn announce(&mut self) {
        if self.quiet {
            tracing::debug!("{}", self.description);
        } else {
            tracing::info!("{}", self.description);
        }
        self.cmd.log_debug();
    }

    /// Run to completion; failure carries the tail of stderr.
    pub(crate) fn run(mut self) -> Result<()> {
        self.announce();
        let description = self.description;
        self.cmd.run_capture_stderr().context(description)
    }

    /// Run to completion, returning stdout.
    pub(crate) fn read(mut self) -> Result<String> {
        self.announce();
        let description = self.description;
        self.cmd.run_get_string().context(description)
    }

    /// Run to completion and return the exit status whatever it is, for
    /// tools whose exit codes carry more than success or failure.
    pub(crate) fn status(mut self) -> Result<ExitStatus> {
        self.announce();
        self.cmd.stdout(Stdio::null());
        self.cmd
            .status()
            .with_context(|| format!("{}: spawning {}", self.description, self.cmd.to_string_pretty()))
    }

    pub(crate) fn new_and_run<'a>(
        description: impl AsRef<str>,
        exe: impl AsRef<str>,
        args: impl IntoIterator<Item = &'a str>,
    ) -> Result<()> {
        Self::new(description, exe).args(args).run()
    }
}
