//! Helpers intended for [`std::process::Command`] and related structures.

use std::io::{Read, Seek};
use std::process::{Command, ExitStatus, Stdio};

use anyhow::{Context, Result};

/// How much of a failing child's stderr we carry into the error.
const MAX_STDERR_BYTES: usize = 1024;

/// Helpers intended for [`std::process::Command`].
pub trait CommandRunExt {
    /// Log (at debug level) the full child commandline.
    fn log_debug(&mut self) -> &mut Self;

    /// Execute the child process, capturing stderr. On failure the
    /// tail of stderr is included in the returned error.
    fn run_capture_stderr(&mut self) -> Result<()>;

    /// Execute the child process with all stdio inherited from us;
    /// used for anything an operator is expected to watch or drive.
    fn run_inherited(&mut self) -> Result<()>;

    /// Execute the child process and return its stdout as a string.
    fn run_get_string(&mut self) -> Result<String>;

    /// Execute the child process, parsing its stdout as JSON.
    fn run_and_parse_json<T: serde::de::DeserializeOwned>(&mut self) -> Result<T>;

    /// Render the commandline in a form that could be pasted into a shell.
    fn to_string_pretty(&self) -> String;
}

/// Helpers for [`std::process::ExitStatus`].
pub trait ExitStatusExt {
    /// If the exit status signals it was not successful, return an error.
    /// Note that we intentionally *don't* include the command string
    /// in the output; we leave it to the caller to add that if they want,
    /// as it may be verbose.
    fn check_status(&self, stderr: std::fs::File) -> Result<()>;
}

/// Read the tail of a file, lossily converting to UTF-8.
fn last_utf8_content_from_file(mut f: std::fs::File) -> String {
    // Only the trailing bytes, to avoid pathological error messages
    let mut buf = Vec::new();
    if f.seek(std::io::SeekFrom::Start(0)).is_err() || f.read_to_end(&mut buf).is_err() {
        return String::new();
    }
    let start = buf.len().saturating_sub(MAX_STDERR_BYTES);
    String::from_utf8_lossy(&buf[start..]).trim().to_string()
}

impl ExitStatusExt for ExitStatus {
    fn check_status(&self, stderr: std::fs::File) -> Result<()> {
        if self.success() {
            return Ok(());
        }
        let stderr = last_utf8_content_from_file(stderr);
        if stderr.is_empty() {
            anyhow::bail!("Subprocess failed: {self:?}")
        }
        anyhow::bail!("Subprocess failed: {self:?}\n{stderr}")
    }
}

impl CommandRunExt for Command {
    fn log_debug(&mut self) -> &mut Self {
        tracing::debug!("exec: {}", self.to_string_pretty());
        self
    }

    fn run_capture_stderr(&mut self) -> Result<()> {
        let stderr = tempfile::tempfile()?;
        self.stderr(stderr.try_clone()?);
        tracing::trace!("exec: {self:?}");
        let st = self
            .status()
            .with_context(|| format!("Failed to spawn {}", self.to_string_pretty()))?;
        st.check_status(stderr)
    }

    fn run_inherited(&mut self) -> Result<()> {
        tracing::trace!("exec: {self:?}");
        let st = self
            .status()
            .with_context(|| format!("Failed to spawn {}", self.to_string_pretty()))?;
        if !st.success() {
            anyhow::bail!("{} failed: {st:?}", self.to_string_pretty());
        }
        Ok(())
    }

    fn run_get_string(&mut self) -> Result<String> {
        let stderr = tempfile::tempfile()?;
        self.stderr(stderr.try_clone()?);
        self.stdout(Stdio::piped());
        tracing::trace!("exec: {self:?}");
        let o = self
            .output()
            .with_context(|| format!("Failed to spawn {}", self.to_string_pretty()))?;
        o.status.check_status(stderr)?;
        String::from_utf8(o.stdout).context("Parsing child output as UTF-8")
    }

    fn run_and_parse_json<T: serde::de::DeserializeOwned>(&mut self) -> Result<T> {
        let s = self.run_get_string()?;
        serde_json::from_str(&s).context("Parsing child output as JSON")
    }

    fn to_string_pretty(&self) -> String {
        std::iter::once(self.get_program())
            .chain(self.get_args())
            .map(|s| {
                let s = s.to_string_lossy();
                match shlex::try_quote(&s) {
                    Ok(q) => q.into_owned(),
                    Err(_) => s.into_owned(),
                }
            })
            .collect::<Vec<_>>()
            .join(" ")
    }
}
