use std::time::Duration;

use anyhow::Result;

/// A small, bounded retry policy for operations that fail transiently,
/// e.g. a loop device still held open by udev right after a mount went away.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Retry {
    /// Total number of attempts, including the first one.
    pub attempts: u32,
    /// Delay before the second attempt; grows linearly with each retry.
    pub backoff: Duration,
}

impl Default for Retry {
    fn default() -> Self {
        Self {
            attempts: 3,
            backoff: Duration::from_millis(500),
        }
    }
}

impl Retry {
    /// Invoke `f` until it succeeds, the error is not `transient`, or
    /// we run out of attempts. The last error is returned unchanged.
    pub fn run<T>(
        &self,
        what: &str,
        mut f: impl FnMut() -> Result<T>,
        transient: impl Fn(&anyhow::Error) -> bool,
    ) -> Result<T> {
        let attempts = self.attempts.max(1);
        let mut attempt = 1;
        loop {
            match f() {
                Ok(v) => return Ok(v),
                Err(e) if attempt < attempts && transient(&e) => {
                    let delay = self.backoff * attempt;
                    tracing::debug!("{what}: attempt {attempt}/{attempts} failed: {e:#}; retrying in {delay:?}");
                    std::thread::sleep(delay);
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// Returns true if the error (or any of its causes) looks like EBUSY.
pub fn is_busy_error(e: &anyhow::Error) -> bool {
    e.chain().any(|cause| {
        if let Some(ioe) = cause.downcast_ref::<std::io::Error>() {
            if ioe.raw_os_error() == Some(libc::EBUSY) {
                return true;
            }
        }
        let msg = cause.to_string().to_ascii_lowercase();
        msg.contains("busy")
    })
}
