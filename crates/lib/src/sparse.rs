//! Converting between Android sparse images and raw filesystems.
//!
//! Decoding is plain expansion. Encoding first checks the filesystem,
//! shrinks it to its minimum plus a fixed amount of free space, and only
//! then writes the sparse image, so the result is as small as it can be
//! while staying usable.

use std::fs::{File, OpenOptions};
use std::io::Read;

use anyhow::{anyhow, Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use fn_error_context::context;
use regex::Regex;

use crate::error::ApplyError;
use crate::format::is_sparse_header;
use crate::host::ImageTools;

/// Filesystem blocks are at most this large; sizes are rounded up to it.
const SIZE_ALIGN: u64 = 4096;

/// How `e2fsck -f -y` exited.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CheckOutcome {
    Clean,
    /// Errors were found and fixed.
    Corrected,
    /// Errors remain, or the checker itself failed.
    Failed(i32),
}

impl From<i32> for CheckOutcome {
    fn from(code: i32) -> Self {
        match code {
            0 => CheckOutcome::Clean,
            1..=3 => CheckOutcome::Corrected,
            n => CheckOutcome::Failed(n),
        }
    }
}

/// Parse the block count out of `resize2fs -P` output.
pub(crate) fn parse_minimum_blocks(s: &str) -> Result<u64> {
    // Estimated minimum size of the filesystem: 26215
    let re = Regex::new(r"(?m)^Estimated minimum size of the filesystem:\s*(\d+)\s*$")?;
    let caps = re
        .captures(s)
        .ok_or_else(|| anyhow!("Unexpected resize2fs -P output: {}", s.trim()))?;
    Ok(caps[1].parse()?)
}

/// Parse the block size out of `dumpe2fs -h` output.
pub(crate) fn parse_block_size(s: &str) -> Result<u64> {
    let re = Regex::new(r"(?m)^Block size:\s*(\d+)\s*$")?;
    let caps = re
        .captures(s)
        .ok_or_else(|| anyhow!("No block size in dumpe2fs output"))?;
    Ok(caps[1].parse()?)
}

fn align_up(v: u64, align: u64) -> u64 {
    v.div_ceil(align) * align
}

/// The size to shrink to: the minimum plus slack, block aligned.
pub(crate) fn target_size(minimum: u64, slack: u64) -> u64 {
    align_up(minimum + slack, SIZE_ALIGN)
}

fn file_is_sparse(path: &Utf8Path) -> Result<bool> {
    let mut buf = Vec::with_capacity(32);
    File::open(path)?.take(32).read_to_end(&mut buf)?;
    Ok(is_sparse_header(&buf))
}

/// Decode output must exist, be non-empty, and be readable.
fn verify_decoded(raw: &Utf8Path) -> Result<(), String> {
    let mut f = File::open(raw).map_err(|e| format!("decoded image unreadable: {e}"))?;
    let mut byte = [0u8; 1];
    match f.read(&mut byte) {
        Ok(1) => Ok(()),
        Ok(_) => Err("decoded image is empty".into()),
        Err(e) => Err(format!("decoded image unreadable: {e}")),
    }
}

/// The intermediate file an encode writes before renaming over `dest`.
fn partial_path(dest: &Utf8Path) -> Utf8PathBuf {
    let mut name = dest.file_name().unwrap_or("image").to_string();
    name.push_str(".partial");
    dest.with_file_name(name)
}

#[derive(Debug)]
pub(crate) struct SparseCodec<'a, T: ImageTools> {
    tools: &'a T,
    slack: u64,
}

impl<'a, T: ImageTools> SparseCodec<'a, T> {
    pub(crate) fn new(tools: &'a T, slack: u64) -> Self {
        Self { tools, slack }
    }

    /// Expand `sparse` into `raw`. Input that turns out not to be sparse
    /// is copied unchanged.
    pub(crate) fn decode(&self, sparse: &Utf8Path, raw: &Utf8Path) -> Result<()> {
        let is_sparse = file_is_sparse(sparse)
            .map_err(|e| ApplyError::invalid_image(sparse, format!("cannot read: {e}")))?;
        if is_sparse {
            self.tools
                .sparse_to_raw(sparse, raw)
                .map_err(|e| ApplyError::invalid_image(sparse, format!("decoding failed: {e:#}")))?;
        } else {
            tracing::warn!("{sparse} is not a sparse image; copying it unchanged");
            std::fs::copy(sparse, raw).with_context(|| format!("Copying {sparse} to {raw}"))?;
        }
        verify_decoded(raw).map_err(|reason| ApplyError::invalid_image(sparse, reason))?;
        Ok(())
    }

    /// Check, shrink and encode `raw` into `sparse`, which is replaced
    /// only once the new image is complete. Any failure leaves `raw`
    /// untouched on disk.
    pub(crate) fn encode(&self, raw: &Utf8Path, sparse: &Utf8Path) -> Result<()> {
        self.encode_impl(raw, sparse).map_err(|source| {
            ApplyError::ResizeOrCheckFailure {
                raw: raw.to_owned(),
                source,
            }
            .into()
        })
    }

    #[context("Encoding {raw}")]
    fn encode_impl(&self, raw: &Utf8Path, sparse: &Utf8Path) -> Result<()> {
        match CheckOutcome::from(self.tools.check_filesystem(raw)?) {
            CheckOutcome::Clean => {}
            CheckOutcome::Corrected => tracing::info!("Filesystem errors in {raw} were corrected"),
            CheckOutcome::Failed(code) => {
                anyhow::bail!("Filesystem check failed with exit code {code}")
            }
        }
        let minimum = self.tools.minimum_size(raw)?;
        let size = target_size(minimum, self.slack);
        tracing::info!("Shrinking {raw} to {size} bytes (minimum {minimum})");
        self.tools.resize_filesystem(raw, size)?;
        // Growing extends the file, shrinking may leave a tail behind
        let f = OpenOptions::new().write(true).open(raw)?;
        if f.metadata()?.len() > size {
            f.set_len(size).context("Truncating raw image")?;
        }
        drop(f);

        let partial = partial_path(sparse);
        let r = self
            .tools
            .raw_to_sparse(raw, &partial)
            .and_then(|()| std::fs::rename(&partial, sparse).map_err(Into::into));
        if r.is_err() {
            let _ = std::fs::remove_file(&partial);
        }
        r.with_context(|| format!("Writing {sparse}"))
    }
}
