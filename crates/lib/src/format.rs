//! Classifying an image by its leading bytes.
//!
//! File names and extensions are never consulted.

use std::fs::File;
use std::io::Read;

use anyhow::Result;
use camino::{Utf8Path, Utf8PathBuf};
use serde::Serialize;

use crate::error::ApplyError;

/// Android sparse image magic, stored little-endian at offset 0.
pub(crate) const SPARSE_MAGIC: u32 = 0xED26_FF3A;
const SPARSE_HEADER_LEN: u16 = 28;
const SPARSE_CHUNK_HEADER_LEN: u16 = 12;

const GPT_SIGNATURE: &[u8] = b"EFI PART";
/// The GPT header lives in LBA 1, whose offset depends on the sector size.
const GPT_HEADER_OFFSETS: [usize; 2] = [512, 4096];
const MBR_SIGNATURE_OFFSET: usize = 510;
const MBR_ENTRIES_OFFSET: usize = 446;
const MBR_ENTRY_LEN: usize = 16;
/// ext2/3/4 superblock magic, at byte 56 of the superblock at 1024.
const EXT_MAGIC_OFFSET: usize = 1024 + 56;
const EXT_MAGIC: [u8; 2] = [0x53, 0xEF];

/// Enough to see every signature above.
const PROBE_LEN: usize = 8192;

/// How an image's bytes are laid out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ImageFormat {
    /// A bare filesystem
    Plain,
    /// An Android sparse image wrapping a filesystem
    Sparse,
    /// A partitioned disk (GPT or MBR)
    Disk,
}

impl std::fmt::Display for ImageFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ImageFormat::Plain => "plain",
            ImageFormat::Sparse => "sparse",
            ImageFormat::Disk => "disk",
        };
        f.write_str(s)
    }
}

/// An image whose format has been determined.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ImageHandle {
    pub(crate) path: Utf8PathBuf,
    pub(crate) format: ImageFormat,
    pub(crate) size: u64,
    /// Logical sector size a GPT was written for, when it is not 512.
    pub(crate) sector_size: Option<u32>,
}

fn le_u16(buf: &[u8], off: usize) -> Option<u16> {
    Some(u16::from_le_bytes(buf.get(off..off + 2)?.try_into().ok()?))
}

fn le_u32(buf: &[u8], off: usize) -> Option<u32> {
    Some(u32::from_le_bytes(buf.get(off..off + 4)?.try_into().ok()?))
}

/// The magic plus the fixed header fields every sparse writer emits.
pub(crate) fn is_sparse_header(buf: &[u8]) -> bool {
    let check = || -> Option<bool> {
        Some(
            le_u32(buf, 0)? == SPARSE_MAGIC
                && le_u16(buf, 4)? == 1
                && le_u16(buf, 8)? == SPARSE_HEADER_LEN
                && le_u16(buf, 10)? == SPARSE_CHUNK_HEADER_LEN
                && le_u32(buf, 12).is_some_and(|blk| blk > 0 && blk % 4 == 0),
        )
    };
    check().unwrap_or(false)
}

/// The sector size a GPT header was found at, if any.
fn gpt_sector_size(buf: &[u8]) -> Option<usize> {
    GPT_HEADER_OFFSETS
        .iter()
        .copied()
        .find(|&off| buf.get(off..off + GPT_SIGNATURE.len()) == Some(GPT_SIGNATURE))
}

fn has_gpt(buf: &[u8]) -> bool {
    gpt_sector_size(buf).is_some()
}

fn has_ext_superblock(buf: &[u8]) -> bool {
    buf.get(EXT_MAGIC_OFFSET..EXT_MAGIC_OFFSET + 2) == Some(&EXT_MAGIC[..])
}

/// A boot signature alone also matches FAT boot sectors; require at least
/// one populated partition entry and no malformed ones.
fn has_mbr(buf: &[u8]) -> bool {
    if buf.get(MBR_SIGNATURE_OFFSET..MBR_SIGNATURE_OFFSET + 2) != Some(&[0x55, 0xAA][..]) {
        return false;
    }
    let mut populated = 0;
    for i in 0..4 {
        let off = MBR_ENTRIES_OFFSET + i * MBR_ENTRY_LEN;
        let Some(entry) = buf.get(off..off + MBR_ENTRY_LEN) else {
            return false;
        };
        let (status, parttype) = (entry[0], entry[4]);
        if status != 0x00 && status != 0x80 {
            return false;
        }
        if parttype != 0 {
            populated += 1;
        }
    }
    populated > 0
}

/// Classify the leading bytes of an image.
pub(crate) fn classify(buf: &[u8]) -> ImageFormat {
    if is_sparse_header(buf) {
        ImageFormat::Sparse
    } else if has_gpt(buf) {
        ImageFormat::Disk
    } else if has_ext_superblock(buf) {
        // A filesystem may carry boot code in its first sector
        ImageFormat::Plain
    } else if has_mbr(buf) {
        ImageFormat::Disk
    } else {
        ImageFormat::Plain
    }
}

fn read_head(f: &mut File) -> std::io::Result<Vec<u8>> {
    let mut buf = Vec::with_capacity(PROBE_LEN);
    f.take(PROBE_LEN as u64).read_to_end(&mut buf)?;
    Ok(buf)
}

/// Determine the format of the image at `path`.
pub(crate) fn detect(path: &Utf8Path) -> Result<ImageHandle> {
    let invalid = |reason: String| ApplyError::invalid_image(path, reason);
    let mut f = File::open(path).map_err(|e| invalid(format!("cannot open: {e}")))?;
    let meta = f.metadata().map_err(|e| invalid(format!("cannot stat: {e}")))?;
    if !meta.is_file() {
        return Err(invalid("not a regular file".into()).into());
    }
    if meta.len() == 0 {
        return Err(invalid("image is empty".into()).into());
    }
    let head = read_head(&mut f).map_err(|e| invalid(format!("cannot read: {e}")))?;
    let format = classify(&head);
    let sector_size = match format {
        ImageFormat::Disk => gpt_sector_size(&head)
            .filter(|&s| s != 512)
            .and_then(|s| u32::try_from(s).ok()),
        ImageFormat::Plain | ImageFormat::Sparse => None,
    };
    tracing::debug!("{path}: {format} image of {} bytes", meta.len());
    if let Some(s) = sector_size {
        tracing::debug!("{path}: partition table uses {s}-byte sectors");
    }
    Ok(ImageHandle {
        path: path.to_owned(),
        format,
        size: meta.len(),
        sector_size,
    })
}
