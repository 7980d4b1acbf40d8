//! # Root filesystem image customization
//!
//! This crate mounts prebuilt root filesystem images (plain ext4, Android
//! sparse, or partitioned disks), runs an external overlay tool against
//! the mounted root, and writes the result back in the original format.
//! Every loop device, partition mapping and mount acquired along the way
//! is released again, whether the apply succeeded or not.

mod apply;
pub mod cli;
mod config;
mod container;
mod error;
mod flow;
mod format;
mod host;
mod interrupt;
mod overlay;
mod partitions;
mod session;
mod sparse;
mod task;

#[cfg(test)]
mod testutil;

pub use error::{exit_code, ApplyError, TeardownWarning};
pub use flow::DebugMode;
pub use format::ImageFormat;
