//! The inevitable catchall "utils" crate. Generally only add
//! things here that only depend on the standard library and
//! "core" crates.
//!
mod command;
pub use command::*;
mod tracing_util;
pub use tracing_util::*;
/// Locating our own executable
pub mod reexec;
mod retry;
pub use retry::*;
