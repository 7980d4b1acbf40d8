use std::path::PathBuf;

use anyhow::Result;

/// Environment variable holding a reference to our original binary
pub const ORIG: &str = "_ROOTPATCH_ORIG_EXE";

/// Return the path to our own executable. A caller which copied the
/// binary elsewhere before re-executing can point us back at the
/// original through [`ORIG`].
pub fn executable_path() -> Result<PathBuf> {
    if let Some(p) = std::env::var_os(ORIG) {
        Ok(p.into())
    } else {
        std::env::current_exe().map_err(Into::into)
    }
}
