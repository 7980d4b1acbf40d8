//! Host configuration, read from TOML.
//!
//! Every key is optional; an absent file means all defaults.

use std::time::Duration;

use anyhow::{Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use fn_error_context::context;
use rootpatch_utils::Retry;
use serde::Deserialize;

/// Consulted when neither `--config` nor the environment names a file.
const DEFAULT_CONFIG_PATH: &str = "/etc/rootpatch/config.toml";
/// Overrides [`DEFAULT_CONFIG_PATH`].
const CONFIG_ENV: &str = "ROOTPATCH_CONFIG";

const MIB: u64 = 1024 * 1024;

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields, rename_all = "kebab-case", default)]
pub(crate) struct Config {
    /// The overlay tool, as an argv prefix.
    pub(crate) collaborator: Vec<String>,
    /// Free space left in a re-encoded sparse image.
    pub(crate) sparse_slack: String,
    /// Space added around the root filesystem in a temporary container.
    pub(crate) container_slack: String,
    pub(crate) root_partition: u32,
    pub(crate) efi_partition: u32,
    pub(crate) loop_attempts: u32,
    pub(crate) loop_backoff_ms: u64,
    pub(crate) settle_timeout_secs: u64,
    /// Shell used by the interactive debug modes.
    pub(crate) shell: String,
    /// Where decoded and container intermediates go; next to the image if unset.
    pub(crate) work_dir: Option<Utf8PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            collaborator: vec!["overlay-apply".into()],
            sparse_slack: "256M".into(),
            container_slack: "4M".into(),
            root_partition: 1,
            efi_partition: 2,
            loop_attempts: 3,
            loop_backoff_ms: 500,
            settle_timeout_secs: 10,
            shell: "/bin/bash".into(),
            work_dir: None,
        }
    }
}

impl Config {
    /// Parse and validate a configuration document.
    pub(crate) fn parse(s: &str) -> Result<Self> {
        let config: Self = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    /// Load from `path`, else `$ROOTPATCH_CONFIG`, else the default
    /// location; only the default location may be absent.
    pub(crate) fn load(path: Option<&Utf8Path>) -> Result<Self> {
        let env = std::env::var(CONFIG_ENV).ok().map(Utf8PathBuf::from);
        match path.map(ToOwned::to_owned).or(env) {
            Some(p) => Self::load_from(&p),
            None if Utf8Path::new(DEFAULT_CONFIG_PATH).exists() => {
                Self::load_from(Utf8Path::new(DEFAULT_CONFIG_PATH))
            }
            None => {
                tracing::debug!("No configuration file; using defaults");
                Ok(Self::default())
            }
        }
    }

    #[context("Loading configuration from {path}")]
    fn load_from(path: &Utf8Path) -> Result<Self> {
        let s = std::fs::read_to_string(path)?;
        Self::parse(&s)
    }

    fn validate(&self) -> Result<()> {
        anyhow::ensure!(!self.collaborator.is_empty(), "collaborator must not be empty");
        anyhow::ensure!(self.root_partition > 0, "root-partition must be at least 1");
        anyhow::ensure!(self.efi_partition > 0, "efi-partition must be at least 1");
        anyhow::ensure!(self.loop_attempts > 0, "loop-attempts must be at least 1");
        self.sparse_slack_bytes()?;
        self.container_slack_bytes()?;
        Ok(())
    }

    pub(crate) fn sparse_slack_bytes(&self) -> Result<u64> {
        let mib = rootpatch_blockdev::parse_size_mib(&self.sparse_slack)
            .with_context(|| format!("Parsing sparse-slack {:?}", self.sparse_slack))?;
        Ok(mib * MIB)
    }

    pub(crate) fn container_slack_bytes(&self) -> Result<u64> {
        let mib = rootpatch_blockdev::parse_size_mib(&self.container_slack)
            .with_context(|| format!("Parsing container-slack {:?}", self.container_slack))?;
        Ok(mib * MIB)
    }

    pub(crate) fn retry(&self) -> Retry {
        Retry {
            attempts: self.loop_attempts,
            backoff: Duration::from_millis(self.loop_backoff_ms),
        }
    }

    pub(crate) fn settle_timeout(&self) -> Duration {
        Duration::from_secs(self.settle_timeout_secs)
    }
}
