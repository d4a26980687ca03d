use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::daemon::parser::DEFAULT_COOKIE_FIELD;

pub const DEFAULT_SS_BINARY: &str = "ss";
pub const DEFAULT_PROBE_BINARY: &str = "/usr/local/bin/scamper";
pub const DEFAULT_OUTPUT_ROOT: &str = "./scamper_output";
pub const DEFAULT_BOOT_MARKER: &str = "/proc";
/// Loopback and the PlanetLab control network.
pub const DEFAULT_IGNORED_PREFIXES: [&str; 3] = ["127.", "128.112.139.", "::ffff:127.0.0.1"];

/// Runtime settings. Every field has a default, so a JSON file only needs
/// the keys it changes.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub ss_binary: String,
    pub probe_binary: PathBuf,
    pub output_root: PathBuf,
    pub boot_marker: PathBuf,
    pub ignored_prefixes: Vec<String>,
    pub cookie_field: usize,
    pub dedup_ttl_secs: u64,
    pub sweep_interval_secs: u64,
    pub poll_interval_secs: u64,
    pub cycle_cap: usize,
    pub workers: usize,
    pub queue_capacity: usize,
    pub probe_timeout_secs: u64,
    pub short_hostname: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            ss_binary: DEFAULT_SS_BINARY.into(),
            probe_binary: DEFAULT_PROBE_BINARY.into(),
            output_root: DEFAULT_OUTPUT_ROOT.into(),
            boot_marker: DEFAULT_BOOT_MARKER.into(),
            ignored_prefixes: DEFAULT_IGNORED_PREFIXES.iter().map(|p| p.to_string()).collect(),
            cookie_field: DEFAULT_COOKIE_FIELD,
            dedup_ttl_secs: 120,
            sweep_interval_secs: 1,
            poll_interval_secs: 5,
            cycle_cap: 5,
            workers: 10,
            queue_capacity: 10,
            probe_timeout_secs: 60,
            short_hostname: false,
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("cannot read config {}", path.display()))?;
        let config: Config = serde_json::from_str(&raw)
            .with_context(|| format!("invalid config {}", path.display()))?;
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        for (name, value) in [
            ("dedup_ttl_secs", self.dedup_ttl_secs),
            ("sweep_interval_secs", self.sweep_interval_secs),
            ("poll_interval_secs", self.poll_interval_secs),
            ("probe_timeout_secs", self.probe_timeout_secs),
            ("cycle_cap", self.cycle_cap as u64),
            ("workers", self.workers as u64),
            ("queue_capacity", self.queue_capacity as u64),
        ] {
            if value == 0 {
                anyhow::bail!("{name} must be greater than zero");
            }
        }
        if self.cookie_field < 6 {
            anyhow::bail!("cookie_field {} overlaps the address columns", self.cookie_field);
        }
        Ok(())
    }

    pub fn dedup_ttl(&self) -> Duration {
        Duration::from_secs(self.dedup_ttl_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_secs)
    }
}
