//! On-disk configuration for the engine.

use std::fs;

use anyhow::{Context, Result, anyhow};
use camino::{Utf8Path, Utf8PathBuf};
use serde_derive::Deserialize;

use crate::walk;

fn default_workers() -> usize {
    walk::DEFAULT_WORKERS
}

fn default_cdp_delay() -> u64 {
    1
}

/// The engine's on-disk record: server, credentials, cache, filters.
///
/// The device credential (`aname`/`apass`) is the random 16-character pair
/// handed out when the device was provisioned against the account; every
/// request authenticates with it over basic auth.
#[derive(Debug, Deserialize)]
pub struct Configuration {
    /// API host, e.g. `api.example.com` (TLS assumed) or a full URL.
    pub api_host: String,

    pub aname: String,
    pub apass: String,

    /// Scope history commits to a user instead of the bare device.
    #[serde(default)]
    pub user: Option<String>,

    /// Defaults to the hostname.
    #[serde(default)]
    pub device_name: Option<String>,

    pub cache_path: Utf8PathBuf,

    #[serde(default = "default_workers")]
    pub workers: usize,

    /// Roots to back up.
    pub roots: Vec<Utf8PathBuf>,

    #[serde(default)]
    pub skip_paths: Vec<Utf8PathBuf>,

    /// Filename patterns (regex) to skip.
    #[serde(default)]
    pub skip_patterns: Vec<String>,

    /// Filesystem types (e.g. "proc", "sysfs") to skip.
    #[serde(default)]
    pub skip_fstypes: Vec<String>,

    /// Seconds between the first CDP change and the scheduled run.
    #[serde(default = "default_cdp_delay")]
    pub cdp_delay: u64,
}

impl Configuration {
    pub fn device_name(&self) -> Result<String> {
        match &self.device_name {
            Some(n) => Ok(n.clone()),
            None => Ok(hostname::get()
                .context("Couldn't get hostname")?
                .to_string_lossy()
                .into_owned()),
        }
    }
}

pub fn load(explicit: Option<&Utf8Path>) -> Result<Configuration> {
    let confpath = match explicit {
        Some(p) => p.to_owned(),
        None => {
            let mut p: Utf8PathBuf = home::home_dir()
                .ok_or_else(|| anyhow!("Can't find home directory"))?
                .try_into()
                .context("Home directory isn't UTF-8")?;
            p.extend([".config", "offsite.toml"]);
            p
        }
    };
    let s = fs::read_to_string(&confpath)
        .with_context(|| format!("Couldn't open {confpath}"))?;
    let conf = toml::from_str(&s).with_context(|| format!("Couldn't parse {confpath}"))?;
    Ok(conf)
}
