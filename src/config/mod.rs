use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::Parser;
use color_eyre::eyre::{eyre, Result};
use serde::Deserialize;
use url::Url;

#[derive(Debug, clap::Parser)]
struct Args {
    #[clap(long, default_value = "event-walker.toml", env = "EVENT_WALKER_CONFIG")]
    config: PathBuf,
}

#[derive(Deserialize, Clone, Debug)]
pub struct Config {
    pub rpc: RpcConfig,
    pub scan: ScanConfig,
}

#[derive(Deserialize, Clone, Debug)]
pub struct RpcConfig {
    pub url: Url,

    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

#[derive(Deserialize, Clone, Debug)]
pub struct ScanConfig {
    pub from_block: u64,

    /// Exclusive. Defaults to the chain tip at startup
    #[serde(default)]
    pub to_block: Option<u64>,

    /// Contract address, with its `0x` prefix
    pub address: String,
    pub event_name: String,

    #[serde(default = "default_workers")]
    pub workers: usize,

    #[serde(default = "default_idle_interval_ms")]
    pub idle_interval_ms: u64,
}

impl Config {
    pub fn read() -> Result<Self> {
        let args = Args::parse();

        Self::read_from(args.config.as_path())
    }

    pub fn read_from(path: &Path) -> Result<Self> {
        let config: Self = toml::from_str(&std::fs::read_to_string(path)?)?;
        config.scan.validate()?;

        Ok(config)
    }
}

impl ScanConfig {
    pub fn idle_interval(&self) -> Duration {
        Duration::from_millis(self.idle_interval_ms)
    }

    fn validate(&self) -> Result<()> {
        if self.workers == 0 {
            return Err(eyre!("scan.workers must be greater than 0"));
        }

        if self.address.len() < 2 {
            return Err(eyre!("scan.address {:?} is missing its prefix", self.address));
        }

        if let Some(to) = self.to_block {
            if to < self.from_block {
                return Err(eyre!(
                    "scan.to_block {} is before scan.from_block {}",
                    to,
                    self.from_block
                ));
            }
        }

        Ok(())
    }
}

fn default_timeout_secs() -> u64 {
    30
}

fn default_workers() -> usize {
    10
}

fn default_idle_interval_ms() -> u64 {
    3000
}
