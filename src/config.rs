use std::path::{Path, PathBuf};
use std::time::Duration;

use alloy_primitives::Address;

use crate::cli::Cli;
use crate::error::ConfigError;

// ---- Collector defaults ----

pub const DEFAULT_ETH_RPC: &str = "http://localhost:8545";

// Port of the JSON query endpoint.
pub const DEFAULT_PORT: u16 = 4567;

pub const OUTPUT_FILE: &str = "network-info.json";
pub const TEMP_FILE: &str = "tmp.json";

// Seconds between two snapshot publications.
pub const OUTPUT_PERIOD_SECS: u64 = 10;

// Seconds between two sync polls.
pub const DEFAULT_POLL_INTERVAL_SECS: u64 = 5;

// Upper bound on a single JSON-RPC request, in seconds.
pub const RPC_TIMEOUT_SECS: u64 = 30;

// Largest block range requested in a single eth_getLogs call.
pub const LOG_BLOCK_WINDOW: u64 = 10_000;

// ---- Runtime config ----

/// Where and how often snapshots are written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishSettings {
    pub output_file: PathBuf,
    pub temp_file: PathBuf,
    pub interval: Duration,
}

impl PublishSettings {
    pub fn new(output_file: impl Into<PathBuf>) -> Self {
        Self {
            output_file: output_file.into(),
            temp_file: PathBuf::from(TEMP_FILE),
            interval: Duration::from_secs(OUTPUT_PERIOD_SECS),
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }
}

/// Validated process configuration, handed to the lifecycle coordinator.
#[derive(Debug, Clone)]
pub struct Config {
    pub eth_rpc: String,
    pub registry_address: Address,
    pub start_block: u64,
    pub port: u16,
    pub poll_interval: Duration,
    /// `None` disables the snapshot publisher.
    pub publish: Option<PublishSettings>,
}

impl Config {
    /// Validates every field before anything touches the network.
    pub fn from_cli(cli: &Cli) -> Result<Self, ConfigError> {
        validate_rpc_url(&cli.eth_rpc)?;
        let registry_address = parse_checksum_address(&cli.registry_address)?;

        if cli.start_block < 0 {
            return Err(ConfigError::NegativeStartBlock(cli.start_block));
        }
        if cli.output_period == 0 {
            return Err(ConfigError::ZeroOutputPeriod);
        }
        if cli.poll_interval == 0 {
            return Err(ConfigError::ZeroPollInterval);
        }
        validate_file_path(&cli.output_file)?;
        validate_file_path(&cli.temp_file)?;

        let publish = (!cli.no_publish).then(|| PublishSettings {
            output_file: cli.output_file.clone(),
            temp_file: cli.temp_file.clone(),
            interval: Duration::from_secs(cli.output_period),
        });

        Ok(Config {
            eth_rpc: cli.eth_rpc.clone(),
            registry_address,
            start_block: cli.start_block as u64,
            port: cli.port,
            poll_interval: Duration::from_secs(cli.poll_interval),
            publish,
        })
    }
}

fn validate_rpc_url(url: &str) -> Result<(), ConfigError> {
    let parsed = reqwest::Url::parse(url).map_err(|e| ConfigError::InvalidRpcUrl {
        url: url.to_string(),
        reason: e.to_string(),
    })?;

    match parsed.scheme() {
        "http" | "https" => Ok(()),
        other => Err(ConfigError::InvalidRpcUrl {
            url: url.to_string(),
            reason: format!("unsupported scheme '{other}'"),
        }),
    }
}

/// Accepts only EIP-55 mixed-case addresses.
pub fn parse_checksum_address(addr: &str) -> Result<Address, ConfigError> {
    Address::parse_checksummed(addr, None)
        .map_err(|_| ConfigError::InvalidRegistryAddress(addr.to_string()))
}

fn validate_file_path(path: &Path) -> Result<(), ConfigError> {
    if path.file_name().is_none() {
        return Err(ConfigError::InvalidOutputPath(path.to_path_buf()));
    }
    Ok(())
}
