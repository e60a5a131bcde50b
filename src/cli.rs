use std::path::PathBuf;

use clap::Parser;

use crate::config::{
    DEFAULT_ETH_RPC, DEFAULT_POLL_INTERVAL_SECS, DEFAULT_PORT, OUTPUT_FILE, OUTPUT_PERIOD_SECS,
    TEMP_FILE,
};

/// Every flag can also be set through an `EXPLORER_*` environment variable.
#[derive(Parser, Debug, Clone)]
#[command(
    name = "raiden-metrics",
    version,
    about = "Token network topology collector and JSON snapshot publisher"
)]
pub struct Cli {
    /// Ethereum node RPC URI
    #[arg(long, env = "EXPLORER_ETH_RPC", default_value = DEFAULT_ETH_RPC)]
    pub eth_rpc: String,

    /// Address of the token network registry (EIP-55 checksummed)
    #[arg(long, env = "EXPLORER_REGISTRY_ADDRESS")]
    pub registry_address: String,

    /// Block to start syncing at
    #[arg(long, env = "EXPLORER_START_BLOCK", default_value_t = 0, allow_negative_numbers = true)]
    pub start_block: i64,

    /// Port of the JSON query endpoint
    #[arg(long, env = "EXPLORER_PORT", default_value_t = DEFAULT_PORT)]
    pub port: u16,

    /// File the topology snapshot is published to
    #[arg(long, env = "EXPLORER_OUTPUT_FILE", default_value = OUTPUT_FILE)]
    pub output_file: PathBuf,

    /// Name of the temporary file, created next to the output file
    #[arg(long, env = "EXPLORER_TEMP_FILE", default_value = TEMP_FILE)]
    pub temp_file: PathBuf,

    /// Seconds between two snapshot publications
    #[arg(long, env = "EXPLORER_OUTPUT_PERIOD", default_value_t = OUTPUT_PERIOD_SECS)]
    pub output_period: u64,

    /// Seconds between two sync polls against the node
    #[arg(long, env = "EXPLORER_POLL_INTERVAL", default_value_t = DEFAULT_POLL_INTERVAL_SECS)]
    pub poll_interval: u64,

    /// Do not write snapshots to disk, only serve the query API
    #[arg(long, env = "EXPLORER_NO_PUBLISH")]
    pub no_publish: bool,

    /// Emit logs as JSON lines
    #[arg(long, env = "EXPLORER_LOG_JSON")]
    pub log_json: bool,
}
