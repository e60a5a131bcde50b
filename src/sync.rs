//! Token network registry synchronisation.
//!
//! The engine is the sole writer of the network map. Everything else (the
//! query API, the snapshot publisher) only takes read locks on it.

use std::collections::BTreeMap;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use alloy_primitives::{Address, B256};
use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::RwLock;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::LOG_BLOCK_WINDOW;
use crate::error::{RpcError, SyncError};
use crate::rpc::{hex_to_u64, RpcClient};

/// Everything known about one token network.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct NetworkDetail {
    pub token_address: String,
    pub created_block: u64,
    pub created_tx: String,
    pub events_seen: u64,
    pub last_event_block: Option<u64>,
}

/// Network address (checksummed) to detail. Written by the engine, read by everyone else.
pub type NetworkMap = Arc<RwLock<BTreeMap<String, NetworkDetail>>>;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SyncStatus {
    /// Highest block fully processed, `None` before the first window.
    pub synced_block: Option<u64>,
    pub latest_block: Option<u64>,
}

#[async_trait]
pub trait SyncEngine: Send + Sync {
    /// Runs until `stop` is called or a fatal error occurs.
    async fn run(&self) -> Result<(), SyncError>;

    /// Non-blocking. Makes `run` return and release its connections.
    fn stop(&self);

    fn networks(&self) -> NetworkMap;

    fn sync_status(&self) -> SyncStatus;
}

/// Polls a JSON-RPC node for registry and token network logs.
pub struct RpcSyncEngine {
    rpc: RpcClient,
    registry: Address,
    poll_interval: Duration,
    next_block: AtomicU64,
    synced_block: AtomicU64,
    latest_block: AtomicU64,
    networks: NetworkMap,
    shutdown: CancellationToken,
}

const UNKNOWN: u64 = u64::MAX;

impl RpcSyncEngine {
    pub fn new(rpc: RpcClient, registry: Address, start_block: u64, poll_interval: Duration) -> Self {
        Self {
            rpc,
            registry,
            poll_interval,
            next_block: AtomicU64::new(start_block),
            synced_block: AtomicU64::new(UNKNOWN),
            latest_block: AtomicU64::new(UNKNOWN),
            networks: Arc::new(RwLock::new(BTreeMap::new())),
            shutdown: CancellationToken::new(),
        }
    }

    /// One polling iteration. The window only advances when every call succeeded.
    async fn sync_once(&self) -> Result<(), RpcError> {
        let latest = self.rpc.block_number().await?;
        self.latest_block.store(latest, Ordering::Relaxed);

        let from = self.next_block.load(Ordering::Relaxed);
        if from > latest {
            return Ok(());
        }
        let to = latest.min(from + LOG_BLOCK_WINDOW - 1);

        let registry_logs = self
            .rpc
            .logs(&[self.registry.to_checksum(None)], from, to)
            .await?;
        let created: Vec<(String, NetworkDetail)> =
            registry_logs.iter().filter_map(network_created).collect();

        let mut known: Vec<String> = self.networks.read().await.keys().cloned().collect();
        known.extend(created.iter().map(|(address, _)| address.clone()));
        let network_logs = if known.is_empty() {
            Vec::new()
        } else {
            self.rpc.logs(&known, from, to).await?
        };

        let mut guard = self.networks.write().await;
        for (address, detail) in created {
            info!(network = %address, token = %detail.token_address, "Found token network");
            guard.entry(address).or_insert(detail);
        }
        for log in &network_logs {
            let Some((address, block)) = log_origin(log) else {
                continue;
            };
            if let Some(detail) = guard.get_mut(&address) {
                detail.events_seen += 1;
                detail.last_event_block = Some(detail.last_event_block.map_or(block, |b| b.max(block)));
            }
        }
        drop(guard);

        self.next_block.store(to + 1, Ordering::Relaxed);
        self.synced_block.store(to, Ordering::Relaxed);
        debug!(from, to, latest, events = network_logs.len(), "synced block window");
        Ok(())
    }
}

#[async_trait]
impl SyncEngine for RpcSyncEngine {
    async fn run(&self) -> Result<(), SyncError> {
        info!(
            registry = %self.registry,
            start_block = self.next_block.load(Ordering::Relaxed),
            "Starting sync engine"
        );

        let mut ticker = tokio::time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }

            // In-flight requests are dropped on stop.
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                result = self.sync_once() => {
                    if let Err(err) = result {
                        warn!(error = %err, "sync poll failed");
                    }
                }
            }
        }

        info!("Sync engine stopped");
        Ok(())
    }

    fn stop(&self) {
        self.shutdown.cancel();
    }

    fn networks(&self) -> NetworkMap {
        Arc::clone(&self.networks)
    }

    fn sync_status(&self) -> SyncStatus {
        let known = |v: u64| (v != UNKNOWN).then_some(v);
        SyncStatus {
            synced_block: known(self.synced_block.load(Ordering::Relaxed)),
            latest_block: known(self.latest_block.load(Ordering::Relaxed)),
        }
    }
}

fn topic_address(topic: &Value) -> Option<Address> {
    let word = B256::from_str(topic.as_str()?).ok()?;
    Some(Address::from_word(word))
}

/// Registry logs with two indexed address topics announce a new token network.
fn network_created(log: &Value) -> Option<(String, NetworkDetail)> {
    let topics = log.get("topics")?.as_array()?;
    if topics.len() < 3 {
        return None;
    }
    let token = topic_address(&topics[1])?;
    let network = topic_address(&topics[2])?;
    let block = hex_to_u64(log.get("blockNumber")?.as_str()?).ok()?;
    let tx = log
        .get("transactionHash")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();

    Some((
        network.to_checksum(None),
        NetworkDetail {
            token_address: token.to_checksum(None),
            created_block: block,
            created_tx: tx,
            ..NetworkDetail::default()
        },
    ))
}

fn log_origin(log: &Value) -> Option<(String, u64)> {
    let address = Address::from_str(log.get("address")?.as_str()?).ok()?;
    let block = hex_to_u64(log.get("blockNumber")?.as_str()?).ok()?;
    Some((address.to_checksum(None), block))
}
