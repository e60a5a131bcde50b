//! Serialises a view of the network map into the published JSON document.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::Serialize;
use serde_json::{Map, Value};
use tokio::sync::RwLock;

use crate::error::PublishError;
use crate::sync::NetworkMap;

pub const NUM_NETWORKS_KEY: &str = "num_networks";

/// One consistent read of the network map.
#[derive(Debug, Clone, PartialEq)]
pub struct TopologySnapshot<D> {
    networks: BTreeMap<String, D>,
}

impl<D> TopologySnapshot<D> {
    pub fn new(networks: BTreeMap<String, D>) -> Self {
        Self { networks }
    }

    pub fn network_count(&self) -> usize {
        self.networks.len()
    }
}

impl<D: Clone> TopologySnapshot<D> {
    /// Copies the live map under a short read lock. The engine is never paused for longer.
    pub async fn capture(source: &Arc<RwLock<BTreeMap<String, D>>>) -> Self {
        let networks = source.read().await.clone();
        Self { networks }
    }
}

/// Builds `{"num_networks": N, "<address>": {...}, ...}`.
///
/// Any entry that cannot be serialised fails the whole document so the count
/// always matches the number of entries.
pub fn serialize<D: Serialize>(snapshot: &TopologySnapshot<D>) -> Result<Vec<u8>, PublishError> {
    let mut document = Map::with_capacity(snapshot.networks.len() + 1);
    document.insert(
        NUM_NETWORKS_KEY.to_string(),
        Value::from(snapshot.networks.len()),
    );

    for (address, detail) in &snapshot.networks {
        if address == NUM_NETWORKS_KEY {
            return Err(PublishError::ReservedKey(address.clone()));
        }
        let value = serde_json::to_value(detail).map_err(|source| PublishError::Serialize {
            address: address.clone(),
            source,
        })?;
        document.insert(address.clone(), value);
    }

    serde_json::to_vec(&Value::Object(document)).map_err(|source| PublishError::Serialize {
        address: NUM_NETWORKS_KEY.to_string(),
        source,
    })
}

/// Captures and serialises the engine's map in one step. Used by the query API.
pub async fn render(networks: &NetworkMap) -> Result<Vec<u8>, PublishError> {
    serialize(&TopologySnapshot::capture(networks).await)
}
