//! Periodic snapshot publication.

use std::collections::BTreeMap;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{FailureKind, PublishError};
use crate::publish::SnapshotSink;
use crate::snapshot::{self, TopologySnapshot};

/// Outcome of one cycle, for logging.
#[derive(Debug)]
pub enum PublishCycleResult {
    Written { bytes: u64, path: PathBuf },
    Failed(PublishError),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PublishStats {
    pub attempts: u64,
    pub published: u64,
    pub failed: u64,
}

/// Serialises the live map and publishes it every `interval` until cancelled.
///
/// Cancellation is observed between phases and during the sleep, never in the
/// middle of a serialise or a publish.
pub struct PublishLoop<D> {
    source: Arc<RwLock<BTreeMap<String, D>>>,
    sink: Arc<dyn SnapshotSink>,
    interval: Duration,
}

impl<D> PublishLoop<D>
where
    D: Serialize + Clone + Send + Sync + 'static,
{
    pub fn new(
        source: Arc<RwLock<BTreeMap<String, D>>>,
        sink: Arc<dyn SnapshotSink>,
        interval: Duration,
    ) -> Self {
        Self {
            source,
            sink,
            interval,
        }
    }

    pub async fn run(self, shutdown: CancellationToken) -> PublishStats {
        let mut stats = PublishStats::default();
        info!(
            path = %self.sink.target().display(),
            interval_secs = self.interval.as_secs_f64(),
            "Starting snapshot publisher"
        );

        while !shutdown.is_cancelled() {
            match self.cycle(&shutdown).await {
                Some(PublishCycleResult::Written { bytes, path }) => {
                    stats.attempts += 1;
                    stats.published += 1;
                    info!(path = %path.display(), bytes, "Wrote network infos");
                }
                Some(PublishCycleResult::Failed(err)) => {
                    stats.attempts += 1;
                    stats.failed += 1;
                    match err.failure_kind() {
                        Some(kind) => warn!(%kind, error = %err, "snapshot publish failed"),
                        None => warn!(error = %err, "snapshot serialization failed"),
                    }
                }
                None => break,
            }

            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(self.interval) => {}
            }
        }

        info!(
            attempts = stats.attempts,
            published = stats.published,
            failed = stats.failed,
            "Snapshot publisher stopped"
        );
        stats
    }

    /// One capture, serialise, publish pass. `None` when cancelled at a checkpoint.
    pub async fn cycle(&self, shutdown: &CancellationToken) -> Option<PublishCycleResult> {
        let snapshot = TopologySnapshot::capture(&self.source).await;
        debug!(networks = snapshot.network_count(), "captured topology snapshot");

        let bytes = match snapshot::serialize(&snapshot) {
            Ok(bytes) => bytes,
            Err(err) => return Some(PublishCycleResult::Failed(err)),
        };

        if shutdown.is_cancelled() {
            return None;
        }

        let sink = Arc::clone(&self.sink);
        let path = sink.target().to_path_buf();
        let result = tokio::task::spawn_blocking(move || sink.publish(&bytes))
            .await
            .unwrap_or_else(|join_err| {
                Err(PublishError::Io {
                    kind: FailureKind::TempWriteFailed,
                    path: path.clone(),
                    source: io::Error::other(join_err),
                })
            });

        Some(match result {
            Ok(bytes) => PublishCycleResult::Written { bytes, path },
            Err(err) => PublishCycleResult::Failed(err),
        })
    }
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::path::Path;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::time::Instant;

    use serde_json::{json, Value};
    use tempfile::TempDir;

    use super::*;
    use crate::publish::AtomicFilePublisher;

    type Source = Arc<RwLock<BTreeMap<String, Value>>>;

    /// Fails every call whose 1-based index is in `fail_on` with a full disk.
    struct FlakySink {
        inner: AtomicFilePublisher,
        calls: AtomicU64,
        fail_on: Vec<u64>,
    }

    impl SnapshotSink for FlakySink {
        fn publish(&self, bytes: &[u8]) -> Result<u64, PublishError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if self.fail_on.contains(&call) {
                return Err(PublishError::Io {
                    kind: FailureKind::DiskFull,
                    path: self.inner.target().to_path_buf(),
                    source: io::Error::from(io::ErrorKind::StorageFull),
                });
            }
            self.inner.publish(bytes)
        }

        fn target(&self) -> &Path {
            self.inner.target()
        }
    }

    fn read_doc(path: &Path) -> Value {
        serde_json::from_slice(&fs::read(path).unwrap()).unwrap()
    }

    fn publish_loop(dir: &TempDir, interval: Duration) -> (Source, PathBuf, PublishLoop<Value>) {
        let source: Source = Default::default();
        let output = dir.path().join("network-info.json");
        let sink = Arc::new(AtomicFilePublisher::new(&output, "tmp.json"));
        let publish_loop = PublishLoop::new(Arc::clone(&source), sink, interval);
        (source, output, publish_loop)
    }

    #[tokio::test]
    async fn first_cycle_publishes_empty_map() {
        let dir = TempDir::new().unwrap();
        let (_source, output, publish_loop) = publish_loop(&dir, Duration::from_secs(60));

        let result = publish_loop.cycle(&CancellationToken::new()).await.unwrap();
        assert!(matches!(result, PublishCycleResult::Written { bytes: 18, .. }));
        assert_eq!(fs::read(&output).unwrap(), br#"{"num_networks":0}"#);
    }

    #[tokio::test]
    async fn two_networks_are_published_with_their_count() {
        let dir = TempDir::new().unwrap();
        let (source, output, publish_loop) = publish_loop(&dir, Duration::from_secs(60));
        {
            let mut map = source.write().await;
            map.insert("0xAAA".into(), json!({"channels": 1}));
            map.insert("0xBBB".into(), json!({"channels": 2, "deposits": "10"}));
        }

        publish_loop.cycle(&CancellationToken::new()).await.unwrap();
        let doc = read_doc(&output);
        let obj = doc.as_object().unwrap();
        assert_eq!(obj.len(), 3);
        assert_eq!(doc["num_networks"], json!(2));
        assert_eq!(doc["0xBBB"]["deposits"], json!("10"));
    }

    #[tokio::test]
    async fn failed_cycle_keeps_last_good_file_and_next_cycle_recovers() {
        let dir = TempDir::new().unwrap();
        let output = dir.path().join("network-info.json");
        let source: Source = Default::default();
        let sink = Arc::new(FlakySink {
            inner: AtomicFilePublisher::new(&output, "tmp.json"),
            calls: AtomicU64::new(0),
            fail_on: vec![3],
        });
        let publish_loop = PublishLoop::new(Arc::clone(&source), sink, Duration::from_secs(60));
        let token = CancellationToken::new();

        for cycle in 1..=4u64 {
            source
                .write()
                .await
                .insert(format!("0x{cycle:03}"), json!({ "cycle": cycle }));
            let result = publish_loop.cycle(&token).await.unwrap();

            let doc = read_doc(&output);
            match cycle {
                3 => {
                    assert!(matches!(
                        result,
                        PublishCycleResult::Failed(ref e) if e.failure_kind() == Some(FailureKind::DiskFull)
                    ));
                    assert_eq!(doc["num_networks"], json!(2));
                }
                _ => {
                    assert!(matches!(result, PublishCycleResult::Written { .. }));
                    assert_eq!(doc["num_networks"], json!(cycle));
                }
            }
        }

        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 1);
    }

    #[tokio::test]
    async fn cancelled_before_publish_leaves_file_alone() {
        let dir = TempDir::new().unwrap();
        let (_source, output, publish_loop) = publish_loop(&dir, Duration::from_secs(60));
        let token = CancellationToken::new();
        token.cancel();

        assert!(publish_loop.cycle(&token).await.is_none());
        assert!(!output.exists());
    }

    #[tokio::test]
    async fn runs_about_once_per_interval() {
        let dir = TempDir::new().unwrap();
        let interval = Duration::from_millis(100);
        let (_source, _output, publish_loop) = publish_loop(&dir, interval);
        let token = CancellationToken::new();

        let handle = tokio::spawn(publish_loop.run(token.clone()));
        tokio::time::sleep(interval * 5 + Duration::from_millis(20)).await;
        token.cancel();
        let stats = handle.await.unwrap();

        assert!(
            (4..=6).contains(&stats.attempts),
            "unexpected attempt count {}",
            stats.attempts
        );
        assert_eq!(stats.failed, 0);
    }

    #[tokio::test]
    async fn stop_during_sleep_returns_promptly() {
        let dir = TempDir::new().unwrap();
        let (_source, output, publish_loop) = publish_loop(&dir, Duration::from_secs(3600));
        let token = CancellationToken::new();

        let handle = tokio::spawn(publish_loop.run(token.clone()));
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(output.exists());

        let stopped_at = Instant::now();
        token.cancel();
        let stats = tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("loop ignored the stop signal")
            .unwrap();

        assert!(stopped_at.elapsed() < Duration::from_millis(500));
        assert_eq!(stats.attempts, 1);
    }
}
