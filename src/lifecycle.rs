//! Startup and teardown ordering for the sync engine, query API and snapshot
//! publisher.
//!
//! Startup: RPC connectivity, engine, query API, publisher, then block on the
//! engine. Teardown runs exactly once on every exit path: publisher (waits for
//! its checkpoint), engine (closes its RPC usage), query API listener.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::{JoinError, JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::api::{NetworkInfoApi, QueryApi};
use crate::config::{Config, PublishSettings};
use crate::error::{LifecycleError, SyncError};
use crate::publish::AtomicFilePublisher;
use crate::publish_loop::{PublishLoop, PublishStats};
use crate::rpc::RpcClient;
use crate::sync::{RpcSyncEngine, SyncEngine};

/// Transitions only move forward; `Stopped` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LifecycleState {
    NotStarted,
    Running,
    StoppingRequested,
    Stopped,
}

/// How a successful run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// Interrupt or programmatic stop request.
    Interrupted,
    /// The engine returned on its own.
    Completed,
}

#[derive(Default)]
struct Supervised {
    publisher: Option<JoinHandle<PublishStats>>,
    engine: Option<JoinHandle<Result<(), SyncError>>>,
}

enum Wake {
    Interrupted,
    EngineExited(Result<Result<(), SyncError>, JoinError>),
}

pub struct ServiceLifecycle {
    engine: Arc<dyn SyncEngine>,
    api: Arc<dyn QueryApi>,
    port: u16,
    publish: Option<PublishSettings>,
    state: watch::Sender<LifecycleState>,
    shutdown: CancellationToken,
    started: AtomicBool,
    torn_down: AtomicBool,
}

impl ServiceLifecycle {
    /// Connects to the node and builds the engine and query API on top of it.
    ///
    /// Fails without constructing anything when the node is unreachable.
    pub async fn connect(config: &Config) -> Result<Self, LifecycleError> {
        let rpc = RpcClient::connect(config.eth_rpc.as_str())
            .await
            .map_err(|source| LifecycleError::Connectivity {
                endpoint: config.eth_rpc.clone(),
                source,
            })?;

        let engine: Arc<dyn SyncEngine> = Arc::new(RpcSyncEngine::new(
            rpc,
            config.registry_address,
            config.start_block,
            config.poll_interval,
        ));
        let api = Arc::new(NetworkInfoApi::new(Arc::clone(&engine)));

        Ok(Self::new(engine, api, config.port, config.publish.clone()))
    }

    pub fn new(
        engine: Arc<dyn SyncEngine>,
        api: Arc<dyn QueryApi>,
        port: u16,
        publish: Option<PublishSettings>,
    ) -> Self {
        let (state, _) = watch::channel(LifecycleState::NotStarted);
        Self {
            engine,
            api,
            port,
            publish,
            state,
            shutdown: CancellationToken::new(),
            started: AtomicBool::new(false),
            torn_down: AtomicBool::new(false),
        }
    }

    pub fn state(&self) -> LifecycleState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<LifecycleState> {
        self.state.subscribe()
    }

    /// Cancelling this token has the same effect as the interrupt future resolving.
    pub fn stop_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Runs until `interrupt` resolves, a stop is requested, or the engine
    /// exits. Teardown has completed by the time this returns.
    ///
    /// A lifecycle runs at most once; later calls fail without touching the
    /// engine or the query API.
    pub async fn run<F>(&self, interrupt: F) -> Result<RunOutcome, LifecycleError>
    where
        F: Future<Output = ()>,
    {
        if self.started.swap(true, Ordering::SeqCst) || self.state() != LifecycleState::NotStarted {
            return Err(LifecycleError::AlreadyStarted(self.state()));
        }

        let mut tasks = Supervised::default();
        let outcome = self.drive(&mut tasks, interrupt).await;
        if let Err(err) = &outcome {
            error!(error = %err, "metrics backend failed");
        }
        self.teardown(tasks).await;
        outcome
    }

    async fn drive<F>(&self, tasks: &mut Supervised, interrupt: F) -> Result<RunOutcome, LifecycleError>
    where
        F: Future<Output = ()>,
    {
        let addr = self.api.run(self.port).await?;
        info!("Running metrics endpoint at http://localhost:{}/json", addr.port());

        if let Some(settings) = &self.publish {
            let sink = Arc::new(AtomicFilePublisher::new(
                &settings.output_file,
                &settings.temp_file,
            ));
            let publish_loop = PublishLoop::new(self.engine.networks(), sink, settings.interval);
            tasks.publisher = Some(tokio::spawn(publish_loop.run(self.shutdown.child_token())));
        }

        let engine = Arc::clone(&self.engine);
        let mut engine_task = tokio::spawn(async move { engine.run().await });
        self.advance(LifecycleState::Running);
        info!("Raiden metrics backend running");

        let wake = tokio::select! {
            joined = &mut engine_task => Wake::EngineExited(joined),
            _ = interrupt => Wake::Interrupted,
            _ = self.shutdown.cancelled() => Wake::Interrupted,
        };

        match wake {
            Wake::Interrupted => {
                info!("Exiting...");
                tasks.engine = Some(engine_task);
                Ok(RunOutcome::Interrupted)
            }
            Wake::EngineExited(Ok(Ok(()))) => {
                info!("Sync engine finished");
                Ok(RunOutcome::Completed)
            }
            Wake::EngineExited(Ok(Err(err))) => Err(err.into()),
            Wake::EngineExited(Err(join_err)) => {
                Err(LifecycleError::EngineAborted(join_err.to_string()))
            }
        }
    }

    async fn teardown(&self, tasks: Supervised) {
        if self.torn_down.swap(true, Ordering::SeqCst) {
            return;
        }
        self.advance(LifecycleState::StoppingRequested);
        info!("Stopping Raiden Metrics Backend");

        self.shutdown.cancel();
        if let Some(publisher) = tasks.publisher {
            if let Err(err) = publisher.await {
                warn!(error = %err, "snapshot publisher task aborted");
            }
        }

        self.engine.stop();
        if let Some(engine) = tasks.engine {
            match engine.await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => warn!(error = %err, "sync engine failed while stopping"),
                Err(err) => warn!(error = %err, "sync engine task aborted"),
            }
        }

        self.api.shutdown().await;
        self.advance(LifecycleState::Stopped);
        info!("Metrics backend stopped");
    }

    fn advance(&self, next: LifecycleState) {
        self.state.send_if_modified(|current| {
            if next > *current {
                *current = next;
                true
            } else {
                false
            }
        });
    }
}

impl Drop for ServiceLifecycle {
    // Covers a `run` future dropped mid-flight: stop whatever is still going.
    fn drop(&mut self) {
        if !self.torn_down.swap(true, Ordering::SeqCst) {
            self.shutdown.cancel();
            self.engine.stop();
        }
    }
}
