use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use axum::{
    extract::State,
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::error::ApiError;
use crate::snapshot;
use crate::sync::SyncEngine;

/// On-demand access to the engine's network map.
#[async_trait]
pub trait QueryApi: Send + Sync {
    /// Starts listening and returns without blocking.
    async fn run(&self, port: u16) -> Result<SocketAddr, ApiError>;

    /// Stops the listener and waits for the server task. Idempotent.
    async fn shutdown(&self);
}

pub struct NetworkInfoApi {
    engine: Arc<dyn SyncEngine>,
    shutdown: CancellationToken,
    server: Mutex<Option<JoinHandle<()>>>,
}

impl NetworkInfoApi {
    pub fn new(engine: Arc<dyn SyncEngine>) -> Self {
        Self {
            engine,
            shutdown: CancellationToken::new(),
            server: Mutex::new(None),
        }
    }

    fn router(&self) -> Router {
        Router::new()
            .route("/json", get(json_handler))
            .route("/healthz", get(healthz_handler))
            .with_state(Arc::clone(&self.engine))
    }
}

impl Drop for NetworkInfoApi {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

// Same document the snapshot publisher writes.
async fn json_handler(State(engine): State<Arc<dyn SyncEngine>>) -> Response {
    match snapshot::render(&engine.networks()).await {
        Ok(body) => ([(header::CONTENT_TYPE, "application/json")], body).into_response(),
        Err(err) => {
            error!(error = %err, "failed to render network infos");
            (StatusCode::INTERNAL_SERVER_ERROR, err.to_string()).into_response()
        }
    }
}

// 200 once the engine has synced at least one block window, otherwise 503.
async fn healthz_handler(State(engine): State<Arc<dyn SyncEngine>>) -> impl IntoResponse {
    if engine.sync_status().synced_block.is_some() {
        (StatusCode::OK, "ok")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "not synced")
    }
}

#[async_trait]
impl QueryApi for NetworkInfoApi {
    async fn run(&self, port: u16) -> Result<SocketAddr, ApiError> {
        let bind = SocketAddr::from(([0, 0, 0, 0], port));
        let listener = TcpListener::bind(bind).await.map_err(|source| ApiError::Bind {
            addr: bind.to_string(),
            source,
        })?;
        let local = listener.local_addr().map_err(|source| ApiError::Bind {
            addr: bind.to_string(),
            source,
        })?;

        let app = self.router();
        let signal = self.shutdown.clone().cancelled_owned();
        let handle = tokio::spawn(async move {
            if let Err(err) = axum::serve(listener, app)
                .with_graceful_shutdown(signal)
                .await
            {
                error!(error = %err, "query API server failed");
            }
        });
        *self.server.lock().await = Some(handle);

        info!(addr = %local, "Query API listening");
        Ok(local)
    }

    async fn shutdown(&self) {
        self.shutdown.cancel();
        if let Some(handle) = self.server.lock().await.take() {
            if let Err(err) = handle.await {
                error!(error = %err, "query API task aborted");
            }
            info!("Query API stopped");
        }
    }
}
