use std::io;
use std::path::PathBuf;

use crate::lifecycle::LifecycleState;

/// Rejected configuration. Raised before any connection attempt.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("provided RPC endpoint is not a valid URL '{url}': {reason}")]
    InvalidRpcUrl { url: String, reason: String },
    #[error("provided registry address is not a valid checksum address: {0}")]
    InvalidRegistryAddress(String),
    #[error("provided start block is not valid: {0}")]
    NegativeStartBlock(i64),
    #[error("output period must be greater than zero")]
    ZeroOutputPeriod,
    #[error("poll interval must be greater than zero")]
    ZeroPollInterval,
    #[error("output file path must name a file: '{0}'")]
    InvalidOutputPath(PathBuf),
}

#[derive(Debug, thiserror::Error)]
pub enum RpcError {
    #[error("rpc http request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("rpc error: {0}")]
    Remote(String),
    #[error("rpc response missing result")]
    MissingResult,
    #[error("{method} returned an unexpected result: {detail}")]
    UnexpectedResult { method: &'static str, detail: String },
    #[error("invalid hex quantity '{0}'")]
    InvalidQuantity(String),
}

#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error(transparent)]
    Rpc(#[from] RpcError),
    #[error("sync engine failed: {0}")]
    Fatal(String),
}

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("failed to bind query API listener on {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },
}

/// Why a single publish attempt was abandoned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    DiskFull,
    PermissionDenied,
    TempWriteFailed,
    RenameFailed,
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            FailureKind::DiskFull => "disk full",
            FailureKind::PermissionDenied => "permission denied",
            FailureKind::TempWriteFailed => "temporary write failed",
            FailureKind::RenameFailed => "rename failed",
        };
        f.write_str(name)
    }
}

/// A failed publish cycle. Always recoverable: the loop retries next cycle.
#[derive(Debug, thiserror::Error)]
pub enum PublishError {
    #[error("failed to serialize network {address}: {source}")]
    Serialize {
        address: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("network address collides with reserved key '{0}'")]
    ReservedKey(String),
    #[error("{kind} while publishing {}: {source}", path.display())]
    Io {
        kind: FailureKind,
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl PublishError {
    /// Filesystem failure kind, `None` for serialization failures.
    pub fn failure_kind(&self) -> Option<FailureKind> {
        match self {
            PublishError::Io { kind, .. } => Some(*kind),
            _ => None,
        }
    }

    /// Classifies an I/O error raised while staging the temporary file.
    pub(crate) fn staging(path: PathBuf, source: io::Error) -> Self {
        let kind = match source.kind() {
            io::ErrorKind::StorageFull => FailureKind::DiskFull,
            io::ErrorKind::PermissionDenied => FailureKind::PermissionDenied,
            _ => FailureKind::TempWriteFailed,
        };
        PublishError::Io { kind, path, source }
    }

    /// Classifies an I/O error raised by the final rename.
    pub(crate) fn rename(path: PathBuf, source: io::Error) -> Self {
        let kind = match source.kind() {
            io::ErrorKind::PermissionDenied => FailureKind::PermissionDenied,
            _ => FailureKind::RenameFailed,
        };
        PublishError::Io { kind, path, source }
    }
}

/// Fatal conditions that end the process.
#[derive(Debug, thiserror::Error)]
pub enum LifecycleError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(
        "can not connect to the Ethereum client at {endpoint}: {source}. \
         Please check that it is running and that your settings are correct"
    )]
    Connectivity {
        endpoint: String,
        #[source]
        source: RpcError,
    },
    #[error(transparent)]
    Api(#[from] ApiError),
    #[error(transparent)]
    Engine(#[from] SyncError),
    #[error("sync engine task aborted: {0}")]
    EngineAborted(String),
    #[error("service lifecycle already started (state {0:?})")]
    AlreadyStarted(LifecycleState),
}

impl LifecycleError {
    /// Process exit status for this failure.
    pub fn exit_code(&self) -> i32 {
        match self {
            LifecycleError::Config(_) => 2,
            LifecycleError::Connectivity { .. } => 3,
            LifecycleError::Api(_) => 4,
            LifecycleError::Engine(_)
            | LifecycleError::EngineAborted(_)
            | LifecycleError::AlreadyStarted(_) => 1,
        }
    }
}
