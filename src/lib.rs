//! Token network topology collector.
//!
//! Syncs token networks from a registry contract over JSON-RPC, serves them
//! over HTTP and periodically publishes them as a crash-consistent JSON file.

pub mod api;
pub mod cli;
pub mod config;
pub mod error;
pub mod lifecycle;
pub mod logging;
pub mod publish;
pub mod publish_loop;
pub mod rpc;
pub mod snapshot;
pub mod sync;

pub use config::Config;
pub use error::{FailureKind, LifecycleError, PublishError};
pub use lifecycle::{LifecycleState, RunOutcome, ServiceLifecycle};
