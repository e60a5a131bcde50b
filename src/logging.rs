use anyhow::{Context, Result};
use tracing_subscriber::fmt::time::ChronoLocal;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter};

/// Used when `RUST_LOG` is unset. HTTP client internals only surface warnings.
pub const DEFAULT_DIRECTIVES: &str = "info,hyper=warn,hyper_util=warn,reqwest=warn";

const TIME_FORMAT: &str = "%m-%d %H:%M:%S";

/// Installs the global subscriber. Call once, before anything logs.
pub fn init(json: bool) -> Result<()> {
    let filter = build_filter()?;
    let timer = ChronoLocal::new(TIME_FORMAT.to_string());
    let registry = tracing_subscriber::registry().with(filter);

    if json {
        registry.with(fmt::layer().json().with_timer(timer)).try_init()
    } else {
        registry.with(fmt::layer().with_timer(timer)).try_init()
    }
    .context("failed to install tracing subscriber")
}

fn build_filter() -> Result<EnvFilter> {
    EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(DEFAULT_DIRECTIVES))
        .context("invalid log filter directives")
}
