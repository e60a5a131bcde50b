use clap::Parser;
use tracing::{error, info};

use raiden_metrics::cli::Cli;
use raiden_metrics::{logging, Config, LifecycleError, ServiceLifecycle};

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    if let Err(err) = logging::init(cli.log_json) {
        eprintln!("error: {err:#}");
        std::process::exit(1);
    }

    match run(cli).await {
        Ok(()) => std::process::exit(0),
        Err(err) => {
            error!("{err}");
            std::process::exit(err.exit_code());
        }
    }
}

async fn run(cli: Cli) -> Result<(), LifecycleError> {
    // 1) Validate everything before touching the network.
    let config = Config::from_cli(&cli)?;

    info!("Starting Raiden Metrics Server");
    info!(
        eth_rpc = %config.eth_rpc,
        registry = %config.registry_address,
        start_block = config.start_block,
        port = config.port,
        "Configuration"
    );
    match &config.publish {
        Some(publish) => info!(
            output = %publish.output_file.display(),
            period_secs = publish.interval.as_secs(),
            "Snapshot publishing enabled"
        ),
        None => info!("Snapshot publishing disabled"),
    }

    // 2) Connect and build the engine and query API.
    let lifecycle = ServiceLifecycle::connect(&config).await?;

    // 3) Block until interrupted; teardown happens inside.
    let outcome = lifecycle.run(shutdown_signal()).await?;
    info!(?outcome, "Metrics backend exited");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            error!(error = %err, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(err) => {
                error!(error = %err, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received interrupt"),
        _ = terminate => info!("Received SIGTERM"),
    }
}
