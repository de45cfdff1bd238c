use std::collections::HashMap;
use std::env;
use std::error::Error;
use std::process::ExitCode;

use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use topic_freshness_core::config::ExporterConfig;

mod cmdline;
mod setup_tracing;

#[tokio::main]
async fn main() -> ExitCode {
    setup_tracing::register();

    match run().await {
        Ok(code) => {
            info!("Exiting...");
            code
        }
        Err(e) => {
            error!("{e:?}");
            ExitCode::FAILURE
        }
    }
}

async fn run() -> Result<ExitCode, Box<dyn Error>> {
    let matches = cmdline::root_cli().get_matches();

    let env_vars: HashMap<String, String> = env::vars().collect();
    let config = ExporterConfig::load(env_vars)?;

    if matches.subcommand_name() == Some(cmdline::ONCE) {
        let (result, exposition) = topic_freshness_core::run_once(config).await?;
        print!("{exposition}");
        if !result.healthy {
            warn!("Freshness cycle was unhealthy");
            return Ok(ExitCode::FAILURE);
        }
        return Ok(ExitCode::SUCCESS);
    }

    let cancel = CancellationToken::new();
    let shutdown_cancel = cancel.clone();
    // wait for SIG{INT,TERM} and invoke cancellation token.
    let shutdown_handle = tokio::spawn(async move {
        shutdown_signal().await;
        shutdown_cancel.cancel();
    });

    let result = topic_freshness_core::run(config, cancel).await;
    if !shutdown_handle.is_finished() {
        shutdown_handle.abort();
    }
    result?;

    Ok(ExitCode::SUCCESS)
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
        info!("Received Ctrl+C signal");
    };

    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
        info!("Received terminate signal");
    };

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
