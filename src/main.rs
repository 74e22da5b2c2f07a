//! DLP monitor service entry point
//!
//! Loads the configuration, installs logging, opens the stores, starts
//! monitoring when configured to and serves the control surface until
//! interrupted.

use anyhow::Context;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use dlp_monitor::api::{ApiError, ApiServer, ApiServerConfig};
use dlp_monitor::config::{ConfigStore, ConfigStoreConfig};
use dlp_monitor::logging::LoggingSystem;
use dlp_monitor::service::DlpServices;

type ApiTask = JoinHandle<Result<(), ApiError>>;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let store = ConfigStore::new(ConfigStoreConfig::default())
        .await
        .context("loading configuration")?;
    let config = store.get().await;

    // Kept alive for the whole run so the file writer keeps flushing
    let _logging_system = match LoggingSystem::init(config.logging.clone()) {
        Ok(system) => Some(system),
        Err(e) => {
            eprintln!("Failed to initialize logging system: {}. Using basic logging.", e);
            LoggingSystem::init_fallback();
            None
        }
    };

    info!(
        version = env!("CARGO_PKG_VERSION"),
        config = %store.config_path().display(),
        data_dir = %config.storage.data_dir.display(),
        "Starting DLP monitor"
    );

    let services = DlpServices::open(&config)
        .await
        .context("opening the tag store and event log")?;

    if config.monitoring.auto_start {
        if let Err(e) = services.controller.start().await {
            error!(error = %e, "Monitoring did not start; use the control surface to retry");
        }
    }

    let shutdown = CancellationToken::new();
    let mut api: Option<ApiTask> = if config.api.enabled {
        let server = ApiServer::from_services(&services, ApiServerConfig::from(&config.api));
        let token = shutdown.clone();
        Some(tokio::spawn(
            server.serve(async move { token.cancelled().await }),
        ))
    } else {
        info!("Control surface disabled");
        None
    };

    let api_exited = tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            signal.context("listening for the shutdown signal")?;
            info!("Shutdown requested");
            false
        }
        outcome = wait_for_api(&mut api) => {
            report_api_exit(outcome);
            true
        }
    };
    if api_exited {
        api = None;
    }

    shutdown.cancel();
    services.controller.stop().await;

    if let Some(task) = api {
        report_api_exit(task.await);
    }

    info!("DLP monitor stopped");
    Ok(())
}

async fn wait_for_api(
    api: &mut Option<ApiTask>,
) -> Result<Result<(), ApiError>, tokio::task::JoinError> {
    match api {
        Some(task) => task.await,
        None => std::future::pending().await,
    }
}

fn report_api_exit(outcome: Result<Result<(), ApiError>, tokio::task::JoinError>) {
    match outcome {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!(error = %e, "Control surface failed"),
        Err(e) => warn!(error = %e, "Control surface task ended abnormally"),
    }
}
