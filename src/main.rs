use std::{path::PathBuf, sync::Arc};

use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, Layer};

use crate::{
    cluster::standalone::{StandaloneLauncherFactory, StandaloneResourceManager},
    constants::files,
    controller::{ControllerTimeouts, LauncherFactory, StoreLauncherFactory},
    data_model::AppSpec,
    metadata::{memory::MemoryDriver, MetadataClient, StoreDriver},
    service::{AmEnvironment, Service, ServiceDeps, StartupFiles},
};

mod broker;
mod cluster;
mod config;
mod constants;
mod controller;
mod credentials;
mod data_model;
mod env_keys;
mod events;
mod expected;
mod filesystem;
mod instance_worker;
mod message_bus;
mod metadata;
mod provisioner;
mod registry;
mod service;
mod tracker;
mod utils;

#[cfg(test)]
mod testing;

#[derive(Parser)]
#[command(version, about, long_about = None)]
struct Cli {
    #[arg(short, long, value_name = "config file")]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_filter(env_filter))
        .init();

    let cli = Cli::parse();
    let config = match cli.config {
        Some(path) => match config::AmConfig::from_path(path.to_str().unwrap_or_default()) {
            Ok(config) => config,
            Err(err) => {
                error!("error loading config: {err:#}");
                std::process::exit(1);
            }
        },
        None => config::AmConfig::default(),
    };

    let environment = match AmEnvironment::from_env() {
        Ok(environment) => environment,
        Err(err) => {
            error!("invalid environment: {err:#}");
            std::process::exit(1);
        }
    };

    let spec = match AppSpec::from_file(std::path::Path::new(files::APP_SPEC)) {
        Ok(spec) => spec,
        Err(err) => {
            error!("error loading application spec: {err:#}");
            std::process::exit(1);
        }
    };
    let startup_files = StartupFiles::load(std::path::Path::new("."));

    // The cluster- and store-side shims are external collaborators; the
    // binary itself runs against the in-process standalone backends.
    let driver: Arc<dyn StoreDriver> = Arc::new(MemoryDriver::new());
    let launcher_factory: Arc<dyn LauncherFactory> = if config.dev {
        Arc::new(StandaloneLauncherFactory::default())
    } else {
        let metadata_app = MetadataClient::new(driver.clone())
            .namespace(&format!("/{}", environment.run_id));
        Arc::new(StoreLauncherFactory::new(
            metadata_app,
            ControllerTimeouts {
                message_ack: std::time::Duration::from_secs(config.message_ack_timeout_secs),
                stop: std::time::Duration::from_secs(config.stop_timeout_secs),
            },
        ))
    };
    let deps = ServiceDeps {
        driver,
        rm: Arc::new(StandaloneResourceManager::new(config.standalone_capacity)),
        launcher_factory,
        event_handler: None,
    };

    let service = match Service::new(config, environment, spec, startup_files, deps) {
        Ok(service) => service,
        Err(err) => {
            error!("error building service: {err:#}");
            std::process::exit(1);
        }
    };

    if let Err(err) = service.start().await {
        error!("error starting application master: {err:#}");
        std::process::exit(1);
    }

    tokio::spawn(shutdown_signal(service.clone()));

    let exit = service.run_until_stopped().await;
    info!(exit = exit.as_ref(), "application master exited");
}

async fn shutdown_signal(service: Service) {
    let ctrl_c = async {
        if tokio::signal::ctrl_c().await.is_err() {
            error!("failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                error!("failed to install signal handler: {err}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("signal received, shutting down application master");
    service.trigger_shutdown();
}
