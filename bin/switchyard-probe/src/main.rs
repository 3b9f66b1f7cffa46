//! Sends requests to a set of backends through a switchyard client.
//!
//! The probe reads a single YAML file holding both the client configuration and the probe settings, with overrides
//! from `SWITCHYARD_`-prefixed environment variables. Between requests the file is re-read, and a changed
//! `pool_cleaner_core_size` resizes the shared maintenance scheduler without restarting anything.

#![deny(missing_docs)]

use std::path::Path;

use switchyard::{maintenance::POOL_CLEANER_CORE_SIZE_KEY, ClientConfiguration, ClientFactory, SharedScheduler};
use switchyard_config::{dynamic::FieldWatcher, ConfigurationLoader, GenericConfiguration, GenericError};
use tracing::{error, info, warn};
use tracing_subscriber::{filter::LevelFilter, EnvFilter};

mod config;
use self::config::ProbeConfig;

mod probe;
use self::probe::Probe;

const ENV_PREFIX: &str = "SWITCHYARD";

fn main() {
    tracing_subscriber::fmt()
        .compact()
        .with_env_filter(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .from_env_lossy(),
        )
        .with_ansi(true)
        .with_target(true)
        .init();

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(e) => {
            error!(error = %e, "Failed to create async runtime.");
            std::process::exit(1);
        }
    };

    match runtime.block_on(run()) {
        Ok(()) => info!("switchyard-probe stopped."),
        Err(e) => {
            error!("{:?}", e);
            std::process::exit(1);
        }
    }
}

async fn run() -> Result<(), GenericError> {
    info!("switchyard-probe starting...");

    let config_path = match std::env::args().nth(1) {
        Some(path) => path,
        None => {
            error!("Path to the configuration file must be passed as the first (and only) argument to `switchyard-probe`.");
            std::process::exit(1);
        }
    };

    let config = load_configuration(&config_path)?;
    let probe_config = ProbeConfig::from_configuration(&config)?;
    let client_config = ClientConfiguration::from_configuration(&config)?;

    let scheduler = SharedScheduler::from_configuration(&config)?;
    tokio::spawn(follow_core_size(config.watch_field(POOL_CLEANER_CORE_SIZE_KEY), scheduler.clone()));

    let factory = ClientFactory::new(scheduler);
    let probe = Probe::new(&factory, &probe_config, client_config)?;

    let mut failures = 0;
    for round in 0..probe_config.requests {
        if round > 0 {
            tokio::time::sleep(probe_config.interval()).await;
            reload_core_size(&config, &config_path);
        }

        if let Err(e) = probe.send_once().await {
            failures += 1;
            warn!(round, error = %e, "Probe request failed.");
        }
    }

    info!(requests = probe_config.requests, failures, "Probe finished.");

    if failures == probe_config.requests {
        return Err(GenericError::msg("every probe request failed"));
    }
    Ok(())
}

fn load_configuration<P: AsRef<Path>>(path: P) -> Result<GenericConfiguration, GenericError> {
    Ok(ConfigurationLoader::default()
        .from_yaml(path)?
        .from_environment(ENV_PREFIX)?
        .into_generic())
}

/// Pushes the core size from the configuration file into the running configuration.
///
/// Anything else that changed in the file is ignored: clients keep the configuration they were built with.
fn reload_core_size(config: &GenericConfiguration, path: &str) {
    let latest = match load_configuration(path) {
        Ok(latest) => latest,
        Err(e) => {
            warn!(error = %e, file_path = path, "Failed to reload configuration. Keeping current values.");
            return;
        }
    };

    match latest.try_get_typed::<usize>(POOL_CLEANER_CORE_SIZE_KEY) {
        Ok(Some(core_size)) => {
            if let Err(e) = config.update(POOL_CLEANER_CORE_SIZE_KEY, core_size) {
                warn!(error = %e, "Failed to apply reloaded core size.");
            }
        }
        Ok(None) => {}
        Err(e) => warn!(error = %e, "Ignoring invalid core size in reloaded configuration."),
    }
}

async fn follow_core_size(mut watcher: FieldWatcher, scheduler: SharedScheduler) {
    while let Some(core_size) = watcher.changed::<usize>().await {
        match scheduler.resize(core_size) {
            Ok(()) => info!(core_size, "Applied new pool maintenance core size."),
            Err(e) => warn!(core_size, error = %e, "Rejected new pool maintenance core size."),
        }
    }
}
