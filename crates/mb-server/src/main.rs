//! Meteobridge bridge server
//!
//! Loads `configuration.yaml`, imports the bridges it lists as config
//! entries, sets every entry up and keeps polling until interrupted.

mod http_source;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use mb_config::ServerConfig;
use mb_config_entries::{ConfigEntries, ConfigEntrySource, ConfigFlow, FlowResult};
use mb_core::Platform;
use mb_meteobridge::constants::ABORT_ALREADY_CONFIGURED;
use mb_meteobridge::{MeteobridgeConfigFlow, MeteobridgeIntegration, SourceFactory, DOMAIN};
use mb_registries::Registries;
use mb_state_machine::StateMachine;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

/// Environment variable naming the configuration directory
const CONFIG_DIR_ENV: &str = "METEOBRIDGE_CONFIG";

fn config_dir() -> PathBuf {
    std::env::args()
        .nth(1)
        .or_else(|| std::env::var(CONFIG_DIR_ENV).ok())
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."))
}

/// Turn every bridge listed in the YAML into a config entry
async fn import_bridges(
    config: &ServerConfig,
    flow: &MeteobridgeConfigFlow,
    entries: &ConfigEntries,
) -> Result<()> {
    for bridge in &config.meteobridge {
        match flow.step_import(bridge.to_input()).await {
            result @ FlowResult::CreateEntry { .. } => {
                let entry = entries
                    .add_from_flow(DOMAIN, ConfigEntrySource::Import, result)
                    .await?;
                info!("Imported {} from configuration.yaml", entry.title);
            }
            FlowResult::Abort { reason } if reason == ABORT_ALREADY_CONFIGURED => {
                debug!("Bridge {} already imported", bridge.host);
            }
            FlowResult::Abort { reason } => {
                warn!("Could not import bridge {}: {}", bridge.host, reason);
            }
            FlowResult::Form { .. } => {
                warn!("Import of bridge {} asked for input, skipping", bridge.host);
            }
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(true)
        .init();

    let config_dir = config_dir();
    info!("Starting Meteobridge server in {:?}", config_dir);

    let config = ServerConfig::load(&config_dir)
        .with_context(|| format!("loading configuration from {:?}", config_dir))?;

    let registries = Arc::new(Registries::new(&config_dir));
    registries.load_all().await.context("loading registries")?;
    debug!("Storage directory {:?}", registries.storage.storage_dir());

    let entries = ConfigEntries::new(registries.storage.clone());
    entries.load().await.context("loading config entries")?;

    let states = Arc::new(StateMachine::new());
    let factory: Arc<dyn SourceFactory> = Arc::new(http_source::factory(http_source::client()?));
    let host_units = config.core.unit_system;

    let integration = Arc::new(MeteobridgeIntegration::new(
        registries.clone(),
        states.clone(),
        factory.clone(),
        host_units,
    ));
    integration.register(&entries);

    let flow = MeteobridgeConfigFlow::new(entries.clone(), factory, host_units);
    import_bridges(&config, &flow, &entries).await?;

    let mut changes = states.subscribe();
    let watcher = tokio::spawn(async move {
        loop {
            match changes.recv().await {
                Ok(change) if change.value_changed() => {
                    let state = change.new_state.as_ref().map(|s| s.state.as_str());
                    debug!("{} -> {}", change.entity_id, state.unwrap_or("removed"));
                }
                Ok(_) | Err(RecvError::Lagged(_)) => {}
                Err(RecvError::Closed) => break,
            }
        }
    });

    for (entry_id, result) in entries.setup_all().await {
        if let Err(e) = result {
            warn!("Bridge entry {} not set up: {}", entry_id, e);
        }
    }

    info!(
        "{} of {} bridges loaded, publishing {} sensors and {} binary sensors",
        integration.loaded_entries().len(),
        entries.len(),
        states.entity_ids(Platform::Sensor).len(),
        states.entity_ids(Platform::BinarySensor).len()
    );

    tokio::signal::ctrl_c().await?;
    info!("Shutting down...");

    entries.unload_all().await;
    watcher.abort();

    registries.save_all().await.context("saving registries")?;
    entries.save().await.context("saving config entries")?;

    Ok(())
}
