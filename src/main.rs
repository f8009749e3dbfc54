use shelly_energy_meter::{AdapterConfig, BackgroundTasks, ChannelCoordinator, LocalSettings};
use std::sync::Arc;
use tokio::task::JoinSet;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    tracing::info!("Starting Shelly energy meter adapter");
    let config = AdapterConfig::from_env()?;
    tracing::info!(
        "Device {} channel {}, polling every {:?}",
        config.shelly_url,
        config
            .channel
            .map_or_else(|| "all".to_string(), |c| c.to_string()),
        config.poll_interval
    );

    let settings = match &config.settings_file {
        Some(path) => LocalSettings::open(path).await?,
        None => {
            tracing::warn!("No SETTINGS_FILE given, roles will not survive a restart");
            LocalSettings::in_memory()
        }
    };

    let coordinators = ChannelCoordinator::connect(&config, Arc::new(settings)).await?;
    let mut channels = JoinSet::new();
    for coordinator in coordinators {
        channels.spawn(coordinator.run());
    }

    tokio::select! {
        _ = async {
            while let Some(result) = channels.join_next().await {
                if let Err(e) = result {
                    tracing::error!("Channel coordinator stopped: {}", e);
                }
            }
        } => {
            tracing::warn!("All channel coordinators stopped");
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Shutting down");
            channels.abort_all();
        }
    }

    BackgroundTasks::global().abort_all();
    Ok(())
}
