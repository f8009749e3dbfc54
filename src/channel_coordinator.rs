use crate::config::AdapterConfig;
use crate::data_point::{DataPath, DataPointRegistry, Value};
use crate::energy_meter::{DeviceChannel, DeviceController, EnergyMeter};
use crate::settings::SettingsStore;
use crate::shelly_rpc::{RpcError, ShellyRpcClient};
use anyhow::Context;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};

/// Failed polls in a row before the channel is reported as disconnected
const MAX_CONSECUTIVE_ERRORS: u32 = 10;

/// Device side of a meter. Restarts go to the owning coordinator, which
/// tears the channel down and brings it back up; relay commands go straight
/// to the device.
pub struct ChannelController {
    requests: mpsc::Sender<()>,
    client: ShellyRpcClient,
    channel: u32,
}

#[async_trait]
impl DeviceController for ChannelController {
    async fn restart(&self) -> anyhow::Result<()> {
        self.requests
            .send(())
            .await
            .map_err(|_| anyhow::anyhow!("channel coordinator has shut down"))
    }

    async fn set_output(&self, on: bool) -> anyhow::Result<()> {
        self.client
            .switch_set(self.channel, on)
            .await
            .with_context(|| format!("Switch.Set on channel {} failed", self.channel))?;
        Ok(())
    }
}

/// A write arriving from the bus, answered with whether it was accepted
pub struct BusWrite {
    pub path: DataPath,
    pub value: Value,
    pub reply: oneshot::Sender<bool>,
}

/// Cloneable access to a running channel: its published data points and
/// a way to write to them as a bus client would
#[derive(Clone)]
pub struct ChannelHandle {
    writes: mpsc::Sender<BusWrite>,
    registry: DataPointRegistry,
}

impl ChannelHandle {
    pub fn registry(&self) -> &DataPointRegistry {
        &self.registry
    }

    /// Returns `false` when the write was refused or the coordinator is gone
    pub async fn write(&self, path: DataPath, value: Value) -> bool {
        let (reply, answer) = oneshot::channel();
        let request = BusWrite { path, value, reply };
        if self.writes.send(request).await.is_err() {
            return false;
        }
        answer.await.unwrap_or(false)
    }
}

enum Outcome {
    Restart,
    Shutdown,
}

/// Runs one device channel: polls the device, feeds the meter, serves bus
/// writes, and rebuilds the meter whenever a restart is requested
pub struct ChannelCoordinator {
    client: ShellyRpcClient,
    channel: DeviceChannel,
    poll_interval: Duration,
    registry: DataPointRegistry,
    settings: Arc<dyn SettingsStore>,
    writes_tx: mpsc::Sender<BusWrite>,
    writes: mpsc::Receiver<BusWrite>,
    restarts_tx: mpsc::Sender<()>,
    restarts: mpsc::Receiver<()>,
}

impl ChannelCoordinator {
    pub fn new(
        client: ShellyRpcClient,
        channel: DeviceChannel,
        poll_interval: Duration,
        settings: Arc<dyn SettingsStore>,
    ) -> Self {
        let (writes_tx, writes) = mpsc::channel(32);
        let (restarts_tx, restarts) = mpsc::channel(4);
        Self {
            client,
            channel,
            poll_interval,
            registry: DataPointRegistry::new(),
            settings,
            writes_tx,
            writes,
            restarts_tx,
            restarts,
        }
    }

    /// Queries the configured device and prepares one coordinator per channel,
    /// or only for the configured channel when one is set
    pub async fn connect(
        config: &AdapterConfig,
        settings: Arc<dyn SettingsStore>,
    ) -> anyhow::Result<Vec<Self>> {
        let client = ShellyRpcClient::new(config.shelly_url.as_str());
        let capabilities = client
            .detect_capabilities()
            .await
            .with_context(|| format!("Failed to detect Shelly device at {}", config.shelly_url))?;
        anyhow::ensure!(
            capabilities.is_supported(),
            "Shelly device at {} has neither switch nor energy meter components",
            config.shelly_url
        );

        let serial = match &config.serial {
            Some(serial) => serial.clone(),
            None => client
                .device_info()
                .await
                .context("Failed to read device info")?
                .mac
                .to_lowercase(),
        };
        let channels: Vec<u32> = match config.channel {
            Some(channel) => vec![channel],
            None => (0..capabilities.num_channels).collect(),
        };
        channels
            .into_iter()
            .map(|n| -> anyhow::Result<Self> {
                let channel = capabilities.channel(&serial, n).with_context(|| {
                    format!(
                        "Channel {} of {} not available (device has {} channels)",
                        n, serial, capabilities.num_channels
                    )
                })?;
                Ok(Self::new(
                    client.clone(),
                    channel,
                    config.poll_interval,
                    Arc::clone(&settings),
                ))
            })
            .collect()
    }

    pub fn handle(&self) -> ChannelHandle {
        ChannelHandle {
            writes: self.writes_tx.clone(),
            registry: self.registry.clone(),
        }
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    /// Serves the channel until the coordinator is dropped or aborted
    pub async fn run(mut self) {
        loop {
            let controller = Arc::new(ChannelController {
                requests: self.restarts_tx.clone(),
                client: self.client.clone(),
                channel: self.channel.channel,
            });
            let mut meter = EnergyMeter::new(
                self.channel.clone(),
                self.registry.clone(),
                Arc::clone(&self.settings),
                controller,
            );
            meter.initialize().await;
            tracing::info!("Serving {} as {}", self.channel, meter.service_name());

            match self.serve(&mut meter).await {
                Outcome::Restart => {
                    tracing::info!("Restarting {}", self.channel);
                    self.registry.clear();
                }
                Outcome::Shutdown => break,
            }
        }
        tracing::info!("Coordinator for {} exiting", self.channel);
    }

    async fn serve(&mut self, meter: &mut EnergyMeter) -> Outcome {
        let mut poll_interval = interval(self.poll_interval);
        poll_interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut consecutive_errors = 0u32;

        loop {
            tokio::select! {
                _ = poll_interval.tick() => {
                    match self.poll(meter).await {
                        Ok(()) => {
                            if consecutive_errors >= MAX_CONSECUTIVE_ERRORS {
                                tracing::info!("{} is reachable again", self.channel);
                                meter
                                    .registry()
                                    .set_local_value(DataPath::Connected, Some(Value::Integer(1)));
                            }
                            consecutive_errors = 0;
                        }
                        Err(e) => {
                            consecutive_errors = consecutive_errors.saturating_add(1);
                            tracing::warn!(
                                "Shelly read error ({}/{}): {}",
                                consecutive_errors.min(MAX_CONSECUTIVE_ERRORS),
                                MAX_CONSECUTIVE_ERRORS,
                                e
                            );
                            if consecutive_errors == MAX_CONSECUTIVE_ERRORS {
                                tracing::error!(
                                    "Too many consecutive read errors, marking {} disconnected",
                                    self.channel
                                );
                                meter
                                    .registry()
                                    .set_local_value(DataPath::Connected, Some(Value::Integer(0)));
                            }
                        }
                    }
                }
                request = self.restarts.recv() => {
                    return match request {
                        Some(()) => Outcome::Restart,
                        None => Outcome::Shutdown,
                    };
                }
                write = self.writes.recv() => {
                    let Some(write) = write else {
                        return Outcome::Shutdown;
                    };
                    let accepted = meter.handle_external_write(write.path, write.value).await;
                    let _ = write.reply.send(accepted);
                }
            }
        }
    }

    async fn poll(&self, meter: &EnergyMeter) -> Result<(), RpcError> {
        let id = self.channel.channel;
        // Totals first so this cycle's aggregates already include them
        if self.channel.has_em && !self.channel.has_switch {
            match self.client.emdata_status(id).await {
                Ok(emdata) => meter.update_from_energy_totals(&emdata),
                Err(e) => meter.reject_energy_totals(e),
            }
        }
        let status = self.client.channel_status(self.channel.has_switch, id).await?;
        meter.update_from_status(&status);

        if tracing::enabled!(tracing::Level::TRACE) {
            tracing::trace!("{}: {:?}", self.channel, meter.registry().snapshot());
        }
        Ok(())
    }
}
