//! Shelly Energy Meter Adapter Library
//!
//! Presents the metering channels of Shelly Gen2 devices as energy meters on
//! a data bus. Each channel settles a role (grid, PV inverter, AC load, ...)
//! from persisted settings, polls the device over HTTP RPC and republishes
//! per-line readings together with device-wide totals.

pub mod background_tasks;
pub mod channel_coordinator;
pub mod config;
pub mod data_point;
pub mod energy_meter;
pub mod metric_aggregator;
pub mod role;
pub mod settings;
pub mod shelly_rpc;
pub mod telemetry;

// Re-export commonly used types for easier access
pub use background_tasks::BackgroundTasks;
pub use channel_coordinator::{ChannelCoordinator, ChannelHandle};
pub use config::AdapterConfig;
pub use data_point::{DataPath, DataPointRegistry, Value};
pub use energy_meter::{DeviceChannel, DeviceController, EnergyMeter};
pub use role::{AllowedRoles, RoleName};
pub use settings::{LocalSettings, SettingsStore};
pub use shelly_rpc::ShellyRpcClient;
