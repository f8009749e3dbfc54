use crate::background_tasks::BackgroundTasks;
use crate::data_point::{DataPath, DataPointRegistry, Phase, PhaseMetric, Value};
use crate::role::{AllowedRoles, RoleInstance, RoleName};
use crate::settings::{Setting, SettingsStore};
use async_trait::async_trait;
use std::{
    fmt,
    sync::{atomic::AtomicU64, Arc},
};

pub const PRODUCT_ID_SHELLY_EM: i64 = 0xB034;
pub const PRODUCT_ID_SHELLY_SWITCH: i64 = 0xB074;

/// Highest valid AC-coupling position of a PV inverter
pub const MAX_POSITION: i64 = 2;

/// `/SwitchableOutput/0/Status` values
pub const OUTPUT_STATUS_OFF: i64 = 0x00;
pub const OUTPUT_STATUS_ON: i64 = 0x09;

/// One metering point of a Shelly device
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceChannel {
    pub serial: String,
    pub channel: u32,
    /// 1 to 3
    pub num_phases: u8,
    /// Relay channel reporting one aggregate reading instead of per-line fields
    pub has_switch: bool,
    /// Channel has metering at all. Telemetry updates are ignored without it.
    pub has_em: bool,
    pub allowed_roles: AllowedRoles,
}

impl DeviceChannel {
    fn settings_base(&self) -> String {
        format!("/Settings/Devices/shelly_{}_{}/", self.serial, self.channel)
    }

    fn instance_alias(&self) -> String {
        format!("instance_{}_{}", self.serial, self.channel)
    }

    fn position_alias(&self) -> String {
        format!("position_{}_{}", self.serial, self.channel)
    }

    fn custom_name_alias(&self) -> String {
        format!("customname_{}_{}", self.serial, self.channel)
    }

    pub fn product_id(&self) -> i64 {
        if self.has_switch {
            PRODUCT_ID_SHELLY_SWITCH
        } else {
            PRODUCT_ID_SHELLY_EM
        }
    }

    pub fn product_name(&self) -> &'static str {
        if self.has_switch {
            "Shelly switch"
        } else {
            "Shelly energy meter"
        }
    }
}

impl fmt::Display for DeviceChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "shelly {} channel {}", self.serial, self.channel)
    }
}

/// Acts on the physical device channel on behalf of the meter
#[async_trait]
pub trait DeviceController: Send + Sync {
    /// Restarts the channel after its role changed. Invoked, never awaited, by the meter.
    async fn restart(&self) -> anyhow::Result<()>;

    /// Switches the channel's relay
    async fn set_output(&self, on: bool) -> anyhow::Result<()>;
}

/// A device channel presented on the bus as an energy meter
///
/// Owns the channel's role (and instance number) and the data points it
/// publishes. [`EnergyMeter::initialize`] settles the role; telemetry is fed
/// in through the update methods in `metric_aggregator`.
pub struct EnergyMeter {
    pub(crate) channel: DeviceChannel,
    pub(crate) role: Option<RoleName>,
    pub(crate) instance: u32,
    pub(crate) registry: DataPointRegistry,
    settings: Arc<dyn SettingsStore>,
    controller: Arc<dyn DeviceController>,
    tasks: BackgroundTasks,
    pub(crate) aborted_status_updates: AtomicU64,
    pub(crate) rejected_energy_totals: AtomicU64,
}

impl EnergyMeter {
    pub fn new(
        channel: DeviceChannel,
        registry: DataPointRegistry,
        settings: Arc<dyn SettingsStore>,
        controller: Arc<dyn DeviceController>,
    ) -> Self {
        Self {
            channel,
            role: None,
            instance: crate::role::DEFAULT_INSTANCE,
            registry,
            settings,
            controller,
            tasks: BackgroundTasks::global(),
            aborted_status_updates: AtomicU64::new(0),
            rejected_energy_totals: AtomicU64::new(0),
        }
    }

    /// Tracks restart tasks in `tasks` instead of the process-wide pool
    pub fn with_background_tasks(mut self, tasks: BackgroundTasks) -> Self {
        self.tasks = tasks;
        self
    }

    pub fn channel(&self) -> &DeviceChannel {
        &self.channel
    }

    /// `None` until [`EnergyMeter::initialize`] has run
    pub fn role(&self) -> Option<RoleName> {
        self.role
    }

    pub fn instance(&self) -> u32 {
        self.instance
    }

    pub fn registry(&self) -> &DataPointRegistry {
        &self.registry
    }

    /// Bus service name, which embeds the role. Channels without metering
    /// are plain switches.
    pub fn service_name(&self) -> String {
        let service_type = if self.channel.has_em {
            self.role
                .unwrap_or_else(|| self.channel.allowed_roles.default_role())
                .as_str()
        } else {
            "switch"
        };
        format!(
            "com.victronenergy.{}.shelly_{}_{}",
            service_type, self.channel.serial, self.channel.channel
        )
    }

    fn instance_key(&self) -> String {
        self.settings
            .alias(&self.channel.instance_alias())
            .unwrap_or_else(|| format!("{}ClassAndVrmInstance", self.channel.settings_base()))
    }

    fn stored_role_instance(&self, key: &str) -> Option<RoleInstance> {
        self.settings
            .get_value(key)
            .map(|v| RoleInstance::decode(v.as_str()))
    }

    async fn register_settings(&self) {
        let base = self.channel.settings_base();
        let mut settings = vec![Setting::new(format!("{base}CustomName"), "")
            .with_alias(self.channel.custom_name_alias())];
        if self.channel.has_em {
            settings.push(
                Setting::new(
                    format!("{base}ClassAndVrmInstance"),
                    format!(
                        "{}:{}",
                        self.channel.allowed_roles.default_role(),
                        crate::role::DEFAULT_INSTANCE
                    ),
                )
                .with_alias(self.channel.instance_alias()),
            );
        }
        // A switching device can only be an AC load, so it has no position
        if self.channel.has_em && !self.channel.has_switch {
            settings.push(
                Setting::new(format!("{base}Position"), 0)
                    .with_range(0.0, MAX_POSITION as f64)
                    .with_alias(self.channel.position_alias()),
            );
        }
        for setting in settings {
            let path = setting.path.clone();
            if let Err(e) = self.settings.add_setting(setting).await {
                tracing::warn!("Failed to register setting {}: {}", path, e);
            }
        }
    }

    /// Settles the channel's role and publishes its data points.
    ///
    /// A persisted role outside the allowed set (or none at all) is replaced by
    /// the default role and written back, keeping the stored instance number.
    /// Channels without metering have no role and only publish their relay.
    pub async fn initialize(&mut self) -> Option<RoleName> {
        self.register_settings().await;
        if !self.channel.has_em {
            self.role = None;
            self.publish();
            tracing::info!("Initialized {} as switch", self.channel);
            return None;
        }

        let key = self.instance_key();
        let stored = RoleInstance::decode(
            self.settings
                .get_value(&key)
                .as_ref()
                .and_then(|v| v.as_str()),
        );

        let role = match stored.role.filter(|r| self.channel.allowed_roles.contains(*r)) {
            Some(role) => role,
            None => {
                let role = self.channel.allowed_roles.default_role();
                tracing::warn!(
                    "Role {} not allowed for {}, resetting to {}",
                    stored
                        .role
                        .map_or_else(|| "<none>".to_string(), |r| r.to_string()),
                    self.channel,
                    role
                );
                let corrected = stored.encode_as(role);
                if let Err(e) = self.settings.set_value(&key, corrected.into()).await {
                    tracing::warn!("Failed to store corrected role for {}: {}", self.channel, e);
                }
                role
            }
        };

        self.role = Some(role);
        self.instance = stored.instance;
        self.publish();
        tracing::info!(
            "Initialized {} as {} (instance {})",
            self.channel,
            role,
            self.instance
        );
        Some(role)
    }

    fn publish(&self) {
        let registry = &self.registry;
        if let Some(role) = self.role {
            self.publish_role(role);
        }

        registry.add_item(
            DataPath::DeviceInstance,
            Some(Value::Integer(self.instance.into())),
            false,
        );
        registry.add_item(
            DataPath::Serial,
            Some(Value::Text(self.channel.serial.clone())),
            false,
        );
        registry.add_item(
            DataPath::ProductId,
            Some(Value::Integer(self.channel.product_id())),
            false,
        );
        registry.add_item(
            DataPath::ProductName,
            Some(Value::Text(self.channel.product_name().to_string())),
            false,
        );
        let custom_name = self
            .settings
            .alias(&self.channel.custom_name_alias())
            .and_then(|key| self.settings.get_value(&key))
            .and_then(|v| v.as_str().map(str::to_string))
            .unwrap_or_default();
        registry.add_item(DataPath::CustomName, Some(Value::Text(custom_name)), true);
        registry.add_item(DataPath::Connected, Some(Value::Integer(1)), false);

        if self.channel.has_switch {
            registry.add_item(
                DataPath::OutputName,
                Some(Value::Text(format!("Channel {}", self.channel.channel + 1))),
                false,
            );
            // State survives a re-initialization like the telemetry below
            if !registry.is_registered(DataPath::OutputState) {
                registry.add_item(DataPath::OutputState, Some(Value::Integer(0)), true);
            }
            if !registry.is_registered(DataPath::OutputStatus) {
                registry.add_item(
                    DataPath::OutputStatus,
                    Some(Value::Integer(OUTPUT_STATUS_OFF)),
                    false,
                );
            }
        }

        if self.channel.has_em {
            // Keep telemetry already published by an earlier initialization
            let meter_paths = [
                DataPath::AcEnergyForward,
                DataPath::AcEnergyReverse,
                DataPath::AcPower,
            ]
            .into_iter()
            .chain(Phase::all(self.channel.num_phases).flat_map(|phase| {
                PhaseMetric::ALL
                    .into_iter()
                    .map(move |metric| DataPath::Phase(phase, metric))
            }));
            for path in meter_paths {
                if !registry.is_registered(path) {
                    registry.add_item(path, None, false);
                }
            }
        }
    }

    fn publish_role(&self, role: RoleName) {
        let registry = &self.registry;
        registry.add_item(DataPath::Role, Some(Value::Text(role.to_string())), true);
        registry.add_item(
            DataPath::AllowedRoles,
            Some(Value::TextArray(self.channel.allowed_roles.to_strings())),
            false,
        );

        // Anything but the grid meter is masquerading as a generic meter
        if role != RoleName::Grid {
            registry.add_item(DataPath::IsGenericEnergyMeter, Some(Value::Integer(1)), false);
        } else {
            registry.remove_item(DataPath::IsGenericEnergyMeter);
        }

        if !self.channel.has_switch && role == RoleName::PvInverter {
            registry.add_item(
                DataPath::Position,
                Some(Value::Integer(self.stored_position())),
                true,
            );
        } else {
            registry.remove_item(DataPath::Position);
        }
    }

    fn stored_position(&self) -> i64 {
        self.settings
            .alias(&self.channel.position_alias())
            .and_then(|key| self.settings.get_value(&key))
            .and_then(|v| v.as_i64())
            .unwrap_or(0)
    }

    /// Handles a bus write to `/Role`.
    ///
    /// Stores the new role without waiting for the settings store, keeps the
    /// instance number, and schedules a device restart in the background so the
    /// channel comes back under its new service name.
    pub fn handle_role_change_request(&mut self, new_role: &str) -> bool {
        let allowed = self
            .channel
            .has_em
            .then(|| self.channel.allowed_roles.allows(new_role))
            .flatten();
        let Some(role) = allowed else {
            tracing::debug!("Rejected role {} for {}", new_role, self.channel);
            return false;
        };

        let key = self.instance_key();
        let instance = self
            .stored_role_instance(&key)
            .map_or(self.instance, |stored| stored.instance);
        self.settings
            .set_value_async(&key, format!("{role}:{instance}").into());
        self.role = Some(role);
        self.instance = instance;
        self.registry
            .set_local_value(DataPath::Role, Some(Value::Text(role.to_string())));

        tracing::info!("Role of {} changed to {}, restarting", self.channel, role);
        let controller = Arc::clone(&self.controller);
        let channel = self.channel.to_string();
        self.tasks.spawn(async move {
            if let Err(e) = controller.restart().await {
                tracing::warn!("Restart of {} failed: {:#}", channel, e);
            }
        });
        true
    }

    /// Handles a bus write to `/Position`. Only reports success once the value is stored.
    pub async fn handle_position_change_request(&mut self, value: i64) -> bool {
        if !(0..=MAX_POSITION).contains(&value) {
            tracing::debug!("Rejected position {} for {}", value, self.channel);
            return false;
        }
        let Some(key) = self.settings.alias(&self.channel.position_alias()) else {
            tracing::debug!("{} has no position setting", self.channel);
            return false;
        };
        if let Err(e) = self.settings.set_value(&key, value.into()).await {
            tracing::warn!("Failed to store position for {}: {}", self.channel, e);
            return false;
        }
        self.registry
            .set_local_value(DataPath::Position, Some(Value::Integer(value)));
        true
    }

    fn handle_custom_name_change(&self, name: &str) -> bool {
        let Some(key) = self.settings.alias(&self.channel.custom_name_alias()) else {
            return false;
        };
        if self.settings.get_value(&key).as_ref().and_then(|v| v.as_str()) != Some(name) {
            self.settings.set_value_async(&key, name.into());
        }
        self.registry
            .set_local_value(DataPath::CustomName, Some(Value::Text(name.to_string())))
    }

    /// Handles a bus write to `/SwitchableOutput/0/State`. The local value
    /// only changes once the device accepted the command.
    pub async fn handle_output_change_request(&mut self, state: i64) -> bool {
        if !self.channel.has_switch || !(0..=1).contains(&state) {
            tracing::debug!("Rejected output state {} for {}", state, self.channel);
            return false;
        }
        if let Err(e) = self.controller.set_output(state == 1).await {
            tracing::warn!("Failed to switch {}: {:#}", self.channel, e);
            return false;
        }
        self.registry
            .set_local_value(DataPath::OutputState, Some(Value::Integer(state)))
    }

    /// Routes a write coming from the bus to the matching handler.
    /// Writes to read-only or unknown paths are refused.
    pub async fn handle_external_write(&mut self, path: DataPath, value: Value) -> bool {
        if !self.registry.is_writeable(path) {
            tracing::debug!("Refused write to read-only {} on {}", path, self.channel);
            return false;
        }
        match (path, &value) {
            (DataPath::Role, Value::Text(role)) => self.handle_role_change_request(role),
            (DataPath::Position, value) => match value.as_i64() {
                Some(position) => self.handle_position_change_request(position).await,
                None => false,
            },
            (DataPath::CustomName, Value::Text(name)) => self.handle_custom_name_change(name),
            (DataPath::OutputState, value) => match value.as_i64() {
                Some(state) => self.handle_output_change_request(state).await,
                None => false,
            },
            _ => false,
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::settings::{LocalSettings, SettingsError};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    /// Settings store that counts writes on top of [`LocalSettings`]
    #[derive(Clone, Default)]
    pub(crate) struct RecordingSettings {
        pub(crate) inner: LocalSettings,
        pub(crate) writes: Arc<AtomicUsize>,
    }

    impl RecordingSettings {
        pub(crate) fn writes(&self) -> usize {
            self.writes.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl SettingsStore for RecordingSettings {
        async fn add_setting(&self, setting: Setting) -> Result<(), SettingsError> {
            self.inner.add_setting(setting).await
        }

        fn alias(&self, alias: &str) -> Option<String> {
            self.inner.alias(alias)
        }

        fn get_value(&self, key: &str) -> Option<serde_json::Value> {
            self.inner.get_value(key)
        }

        async fn set_value(
            &self,
            key: &str,
            value: serde_json::Value,
        ) -> Result<(), SettingsError> {
            self.writes.fetch_add(1, Ordering::SeqCst);
            self.inner.set_value(key, value).await
        }

        fn set_value_async(&self, key: &str, value: serde_json::Value) {
            self.writes.fetch_add(1, Ordering::SeqCst);
            self.inner.set_value_async(key, value)
        }
    }

    #[derive(Default)]
    pub(crate) struct CountingController {
        pub(crate) restarts: AtomicUsize,
        pub(crate) outputs: std::sync::Mutex<Vec<bool>>,
        pub(crate) fail: bool,
    }

    #[async_trait]
    impl DeviceController for CountingController {
        async fn restart(&self) -> anyhow::Result<()> {
            self.restarts.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                anyhow::bail!("device unreachable");
            }
            Ok(())
        }

        async fn set_output(&self, on: bool) -> anyhow::Result<()> {
            if self.fail {
                anyhow::bail!("device unreachable");
            }
            self.outputs.lock().unwrap().push(on);
            Ok(())
        }
    }

    pub(crate) fn em_channel(num_phases: u8) -> DeviceChannel {
        DeviceChannel {
            serial: "abc123".to_string(),
            channel: 0,
            num_phases,
            has_switch: false,
            has_em: true,
            allowed_roles: AllowedRoles::metering_only(),
        }
    }

    pub(crate) fn switch_channel() -> DeviceChannel {
        DeviceChannel {
            serial: "sw42".to_string(),
            channel: 1,
            num_phases: 1,
            has_switch: true,
            has_em: true,
            allowed_roles: AllowedRoles::switch_with_metering(),
        }
    }

    pub(crate) fn relay_channel() -> DeviceChannel {
        DeviceChannel {
            serial: "relay7".to_string(),
            channel: 0,
            num_phases: 1,
            has_switch: true,
            has_em: false,
            allowed_roles: AllowedRoles::switch_with_metering(),
        }
    }

    const ROLE_KEY: &str = "/Settings/Devices/shelly_abc123_0/ClassAndVrmInstance";
    const POSITION_KEY: &str = "/Settings/Devices/shelly_abc123_0/Position";

    struct Harness {
        meter: EnergyMeter,
        settings: RecordingSettings,
        controller: Arc<CountingController>,
        tasks: BackgroundTasks,
    }

    async fn harness(channel: DeviceChannel, stored_role: Option<&str>) -> Harness {
        let settings = RecordingSettings::default();
        if let Some(stored) = stored_role {
            let key = format!(
                "/Settings/Devices/shelly_{}_{}/ClassAndVrmInstance",
                channel.serial, channel.channel
            );
            settings
                .inner
                .add_setting(Setting::new(key, stored))
                .await
                .unwrap();
        }
        let controller = Arc::new(CountingController::default());
        let tasks = BackgroundTasks::new();
        let meter = EnergyMeter::new(
            channel,
            DataPointRegistry::new(),
            Arc::new(settings.clone()),
            controller.clone(),
        )
        .with_background_tasks(tasks.clone());
        Harness {
            meter,
            settings,
            controller,
            tasks,
        }
    }

    async fn wait_for_restarts(controller: &CountingController, tasks: &BackgroundTasks, n: usize) {
        for _ in 0..100 {
            if controller.restarts.load(Ordering::SeqCst) >= n && tasks.is_empty() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!(
            "expected {} restarts, saw {}",
            n,
            controller.restarts.load(Ordering::SeqCst)
        );
    }

    #[tokio::test]
    async fn test_disallowed_role_is_reset_to_default() {
        let mut h = harness(em_channel(3), Some("grid:33")).await;

        assert_eq!(h.meter.initialize().await, Some(RoleName::AcLoad));
        assert_eq!(h.meter.instance(), 33);
        assert_eq!(h.settings.get_value(ROLE_KEY), Some(json!("acload:33")));
        assert_eq!(h.settings.writes(), 1);
        assert_eq!(
            h.meter.registry().value(DataPath::Role),
            Some(Value::Text("acload".into()))
        );
    }

    #[tokio::test]
    async fn test_unknown_role_string_is_reset() {
        let mut h = harness(em_channel(1), Some("switch:51")).await;

        assert_eq!(h.meter.initialize().await, Some(RoleName::AcLoad));
        assert_eq!(h.settings.get_value(ROLE_KEY), Some(json!("acload:51")));
    }

    #[tokio::test]
    async fn test_missing_setting_uses_default_role_and_instance() {
        let mut h = harness(em_channel(1), None).await;

        assert_eq!(h.meter.initialize().await, Some(RoleName::AcLoad));
        assert_eq!(h.meter.instance(), crate::role::DEFAULT_INSTANCE);
        assert_eq!(h.settings.get_value(ROLE_KEY), Some(json!("acload:50")));
        // The registered default is already valid, nothing to correct
        assert_eq!(h.settings.writes(), 0);
    }

    #[tokio::test]
    async fn test_initialize_twice_is_idempotent() {
        let mut h = harness(em_channel(3), Some("pvinverter:7")).await;

        let first = h.meter.initialize().await;
        let first_instance = h.meter.instance();
        let second = h.meter.initialize().await;

        assert_eq!(first, Some(RoleName::PvInverter));
        assert_eq!(first, second);
        assert_eq!(first_instance, h.meter.instance());
        assert_eq!(h.settings.writes(), 0);
        assert_eq!(h.settings.get_value(ROLE_KEY), Some(json!("pvinverter:7")));
    }

    #[tokio::test]
    async fn test_published_items_for_pv_inverter() {
        let mut h = harness(em_channel(2), Some("pvinverter:7")).await;
        h.meter.initialize().await;
        let registry = h.meter.registry();

        assert!(registry.is_writeable(DataPath::Role));
        assert!(!registry.is_writeable(DataPath::AllowedRoles));
        assert_eq!(
            registry.value(DataPath::AllowedRoles),
            Some(Value::TextArray(vec![
                "acload".into(),
                "pvinverter".into(),
                "genset".into()
            ]))
        );
        assert_eq!(
            registry.value(DataPath::IsGenericEnergyMeter),
            Some(Value::Integer(1))
        );
        assert!(registry.is_writeable(DataPath::Position));
        assert_eq!(registry.value(DataPath::Position), Some(Value::Integer(0)));
        assert_eq!(registry.value(DataPath::DeviceInstance), Some(Value::Integer(7)));
        assert!(registry.is_registered(DataPath::Phase(Phase::L2, PhaseMetric::Power)));
        assert!(!registry.is_registered(DataPath::Phase(Phase::L3, PhaseMetric::Power)));
        assert_eq!(
            h.meter.service_name(),
            "com.victronenergy.pvinverter.shelly_abc123_0"
        );
    }

    #[tokio::test]
    async fn test_position_only_published_for_pv_inverter() {
        let mut h = harness(em_channel(1), Some("genset:7")).await;
        h.meter.initialize().await;

        assert!(!h.meter.registry().is_registered(DataPath::Position));
        // The setting still exists for a later switch to pvinverter
        assert_eq!(h.settings.get_value(POSITION_KEY), Some(json!(0)));
    }

    #[tokio::test]
    async fn test_switch_channel_has_no_position_setting() {
        let mut h = harness(switch_channel(), None).await;
        h.meter.initialize().await;

        assert!(h.settings.alias("position_sw42_1").is_none());
        assert!(!h.meter.registry().is_registered(DataPath::Position));
        assert_eq!(
            h.meter.registry().value(DataPath::ProductId),
            Some(Value::Integer(PRODUCT_ID_SHELLY_SWITCH))
        );
        assert!(!h.meter.handle_position_change_request(1).await);
    }

    #[tokio::test]
    async fn test_grid_role_is_not_marked_generic() {
        let channel = DeviceChannel {
            allowed_roles: AllowedRoles::new(vec![RoleName::Grid, RoleName::PvInverter])
                .unwrap(),
            ..em_channel(3)
        };
        let mut h = harness(channel, Some("grid:40")).await;

        assert_eq!(h.meter.initialize().await, Some(RoleName::Grid));
        assert!(!h
            .meter
            .registry()
            .is_registered(DataPath::IsGenericEnergyMeter));
    }

    #[tokio::test]
    async fn test_role_change_keeps_instance_and_restarts_once() {
        let mut h = harness(em_channel(3), Some("acload:12")).await;
        h.meter.initialize().await;

        assert!(h.meter.handle_role_change_request("genset"));
        assert_eq!(h.meter.role(), Some(RoleName::Genset));
        assert_eq!(h.meter.instance(), 12);
        assert_eq!(h.settings.get_value(ROLE_KEY), Some(json!("genset:12")));
        assert_eq!(
            h.meter.registry().value(DataPath::Role),
            Some(Value::Text("genset".into()))
        );

        wait_for_restarts(&h.controller, &h.tasks, 1).await;
        assert_eq!(h.controller.restarts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_rejected_role_change_leaves_state_alone() {
        let mut h = harness(em_channel(3), Some("pvinverter:12")).await;
        h.meter.initialize().await;

        assert!(!h.meter.handle_role_change_request("grid"));
        assert!(!h.meter.handle_role_change_request("bogus"));

        assert_eq!(h.meter.role(), Some(RoleName::PvInverter));
        assert_eq!(h.settings.get_value(ROLE_KEY), Some(json!("pvinverter:12")));
        assert_eq!(h.settings.writes(), 0);
        assert!(h.tasks.is_empty());
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(h.controller.restarts.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_failed_restart_is_not_reported_to_caller() {
        let settings = RecordingSettings::default();
        let controller = Arc::new(CountingController {
            fail: true,
            ..Default::default()
        });
        let tasks = BackgroundTasks::new();
        let mut meter = EnergyMeter::new(
            em_channel(1),
            DataPointRegistry::new(),
            Arc::new(settings),
            controller.clone(),
        )
        .with_background_tasks(tasks.clone());
        meter.initialize().await;

        assert!(meter.handle_role_change_request("pvinverter"));
        assert!(meter.handle_role_change_request("genset"));
        wait_for_restarts(&controller, &tasks, 2).await;
    }

    #[tokio::test]
    async fn test_position_change() {
        let mut h = harness(em_channel(3), Some("pvinverter:12")).await;
        h.meter.initialize().await;

        assert!(!h.meter.handle_position_change_request(3).await);
        assert!(!h.meter.handle_position_change_request(-1).await);
        assert_eq!(h.settings.writes(), 0);
        assert_eq!(h.settings.get_value(POSITION_KEY), Some(json!(0)));

        assert!(h.meter.handle_position_change_request(1).await);
        assert_eq!(h.settings.get_value(POSITION_KEY), Some(json!(1)));
        assert_eq!(
            h.meter.registry().value(DataPath::Position),
            Some(Value::Integer(1))
        );
    }

    #[tokio::test]
    async fn test_external_writes_are_routed() {
        let mut h = harness(em_channel(3), Some("pvinverter:12")).await;
        h.meter.initialize().await;

        assert!(
            h.meter
                .handle_external_write(DataPath::Position, Value::Integer(2))
                .await
        );
        assert!(
            h.meter
                .handle_external_write(DataPath::CustomName, Value::Text("Garage PV".into()))
                .await
        );
        assert_eq!(
            h.meter.registry().value(DataPath::CustomName),
            Some(Value::Text("Garage PV".into()))
        );
        assert!(
            !h.meter
                .handle_external_write(DataPath::AcPower, Value::Double(1.0))
                .await
        );
        assert!(
            !h.meter
                .handle_external_write(DataPath::Role, Value::Integer(1))
                .await
        );
        assert!(
            h.meter
                .handle_external_write(DataPath::Role, Value::Text("acload".into()))
                .await
        );
        assert_eq!(h.meter.role(), Some(RoleName::AcLoad));
        wait_for_restarts(&h.controller, &h.tasks, 1).await;
    }

    #[tokio::test]
    async fn test_relay_without_metering_has_no_role() {
        let mut h = harness(relay_channel(), None).await;

        assert_eq!(h.meter.initialize().await, None);
        assert_eq!(h.meter.service_name(), "com.victronenergy.switch.shelly_relay7_0");
        let registry = h.meter.registry();
        assert!(!registry.is_registered(DataPath::Role));
        assert!(!registry.is_registered(DataPath::AcPower));
        assert!(registry.is_writeable(DataPath::OutputState));
        assert_eq!(
            registry.value(DataPath::OutputName),
            Some(Value::Text("Channel 1".into()))
        );
        assert!(h.settings.alias("instance_relay7_0").is_none());

        assert!(!h.meter.handle_role_change_request("acload"));
        assert_eq!(h.settings.writes(), 0);
    }

    #[tokio::test]
    async fn test_output_write_switches_relay() {
        let mut h = harness(switch_channel(), None).await;
        h.meter.initialize().await;

        assert!(
            h.meter
                .handle_external_write(DataPath::OutputState, Value::Integer(1))
                .await
        );
        assert_eq!(
            h.meter.registry().value(DataPath::OutputState),
            Some(Value::Integer(1))
        );
        assert!(!h.meter.handle_output_change_request(2).await);
        assert!(
            !h.meter
                .handle_external_write(DataPath::OutputStatus, Value::Integer(OUTPUT_STATUS_ON))
                .await
        );
        assert_eq!(*h.controller.outputs.lock().unwrap(), vec![true]);
    }

    #[tokio::test]
    async fn test_failed_output_write_keeps_state() {
        let controller = Arc::new(CountingController {
            fail: true,
            ..Default::default()
        });
        let mut meter = EnergyMeter::new(
            relay_channel(),
            DataPointRegistry::new(),
            Arc::new(RecordingSettings::default()),
            controller,
        )
        .with_background_tasks(BackgroundTasks::new());
        meter.initialize().await;

        assert!(!meter.handle_output_change_request(1).await);
        assert_eq!(
            meter.registry().value(DataPath::OutputState),
            Some(Value::Integer(0))
        );
    }

    #[tokio::test]
    async fn test_meter_without_relay_refuses_output_writes() {
        let mut h = harness(em_channel(1), None).await;
        h.meter.initialize().await;

        assert!(!h.meter.registry().is_registered(DataPath::OutputState));
        assert!(
            !h.meter
                .handle_external_write(DataPath::OutputState, Value::Integer(1))
                .await
        );
        assert!(!h.meter.handle_output_change_request(1).await);
        assert!(h.controller.outputs.lock().unwrap().is_empty());
    }
}
