use crate::energy_meter::DeviceChannel;
use crate::role::AllowedRoles;
use crate::telemetry::count_phases;
use serde_derive::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Upper bound when probing switch channels, in case a device answers every id
const MAX_SWITCH_CHANNELS: u32 = 16;

#[derive(Debug, Error)]
pub enum RpcError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("device returned HTTP {0}")]
    Status(reqwest::StatusCode),
    #[error("device error {code}: {message}")]
    Device { code: i64, message: String },
}

#[derive(Default, Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub id: String,
    pub mac: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub gen: Option<u8>,
    #[serde(default)]
    pub fw_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct MethodList {
    methods: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct RpcErrorBody {
    code: i64,
    message: String,
}

/// What a device can do, as found by [`ShellyRpcClient::detect_capabilities`]
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceCapabilities {
    pub has_switch: bool,
    pub has_em: bool,
    pub num_channels: u32,
    pub num_phases: u8,
    /// `None` when the device has no metering
    pub allowed_roles: Option<AllowedRoles>,
}

impl DeviceCapabilities {
    pub fn is_supported(&self) -> bool {
        self.has_switch || self.has_em
    }

    /// Describes one channel of the device. `None` for channels that do not
    /// exist or devices that can neither switch nor meter.
    pub fn channel(&self, serial: &str, channel: u32) -> Option<DeviceChannel> {
        if !self.is_supported() || channel >= self.num_channels {
            return None;
        }
        Some(DeviceChannel {
            serial: serial.to_string(),
            channel,
            num_phases: self.num_phases,
            has_switch: self.has_switch,
            has_em: self.has_em,
            // Only consulted when the channel meters
            allowed_roles: self
                .allowed_roles
                .clone()
                .unwrap_or_else(AllowedRoles::switch_with_metering),
        })
    }
}

/// Client for the Gen2 HTTP RPC interface (`GET /rpc/<Method>?id=<n>`)
#[derive(Clone)]
pub struct ShellyRpcClient {
    endpoint_url: String,
    client: reqwest::Client,
}

impl ShellyRpcClient {
    pub fn new(endpoint_url: impl Into<String>) -> Self {
        Self {
            endpoint_url: endpoint_url.into().trim_end_matches('/').to_string(),
            client: reqwest::Client::new(),
        }
    }

    async fn call(&self, method: &str, query: &[(&str, String)]) -> Result<Value, RpcError> {
        let url = format!("{}/rpc/{}", self.endpoint_url, method);
        let response = self.client.get(url).query(query).send().await?;
        let status = response.status();
        if status.is_success() {
            return Ok(response.json().await?);
        }
        match response.json::<RpcErrorBody>().await {
            Ok(body) => Err(RpcError::Device {
                code: body.code,
                message: body.message,
            }),
            Err(_) => Err(RpcError::Status(status)),
        }
    }

    async fn call_with_id(&self, method: &str, id: u32) -> Result<Value, RpcError> {
        self.call(method, &[("id", id.to_string())]).await
    }

    pub async fn device_info(&self) -> Result<DeviceInfo, RpcError> {
        let info = self.call("Shelly.GetDeviceInfo", &[]).await?;
        serde_json::from_value(info).map_err(|e| RpcError::Device {
            code: 0,
            message: format!("unexpected device info: {e}"),
        })
    }

    pub async fn list_methods(&self) -> Result<Vec<String>, RpcError> {
        let list = self.call("Shelly.ListMethods", &[]).await?;
        Ok(serde_json::from_value::<MethodList>(list)
            .map(|l| l.methods)
            .unwrap_or_default())
    }

    pub async fn switch_status(&self, channel: u32) -> Result<Value, RpcError> {
        self.call_with_id("Switch.GetStatus", channel).await
    }

    pub async fn em_status(&self, channel: u32) -> Result<Value, RpcError> {
        self.call_with_id("EM.GetStatus", channel).await
    }

    /// Cumulative per-line energy counters
    pub async fn emdata_status(&self, channel: u32) -> Result<Value, RpcError> {
        self.call_with_id("EMData.GetStatus", channel).await
    }

    /// Opens (`on == true`) or closes the relay of `channel`
    pub async fn switch_set(&self, channel: u32, on: bool) -> Result<Value, RpcError> {
        self.call(
            "Switch.Set",
            &[("id", channel.to_string()), ("on", on.to_string())],
        )
        .await
    }

    /// Status of `channel` from whichever component the device has
    pub async fn channel_status(&self, has_switch: bool, channel: u32) -> Result<Value, RpcError> {
        if has_switch {
            self.switch_status(channel).await
        } else {
            self.em_status(channel).await
        }
    }

    /// Collects the status of every switch channel, stopping at the first id that fails
    async fn switch_channels(&self) -> Vec<Value> {
        let mut channels = Vec::new();
        for id in 0..MAX_SWITCH_CHANNELS {
            match self.switch_status(id).await {
                Ok(status) => channels.push(status),
                Err(_) => break,
            }
        }
        channels
    }

    pub async fn detect_capabilities(&self) -> Result<DeviceCapabilities, RpcError> {
        let methods = self.list_methods().await?;
        let has = |name: &str| methods.iter().any(|m| m == name);

        let capabilities = if has("Switch.GetStatus") {
            let channels = self.switch_channels().await;
            let has_em = channels
                .first()
                .is_some_and(|status| status.get("aenergy").is_some());
            DeviceCapabilities {
                has_switch: true,
                has_em,
                num_channels: channels.len() as u32,
                num_phases: 1,
                allowed_roles: has_em.then(AllowedRoles::switch_with_metering),
            }
        } else if has("EM.GetStatus") {
            let status = self.em_status(0).await?;
            let num_phases = count_phases(&status);
            if num_phases == 0 {
                tracing::warn!(
                    "Shelly device at {} reports no line voltages, ignoring its meter",
                    self.endpoint_url
                );
            }
            let has_em = num_phases > 0;
            DeviceCapabilities {
                has_switch: false,
                has_em,
                num_channels: u32::from(has_em),
                num_phases,
                allowed_roles: has_em.then(AllowedRoles::metering_only),
            }
        } else {
            DeviceCapabilities {
                has_switch: false,
                has_em: false,
                num_channels: 0,
                num_phases: 0,
                allowed_roles: None,
            }
        };

        tracing::info!(
            "Shelly device at {} has {} channels, support switching: {}, energy metering: {}",
            self.endpoint_url,
            capabilities.num_channels,
            capabilities.has_switch,
            capabilities.has_em
        );
        Ok(capabilities)
    }
}
