use crate::data_point::Phase;
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;

/// The device counts energy in Wh, the bus publishes kWh
pub const WH_PER_KWH: f64 = 1000.0;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum TelemetryError {
    #[error("missing field `{0}`")]
    MissingField(String),
    #[error("field `{0}` is not a number")]
    NotNumeric(String),
    #[error("malformed status: {0}")]
    Malformed(String),
}

fn required_f64(status: &Value, key: &str) -> Result<f64, TelemetryError> {
    match status.get(key) {
        None => Err(TelemetryError::MissingField(key.to_string())),
        Some(value) => value
            .as_f64()
            .ok_or_else(|| TelemetryError::NotNumeric(key.to_string())),
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct EnergyCounter {
    /// Lifetime total in Wh
    pub total: Option<f64>,
}

/// Status of a relay channel with metering (`Switch.GetStatus`).
/// Every metric is optional; firmwares differ in what they report.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct SwitchStatus {
    /// Relay closed
    pub output: Option<bool>,
    pub voltage: Option<f64>,
    pub current: Option<f64>,
    pub apower: Option<f64>,
    pub pf: Option<f64>,
    pub aenergy: Option<EnergyCounter>,
    pub ret_aenergy: Option<EnergyCounter>,
}

impl SwitchStatus {
    pub fn decode(status: &Value) -> Result<Self, TelemetryError> {
        Self::deserialize(status).map_err(|e| TelemetryError::Malformed(e.to_string()))
    }

    pub fn energy_forward_kwh(&self) -> Option<f64> {
        self.aenergy
            .as_ref()
            .and_then(|e| e.total)
            .map(|wh| wh / WH_PER_KWH)
    }

    pub fn energy_reverse_kwh(&self) -> Option<f64> {
        self.ret_aenergy
            .as_ref()
            .and_then(|e| e.total)
            .map(|wh| wh / WH_PER_KWH)
    }
}

/// Instantaneous readings for one line of a multi-phase meter (`EM.GetStatus`)
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PhaseReading {
    pub voltage: f64,
    pub current: f64,
    pub power: f64,
    pub power_factor: f64,
}

impl PhaseReading {
    /// Reads `{p}_voltage`, `{p}_current`, `{p}_aprt_power` and `{p}_pf`.
    /// All four must be present.
    pub fn decode(status: &Value, phase: Phase) -> Result<Self, TelemetryError> {
        let p = phase.device_prefix();
        Ok(Self {
            voltage: required_f64(status, &format!("{p}_voltage"))?,
            current: required_f64(status, &format!("{p}_current"))?,
            power: required_f64(status, &format!("{p}_aprt_power"))?,
            power_factor: required_f64(status, &format!("{p}_pf"))?,
        })
    }
}

/// Cumulative per-line energy counters (`EMData.GetStatus`), in kWh
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PhaseEnergy {
    pub phase: Phase,
    pub forward_kwh: f64,
    pub reverse_kwh: f64,
}

/// Decodes energy totals for every phase up front, so a bad payload is
/// rejected as a whole
pub fn decode_energy_totals(
    emdata: &Value,
    num_phases: u8,
) -> Result<Vec<PhaseEnergy>, TelemetryError> {
    Phase::all(num_phases)
        .map(|phase| {
            let p = phase.device_prefix();
            Ok(PhaseEnergy {
                phase,
                forward_kwh: required_f64(emdata, &format!("{p}_total_act_energy"))?
                    / WH_PER_KWH,
                reverse_kwh: required_f64(emdata, &format!("{p}_total_act_ret_energy"))?
                    / WH_PER_KWH,
            })
        })
        .collect()
}

/// Number of lines an `EM.GetStatus` payload reports voltage for
pub fn count_phases(status: &Value) -> u8 {
    Phase::all(3)
        .filter(|phase| {
            status
                .get(format!("{}_voltage", phase.device_prefix()))
                .is_some()
        })
        .count() as u8
}
