use crate::data_point::{self, DataPath, Phase, PhaseMetric, Transaction};
use crate::energy_meter::{EnergyMeter, OUTPUT_STATUS_OFF, OUTPUT_STATUS_ON};
use crate::telemetry::{decode_energy_totals, PhaseReading, SwitchStatus, TelemetryError};
use serde_json::Value;
use std::fmt;
use std::sync::atomic::Ordering;

impl EnergyMeter {
    /// Applies one status report from the device.
    ///
    /// Per-line values and the recomputed totals are committed together. When
    /// a multi-phase report is missing a required field the lines before it
    /// keep their new values, the rest keep their old ones, and the totals are
    /// still recomputed from whatever is published. Relay channels also get
    /// their output state refreshed.
    pub fn update_from_status(&self, status: &Value) {
        if !self.channel.has_em && !self.channel.has_switch {
            return;
        }

        let mut tx = self.registry.transaction();
        let staged = if self.channel.has_switch {
            self.stage_switch_status(&mut tx, status)
        } else {
            self.stage_phase_status(&mut tx, status)
        };
        if let Err(e) = staged {
            self.aborted_status_updates.fetch_add(1, Ordering::Relaxed);
            tracing::error!("Error in status update for {}: {}", self.channel, e);
        }

        if self.channel.has_em {
            self.stage_totals(&mut tx);
        }
        tx.commit();
    }

    fn stage_switch_status(
        &self,
        tx: &mut Transaction<'_>,
        status: &Value,
    ) -> Result<(), TelemetryError> {
        let status = SwitchStatus::decode(status)?;
        if let Some(on) = status.output {
            let reported = if on { OUTPUT_STATUS_ON } else { OUTPUT_STATUS_OFF };
            tx.set(DataPath::OutputState, Some(data_point::Value::Integer(on.into())));
            tx.set(DataPath::OutputStatus, Some(data_point::Value::Integer(reported)));
        }
        if !self.channel.has_em {
            return Ok(());
        }

        let l1 = |metric| DataPath::Phase(Phase::L1, metric);

        tx.set_f64(l1(PhaseMetric::Voltage), status.voltage);
        tx.set_f64(l1(PhaseMetric::Current), status.current);
        tx.set_f64(l1(PhaseMetric::Power), status.apower);
        tx.set_f64(l1(PhaseMetric::PowerFactor), status.pf);
        tx.set_f64(l1(PhaseMetric::EnergyForward), status.energy_forward_kwh());
        tx.set_f64(l1(PhaseMetric::EnergyReverse), status.energy_reverse_kwh());
        Ok(())
    }

    // Stops at the first line with a missing field; earlier lines stay staged.
    // TODO: decide whether later lines should still be applied when an
    // earlier one is incomplete, rather than going stale for the cycle.
    fn stage_phase_status(
        &self,
        tx: &mut Transaction<'_>,
        status: &Value,
    ) -> Result<(), TelemetryError> {
        for phase in Phase::all(self.channel.num_phases) {
            let reading = PhaseReading::decode(status, phase)?;
            tx.set_f64(
                DataPath::Phase(phase, PhaseMetric::Voltage),
                Some(reading.voltage),
            );
            tx.set_f64(
                DataPath::Phase(phase, PhaseMetric::Current),
                Some(reading.current),
            );
            tx.set_f64(DataPath::Phase(phase, PhaseMetric::Power), Some(reading.power));
            tx.set_f64(
                DataPath::Phase(phase, PhaseMetric::PowerFactor),
                Some(reading.power_factor),
            );
        }
        Ok(())
    }

    /// Sums the per-line values into the device totals, counting "no data" as 0
    fn stage_totals(&self, tx: &mut Transaction<'_>) {
        let (mut forward, mut reverse, mut power) = (0.0, 0.0, 0.0);
        for phase in Phase::all(self.channel.num_phases) {
            forward += tx.f64_or_zero(DataPath::Phase(phase, PhaseMetric::EnergyForward));
            reverse += tx.f64_or_zero(DataPath::Phase(phase, PhaseMetric::EnergyReverse));
            power += tx.f64_or_zero(DataPath::Phase(phase, PhaseMetric::Power));
        }
        tx.set_f64(DataPath::AcEnergyForward, Some(forward));
        tx.set_f64(DataPath::AcEnergyReverse, Some(reverse));
        tx.set_f64(DataPath::AcPower, Some(power));
    }

    /// Applies the cumulative per-line energy counters (`EMData.GetStatus`).
    ///
    /// A payload that does not decode for every line is dropped as a whole:
    /// no line is written, not even the ones before the bad field. It is only
    /// counted; see [`EnergyMeter::rejected_energy_totals`].
    pub fn update_from_energy_totals(&self, emdata: &Value) {
        if !self.channel.has_em {
            return;
        }
        let totals = match decode_energy_totals(emdata, self.channel.num_phases) {
            Ok(totals) => totals,
            Err(e) => {
                self.reject_energy_totals(e);
                return;
            }
        };

        let mut tx = self.registry.transaction();
        for energy in totals {
            tx.set_f64(
                DataPath::Phase(energy.phase, PhaseMetric::EnergyForward),
                Some(energy.forward_kwh),
            );
            tx.set_f64(
                DataPath::Phase(energy.phase, PhaseMetric::EnergyReverse),
                Some(energy.reverse_kwh),
            );
        }
        tx.commit();
    }

    /// Counts a cycle without usable energy totals, e.g. because the device
    /// could not be asked for them. Published values are left alone.
    pub fn reject_energy_totals(&self, reason: impl fmt::Display) {
        self.rejected_energy_totals.fetch_add(1, Ordering::Relaxed);
        tracing::debug!("Ignoring energy totals for {}: {}", self.channel, reason);
    }

    /// Status reports that stopped early because of a missing or malformed field
    pub fn aborted_status_updates(&self) -> u64 {
        self.aborted_status_updates.load(Ordering::Relaxed)
    }

    /// Energy-total payloads dropped because they did not decode
    pub fn rejected_energy_totals(&self) -> u64 {
        self.rejected_energy_totals.load(Ordering::Relaxed)
    }
}
