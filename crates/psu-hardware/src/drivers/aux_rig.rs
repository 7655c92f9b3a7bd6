//! Auxiliary test rig: ASIC bias supply plus a multimeter on one GPIB bus.
//!
//! Sub-instruments (addresses from the descriptor, defaults in brackets):
//! - bias supply [8]: `V <v>`, `I <i>`, `OP 1`/`OP 0`, `VO?`
//! - RTD meter [12]: four-wire resistance, `:READ?`
//! - current meter [12]: DC current, `:READ?`
//!
//! The RTD and current meter are usually the same instrument in two
//! functions. The driver remembers which function each meter address was last
//! configured for and reconfigures before reading in the other one.
//!
//! The bias supply has no output-state query; the rig always reports its
//! output as on.

use super::Link;
use crate::commands::{render, rig, IDENTIFY};
use crate::descriptors::{DriverDescriptor, RigAddresses};
use async_trait::async_trait;
use parking_lot::Mutex;
use psu_core::{LimitSetting, PowerReading, PowerSupply, PsuError, PsuResult, SafeRange};
use std::collections::HashMap;
use tracing::instrument;

/// Pt1000 nominal resistance at 0 C (ohms).
const RTD_R0: f64 = 1000.0;
/// Linear temperature coefficient of platinum RTDs (1/C).
const RTD_ALPHA: f64 = 0.00385;

/// Linear PT-RTD approximation: resistance (ohms) to temperature (C).
pub fn rtd_temperature(resistance: f64) -> f64 {
    ((resistance / RTD_R0) - 1.0) / RTD_ALPHA
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MeterMode {
    Resistance,
    Current,
}

/// Temperature read-back from the RTD meter.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RtdReading {
    pub temperature: f64,
    pub resistance: f64,
}

pub struct AuxRig {
    descriptor: DriverDescriptor,
    link: Link,
    addresses: RigAddresses,
    meter_modes: Mutex<HashMap<u8, MeterMode>>,
    programmed: Mutex<Option<LimitSetting>>,
}

impl AuxRig {
    pub fn new(descriptor: DriverDescriptor, link: Link, addresses: RigAddresses) -> Self {
        Self {
            descriptor,
            link,
            addresses,
            meter_modes: Mutex::new(HashMap::new()),
            programmed: Mutex::new(None),
        }
    }

    pub fn addresses(&self) -> RigAddresses {
        self.addresses
    }

    async fn configure_meter(&self, address: u8, mode: MeterMode) -> PsuResult<()> {
        let setup = match mode {
            MeterMode::Resistance => rig::RTD_SETUP,
            MeterMode::Current => rig::CURRENT_SETUP,
        };
        // Unknown until the setup completes
        self.meter_modes.lock().remove(&address);

        let mut link = self.link.at(Some(address)).await?;
        for command in setup {
            link.write(command).await?;
        }
        self.meter_modes.lock().insert(address, mode);
        Ok(())
    }

    async fn read_meter(&self, address: u8, mode: MeterMode) -> PsuResult<f64> {
        let configured = self.meter_modes.lock().get(&address).copied();
        if configured != Some(mode) {
            self.configure_meter(address, mode).await?;
        }
        let mut link = self.link.at(Some(address)).await?;
        link.query_f64(rig::METER_READ).await
    }

    /// Configure the RTD meter for four-wire resistance on the 1 kOhm range.
    #[instrument(skip(self), err)]
    pub async fn configure_rtd(&self) -> PsuResult<()> {
        self.configure_meter(self.addresses.rtd, MeterMode::Resistance)
            .await
    }

    /// Read the RTD and convert to temperature.
    #[instrument(skip(self), err)]
    pub async fn read_rtd(&self) -> PsuResult<RtdReading> {
        let resistance = self
            .read_meter(self.addresses.rtd, MeterMode::Resistance)
            .await?;
        Ok(RtdReading {
            temperature: rtd_temperature(resistance),
            resistance,
        })
    }

    /// Configure the current meter for DC current on the 1 A range.
    #[instrument(skip(self), err)]
    pub async fn configure_current_meter(&self) -> PsuResult<()> {
        self.configure_meter(self.addresses.current_meter, MeterMode::Current)
            .await
    }

    #[instrument(skip(self), err)]
    pub async fn read_bias_current(&self) -> PsuResult<f64> {
        self.read_meter(self.addresses.current_meter, MeterMode::Current)
            .await
    }

    /// Bias voltage as reported by the supply.
    pub async fn read_bias_voltage(&self) -> PsuResult<f64> {
        let mut link = self.link.at(Some(self.addresses.bias)).await?;
        link.query_f64(rig::READ_VOLTAGE).await
    }

    async fn write_limits(&self, limits: LimitSetting, then_enable: bool) -> PsuResult<()> {
        self.descriptor.safe_range.check(&limits)?;
        let set_voltage = render(rig::SET_VOLTAGE, &[("val", limits.voltage.to_string())])?;
        let set_current = render(rig::SET_CURRENT, &[("val", limits.current.to_string())])?;

        let mut link = self.link.at(Some(self.addresses.bias)).await?;
        link.write(&set_voltage).await?;
        link.write(&set_current).await?;
        *self.programmed.lock() = Some(limits);
        if then_enable {
            link.write(rig::OUTPUT_ON).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl PowerSupply for AuxRig {
    fn model(&self) -> &str {
        &self.descriptor.identification
    }

    fn safe_range(&self) -> SafeRange {
        self.descriptor.safe_range
    }

    fn default_current(&self) -> f64 {
        self.descriptor.default_current
    }

    async fn open(&self) -> PsuResult<()> {
        self.link.open().await
    }

    async fn release(&self) -> PsuResult<()> {
        self.link.release().await
    }

    #[instrument(skip(self), err)]
    async fn identify(&self) -> PsuResult<String> {
        let mut link = self.link.at(Some(self.addresses.bias)).await?;
        Ok(link.query(IDENTIFY).await?.trim().to_string())
    }

    async fn is_output_on(&self) -> PsuResult<bool> {
        Ok(true)
    }

    /// Apply the default bias, then enable the output.
    #[instrument(skip(self), err)]
    async fn turn_on(&self) -> PsuResult<()> {
        let defaults = LimitSetting::new(
            self.descriptor.default_voltage,
            self.descriptor.default_current,
        );
        self.write_limits(defaults, true).await
    }

    #[instrument(skip(self), err)]
    async fn turn_off(&self) -> PsuResult<()> {
        let mut link = self.link.at(Some(self.addresses.bias)).await?;
        link.write(rig::OUTPUT_OFF).await
    }

    #[instrument(skip(self), err)]
    async fn try_read_power(&self) -> PsuResult<PowerReading> {
        let voltage = self.read_bias_voltage().await?;
        let current = self.read_bias_current().await?;
        Ok(PowerReading::new(true, voltage, current))
    }

    async fn read_limits(&self) -> PsuResult<LimitSetting> {
        (*self.programmed.lock()).ok_or_else(|| PsuError::Unsupported {
            model: self.descriptor.identification.clone(),
            operation: "limit read-back before limits are programmed",
        })
    }

    #[instrument(skip(self), err)]
    async fn set_limits(&self, voltage: f64, current: f64) -> PsuResult<()> {
        self.write_limits(LimitSetting::new(voltage, current), false)
            .await
    }
}
