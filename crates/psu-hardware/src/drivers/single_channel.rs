//! Single-output linear supply (Agilent E3642A, HP E3633A).
//!
//! Every operation addresses the supply on the shared bus first; commands act
//! on the sole output.

use super::Link;
use crate::commands::{CommandSet, IDENTIFY};
use crate::descriptors::DriverDescriptor;
use async_trait::async_trait;
use psu_core::{LimitSetting, PowerReading, PowerSupply, PsuResult, SafeRange};
use tracing::instrument;

pub struct SingleChannelSupply {
    descriptor: DriverDescriptor,
    commands: CommandSet,
    link: Link,
    bus_address: Option<u8>,
}

impl SingleChannelSupply {
    pub fn new(descriptor: DriverDescriptor, link: Link, bus_address: Option<u8>) -> Self {
        Self::with_commands(descriptor, CommandSet::LINEAR, link, bus_address)
    }

    pub fn with_commands(
        descriptor: DriverDescriptor,
        commands: CommandSet,
        link: Link,
        bus_address: Option<u8>,
    ) -> Self {
        Self {
            descriptor,
            commands,
            link,
            bus_address,
        }
    }
}

#[async_trait]
impl PowerSupply for SingleChannelSupply {
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
        let mut link = self.link.at(self.bus_address).await?;
        Ok(link.query(IDENTIFY).await?.trim().to_string())
    }

    #[instrument(skip(self), err)]
    async fn is_output_on(&self) -> PsuResult<bool> {
        let mut link = self.link.at(self.bus_address).await?;
        link.query_output(self.commands.output_query).await
    }

    #[instrument(skip(self), err)]
    async fn turn_on(&self) -> PsuResult<()> {
        let mut link = self.link.at(self.bus_address).await?;
        link.write(self.commands.output_on).await
    }

    #[instrument(skip(self), err)]
    async fn turn_off(&self) -> PsuResult<()> {
        let mut link = self.link.at(self.bus_address).await?;
        link.write(self.commands.output_off).await
    }

    #[instrument(skip(self), err)]
    async fn try_read_power(&self) -> PsuResult<PowerReading> {
        let mut link = self.link.at(self.bus_address).await?;
        let voltage = link.query_f64(self.commands.measure_voltage).await?;
        let current = link.query_f64(self.commands.measure_current).await?;
        let on = link.query_output(self.commands.output_query).await?;
        Ok(PowerReading::new(on, voltage, current))
    }

    #[instrument(skip(self), err)]
    async fn read_limits(&self) -> PsuResult<LimitSetting> {
        let mut link = self.link.at(self.bus_address).await?;
        let voltage = link.query_f64(self.commands.voltage_limit).await?;
        let current = link.query_f64(self.commands.current_limit).await?;
        Ok(LimitSetting::new(voltage, current))
    }

    #[instrument(skip(self), err)]
    async fn set_limits(&self, voltage: f64, current: f64) -> PsuResult<()> {
        self.descriptor
            .safe_range
            .check(&LimitSetting::new(voltage, current))?;
        let set_voltage = self.commands.set_voltage(voltage)?;
        let set_current = self.commands.set_current(current)?;

        let mut link = self.link.at(self.bus_address).await?;
        link.write(&set_voltage).await?;
        link.write(&set_current).await
    }
}
