//! Dual-output linear supply (Agilent E3648A).
//!
//! Channel-scoped commands (measurements and limits) are each preceded by
//! `INST:SEL OUT<n>`. Output on/off and the output-state query act on the
//! whole instrument. The generic [`PowerSupply`] contract targets channel 1.

use super::Link;
use crate::commands::{CommandSet, IDENTIFY};
use crate::descriptors::DriverDescriptor;
use async_trait::async_trait;
use psu_core::{
    check_channel, LimitSetting, MultiChannelSupply, PowerReading, PowerSupply, PsuResult,
    SafeRange,
};
use tracing::instrument;

pub struct DualChannelSupply {
    descriptor: DriverDescriptor,
    commands: CommandSet,
    link: Link,
    bus_address: Option<u8>,
}

impl DualChannelSupply {
    pub fn new(descriptor: DriverDescriptor, link: Link, bus_address: Option<u8>) -> Self {
        Self {
            descriptor,
            commands: CommandSet::DUAL_CHANNEL,
            link,
            bus_address,
        }
    }

    /// Lines that run `command` on `channel`.
    fn scoped(&self, channel: u8, command: &str) -> PsuResult<Vec<String>> {
        let mut lines = Vec::with_capacity(2);
        if let Some(select) = self.commands.select_channel(channel)? {
            lines.push(select);
        }
        lines.push(command.to_string());
        Ok(lines)
    }

    async fn query_channel(&self, channel: u8, command: &str) -> PsuResult<f64> {
        let select = self.commands.select_channel(channel)?;
        let mut link = self.link.at(self.bus_address).await?;
        if let Some(select) = select {
            link.write(&select).await?;
        }
        link.query_f64(command).await
    }
}

#[async_trait]
impl PowerSupply for DualChannelSupply {
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

    async fn try_read_power(&self) -> PsuResult<PowerReading> {
        self.try_read_power_channel(1).await
    }

    async fn read_limits(&self) -> PsuResult<LimitSetting> {
        self.read_limits_channel(1).await
    }

    async fn set_limits(&self, voltage: f64, current: f64) -> PsuResult<()> {
        self.set_limits_channel(1, voltage, current).await
    }
}

#[async_trait]
impl MultiChannelSupply for DualChannelSupply {
    fn channels(&self) -> u8 {
        self.descriptor.channels
    }

    #[instrument(skip(self), err)]
    async fn try_read_power_channel(&self, channel: u8) -> PsuResult<PowerReading> {
        check_channel(channel, self.channels())?;
        let voltage = self
            .query_channel(channel, self.commands.measure_voltage)
            .await?;
        let current = self
            .query_channel(channel, self.commands.measure_current)
            .await?;
        let on = self
            .link
            .at(self.bus_address)
            .await?
            .query_output(self.commands.output_query)
            .await?;
        Ok(PowerReading::new(on, voltage, current))
    }

    #[instrument(skip(self), err)]
    async fn read_limits_channel(&self, channel: u8) -> PsuResult<LimitSetting> {
        check_channel(channel, self.channels())?;
        let voltage = self
            .query_channel(channel, self.commands.voltage_limit)
            .await?;
        let current = self
            .query_channel(channel, self.commands.current_limit)
            .await?;
        Ok(LimitSetting::new(voltage, current))
    }

    #[instrument(skip(self), err)]
    async fn set_limits_channel(&self, channel: u8, voltage: f64, current: f64) -> PsuResult<()> {
        check_channel(channel, self.channels())?;
        self.descriptor
            .safe_range
            .check(&LimitSetting::new(voltage, current))?;

        let mut lines = self.scoped(channel, &self.commands.set_voltage(voltage)?)?;
        lines.extend(self.scoped(channel, &self.commands.set_current(current)?)?);

        let mut link = self.link.at(self.bus_address).await?;
        for line in &lines {
            link.write(line).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptors::{DescriptorTable, AGILENT_E3648A};
    use crate::transport::{Endpoint, SimulatedBench, SimulatedInstrument};
    use psu_core::PsuError;

    const PROXY: &str = "192.168.1.50:1234";

    fn supply() -> (SimulatedBench, DualChannelSupply, Endpoint) {
        let bench = SimulatedBench::new();
        bench.add_gpib_instrument(PROXY, 6, SimulatedInstrument::agilent_e3648a());
        let descriptor = DescriptorTable::builtin()
            .lookup(AGILENT_E3648A)
            .cloned()
            .unwrap();
        let link = Link::new(Box::new(bench.transport(PROXY)));
        (
            bench,
            DualChannelSupply::new(descriptor, link, Some(6)),
            Endpoint::gpib(PROXY, 6),
        )
    }

    #[tokio::test]
    async fn channel_commands_are_prefixed_with_output_select() {
        let (bench, supply, endpoint) = supply();
        supply.open().await.unwrap();
        supply.set_limits_2(0.0, 0.6).await.unwrap();
        supply.set_limits_1(1.2, 0.6).await.unwrap();
        supply.release().await.unwrap();

        assert_eq!(
            bench.writes_to(&endpoint),
            vec![
                "INST:SEL OUT2",
                "VOLT 0",
                "INST:SEL OUT2",
                "CURR 0.6",
                "INST:SEL OUT1",
                "VOLT 1.2",
                "INST:SEL OUT1",
                "CURR 0.6",
            ]
        );
        let ch2 = bench.with_instrument(&endpoint, |i| i.channel(2)).flatten().unwrap();
        assert_eq!(ch2.voltage, 0.0);
    }

    #[tokio::test]
    async fn generic_contract_targets_channel_one() {
        let (_bench, supply, _) = supply();
        supply.open().await.unwrap();
        supply.set_limits(1.2, 0.6).await.unwrap();
        supply.turn_on().await.unwrap();

        let reading = supply.read_power().await;
        assert_eq!(reading, PowerReading::new(true, 1.2, 0.6));
        assert_eq!(supply.read_limits_1().await.unwrap(), LimitSetting::new(1.2, 0.6));
        assert_eq!(supply.read_power_2().await, PowerReading::new(true, 0.0, 0.0));
    }

    #[tokio::test]
    async fn invalid_channel_is_rejected_before_any_write() {
        let (bench, supply, endpoint) = supply();
        supply.open().await.unwrap();

        for channel in [0, 3] {
            let err = supply.set_limits_channel(channel, 1.0, 0.6).await.unwrap_err();
            assert!(matches!(err, PsuError::UnsafeParameter { quantity: "channel", .. }));
        }
        assert!(supply.read_power_channel(3).await.is_sentinel());
        assert!(bench.writes_to(&endpoint).is_empty());
    }

    #[tokio::test]
    async fn unsafe_voltage_on_channel_two_writes_nothing() {
        let (bench, supply, endpoint) = supply();
        supply.open().await.unwrap();
        assert!(supply.set_limits_2(1.4, 0.6).await.is_err());
        assert!(bench.writes_to(&endpoint).is_empty());
    }
}
