//! Compact supply on its own SCPI socket (Siglent SPD1000X class).
//!
//! Same capability set as the single-output linear supply, in the vendor's
//! `CH1:` dialect. The output state is bit 4 of the `SYST:STAT?` status
//! word; there is no dedicated output query.

use super::{Link, SingleChannelSupply};
use crate::commands::CommandSet;
use crate::descriptors::DriverDescriptor;
use async_trait::async_trait;
use psu_core::{LimitSetting, PowerReading, PowerSupply, PsuResult, SafeRange};

pub struct SocketSupply {
    inner: SingleChannelSupply,
}

impl SocketSupply {
    pub fn new(descriptor: DriverDescriptor, link: Link) -> Self {
        Self {
            inner: SingleChannelSupply::with_commands(
                descriptor,
                CommandSet::SOCKET_SUPPLY,
                link,
                None,
            ),
        }
    }
}

#[async_trait]
impl PowerSupply for SocketSupply {
    fn model(&self) -> &str {
        self.inner.model()
    }

    fn safe_range(&self) -> SafeRange {
        self.inner.safe_range()
    }

    fn default_current(&self) -> f64 {
        self.inner.default_current()
    }

    async fn open(&self) -> PsuResult<()> {
        self.inner.open().await
    }

    async fn release(&self) -> PsuResult<()> {
        self.inner.release().await
    }

    async fn identify(&self) -> PsuResult<String> {
        self.inner.identify().await
    }

    async fn is_output_on(&self) -> PsuResult<bool> {
        self.inner.is_output_on().await
    }

    async fn turn_on(&self) -> PsuResult<()> {
        self.inner.turn_on().await
    }

    async fn turn_off(&self) -> PsuResult<()> {
        self.inner.turn_off().await
    }

    async fn try_read_power(&self) -> PsuResult<PowerReading> {
        self.inner.try_read_power().await
    }

    async fn read_limits(&self) -> PsuResult<LimitSetting> {
        self.inner.read_limits().await
    }

    async fn set_limits(&self, voltage: f64, current: f64) -> PsuResult<()> {
        self.inner.set_limits(voltage, current).await
    }
}
