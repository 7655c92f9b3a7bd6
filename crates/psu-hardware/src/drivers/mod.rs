//! Instrument driver variants.
//!
//! Every variant implements [`PowerSupply`] on top of one [`Link`]:
//!
//! - [`SingleChannelSupply`]: linear supply with one output
//! - [`DualChannelSupply`]: linear supply with two outputs, also
//!   [`MultiChannelSupply`]
//! - [`SocketSupply`]: compact supply on its own SCPI socket
//! - [`AuxRig`]: bias supply plus multimeter on one bus
//!
//! [`bind`] turns a descriptor and a fresh transport into a [`BoundDriver`],
//! which carries the generic capability plus any family extras.

pub mod aux_rig;
pub mod dual_channel;
pub mod single_channel;
pub mod socket_supply;

pub use aux_rig::AuxRig;
pub use dual_channel::DualChannelSupply;
pub use single_channel::SingleChannelSupply;
pub use socket_supply::SocketSupply;

use crate::commands::OutputQuery;
use crate::descriptors::{DriverDescriptor, DriverFamily};
use psu_core::{
    DynTransport, MultiChannelSupply, PowerSupply, PsuError, PsuResult, DEFAULT_READ_BYTES,
};
use std::sync::Arc;
use tokio::sync::{Mutex, MutexGuard};

// =============================================================================
// Link
// =============================================================================

/// A driver's transport, serialised behind an async mutex.
pub struct Link {
    transport: Mutex<DynTransport>,
    endpoint: String,
    max_bytes: usize,
}

impl Link {
    pub fn new(transport: DynTransport) -> Self {
        let endpoint = transport.endpoint().to_string();
        Self {
            transport: Mutex::new(transport),
            endpoint,
            max_bytes: DEFAULT_READ_BYTES,
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Drop any stale connection and open a fresh one.
    pub async fn open(&self) -> PsuResult<()> {
        self.transport.lock().await.reconnect().await?;
        Ok(())
    }

    /// Disconnect then close. Close runs even if disconnect fails.
    pub async fn release(&self) -> PsuResult<()> {
        let mut transport = self.transport.lock().await;
        let disconnected = transport.disconnect().await;
        let closed = transport.close().await;
        disconnected?;
        closed?;
        Ok(())
    }

    /// Lock the link and address `bus_address` if the link is shared.
    pub async fn at(&self, bus_address: Option<u8>) -> PsuResult<LinkGuard<'_>> {
        let mut transport = self.transport.lock().await;
        if let Some(addr) = bus_address {
            transport.select(addr).await?;
        }
        Ok(LinkGuard {
            transport,
            max_bytes: self.max_bytes,
        })
    }
}

/// Exclusive, already-addressed access to a [`Link`].
pub struct LinkGuard<'a> {
    transport: MutexGuard<'a, DynTransport>,
    max_bytes: usize,
}

impl LinkGuard<'_> {
    pub async fn write(&mut self, command: &str) -> PsuResult<()> {
        self.transport.write(command).await?;
        Ok(())
    }

    pub async fn query(&mut self, command: &str) -> PsuResult<String> {
        Ok(self.transport.query(command, self.max_bytes).await?)
    }

    pub async fn query_f64(&mut self, command: &str) -> PsuResult<f64> {
        let reply = self.query(command).await?;
        parse_f64(command, &reply)
    }

    pub async fn query_output(&mut self, query: OutputQuery) -> PsuResult<bool> {
        let reply = self.query(query.command()).await?;
        match query {
            OutputQuery::Flag(command) => parse_flag(command, &reply),
            OutputQuery::StatusBit { query, bit } => parse_status_bit(query, &reply, bit),
        }
    }
}

// =============================================================================
// Reply parsing
// =============================================================================

/// Parse a numeric reply, tolerating whitespace and a trailing `V`/`A` unit.
pub fn parse_f64(command: &str, reply: &str) -> PsuResult<f64> {
    reply
        .trim()
        .trim_end_matches(['V', 'A'])
        .trim()
        .parse::<f64>()
        .ok()
        .filter(|v| v.is_finite())
        .ok_or_else(|| PsuError::parse(command, reply))
}

/// Parse a `0`/`1` (or `OFF`/`ON`) reply.
pub fn parse_flag(command: &str, reply: &str) -> PsuResult<bool> {
    match reply.trim() {
        "1" | "ON" => Ok(true),
        "0" | "OFF" => Ok(false),
        _ => Err(PsuError::parse(command, reply)),
    }
}

/// Test `bit` of a hexadecimal status word such as `0x10`.
pub fn parse_status_bit(command: &str, reply: &str, bit: u32) -> PsuResult<bool> {
    let word = reply.trim();
    let digits = word
        .strip_prefix("0x")
        .or_else(|| word.strip_prefix("0X"))
        .unwrap_or(word);
    u32::from_str_radix(digits, 16)
        .map(|status| status & (1 << bit) != 0)
        .map_err(|_| PsuError::parse(command, reply))
}

// =============================================================================
// Binding
// =============================================================================

/// A resolved driver: the generic capability plus family extras.
#[derive(Clone)]
pub struct BoundDriver {
    pub descriptor: DriverDescriptor,
    pub supply: Arc<dyn PowerSupply>,
    pub multi_channel: Option<Arc<dyn MultiChannelSupply>>,
    pub aux_rig: Option<Arc<AuxRig>>,
}

impl BoundDriver {
    pub fn family(&self) -> DriverFamily {
        self.descriptor.family
    }
}

impl std::fmt::Debug for BoundDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BoundDriver")
            .field("identification", &self.descriptor.identification)
            .field("family", &self.descriptor.family)
            .finish()
    }
}

/// Construct the driver variant for `descriptor` on `transport`.
///
/// `bus_address` is the instrument's address on a shared bus, `None` for a
/// direct socket. The rig addresses its own sub-instruments.
pub fn bind(
    descriptor: &DriverDescriptor,
    transport: DynTransport,
    bus_address: Option<u8>,
) -> PsuResult<BoundDriver> {
    let link = Link::new(transport);
    let descriptor = descriptor.clone();

    let bound = match descriptor.family {
        DriverFamily::SingleChannel => BoundDriver {
            supply: Arc::new(SingleChannelSupply::new(descriptor.clone(), link, bus_address)),
            multi_channel: None,
            aux_rig: None,
            descriptor,
        },
        DriverFamily::DualChannel => {
            let driver = Arc::new(DualChannelSupply::new(descriptor.clone(), link, bus_address));
            BoundDriver {
                supply: driver.clone(),
                multi_channel: Some(driver),
                aux_rig: None,
                descriptor,
            }
        }
        DriverFamily::SocketSupply => BoundDriver {
            supply: Arc::new(SocketSupply::new(descriptor.clone(), link)),
            multi_channel: None,
            aux_rig: None,
            descriptor,
        },
        DriverFamily::AuxRig => {
            let addresses = descriptor.rig.ok_or_else(|| {
                PsuError::Configuration(format!(
                    "Rig descriptor '{}' has no sub-addresses",
                    descriptor.identification
                ))
            })?;
            let driver = Arc::new(AuxRig::new(descriptor.clone(), link, addresses));
            BoundDriver {
                supply: driver.clone(),
                multi_channel: None,
                aux_rig: Some(driver),
                descriptor,
            }
        }
    };
    Ok(bound)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptors::{DescriptorTable, AGILENT_E3648A, HP_E3633A};
    use crate::transport::SimulatedBench;

    #[test]
    fn numeric_replies_tolerate_units_and_whitespace() {
        assert_eq!(parse_f64("VO?", "1.200V").unwrap(), 1.2);
        assert_eq!(parse_f64("MEAS:CURR?", " +6.00000000E-01 ").unwrap(), 0.6);
        assert!(parse_f64("MEAS:VOLT?", "#ERR").is_err());
        assert!(parse_f64("MEAS:VOLT?", "").is_err());
        assert!(parse_f64("MEAS:VOLT?", "NaN").is_err());
    }

    #[test]
    fn flags_and_status_bits() {
        assert!(parse_flag("OUTP:STAT?", "1").unwrap());
        assert!(!parse_flag("OUTP:STAT?", "0").unwrap());
        assert!(parse_flag("OUTP:STAT?", "maybe").is_err());

        assert!(parse_status_bit("SYST:STAT?", "0x10", 4).unwrap());
        assert!(!parse_status_bit("SYST:STAT?", "0x0F", 4).unwrap());
        assert!(parse_status_bit("SYST:STAT?", "0x5c", 4).unwrap());
        assert!(parse_status_bit("SYST:STAT?", "zz", 4).is_err());
    }

    #[test]
    fn bind_exposes_family_extras() {
        let table = DescriptorTable::builtin();
        let bench = SimulatedBench::new();

        let dual = bind(
            table.lookup(AGILENT_E3648A).unwrap(),
            Box::new(bench.transport("proxy:1234")),
            Some(6),
        )
        .unwrap();
        assert!(dual.multi_channel.is_some());
        assert_eq!(dual.supply.model(), AGILENT_E3648A);

        let single = bind(
            table.lookup(HP_E3633A).unwrap(),
            Box::new(bench.transport("proxy:1234")),
            Some(3),
        )
        .unwrap();
        assert!(single.multi_channel.is_none());
        assert!(single.aux_rig.is_none());
        assert_eq!(single.family(), DriverFamily::SingleChannel);
    }
}
