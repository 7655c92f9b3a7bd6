//! Hardware layer for psu-daq.
//!
//! - [`transport`]: GPIB proxy, SCPI socket and simulated adapters
//! - [`descriptors`] + [`commands`]: known models and their command sets
//! - [`drivers`]: one [`PowerSupply`] implementation per instrument family
//! - [`factory`]: identify an endpoint and bind its driver
//! - [`router`]: external address to driver mapping, built at startup
//! - [`config`]: figment-loaded routing and descriptor configuration

pub use psu_core::capabilities;
pub mod commands;
pub mod config;
pub mod descriptors;
pub mod drivers;
pub mod factory;
pub mod router;
pub mod transport;

pub use capabilities::*;
pub use config::{ConfigLoadError, DescriptorConfig, PsuConfig, RoutingConfig, ServerConfig};
pub use descriptors::{DescriptorTable, DriverDescriptor, DriverFamily, RigAddresses};
pub use drivers::{bind, AuxRig, BoundDriver, DualChannelSupply, SingleChannelSupply, SocketSupply};
pub use factory::ModelFactory;
pub use router::{AddressRouter, Route};
pub use transport::{Connector, Endpoint, SimulatedBench, SimulatedInstrument, TcpConnector};
