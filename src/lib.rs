//! # psu-daq
//!
//! Bench power supply control for ASIC test stands. Supplies sit on a GPIB
//! bus behind GPIB-Ethernet proxies or speak SCPI on their own sockets; one
//! server routes `<address>:::<verb>` requests to whichever driver backs the
//! address.
//!
//! This facade re-exports the workspace crates:
//!
//! - [`psu_core`]: errors, transport contract, capability traits
//! - [`hardware`] (`psu-hardware`): adapters, drivers, model detection,
//!   routing and configuration
//! - [`server`] (`psu-server`): wire protocol, dispatcher, ZeroMQ and line
//!   front ends, clients
//!
//! ```no_run
//! use psu_daq::hardware::{AddressRouter, PsuConfig, TcpConnector};
//! use psu_daq::server::{Dispatcher, PsuServer};
//! use std::sync::Arc;
//!
//! # async fn run() -> anyhow::Result<()> {
//! let config = PsuConfig::load(None)?;
//! let router = AddressRouter::from_config(&config, Arc::new(TcpConnector::default())).await?;
//! let server = PsuServer::new(Dispatcher::new(router))
//!     .listen_zmq(&config.server.bind)
//!     .await?;
//! server.run_until(std::future::pending::<()>()).await
//! # }
//! ```

pub use psu_core;
pub use psu_hardware as hardware;
pub use psu_server as server;

pub use psu_core::{PowerReading, PowerSupply, PsuError, PsuResult};
pub use psu_hardware::{AddressRouter, BoundDriver, ModelFactory, PsuConfig};
pub use psu_server::{Dispatcher, PsuServer};
