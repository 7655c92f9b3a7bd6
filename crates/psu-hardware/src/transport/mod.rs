//! Transport adapters and endpoint construction.
//!
//! - [`prologix`]: GPIB bus reached through a Prologix GPIB-Ethernet proxy
//! - [`scpi_socket`]: SCPI over a dedicated TCP socket
//! - [`simulated`]: in-process instruments with an event log, for tests and
//!   the `--simulate` server mode
//!
//! Drivers never build adapters themselves. The [`Connector`] hands out a
//! fresh, disconnected adapter for an [`Endpoint`], which lets the model
//! factory probe with one adapter and bind the driver to another.

pub mod prologix;
pub mod scpi_socket;
pub mod simulated;

use psu_core::limits::{CONNECT_TIMEOUT, QUERY_TIMEOUT};
use psu_core::DynTransport;
use std::time::Duration;

pub use prologix::PrologixAdapter;
pub use scpi_socket::ScpiSocketAdapter;
pub use simulated::{
    Fault, SimulatedBench, SimulatedInstrument, SimulatedTransport, TransportEvent,
};

/// Where an instrument lives.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Endpoint {
    /// Instrument at `bus_address` on the GPIB bus behind `proxy` (`host:port`).
    GpibProxy { proxy: String, bus_address: u8 },
    /// Instrument listening directly on `addr` (`host:port`).
    Socket { addr: String },
}

impl Endpoint {
    pub fn gpib(proxy: impl Into<String>, bus_address: u8) -> Self {
        Endpoint::GpibProxy {
            proxy: proxy.into(),
            bus_address,
        }
    }

    pub fn socket(addr: impl Into<String>) -> Self {
        Endpoint::Socket { addr: addr.into() }
    }

    /// Physical link (`host:port`) this endpoint is reached through.
    pub fn link(&self) -> &str {
        match self {
            Endpoint::GpibProxy { proxy, .. } => proxy,
            Endpoint::Socket { addr } => addr,
        }
    }

    /// Bus address to select before each exchange, if the link is shared.
    pub fn bus_address(&self) -> Option<u8> {
        match self {
            Endpoint::GpibProxy { bus_address, .. } => Some(*bus_address),
            Endpoint::Socket { .. } => None,
        }
    }
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Endpoint::GpibProxy { proxy, bus_address } => {
                write!(f, "gpib://{}/{}", proxy, bus_address)
            }
            Endpoint::Socket { addr } => write!(f, "tcp://{}", addr),
        }
    }
}

/// Builds fresh, disconnected adapters for endpoints.
pub trait Connector: Send + Sync {
    fn adapter(&self, endpoint: &Endpoint) -> DynTransport;
}

/// Connector for real hardware over TCP.
#[derive(Debug, Clone, Copy)]
pub struct TcpConnector {
    pub connect_timeout: Duration,
    pub query_timeout: Duration,
}

impl Default for TcpConnector {
    fn default() -> Self {
        Self {
            connect_timeout: CONNECT_TIMEOUT,
            query_timeout: QUERY_TIMEOUT,
        }
    }
}

impl TcpConnector {
    pub fn new(connect_timeout: Duration, query_timeout: Duration) -> Self {
        Self {
            connect_timeout,
            query_timeout,
        }
    }
}

impl Connector for TcpConnector {
    fn adapter(&self, endpoint: &Endpoint) -> DynTransport {
        match endpoint {
            Endpoint::GpibProxy { proxy, .. } => Box::new(
                PrologixAdapter::new(proxy.clone())
                    .with_timeouts(self.connect_timeout, self.query_timeout),
            ),
            Endpoint::Socket { addr } => Box::new(
                ScpiSocketAdapter::new(addr.clone())
                    .with_timeouts(self.connect_timeout, self.query_timeout),
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use psu_core::ConnectionState;

    #[test]
    fn endpoint_link_and_bus_address() {
        let gpib = Endpoint::gpib("192.168.1.50:1234", 6);
        assert_eq!(gpib.link(), "192.168.1.50:1234");
        assert_eq!(gpib.bus_address(), Some(6));
        assert_eq!(gpib.to_string(), "gpib://192.168.1.50:1234/6");

        let socket = Endpoint::socket("192.168.1.143:5025");
        assert_eq!(socket.link(), "192.168.1.143:5025");
        assert_eq!(socket.bus_address(), None);
    }

    #[test]
    fn tcp_connector_hands_out_disconnected_adapters() {
        let connector = TcpConnector::default();
        let adapter = connector.adapter(&Endpoint::gpib("127.0.0.1:1234", 5));
        assert_eq!(adapter.state(), ConnectionState::Disconnected);
        assert_eq!(adapter.endpoint(), "127.0.0.1:1234");

        let adapter = connector.adapter(&Endpoint::socket("127.0.0.1:5025"));
        assert_eq!(adapter.state(), ConnectionState::Disconnected);
    }
}
