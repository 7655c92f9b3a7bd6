//! Transport Adapter Contract
//!
//! Every instrument driver talks to hardware through exactly one [`Transport`].
//! Two physical shapes exist:
//!
//! - **Bus-multiplexed** (GPIB behind an Ethernet proxy): one link shared by
//!   many addressed instruments. `select` must precede every command.
//! - **Direct socket** (SCPI over TCP): one connection per instrument, `select`
//!   is a no-op.
//!
//! # Contract
//!
//! - Commands are only sent while [`ConnectionState::Connected`]; otherwise the
//!   adapter returns [`TransportError::NotConnected`].
//! - `query` is a write followed by a single bounded read. A timeout or a dead
//!   link is an error; partial reads are not retried.
//! - Replies are returned with the trailing line terminator removed.

use crate::error::TransportError;
use async_trait::async_trait;

/// Default upper bound on a single read, in bytes.
pub const DEFAULT_READ_BYTES: usize = 1024;

/// Connection lifecycle of one adapter instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connected,
}

impl ConnectionState {
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }
}

/// Uniform connect/select/write/query primitive over one physical link.
#[async_trait]
pub trait Transport: Send {
    /// Human-readable endpoint (`host:port`) for logs and errors.
    fn endpoint(&self) -> &str;

    /// Current connection state.
    fn state(&self) -> ConnectionState;

    /// Open the link. Connecting an already connected adapter is a no-op.
    async fn connect(&mut self) -> Result<(), TransportError>;

    /// Hand the instrument back (e.g. local mode) and drop the link.
    async fn disconnect(&mut self) -> Result<(), TransportError>;

    /// Drop the link without any courtesy traffic.
    async fn close(&mut self) -> Result<(), TransportError>;

    /// Drop whatever link exists and open a fresh one.
    async fn reconnect(&mut self) -> Result<(), TransportError> {
        self.close().await?;
        self.connect().await
    }

    /// Address the instrument at `bus_address` for the following commands.
    async fn select(&mut self, bus_address: u8) -> Result<(), TransportError>;

    /// Send one command line.
    async fn write(&mut self, command: &str) -> Result<(), TransportError>;

    /// Perform one bounded read of at most `max_bytes`.
    async fn read(&mut self, max_bytes: usize) -> Result<String, TransportError>;

    /// Write `command`, then perform one bounded read.
    async fn query(&mut self, command: &str, max_bytes: usize) -> Result<String, TransportError> {
        self.write(command).await?;
        self.read(max_bytes).await
    }
}

/// Type-erased transport owned by a driver.
pub type DynTransport = Box<dyn Transport>;

/// Remove trailing CR/LF terminators from an instrument reply.
pub fn strip_terminator(reply: &str) -> &str {
    reply.trim_end_matches(['\r', '\n'])
}

/// Cut `reply` to at most `max_bytes`, backing off to a character boundary.
pub fn truncate_reply(reply: &mut String, max_bytes: usize) {
    if reply.len() > max_bytes {
        let mut cut = max_bytes;
        while !reply.is_char_boundary(cut) {
            cut -= 1;
        }
        reply.truncate(cut);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strip_terminator_removes_crlf_only() {
        assert_eq!(strip_terminator("1.2000\r\n"), "1.2000");
        assert_eq!(strip_terminator("1\n"), "1");
        assert_eq!(strip_terminator(" 0.5 "), " 0.5 ");
        assert_eq!(strip_terminator(""), "");
    }

    #[test]
    fn truncation_respects_char_boundaries() {
        let mut reply = "25.0\u{b0}C".to_string();
        truncate_reply(&mut reply, 5);
        assert_eq!(reply, "25.0");

        let mut reply = "1.2000".to_string();
        truncate_reply(&mut reply, 64);
        assert_eq!(reply, "1.2000");
        truncate_reply(&mut reply, 3);
        assert_eq!(reply, "1.2");
    }

    #[test]
    fn default_state_is_disconnected() {
        let state = ConnectionState::default();
        assert!(!state.is_connected());
        assert!(ConnectionState::Connected.is_connected());
    }
}
