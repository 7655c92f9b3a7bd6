//! SCPI over a dedicated TCP socket.
//!
//! Used for supplies with their own Ethernet port (raw SCPI, usually port
//! 5025). Commands are LF terminated; replies are read one line at a time.
//! There is no bus to address, so `select` does nothing.

use async_trait::async_trait;
use psu_core::limits::{CONNECT_TIMEOUT, QUERY_TIMEOUT};
use psu_core::{strip_terminator, truncate_reply, ConnectionState, Transport, TransportError};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::time::timeout;

/// Conventional raw-SCPI port.
pub const DEFAULT_SCPI_PORT: u16 = 5025;

/// Direct-socket adapter, one connection per instrument.
pub struct ScpiSocketAdapter {
    endpoint: String,
    stream: Option<BufReader<TcpStream>>,
    connect_timeout: Duration,
    read_timeout: Duration,
    last_command: String,
}

impl ScpiSocketAdapter {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            stream: None,
            connect_timeout: CONNECT_TIMEOUT,
            read_timeout: QUERY_TIMEOUT,
            last_command: String::new(),
        }
    }

    pub fn with_timeouts(mut self, connect_timeout: Duration, read_timeout: Duration) -> Self {
        self.connect_timeout = connect_timeout;
        self.read_timeout = read_timeout;
        self
    }
}

#[async_trait]
impl Transport for ScpiSocketAdapter {
    fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn state(&self) -> ConnectionState {
        if self.stream.is_some() {
            ConnectionState::Connected
        } else {
            ConnectionState::Disconnected
        }
    }

    async fn connect(&mut self) -> Result<(), TransportError> {
        if self.stream.is_some() {
            return Ok(());
        }

        let stream = timeout(self.connect_timeout, TcpStream::connect(self.endpoint.as_str()))
            .await
            .map_err(|_| TransportError::ConnectTimeout {
                endpoint: self.endpoint.clone(),
            })?
            .map_err(|source| TransportError::Connect {
                endpoint: self.endpoint.clone(),
                source,
            })?;

        // Disable Nagle's algorithm for low latency
        stream.set_nodelay(true)?;
        self.stream = Some(BufReader::new(stream));

        tracing::debug!(endpoint = %self.endpoint, "connected to SCPI socket");
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<(), TransportError> {
        self.close().await
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        if let Some(mut stream) = self.stream.take() {
            let _ = stream.get_mut().shutdown().await;
            tracing::debug!(endpoint = %self.endpoint, "closed SCPI socket");
        }
        Ok(())
    }

    async fn select(&mut self, _bus_address: u8) -> Result<(), TransportError> {
        Ok(())
    }

    async fn write(&mut self, command: &str) -> Result<(), TransportError> {
        let stream = self.stream.as_mut().ok_or(TransportError::NotConnected)?;
        tracing::trace!(endpoint = %self.endpoint, command, "SCPI write");

        stream
            .get_mut()
            .write_all(format!("{}\n", command).as_bytes())
            .await?;
        stream.get_mut().flush().await?;
        self.last_command = command.to_string();
        Ok(())
    }

    async fn read(&mut self, max_bytes: usize) -> Result<String, TransportError> {
        let read_timeout = self.read_timeout;
        let stream = self.stream.as_mut().ok_or(TransportError::NotConnected)?;

        let mut response = String::new();
        match timeout(read_timeout, stream.read_line(&mut response)).await {
            Ok(Ok(0)) => {
                self.stream = None;
                Err(TransportError::Closed)
            }
            Ok(Ok(_)) => {
                let mut reply = strip_terminator(&response).to_string();
                truncate_reply(&mut reply, max_bytes);
                tracing::trace!(endpoint = %self.endpoint, reply = %reply, "SCPI response");
                Ok(reply)
            }
            Ok(Err(e)) => Err(TransportError::Io(e)),
            Err(_) => Err(TransportError::Timeout {
                command: self.last_command.clone(),
            }),
        }
    }
}
