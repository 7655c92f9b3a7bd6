//! Prologix GPIB-Ethernet proxy adapter.
//!
//! Protocol Overview:
//! - TCP to the proxy, port 1234
//! - Lines starting with `++` configure the proxy; anything else is sent to
//!   the currently addressed GPIB instrument
//! - Terminator: LF on the TCP side; `++eos 3` keeps the proxy from appending
//!   CR/LF on the GPIB side
//!
//! Setup sent on every connect:
//! - `++mode 1` controller mode
//! - `++auto 0` no automatic read-after-write, reads are explicit
//! - `++read_tmo_ms <n>` proxy-side read timeout
//! - `++eos 3` no GPIB terminator appended
//!
//! One proxy serves every instrument on the bus, so `select` (`++addr n`) must
//! precede each exchange. A read is `++read eoi` followed by a single bounded
//! socket read.

use async_trait::async_trait;
use psu_core::limits::{CONNECT_TIMEOUT, QUERY_TIMEOUT};
use psu_core::{strip_terminator, ConnectionState, Transport, TransportError};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;

/// Default TCP port of the Prologix GPIB-Ethernet controller.
pub const PROLOGIX_PORT: u16 = 1234;

/// Proxy read timeout bounds accepted by `++read_tmo_ms`.
const PROXY_TMO_RANGE_MS: (u128, u128) = (1, 3000);

/// How much earlier than the socket read the proxy must give up.
const PROXY_TMO_MARGIN: Duration = Duration::from_millis(200);

/// `++read_tmo_ms` value for a socket read timeout of `read_timeout`.
///
/// The proxy times out first, so a silent instrument costs one proxy timeout
/// and the socket read still sees whatever the proxy flushed.
fn proxy_read_tmo_ms(read_timeout: Duration) -> u128 {
    read_timeout
        .saturating_sub(PROXY_TMO_MARGIN)
        .as_millis()
        .clamp(PROXY_TMO_RANGE_MS.0, PROXY_TMO_RANGE_MS.1)
}

/// Bus-multiplexed adapter speaking to a Prologix proxy.
pub struct PrologixAdapter {
    endpoint: String,
    stream: Option<TcpStream>,
    connect_timeout: Duration,
    read_timeout: Duration,
    last_command: String,
}

impl PrologixAdapter {
    /// Create a disconnected adapter for `endpoint` (`host:port`).
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

    async fn send(&mut self, line: &str) -> Result<(), TransportError> {
        let stream = self.stream.as_mut().ok_or(TransportError::NotConnected)?;
        tracing::trace!(endpoint = %self.endpoint, line, "prologix send");
        stream.write_all(format!("{}\n", line).as_bytes()).await?;
        stream.flush().await?;
        Ok(())
    }

    async fn setup(&mut self) -> Result<(), TransportError> {
        let tmo_ms = proxy_read_tmo_ms(self.read_timeout);
        self.send("++mode 1").await?;
        self.send("++auto 0").await?;
        self.send(&format!("++read_tmo_ms {}", tmo_ms)).await?;
        self.send("++eos 3").await?;
        Ok(())
    }
}

#[async_trait]
impl Transport for PrologixAdapter {
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
        stream.set_nodelay(true)?;
        self.stream = Some(stream);

        if let Err(e) = self.setup().await {
            self.stream = None;
            return Err(e);
        }

        tracing::debug!(endpoint = %self.endpoint, "connected to GPIB proxy");
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<(), TransportError> {
        if self.stream.is_none() {
            return Ok(());
        }
        // Return the addressed instrument to front-panel control.
        let result = self.send("++loc").await;
        if let Some(mut stream) = self.stream.take() {
            let _ = stream.shutdown().await;
        }
        tracing::debug!(endpoint = %self.endpoint, "disconnected from GPIB proxy");
        result
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        if let Some(mut stream) = self.stream.take() {
            let _ = stream.shutdown().await;
        }
        Ok(())
    }

    async fn select(&mut self, bus_address: u8) -> Result<(), TransportError> {
        self.send(&format!("++addr {}", bus_address)).await
    }

    async fn write(&mut self, command: &str) -> Result<(), TransportError> {
        self.last_command = command.to_string();
        self.send(command).await
    }

    async fn read(&mut self, max_bytes: usize) -> Result<String, TransportError> {
        self.send("++read eoi").await?;

        let read_timeout = self.read_timeout;
        let stream = self.stream.as_mut().ok_or(TransportError::NotConnected)?;
        let mut buf = vec![0u8; max_bytes.max(1)];
        let n = match timeout(read_timeout, stream.read(&mut buf)).await {
            Ok(Ok(0)) => {
                self.stream = None;
                return Err(TransportError::Closed);
            }
            Ok(Ok(n)) => n,
            Ok(Err(e)) => return Err(TransportError::Io(e)),
            Err(_) => {
                return Err(TransportError::Timeout {
                    command: self.last_command.clone(),
                })
            }
        };

        let reply = String::from_utf8_lossy(&buf[..n]);
        tracing::trace!(endpoint = %self.endpoint, reply = %reply.trim_end(), "prologix read");
        Ok(strip_terminator(&reply).to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncBufReadExt, BufReader};
    use tokio::net::TcpListener;
    use tokio::sync::mpsc;

    /// Fake proxy: records every line, answers `++read eoi` with `reply`.
    async fn fake_proxy(reply: Option<&'static str>) -> (String, mpsc::UnboundedReceiver<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let (tx, rx) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            let (read_half, mut write_half) = socket.into_split();
            let mut lines = BufReader::new(read_half).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                let is_read = line == "++read eoi";
                let _ = tx.send(line);
                if is_read {
                    if let Some(reply) = reply {
                        write_half.write_all(reply.as_bytes()).await.unwrap();
                    }
                }
            }
        });

        (addr, rx)
    }

    async fn drain(rx: &mut mpsc::UnboundedReceiver<String>, count: usize) -> Vec<String> {
        let mut out = Vec::new();
        for _ in 0..count {
            let line = tokio::time::timeout(Duration::from_secs(2), rx.recv())
                .await
                .unwrap()
                .unwrap();
            out.push(line);
        }
        out
    }

    #[tokio::test]
    async fn connect_configures_proxy() {
        let (addr, mut rx) = fake_proxy(None).await;
        let mut adapter = PrologixAdapter::new(addr);
        adapter.connect().await.unwrap();
        assert_eq!(adapter.state(), ConnectionState::Connected);

        let setup = drain(&mut rx, 4).await;
        assert_eq!(
            setup,
            vec!["++mode 1", "++auto 0", "++read_tmo_ms 800", "++eos 3"]
        );
    }

    #[tokio::test]
    async fn query_selects_writes_and_reads() {
        let (addr, mut rx) = fake_proxy(Some("Agilent Technologies,E3642A,0,1.6-5.0-1.0\n")).await;
        let mut adapter = PrologixAdapter::new(addr);
        adapter.connect().await.unwrap();
        drain(&mut rx, 4).await;

        adapter.select(6).await.unwrap();
        let reply = adapter.query("*IDN?", 1024).await.unwrap();
        assert_eq!(reply, "Agilent Technologies,E3642A,0,1.6-5.0-1.0");

        let sent = drain(&mut rx, 3).await;
        assert_eq!(sent, vec!["++addr 6", "*IDN?", "++read eoi"]);
    }

    #[test]
    fn proxy_gives_up_before_the_socket() {
        assert_eq!(proxy_read_tmo_ms(QUERY_TIMEOUT), 800);
        assert!(proxy_read_tmo_ms(QUERY_TIMEOUT) < QUERY_TIMEOUT.as_millis());
        assert_eq!(proxy_read_tmo_ms(Duration::from_millis(50)), 1);
        assert_eq!(proxy_read_tmo_ms(Duration::from_secs(10)), 3000);
    }

    #[tokio::test]
    async fn silent_instrument_times_out() {
        let (addr, _rx) = fake_proxy(None).await;
        let mut adapter =
            PrologixAdapter::new(addr).with_timeouts(CONNECT_TIMEOUT, Duration::from_millis(50));
        adapter.connect().await.unwrap();

        let err = adapter.query("MEAS:VOLT?", 1024).await.unwrap_err();
        assert!(matches!(err, TransportError::Timeout { ref command } if command == "MEAS:VOLT?"));
    }

    #[tokio::test]
    async fn disconnect_returns_instrument_to_local() {
        let (addr, mut rx) = fake_proxy(None).await;
        let mut adapter = PrologixAdapter::new(addr);
        adapter.connect().await.unwrap();
        drain(&mut rx, 4).await;

        adapter.disconnect().await.unwrap();
        assert_eq!(adapter.state(), ConnectionState::Disconnected);
        assert_eq!(drain(&mut rx, 1).await, vec!["++loc"]);

        // Idempotent once disconnected
        adapter.disconnect().await.unwrap();
        adapter.close().await.unwrap();
    }

    #[tokio::test]
    async fn commands_require_connection() {
        let mut adapter = PrologixAdapter::new("127.0.0.1:1");
        assert!(matches!(
            adapter.write("OUTP ON").await,
            Err(TransportError::NotConnected)
        ));
        assert!(matches!(
            adapter.select(4).await,
            Err(TransportError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn unreachable_proxy_reports_connect_error() {
        // Bind then drop to get a port nobody listens on.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);

        let mut adapter = PrologixAdapter::new(addr);
        let err = adapter.connect().await.unwrap_err();
        assert!(matches!(
            err,
            TransportError::Connect { .. } | TransportError::ConnectTimeout { .. }
        ));
        assert_eq!(adapter.state(), ConnectionState::Disconnected);
    }
}
