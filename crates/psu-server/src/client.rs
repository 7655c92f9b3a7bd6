//! Minimal client for the line protocol.

use anyhow::{anyhow, Context, Result};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;

/// Replies to slow instruments can take several read timeouts.
pub const DEFAULT_REPLY_TIMEOUT: Duration = Duration::from_secs(10);

pub struct PsuClient {
    stream: BufReader<TcpStream>,
    reply_timeout: Duration,
}

impl PsuClient {
    pub async fn connect(addr: &str) -> Result<Self> {
        let stream = TcpStream::connect(addr)
            .await
            .with_context(|| format!("Failed to connect to server at {}", addr))?;
        Ok(Self {
            stream: BufReader::new(stream),
            reply_timeout: DEFAULT_REPLY_TIMEOUT,
        })
    }

    pub fn with_reply_timeout(mut self, timeout: Duration) -> Self {
        self.reply_timeout = timeout;
        self
    }

    /// Send one request line and wait for its reply line.
    pub async fn request(&mut self, line: &str) -> Result<String> {
        let mut out = line.trim_end().as_bytes().to_vec();
        out.push(b'\n');
        self.stream.get_mut().write_all(&out).await?;

        let mut reply = String::new();
        let read = tokio::time::timeout(self.reply_timeout, self.stream.read_line(&mut reply))
            .await
            .map_err(|_| anyhow!("No reply to '{}' within {:?}", line, self.reply_timeout))??;
        if read == 0 {
            return Err(anyhow!("Server closed the connection"));
        }
        Ok(reply.trim_end_matches(['\r', '\n']).to_string())
    }
}

/// Connect, send `line`, return the reply.
pub async fn request_once(addr: &str, line: &str) -> Result<String> {
    PsuClient::connect(addr).await?.request(line).await
}
