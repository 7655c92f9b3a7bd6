//! ZeroMQ request/reply front end.
//!
//! The test-stand clients talk to the server through a ZeroMQ REQ socket:
//! one single-frame text message per request, one per reply. The REP side
//! here forwards each request into the same dispatcher worker the line
//! listener uses, so both front ends share one bus serialisation.

use crate::client::DEFAULT_REPLY_TIMEOUT;
use crate::server::Job;
use anyhow::{anyhow, Result};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use zeromq::{RepSocket, ReqSocket, Socket, SocketRecv, SocketSend, ZmqMessage};

/// Bind a REP socket, returning it with the resolved endpoint.
pub(crate) async fn bind_rep(endpoint: &str) -> Result<(RepSocket, String)> {
    let mut socket = RepSocket::new();
    let bound = socket
        .bind(endpoint)
        .await
        .map_err(|e| anyhow!("Failed to bind {}: {}", endpoint, e))?;
    Ok((socket, bound.to_string()))
}

/// Answer requests on `socket` until `stop` flips.
pub(crate) async fn serve_rep(
    mut socket: RepSocket,
    tx: mpsc::Sender<Job>,
    mut stop: watch::Receiver<bool>,
) {
    loop {
        let message = tokio::select! {
            biased;
            _ = stop.changed() => break,
            received = socket.recv() => match received {
                Ok(message) => message,
                Err(e) => {
                    tracing::warn!(error = %e, "ZMQ receive failed");
                    continue;
                }
            },
        };

        let (reply_tx, reply_rx) = oneshot::channel();
        let job = Job {
            line: message_text(&message),
            reply: reply_tx,
        };
        if tx.send(job).await.is_err() {
            break;
        }
        let reply = tokio::select! {
            biased;
            _ = stop.changed() => break,
            reply = reply_rx => match reply {
                Ok(reply) => reply,
                Err(_) => break,
            },
        };

        if let Err(e) = socket.send(ZmqMessage::from(reply)).await {
            tracing::warn!(error = %e, "ZMQ reply failed");
        }
    }
    tracing::debug!("ZMQ front end stopped");
}

/// Text of the first frame, lossily decoded.
fn message_text(message: &ZmqMessage) -> String {
    message
        .get(0)
        .map(|frame| String::from_utf8_lossy(frame).into_owned())
        .unwrap_or_default()
}

/// REQ client for the ZeroMQ front end.
///
/// A REQ socket that missed a reply cannot send again; after a timeout,
/// connect a new client.
pub struct ZmqClient {
    socket: ReqSocket,
    reply_timeout: Duration,
}

impl ZmqClient {
    /// Connect to `endpoint`, e.g. `tcp://127.0.0.1:5560`.
    pub async fn connect(endpoint: &str) -> Result<Self> {
        let mut socket = ReqSocket::new();
        socket
            .connect(endpoint)
            .await
            .map_err(|e| anyhow!("Failed to connect to server at {}: {}", endpoint, e))?;
        Ok(Self {
            socket,
            reply_timeout: DEFAULT_REPLY_TIMEOUT,
        })
    }

    pub fn with_reply_timeout(mut self, timeout: Duration) -> Self {
        self.reply_timeout = timeout;
        self
    }

    /// Send one request and wait for its reply.
    pub async fn request(&mut self, line: &str) -> Result<String> {
        self.socket
            .send(ZmqMessage::from(line.trim_end().to_string()))
            .await
            .map_err(|e| anyhow!("Failed to send '{}': {}", line, e))?;
        let reply = tokio::time::timeout(self.reply_timeout, self.socket.recv())
            .await
            .map_err(|_| anyhow!("No reply to '{}' within {:?}", line, self.reply_timeout))?
            .map_err(|e| anyhow!("Failed to receive reply to '{}': {}", line, e))?;
        Ok(message_text(&reply))
    }
}

/// Connect, send `line`, return the reply.
pub async fn request_zmq(endpoint: &str, line: &str) -> Result<String> {
    ZmqClient::connect(endpoint).await?.request(line).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_frame_is_the_request() {
        let message = ZmqMessage::from("46:::Ping".to_string());
        assert_eq!(message_text(&message), "46:::Ping");
    }
}
