//! Sequential request/reply server.
//!
//! Two front ends feed one worker task that owns the [`Dispatcher`]:
//!
//! - a ZeroMQ REP socket, the test-stand clients' channel
//! - an optional TCP listener reading one request per line
//!
//! The worker handles requests strictly one at a time, so at most one
//! transport bracket is ever open. On shutdown only the request already being
//! dispatched completes; anything still queued is discarded unanswered.

use crate::dispatcher::Dispatcher;
use crate::zmq::{bind_rep, serve_rep};
use anyhow::{bail, Context, Result};
use std::future::Future;
use std::net::SocketAddr;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinSet;
use zeromq::RepSocket;

/// Pending requests before front ends start waiting.
const QUEUE_DEPTH: usize = 32;

/// One queued request and where to send its reply.
pub(crate) struct Job {
    pub(crate) line: String,
    pub(crate) reply: oneshot::Sender<String>,
}

pub struct PsuServer {
    dispatcher: Dispatcher,
    rep: Option<(RepSocket, String)>,
    listener: Option<TcpListener>,
}

impl PsuServer {
    /// A server with no front end yet.
    pub fn new(dispatcher: Dispatcher) -> Self {
        Self {
            dispatcher,
            rep: None,
            listener: None,
        }
    }

    /// Serve ZeroMQ REQ clients on `endpoint`, e.g. `tcp://0.0.0.0:5560`.
    pub async fn listen_zmq(mut self, endpoint: &str) -> Result<Self> {
        self.rep = Some(bind_rep(endpoint).await?);
        Ok(self)
    }

    /// Serve line clients on `addr` (`host:port`).
    pub async fn listen_lines(mut self, addr: &str) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("Failed to bind {}", addr))?;
        self.listener = Some(listener);
        Ok(self)
    }

    /// Resolved ZeroMQ endpoint, if that front end is enabled.
    pub fn zmq_endpoint(&self) -> Option<&str> {
        self.rep.as_ref().map(|(_, endpoint)| endpoint.as_str())
    }

    /// Address of the line listener.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        match &self.listener {
            Some(listener) => Ok(listener.local_addr()?),
            None => bail!("No line listener configured"),
        }
    }

    /// Serve until `shutdown` completes.
    ///
    /// A request already being dispatched runs to completion, so the bus is
    /// released before this returns. Queued requests are dropped.
    pub async fn run_until(self, shutdown: impl Future<Output = ()>) -> Result<()> {
        let Self {
            dispatcher,
            rep,
            listener,
        } = self;
        if rep.is_none() && listener.is_none() {
            bail!("No front end to serve on");
        }

        let mut fronts = Vec::new();
        if let Some((_, endpoint)) = &rep {
            fronts.push(endpoint.clone());
        }
        if let Some(listener) = &listener {
            fronts.push(format!("lines@{}", listener.local_addr()?));
        }
        banner(&format!("Starting server on {}", fronts.join(", ")));

        let (tx, rx) = mpsc::channel::<Job>(QUEUE_DEPTH);
        let (stop_tx, stop_rx) = watch::channel(false);
        let worker = tokio::spawn(run_worker(dispatcher, rx, stop_rx.clone()));
        let rep_task = rep.map(|(socket, _)| tokio::spawn(serve_rep(socket, tx.clone(), stop_rx)));
        let mut connections = JoinSet::new();

        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                accepted = accept(listener.as_ref()) => match accepted {
                    Ok((stream, peer)) => {
                        tracing::debug!(peer = %peer, "client connected");
                        connections.spawn(handle_connection(stream, peer, tx.clone()));
                    }
                    Err(e) => tracing::warn!(error = %e, "accept failed"),
                },
                Some(finished) = connections.join_next(), if !connections.is_empty() => {
                    if let Err(e) = finished {
                        tracing::warn!(error = %e, "connection task failed");
                    }
                }
            }
        }

        // Nothing queued reaches the hardware after this point
        let _ = stop_tx.send(true);
        drop(listener);
        connections.abort_all();
        while connections.join_next().await.is_some() {}
        drop(tx);

        let discarded = worker.await.context("Dispatcher worker panicked")?;
        if let Some(task) = rep_task {
            task.await.context("ZMQ front end panicked")?;
        }
        if discarded > 0 {
            tracing::warn!(discarded, "Discarded queued requests at shutdown");
        }

        banner("Stopping server after shutdown signal");
        Ok(())
    }
}

fn banner(message: &str) {
    let rule = "-".repeat(30);
    tracing::info!("{}", rule);
    tracing::info!("{}", message);
    tracing::info!("{}", rule);
}

async fn accept(listener: Option<&TcpListener>) -> std::io::Result<(TcpStream, SocketAddr)> {
    match listener {
        Some(listener) => listener.accept().await,
        None => std::future::pending().await,
    }
}

/// Dispatch jobs one at a time until `stop` flips or every sender is gone.
///
/// Returns how many queued jobs were dropped without being dispatched.
async fn run_worker(
    dispatcher: Dispatcher,
    mut rx: mpsc::Receiver<Job>,
    mut stop: watch::Receiver<bool>,
) -> usize {
    loop {
        let job = tokio::select! {
            biased;
            _ = stop.changed() => break,
            job = rx.recv() => match job {
                Some(job) => job,
                None => break,
            },
        };
        let reply = dispatcher.dispatch(&job.line).await;
        // Client may have gone away meanwhile
        let _ = job.reply.send(reply);
    }

    rx.close();
    let mut discarded = 0;
    while rx.try_recv().is_ok() {
        discarded += 1;
    }
    discarded
}

async fn handle_connection(stream: TcpStream, peer: SocketAddr, tx: mpsc::Sender<Job>) {
    let (read_half, mut write_half) = stream.into_split();
    let mut lines = BufReader::new(read_half).lines();

    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                tracing::debug!(peer = %peer, error = %e, "read failed");
                break;
            }
        };

        let (reply_tx, reply_rx) = oneshot::channel();
        let job = Job {
            line: line.trim_end_matches('\r').to_string(),
            reply: reply_tx,
        };
        if tx.send(job).await.is_err() {
            break;
        }
        let Ok(reply) = reply_rx.await else {
            break;
        };

        let mut out = reply.into_bytes();
        out.push(b'\n');
        if let Err(e) = write_half.write_all(&out).await {
            tracing::debug!(peer = %peer, error = %e, "write failed");
            break;
        }
    }
    tracing::debug!(peer = %peer, "client disconnected");
}

#[cfg(test)]
mod tests {
    use super::*;
    use psu_hardware::{
        AddressRouter, DescriptorTable, ModelFactory, RoutingConfig, SimulatedBench,
        SimulatedInstrument,
    };
    use std::sync::Arc;

    const PROXY: &str = "192.168.1.50:1234";

    async fn dispatcher(bench: &SimulatedBench) -> Dispatcher {
        let routing = RoutingConfig {
            addresses: vec!["46".into()],
            ..RoutingConfig::default()
        };
        let factory = ModelFactory::new(DescriptorTable::builtin(), Arc::new(bench.clone()));
        Dispatcher::new(AddressRouter::build(&routing, &factory).await)
    }

    fn job(line: &str) -> (Job, oneshot::Receiver<String>) {
        let (reply, reply_rx) = oneshot::channel();
        let job = Job {
            line: line.to_string(),
            reply,
        };
        (job, reply_rx)
    }

    #[tokio::test]
    async fn stopped_worker_discards_queued_jobs() {
        let bench = SimulatedBench::new();
        bench.add_gpib_instrument(PROXY, 6, SimulatedInstrument::agilent_e3648a());
        let dispatcher = dispatcher(&bench).await;
        bench.clear_events();

        let (tx, rx) = mpsc::channel(QUEUE_DEPTH);
        let (stop_tx, stop_rx) = watch::channel(false);
        let mut replies = Vec::new();
        for _ in 0..3 {
            let (job, reply_rx) = job("46:::TurnOn");
            tx.send(job).await.unwrap();
            replies.push(reply_rx);
        }
        stop_tx.send(true).unwrap();

        assert_eq!(run_worker(dispatcher, rx, stop_rx).await, 3);
        assert!(bench.events().is_empty());
        for reply_rx in replies {
            assert!(reply_rx.await.is_err());
        }
        assert!(tx.send(job("46:::TurnOn").0).await.is_err());
    }

    #[tokio::test]
    async fn worker_answers_in_order_until_senders_leave() {
        let bench = SimulatedBench::new();
        bench.add_gpib_instrument(PROXY, 6, SimulatedInstrument::agilent_e3648a());
        let dispatcher = dispatcher(&bench).await;

        let (tx, rx) = mpsc::channel(QUEUE_DEPTH);
        let (_stop_tx, stop_rx) = watch::channel(false);
        let (on, on_rx) = job("46:::TurnOn");
        let (ping, ping_rx) = job("46:::Ping");
        tx.send(on).await.unwrap();
        tx.send(ping).await.unwrap();
        drop(tx);

        assert_eq!(run_worker(dispatcher, rx, stop_rx).await, 0);
        assert_eq!(on_rx.await.unwrap(), "Turning On 46");
        assert_eq!(ping_rx.await.unwrap(), "1");
    }

    #[tokio::test]
    async fn server_needs_a_front_end() {
        let bench = SimulatedBench::new();
        let server = PsuServer::new(dispatcher(&bench).await);
        assert!(server.local_addr().is_err());
        assert!(server.zmq_endpoint().is_none());
        assert!(server.run_until(async {}).await.is_err());
    }
}
