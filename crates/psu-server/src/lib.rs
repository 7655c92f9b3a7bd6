//! Address-routed request/reply server.
//!
//! - [`protocol`]: `<address>:::<verb>[:::<arg>]` requests and their replies
//! - [`dispatcher`]: routes a request to its driver inside an open/release
//!   bracket
//! - [`server`]: ZeroMQ and line front ends feeding a single dispatcher worker
//! - [`zmq`]: REP front end and REQ client
//! - [`client`]: one-request-per-line client

pub mod client;
pub mod dispatcher;
pub mod protocol;
pub mod server;
pub mod zmq;

pub use client::{request_once, PsuClient};
pub use dispatcher::Dispatcher;
pub use protocol::{parse_power_reply, Command, Request};
pub use server::PsuServer;
pub use zmq::{request_zmq, ZmqClient};
