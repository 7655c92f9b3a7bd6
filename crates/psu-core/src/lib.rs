//! `psu-core`
//!
//! Core trait definitions and types for bench power supply control.
//!
//! ## Layers
//!
//! - **Transport**: connect/select/write/query over a GPIB proxy or a socket
//! - **PowerSupply**: one capability contract over every instrument family
//!
//! ## Key Types
//!
//! - [`PowerReading`]: measurement triple with a failed-read sentinel
//! - [`SafeRange`]: voltage envelope enforced before any write
//! - [`PsuError`]: error taxonomy shared by drivers and the dispatcher

pub mod capabilities;
pub mod error;
pub mod limits;
pub mod transport;

pub use capabilities::{
    check_channel, LimitSetting, MultiChannelSupply, PowerReading, PowerSupply, SafeRange,
};
pub use error::{ErrorKind, PsuError, PsuResult, TransportError};
pub use transport::{
    strip_terminator, truncate_reply, ConnectionState, DynTransport, Transport, DEFAULT_READ_BYTES,
};
