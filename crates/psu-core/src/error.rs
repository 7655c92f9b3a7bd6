//! Error types shared by transports, drivers and the request dispatcher.
//!
//! The taxonomy mirrors how failures are recovered:
//!
//! - **`Transport`**: connect/write/read failure at the adapter level. Recovered
//!   locally on the `ReadPower`/`Ping` paths (sentinel reading); otherwise the
//!   dispatcher turns it into a failure reply and keeps serving.
//! - **`UnknownModel`**: the identification string is not in the descriptor
//!   table. Fatal for that address at startup; the address is marked unresolved.
//! - **`UnknownAddress`**: a wire request names an address that was never
//!   registered. Always recovered with the literal `Unknown Address` reply.
//! - **`Unresolved`**: the address is registered but no instrument answered
//!   during startup resolution.
//! - **`UnsafeParameter`**: a requested setting lies outside the safe envelope.
//!   Nothing is written to the transport.
//! - **`MalformedRequest`**: missing or unrecognised verb, or a bad argument.
//!
//! `Parse` and `Configuration` cover unparseable instrument replies and invalid
//! routing configuration respectively. `Unsupported` is raised by families
//! whose vocabulary lacks an operation (the rig has no limit read-back).

use thiserror::Error;

// =============================================================================
// Error Kinds
// =============================================================================

/// Coarse classification used by callers that pick a recovery strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Transport,
    UnknownModel,
    UnknownAddress,
    Unresolved,
    UnsafeParameter,
    MalformedRequest,
    Parse,
    Configuration,
    Unsupported,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            ErrorKind::Transport => "transport",
            ErrorKind::UnknownModel => "unknown_model",
            ErrorKind::UnknownAddress => "unknown_address",
            ErrorKind::Unresolved => "unresolved",
            ErrorKind::UnsafeParameter => "unsafe_parameter",
            ErrorKind::MalformedRequest => "malformed_request",
            ErrorKind::Parse => "parse",
            ErrorKind::Configuration => "configuration",
            ErrorKind::Unsupported => "unsupported",
        };
        write!(f, "{}", label)
    }
}

// =============================================================================
// Transport Errors
// =============================================================================

/// Failure of a single transport primitive.
///
/// A `query` is one write followed by one bounded read; a timeout or a dropped
/// link surfaces here and is never retried by the adapter.
#[derive(Error, Debug)]
pub enum TransportError {
    /// A command was attempted while the adapter was disconnected.
    #[error("transport is not connected")]
    NotConnected,

    /// The TCP connection to the proxy or instrument could not be opened.
    #[error("failed to connect to {endpoint}: {source}")]
    Connect {
        endpoint: String,
        #[source]
        source: std::io::Error,
    },

    /// The TCP connection was not established within the connect timeout.
    #[error("timed out connecting to {endpoint}")]
    ConnectTimeout { endpoint: String },

    /// No reply arrived within the per-call read timeout.
    #[error("timed out waiting for reply to '{command}'")]
    Timeout { command: String },

    /// The peer closed the connection (zero-byte read).
    #[error("connection closed by peer")]
    Closed,

    /// Any other socket-level failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

// =============================================================================
// Application Errors
// =============================================================================

/// Convenience alias for results using [`PsuError`].
pub type PsuResult<T> = std::result::Result<T, PsuError>;

/// Primary error type for drivers, factory, router and dispatcher.
#[derive(Error, Debug)]
pub enum PsuError {
    /// Adapter-level failure (connect, write, read, timeout).
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// The instrument answered `*IDN?` with a string missing from the
    /// descriptor table. The caller must not guess a driver.
    #[error("Unknown model at {endpoint}: '{identification}'")]
    UnknownModel {
        endpoint: String,
        identification: String,
    },

    /// Wire request for an address that was never registered.
    #[error("Unknown Address {0}")]
    UnknownAddress(String),

    /// Address is registered, but startup resolution found no instrument.
    #[error("Address {0} is known but its instrument is unreachable")]
    Unresolved(String),

    /// Requested setting outside the descriptor's safe envelope.
    ///
    /// Raised before anything reaches the wire; values are never clamped.
    #[error("Requested {quantity} {value} outside safe range {min} to {max}")]
    UnsafeParameter {
        quantity: &'static str,
        value: f64,
        min: f64,
        max: f64,
    },

    /// Missing verb, unknown verb, or unusable argument in a wire request.
    #[error("Malformed request: {0}")]
    MalformedRequest(String),

    /// Instrument reply could not be interpreted.
    #[error("Could not parse reply '{reply}' to '{command}'")]
    Parse { command: String, reply: String },

    /// Routing or descriptor configuration is invalid.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// The instrument family has no command for this operation.
    #[error("{model} does not support {operation}")]
    Unsupported {
        model: String,
        operation: &'static str,
    },
}

impl PsuError {
    /// Classification of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            PsuError::Transport(_) => ErrorKind::Transport,
            PsuError::UnknownModel { .. } => ErrorKind::UnknownModel,
            PsuError::UnknownAddress(_) => ErrorKind::UnknownAddress,
            PsuError::Unresolved(_) => ErrorKind::Unresolved,
            PsuError::UnsafeParameter { .. } => ErrorKind::UnsafeParameter,
            PsuError::MalformedRequest(_) => ErrorKind::MalformedRequest,
            PsuError::Parse { .. } => ErrorKind::Parse,
            PsuError::Configuration(_) => ErrorKind::Configuration,
            PsuError::Unsupported { .. } => ErrorKind::Unsupported,
        }
    }

    /// True for adapter-level failures.
    pub fn is_transport(&self) -> bool {
        self.kind() == ErrorKind::Transport
    }

    /// Build a parse error from the command and the raw reply.
    pub fn parse(command: impl Into<String>, reply: impl Into<String>) -> Self {
        PsuError::Parse {
            command: command.into(),
            reply: reply.into(),
        }
    }
}
