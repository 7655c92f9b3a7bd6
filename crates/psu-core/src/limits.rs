//! Shared timing and safety constants.
//!
//! This module centralizes:
//! - Transport timeouts (connect, per-query read)
//! - Default bias settings used when a caller only supplies a voltage
//!
//! Routing configuration may override the timeouts; the safety defaults are
//! per descriptor and these values only seed the built-in table.

use std::time::Duration;

// =============================================================================
// Timeout Constants
// =============================================================================

/// Timeout for a single bounded read after a query (1 second).
///
/// The GPIB proxy adapter programs its own read timeout a margin below this,
/// so the proxy gives up before the socket read does.
pub const QUERY_TIMEOUT: Duration = Duration::from_secs(1);

/// Timeout for opening a TCP link to a proxy or instrument (2 seconds).
///
/// Bounds startup resolution when a candidate endpoint is offline.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(2);

// =============================================================================
// Safety Defaults
// =============================================================================

/// Current limit applied with `SetVoltage` requests (amps).
pub const DEFAULT_SAFETY_CURRENT: f64 = 0.6;

/// Nominal ASIC supply voltage (volts).
pub const DEFAULT_ASIC_VOLTAGE: f64 = 1.2;

/// Highest voltage the linear bench supplies may be programmed to (volts).
pub const ASIC_VOLTAGE_CEILING: f64 = 1.35;
