//! Power Supply Capability
//!
//! One capability contract, [`PowerSupply`], is implemented by independent
//! driver types per instrument family. Shared policy lives in small value
//! types that each driver composes:
//!
//! - [`SafeRange`]: voltage envelope checked before any setting is written
//! - [`PowerReading`]: measurement triple with a distinguishable sentinel
//! - [`LimitSetting`]: programmed voltage/current limits
//!
//! # Connection bracket
//!
//! All operations except the pre-validation inside `set_limits` require the
//! driver's transport to be connected. Callers bracket each logical operation
//! with [`PowerSupply::open`] and [`PowerSupply::release`]; the bracket is what
//! keeps at most one connection open on a shared bus.

use crate::error::{PsuError, PsuResult};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

// =============================================================================
// Readings
// =============================================================================

/// Output state plus measured voltage and current.
///
/// A failed read is represented by [`PowerReading::SENTINEL`]. Instruments
/// never report -1 V, so the sentinel cannot be mistaken for a real reading.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PowerReading {
    pub on: bool,
    pub voltage: f64,
    pub current: f64,
}

impl PowerReading {
    /// Reading returned when the measurement could not be taken.
    pub const SENTINEL: PowerReading = PowerReading {
        on: false,
        voltage: -1.0,
        current: -1.0,
    };

    pub fn new(on: bool, voltage: f64, current: f64) -> Self {
        Self {
            on,
            voltage,
            current,
        }
    }

    /// True if this is the failed-read sentinel.
    pub fn is_sentinel(&self) -> bool {
        self.voltage == -1.0 && self.current == -1.0 && !self.on
    }
}

impl std::fmt::Display for PowerReading {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Power: {}, Voltage: {:.4} V, Current: {:.4} A",
            if self.on { "On" } else { "Off" },
            self.voltage,
            self.current
        )
    }
}

/// Programmed voltage and current limits.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LimitSetting {
    pub voltage: f64,
    pub current: f64,
}

impl LimitSetting {
    pub fn new(voltage: f64, current: f64) -> Self {
        Self { voltage, current }
    }
}

// =============================================================================
// Safety Policy
// =============================================================================

/// Inclusive voltage envelope a device family may be commanded into.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SafeRange {
    pub min_voltage: f64,
    pub max_voltage: f64,
}

impl SafeRange {
    pub const fn new(min_voltage: f64, max_voltage: f64) -> Self {
        Self {
            min_voltage,
            max_voltage,
        }
    }

    pub fn contains(&self, voltage: f64) -> bool {
        voltage.is_finite() && voltage >= self.min_voltage && voltage <= self.max_voltage
    }

    /// Reject voltages outside the envelope.
    pub fn check_voltage(&self, voltage: f64) -> PsuResult<()> {
        if self.contains(voltage) {
            Ok(())
        } else {
            Err(PsuError::UnsafeParameter {
                quantity: "voltage",
                value: voltage,
                min: self.min_voltage,
                max: self.max_voltage,
            })
        }
    }

    /// Validate a complete limit setting before anything is written.
    ///
    /// Current must be finite and non-negative; voltage must lie in the envelope.
    pub fn check(&self, limits: &LimitSetting) -> PsuResult<()> {
        self.check_voltage(limits.voltage)?;
        if !limits.current.is_finite() || limits.current < 0.0 {
            return Err(PsuError::UnsafeParameter {
                quantity: "current",
                value: limits.current,
                min: 0.0,
                max: f64::INFINITY,
            });
        }
        Ok(())
    }
}

// =============================================================================
// Capability Trait
// =============================================================================

/// Capability: programmable power supply.
///
/// # Contract
/// - `set_limits` validates against [`PowerSupply::safe_range`] first and
///   writes nothing on rejection. Voltage is written before current; neither
///   is applied alone.
/// - `try_read_power` reports failures; `read_power` substitutes the sentinel.
/// - Every other operation surfaces transport failures as errors.
#[async_trait]
pub trait PowerSupply: Send + Sync {
    /// Identification string the driver was bound to.
    fn model(&self) -> &str;

    /// Voltage envelope enforced by `set_limits`.
    fn safe_range(&self) -> SafeRange;

    /// Current limit applied when a caller only specifies a voltage.
    fn default_current(&self) -> f64;

    /// Open (or re-open) the transport for one logical operation.
    async fn open(&self) -> PsuResult<()>;

    /// Disconnect and close the transport.
    async fn release(&self) -> PsuResult<()>;

    /// Query the identification string.
    async fn identify(&self) -> PsuResult<String>;

    /// Query whether the output is enabled.
    async fn is_output_on(&self) -> PsuResult<bool>;

    /// Enable the output.
    async fn turn_on(&self) -> PsuResult<()>;

    /// Disable the output.
    async fn turn_off(&self) -> PsuResult<()>;

    /// Measure output state, voltage and current.
    async fn try_read_power(&self) -> PsuResult<PowerReading>;

    /// Measure, substituting [`PowerReading::SENTINEL`] on any failure.
    async fn read_power(&self) -> PowerReading {
        match self.try_read_power().await {
            Ok(reading) => reading,
            Err(e) => {
                tracing::warn!(model = %self.model(), error = %e, "power read failed");
                PowerReading::SENTINEL
            }
        }
    }

    /// Query the programmed voltage and current limits.
    async fn read_limits(&self) -> PsuResult<LimitSetting>;

    /// Program voltage then current, after validating against the safe range.
    async fn set_limits(&self, voltage: f64, current: f64) -> PsuResult<()>;
}

/// Capability: supply with several independently programmable outputs.
///
/// Channels are numbered from 1. A channel outside `1..=channels()` is
/// rejected before anything is written. The [`PowerSupply`] implementation of
/// the same driver acts on channel 1.
#[async_trait]
pub trait MultiChannelSupply: Send + Sync {
    fn channels(&self) -> u8;

    async fn try_read_power_channel(&self, channel: u8) -> PsuResult<PowerReading>;

    /// Measure one channel, substituting the sentinel on failure.
    async fn read_power_channel(&self, channel: u8) -> PowerReading {
        self.try_read_power_channel(channel)
            .await
            .unwrap_or_else(|e| {
                tracing::warn!(channel, error = %e, "channel power read failed");
                PowerReading::SENTINEL
            })
    }

    async fn read_limits_channel(&self, channel: u8) -> PsuResult<LimitSetting>;

    async fn set_limits_channel(&self, channel: u8, voltage: f64, current: f64) -> PsuResult<()>;

    async fn read_power_1(&self) -> PowerReading {
        self.read_power_channel(1).await
    }

    async fn read_power_2(&self) -> PowerReading {
        self.read_power_channel(2).await
    }

    async fn read_limits_1(&self) -> PsuResult<LimitSetting> {
        self.read_limits_channel(1).await
    }

    async fn read_limits_2(&self) -> PsuResult<LimitSetting> {
        self.read_limits_channel(2).await
    }

    async fn set_limits_1(&self, voltage: f64, current: f64) -> PsuResult<()> {
        self.set_limits_channel(1, voltage, current).await
    }

    async fn set_limits_2(&self, voltage: f64, current: f64) -> PsuResult<()> {
        self.set_limits_channel(2, voltage, current).await
    }
}

/// Reject channel numbers outside `1..=channels`.
pub fn check_channel(channel: u8, channels: u8) -> PsuResult<()> {
    if (1..=channels).contains(&channel) {
        Ok(())
    } else {
        Err(PsuError::UnsafeParameter {
            quantity: "channel",
            value: f64::from(channel),
            min: 1.0,
            max: f64::from(channels),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sentinel_is_distinguishable_from_zero_reading() {
        assert!(PowerReading::SENTINEL.is_sentinel());
        assert!(!PowerReading::new(false, 0.0, 0.0).is_sentinel());
        assert!(!PowerReading::new(true, 1.2, 0.3).is_sentinel());
    }

    #[test]
    fn display_matches_operator_format() {
        let reading = PowerReading::new(true, 1.2, 0.31);
        assert_eq!(
            reading.to_string(),
            "Power: On, Voltage: 1.2000 V, Current: 0.3100 A"
        );
        assert_eq!(
            PowerReading::new(false, 0.0, 0.0).to_string(),
            "Power: Off, Voltage: 0.0000 V, Current: 0.0000 A"
        );
    }

    #[test]
    fn safe_range_is_inclusive() {
        let range = SafeRange::new(0.9, 1.5);
        assert!(range.contains(0.9));
        assert!(range.contains(1.5));
        assert!(!range.contains(1.5001));
        assert!(!range.contains(0.0));
        assert!(!range.contains(f64::NAN));
    }

    #[test]
    fn channel_numbers_start_at_one() {
        assert!(check_channel(1, 2).is_ok());
        assert!(check_channel(2, 2).is_ok());
        assert!(check_channel(0, 2).is_err());
        assert!(matches!(
            check_channel(3, 2),
            Err(PsuError::UnsafeParameter {
                quantity: "channel",
                ..
            })
        ));
    }

    #[test]
    fn check_rejects_unsafe_voltage_and_negative_current() {
        let range = SafeRange::new(0.0, 1.35);
        assert!(range.check(&LimitSetting::new(1.2, 0.6)).is_ok());

        match range.check(&LimitSetting::new(2.0, 0.6)) {
            Err(PsuError::UnsafeParameter {
                quantity, value, ..
            }) => {
                assert_eq!(quantity, "voltage");
                assert_eq!(value, 2.0);
            }
            other => panic!("expected unsafe voltage, got {:?}", other),
        }

        assert!(matches!(
            range.check(&LimitSetting::new(1.0, -0.1)),
            Err(PsuError::UnsafeParameter {
                quantity: "current",
                ..
            })
        ));
    }
}
