//! Wire protocol.
//!
//! One request per ZeroMQ message (or per line on the line listener),
//! fields separated by `:::`:
//!
//! ```text
//! <address>:::<verb>[:::<arg>]
//! ```
//!
//! | Verb         | Reply                                             |
//! |--------------|---------------------------------------------------|
//! | `Ping`       | `1`, `0`, or `-1` on a failed read                |
//! | `ReadPower`  | `(on, voltage, current)`, `[-1, -1, -1]` on failure |
//! | `SetVoltage` | `Setting Voltage <address> <arg>`                 |
//! | `TurnOn`     | `Turning On <address>`                            |
//! | `TurnOff`    | `Turning Off <address>`                           |
//!
//! Unregistered addresses get `Unknown Address <address>`, unusable verbs
//! get `UNKOWN COMMAND` (sic, existing clients match on it).

use psu_core::{PowerReading, PsuError, PsuResult};

pub const DELIMITER: &str = ":::";
pub const UNKNOWN_COMMAND: &str = "UNKOWN COMMAND";

#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Ping,
    ReadPower,
    /// `raw` is echoed back verbatim in the acknowledgement.
    SetVoltage { voltage: f64, raw: String },
    TurnOn,
    TurnOff,
}

impl Command {
    pub fn verb(&self) -> &'static str {
        match self {
            Command::Ping => "Ping",
            Command::ReadPower => "ReadPower",
            Command::SetVoltage { .. } => "SetVoltage",
            Command::TurnOn => "TurnOn",
            Command::TurnOff => "TurnOff",
        }
    }
}

/// A request split into its fields. The verb is interpreted lazily so an
/// unknown address can be reported before a bad verb.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub address: String,
    pub verb: Option<String>,
    pub arg: Option<String>,
}

impl Request {
    pub fn parse(line: &str) -> Self {
        let mut fields = line.trim_end_matches(['\r', '\n']).split(DELIMITER);
        let address = fields.next().unwrap_or_default().to_string();
        Self {
            address,
            verb: fields.next().map(str::to_string),
            arg: fields.next().map(str::to_string),
        }
    }

    pub fn command(&self) -> PsuResult<Command> {
        let verb = self
            .verb
            .as_deref()
            .ok_or_else(|| PsuError::MalformedRequest("no command specified".into()))?;
        match verb {
            "Ping" => Ok(Command::Ping),
            "ReadPower" => Ok(Command::ReadPower),
            "TurnOn" => Ok(Command::TurnOn),
            "TurnOff" => Ok(Command::TurnOff),
            "SetVoltage" => {
                let raw = self.arg.as_deref().ok_or_else(|| {
                    PsuError::MalformedRequest("SetVoltage needs a voltage".into())
                })?;
                let voltage = raw.trim().parse::<f64>().map_err(|_| {
                    PsuError::MalformedRequest(format!("bad voltage '{}'", raw))
                })?;
                Ok(Command::SetVoltage {
                    voltage,
                    raw: raw.to_string(),
                })
            }
            other => Err(PsuError::MalformedRequest(format!("bad command '{}'", other))),
        }
    }
}

/// Build a request line.
pub fn format_request(address: &str, verb: &str, arg: Option<&str>) -> String {
    match arg {
        Some(arg) => format!("{address}{DELIMITER}{verb}{DELIMITER}{arg}"),
        None => format!("{address}{DELIMITER}{verb}"),
    }
}

// =============================================================================
// Replies
// =============================================================================

pub fn unknown_address(address: &str) -> String {
    format!("Unknown Address {}", address)
}

pub fn setting_voltage(address: &str, raw: &str) -> String {
    format!("Setting Voltage {} {}", address, raw)
}

pub fn turning_on(address: &str) -> String {
    format!("Turning On {}", address)
}

pub fn turning_off(address: &str) -> String {
    format!("Turning Off {}", address)
}

pub fn failure(address: &str, error: &PsuError) -> String {
    format!("ERROR {}: {}", address, error)
}

/// `1`/`0` for the output state, `-1` for a failed read.
pub fn format_ping(reading: &PowerReading) -> String {
    if reading.is_sentinel() {
        "-1".to_string()
    } else if reading.on {
        "1".to_string()
    } else {
        "0".to_string()
    }
}

/// Reading reply sent when the measurement failed.
pub const FAILED_READING: &str = "[-1, -1, -1]";

/// `(1, 1.2, 0.6)`, or [`FAILED_READING`] for a failed read.
pub fn format_power(reading: &PowerReading) -> String {
    if reading.is_sentinel() {
        return FAILED_READING.to_string();
    }
    format!(
        "({}, {:?}, {:?})",
        i32::from(reading.on),
        reading.voltage,
        reading.current
    )
}

/// Inverse of [`format_power`]. Accepts `()` or `[]` and quoted fields.
pub fn parse_power_reply(reply: &str) -> Option<PowerReading> {
    let inner = reply
        .trim()
        .trim_start_matches(['(', '['])
        .trim_end_matches([')', ']']);
    let fields: Vec<&str> = inner
        .split(',')
        .map(|f| f.trim().trim_matches(['\'', '"']))
        .collect();
    let [on, voltage, current] = fields.as_slice() else {
        return None;
    };

    let on: f64 = on.parse().ok()?;
    let voltage: f64 = voltage.parse().ok()?;
    let current: f64 = current.parse().ok()?;
    if on < 0.0 {
        return Some(PowerReading::SENTINEL);
    }
    Some(PowerReading::new(on != 0.0, voltage, current))
}
