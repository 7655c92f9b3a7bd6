//! Command templates per instrument family.
//!
//! Each family's vocabulary is a fixed table of templates. Placeholders use
//! `strfmt` syntax (`{val}`, `{channel}`) and are rendered without touching a
//! transport, so the grammar can be checked in isolation.

use psu_core::{PsuError, PsuResult};
use std::collections::HashMap;
use strfmt::strfmt;

/// Identification query shared by every family.
pub const IDENTIFY: &str = "*IDN?";

/// How a supply reports whether its output is enabled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputQuery {
    /// Query answers `0` or `1`.
    Flag(&'static str),
    /// Query answers a hexadecimal status word; `bit` is the output flag.
    StatusBit { query: &'static str, bit: u32 },
}

impl OutputQuery {
    pub fn command(&self) -> &'static str {
        match self {
            OutputQuery::Flag(q) => q,
            OutputQuery::StatusBit { query, .. } => query,
        }
    }
}

/// SCPI vocabulary of a programmable supply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandSet {
    pub output_query: OutputQuery,
    pub output_on: &'static str,
    pub output_off: &'static str,
    pub measure_voltage: &'static str,
    pub measure_current: &'static str,
    pub voltage_limit: &'static str,
    pub current_limit: &'static str,
    pub set_voltage: &'static str,
    pub set_current: &'static str,
    /// Output-select directive sent before channel-scoped commands.
    pub select_channel: Option<&'static str>,
}

impl CommandSet {
    /// Linear bench supplies (E3642A, E3633A).
    pub const LINEAR: CommandSet = CommandSet {
        output_query: OutputQuery::Flag("OUTP:STAT?"),
        output_on: "OUTP ON",
        output_off: "OUTP OFF",
        measure_voltage: "MEAS:VOLT?",
        measure_current: "MEAS:CURR?",
        voltage_limit: "VOLT?",
        current_limit: "CURR?",
        set_voltage: "VOLT {val}",
        set_current: "CURR {val}",
        select_channel: None,
    };

    /// Two-output linear supplies (E3648A).
    pub const DUAL_CHANNEL: CommandSet = CommandSet {
        select_channel: Some("INST:SEL OUT{channel}"),
        ..CommandSet::LINEAR
    };

    /// Compact socket supplies (SPD1000X class).
    pub const SOCKET_SUPPLY: CommandSet = CommandSet {
        output_query: OutputQuery::StatusBit {
            query: "SYST:STAT?",
            bit: 4,
        },
        output_on: "OUTP CH1,ON",
        output_off: "OUTP CH1,OFF",
        measure_voltage: "MEAS:VOLT? CH1",
        measure_current: "MEAS:CURR? CH1",
        voltage_limit: "CH1:VOLT?",
        current_limit: "CH1:CURR?",
        set_voltage: "CH1:VOLT {val}",
        set_current: "CH1:CURR {val}",
        select_channel: None,
    };

    pub fn set_voltage(&self, voltage: f64) -> PsuResult<String> {
        render(self.set_voltage, &[("val", voltage.to_string())])
    }

    pub fn set_current(&self, current: f64) -> PsuResult<String> {
        render(self.set_current, &[("val", current.to_string())])
    }

    /// Output-select directive for `channel`, if this family needs one.
    pub fn select_channel(&self, channel: u8) -> PsuResult<Option<String>> {
        self.select_channel
            .map(|t| render(t, &[("channel", channel.to_string())]))
            .transpose()
    }
}

/// Auxiliary rig vocabulary: bias supply plus multimeter.
pub mod rig {
    pub const SET_VOLTAGE: &str = "V {val}";
    pub const SET_CURRENT: &str = "I {val}";
    pub const OUTPUT_ON: &str = "OP 1";
    pub const OUTPUT_OFF: &str = "OP 0";
    pub const READ_VOLTAGE: &str = "VO?";

    /// Four-wire resistance, 1 kOhm range.
    pub const RTD_SETUP: [&str; 3] = ["*RST", "FUNC 'FRES'", "FRES:RANG 1E3"];
    /// DC current, 1 A range.
    pub const CURRENT_SETUP: [&str; 3] = ["*RST", "FUNC 'CURR:DC'", "CURR:RANGE 1."];
    pub const METER_READ: &str = ":READ?";
}

/// Render `template` with named values.
pub fn render(template: &str, values: &[(&str, String)]) -> PsuResult<String> {
    let vars: HashMap<String, String> = values
        .iter()
        .map(|(k, v)| (k.to_string(), v.clone()))
        .collect();
    strfmt(template, &vars)
        .map_err(|e| PsuError::Configuration(format!("Bad command template '{}': {}", template, e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn linear_limits_render_plain_values() {
        let set = CommandSet::LINEAR;
        assert_eq!(set.set_voltage(1.2).unwrap(), "VOLT 1.2");
        assert_eq!(set.set_current(0.6).unwrap(), "CURR 0.6");
        assert_eq!(set.set_voltage(0.0).unwrap(), "VOLT 0");
        assert_eq!(set.select_channel(1).unwrap(), None);
    }

    #[test]
    fn dual_channel_prefixes_output_select() {
        let set = CommandSet::DUAL_CHANNEL;
        assert_eq!(
            set.select_channel(2).unwrap().as_deref(),
            Some("INST:SEL OUT2")
        );
        assert_eq!(set.measure_voltage, "MEAS:VOLT?");
    }

    #[test]
    fn socket_supply_dialect() {
        let set = CommandSet::SOCKET_SUPPLY;
        assert_eq!(set.set_voltage(1.1).unwrap(), "CH1:VOLT 1.1");
        assert_eq!(
            set.output_query,
            OutputQuery::StatusBit {
                query: "SYST:STAT?",
                bit: 4
            }
        );
        assert_eq!(set.output_on, "OUTP CH1,ON");
    }

    #[test]
    fn rig_templates_render() {
        assert_eq!(
            render(rig::SET_VOLTAGE, &[("val", 1.2_f64.to_string())]).unwrap(),
            "V 1.2"
        );
    }

    #[test]
    fn missing_placeholder_is_a_configuration_error() {
        let err = render("VOLT {level}", &[("val", "1".into())]).unwrap_err();
        assert_eq!(err.kind(), psu_core::ErrorKind::Configuration);
    }
}
