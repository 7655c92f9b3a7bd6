//! Server and routing configuration.
//!
//! Layered with Figment:
//! 1. Defaults from [`PsuConfig::default()`]
//! 2. TOML file (explicit path, else `config/psu.toml` if present)
//! 3. Environment variables prefixed with `PSU_`; nested keys use double
//!    underscores, e.g. `PSU_ROUTING__QUERY_TIMEOUT_MS=1500`
//!
//! ```toml
//! log_level = "info"
//!
//! [server]
//! bind = "tcp://0.0.0.0:5560"
//!
//! [routing]
//! addresses = ["42", "43", "44", "46", "48"]
//! gpib_proxies = ["192.168.1.50:1234", "192.168.1.51:1234"]
//!
//! [routing.gpib_addresses]
//! "99" = 5
//!
//! [[descriptors]]
//! identification = "Siglent Technologies,SPD1168X,SPD13DCQ000000,1.01.01.02.05"
//! family = "socket_supply"
//! ```

use crate::commands::render;
use crate::descriptors::{DescriptorTable, DriverDescriptor, DriverFamily, RigAddresses};
use crate::transport::prologix::PROLOGIX_PORT;
use crate::transport::scpi_socket::DEFAULT_SCPI_PORT;
use anyhow::{Context, Result};
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use psu_core::limits::{CONNECT_TIMEOUT, QUERY_TIMEOUT};
use psu_core::{PsuError, PsuResult, SafeRange};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Config file used when no path is given.
pub const DEFAULT_CONFIG_PATH: &str = "config/psu.toml";

/// Error types for config loading.
#[derive(Debug, thiserror::Error)]
pub enum ConfigLoadError {
    /// Explicitly requested file does not exist
    #[error("Config file not found: {0}")]
    NotFound(String),

    /// Cross-field validation failed
    #[error("Config validation failed:\n{0}")]
    ValidationError(String),
}

// =============================================================================
// Schema
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PsuConfig {
    /// Default tracing filter, overridden by `RUST_LOG`.
    pub log_level: String,
    /// Optional plain-text log file in addition to the console.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_file: Option<PathBuf>,
    pub server: ServerConfig,
    pub routing: RoutingConfig,
    /// Site-specific additions to the built-in descriptor table.
    pub descriptors: Vec<DescriptorConfig>,
}

impl Default for PsuConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_file: None,
            server: ServerConfig::default(),
            routing: RoutingConfig::default(),
            descriptors: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// ZeroMQ REP endpoint the test-stand clients connect to.
    pub bind: String,
    /// Optional extra listener speaking one request per text line, `host:port`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub line_bind: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "tcp://0.0.0.0:5560".to_string(),
            line_bind: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RoutingConfig {
    /// External addresses served, in resolution order.
    pub addresses: Vec<String>,
    /// Addresses whose resolution failure aborts startup.
    pub required: Vec<String>,
    /// GPIB-Ethernet proxies tried in order, `host:port`.
    pub gpib_proxies: Vec<String>,
    /// Host of the direct-socket candidate; `{address}` is substituted.
    pub socket_host_template: String,
    pub socket_port: u16,
    pub query_timeout_ms: u64,
    pub connect_timeout_ms: u64,
    /// Bus address per external address. Default: its last digit.
    pub gpib_addresses: BTreeMap<String, u8>,
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            addresses: ["42", "43", "44", "46", "48"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            required: Vec::new(),
            gpib_proxies: vec![
                format!("192.168.1.50:{}", PROLOGIX_PORT),
                format!("192.168.1.51:{}", PROLOGIX_PORT),
            ],
            socket_host_template: "192.168.1.1{address}".to_string(),
            socket_port: DEFAULT_SCPI_PORT,
            query_timeout_ms: QUERY_TIMEOUT.as_millis() as u64,
            connect_timeout_ms: CONNECT_TIMEOUT.as_millis() as u64,
            gpib_addresses: BTreeMap::new(),
        }
    }
}

impl RoutingConfig {
    pub fn query_timeout(&self) -> Duration {
        Duration::from_millis(self.query_timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// Bus address of `address` behind a GPIB proxy.
    pub fn gpib_address(&self, address: &str) -> PsuResult<u8> {
        if let Some(bus) = self.gpib_addresses.get(address) {
            return Ok(*bus);
        }
        address
            .chars()
            .last()
            .and_then(|c| c.to_digit(10))
            .map(|d| d as u8)
            .ok_or_else(|| {
                PsuError::Configuration(format!(
                    "No GPIB address for '{}': add it to routing.gpib_addresses",
                    address
                ))
            })
    }

    /// `host:port` of the direct-socket candidate for `address`.
    pub fn socket_endpoint(&self, address: &str) -> PsuResult<String> {
        let host = render(
            &self.socket_host_template,
            &[("address", address.to_string())],
        )?;
        Ok(format!("{}:{}", host, self.socket_port))
    }
}

/// One `[[descriptors]]` entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DescriptorConfig {
    pub identification: String,
    pub family: DriverFamily,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub voltage_min: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub voltage_max: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_current: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_voltage: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rig: Option<RigAddresses>,
}

impl DescriptorConfig {
    pub fn to_descriptor(&self) -> DriverDescriptor {
        let mut descriptor = DriverDescriptor::new(self.identification.trim(), self.family);
        let range = descriptor.safe_range;
        descriptor.safe_range = SafeRange::new(
            self.voltage_min.unwrap_or(range.min_voltage),
            self.voltage_max.unwrap_or(range.max_voltage),
        );
        if let Some(current) = self.default_current {
            descriptor.default_current = current;
        }
        if let Some(voltage) = self.default_voltage {
            descriptor.default_voltage = voltage;
        }
        if let Some(rig) = self.rig {
            descriptor.rig = Some(rig);
        }
        descriptor
    }
}

// =============================================================================
// Loading
// =============================================================================

impl PsuConfig {
    /// Load defaults, then the TOML file, then `PSU_` environment overrides.
    ///
    /// An explicit `path` must exist; the default path is optional.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut figment = Figment::from(Serialized::defaults(PsuConfig::default()));

        match path {
            Some(path) => {
                if !path.exists() {
                    return Err(ConfigLoadError::NotFound(path.display().to_string()).into());
                }
                figment = figment.merge(Toml::file(path));
            }
            None => {
                let default_path = Path::new(DEFAULT_CONFIG_PATH);
                if default_path.exists() {
                    figment = figment.merge(Toml::file(default_path));
                } else {
                    tracing::warn!(
                        "Config file not found: {}. Using defaults.",
                        DEFAULT_CONFIG_PATH
                    );
                }
            }
        }

        figment = figment.merge(Env::prefixed("PSU_").split("__"));
        Self::from_figment(figment)
    }

    /// Extract and validate from an assembled figment.
    pub fn from_figment(figment: Figment) -> Result<Self> {
        let config: PsuConfig = figment
            .extract()
            .context("Failed to extract configuration from Figment")?;
        config.validate()?;

        tracing::debug!(
            addresses = config.routing.addresses.len(),
            descriptors = config.descriptors.len(),
            "loaded configuration"
        );
        Ok(config)
    }

    /// Built-in descriptors plus configured ones; configured entries win.
    pub fn descriptor_table(&self) -> DescriptorTable {
        self.descriptors
            .iter()
            .fold(DescriptorTable::builtin(), |table, d| {
                table.with(d.to_descriptor())
            })
    }

    /// Cross-field validation. All problems are reported together.
    pub fn validate(&self) -> Result<(), ConfigLoadError> {
        let mut errors = Vec::new();
        let routing = &self.routing;

        if !self.server.bind.starts_with("tcp://") {
            errors.push(format!(
                "server.bind '{}' is not a tcp:// endpoint",
                self.server.bind
            ));
        }

        if routing.addresses.is_empty() {
            errors.push("routing.addresses is empty".to_string());
        }

        let mut seen = HashSet::new();
        for address in &routing.addresses {
            if address.trim().is_empty() || address.contains(":::") {
                errors.push(format!("invalid address '{}'", address));
            }
            if !seen.insert(address.as_str()) {
                errors.push(format!("duplicate address '{}'", address));
            }
            if !routing.gpib_proxies.is_empty() && routing.gpib_address(address).is_err() {
                errors.push(format!(
                    "address '{}' has no GPIB address (no trailing digit, no override)",
                    address
                ));
            }
        }

        for required in &routing.required {
            if !seen.contains(required.as_str()) {
                errors.push(format!(
                    "required address '{}' is not in routing.addresses",
                    required
                ));
            }
        }

        for proxy in &routing.gpib_proxies {
            let valid = proxy
                .rsplit_once(':')
                .map(|(host, port)| !host.is_empty() && port.parse::<u16>().is_ok())
                .unwrap_or(false);
            if !valid {
                errors.push(format!("GPIB proxy '{}' is not host:port", proxy));
            }
        }

        if !routing.socket_host_template.contains("{address}") {
            errors.push(format!(
                "socket_host_template '{}' lacks the {{address}} placeholder",
                routing.socket_host_template
            ));
        }
        if routing.query_timeout_ms == 0 {
            errors.push("query_timeout_ms must be positive".to_string());
        }
        if routing.connect_timeout_ms == 0 {
            errors.push("connect_timeout_ms must be positive".to_string());
        }

        for d in &self.descriptors {
            let descriptor = d.to_descriptor();
            let range = descriptor.safe_range;
            if d.identification.trim().is_empty() {
                errors.push("descriptor with empty identification".to_string());
            }
            if !(range.min_voltage.is_finite()
                && range.max_voltage.is_finite()
                && range.min_voltage <= range.max_voltage)
            {
                errors.push(format!(
                    "descriptor '{}': invalid voltage range {} to {}",
                    d.identification, range.min_voltage, range.max_voltage
                ));
            }
            if !(descriptor.default_current.is_finite() && descriptor.default_current >= 0.0) {
                errors.push(format!(
                    "descriptor '{}': invalid default current {}",
                    d.identification, descriptor.default_current
                ));
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ConfigLoadError::ValidationError(errors.join("\n")))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_match_lab_layout() {
        let config = PsuConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.server.bind, "tcp://0.0.0.0:5560");
        assert_eq!(config.routing.addresses, vec!["42", "43", "44", "46", "48"]);
        assert_eq!(config.routing.gpib_proxies[0], "192.168.1.50:1234");
        assert_eq!(config.routing.query_timeout(), Duration::from_secs(1));
    }

    #[test]
    fn gpib_address_defaults_to_last_digit() {
        let mut routing = RoutingConfig::default();
        assert_eq!(routing.gpib_address("46").unwrap(), 6);
        assert_eq!(routing.gpib_address("48").unwrap(), 8);
        assert!(routing.gpib_address("rig").is_err());

        routing.gpib_addresses.insert("99".into(), 5);
        assert_eq!(routing.gpib_address("99").unwrap(), 5);
    }

    #[test]
    fn socket_endpoint_from_template() {
        let routing = RoutingConfig::default();
        assert_eq!(routing.socket_endpoint("48").unwrap(), "192.168.1.148:5025");
    }

    #[test]
    fn load_merges_file_over_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
log_level = "debug"

[routing]
addresses = ["46", "99"]
required = ["46"]

[routing.gpib_addresses]
"99" = 5

[[descriptors]]
identification = "THURLBY THANDAR,PL303-P,0,3.05-4.06"
family = "aux_rig"
"#
        )
        .unwrap();

        let config = PsuConfig::load(Some(file.path())).unwrap();
        assert_eq!(config.log_level, "debug");
        assert_eq!(config.routing.addresses, vec!["46", "99"]);
        // Untouched sections keep their defaults
        assert_eq!(config.routing.gpib_proxies.len(), 2);
        assert_eq!(config.server.bind, "tcp://0.0.0.0:5560");

        let table = config.descriptor_table();
        assert_eq!(table.len(), 4);
        let rig = table.lookup("THURLBY THANDAR,PL303-P,0,3.05-4.06").unwrap();
        assert_eq!(rig.safe_range, SafeRange::new(0.9, 1.5));
        assert_eq!(rig.rig, Some(RigAddresses::default()));
    }

    #[test]
    fn serialized_defaults_load_back_unchanged() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        let text = toml::to_string_pretty(&PsuConfig::default()).unwrap();
        file.write_all(text.as_bytes()).unwrap();

        let config = PsuConfig::load(Some(file.path())).unwrap();
        assert_eq!(config, PsuConfig::default());
    }

    #[test]
    fn shipped_example_config_is_valid() {
        let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("../../config/psu.toml");
        let figment = Figment::from(Serialized::defaults(PsuConfig::default()))
            .merge(Toml::file(path));
        let config = PsuConfig::from_figment(figment).unwrap();
        assert!(config.descriptor_table().len() > 3);
    }

    #[test]
    fn explicit_missing_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = PsuConfig::load(Some(&dir.path().join("nope.toml"))).unwrap_err();
        assert!(err.to_string().contains("not found"));
    }

    #[test]
    fn validation_reports_every_problem() {
        let figment = Figment::from(Serialized::defaults(PsuConfig::default())).merge(
            Toml::string(
                r#"
[server]
bind = "0.0.0.0:5560"

[routing]
addresses = ["46", "46", "rig"]
required = ["50"]
gpib_proxies = ["192.168.1.50"]
socket_host_template = "192.168.1.100"
query_timeout_ms = 0

[[descriptors]]
identification = "X"
family = "single_channel"
voltage_min = 2.0
voltage_max = 1.0
"#,
            ),
        );
        let err = PsuConfig::from_figment(figment).unwrap_err();
        let message = format!("{:#}", err);
        for needle in [
            "duplicate address '46'",
            "'rig' has no GPIB address",
            "required address '50'",
            "'192.168.1.50' is not host:port",
            "{address} placeholder",
            "query_timeout_ms",
            "invalid voltage range",
            "server.bind '0.0.0.0:5560' is not a tcp:// endpoint",
        ] {
            assert!(message.contains(needle), "missing '{}' in {}", needle, message);
        }
    }
}
