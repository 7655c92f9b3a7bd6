//! Driver descriptor table.
//!
//! Maps exact identification strings (the trimmed `*IDN?` reply) to the
//! family of driver that controls the instrument and the safety envelope it
//! may be commanded into. Lookup is exact: a reply that differs in any
//! character, including serial or firmware fields, is an unknown model.

use psu_core::limits::{ASIC_VOLTAGE_CEILING, DEFAULT_ASIC_VOLTAGE, DEFAULT_SAFETY_CURRENT};
use psu_core::SafeRange;
use serde::{Deserialize, Serialize};

pub const AGILENT_E3648A: &str = "Agilent Technologies,E3648A,0,1.7-5.0-1.0";
pub const AGILENT_E3642A: &str = "Agilent Technologies,E3642A,0,1.6-5.0-1.0";
pub const HP_E3633A: &str = "HEWLETT-PACKARD,E3633A,0,1.7-5.0-1.0";

/// Safe bias envelope of the auxiliary rig.
pub const RIG_SAFE_RANGE: SafeRange = SafeRange::new(0.9, 1.5);

/// Which driver variant controls an instrument.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DriverFamily {
    /// Linear bench supply with one output.
    SingleChannel,
    /// Linear bench supply with two outputs selected by `INST:SEL OUT<n>`.
    DualChannel,
    /// Compact supply with its own SCPI socket.
    SocketSupply,
    /// Bias supply plus multimeter sharing one bus.
    AuxRig,
}

impl DriverFamily {
    pub fn default_channels(&self) -> u8 {
        match self {
            DriverFamily::DualChannel => 2,
            _ => 1,
        }
    }

    /// Envelope applied when configuration gives none.
    pub fn default_safe_range(&self) -> SafeRange {
        match self {
            DriverFamily::AuxRig => RIG_SAFE_RANGE,
            _ => SafeRange::new(0.0, ASIC_VOLTAGE_CEILING),
        }
    }
}

impl std::fmt::Display for DriverFamily {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            DriverFamily::SingleChannel => "single_channel",
            DriverFamily::DualChannel => "dual_channel",
            DriverFamily::SocketSupply => "socket_supply",
            DriverFamily::AuxRig => "aux_rig",
        };
        write!(f, "{}", label)
    }
}

/// Bus sub-addresses of the auxiliary rig's instruments.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RigAddresses {
    pub bias: u8,
    pub rtd: u8,
    pub current_meter: u8,
}

impl Default for RigAddresses {
    fn default() -> Self {
        Self {
            bias: 8,
            rtd: 12,
            current_meter: 12,
        }
    }
}

/// Immutable record describing one known instrument model.
#[derive(Debug, Clone, PartialEq)]
pub struct DriverDescriptor {
    pub identification: String,
    pub family: DriverFamily,
    pub channels: u8,
    pub safe_range: SafeRange,
    pub default_current: f64,
    pub default_voltage: f64,
    pub rig: Option<RigAddresses>,
}

impl DriverDescriptor {
    /// Descriptor with the family's default envelope and settings.
    pub fn new(identification: impl Into<String>, family: DriverFamily) -> Self {
        Self {
            identification: identification.into(),
            family,
            channels: family.default_channels(),
            safe_range: family.default_safe_range(),
            default_current: DEFAULT_SAFETY_CURRENT,
            default_voltage: DEFAULT_ASIC_VOLTAGE,
            rig: (family == DriverFamily::AuxRig).then(RigAddresses::default),
        }
    }

    pub fn with_safe_range(mut self, safe_range: SafeRange) -> Self {
        self.safe_range = safe_range;
        self
    }

    pub fn with_default_current(mut self, current: f64) -> Self {
        self.default_current = current;
        self
    }

    pub fn with_rig_addresses(mut self, rig: RigAddresses) -> Self {
        self.rig = Some(rig);
        self
    }
}

/// Registry of known identification strings.
#[derive(Debug, Clone, Default)]
pub struct DescriptorTable {
    entries: Vec<DriverDescriptor>,
}

impl DescriptorTable {
    pub fn empty() -> Self {
        Self::default()
    }

    /// The linear supplies every installation has.
    pub fn builtin() -> Self {
        Self::empty()
            .with(DriverDescriptor::new(AGILENT_E3648A, DriverFamily::DualChannel))
            .with(DriverDescriptor::new(AGILENT_E3642A, DriverFamily::SingleChannel))
            .with(DriverDescriptor::new(HP_E3633A, DriverFamily::SingleChannel))
    }

    /// Add `descriptor`, replacing any entry with the same identification.
    pub fn insert(&mut self, descriptor: DriverDescriptor) {
        self.entries
            .retain(|d| d.identification != descriptor.identification);
        self.entries.push(descriptor);
    }

    pub fn with(mut self, descriptor: DriverDescriptor) -> Self {
        self.insert(descriptor);
        self
    }

    /// Exact match against the trimmed identification reply.
    pub fn lookup(&self, identification: &str) -> Option<&DriverDescriptor> {
        let identification = identification.trim();
        self.entries
            .iter()
            .find(|d| d.identification == identification)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &DriverDescriptor> {
        self.entries.iter()
    }
}
