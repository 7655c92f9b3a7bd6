//! In-process instrument bench.
//!
//! [`SimulatedBench`] holds a set of links (GPIB proxies and direct sockets)
//! with simulated instruments behind them. Each [`SimulatedTransport`] handed
//! out by the bench speaks to those instruments using the same command
//! grammars as the real hardware and records every primitive in a shared
//! event log, so tests can assert on exactly what reached the wire.
//!
//! # Architecture
//!
//! - `SimulatedBench` (cloneable handle): owns the shared state, scripts the
//!   lab, inspects instrument state and the event log
//! - `SimulatedTransport` (given to drivers): implements [`Transport`]
//!
//! # Fault injection
//!
//! - [`SimulatedBench::set_reachable`]: refuse connections to a link
//! - [`Fault::Silent`]: instrument never answers queries (read timeout)
//! - [`Fault::Garbage`]: instrument answers queries with non-numeric text
//! - [`SimulatedBench::set_latency`]: every write takes this long

use super::{Connector, Endpoint};
use crate::descriptors::{AGILENT_E3642A, AGILENT_E3648A, HP_E3633A};
use async_trait::async_trait;
use parking_lot::Mutex;
use psu_core::{
    strip_terminator, truncate_reply, ConnectionState, DynTransport, Transport, TransportError,
};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

// =============================================================================
// Events
// =============================================================================

/// One transport primitive as observed by the bench.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Connect { link: String },
    Disconnect { link: String },
    Close { link: String },
    Select { link: String, bus_address: u8 },
    Write { link: String, bus_address: Option<u8>, command: String },
    Read { link: String, bus_address: Option<u8> },
}

impl TransportEvent {
    pub fn link(&self) -> &str {
        match self {
            TransportEvent::Connect { link }
            | TransportEvent::Disconnect { link }
            | TransportEvent::Close { link }
            | TransportEvent::Select { link, .. }
            | TransportEvent::Write { link, .. }
            | TransportEvent::Read { link, .. } => link,
        }
    }

    /// Command text for write events.
    pub fn command(&self) -> Option<&str> {
        match self {
            TransportEvent::Write { command, .. } => Some(command),
            _ => None,
        }
    }
}

// =============================================================================
// Instruments
// =============================================================================

/// Injected misbehaviour of one simulated instrument.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    /// Queries are never answered.
    Silent,
    /// Queries are answered with non-numeric text.
    Garbage,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Dialect {
    Linear,
    Siglent,
    RigBias,
    Meter,
}

/// Programmed limits of one output channel.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ChannelState {
    pub voltage: f64,
    pub current: f64,
}

/// Measurement function of a simulated multimeter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MeterFunction {
    Reset,
    Resistance,
    Current,
}

/// Simulated supply or meter.
///
/// Supplies drive a resistive load: the measured current is
/// `min(voltage / load, current limit)` while the output is on, zero otherwise.
#[derive(Debug, Clone)]
pub struct SimulatedInstrument {
    identification: String,
    dialect: Dialect,
    channels: Vec<ChannelState>,
    selected_channel: usize,
    output_on: bool,
    load_ohms: f64,
    meter_function: MeterFunction,
    resistance: f64,
    meter_current: f64,
    fault: Option<Fault>,
}

impl SimulatedInstrument {
    fn base(identification: impl Into<String>, dialect: Dialect, channels: usize) -> Self {
        Self {
            identification: identification.into(),
            dialect,
            channels: vec![
                ChannelState {
                    voltage: 0.0,
                    current: 0.0,
                };
                channels.max(1)
            ],
            selected_channel: 0,
            output_on: false,
            load_ohms: 2.0,
            meter_function: MeterFunction::Reset,
            // Pt1000 at 25 C
            resistance: 1096.25,
            meter_current: 0.35,
            fault: None,
        }
    }

    /// Linear bench supply using the `VOLT`/`CURR`/`OUTP` grammar.
    pub fn linear(identification: impl Into<String>, channels: usize) -> Self {
        Self::base(identification, Dialect::Linear, channels)
    }

    pub fn agilent_e3648a() -> Self {
        Self::linear(AGILENT_E3648A, 2)
    }

    pub fn agilent_e3642a() -> Self {
        Self::linear(AGILENT_E3642A, 1)
    }

    pub fn hp_e3633a() -> Self {
        Self::linear(HP_E3633A, 1)
    }

    /// Compact socket supply using the `CH1:`/`SYST:STAT?` grammar.
    pub fn siglent(identification: impl Into<String>) -> Self {
        Self::base(identification, Dialect::Siglent, 1)
    }

    /// Bias supply of the auxiliary rig (`V`, `I`, `OP`, `VO?`).
    pub fn rig_bias(identification: impl Into<String>) -> Self {
        Self::base(identification, Dialect::RigBias, 1)
    }

    /// Multimeter used for RTD and bias-current read-back.
    pub fn meter(identification: impl Into<String>) -> Self {
        Self::base(identification, Dialect::Meter, 1)
    }

    pub fn with_fault(mut self, fault: Fault) -> Self {
        self.fault = Some(fault);
        self
    }

    pub fn with_load(mut self, ohms: f64) -> Self {
        self.load_ohms = ohms;
        self
    }

    pub fn with_resistance(mut self, ohms: f64) -> Self {
        self.resistance = ohms;
        self
    }

    pub fn with_meter_current(mut self, amps: f64) -> Self {
        self.meter_current = amps;
        self
    }

    pub fn identification(&self) -> &str {
        &self.identification
    }

    pub fn output_on(&self) -> bool {
        self.output_on
    }

    /// Programmed limits of channel `n` (1-based).
    pub fn channel(&self, n: usize) -> Option<ChannelState> {
        n.checked_sub(1).and_then(|i| self.channels.get(i)).copied()
    }

    pub fn meter_function(&self) -> MeterFunction {
        self.meter_function
    }

    pub fn set_fault(&mut self, fault: Option<Fault>) {
        self.fault = fault;
    }

    fn measured_voltage(&self, channel: usize) -> f64 {
        if self.output_on {
            self.channels[channel].voltage
        } else {
            0.0
        }
    }

    fn measured_current(&self, channel: usize) -> f64 {
        if !self.output_on || self.load_ohms <= 0.0 {
            return 0.0;
        }
        let state = self.channels[channel];
        (state.voltage / self.load_ohms).min(state.current)
    }

    /// Apply one command line; queries yield a terminated reply.
    fn handle(&mut self, line: &str) -> Option<String> {
        let line = line.trim();
        let is_query = line.contains('?');

        if is_query {
            match self.fault {
                Some(Fault::Silent) => return None,
                Some(Fault::Garbage) => return Some("#ERR\n".to_string()),
                None => {}
            }
        }

        if line == "*IDN?" {
            return Some(format!("{}\n", self.identification));
        }

        let reply = match self.dialect {
            Dialect::Linear => self.handle_linear(line),
            Dialect::Siglent => self.handle_siglent(line),
            Dialect::RigBias => self.handle_rig_bias(line),
            Dialect::Meter => self.handle_meter(line),
        };
        reply.map(|r| format!("{}\n", r))
    }

    fn set_from(&mut self, arg: &str, voltage: bool) {
        if let Ok(value) = arg.trim().parse::<f64>() {
            let ch = &mut self.channels[self.selected_channel];
            if voltage {
                ch.voltage = value;
            } else {
                ch.current = value;
            }
        }
    }

    fn handle_linear(&mut self, line: &str) -> Option<String> {
        let ch = self.selected_channel;
        match line {
            "OUTP:STAT?" => Some(if self.output_on { "1" } else { "0" }.to_string()),
            "OUTP ON" => {
                self.output_on = true;
                None
            }
            "OUTP OFF" => {
                self.output_on = false;
                None
            }
            "MEAS:VOLT?" => Some(format!("{:.6}", self.measured_voltage(ch))),
            "MEAS:CURR?" => Some(format!("{:.6}", self.measured_current(ch))),
            "VOLT?" => Some(format!("{:.6}", self.channels[ch].voltage)),
            "CURR?" => Some(format!("{:.6}", self.channels[ch].current)),
            _ => {
                if let Some(arg) = line.strip_prefix("VOLT ") {
                    self.set_from(arg, true);
                } else if let Some(arg) = line.strip_prefix("CURR ") {
                    self.set_from(arg, false);
                } else if let Some(n) = line.strip_prefix("INST:SEL OUT") {
                    if let Ok(n) = n.parse::<usize>() {
                        if (1..=self.channels.len()).contains(&n) {
                            self.selected_channel = n - 1;
                        }
                    }
                }
                None
            }
        }
    }

    fn handle_siglent(&mut self, line: &str) -> Option<String> {
        match line {
            "SYST:STAT?" => {
                let status: u32 = if self.output_on { 1 << 4 } else { 0 };
                Some(format!("0x{:X}", status))
            }
            "OUTP CH1,ON" => {
                self.output_on = true;
                None
            }
            "OUTP CH1,OFF" => {
                self.output_on = false;
                None
            }
            "MEAS:VOLT? CH1" => Some(format!("{:.3}", self.measured_voltage(0))),
            "MEAS:CURR? CH1" => Some(format!("{:.3}", self.measured_current(0))),
            "CH1:VOLT?" => Some(format!("{:.3}", self.channels[0].voltage)),
            "CH1:CURR?" => Some(format!("{:.3}", self.channels[0].current)),
            _ => {
                if let Some(arg) = line.strip_prefix("CH1:VOLT ") {
                    self.set_from(arg, true);
                } else if let Some(arg) = line.strip_prefix("CH1:CURR ") {
                    self.set_from(arg, false);
                }
                None
            }
        }
    }

    fn handle_rig_bias(&mut self, line: &str) -> Option<String> {
        match line {
            // Bias supply terminates replies with CR LF and a unit suffix
            "VO?" => Some(format!("{:.3}V\r", self.measured_voltage(0))),
            "OP 1" => {
                self.output_on = true;
                None
            }
            "OP 0" => {
                self.output_on = false;
                None
            }
            _ => {
                if let Some(arg) = line.strip_prefix("V ") {
                    self.set_from(arg, true);
                } else if let Some(arg) = line.strip_prefix("I ") {
                    self.set_from(arg, false);
                }
                None
            }
        }
    }

    fn handle_meter(&mut self, line: &str) -> Option<String> {
        match line {
            "*RST" => {
                self.meter_function = MeterFunction::Reset;
                None
            }
            "FUNC 'FRES'" => {
                self.meter_function = MeterFunction::Resistance;
                None
            }
            "FUNC 'CURR:DC'" => {
                self.meter_function = MeterFunction::Current;
                None
            }
            ":READ?" => Some(match self.meter_function {
                MeterFunction::Resistance => format!("{:.4}", self.resistance),
                MeterFunction::Current => format!("{:.6}", self.meter_current),
                MeterFunction::Reset => format!("{:.6}", 0.0),
            }),
            _ => None,
        }
    }
}

// =============================================================================
// Bench
// =============================================================================

#[derive(Debug)]
enum LinkKind {
    Bus(HashMap<u8, SimulatedInstrument>),
    Socket(SimulatedInstrument),
}

#[derive(Debug)]
struct SimLink {
    kind: LinkKind,
    reachable: bool,
}

#[derive(Debug, Default)]
struct BenchState {
    links: HashMap<String, SimLink>,
    events: Vec<TransportEvent>,
    open: HashMap<String, usize>,
    peak_open: HashMap<String, usize>,
    latency: Duration,
}

impl BenchState {
    fn instrument_mut(&mut self, link: &str, bus_address: Option<u8>) -> Option<&mut SimulatedInstrument> {
        match (&mut self.links.get_mut(link)?.kind, bus_address) {
            (LinkKind::Bus(instruments), Some(addr)) => instruments.get_mut(&addr),
            (LinkKind::Bus(_), None) => None,
            (LinkKind::Socket(instrument), _) => Some(instrument),
        }
    }
}

/// Shared handle to a simulated lab.
#[derive(Debug, Clone, Default)]
pub struct SimulatedBench {
    state: Arc<Mutex<BenchState>>,
}

impl SimulatedBench {
    pub fn new() -> Self {
        Self::default()
    }

    /// Place `instrument` at `bus_address` behind the GPIB proxy `proxy`.
    pub fn add_gpib_instrument(
        &self,
        proxy: impl Into<String>,
        bus_address: u8,
        instrument: SimulatedInstrument,
    ) {
        let mut state = self.state.lock();
        let link = state.links.entry(proxy.into()).or_insert_with(|| SimLink {
            kind: LinkKind::Bus(HashMap::new()),
            reachable: true,
        });
        match &mut link.kind {
            LinkKind::Bus(instruments) => {
                instruments.insert(bus_address, instrument);
            }
            LinkKind::Socket(_) => {
                let mut instruments = HashMap::new();
                instruments.insert(bus_address, instrument);
                link.kind = LinkKind::Bus(instruments);
            }
        }
    }

    /// Place `instrument` behind its own socket at `addr`.
    pub fn add_socket_instrument(&self, addr: impl Into<String>, instrument: SimulatedInstrument) {
        self.state.lock().links.insert(
            addr.into(),
            SimLink {
                kind: LinkKind::Socket(instrument),
                reachable: true,
            },
        );
    }

    /// Make connections to `link` succeed or fail.
    pub fn set_reachable(&self, link: &str, reachable: bool) {
        if let Some(l) = self.state.lock().links.get_mut(link) {
            l.reachable = reachable;
        }
    }

    /// Delay every subsequent write by `latency`, like a slow bus.
    pub fn set_latency(&self, latency: Duration) {
        self.state.lock().latency = latency;
    }

    pub fn set_fault(&self, endpoint: &Endpoint, fault: Option<Fault>) {
        let mut state = self.state.lock();
        if let Some(instrument) = state.instrument_mut(endpoint.link(), endpoint.bus_address()) {
            instrument.set_fault(fault);
        }
    }

    /// Inspect or modify the instrument at `endpoint`.
    pub fn with_instrument<R>(
        &self,
        endpoint: &Endpoint,
        f: impl FnOnce(&mut SimulatedInstrument) -> R,
    ) -> Option<R> {
        let mut state = self.state.lock();
        state
            .instrument_mut(endpoint.link(), endpoint.bus_address())
            .map(f)
    }

    pub fn events(&self) -> Vec<TransportEvent> {
        self.state.lock().events.clone()
    }

    pub fn clear_events(&self) {
        self.state.lock().events.clear();
    }

    /// Commands written to the instrument at `endpoint`, in order.
    pub fn writes_to(&self, endpoint: &Endpoint) -> Vec<String> {
        let link = endpoint.link();
        let bus = endpoint.bus_address();
        self.state
            .lock()
            .events
            .iter()
            .filter_map(|e| match e {
                TransportEvent::Write {
                    link: l,
                    bus_address,
                    command,
                } if l == link && (bus.is_none() || *bus_address == bus) => Some(command.clone()),
                _ => None,
            })
            .collect()
    }

    /// Most connections ever open on `link` at the same time.
    pub fn peak_open(&self, link: &str) -> usize {
        self.state.lock().peak_open.get(link).copied().unwrap_or(0)
    }

    /// Connections currently open on `link`.
    pub fn open_connections(&self, link: &str) -> usize {
        self.state.lock().open.get(link).copied().unwrap_or(0)
    }

    /// New disconnected transport for `link`.
    pub fn transport(&self, link: impl Into<String>) -> SimulatedTransport {
        SimulatedTransport {
            bench: self.clone(),
            link: link.into(),
            connected: false,
            selected: None,
            pending: VecDeque::new(),
            last_command: String::new(),
        }
    }
}

impl Connector for SimulatedBench {
    fn adapter(&self, endpoint: &Endpoint) -> DynTransport {
        Box::new(self.transport(endpoint.link()))
    }
}

// =============================================================================
// Transport
// =============================================================================

/// Transport onto one link of a [`SimulatedBench`].
pub struct SimulatedTransport {
    bench: SimulatedBench,
    link: String,
    connected: bool,
    selected: Option<u8>,
    pending: VecDeque<String>,
    last_command: String,
}

impl SimulatedTransport {
    fn ensure_connected(&self) -> Result<(), TransportError> {
        if self.connected {
            Ok(())
        } else {
            Err(TransportError::NotConnected)
        }
    }

    fn drop_link(&mut self, event: TransportEvent) {
        if !self.connected {
            return;
        }
        let mut state = self.bench.state.lock();
        if let Some(open) = state.open.get_mut(&self.link) {
            *open = open.saturating_sub(1);
        }
        state.events.push(event);
        self.connected = false;
        self.selected = None;
        self.pending.clear();
    }
}

#[async_trait]
impl Transport for SimulatedTransport {
    fn endpoint(&self) -> &str {
        &self.link
    }

    fn state(&self) -> ConnectionState {
        if self.connected {
            ConnectionState::Connected
        } else {
            ConnectionState::Disconnected
        }
    }

    async fn connect(&mut self) -> Result<(), TransportError> {
        if self.connected {
            return Ok(());
        }
        let mut state = self.bench.state.lock();
        let reachable = state.links.get(&self.link).map(|l| l.reachable).unwrap_or(false);
        if !reachable {
            return Err(TransportError::Connect {
                endpoint: self.link.clone(),
                source: std::io::Error::new(
                    std::io::ErrorKind::ConnectionRefused,
                    "simulated link unreachable",
                ),
            });
        }

        let open = state.open.entry(self.link.clone()).or_insert(0);
        *open += 1;
        let now_open = *open;
        let peak = state.peak_open.entry(self.link.clone()).or_insert(0);
        *peak = (*peak).max(now_open);
        state.events.push(TransportEvent::Connect {
            link: self.link.clone(),
        });
        self.connected = true;
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<(), TransportError> {
        let event = TransportEvent::Disconnect {
            link: self.link.clone(),
        };
        self.drop_link(event);
        Ok(())
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        let event = TransportEvent::Close {
            link: self.link.clone(),
        };
        self.drop_link(event);
        Ok(())
    }

    async fn select(&mut self, bus_address: u8) -> Result<(), TransportError> {
        self.ensure_connected()?;
        let mut state = self.bench.state.lock();
        if let Some(SimLink {
            kind: LinkKind::Bus(_),
            ..
        }) = state.links.get(&self.link)
        {
            state.events.push(TransportEvent::Select {
                link: self.link.clone(),
                bus_address,
            });
            self.selected = Some(bus_address);
        }
        Ok(())
    }

    async fn write(&mut self, command: &str) -> Result<(), TransportError> {
        self.ensure_connected()?;
        self.last_command = command.to_string();

        let latency = self.bench.state.lock().latency;
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        let mut state = self.bench.state.lock();
        state.events.push(TransportEvent::Write {
            link: self.link.clone(),
            bus_address: self.selected,
            command: command.to_string(),
        });
        if let Some(instrument) = state.instrument_mut(&self.link, self.selected) {
            for line in command.lines() {
                if let Some(reply) = instrument.handle(line) {
                    self.pending.push_back(reply);
                }
            }
        }
        Ok(())
    }

    async fn read(&mut self, max_bytes: usize) -> Result<String, TransportError> {
        self.ensure_connected()?;
        self.bench.state.lock().events.push(TransportEvent::Read {
            link: self.link.clone(),
            bus_address: self.selected,
        });

        match self.pending.pop_front() {
            Some(reply) => {
                let mut reply = strip_terminator(&reply).to_string();
                truncate_reply(&mut reply, max_bytes);
                Ok(reply)
            }
            None => Err(TransportError::Timeout {
                command: self.last_command.clone(),
            }),
        }
    }
}
