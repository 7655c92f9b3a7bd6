//! Request dispatch.
//!
//! For each request: look the address up, open the driver's transport, run
//! the verb, and release the transport on every exit path. Nothing here
//! returns an error to the caller; every outcome becomes a reply line.

use crate::protocol::{self, Command, Request};
use psu_core::{PowerReading, PowerSupply, PsuError, PsuResult};
use psu_hardware::AddressRouter;
use std::future::Future;

pub struct Dispatcher {
    router: AddressRouter,
}

impl Dispatcher {
    pub fn new(router: AddressRouter) -> Self {
        Self { router }
    }

    pub fn router(&self) -> &AddressRouter {
        &self.router
    }

    /// Handle one request line and produce its reply line.
    pub async fn dispatch(&self, line: &str) -> String {
        tracing::info!(request = %line, "Received message");
        let reply = self.reply_to(&Request::parse(line)).await;
        tracing::info!(reply = %reply, "Returning");
        reply
    }

    async fn reply_to(&self, request: &Request) -> String {
        let address = request.address.as_str();
        if !self.router.contains(address) {
            tracing::error!(address = %address, "Trying to access unknown address");
            return protocol::unknown_address(address);
        }

        let command = match request.command() {
            Ok(command) => command,
            Err(e) => {
                tracing::warn!(address = %address, error = %e, "bad command");
                return protocol::UNKNOWN_COMMAND.to_string();
            }
        };

        let supply = match self.router.lookup(address) {
            Ok(driver) => driver.supply.as_ref(),
            Err(e) => return unreachable_reply(address, &command, &e),
        };

        match command {
            Command::Ping => protocol::format_ping(&read_power(address, supply).await),
            Command::ReadPower => protocol::format_power(&read_power(address, supply).await),
            Command::SetVoltage { voltage, raw } => {
                let current = supply.default_current();
                match bracketed(supply, || supply.set_limits(voltage, current)).await {
                    Ok(()) => protocol::setting_voltage(address, &raw),
                    // Rejected settings are still acknowledged; nothing was written
                    Err(e @ PsuError::UnsafeParameter { .. }) => {
                        tracing::warn!(address = %address, error = %e, "voltage rejected");
                        protocol::setting_voltage(address, &raw)
                    }
                    Err(e) => failed(address, &e),
                }
            }
            Command::TurnOn => match bracketed(supply, || supply.turn_on()).await {
                Ok(()) => protocol::turning_on(address),
                Err(e) => failed(address, &e),
            },
            Command::TurnOff => match bracketed(supply, || supply.turn_off()).await {
                Ok(()) => protocol::turning_off(address),
                Err(e) => failed(address, &e),
            },
        }
    }
}

/// Open the transport, run `op`, then release whatever happened.
pub async fn bracketed<T, F, Fut>(supply: &dyn PowerSupply, op: F) -> PsuResult<T>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = PsuResult<T>>,
{
    let result = match supply.open().await {
        Ok(()) => op().await,
        Err(e) => Err(e),
    };
    if let Err(e) = supply.release().await {
        tracing::debug!(model = %supply.model(), error = %e, "release failed");
    }
    result
}

async fn read_power(address: &str, supply: &dyn PowerSupply) -> PowerReading {
    match bracketed(supply, || supply.try_read_power()).await {
        Ok(reading) => reading,
        Err(e) => {
            tracing::warn!(address = %address, error = %e, "read failed, returning sentinel");
            PowerReading::SENTINEL
        }
    }
}

fn unreachable_reply(address: &str, command: &Command, error: &PsuError) -> String {
    tracing::warn!(address = %address, verb = command.verb(), error = %error, "no driver");
    match command {
        Command::Ping => protocol::format_ping(&PowerReading::SENTINEL),
        Command::ReadPower => protocol::format_power(&PowerReading::SENTINEL),
        _ => protocol::failure(address, error),
    }
}

fn failed(address: &str, error: &PsuError) -> String {
    tracing::error!(address = %address, error = %error, "command failed");
    protocol::failure(address, error)
}

#[cfg(test)]
mod tests {
    use super::*;
    use psu_hardware::descriptors::AGILENT_E3648A;
    use psu_hardware::transport::{Fault, TransportEvent};
    use psu_hardware::{DescriptorTable, Endpoint, ModelFactory, RoutingConfig};
    use psu_hardware::{SimulatedBench, SimulatedInstrument};
    use std::sync::Arc;

    const PROXY: &str = "192.168.1.50:1234";

    async fn dispatcher(bench: &SimulatedBench, addresses: &[&str]) -> Dispatcher {
        let routing = RoutingConfig {
            addresses: addresses.iter().map(|a| a.to_string()).collect(),
            ..RoutingConfig::default()
        };
        let factory = ModelFactory::new(DescriptorTable::builtin(), Arc::new(bench.clone()));
        Dispatcher::new(AddressRouter::build(&routing, &factory).await)
    }

    #[tokio::test]
    async fn unknown_address_performs_no_io() {
        let bench = SimulatedBench::new();
        bench.add_gpib_instrument(PROXY, 6, SimulatedInstrument::agilent_e3648a());
        let dispatcher = dispatcher(&bench, &["46"]).await;
        bench.clear_events();

        assert_eq!(dispatcher.dispatch("17:::TurnOn").await, "Unknown Address 17");
        assert_eq!(dispatcher.dispatch("17").await, "Unknown Address 17");
        assert!(bench.events().is_empty());
    }

    #[tokio::test]
    async fn bad_verb_on_known_address() {
        let bench = SimulatedBench::new();
        bench.add_gpib_instrument(PROXY, 6, SimulatedInstrument::agilent_e3648a());
        let dispatcher = dispatcher(&bench, &["46"]).await;
        bench.clear_events();

        assert_eq!(dispatcher.dispatch("46:::Reboot").await, "UNKOWN COMMAND");
        assert_eq!(dispatcher.dispatch("46").await, "UNKOWN COMMAND");
        assert_eq!(dispatcher.dispatch("46:::SetVoltage:::abc").await, "UNKOWN COMMAND");
        assert!(bench.events().is_empty());
    }

    #[tokio::test]
    async fn turn_on_then_read_power() {
        let bench = SimulatedBench::new();
        bench.add_gpib_instrument(PROXY, 6, SimulatedInstrument::agilent_e3648a());
        let dispatcher = dispatcher(&bench, &["46"]).await;

        assert_eq!(
            dispatcher.dispatch("46:::SetVoltage:::1.2").await,
            "Setting Voltage 46 1.2"
        );
        assert_eq!(dispatcher.dispatch("46:::TurnOn").await, "Turning On 46");
        assert_eq!(dispatcher.dispatch("46:::Ping").await, "1");

        let reading = protocol::parse_power_reply(&dispatcher.dispatch("46:::ReadPower").await)
            .unwrap();
        assert!(reading.on);
        assert!((reading.voltage - 1.2).abs() < 1e-6);
        assert!((reading.current - 0.6).abs() < 1e-6);

        assert_eq!(dispatcher.dispatch("46:::TurnOff").await, "Turning Off 46");
        assert_eq!(dispatcher.dispatch("46:::Ping").await, "0");
        assert_eq!(bench.open_connections(PROXY), 0);
    }

    #[tokio::test]
    async fn unsafe_voltage_is_acknowledged_but_not_written() {
        let bench = SimulatedBench::new();
        bench.add_gpib_instrument(PROXY, 6, SimulatedInstrument::agilent_e3648a());
        let dispatcher = dispatcher(&bench, &["46"]).await;
        bench.clear_events();

        assert_eq!(
            dispatcher.dispatch("46:::SetVoltage:::2.0").await,
            "Setting Voltage 46 2.0"
        );
        assert!(bench.writes_to(&Endpoint::gpib(PROXY, 6)).is_empty());
    }

    #[tokio::test]
    async fn read_failures_become_sentinels() {
        let bench = SimulatedBench::new();
        bench.add_gpib_instrument(PROXY, 6, SimulatedInstrument::agilent_e3648a());
        let dispatcher = dispatcher(&bench, &["46"]).await;

        bench.set_fault(&Endpoint::gpib(PROXY, 6), Some(Fault::Garbage));
        assert_eq!(dispatcher.dispatch("46:::ReadPower").await, "[-1, -1, -1]");
        assert_eq!(dispatcher.dispatch("46:::Ping").await, "-1");

        bench.set_fault(&Endpoint::gpib(PROXY, 6), None);
        bench.set_reachable(PROXY, false);
        assert_eq!(dispatcher.dispatch("46:::ReadPower").await, "[-1, -1, -1]");
        let reply = dispatcher.dispatch("46:::TurnOn").await;
        assert!(reply.starts_with("ERROR 46: Transport error"), "{}", reply);
    }

    #[tokio::test]
    async fn unresolved_address_fails_safely() {
        let bench = SimulatedBench::new();
        let dispatcher = dispatcher(&bench, &["43"]).await;

        assert_eq!(dispatcher.dispatch("43:::Ping").await, "-1");
        assert_eq!(dispatcher.dispatch("43:::ReadPower").await, "[-1, -1, -1]");
        assert_eq!(
            dispatcher.dispatch("43:::TurnOn").await,
            "ERROR 43: Address 43 is known but its instrument is unreachable"
        );
    }

    #[tokio::test]
    #[tracing_test::traced_test]
    async fn requests_and_replies_are_logged() {
        let bench = SimulatedBench::new();
        let dispatcher = dispatcher(&bench, &["43"]).await;

        dispatcher.dispatch("17:::Ping").await;
        assert!(logs_contain("Received message"));
        assert!(logs_contain("Unknown Address 17"));
    }

    #[tokio::test]
    async fn every_command_is_bracketed() {
        let bench = SimulatedBench::new();
        bench.add_gpib_instrument(PROXY, 6, SimulatedInstrument::agilent_e3648a());
        let dispatcher = dispatcher(&bench, &["46"]).await;
        assert_eq!(
            dispatcher.router().lookup("46").unwrap().supply.model(),
            AGILENT_E3648A
        );
        bench.clear_events();

        dispatcher.dispatch("46:::TurnOn").await;
        let events = bench.events();
        assert!(matches!(events.first(), Some(TransportEvent::Connect { .. })));
        assert!(matches!(events.last(), Some(TransportEvent::Disconnect { .. })));
        assert_eq!(bench.open_connections(PROXY), 0);
    }
}
