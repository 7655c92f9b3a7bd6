//! Model detection.
//!
//! [`ModelFactory`] identifies whatever answers at an endpoint and binds the
//! matching driver:
//!
//! 1. Open a probe adapter, address the instrument, send `*IDN?`
//! 2. Disconnect and close the probe immediately, whatever the outcome, so
//!    the shared bus is free for the next probe
//! 3. Exact-match the trimmed reply against the [`DescriptorTable`]
//! 4. Bind the driver to a fresh adapter for the same endpoint
//!
//! An identification missing from the table is an error. No driver is
//! guessed.

use crate::commands::IDENTIFY;
use crate::descriptors::DescriptorTable;
use crate::drivers::{bind, BoundDriver};
use crate::transport::{Connector, Endpoint};
use psu_core::{DynTransport, PsuError, PsuResult, TransportError, DEFAULT_READ_BYTES};
use std::sync::Arc;
use tracing::instrument;

pub struct ModelFactory {
    table: DescriptorTable,
    connector: Arc<dyn Connector>,
}

impl ModelFactory {
    pub fn new(table: DescriptorTable, connector: Arc<dyn Connector>) -> Self {
        Self { table, connector }
    }

    pub fn table(&self) -> &DescriptorTable {
        &self.table
    }

    /// Read the identification string at `endpoint`, releasing the link after.
    #[instrument(skip(self, endpoint), fields(endpoint = %endpoint), err)]
    pub async fn probe(&self, endpoint: &Endpoint) -> PsuResult<String> {
        let mut transport = self.connector.adapter(endpoint);
        let reply = identify_on(&mut transport, endpoint).await;

        let disconnected = transport.disconnect().await;
        let closed = transport.close().await;
        if let Err(e) = disconnected.and(closed) {
            tracing::debug!(endpoint = %endpoint, error = %e, "probe release failed");
        }

        Ok(reply?.trim().to_string())
    }

    /// Identify the instrument at `endpoint` and bind its driver.
    #[instrument(skip(self, endpoint), fields(endpoint = %endpoint), err)]
    pub async fn resolve(&self, endpoint: &Endpoint) -> PsuResult<BoundDriver> {
        let identification = self.probe(endpoint).await?;
        let descriptor =
            self.table
                .lookup(&identification)
                .ok_or_else(|| PsuError::UnknownModel {
                    endpoint: endpoint.to_string(),
                    identification: identification.clone(),
                })?;

        tracing::info!(
            endpoint = %endpoint,
            model = %identification,
            family = %descriptor.family,
            "identified instrument"
        );
        bind(
            descriptor,
            self.connector.adapter(endpoint),
            endpoint.bus_address(),
        )
    }
}

async fn identify_on(
    transport: &mut DynTransport,
    endpoint: &Endpoint,
) -> Result<String, TransportError> {
    transport.connect().await?;
    if let Some(bus_address) = endpoint.bus_address() {
        transport.select(bus_address).await?;
    }
    transport.query(IDENTIFY, DEFAULT_READ_BYTES).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptors::{AGILENT_E3648A, HP_E3633A};
    use crate::transport::{SimulatedBench, SimulatedInstrument};
    use psu_core::ErrorKind;

    const PROXY: &str = "192.168.1.50:1234";

    fn factory(bench: &SimulatedBench) -> ModelFactory {
        ModelFactory::new(DescriptorTable::builtin(), Arc::new(bench.clone()))
    }

    #[tokio::test]
    async fn known_identification_binds_matching_driver() {
        let bench = SimulatedBench::new();
        bench.add_gpib_instrument(PROXY, 6, SimulatedInstrument::agilent_e3648a());
        bench.add_gpib_instrument(PROXY, 3, SimulatedInstrument::hp_e3633a());
        let factory = factory(&bench);

        let dual = factory.resolve(&Endpoint::gpib(PROXY, 6)).await.unwrap();
        assert_eq!(dual.supply.model(), AGILENT_E3648A);
        assert!(dual.multi_channel.is_some());

        let single = factory.resolve(&Endpoint::gpib(PROXY, 3)).await.unwrap();
        assert_eq!(single.supply.model(), HP_E3633A);
    }

    #[tokio::test]
    #[tracing_test::traced_test]
    async fn identification_is_logged() {
        let bench = SimulatedBench::new();
        bench.add_gpib_instrument(PROXY, 6, SimulatedInstrument::agilent_e3648a());

        factory(&bench).resolve(&Endpoint::gpib(PROXY, 6)).await.unwrap();
        assert!(logs_contain("identified instrument"));
        assert!(logs_contain("dual_channel"));
    }

    #[tokio::test]
    async fn probe_releases_the_bus() {
        let bench = SimulatedBench::new();
        bench.add_gpib_instrument(PROXY, 6, SimulatedInstrument::agilent_e3648a());
        let factory = factory(&bench);

        factory.resolve(&Endpoint::gpib(PROXY, 6)).await.unwrap();
        assert_eq!(bench.open_connections(PROXY), 0);
        // Bound driver has not connected yet
        assert_eq!(bench.peak_open(PROXY), 1);
    }

    #[tokio::test]
    async fn unknown_identification_fails_closed() {
        let bench = SimulatedBench::new();
        bench.add_gpib_instrument(
            PROXY,
            5,
            SimulatedInstrument::linear("Agilent Technologies,E3642A,0,1.6-5.0-1.1", 1),
        );
        let factory = factory(&bench);

        let err = factory.resolve(&Endpoint::gpib(PROXY, 5)).await.unwrap_err();
        match err {
            PsuError::UnknownModel {
                identification, ..
            } => assert_eq!(identification, "Agilent Technologies,E3642A,0,1.6-5.0-1.1"),
            other => panic!("expected unknown model, got {:?}", other),
        }
        assert_eq!(bench.open_connections(PROXY), 0);
    }

    #[tokio::test]
    async fn silent_or_missing_instrument_is_a_transport_error() {
        let bench = SimulatedBench::new();
        bench.add_gpib_instrument(PROXY, 6, SimulatedInstrument::agilent_e3648a());
        let factory = factory(&bench);

        let err = factory.resolve(&Endpoint::gpib(PROXY, 7)).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Transport);

        let err = factory
            .resolve(&Endpoint::gpib("192.168.1.51:1234", 6))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Transport);
        assert_eq!(bench.open_connections(PROXY), 0);
    }
}
