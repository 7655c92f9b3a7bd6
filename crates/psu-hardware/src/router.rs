//! External address to driver mapping.
//!
//! Built once at startup. For each configured address the router tries its
//! candidate endpoints in priority order (every GPIB proxy in turn, then the
//! direct socket) and keeps the first one the [`ModelFactory`] resolves.
//! An address no candidate resolves stays in the map as unresolved, so a
//! later lookup reports "known but unreachable" rather than "unknown".

use crate::config::{PsuConfig, RoutingConfig};
use crate::drivers::BoundDriver;
use crate::factory::ModelFactory;
use crate::transport::{Connector, Endpoint};
use anyhow::Result;
use psu_core::{PsuError, PsuResult};
use std::collections::HashMap;
use std::sync::Arc;

/// One routed address.
#[derive(Debug, Clone)]
pub struct Route {
    pub address: String,
    /// Endpoint the driver was found at.
    pub endpoint: Option<Endpoint>,
    pub driver: Option<BoundDriver>,
}

impl Route {
    pub fn is_resolved(&self) -> bool {
        self.driver.is_some()
    }
}

#[derive(Debug, Clone, Default)]
pub struct AddressRouter {
    routes: HashMap<String, Route>,
    order: Vec<String>,
}

impl AddressRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `address`, bound to `driver` or explicitly unresolved.
    pub fn insert(
        &mut self,
        address: impl Into<String>,
        endpoint: Option<Endpoint>,
        driver: Option<BoundDriver>,
    ) {
        let address = address.into();
        if !self.routes.contains_key(&address) {
            self.order.push(address.clone());
        }
        self.routes.insert(
            address.clone(),
            Route {
                address,
                endpoint,
                driver,
            },
        );
    }

    /// Driver for `address`.
    ///
    /// Fails with [`PsuError::UnknownAddress`] if the address was never
    /// registered and [`PsuError::Unresolved`] if no instrument was found.
    pub fn lookup(&self, address: &str) -> PsuResult<&BoundDriver> {
        let route = self
            .routes
            .get(address)
            .ok_or_else(|| PsuError::UnknownAddress(address.to_string()))?;
        route
            .driver
            .as_ref()
            .ok_or_else(|| PsuError::Unresolved(address.to_string()))
    }

    pub fn contains(&self, address: &str) -> bool {
        self.routes.contains_key(address)
    }

    pub fn route(&self, address: &str) -> Option<&Route> {
        self.routes.get(address)
    }

    /// Routes in registration order.
    pub fn routes(&self) -> impl Iterator<Item = &Route> {
        self.order.iter().filter_map(|a| self.routes.get(a))
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    pub fn resolved_count(&self) -> usize {
        self.routes.values().filter(|r| r.is_resolved()).count()
    }

    /// Fail if any of `required` is unresolved or missing.
    pub fn check_required(&self, required: &[String]) -> PsuResult<()> {
        for address in required {
            self.lookup(address)?;
        }
        Ok(())
    }

    /// Candidate endpoints for `address`, highest priority first.
    pub fn candidates(routing: &RoutingConfig, address: &str) -> PsuResult<Vec<Endpoint>> {
        let mut candidates = Vec::with_capacity(routing.gpib_proxies.len() + 1);
        if !routing.gpib_proxies.is_empty() {
            let bus_address = routing.gpib_address(address)?;
            candidates.extend(
                routing
                    .gpib_proxies
                    .iter()
                    .map(|proxy| Endpoint::gpib(proxy.clone(), bus_address)),
            );
        }
        candidates.push(Endpoint::socket(routing.socket_endpoint(address)?));
        Ok(candidates)
    }

    /// Resolve every configured address through `factory`.
    ///
    /// Resolution failures never abort; see [`AddressRouter::check_required`].
    pub async fn build(routing: &RoutingConfig, factory: &ModelFactory) -> Self {
        let mut router = Self::new();
        for address in &routing.addresses {
            let (endpoint, driver) = match Self::candidates(routing, address) {
                Ok(candidates) => match resolve_first(address, &candidates, factory).await {
                    Some((endpoint, driver)) => (Some(endpoint), Some(driver)),
                    None => (None, None),
                },
                Err(e) => {
                    tracing::error!(address = %address, error = %e, "no candidate endpoints");
                    (None, None)
                }
            };
            router.insert(address.clone(), endpoint, driver);
        }

        tracing::info!(
            resolved = router.resolved_count(),
            total = router.len(),
            "address resolution complete"
        );
        router
    }

    /// Build from configuration and enforce the required addresses.
    pub async fn from_config(config: &PsuConfig, connector: Arc<dyn Connector>) -> Result<Self> {
        let factory = ModelFactory::new(config.descriptor_table(), connector);
        let router = Self::build(&config.routing, &factory).await;
        router.check_required(&config.routing.required)?;
        Ok(router)
    }
}

async fn resolve_first(
    address: &str,
    candidates: &[Endpoint],
    factory: &ModelFactory,
) -> Option<(Endpoint, BoundDriver)> {
    for endpoint in candidates {
        match factory.resolve(endpoint).await {
            Ok(driver) => {
                tracing::info!(
                    address = %address,
                    endpoint = %endpoint,
                    model = %driver.descriptor.identification,
                    "found power supply"
                );
                return Some((endpoint.clone(), driver));
            }
            Err(e) => {
                tracing::debug!(address = %address, endpoint = %endpoint, error = %e, "candidate failed");
            }
        }
    }
    tracing::error!(address = %address, "power supply not found on any endpoint");
    None
}
