//! Routing collaborator
//!
//! The controller re-reads the gateway's default routes and attached networks
//! every time it enables the firewall, since DHCP or a VPN reconnect can change
//! them between enables.

use crate::core::error::Result;
use crate::core::network::{DefaultRoute, LocalNetwork};
use async_trait::async_trait;
use std::sync::RwLock;

#[async_trait]
pub trait RoutingProvider: Send + Sync {
    async fn default_routes(&self) -> Result<Vec<DefaultRoute>>;
    async fn local_networks(&self) -> Result<Vec<LocalNetwork>>;
}

/// Fixed topology, typically read from the gateway configuration
#[derive(Debug, Default)]
pub struct StaticRouting {
    routes: RwLock<Vec<DefaultRoute>>,
    networks: RwLock<Vec<LocalNetwork>>,
}

impl StaticRouting {
    pub fn new(routes: Vec<DefaultRoute>, networks: Vec<LocalNetwork>) -> Self {
        Self {
            routes: RwLock::new(routes),
            networks: RwLock::new(networks),
        }
    }

    /// Replaces the default routes seen by the next enable.
    pub fn set_default_routes(&self, routes: Vec<DefaultRoute>) {
        *self
            .routes
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = routes;
    }

    /// Replaces the local networks seen by the next enable.
    pub fn set_local_networks(&self, networks: Vec<LocalNetwork>) {
        *self
            .networks
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = networks;
    }
}

#[async_trait]
impl RoutingProvider for StaticRouting {
    async fn default_routes(&self) -> Result<Vec<DefaultRoute>> {
        Ok(self
            .routes
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone())
    }

    async fn local_networks(&self) -> Result<Vec<LocalNetwork>> {
        Ok(self
            .networks
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone())
    }
}
