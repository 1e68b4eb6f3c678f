//! Shared test utilities for core module tests
//!
//! Provides the gateway scenario used across test suites: one LAN on `eth0`,
//! a default route through `tun0` and an OpenVPN server at `10.0.0.1:1194/udp`.
//! This module is only compiled in test mode.

use crate::core::firewall::Firewall;
use crate::core::memory::MemoryEngine;
use crate::core::network::{DefaultRoute, LocalNetwork, Protocol, VpnEndpoint};
use crate::core::routing::StaticRouting;
use std::io;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};
use tokio_util::sync::CancellationToken;

/// Mutex for tests that need exclusive access to environment variables.
///
/// # Example
///
/// ```ignore
/// let _guard = ENV_VAR_MUTEX.lock().unwrap();
/// unsafe {
///     std::env::set_var("TUNWALL_ELEVATION_METHOD", "sudo");
/// }
/// // ... test with custom env state ...
/// unsafe {
///     std::env::remove_var("TUNWALL_ELEVATION_METHOD");
/// }
/// ```
pub static ENV_VAR_MUTEX: Mutex<()> = Mutex::new(());

/// Post-rules path that never exists, so enables skip the post-rules step.
pub fn missing_post_rules_path() -> PathBuf {
    PathBuf::from("/nonexistent/tunwall-test/post-rules.txt")
}

pub fn vpn_endpoint() -> VpnEndpoint {
    VpnEndpoint {
        ip: "10.0.0.1".parse().unwrap(),
        port: 1194,
        protocol: Protocol::Udp,
    }
}

pub fn default_route(interface_name: &str, ip: &str) -> DefaultRoute {
    DefaultRoute {
        interface_name: interface_name.to_string(),
        assigned_ip: ip.parse().unwrap(),
    }
}

pub fn local_network(interface_name: &str, ip: &str, subnet: &str) -> LocalNetwork {
    LocalNetwork {
        interface_name: interface_name.to_string(),
        ip: ip.parse().unwrap(),
        subnet: subnet.parse().unwrap(),
    }
}

/// `tun0` default route and the `eth0` LAN `192.168.1.0/24`.
pub fn gateway_routing() -> Arc<StaticRouting> {
    Arc::new(StaticRouting::new(
        vec![default_route("tun0", "10.8.0.2")],
        vec![local_network("eth0", "192.168.1.5", "192.168.1.0/24")],
    ))
}

/// Disabled controller over `engine` with the gateway topology, history cleared.
pub async fn gateway_firewall(engine: &Arc<MemoryEngine>) -> Firewall {
    firewall_with_routing(engine, gateway_routing()).await
}

pub async fn firewall_with_routing(
    engine: &Arc<MemoryEngine>,
    routing: Arc<StaticRouting>,
) -> Firewall {
    let firewall = Firewall::new(
        engine.clone(),
        routing,
        missing_post_rules_path(),
        &CancellationToken::new(),
    )
    .await
    .unwrap();
    engine.clear_history();
    firewall
}

/// Collects `tracing` output of the current thread for assertions.
///
/// ```ignore
/// let logs = LogCapture::default();
/// let _guard = logs.install();
/// // ... code that logs ...
/// assert!(logs.contents().contains("WARN"));
/// ```
#[derive(Clone, Default)]
pub struct LogCapture(Arc<Mutex<Vec<u8>>>);

impl LogCapture {
    /// Routes this thread's events here until the guard is dropped.
    pub fn install(&self) -> tracing::subscriber::DefaultGuard {
        let writer = self.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_ansi(false)
            .with_max_level(tracing::Level::DEBUG)
            .with_writer(move || writer.clone())
            .finish();
        tracing::subscriber::set_default(subscriber)
    }

    pub fn contents(&self) -> String {
        let buffer = self.0.lock().unwrap_or_else(PoisonError::into_inner);
        String::from_utf8_lossy(&buffer).into_owned()
    }
}

impl io::Write for LogCapture {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
