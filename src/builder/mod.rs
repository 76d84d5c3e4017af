//! Tunnel-builder capability.
//!
//! This module defines the seam between directive interpretation and the
//! platform: a [`TunBuilder`] accumulates one tunnel configuration
//! transaction (addresses, routes, DNS, proxy, MTU) and finally turns it
//! into a live tunnel descriptor. Platform integrations implement the
//! trait against their OS facilities; [`BuilderCapture`] implements it by
//! recording, which serves both diagnostics and session-persistence
//! fingerprinting.

mod capture;

pub use capture::{BuilderCapture, HostPort, RerouteGw, RouteEntry};

use std::net::IpAddr;
use std::os::unix::io::RawFd;
use std::sync::{Arc, Mutex};

use crate::redirect::RedirectFlags;

/// One configuration transaction against a platform tunnel facility.
///
/// Calls arrive in a fixed order: `new_session`, then addresses, routes,
/// DNS and proxy settings, then the finalizers, then `establish`.
/// Configuration calls return `false` to reject; the caller treats a
/// rejection as fatal for structural calls and per-item for scans.
pub trait TunBuilder: Send {
    /// Begin a new transaction, discarding any previous one.
    fn new_session(&mut self) -> bool;

    /// Server address the transport connects to. Kept off the tunnel so
    /// redirected default routes cannot swallow the control connection.
    fn set_remote_address(&mut self, address: IpAddr) -> bool;

    /// Add a local tunnel address with its prefix length.
    fn add_address(&mut self, address: IpAddr, prefix_len: u8) -> bool;

    /// Record the default-route redirection decision per IP version,
    /// together with the server address (which platform builders must
    /// keep reachable outside the tunnel) and the full redirect flag word.
    fn reroute_gateway(
        &mut self,
        server: IpAddr,
        ipv4: bool,
        ipv6: bool,
        flags: RedirectFlags,
    ) -> bool;

    /// Route traffic for this network into the tunnel.
    fn add_route(&mut self, address: IpAddr, prefix_len: u8) -> bool;

    /// Keep traffic for this network out of the tunnel.
    fn exclude_route(&mut self, address: IpAddr, prefix_len: u8) -> bool;

    fn add_dns_server(&mut self, address: IpAddr) -> bool;

    fn add_search_domain(&mut self, domain: &str) -> bool;

    fn add_proxy_bypass(&mut self, host: &str) -> bool;

    fn set_proxy_auto_config_url(&mut self, url: &str) -> bool;

    fn set_proxy_http(&mut self, host: &str, port: u16) -> bool;

    fn set_proxy_https(&mut self, host: &str, port: u16) -> bool;

    fn set_mtu(&mut self, mtu: u16) -> bool;

    fn set_session_name(&mut self, name: &str) -> bool;

    /// Create the tunnel interface from the accumulated transaction and
    /// return its raw descriptor. Recording builders return `None`.
    fn establish(&mut self) -> Option<RawFd> {
        None
    }

    /// Tear down whatever `establish` created. Default no-op.
    fn teardown(&mut self) {}
}

/// How the long-lived platform builder is shared between the client,
/// the configurator and session persistence.
pub type SharedBuilder = Arc<Mutex<dyn TunBuilder>>;

/// Wrap a builder for shared use.
pub fn shared<B: TunBuilder + 'static>(builder: B) -> SharedBuilder {
    Arc::new(Mutex::new(builder))
}

/// Lock a shared builder, riding through poisoning so a panicked config
/// pass cannot wedge teardown.
pub fn lock(b: &SharedBuilder) -> std::sync::MutexGuard<'_, dyn TunBuilder + 'static> {
    b.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}
