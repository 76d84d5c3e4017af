//! Recording tunnel builder.
//!
//! `BuilderCapture` implements [`TunBuilder`](super::TunBuilder) by
//! recording every call in order. Its rendering is the canonical textual
//! form of a tunnel configuration: session persistence compares renderings
//! to decide descriptor reuse, and diagnostics log them. The rendering
//! must therefore be deterministic and must preserve call order.

use std::fmt;
use std::net::IpAddr;

use crate::redirect::RedirectFlags;

use super::TunBuilder;

/// A network captured from `add_route`/`exclude_route`/`add_address`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RouteEntry {
    pub address: IpAddr,
    pub prefix_len: u8,
}

impl fmt::Display for RouteEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.address, self.prefix_len)?;
        if self.address.is_ipv6() {
            f.write_str(" [IPv6]")?;
        }
        Ok(())
    }
}

/// The captured default-route redirection decision.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RerouteGw {
    pub server: Option<IpAddr>,
    pub ipv4: bool,
    pub ipv6: bool,
    pub flags: RedirectFlags,
}

impl fmt::Display for RerouteGw {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "IPv4={} IPv6={} flags={}",
            self.ipv4, self.ipv6, self.flags
        )?;
        if let Some(server) = self.server {
            write!(f, " server={}", server)?;
            if server.is_ipv6() {
                f.write_str(" [IPv6]")?;
            }
        }
        Ok(())
    }
}

/// Proxy endpoint captured from `set_proxy_http`/`set_proxy_https`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostPort {
    pub host: String,
    pub port: u16,
}

impl fmt::Display for HostPort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Ordered record of one builder transaction.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BuilderCapture {
    pub session_name: String,
    pub mtu: u16,
    pub remote_address: Option<IpAddr>,
    pub tunnel_addresses: Vec<RouteEntry>,
    pub reroute_gw: RerouteGw,
    pub add_routes: Vec<RouteEntry>,
    pub exclude_routes: Vec<RouteEntry>,
    pub dns_servers: Vec<IpAddr>,
    pub search_domains: Vec<String>,
    pub proxy_bypass: Vec<String>,
    pub proxy_auto_config_url: Option<String>,
    pub http_proxy: Option<HostPort>,
    pub https_proxy: Option<HostPort>,
}

impl BuilderCapture {
    pub fn new() -> Self {
        Self::default()
    }

    /// Canonical textual form; doubles as the persistence fingerprint.
    pub fn render(&self) -> String {
        self.to_string()
    }
}

impl TunBuilder for BuilderCapture {
    fn new_session(&mut self) -> bool {
        *self = Self::default();
        true
    }

    fn set_remote_address(&mut self, address: IpAddr) -> bool {
        self.remote_address = Some(address);
        true
    }

    fn add_address(&mut self, address: IpAddr, prefix_len: u8) -> bool {
        self.tunnel_addresses.push(RouteEntry {
            address,
            prefix_len,
        });
        true
    }

    fn reroute_gateway(&mut self, server: IpAddr, ipv4: bool, ipv6: bool, flags: RedirectFlags) -> bool {
        self.reroute_gw = RerouteGw {
            server: Some(server),
            ipv4,
            ipv6,
            flags,
        };
        true
    }

    fn add_route(&mut self, address: IpAddr, prefix_len: u8) -> bool {
        self.add_routes.push(RouteEntry {
            address,
            prefix_len,
        });
        true
    }

    fn exclude_route(&mut self, address: IpAddr, prefix_len: u8) -> bool {
        self.exclude_routes.push(RouteEntry {
            address,
            prefix_len,
        });
        true
    }

    fn add_dns_server(&mut self, address: IpAddr) -> bool {
        self.dns_servers.push(address);
        true
    }

    fn add_search_domain(&mut self, domain: &str) -> bool {
        self.search_domains.push(domain.to_string());
        true
    }

    fn add_proxy_bypass(&mut self, host: &str) -> bool {
        self.proxy_bypass.push(host.to_string());
        true
    }

    fn set_proxy_auto_config_url(&mut self, url: &str) -> bool {
        self.proxy_auto_config_url = Some(url.to_string());
        true
    }

    fn set_proxy_http(&mut self, host: &str, port: u16) -> bool {
        self.http_proxy = Some(HostPort {
            host: host.to_string(),
            port,
        });
        true
    }

    fn set_proxy_https(&mut self, host: &str, port: u16) -> bool {
        self.https_proxy = Some(HostPort {
            host: host.to_string(),
            port,
        });
        true
    }

    fn set_mtu(&mut self, mtu: u16) -> bool {
        self.mtu = mtu;
        true
    }

    fn set_session_name(&mut self, name: &str) -> bool {
        self.session_name = name.to_string();
        true
    }
}

impl fmt::Display for BuilderCapture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Session Name: {}", self.session_name)?;
        if self.mtu != 0 {
            writeln!(f, "MTU: {}", self.mtu)?;
        }
        f.write_str("Remote Address: ")?;
        match self.remote_address {
            Some(addr) if addr.is_ipv6() => writeln!(f, "{} [IPv6]", addr)?,
            Some(addr) => writeln!(f, "{}", addr)?,
            None => writeln!(f)?,
        }
        writeln!(f, "Tunnel Addresses:")?;
        for e in &self.tunnel_addresses {
            writeln!(f, "  {}", e)?;
        }
        writeln!(f, "Reroute Gateway: {}", self.reroute_gw)?;
        writeln!(f, "Add Routes:")?;
        for e in &self.add_routes {
            writeln!(f, "  {}", e)?;
        }
        writeln!(f, "Exclude Routes:")?;
        for e in &self.exclude_routes {
            writeln!(f, "  {}", e)?;
        }
        writeln!(f, "DNS Servers:")?;
        for a in &self.dns_servers {
            if a.is_ipv6() {
                writeln!(f, "  {} [IPv6]", a)?;
            } else {
                writeln!(f, "  {}", a)?;
            }
        }
        writeln!(f, "Search Domains:")?;
        for d in &self.search_domains {
            writeln!(f, "  {}", d)?;
        }
        if !self.proxy_bypass.is_empty() {
            writeln!(f, "Proxy Bypass:")?;
            for h in &self.proxy_bypass {
                writeln!(f, "  {}", h)?;
            }
        }
        if let Some(url) = &self.proxy_auto_config_url {
            writeln!(f, "Proxy Auto Config URL: {}", url)?;
        }
        if let Some(p) = &self.http_proxy {
            writeln!(f, "HTTP Proxy: {}", p)?;
        }
        if let Some(p) = &self.https_proxy {
            writeln!(f, "HTTPS Proxy: {}", p)?;
        }
        Ok(())
    }
}
