//! Directive interpretation.
//!
//! `configure_builder` walks the pushed directives in a fixed order and
//! drives a [`TunBuilder`] transaction: tunnel addresses first, then the
//! redirect-gateway decision and routes, then dhcp options, then the DNS
//! fallback policy, then the finalizers (remote address, MTU, session
//! name). Structural problems abort the pass; single bad route or
//! dhcp-option items are logged and skipped so one stray server push
//! cannot kill the session.

use std::net::{IpAddr, Ipv4Addr};

use tracing::warn;

use crate::addr::{parse_ip, parse_ipv4, same_subnet_v4, AddrMaskPair};
use crate::builder::{HostPort, TunBuilder};
use crate::client::{ClientOptions, ClientState};
use crate::directive::{Directive, DirectiveList};
use crate::error::{Error, ErrorKind, Result};
use crate::redirect::RedirectFlags;
use crate::stats::SessionStats;

const MAX_TOPOLOGY_LEN: usize = 16;
const MAX_TYPE_LEN: usize = 64;
const MAX_ADDR_LEN: usize = 256;

/// Fallback resolvers pushed when the gateway is redirected but the
/// server supplied no DNS and the fallback policy is on.
const FALLBACK_DNS: [Ipv4Addr; 2] = [Ipv4Addr::new(8, 8, 8, 8), Ipv4Addr::new(8, 8, 4, 4)];

/// Which IP versions a configuration pass touched.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IpVer {
    pub v4: bool,
    pub v6: bool,
}

impl IpVer {
    pub fn any(self) -> bool {
        self.v4 || self.v6
    }
}

/// Drive one full builder transaction from pushed directives.
///
/// `state` receives the negotiated VPN addresses when supplied; `stats`
/// receives the no-DNS-after-redirect error count. `quiet` silences the
/// per-item skip logging for fingerprint and diagnostic passes.
pub fn configure_builder(
    tb: &mut dyn TunBuilder,
    state: Option<&mut ClientState>,
    stats: Option<&SessionStats>,
    server_addr: IpAddr,
    opts: &ClientOptions,
    directives: &DirectiveList,
    quiet: bool,
) -> Result<IpVer> {
    let ip_ver = configure_ifconfig(tb, state, directives)?;

    let reroute = add_routes(tb, directives, ip_ver, server_addr, quiet)?;

    let dns_seen = add_dhcp_options(tb, directives, quiet)?;

    // redirected gateway with no usable DNS is a broken session in waiting
    if reroute.v4 && !dns_seen {
        if opts.dns_fallback {
            add_fallback_dns(tb)?;
        } else if let Some(stats) = stats {
            stats.error(ErrorKind::RerouteGwNoDns);
        }
    }

    if !tb.set_remote_address(server_addr) {
        return Err(Error::builder("set_remote_address rejected"));
    }

    if opts.mtu != 0 && !tb.set_mtu(opts.mtu) {
        return Err(Error::builder("set_mtu rejected"));
    }

    if !opts.session_name.is_empty() && !tb.set_session_name(&opts.session_name) {
        return Err(Error::builder("set_session_name rejected"));
    }

    Ok(ip_ver)
}

fn subnet_topology(directives: &DirectiveList) -> Result<bool> {
    match directives.get("topology") {
        Some(o) => match o.get(1, MAX_TOPOLOGY_LEN)? {
            "subnet" => Ok(true),
            "net30" => Ok(false),
            other => Err(Error::format(format!(
                "only topology 'subnet' and 'net30' supported, got '{}'",
                other
            ))),
        },
        None => Ok(false),
    }
}

fn configure_ifconfig(
    tb: &mut dyn TunBuilder,
    mut state: Option<&mut ClientState>,
    directives: &DirectiveList,
) -> Result<IpVer> {
    let mut ip_ver = IpVer::default();
    let top_subnet = subnet_topology(directives)?;

    if let Some(o) = directives.get("ifconfig") {
        if top_subnet {
            let pair = AddrMaskPair::from_args(
                o.get(1, MAX_ADDR_LEN)?,
                o.get_optional(2, MAX_ADDR_LEN)?,
                "ifconfig",
            )?;
            let IpAddr::V4(local) = pair.addr else {
                return Err(Error::addr("ifconfig address is not IPv4 (topology subnet)"));
            };
            if !tb.add_address(pair.addr, pair.prefix_len) {
                return Err(Error::builder("add_address IPv4 rejected (topology subnet)"));
            }
            if let Some(state) = state.as_deref_mut() {
                state.vpn_ip4 = Some(local);
            }
        } else {
            // net30: local and peer endpoint must share one /30
            let local = parse_ipv4(o.get(1, MAX_ADDR_LEN)?, "ifconfig")?;
            let remote = parse_ipv4(o.get(2, MAX_ADDR_LEN)?, "ifconfig")?;
            if !same_subnet_v4(local, remote, 30) {
                return Err(Error::addr(format!(
                    "ifconfig addresses {} and {} are not in the same /30 subnet (topology net30)",
                    local, remote
                )));
            }
            if !tb.add_address(IpAddr::V4(local), 30) {
                return Err(Error::builder("add_address IPv4 rejected (topology net30)"));
            }
            if let Some(state) = state.as_deref_mut() {
                state.vpn_ip4 = Some(local);
            }
        }
        ip_ver.v4 = true;
    }

    if let Some(o) = directives.get("ifconfig-ipv6") {
        if !top_subnet {
            return Err(Error::format("only topology 'subnet' supported with IPv6"));
        }
        let pair = AddrMaskPair::from_args(o.get(1, MAX_ADDR_LEN)?, None, "ifconfig-ipv6")?;
        let IpAddr::V6(local) = pair.addr else {
            return Err(Error::addr("ifconfig-ipv6 address is not IPv6"));
        };
        if !tb.add_address(pair.addr, pair.prefix_len) {
            return Err(Error::builder("add_address IPv6 rejected"));
        }
        if let Some(state) = state.as_deref_mut() {
            state.vpn_ip6 = Some(local);
        }
        ip_ver.v6 = true;
    }

    if !ip_ver.any() {
        return Err(Error::format("one of ifconfig or ifconfig-ipv6 must be specified"));
    }
    Ok(ip_ver)
}

/// Whether a route directive targets the tunnel (`vpn_gateway`, add) or
/// the local gateway (`net_gateway`, exclude). Absent target means add.
fn route_target(o: &Directive, target_index: usize) -> Result<bool> {
    if o.size() > target_index {
        match o.get(target_index, MAX_TYPE_LEN)? {
            "vpn_gateway" => Ok(true),
            "net_gateway" => Ok(false),
            other => Err(Error::route(format!(
                "route target '{}' not supported (only vpn_gateway and net_gateway)",
                other
            ))),
        }
    } else {
        Ok(true)
    }
}

fn apply_route(
    tb: &mut dyn TunBuilder,
    o: &Directive,
    want_v6: bool,
    reroute_active: bool,
) -> Result<()> {
    let (ctx, target_index) = if want_v6 { ("route-ipv6", 2) } else { ("route", 3) };
    let pair = if want_v6 {
        AddrMaskPair::from_args(o.get(1, MAX_ADDR_LEN)?, None, ctx)?
    } else {
        AddrMaskPair::from_args(o.get(1, MAX_ADDR_LEN)?, o.get_optional(2, MAX_ADDR_LEN)?, ctx)?
    };
    if !pair.is_canonical() {
        return Err(Error::route(format!("{} is not canonical", pair)));
    }
    if pair.is_ipv6() != want_v6 {
        return Err(Error::route(format!(
            "{} is not {}",
            pair,
            if want_v6 { "IPv6" } else { "IPv4" }
        )));
    }
    let add = route_target(o, target_index)?;
    // added routes are redundant under an active redirect; exclusions never are
    if !reroute_active || !add {
        if add {
            if !tb.add_route(pair.addr, pair.prefix_len) {
                return Err(Error::route(format!("add_route {} rejected", pair)));
            }
        } else if !tb.exclude_route(pair.addr, pair.prefix_len) {
            return Err(Error::route(format!("exclude_route {} rejected", pair)));
        }
    }
    Ok(())
}

fn add_routes(
    tb: &mut dyn TunBuilder,
    directives: &DirectiveList,
    ip_ver: IpVer,
    server_addr: IpAddr,
    quiet: bool,
) -> Result<IpVer> {
    let rg = RedirectFlags::from_directives(directives);
    let reroute = IpVer {
        v4: rg.ipv4_enabled() && ip_ver.v4,
        v6: rg.ipv6_enabled() && ip_ver.v6,
    };

    if !tb.reroute_gateway(server_addr, reroute.v4, reroute.v6, rg) {
        return Err(Error::route("reroute_gateway rejected"));
    }

    if ip_ver.v4 {
        for o in directives.get_all("route") {
            if let Err(e) = apply_route(tb, o, false, reroute.v4) {
                if !quiet {
                    warn!("skipping IPv4 route {}: {}", o, e);
                }
            }
        }
    }

    if ip_ver.v6 {
        for o in directives.get_all("route-ipv6") {
            if let Err(e) = apply_route(tb, o, true, reroute.v6) {
                if !quiet {
                    warn!("skipping IPv6 route {}: {}", o, e);
                }
            }
        }
    }

    Ok(reroute)
}

#[derive(Default)]
struct PendingProxy {
    auto_config_url: Option<String>,
    http: Option<HostPort>,
    https: Option<HostPort>,
}

fn parse_port(s: &str, ctx: &str) -> Result<u16> {
    match s.parse::<u16>() {
        Ok(p) if p != 0 => Ok(p),
        _ => Err(Error::dhcp_option(format!("{}: bad port '{}'", ctx, s))),
    }
}

fn apply_dhcp_option(
    tb: &mut dyn TunBuilder,
    o: &Directive,
    dns_seen: &mut bool,
    proxy: &mut PendingProxy,
) -> Result<()> {
    match o.get(1, MAX_TYPE_LEN)? {
        "DNS" => {
            o.exact_args(3)?;
            let ip = parse_ip(o.get(2, MAX_ADDR_LEN)?, "dns-server-ip")?;
            if !tb.add_dns_server(ip) {
                return Err(Error::dhcp_option("add_dns_server rejected"));
            }
            *dns_seen = true;
        }
        "DOMAIN" => {
            o.min_args(3)?;
            // an argument may itself carry several space-separated domains
            for j in 2..o.size() {
                for domain in o.get(j, MAX_ADDR_LEN)?.split_whitespace() {
                    if !tb.add_search_domain(domain) {
                        return Err(Error::dhcp_option("add_search_domain rejected"));
                    }
                }
            }
        }
        "PROXY_BYPASS" => {
            o.min_args(3)?;
            for j in 2..o.size() {
                for host in o.get(j, MAX_ADDR_LEN)?.split_whitespace() {
                    if !tb.add_proxy_bypass(host) {
                        return Err(Error::dhcp_option("add_proxy_bypass rejected"));
                    }
                }
            }
        }
        "PROXY_AUTO_CONFIG_URL" => {
            o.exact_args(3)?;
            proxy.auto_config_url = Some(o.get(2, MAX_ADDR_LEN)?.to_string());
        }
        "PROXY_HTTP" => {
            o.exact_args(4)?;
            proxy.http = Some(HostPort {
                host: o.get(2, MAX_ADDR_LEN)?.to_string(),
                port: parse_port(o.get(3, MAX_ADDR_LEN)?, "PROXY_HTTP port")?,
            });
        }
        "PROXY_HTTPS" => {
            o.exact_args(4)?;
            proxy.https = Some(HostPort {
                host: o.get(2, MAX_ADDR_LEN)?.to_string(),
                port: parse_port(o.get(3, MAX_ADDR_LEN)?, "PROXY_HTTPS port")?,
            });
        }
        other => {
            return Err(Error::dhcp_option(format!(
                "unknown pushed option type '{}'",
                other
            )));
        }
    }
    Ok(())
}

fn apply_proxy(tb: &mut dyn TunBuilder, proxy: PendingProxy) -> Result<()> {
    if let Some(p) = proxy.http {
        if !tb.set_proxy_http(&p.host, p.port) {
            return Err(Error::dhcp_option("set_proxy_http rejected"));
        }
    }
    if let Some(p) = proxy.https {
        if !tb.set_proxy_https(&p.host, p.port) {
            return Err(Error::dhcp_option("set_proxy_https rejected"));
        }
    }
    if let Some(url) = proxy.auto_config_url {
        if !tb.set_proxy_auto_config_url(&url) {
            return Err(Error::dhcp_option("set_proxy_auto_config_url rejected"));
        }
    }
    Ok(())
}

/// Returns whether any DNS server was pushed.
fn add_dhcp_options(
    tb: &mut dyn TunBuilder,
    directives: &DirectiveList,
    quiet: bool,
) -> Result<bool> {
    let mut dns_seen = false;
    let mut proxy = PendingProxy::default();
    for o in directives.get_all("dhcp-option") {
        if let Err(e) = apply_dhcp_option(tb, o, &mut dns_seen, &mut proxy) {
            if !quiet {
                warn!("skipping dhcp-option {}: {}", o, e);
            }
        }
    }
    // proxy settings apply once, after the whole scan
    if let Err(e) = apply_proxy(tb, proxy) {
        if !quiet {
            warn!("proxy dhcp-option not applied: {}", e);
        }
    }
    Ok(dns_seen)
}

fn add_fallback_dns(tb: &mut dyn TunBuilder) -> Result<()> {
    for ip in FALLBACK_DNS {
        if !tb.add_dns_server(IpAddr::V4(ip)) {
            return Err(Error::dhcp_option("add_dns_server rejected for fallback DNS"));
        }
    }
    Ok(())
}
