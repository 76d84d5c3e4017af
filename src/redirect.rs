//! redirect-gateway flag word.
//!
//! `redirect-gateway` and `redirect-private` share one flag word. Both
//! enable redirection with IPv4 on by default; only `redirect-gateway`
//! sets the reroute bit that actually moves the default route. Flag
//! tokens after the directive name adjust the word (`ipv6` adds IPv6,
//! `!ipv4` removes IPv4).

use std::fmt;

use crate::directive::{Directive, DirectiveList};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RedirectFlags(u32);

impl RedirectFlags {
    pub const ENABLE: u32 = 1 << 0;
    pub const REROUTE_GW: u32 = 1 << 1;
    pub const LOCAL: u32 = 1 << 2;
    pub const AUTO_LOCAL: u32 = 1 << 3;
    pub const DEF1: u32 = 1 << 4;
    pub const BYPASS_DHCP: u32 = 1 << 5;
    pub const BYPASS_DNS: u32 = 1 << 6;
    pub const BLOCK_LOCAL: u32 = 1 << 7;
    pub const IPV4: u32 = 1 << 8;
    pub const IPV6: u32 = 1 << 9;

    /// Scan the pushed directives for redirect options.
    pub fn from_directives(directives: &DirectiveList) -> Self {
        let mut flags = Self::default();
        if let Some(d) = directives.get("redirect-gateway") {
            flags.0 |= Self::ENABLE | Self::REROUTE_GW | Self::IPV4;
            flags.add_flag_args(d);
        }
        if let Some(d) = directives.get("redirect-private") {
            flags.0 |= Self::ENABLE | Self::IPV4;
            flags.add_flag_args(d);
        }
        flags
    }

    fn add_flag_args(&mut self, d: &Directive) {
        for i in 1..d.size() {
            // unknown flag tokens are ignored, same as over-long ones
            let Ok(tok) = d.get(i, 64) else { continue };
            self.0 |= match tok {
                "local" => Self::LOCAL,
                "autolocal" => Self::AUTO_LOCAL,
                "def1" => Self::DEF1,
                "bypass-dhcp" => Self::BYPASS_DHCP,
                "bypass-dns" => Self::BYPASS_DNS,
                "block-local" => Self::BLOCK_LOCAL,
                "ipv6" => Self::IPV6,
                "!ipv4" => {
                    self.0 &= !Self::IPV4;
                    0
                }
                _ => 0,
            };
        }
    }

    /// IPv4 default-route redirection requested.
    pub fn ipv4_enabled(&self) -> bool {
        self.contains(Self::ENABLE | Self::REROUTE_GW | Self::IPV4)
    }

    /// IPv6 default-route redirection requested.
    pub fn ipv6_enabled(&self) -> bool {
        self.contains(Self::ENABLE | Self::REROUTE_GW | Self::IPV6)
    }

    pub fn contains(&self, bits: u32) -> bool {
        self.0 & bits == bits
    }

    pub fn bits(&self) -> u32 {
        self.0
    }
}

impl fmt::Display for RedirectFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:04x}", self.0)
    }
}
