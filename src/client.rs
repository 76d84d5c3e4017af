//! Tunnel client lifecycle.
//!
//! [`Client`] sequences one tunnel session: fingerprint the pushed
//! configuration, reuse a persisted descriptor when it matches, otherwise
//! drive the platform builder through a fresh configuration pass and
//! establish a new descriptor, then wrap it in the packet engine. The
//! embedding session observes progress through [`TunParent`] callbacks
//! and supplies the server endpoint through [`Transport`].

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::os::unix::io::RawFd;
use std::path::Path;
use std::sync::Arc;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::builder::{self, BuilderCapture, SharedBuilder};
use crate::configurator::configure_builder;
use crate::directive::DirectiveList;
use crate::error::{Error, ErrorKind, Result};
use crate::io::TunIo;
use crate::persist::TunPersist;
use crate::stats::SessionStats;

fn default_n_parallel() -> usize {
    8
}

/// Client-side tunnel options, loadable from a JSON file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientOptions {
    /// Session name shown by the platform UI, empty to leave unset.
    #[serde(default)]
    pub session_name: String,

    /// Tunnel MTU, 0 to leave the platform default.
    #[serde(default)]
    pub mtu: u16,

    /// Outstanding parallel reads on the tunnel descriptor.
    #[serde(default = "default_n_parallel")]
    pub n_parallel: usize,

    /// Never close the descriptor from this client; it belongs to the
    /// embedding application.
    #[serde(default)]
    pub retain_fd: bool,

    /// Descriptor carries a 4-byte address-family prefix on each packet.
    #[serde(default)]
    pub tun_prefix: bool,

    /// Inject fallback DNS servers when gateway redirection is pushed
    /// without any DNS server.
    #[serde(default)]
    pub dns_fallback: bool,

    /// Log the captured builder configuration before starting.
    #[serde(default)]
    pub debug_builder: bool,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            session_name: String::new(),
            mtu: 0,
            n_parallel: default_n_parallel(),
            retain_fd: false,
            tun_prefix: false,
            dns_fallback: false,
            debug_builder: false,
        }
    }
}

impl ClientOptions {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        serde_json::from_str(&text)
            .map_err(|e| Error::config(format!("{}: {}", path.as_ref().display(), e)))
    }
}

/// Tunnel addressing established during one configuration pass, read by
/// the rest of the session to report the VPN-side addresses.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClientState {
    pub vpn_ip4: Option<Ipv4Addr>,
    pub vpn_ip6: Option<Ipv6Addr>,
}

/// Callbacks into the embedding session. Invoked from the client's own
/// task context, never concurrently.
pub trait TunParent: Send + Sync {
    /// One inbound packet, prefix already stripped.
    fn tun_recv(&self, packet: Bytes);

    /// Terminal tunnel failure.
    fn tun_error(&self, kind: ErrorKind, detail: &str);

    /// A fresh builder session is about to be configured.
    fn tun_pre_tun_config(&self) {}

    /// Route configuration is about to be applied.
    fn tun_pre_route_config(&self) {}

    /// The packet engine is up.
    fn tun_connected(&self) {}
}

/// Supplies the server's network endpoint, queried once per start so a
/// re-resolved address is picked up across reconnects.
pub trait Transport: Send + Sync {
    fn server_endpoint_addr(&self) -> IpAddr;
}

/// Shared configuration for one client instance.
pub struct ClientConfig {
    pub opts: ClientOptions,
    pub stats: Arc<SessionStats>,
    pub persist: Option<Arc<TunPersist>>,
    pub builder: SharedBuilder,
}

impl ClientConfig {
    pub fn new(opts: ClientOptions, builder: SharedBuilder) -> Self {
        Self {
            opts,
            stats: Arc::new(SessionStats::new()),
            persist: None,
            builder,
        }
    }

    /// Enable session persistence: an unchanged pushed configuration
    /// reuses the established descriptor across reconnects.
    pub fn with_persistence(mut self) -> Self {
        self.persist = Some(Arc::new(TunPersist::new(
            self.opts.retain_fd,
            Some(self.builder.clone()),
        )));
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Idle,
    Starting,
    Connected,
    Halted,
}

/// One tunnel session from descriptor acquisition to teardown.
pub struct Client {
    config: ClientConfig,
    parent: Arc<dyn TunParent>,
    transport: Arc<dyn Transport>,
    state: ClientState,
    io: Option<TunIo>,
    pump: Option<JoinHandle<()>>,
    phase: Phase,
}

impl Client {
    pub fn new(
        config: ClientConfig,
        parent: Arc<dyn TunParent>,
        transport: Arc<dyn Transport>,
    ) -> Self {
        Self {
            config,
            parent,
            transport,
            state: ClientState::default(),
            io: None,
            pump: None,
            phase: Phase::Idle,
        }
    }

    /// Bring the tunnel up from the given pushed directives. Ignored on a
    /// client that has already started or halted. Failures are reported
    /// through [`TunParent::tun_error`]; after a setup failure the client
    /// is stopped and any persisted session is closed, so no partially
    /// configured descriptor stays reachable.
    pub async fn start(&mut self, directives: &DirectiveList) {
        if self.phase != Phase::Idle {
            debug!(phase = ?self.phase, "tun: start ignored");
            return;
        }
        self.phase = Phase::Starting;
        match self.start_inner(directives) {
            Ok(true) => {
                self.phase = Phase::Connected;
                self.parent.tun_connected();
            }
            Ok(false) => {
                // descriptor acquisition failed and was reported; nothing
                // was brought up, so a later start may retry
                self.phase = Phase::Idle;
            }
            Err(e) => {
                error!("tun setup failed: {}", e);
                self.stop();
                if let Some(persist) = &self.config.persist {
                    persist.close();
                }
                self.config.stats.error(ErrorKind::TunSetupFailed);
                self.parent
                    .tun_error(ErrorKind::TunSetupFailed, &e.to_string());
            }
        }
    }

    fn start_inner(&mut self, directives: &DirectiveList) -> Result<bool> {
        let server = self.transport.server_endpoint_addr();

        if self.config.opts.debug_builder {
            let mut cap = BuilderCapture::new();
            match configure_builder(
                &mut cap,
                None,
                None,
                server,
                &self.config.opts,
                directives,
                true,
            ) {
                Ok(_) => info!("tun builder configuration:\n{}", cap.render()),
                Err(e) => info!("tun builder debug capture failed: {}", e),
            }
        }

        // Fingerprint pass: a capture failure disables persistence for
        // this round rather than risking a stale reuse decision.
        let candidate = match &self.config.persist {
            Some(_) => {
                let mut cap = BuilderCapture::new();
                match configure_builder(
                    &mut cap,
                    None,
                    None,
                    server,
                    &self.config.opts,
                    directives,
                    true,
                ) {
                    Ok(_) => Some(cap.render()),
                    Err(e) => {
                        debug!("tun context fingerprint capture failed: {}", e);
                        None
                    }
                }
            }
            None => None,
        };

        let mut state = ClientState::default();
        let mut reused = false;
        let mut fd: Option<RawFd> = None;

        if let (Some(persist), Some(fp)) =
            (self.config.persist.as_deref(), candidate.as_deref())
        {
            if persist.matches(fp) {
                state = persist.state();
                fd = Some(persist.fd());
                reused = true;
                info!("tun: reusing established session");
            }
        }

        let fd = match fd {
            Some(fd) => fd,
            None => {
                {
                    let mut tb = builder::lock(&self.config.builder);
                    if !tb.new_session() {
                        return Err(Error::builder("new session rejected"));
                    }
                }
                self.parent.tun_pre_tun_config();
                {
                    let mut tb = builder::lock(&self.config.builder);
                    configure_builder(
                        &mut *tb,
                        Some(&mut state),
                        Some(&self.config.stats),
                        server,
                        &self.config.opts,
                        directives,
                        false,
                    )?;
                }
                let established = builder::lock(&self.config.builder).establish();
                match established {
                    Some(fd) => fd,
                    None => {
                        error!("tun: cannot acquire tun interface socket");
                        self.config.stats.error(ErrorKind::TunIfaceCreate);
                        self.parent.tun_error(
                            ErrorKind::TunIfaceCreate,
                            "cannot acquire tun interface socket",
                        );
                        return Ok(false);
                    }
                }
            }
        };

        if !reused {
            if let (Some(persist), Some(fp)) =
                (self.config.persist.as_deref(), candidate.as_deref())
            {
                persist.persist(fd, &state, fp);
                debug!("tun: saving session for reuse, fingerprint:\n{}", fp);
            }
        }

        // A descriptor held by the persistence layer outlives the engine.
        let retain = candidate.is_some() || reused || self.config.opts.retain_fd;
        let mut io = TunIo::new(
            fd,
            retain,
            self.config.opts.tun_prefix,
            self.config.stats.clone(),
        );
        let mut rx = io
            .start(self.config.opts.n_parallel)
            .ok_or_else(|| Error::iface("packet engine refused to start"))?;

        let parent = self.parent.clone();
        let pool = io.pool();
        self.pump = Some(tokio::spawn(async move {
            while let Some(pkt) = rx.recv().await {
                parent.tun_recv(pkt.clone());
                pool.try_reclaim(pkt);
            }
        }));

        self.io = Some(io);
        self.state = state;
        info!(
            name = self.tun_name(),
            parallel = self.config.opts.n_parallel,
            reused,
            "tun: connected"
        );
        Ok(true)
    }

    /// Forward one outbound packet to the tunnel. False when the client
    /// is not connected or the write was refused.
    pub fn send(&self, packet: &[u8]) -> bool {
        match &self.io {
            Some(io) => io.write(packet),
            None => false,
        }
    }

    /// Halt the engine and tear down the builder session. Idempotent.
    /// A persisted session is left open for the next client instance;
    /// its own close path tears the builder down instead.
    pub fn stop(&mut self) {
        if self.phase == Phase::Halted {
            return;
        }
        self.phase = Phase::Halted;
        if let Some(pump) = self.pump.take() {
            pump.abort();
        }
        let had_engine = match self.io.take() {
            Some(mut io) => {
                io.stop();
                true
            }
            None => false,
        };
        // only an established session has builder state to tear down; with
        // persistence the teardown duty belongs to its close path
        if had_engine && self.config.persist.is_none() {
            builder::lock(&self.config.builder).teardown();
        }
        debug!("tun: client stopped");
    }

    pub fn is_connected(&self) -> bool {
        self.phase == Phase::Connected
    }

    pub fn tun_name(&self) -> &'static str {
        match &self.io {
            Some(io) => io.name(),
            None => "UNDEF_TUN",
        }
    }

    pub fn state(&self) -> &ClientState {
        &self.state
    }

    pub fn vpn_ip4(&self) -> Option<Ipv4Addr> {
        self.state.vpn_ip4
    }

    pub fn vpn_ip6(&self) -> Option<Ipv6Addr> {
        self.state.vpn_ip6
    }

    pub fn stats(&self) -> &SessionStats {
        &self.config.stats
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.stop();
    }
}
