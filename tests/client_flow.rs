//! Integration-style tests driving a full client lifecycle over a
//! socketpair standing in for the tunnel descriptor: configure from
//! pushed directives, exchange packets both ways, and reuse the
//! persisted descriptor across reconnects.

use std::net::{IpAddr, Ipv4Addr};
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use tokio::time::sleep;

use tunclient::{
    builder, BuilderCapture, Client, ClientConfig, ClientOptions, DirectiveList, ErrorKind,
    RedirectFlags, SessionStats, Transport, TunBuilder, TunParent, TunPersist,
};

const PUSHED: &str = "topology subnet\n\
                      ifconfig 10.8.0.2 255.255.255.0\n\
                      route 10.8.0.0 255.255.255.0\n\
                      dhcp-option DNS 10.8.0.1\n";

fn dgram_pair() -> (RawFd, RawFd) {
    let mut fds = [0; 2];
    let r = unsafe { libc::socketpair(libc::AF_UNIX, libc::SOCK_DGRAM, 0, fds.as_mut_ptr()) };
    assert_eq!(r, 0, "socketpair failed");
    (fds[0], fds[1])
}

fn peer_send(fd: RawFd, data: &[u8]) {
    let n = unsafe { libc::write(fd, data.as_ptr() as *const libc::c_void, data.len()) };
    assert_eq!(n as usize, data.len());
}

fn peer_recv(fd: RawFd) -> Option<Vec<u8>> {
    let mut pfd = libc::pollfd {
        fd,
        events: libc::POLLIN,
        revents: 0,
    };
    if unsafe { libc::poll(&mut pfd, 1, 2000) } <= 0 {
        return None;
    }
    let mut buf = vec![0u8; 4096];
    let n = unsafe { libc::read(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
    if n < 0 {
        return None;
    }
    buf.truncate(n as usize);
    Some(buf)
}

fn close_fd(fd: RawFd) {
    unsafe {
        libc::close(fd);
    }
}

async fn wait_for<F: Fn() -> bool>(what: &str, cond: F) {
    for _ in 0..200 {
        if cond() {
            return;
        }
        sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {}", what);
}

/// Capture-backed builder whose establish hands out a descriptor planted
/// by the test, counting session and teardown calls.
struct EstablishBuilder {
    inner: BuilderCapture,
    next_fd: Arc<Mutex<Option<RawFd>>>,
    new_sessions: Arc<AtomicUsize>,
    teardowns: Arc<AtomicUsize>,
}

impl TunBuilder for EstablishBuilder {
    fn new_session(&mut self) -> bool {
        self.new_sessions.fetch_add(1, Ordering::SeqCst);
        self.inner.new_session()
    }

    fn set_remote_address(&mut self, address: IpAddr) -> bool {
        self.inner.set_remote_address(address)
    }

    fn add_address(&mut self, address: IpAddr, prefix_len: u8) -> bool {
        self.inner.add_address(address, prefix_len)
    }

    fn reroute_gateway(&mut self, server: IpAddr, ipv4: bool, ipv6: bool, flags: RedirectFlags) -> bool {
        self.inner.reroute_gateway(server, ipv4, ipv6, flags)
    }

    fn add_route(&mut self, address: IpAddr, prefix_len: u8) -> bool {
        self.inner.add_route(address, prefix_len)
    }

    fn exclude_route(&mut self, address: IpAddr, prefix_len: u8) -> bool {
        self.inner.exclude_route(address, prefix_len)
    }

    fn add_dns_server(&mut self, address: IpAddr) -> bool {
        self.inner.add_dns_server(address)
    }

    fn add_search_domain(&mut self, domain: &str) -> bool {
        self.inner.add_search_domain(domain)
    }

    fn add_proxy_bypass(&mut self, host: &str) -> bool {
        self.inner.add_proxy_bypass(host)
    }

    fn set_proxy_auto_config_url(&mut self, url: &str) -> bool {
        self.inner.set_proxy_auto_config_url(url)
    }

    fn set_proxy_http(&mut self, host: &str, port: u16) -> bool {
        self.inner.set_proxy_http(host, port)
    }

    fn set_proxy_https(&mut self, host: &str, port: u16) -> bool {
        self.inner.set_proxy_https(host, port)
    }

    fn set_mtu(&mut self, mtu: u16) -> bool {
        self.inner.set_mtu(mtu)
    }

    fn set_session_name(&mut self, name: &str) -> bool {
        self.inner.set_session_name(name)
    }

    fn establish(&mut self) -> Option<RawFd> {
        self.next_fd.lock().unwrap().take()
    }

    fn teardown(&mut self) {
        self.teardowns.fetch_add(1, Ordering::SeqCst);
    }
}

#[derive(Default)]
struct RecordingParent {
    packets: Mutex<Vec<Bytes>>,
    errors: Mutex<Vec<(ErrorKind, String)>>,
    connected: AtomicBool,
}

impl RecordingParent {
    fn packet_count(&self) -> usize {
        self.packets.lock().unwrap().len()
    }
}

impl TunParent for RecordingParent {
    fn tun_recv(&self, packet: Bytes) {
        self.packets.lock().unwrap().push(packet);
    }

    fn tun_error(&self, kind: ErrorKind, detail: &str) {
        self.errors.lock().unwrap().push((kind, detail.to_string()));
    }

    fn tun_connected(&self) {
        self.connected.store(true, Ordering::SeqCst);
    }
}

struct FixedEndpoint(IpAddr);

impl Transport for FixedEndpoint {
    fn server_endpoint_addr(&self) -> IpAddr {
        self.0
    }
}

struct Harness {
    builder: tunclient::SharedBuilder,
    next_fd: Arc<Mutex<Option<RawFd>>>,
    new_sessions: Arc<AtomicUsize>,
    teardowns: Arc<AtomicUsize>,
    transport: Arc<FixedEndpoint>,
}

impl Harness {
    fn new() -> Self {
        let next_fd = Arc::new(Mutex::new(None));
        let new_sessions = Arc::new(AtomicUsize::new(0));
        let teardowns = Arc::new(AtomicUsize::new(0));
        let builder = builder::shared(EstablishBuilder {
            inner: BuilderCapture::new(),
            next_fd: next_fd.clone(),
            new_sessions: new_sessions.clone(),
            teardowns: teardowns.clone(),
        });
        Self {
            builder,
            next_fd,
            new_sessions,
            teardowns,
            transport: Arc::new(FixedEndpoint(IpAddr::V4(Ipv4Addr::new(192, 0, 2, 1)))),
        }
    }

    fn plant_fd(&self, fd: RawFd) {
        *self.next_fd.lock().unwrap() = Some(fd);
    }

    fn client(
        &self,
        opts: ClientOptions,
        persist: Option<Arc<TunPersist>>,
    ) -> (Client, Arc<RecordingParent>) {
        let config = ClientConfig {
            opts,
            stats: Arc::new(SessionStats::new()),
            persist,
            builder: self.builder.clone(),
        };
        let parent = Arc::new(RecordingParent::default());
        (
            Client::new(config, parent.clone(), self.transport.clone()),
            parent,
        )
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn connect_and_exchange_packets() {
    let harness = Harness::new();
    let (fd, peer) = dgram_pair();
    harness.plant_fd(fd);

    let (mut client, parent) = harness.client(ClientOptions::default(), None);
    client.start(&DirectiveList::parse(PUSHED)).await;

    assert!(client.is_connected());
    assert!(parent.connected.load(Ordering::SeqCst));
    assert!(parent.errors.lock().unwrap().is_empty());
    assert_eq!(client.vpn_ip4(), Some(Ipv4Addr::new(10, 8, 0, 2)));
    assert_eq!(client.vpn_ip6(), None);
    assert_eq!(client.tun_name(), "tun");
    assert_eq!(harness.new_sessions.load(Ordering::SeqCst), 1);

    // inbound: peer writes, parent receives
    peer_send(peer, b"inbound-packet");
    wait_for("inbound packet delivery", || parent.packet_count() == 1).await;
    assert_eq!(&parent.packets.lock().unwrap()[0][..], b"inbound-packet");
    assert_eq!(client.stats().tun_packets_in(), 1);
    assert_eq!(client.stats().tun_bytes_in(), 14);

    // outbound: client writes, peer receives
    assert!(client.send(b"outbound-packet"));
    assert_eq!(peer_recv(peer).expect("outbound packet"), b"outbound-packet");
    assert_eq!(client.stats().tun_packets_out(), 1);

    client.stop();
    assert!(!client.is_connected());
    assert!(!client.send(b"late"));
    // no persistence, so stop tears the builder session down
    assert_eq!(harness.teardowns.load(Ordering::SeqCst), 1);

    close_fd(peer);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn framed_descriptor_strips_and_prepends() {
    let harness = Harness::new();
    let (fd, peer) = dgram_pair();
    harness.plant_fd(fd);

    let opts = ClientOptions {
        tun_prefix: true,
        ..ClientOptions::default()
    };
    let (mut client, parent) = harness.client(opts, None);
    client.start(&DirectiveList::parse(PUSHED)).await;
    assert!(client.is_connected());

    // inbound frame carries the address-family prefix, parent sees payload only
    let mut frame = (libc::AF_INET as u32).to_be_bytes().to_vec();
    frame.extend_from_slice(&[0x45, 0xaa, 0xbb]);
    peer_send(peer, &frame);
    wait_for("framed packet delivery", || parent.packet_count() == 1).await;
    assert_eq!(&parent.packets.lock().unwrap()[0][..], &[0x45, 0xaa, 0xbb]);

    // outbound packet gains a prefix derived from the version nibble
    assert!(client.send(&[0x60, 0x01]));
    let out = peer_recv(peer).expect("framed outbound packet");
    assert_eq!(&out[..4], (libc::AF_INET6 as u32).to_be_bytes());
    assert_eq!(&out[4..], &[0x60, 0x01]);

    // unknown version nibble is refused before any bytes hit the wire
    assert!(!client.send(&[0x00, 0x01]));
    assert_eq!(client.stats().error_count(ErrorKind::TunFramingError), 1);

    client.stop();
    close_fd(peer);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn establish_failure_then_successful_retry() {
    let harness = Harness::new();
    // no descriptor planted: establish fails on the first attempt
    let (mut client, parent) = harness.client(ClientOptions::default(), None);
    client.start(&DirectiveList::parse(PUSHED)).await;

    assert!(!client.is_connected());
    {
        let errors = parent.errors.lock().unwrap();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].0, ErrorKind::TunIfaceCreate);
    }

    // same client retries once a descriptor is available
    let (fd, peer) = dgram_pair();
    harness.plant_fd(fd);
    client.start(&DirectiveList::parse(PUSHED)).await;

    assert!(client.is_connected());
    assert!(parent.connected.load(Ordering::SeqCst));
    assert_eq!(parent.errors.lock().unwrap().len(), 1);
    assert_eq!(client.vpn_ip4(), Some(Ipv4Addr::new(10, 8, 0, 2)));

    peer_send(peer, b"after-retry");
    wait_for("packet after retry", || parent.packet_count() == 1).await;

    client.stop();
    close_fd(peer);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn stopping_unstarted_client_leaves_builder_alone() {
    let harness = Harness::new();
    let (mut client, parent) = harness.client(ClientOptions::default(), None);
    client.stop();
    drop(client);

    assert!(parent.errors.lock().unwrap().is_empty());
    assert_eq!(harness.teardowns.load(Ordering::SeqCst), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn reconnect_reuses_persisted_descriptor() {
    let harness = Harness::new();
    let persist = Arc::new(TunPersist::new(false, Some(harness.builder.clone())));
    let (fd, peer) = dgram_pair();
    harness.plant_fd(fd);

    let (mut first, parent1) = harness.client(ClientOptions::default(), Some(persist.clone()));
    first.start(&DirectiveList::parse(PUSHED)).await;
    assert!(first.is_connected());
    assert!(parent1.errors.lock().unwrap().is_empty());
    assert_eq!(harness.new_sessions.load(Ordering::SeqCst), 1);
    assert!(persist.defined());
    assert_eq!(persist.fd(), fd);

    first.stop();
    drop(first);
    // persisted session survives the client
    assert!(persist.defined());
    assert_eq!(harness.teardowns.load(Ordering::SeqCst), 0);

    // identical pushed configuration: reuse without a fresh builder session
    let (mut second, parent2) = harness.client(ClientOptions::default(), Some(persist.clone()));
    second.start(&DirectiveList::parse(PUSHED)).await;
    assert!(second.is_connected());
    assert!(parent2.errors.lock().unwrap().is_empty());
    assert_eq!(harness.new_sessions.load(Ordering::SeqCst), 1);
    assert_eq!(second.vpn_ip4(), Some(Ipv4Addr::new(10, 8, 0, 2)));

    // the reused descriptor still moves packets
    peer_send(peer, b"after-reuse");
    wait_for("packet after reuse", || parent2.packet_count() == 1).await;

    second.stop();
    drop(second);
    persist.close();
    assert_eq!(harness.teardowns.load(Ordering::SeqCst), 1);
    assert!(!persist.defined());

    close_fd(peer);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn changed_configuration_rebuilds() {
    let harness = Harness::new();
    let persist = Arc::new(TunPersist::new(false, Some(harness.builder.clone())));
    let (fd_a, peer_a) = dgram_pair();
    harness.plant_fd(fd_a);

    let (mut first, _parent1) = harness.client(ClientOptions::default(), Some(persist.clone()));
    first.start(&DirectiveList::parse(PUSHED)).await;
    assert!(first.is_connected());
    first.stop();
    drop(first);

    // different pushed routes: fingerprint mismatch forces a rebuild
    let (fd_b, peer_b) = dgram_pair();
    harness.plant_fd(fd_b);
    let changed = format!("{}route 10.9.0.0 255.255.255.0\n", PUSHED);
    let (mut second, parent2) = harness.client(ClientOptions::default(), Some(persist.clone()));
    second.start(&DirectiveList::parse(&changed)).await;

    assert!(second.is_connected());
    assert!(parent2.errors.lock().unwrap().is_empty());
    assert_eq!(harness.new_sessions.load(Ordering::SeqCst), 2);
    assert_eq!(persist.fd(), fd_b);

    second.stop();
    drop(second);
    persist.close();

    close_fd(peer_a);
    close_fd(peer_b);
}
