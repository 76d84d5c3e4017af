//! Session persistence for the tunnel descriptor.
//!
//! Reconnects that would rebuild an identical tunnel reuse the existing
//! descriptor instead, so the interface never flaps. Identity is the
//! canonical capture rendering of the would-be configuration: byte-equal
//! rendering means the descriptor can be reused as-is.

use std::os::unix::io::RawFd;
use std::sync::Mutex;

use tracing::debug;

use crate::builder::{self, SharedBuilder};
use crate::client::ClientState;

/// A raw descriptor with explicit ownership-transfer semantics.
///
/// `reset` closes what it replaces, `replace` does not (for descriptors
/// owned elsewhere), `release` hands ownership out. Closes on drop.
#[derive(Debug)]
pub struct TunFd {
    fd: RawFd,
}

impl TunFd {
    pub const UNDEFINED: RawFd = -1;

    pub fn new() -> Self {
        Self {
            fd: Self::UNDEFINED,
        }
    }

    pub fn defined(&self) -> bool {
        self.fd >= 0
    }

    pub fn get(&self) -> RawFd {
        self.fd
    }

    /// Install a descriptor, closing any previous one.
    pub fn reset(&mut self, fd: RawFd) {
        self.close();
        self.fd = fd;
    }

    /// Install a descriptor without closing the previous one.
    pub fn replace(&mut self, fd: RawFd) {
        self.fd = fd;
    }

    /// Give up ownership without closing.
    pub fn release(&mut self) -> RawFd {
        std::mem::replace(&mut self.fd, Self::UNDEFINED)
    }

    pub fn close(&mut self) {
        if self.defined() {
            unsafe {
                libc::close(self.fd);
            }
            self.fd = Self::UNDEFINED;
        }
    }
}

impl Default for TunFd {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for TunFd {
    fn drop(&mut self) {
        self.close();
    }
}

#[derive(Default)]
struct PersistInner {
    fd: TunFd,
    state: ClientState,
    fingerprint: String,
}

/// Holds a tunnel descriptor, its negotiated addresses and the
/// configuration fingerprint across client restarts.
///
/// With `retain_fd` the descriptor belongs to an outer layer and is only
/// tracked here (released, never closed); otherwise this owns it.
pub struct TunPersist {
    retain_fd: bool,
    builder: Option<SharedBuilder>,
    inner: Mutex<PersistInner>,
}

impl TunPersist {
    pub fn new(retain_fd: bool, builder: Option<SharedBuilder>) -> Self {
        Self {
            retain_fd,
            builder,
            inner: Mutex::new(PersistInner::default()),
        }
    }

    /// Whether a descriptor is currently held.
    pub fn defined(&self) -> bool {
        self.lock().fd.defined()
    }

    /// A held session matches when its fingerprint is non-empty and
    /// byte-equal to the candidate.
    pub fn matches(&self, fingerprint: &str) -> bool {
        let inner = self.lock();
        !inner.fingerprint.is_empty() && inner.fingerprint == fingerprint
    }

    /// Store a fresh session. Any previously held descriptor is closed
    /// (owned mode) or silently dropped (retained mode).
    pub fn persist(&self, fd: RawFd, state: &ClientState, fingerprint: &str) {
        let mut inner = self.lock();
        if self.retain_fd {
            inner.fd.replace(fd);
        } else {
            inner.fd.reset(fd);
        }
        inner.state = state.clone();
        inner.fingerprint = fingerprint.to_string();
        debug!(retain = self.retain_fd, "tun context persisted");
    }

    pub fn fd(&self) -> RawFd {
        self.lock().fd.get()
    }

    pub fn state(&self) -> ClientState {
        self.lock().state.clone()
    }

    pub fn fingerprint(&self) -> String {
        self.lock().fingerprint.clone()
    }

    /// Tear down the held session: builder teardown hook, then close or
    /// release the descriptor, then clear. Safe to call repeatedly.
    pub fn close(&self) {
        if let Some(b) = &self.builder {
            builder::lock(b).teardown();
        }
        let mut inner = self.lock();
        let had = inner.fd.defined();
        if self.retain_fd {
            inner.fd.release();
        } else {
            inner.fd.close();
        }
        inner.state = ClientState::default();
        inner.fingerprint.clear();
        if had {
            debug!("tun context closed");
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, PersistInner> {
        self.inner.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

impl Drop for TunPersist {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::{shared, TunBuilder};
    use crate::redirect::RedirectFlags;
    use std::net::{IpAddr, Ipv4Addr};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    fn pipe_fds() -> (RawFd, RawFd) {
        let mut fds = [0; 2];
        let r = unsafe { libc::pipe(fds.as_mut_ptr()) };
        assert_eq!(r, 0);
        (fds[0], fds[1])
    }

    fn fd_alive(fd: RawFd) -> bool {
        unsafe { libc::fcntl(fd, libc::F_GETFD) != -1 }
    }

    fn close_fd(fd: RawFd) {
        unsafe {
            libc::close(fd);
        }
    }

    // ======================== TunFd ========================

    #[test]
    fn test_tunfd_reset_closes_previous() {
        let (a, b) = pipe_fds();
        let mut fd = TunFd::new();
        assert!(!fd.defined());
        fd.reset(a);
        assert!(fd.defined());
        fd.reset(b);
        assert!(!fd_alive(a));
        assert!(fd_alive(b));
        fd.close();
        assert!(!fd_alive(b));
        assert!(!fd.defined());
    }

    #[test]
    fn test_tunfd_replace_leaves_previous_open() {
        let (a, b) = pipe_fds();
        let mut fd = TunFd::new();
        fd.replace(a);
        fd.replace(b);
        assert!(fd_alive(a));
        close_fd(a);
        fd.close();
    }

    #[test]
    fn test_tunfd_release_does_not_close() {
        let (a, b) = pipe_fds();
        let mut fd = TunFd::new();
        fd.reset(a);
        let out = fd.release();
        assert_eq!(out, a);
        assert!(!fd.defined());
        assert!(fd_alive(a));
        close_fd(a);
        close_fd(b);
    }

    #[test]
    fn test_tunfd_drop_closes() {
        let (a, b) = pipe_fds();
        {
            let mut fd = TunFd::new();
            fd.reset(a);
        }
        assert!(!fd_alive(a));
        close_fd(b);
    }

    // ======================== TunPersist ========================

    fn state_with_ip() -> ClientState {
        ClientState {
            vpn_ip4: Some(Ipv4Addr::new(10, 8, 0, 2)),
            vpn_ip6: None,
        }
    }

    #[test]
    fn test_empty_fingerprint_never_matches() {
        let persist = TunPersist::new(false, None);
        assert!(!persist.matches(""));
        assert!(!persist.matches("anything"));
        assert!(!persist.defined());
    }

    #[test]
    fn test_persist_then_match_and_reuse() {
        let (a, b) = pipe_fds();
        let persist = TunPersist::new(false, None);
        persist.persist(a, &state_with_ip(), "fingerprint-a");
        assert!(persist.defined());
        assert!(persist.matches("fingerprint-a"));
        assert!(!persist.matches("fingerprint-b"));
        assert_eq!(persist.fd(), a);
        assert_eq!(persist.state().vpn_ip4, Some(Ipv4Addr::new(10, 8, 0, 2)));
        persist.close();
        assert!(!persist.defined());
        assert!(!fd_alive(a));
        close_fd(b);
    }

    #[test]
    fn test_owned_repersist_closes_old_fd() {
        let (a, b) = pipe_fds();
        let persist = TunPersist::new(false, None);
        persist.persist(a, &state_with_ip(), "one");
        persist.persist(b, &state_with_ip(), "two");
        assert!(!fd_alive(a));
        assert!(fd_alive(b));
        assert!(persist.matches("two"));
    }

    #[test]
    fn test_retained_mode_never_closes() {
        let (a, b) = pipe_fds();
        let persist = TunPersist::new(true, None);
        persist.persist(a, &state_with_ip(), "one");
        persist.persist(b, &state_with_ip(), "two");
        assert!(fd_alive(a));
        persist.close();
        assert!(fd_alive(b));
        assert!(!persist.defined());
        close_fd(a);
        close_fd(b);
    }

    #[test]
    fn test_close_is_idempotent() {
        let (a, b) = pipe_fds();
        let persist = TunPersist::new(false, None);
        persist.persist(a, &state_with_ip(), "fp");
        persist.close();
        persist.close();
        assert!(!persist.defined());
        assert!(persist.fingerprint().is_empty());
        close_fd(b);
    }

    #[test]
    fn test_drop_closes_owned_fd() {
        let (a, b) = pipe_fds();
        {
            let persist = TunPersist::new(false, None);
            persist.persist(a, &state_with_ip(), "fp");
        }
        assert!(!fd_alive(a));
        close_fd(b);
    }

    // ======================== builder teardown hook ========================

    struct Probe(Arc<AtomicBool>);

    impl TunBuilder for Probe {
        fn new_session(&mut self) -> bool {
            true
        }
        fn set_remote_address(&mut self, _: IpAddr) -> bool {
            true
        }
        fn add_address(&mut self, _: IpAddr, _: u8) -> bool {
            true
        }
        fn reroute_gateway(&mut self, _: IpAddr, _: bool, _: bool, _: RedirectFlags) -> bool {
            true
        }
        fn add_route(&mut self, _: IpAddr, _: u8) -> bool {
            true
        }
        fn exclude_route(&mut self, _: IpAddr, _: u8) -> bool {
            true
        }
        fn add_dns_server(&mut self, _: IpAddr) -> bool {
            true
        }
        fn add_search_domain(&mut self, _: &str) -> bool {
            true
        }
        fn add_proxy_bypass(&mut self, _: &str) -> bool {
            true
        }
        fn set_proxy_auto_config_url(&mut self, _: &str) -> bool {
            true
        }
        fn set_proxy_http(&mut self, _: &str, _: u16) -> bool {
            true
        }
        fn set_proxy_https(&mut self, _: &str, _: u16) -> bool {
            true
        }
        fn set_mtu(&mut self, _: u16) -> bool {
            true
        }
        fn set_session_name(&mut self, _: &str) -> bool {
            true
        }
        fn teardown(&mut self) {
            self.0.store(true, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_close_invokes_builder_teardown() {
        let torn = Arc::new(AtomicBool::new(false));
        let persist = TunPersist::new(false, Some(shared(Probe(torn.clone()))));
        let (a, b) = pipe_fds();
        persist.persist(a, &state_with_ip(), "fp");
        persist.close();
        assert!(torn.load(Ordering::SeqCst));
        close_fd(b);
    }
}
