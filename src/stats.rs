//! Session statistics shared across the tunnel data path.
//!
//! Counters are plain relaxed atomics so the packet path never takes a
//! lock. One instance is shared by `Arc` between the client, the packet
//! engine and whoever wants to report totals.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::ErrorKind;

/// Byte/packet counters plus per-class error counts for one tunnel session.
#[derive(Debug, Default)]
pub struct SessionStats {
    tun_bytes_in: AtomicU64,
    tun_bytes_out: AtomicU64,
    tun_packets_in: AtomicU64,
    tun_packets_out: AtomicU64,
    errors: [AtomicU64; ErrorKind::COUNT],
}

impl SessionStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one inbound packet of `bytes` length (pre-framing size).
    pub fn add_tun_in(&self, bytes: u64) {
        self.tun_bytes_in.fetch_add(bytes, Ordering::Relaxed);
        self.tun_packets_in.fetch_add(1, Ordering::Relaxed);
    }

    /// Record one outbound packet of `bytes` length (framed size as written).
    pub fn add_tun_out(&self, bytes: u64) {
        self.tun_bytes_out.fetch_add(bytes, Ordering::Relaxed);
        self.tun_packets_out.fetch_add(1, Ordering::Relaxed);
    }

    /// Count an error occurrence of the given class.
    pub fn error(&self, kind: ErrorKind) {
        self.errors[kind as usize].fetch_add(1, Ordering::Relaxed);
    }

    pub fn tun_bytes_in(&self) -> u64 {
        self.tun_bytes_in.load(Ordering::Relaxed)
    }

    pub fn tun_bytes_out(&self) -> u64 {
        self.tun_bytes_out.load(Ordering::Relaxed)
    }

    pub fn tun_packets_in(&self) -> u64 {
        self.tun_packets_in.load(Ordering::Relaxed)
    }

    pub fn tun_packets_out(&self) -> u64 {
        self.tun_packets_out.load(Ordering::Relaxed)
    }

    pub fn error_count(&self, kind: ErrorKind) -> u64 {
        self.errors[kind as usize].load(Ordering::Relaxed)
    }

    /// One-line totals for sign-off logging.
    pub fn summary(&self) -> String {
        let mut s = format!(
            "in {} pkt / {} B, out {} pkt / {} B",
            self.tun_packets_in(),
            self.tun_bytes_in(),
            self.tun_packets_out(),
            self.tun_bytes_out()
        );
        for kind in [
            ErrorKind::TunReadError,
            ErrorKind::TunWriteError,
            ErrorKind::TunFramingError,
            ErrorKind::TunIfaceCreate,
            ErrorKind::TunSetupFailed,
            ErrorKind::RerouteGwNoDns,
        ] {
            let n = self.error_count(kind);
            if n > 0 {
                s.push_str(&format!(", {}={}", kind, n));
            }
        }
        s
    }
}
