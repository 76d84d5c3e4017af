//! Client-side tunnel subsystem for a VPN client.
//!
//! Turns server-pushed configuration directives into a configured tunnel
//! interface via an abstract platform builder, optionally reuses an
//! established descriptor across reconnects, and moves IP packets between
//! the descriptor and the embedding session.

pub mod addr;
pub mod builder;
pub mod client;
pub mod configurator;
pub mod directive;
pub mod error;
pub mod io;
pub mod persist;
pub mod redirect;
pub mod stats;

// Re-export main types
pub use builder::{BuilderCapture, SharedBuilder, TunBuilder};
pub use client::{Client, ClientConfig, ClientOptions, ClientState, Transport, TunParent};
pub use configurator::{configure_builder, IpVer};
pub use directive::{Directive, DirectiveList};
pub use error::{Error, ErrorKind, Result};
pub use io::TunIo;
pub use persist::TunPersist;
pub use redirect::RedirectFlags;
pub use stats::SessionStats;
