//! Error types for the tunnel client.

use thiserror::Error;

/// Result type alias using our Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the tunnel client.
#[derive(Error, Debug)]
pub enum Error {
    /// Malformed pushed directive (missing argument, over-long token, bad arity)
    #[error("directive format error: {0}")]
    DirectiveFormat(String),

    /// The tunnel builder rejected a configuration call
    #[error("tun builder error: {0}")]
    Builder(String),

    /// Route directive could not be applied
    #[error("route error: {0}")]
    Route(String),

    /// dhcp-option directive could not be applied
    #[error("dhcp-option error: {0}")]
    DhcpOption(String),

    /// Address or netmask failed to parse or validate
    #[error("address error: {0}")]
    Addr(String),

    /// Tunnel interface could not be created or driven
    #[error("tun interface error: {0}")]
    Iface(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),
}

impl Error {
    /// Create a new directive format error.
    pub fn format<S: Into<String>>(msg: S) -> Self {
        Self::DirectiveFormat(msg.into())
    }

    /// Create a new tun builder rejection error.
    pub fn builder<S: Into<String>>(msg: S) -> Self {
        Self::Builder(msg.into())
    }

    /// Create a new route error.
    pub fn route<S: Into<String>>(msg: S) -> Self {
        Self::Route(msg.into())
    }

    /// Create a new dhcp-option error.
    pub fn dhcp_option<S: Into<String>>(msg: S) -> Self {
        Self::DhcpOption(msg.into())
    }

    /// Create a new address error.
    pub fn addr<S: Into<String>>(msg: S) -> Self {
        Self::Addr(msg.into())
    }

    /// Create a new tun interface error.
    pub fn iface<S: Into<String>>(msg: S) -> Self {
        Self::Iface(msg.into())
    }

    /// Create a new configuration error.
    pub fn config<S: Into<String>>(msg: S) -> Self {
        Self::Config(msg.into())
    }
}

/// Error classes counted in session statistics and reported to the parent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(usize)]
pub enum ErrorKind {
    /// Inbound read failed or delivered an unusable frame
    TunReadError = 0,
    /// Outbound write failed or was short
    TunWriteError = 1,
    /// Address-family prefix could not be derived or parsed
    TunFramingError = 2,
    /// The platform builder could not produce a tunnel descriptor
    TunIfaceCreate = 3,
    /// Tunnel session setup failed after it had started
    TunSetupFailed = 4,
    /// Gateway redirected with no pushed DNS and fallback disabled
    RerouteGwNoDns = 5,
}

impl ErrorKind {
    /// Number of error classes, for stats table sizing.
    pub const COUNT: usize = 6;

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::TunReadError => "TUN_READ_ERROR",
            Self::TunWriteError => "TUN_WRITE_ERROR",
            Self::TunFramingError => "TUN_FRAMING_ERROR",
            Self::TunIfaceCreate => "TUN_IFACE_CREATE",
            Self::TunSetupFailed => "TUN_SETUP_FAILED",
            Self::RerouteGwNoDns => "REROUTE_GW_NO_DNS",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::format("route: missing argument 1");
        assert_eq!(
            err.to_string(),
            "directive format error: route: missing argument 1"
        );
        let err = Error::builder("add_address rejected");
        assert!(err.to_string().contains("tun builder error"));
    }

    #[test]
    fn test_error_kind_names() {
        assert_eq!(ErrorKind::TunReadError.to_string(), "TUN_READ_ERROR");
        assert_eq!(ErrorKind::RerouteGwNoDns.as_str(), "REROUTE_GW_NO_DNS");
    }

    #[test]
    fn test_io_error_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::Other, "boom");
        let err: Error = io.into();
        assert!(matches!(err, Error::Io(_)));
    }
}
