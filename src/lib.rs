//! Qanat: a TCP/UDP/Unix-domain connection conduit
//!
//! Qanat connects outward to one or more ports on a remote host, or listens
//! for an inbound connection, and then relays bytes between that connection
//! and the local standard streams until one side closes. It covers the
//! classic netcat feature set: port scanning over ranges, UDP mode,
//! Unix-domain sockets, telnet option auto-refusal, CRLF rewriting and
//! SOCKS4/SOCKS5/HTTP-CONNECT proxying.
//!
//! ## Quick Start
//!
//! ### As a Command-Line Tool
//!
//! ```bash
//! # Connect to a remote service
//! qanat example.com 80
//!
//! # Listen for one inbound connection
//! qanat -l 8080
//!
//! # Scan a port range
//! qanat -vz example.com 20-30
//! ```
//!
//! ### As a Library
//!
//! ```rust,no_run
//! use qanat::relay::{RelayEngine, RelaySettings};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut stream = tokio::net::TcpStream::connect("127.0.0.1:4444").await?;
//!     let engine = RelayEngine::new(RelaySettings::default());
//!     let mut stdin = tokio::io::stdin();
//!     let mut stdout = tokio::io::stdout();
//!     engine.run(&mut stream, &mut stdin, &mut stdout).await;
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────┐    ┌─────────────────────┐    ┌─────────────┐
//! │ PortList   │───▶│ ConnectionEstablish │───▶│ RelayEngine │
//! │ (ports.rs) │    │ (establish.rs)      │    │ (relay.rs)  │
//! └────────────┘    └─────────────────────┘    └─────────────┘
//!                            │                        │
//!                     AddressResolver          stdin / stdout
//!                     ProxyConnector
//! ```

pub mod config;
pub mod establish;
pub mod ports;
pub mod proxy;
pub mod relay;
pub mod resolver;
pub mod telnet;

pub use config::{Config, Family, Mode, SockOpts, SocketKind};
pub use establish::{Listener, LocalBind, NetConn};
pub use proxy::ProxyProtocol;
pub use relay::{RelayEngine, RelaySettings, SessionEnd};

/// Qanat error types
#[derive(Debug, thiserror::Error)]
pub enum QanatError {
    /// Malformed or out-of-range port specification
    #[error("invalid port specification: {0}")]
    InvalidPortSpec(String),

    /// Name resolution produced no usable address
    #[error("name resolution failed: {0}")]
    ResolutionFailed(String),

    /// Binding the local address or port failed (fatal, no fallback)
    #[error("bind failed: {0}")]
    BindFailed(#[source] std::io::Error),

    /// All candidate addresses were tried without success
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    /// The connect attempt did not finish within the configured timeout
    #[error("connection timed out")]
    ConnectionTimeout,

    /// Unix-domain socket path exceeds the platform sockaddr limit
    #[error("unix socket path too long: {0}")]
    PathTooLong(String),

    /// An explicitly requested socket option was rejected by the platform
    #[error("socket option {0} not supported: {1}")]
    UnsupportedSocketOption(&'static str, #[source] std::io::Error),

    /// Conflicting or malformed command-line configuration
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// I/O error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = QanatError::InvalidPortSpec("80abc".to_string());
        assert_eq!(err.to_string(), "invalid port specification: 80abc");

        let err = QanatError::ConnectionTimeout;
        assert_eq!(err.to_string(), "connection timed out");
    }

    #[test]
    fn test_io_error_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe");
        let err: QanatError = io.into();
        assert!(matches!(err, QanatError::Io(_)));
    }
}
