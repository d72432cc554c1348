//! Runtime configuration
//!
//! All command-line flags are folded into one immutable [`Config`] at
//! startup; every component takes it (or a slice of it) by reference and
//! nothing mutates it afterwards.

use std::path::PathBuf;
use std::time::Duration;

use crate::proxy::ProxyProtocol;
use crate::QanatError;

/// Operating mode, decided once from the flag set
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Connect outward to each port in the port list
    Connect,
    /// Bind locally and serve inbound peers one at a time
    Listen,
    /// Establish connections only, never relay (port scanning)
    ScanOnly,
}

/// Address family selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Family {
    #[default]
    Unspecified,
    Ipv4,
    Ipv6,
    Unix,
}

/// Transport selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SocketKind {
    #[default]
    Stream,
    Datagram,
}

impl SocketKind {
    /// Protocol name as used by the services database and diagnostics.
    pub fn proto_name(self) -> &'static str {
        match self {
            SocketKind::Stream => "tcp",
            SocketKind::Datagram => "udp",
        }
    }
}

/// Socket options applied to every socket we create
#[derive(Debug, Clone, Copy, Default)]
pub struct SockOpts {
    /// SO_DEBUG
    pub debug: bool,
    /// TCP MD5 signature option
    pub md5sig: bool,
    /// IP Type-of-Service byte
    pub tos: Option<u8>,
}

/// Proxy descriptor built from `-X`/`-x`/`-P`
#[derive(Debug, Clone)]
pub struct ProxySpec {
    pub protocol: ProxyProtocol,
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
}

/// Immutable runtime configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub mode: Mode,
    pub family: Family,
    pub kind: SocketKind,

    /// Remote host for connect mode, optional bind host for listen mode
    pub host: Option<String>,
    /// Port or port-range specification (absent in Unix-domain mode)
    pub port_spec: Option<String>,
    /// Socket path in Unix-domain mode
    pub unix_path: Option<PathBuf>,

    /// Local source address for outbound connects (`-s`)
    pub source_addr: Option<String>,
    /// Local source port for outbound connects (`-p`)
    pub source_port: Option<String>,

    /// Serve more than one inbound connection (`-k`)
    pub keep_open: bool,
    /// Numeric-only resolution (`-n`)
    pub numeric: bool,
    /// Shuffle expanded port ranges (`-r`)
    pub randomize: bool,
    /// Report binds, listens, accepts and connects (`-v`)
    pub verbose: bool,
    /// Never poll stdin (`-d`)
    pub detach_stdin: bool,
    /// Rewrite a trailing LF to CRLF on transmit (`-C`)
    pub crlf: bool,
    /// Answer telnet option negotiation (`-t`)
    pub telnet: bool,
    /// Larger relay chunks (`-j`)
    pub jumbo: bool,

    /// Inter-iteration pacing sleep (`-i`)
    pub interval: Option<Duration>,
    /// Connect and idle timeout (`-w`)
    pub timeout: Option<Duration>,
    /// Post-EOF linger before a successful quit (`-q`)
    pub linger: Option<Duration>,

    pub sockopts: SockOpts,
    pub proxy: Option<ProxySpec>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            mode: Mode::Connect,
            family: Family::Unspecified,
            kind: SocketKind::Stream,
            host: None,
            port_spec: None,
            unix_path: None,
            source_addr: None,
            source_port: None,
            keep_open: false,
            numeric: false,
            randomize: false,
            verbose: false,
            detach_stdin: false,
            crlf: false,
            telnet: false,
            jumbo: false,
            interval: None,
            timeout: None,
            linger: None,
            sockopts: SockOpts::default(),
            proxy: None,
        }
    }
}

/// IP ToS keyword values
const IPTOS_LOWDELAY: u8 = 0x10;
const IPTOS_THROUGHPUT: u8 = 0x08;
const IPTOS_RELIABILITY: u8 = 0x04;

/// Parse an IP Type-of-Service argument: a well-known keyword or a
/// literal `0xNN` byte.
pub fn parse_iptos(s: &str) -> Result<u8, QanatError> {
    match s {
        "lowdelay" => return Ok(IPTOS_LOWDELAY),
        "throughput" => return Ok(IPTOS_THROUGHPUT),
        "reliability" => return Ok(IPTOS_RELIABILITY),
        _ => {}
    }
    let hex = s
        .strip_prefix("0x")
        .or_else(|| s.strip_prefix("0X"))
        .ok_or_else(|| QanatError::InvalidConfig(format!("invalid IP Type of Service: {s}")))?;
    u8::from_str_radix(hex, 16)
        .map_err(|_| QanatError::InvalidConfig(format!("invalid IP Type of Service: {s}")))
}
