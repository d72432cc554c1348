//! Connection establishment
//!
//! Walks the resolver's candidate list opening sockets, binding a local
//! source address when asked, applying socket options and attempting a
//! timeout-bounded connect. Per-candidate failures (socket creation,
//! refusal, timeout) advance to the next candidate; bind failures and
//! rejected explicitly-requested socket options abort the whole attempt.
//! Also owns listen-mode setup for TCP, UDP and Unix-domain sockets.

use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::os::fd::AsRawFd;
use std::os::unix::ffi::OsStrExt;
use std::path::Path;
use std::time::Duration;

use log::{debug, warn};
use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use tokio::net::{TcpListener, TcpSocket, TcpStream, UdpSocket, UnixListener, UnixStream};

use crate::config::{SockOpts, SocketKind};
use crate::QanatError;

/// Seconds to keep probing a UDP port when no timeout is configured
const UDP_SCAN_TIMEOUT: u64 = 3;

/// An established connection, one live socket
#[derive(Debug)]
pub enum NetConn {
    Tcp(TcpStream),
    Udp(UdpSocket),
    Unix(UnixStream),
}

/// A bound listen-mode socket
pub enum Listener {
    Tcp(TcpListener),
    /// Datagram sockets do not listen; the caller latches onto the
    /// first sender with [`udp_latch`].
    Udp(UdpSocket),
}

/// Local source address and/or port for outbound connects
#[derive(Debug, Clone, Copy)]
pub struct LocalBind {
    pub ip: Option<IpAddr>,
    pub port: u16,
}

impl LocalBind {
    fn addr_for(&self, peer: &SocketAddr) -> Result<SocketAddr, QanatError> {
        match self.ip {
            Some(ip) => {
                if ip.is_ipv4() != peer.is_ipv4() {
                    return Err(QanatError::BindFailed(io::Error::new(
                        io::ErrorKind::InvalidInput,
                        "source address family does not match destination",
                    )));
                }
                Ok(SocketAddr::new(ip, self.port))
            }
            None => {
                let wildcard: IpAddr = if peer.is_ipv4() {
                    Ipv4Addr::UNSPECIFIED.into()
                } else {
                    Ipv6Addr::UNSPECIFIED.into()
                };
                Ok(SocketAddr::new(wildcard, self.port))
            }
        }
    }
}

/// Connect to the first reachable candidate address.
///
/// Candidates are tried in resolver order. Socket-creation failures skip
/// to the next candidate; a refused or timed-out connect closes the
/// socket and does the same. Only when every candidate has been tried is
/// the last failure returned, timeout distinguished from refusal purely
/// for diagnostics.
pub async fn remote_connect(
    candidates: &[SocketAddr],
    kind: SocketKind,
    local: Option<LocalBind>,
    timeout: Option<Duration>,
    opts: &SockOpts,
) -> Result<NetConn, QanatError> {
    let mut last_failure: Option<QanatError> = None;

    for addr in candidates {
        let socket = match new_socket(Domain::for_address(*addr), kind) {
            Ok(s) => s,
            Err(e) => {
                debug!("socket for {addr}: {e}");
                continue;
            }
        };

        if let Some(bind) = &local {
            let bind_addr = bind.addr_for(addr)?;
            socket
                .bind(&bind_addr.into())
                .map_err(QanatError::BindFailed)?;
        }

        apply_sockopts(&socket, opts)?;

        match kind {
            SocketKind::Stream => {
                let tcp = TcpSocket::from_std_stream(socket.into());
                match connect_with_timeout(tcp, *addr, timeout).await {
                    Ok(stream) => return Ok(NetConn::Tcp(stream)),
                    Err(QanatError::ConnectionTimeout) => {
                        warn!("connect to {addr} (tcp) timed out");
                        last_failure = Some(QanatError::ConnectionTimeout);
                    }
                    Err(e) => {
                        warn!("connect to {addr} (tcp) failed: {e}");
                        last_failure = Some(e);
                    }
                }
            }
            SocketKind::Datagram => {
                // Connecting a datagram socket only sets the peer; it
                // cannot block and says nothing about reachability.
                if let Err(e) = socket.connect(&SockAddr::from(*addr)) {
                    warn!("connect to {addr} (udp) failed: {e}");
                    last_failure = Some(QanatError::ConnectionFailed(e.to_string()));
                    continue;
                }
                let udp = UdpSocket::from_std(socket.into())?;
                return Ok(NetConn::Udp(udp));
            }
        }
    }

    Err(last_failure
        .unwrap_or_else(|| QanatError::ConnectionFailed("no usable candidate address".to_string())))
}

async fn connect_with_timeout(
    socket: TcpSocket,
    addr: SocketAddr,
    limit: Option<Duration>,
) -> Result<TcpStream, QanatError> {
    // tokio performs the non-blocking connect dance for us: write
    // readiness, SO_ERROR check, EINTR retries.
    deadline_bounded(socket.connect(addr), limit).await
}

/// Bound a connect attempt by the configured deadline, keeping an
/// elapsed deadline distinct from an outright connect failure.
async fn deadline_bounded<T>(
    attempt: impl std::future::Future<Output = io::Result<T>>,
    limit: Option<Duration>,
) -> Result<T, QanatError> {
    match limit {
        Some(limit) => match tokio::time::timeout(limit, attempt).await {
            Ok(Ok(v)) => Ok(v),
            Ok(Err(e)) => Err(QanatError::ConnectionFailed(e.to_string())),
            Err(_) => Err(QanatError::ConnectionTimeout),
        },
        None => attempt
            .await
            .map_err(|e| QanatError::ConnectionFailed(e.to_string())),
    }
}

/// Bind a listening socket on the first bindable candidate.
///
/// Address reuse is always enabled, port reuse where the platform has
/// it. Stream sockets listen with a backlog of 1: this tool serves one
/// peer at a time.
pub fn local_listen(
    candidates: &[SocketAddr],
    kind: SocketKind,
    opts: &SockOpts,
) -> Result<Listener, QanatError> {
    let mut last_err: Option<io::Error> = None;

    for addr in candidates {
        let socket = match new_socket(Domain::for_address(*addr), kind) {
            Ok(s) => s,
            Err(e) => {
                debug!("socket for {addr}: {e}");
                continue;
            }
        };

        socket.set_reuse_address(true)?;
        #[cfg(not(any(target_os = "solaris", target_os = "illumos")))]
        socket.set_reuse_port(true)?;

        apply_sockopts(&socket, opts)?;

        if let Err(e) = socket.bind(&(*addr).into()) {
            debug!("bind {addr}: {e}");
            last_err = Some(e);
            continue;
        }

        return match kind {
            SocketKind::Stream => {
                socket.listen(1).map_err(QanatError::Io)?;
                let listener = TcpListener::from_std(socket.into())?;
                Ok(Listener::Tcp(listener))
            }
            SocketKind::Datagram => Ok(Listener::Udp(UdpSocket::from_std(socket.into())?)),
        };
    }

    Err(QanatError::BindFailed(last_err.unwrap_or_else(|| {
        io::Error::new(io::ErrorKind::AddrNotAvailable, "no bindable address")
    })))
}

/// Connect to a Unix-domain stream socket.
pub async fn unix_connect(path: &Path) -> Result<NetConn, QanatError> {
    check_unix_path(path)?;
    let stream = UnixStream::connect(path)
        .await
        .map_err(|e| QanatError::ConnectionFailed(format!("{}: {e}", path.display())))?;
    Ok(NetConn::Unix(stream))
}

/// Bind and listen on a Unix-domain stream socket.
pub fn unix_listen(path: &Path) -> Result<UnixListener, QanatError> {
    check_unix_path(path)?;
    let socket = Socket::new(Domain::UNIX, Type::STREAM, None)?;
    socket.set_nonblocking(true)?;
    let addr = SockAddr::unix(path)?;
    socket.bind(&addr).map_err(QanatError::BindFailed)?;
    socket.listen(1)?;
    UnixListener::from_std(socket.into()).map_err(QanatError::Io)
}

/// Reject paths that cannot fit in `sockaddr_un` before any syscall.
fn check_unix_path(path: &Path) -> Result<(), QanatError> {
    let capacity = {
        let addr: libc::sockaddr_un = unsafe { std::mem::zeroed() };
        addr.sun_path.len()
    };
    // One byte stays reserved for the terminating NUL.
    if path.as_os_str().as_bytes().len() >= capacity {
        return Err(QanatError::PathTooLong(path.display().to_string()));
    }
    Ok(())
}

/// Wait for the first inbound datagram and latch onto its sender.
///
/// The read is a peek, so the datagram itself stays queued and is
/// delivered again through the relay.
pub async fn udp_latch(socket: &UdpSocket, chunk_size: usize) -> Result<SocketAddr, QanatError> {
    let mut buf = vec![0u8; chunk_size];
    let (_, peer) = socket.peek_from(&mut buf).await?;
    socket.connect(peer).await?;
    Ok(peer)
}

/// Probe a connected UDP socket for signs of life.
///
/// Sends one-byte probes and watches for an ICMP-driven
/// connection-refused error, rechecking at one-second intervals for the
/// configured timeout (default three seconds). This is a heuristic, not
/// an authoritative open/closed verdict: silence can mean open,
/// filtered, or an unreachable host, and refusals get rate-limited on
/// busy scans.
pub async fn udp_probe(socket: &UdpSocket, timeout: Option<Duration>) -> bool {
    const PROBE: &[u8] = b"X";

    if socket.send(PROBE).await.is_err() {
        return false;
    }
    if let Err(e) = socket.send(PROBE).await {
        if e.kind() == io::ErrorKind::ConnectionRefused {
            return false;
        }
    }

    let deadline_secs = timeout.map(|t| t.as_secs().max(1)).unwrap_or(UDP_SCAN_TIMEOUT);
    for _ in 0..deadline_secs {
        tokio::time::sleep(Duration::from_secs(1)).await;
        if let Err(e) = socket.send(PROBE).await {
            if e.kind() == io::ErrorKind::ConnectionRefused {
                return false;
            }
        }
    }
    true
}

fn new_socket(domain: Domain, kind: SocketKind) -> io::Result<Socket> {
    let (ty, protocol) = match kind {
        SocketKind::Stream => (Type::STREAM, Protocol::TCP),
        SocketKind::Datagram => (Type::DGRAM, Protocol::UDP),
    };
    let socket = Socket::new(domain, ty, Some(protocol))?;
    socket.set_nonblocking(true)?;
    Ok(socket)
}

/// Apply the optional socket tuning flags.
///
/// Each option is only touched when explicitly requested, and a platform
/// rejection is then a fatal configuration error rather than a silent
/// no-op.
pub fn apply_sockopts(socket: &Socket, opts: &SockOpts) -> Result<(), QanatError> {
    if opts.debug {
        setsockopt_int(socket.as_raw_fd(), libc::SOL_SOCKET, libc::SO_DEBUG, 1)
            .map_err(|e| QanatError::UnsupportedSocketOption("SO_DEBUG", e))?;
    }

    if opts.md5sig {
        #[cfg(any(target_os = "linux", target_os = "freebsd"))]
        setsockopt_int(socket.as_raw_fd(), libc::IPPROTO_TCP, libc::TCP_MD5SIG, 1)
            .map_err(|e| QanatError::UnsupportedSocketOption("TCP_MD5SIG", e))?;
        #[cfg(not(any(target_os = "linux", target_os = "freebsd")))]
        return Err(QanatError::UnsupportedSocketOption(
            "TCP_MD5SIG",
            io::Error::from(io::ErrorKind::Unsupported),
        ));
    }

    if let Some(tos) = opts.tos {
        socket
            .set_tos_v4(u32::from(tos))
            .map_err(|e| QanatError::UnsupportedSocketOption("IP_TOS", e))?;
    }

    Ok(())
}

fn setsockopt_int(
    fd: std::os::fd::RawFd,
    level: libc::c_int,
    name: libc::c_int,
    value: libc::c_int,
) -> io::Result<()> {
    let payload = &value as *const libc::c_int as *const libc::c_void;
    let ret = unsafe {
        libc::setsockopt(
            fd,
            level,
            name,
            payload,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if ret == -1 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unix_path_length_check() {
        let long = "/tmp/".to_string() + &"q".repeat(200);
        assert!(matches!(
            check_unix_path(Path::new(&long)),
            Err(QanatError::PathTooLong(_))
        ));
        assert!(check_unix_path(Path::new("/tmp/qanat.sock")).is_ok());
    }

    #[test]
    fn test_local_bind_family_mismatch() {
        let bind = LocalBind {
            ip: Some("127.0.0.1".parse().unwrap()),
            port: 0,
        };
        let v6_peer: SocketAddr = "[::1]:80".parse().unwrap();
        assert!(matches!(
            bind.addr_for(&v6_peer),
            Err(QanatError::BindFailed(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unanswered_connect_times_out() {
        let started = tokio::time::Instant::now();
        let limit = Duration::from_secs(3);

        // A black-holed peer never answers; the attempt future stays
        // pending forever and only the deadline can resolve it.
        let err = deadline_bounded(std::future::pending::<io::Result<()>>(), Some(limit))
            .await
            .unwrap_err();

        assert!(matches!(err, QanatError::ConnectionTimeout));
        assert!(started.elapsed() >= limit);
    }

    #[tokio::test(start_paused = true)]
    async fn test_prompt_connect_is_not_a_timeout() {
        let ok = deadline_bounded(async { Ok(7u8) }, Some(Duration::from_secs(3))).await;
        assert_eq!(ok.unwrap(), 7);

        let err = deadline_bounded(
            async { Err::<u8, _>(io::Error::from(io::ErrorKind::ConnectionRefused)) },
            Some(Duration::from_secs(3)),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, QanatError::ConnectionFailed(_)));
    }

    #[test]
    fn test_local_bind_wildcard_matches_peer_family() {
        let bind = LocalBind { ip: None, port: 2048 };
        let v4_peer: SocketAddr = "192.0.2.1:80".parse().unwrap();
        assert_eq!(bind.addr_for(&v4_peer).unwrap(), "0.0.0.0:2048".parse().unwrap());
        let v6_peer: SocketAddr = "[2001:db8::1]:80".parse().unwrap();
        assert_eq!(bind.addr_for(&v6_peer).unwrap(), "[::]:2048".parse().unwrap());
    }
}
