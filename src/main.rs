//! qanat - TCP/UDP/Unix-domain connect-and-relay tool
//!
//! Connects outward to one or more ports, or listens for an inbound
//! connection, then relays bytes between that connection and the local
//! standard streams. Supports port scanning, UDP mode, Unix-domain
//! sockets and SOCKS4/SOCKS5/HTTP-CONNECT proxies.

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use anyhow::{bail, Result};
use clap::Parser;
use log::debug;

use qanat::config::{Config, Family, Mode, ProxySpec, SockOpts, SocketKind};
use qanat::establish::{self, Listener, LocalBind, NetConn};
use qanat::ports;
use qanat::proxy::{self, ProxyProtocol};
use qanat::relay::{DatagramStream, RelayEngine, RelaySettings, SessionEnd, CHUNK_SIZE, JUMBO_CHUNK_SIZE};
use qanat::resolver;
use qanat::QanatError;

#[derive(Parser)]
#[command(name = "qanat")]
#[command(version)]
#[command(about = "TCP/UDP/Unix-domain connect-and-relay tool", long_about = None)]
struct Cli {
    /// Use IPv4 addresses only
    #[arg(short = '4', long = "ipv4")]
    ipv4: bool,

    /// Use IPv6 addresses only
    #[arg(short = '6', long = "ipv6")]
    ipv6: bool,

    /// Use a Unix-domain socket
    #[arg(short = 'U', long = "unix")]
    unix: bool,

    /// UDP instead of TCP
    #[arg(short = 'u', long = "udp")]
    udp: bool,

    /// Listen for an inbound connection
    #[arg(short = 'l', long = "listen")]
    listen: bool,

    /// Keep the listener open for multiple sequential connections
    #[arg(short = 'k', long = "keep-open")]
    keep_open: bool,

    /// Suppress name and service resolution
    #[arg(short = 'n', long = "numeric")]
    numeric: bool,

    /// Report binds, listens, accepts and connects
    #[arg(short = 'v', long = "verbose")]
    verbose: bool,

    /// Zero-I/O mode: test connectivity only, never relay (scanning)
    #[arg(short = 'z', long = "scan")]
    scan: bool,

    /// Detach from stdin
    #[arg(short = 'd', long = "detach-stdin")]
    detach_stdin: bool,

    /// Randomize the order of scanned ports
    #[arg(short = 'r', long = "randomize")]
    randomize: bool,

    /// Answer TELNET option negotiation
    #[arg(short = 't', long = "telnet")]
    telnet: bool,

    /// Send CRLF as line ending
    #[arg(short = 'C', long = "crlf")]
    crlf: bool,

    /// Enable the debug socket option
    #[arg(short = 'D', long = "sodebug")]
    so_debug: bool,

    /// Enable the TCP MD5 signature option
    #[arg(short = 'S', long = "md5sig")]
    md5sig: bool,

    /// Use larger relay chunks (jumbo frames)
    #[arg(short = 'j', long = "jumbo")]
    jumbo: bool,

    /// Delay interval between lines sent and ports scanned
    #[arg(short = 'i', long = "interval", value_name = "SECS")]
    interval: Option<u64>,

    /// Timeout for connects and final net reads
    #[arg(short = 'w', long = "timeout", value_name = "SECS")]
    timeout: Option<u64>,

    /// Quit this many seconds after EOF on stdin
    #[arg(short = 'q', long = "quit-after", value_name = "SECS")]
    quit_after: Option<u64>,

    /// Local source port for outbound connects
    #[arg(short = 'p', long = "source-port", value_name = "PORT")]
    source_port: Option<String>,

    /// Local source address for outbound connects
    #[arg(short = 's', long = "source", value_name = "ADDR")]
    source: Option<String>,

    /// IP Type of Service: lowdelay, throughput, reliability or 0xNN
    #[arg(short = 'T', long = "tos", value_name = "TOS")]
    tos: Option<String>,

    /// Proxy protocol: "4", "5" (SOCKS) or "connect"
    #[arg(short = 'X', long = "proxy-protocol", value_name = "PROTO")]
    proxy_protocol: Option<String>,

    /// Proxy address, host[:port]
    #[arg(short = 'x', long = "proxy", value_name = "ADDR[:PORT]")]
    proxy_addr: Option<String>,

    /// Username for proxy authentication
    #[arg(short = 'P', long = "proxy-user", value_name = "USER")]
    proxy_user: Option<String>,

    /// [host] port for connect mode, port for listen mode, or a socket
    /// path in Unix-domain mode
    #[arg(value_name = "HOST | PORT | PATH")]
    args: Vec<String>,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    env_logger::Builder::from_default_env()
        .filter_level(if cli.verbose {
            log::LevelFilter::Debug
        } else {
            log::LevelFilter::Error
        })
        .init();

    match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("qanat: {e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<ExitCode> {
    let cfg = build_config(cli)?;
    match cfg.mode {
        Mode::Listen => run_listen(&cfg).await,
        Mode::Connect | Mode::ScanOnly => run_connect(&cfg).await,
    }
}

/// Fold the parsed flags into one immutable Config, rejecting the
/// combinations netcat rejects.
fn build_config(cli: Cli) -> Result<Config> {
    let family = match (cli.ipv4, cli.ipv6, cli.unix) {
        (false, false, false) => Family::Unspecified,
        (true, false, false) => Family::Ipv4,
        (false, true, false) => Family::Ipv6,
        (false, false, true) => Family::Unix,
        _ => bail!("-4, -6 and -U are mutually exclusive"),
    };

    if cli.listen && cli.source.is_some() {
        bail!("cannot use -s and -l");
    }
    if cli.listen && cli.source_port.is_some() {
        bail!("cannot use -p and -l");
    }
    if cli.listen && cli.scan {
        bail!("cannot use -z and -l");
    }
    if cli.keep_open && !cli.listen {
        bail!("must use -l with -k");
    }

    let mut host = None;
    let mut port_spec = None;
    let mut unix_path = None;
    match (&cli.args[..], family, cli.listen) {
        ([path], Family::Unix, _) => unix_path = Some(PathBuf::from(path)),
        ([port], _, true) => port_spec = Some(port.clone()),
        ([h, port], f, _) if f != Family::Unix => {
            host = Some(h.clone());
            port_spec = Some(port.clone());
        }
        _ => bail!("usage: qanat [options] [host] port | qanat -l [options] port"),
    }

    let proxy = match cli.proxy_addr {
        Some(spec) => {
            let protocol: ProxyProtocol = cli
                .proxy_protocol
                .as_deref()
                .unwrap_or("5")
                .parse()
                .map_err(anyhow::Error::from)?;
            if cli.udp {
                bail!("no proxy support for UDP mode");
            }
            if cli.listen {
                bail!("no proxy support for listen");
            }
            if family == Family::Unix {
                bail!("no proxy support for unix sockets");
            }
            if family == Family::Ipv6 {
                bail!("no proxy support for IPv6");
            }
            if cli.source.is_some() {
                bail!("no proxy support for local source address");
            }
            let (phost, pport) = match spec.split_once(':') {
                Some((h, p)) => (
                    h.to_string(),
                    ports::single_port(p, SocketKind::Stream).map_err(anyhow::Error::from)?,
                ),
                None => (spec, protocol.default_port()),
            };
            Some(ProxySpec {
                protocol,
                host: phost,
                port: pport,
                username: cli.proxy_user,
            })
        }
        None => None,
    };

    let timeout = match cli.timeout {
        Some(secs) => {
            if secs >= (i32::MAX as u64) / 1000 {
                bail!("timeout too large");
            }
            Some(Duration::from_secs(secs))
        }
        None => None,
    };

    let tos = cli
        .tos
        .as_deref()
        .map(qanat::config::parse_iptos)
        .transpose()
        .map_err(anyhow::Error::from)?;

    Ok(Config {
        mode: if cli.listen {
            Mode::Listen
        } else if cli.scan {
            Mode::ScanOnly
        } else {
            Mode::Connect
        },
        family,
        kind: if cli.udp {
            SocketKind::Datagram
        } else {
            SocketKind::Stream
        },
        host,
        port_spec,
        unix_path,
        source_addr: cli.source,
        source_port: cli.source_port,
        keep_open: cli.keep_open,
        numeric: cli.numeric,
        randomize: cli.randomize,
        verbose: cli.verbose,
        detach_stdin: cli.detach_stdin,
        crlf: cli.crlf,
        telnet: cli.telnet,
        jumbo: cli.jumbo,
        interval: cli.interval.map(Duration::from_secs),
        timeout,
        linger: cli.quit_after.filter(|s| *s > 0).map(Duration::from_secs),
        sockopts: SockOpts {
            debug: cli.so_debug,
            md5sig: cli.md5sig,
            tos,
        },
        proxy,
    })
}

fn relay_settings(cfg: &Config) -> RelaySettings {
    RelaySettings {
        crlf: cfg.crlf,
        telnet: cfg.telnet,
        chunk_size: chunk_size(cfg),
        interval: cfg.interval,
        idle_timeout: cfg.timeout,
        linger: cfg.linger,
        detach_stdin: cfg.detach_stdin,
    }
}

fn chunk_size(cfg: &Config) -> usize {
    if cfg.jumbo {
        JUMBO_CHUNK_SIZE
    } else {
        CHUNK_SIZE
    }
}

/// Cycle through the port list, connecting to each port in turn.
async fn run_connect(cfg: &Config) -> Result<ExitCode> {
    let engine = RelayEngine::new(relay_settings(cfg));

    if cfg.family == Family::Unix {
        let path = cfg.unix_path.as_deref().expect("validated unix path");
        let conn = match establish::unix_connect(path).await {
            Ok(conn) => conn,
            Err(e) => {
                debug!("{e}");
                return Ok(exit_for_scan(cfg, false));
            }
        };
        if cfg.mode != Mode::ScanOnly {
            run_session(conn, &engine).await;
        }
        return Ok(ExitCode::SUCCESS);
    }

    let host = cfg.host.as_deref().expect("validated host");
    let spec = cfg.port_spec.as_deref().expect("validated port spec");
    let port_list = ports::build_ports(spec, cfg.kind, cfg.randomize)?;
    let local = local_bind(cfg).await?;

    let mut connected = false;
    let mut first = true;
    for port in port_list {
        if !first {
            if let Some(interval) = cfg.interval {
                tokio::time::sleep(interval).await;
            }
        }
        first = false;

        let conn = match connect_once(cfg, host, port, local).await {
            Ok(conn) => conn,
            Err(
                e @ (QanatError::ResolutionFailed(_)
                | QanatError::BindFailed(_)
                | QanatError::UnsupportedSocketOption(..)
                | QanatError::InvalidPortSpec(_)),
            ) => return Err(e.into()),
            Err(e) => {
                debug!("port {port}: {e}");
                continue;
            }
        };
        connected = true;

        if cfg.verbose || cfg.mode == Mode::ScanOnly {
            if let NetConn::Udp(sock) = &conn {
                if !establish::udp_probe(sock, cfg.timeout).await {
                    connected = false;
                    continue;
                }
            }
            report_success(cfg, host, port);
        }

        if cfg.mode != Mode::ScanOnly {
            match run_session(conn, &engine).await {
                SessionEnd::LingerExpired => return Ok(ExitCode::SUCCESS),
                SessionEnd::Error(e) => debug!("session ended: {e}"),
                SessionEnd::Eof | SessionEnd::IdleTimeout => {}
            }
        }
    }

    Ok(exit_for_scan(cfg, connected))
}

/// Scan mode reports open/closed on the diagnostic stream, not through
/// the exit code; connect mode fails when nothing was reachable.
fn exit_for_scan(cfg: &Config, connected: bool) -> ExitCode {
    if cfg.mode == Mode::ScanOnly || connected {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}

async fn connect_once(
    cfg: &Config,
    host: &str,
    port: u16,
    local: Option<LocalBind>,
) -> Result<NetConn, QanatError> {
    if let Some(proxy_spec) = &cfg.proxy {
        let proxy_addrs = resolver::resolve(
            Some(&proxy_spec.host),
            proxy_spec.port,
            cfg.family,
            cfg.numeric,
            false,
        )
        .await?;
        let conn = establish::remote_connect(
            &proxy_addrs,
            SocketKind::Stream,
            local,
            cfg.timeout,
            &cfg.sockopts,
        )
        .await?;
        let NetConn::Tcp(stream) = conn else {
            unreachable!("stream connect always yields a TCP connection");
        };
        let stream = proxy::proxy_connect(
            stream,
            host,
            port,
            proxy_spec.protocol,
            proxy_spec.username.as_deref(),
        )
        .await?;
        return Ok(NetConn::Tcp(stream));
    }

    let addrs = resolver::resolve(Some(host), port, cfg.family, cfg.numeric, false).await?;
    establish::remote_connect(&addrs, cfg.kind, local, cfg.timeout, &cfg.sockopts).await
}

/// Resolve `-s`/`-p` into a local bind, once, up front.
async fn local_bind(cfg: &Config) -> Result<Option<LocalBind>, QanatError> {
    if cfg.source_addr.is_none() && cfg.source_port.is_none() {
        return Ok(None);
    }
    let ip = match &cfg.source_addr {
        Some(addr) => Some(
            resolver::resolve(Some(addr), 0, cfg.family, cfg.numeric, true)
                .await?[0]
                .ip(),
        ),
        None => None,
    };
    let port = match &cfg.source_port {
        Some(spec) => ports::single_port(spec, cfg.kind)?,
        None => 0,
    };
    Ok(Some(LocalBind { ip, port }))
}

/// Serve inbound peers one at a time, optionally looping with -k.
async fn run_listen(cfg: &Config) -> Result<ExitCode> {
    let engine = RelayEngine::new(relay_settings(cfg));

    if cfg.family == Family::Unix {
        let path = cfg.unix_path.as_deref().expect("validated unix path");
        let listener = establish::unix_listen(path)?;
        if cfg.verbose {
            eprintln!("Listening on {}", path.display());
        }
        loop {
            let (stream, _) = listener.accept().await?;
            if cfg.verbose {
                eprintln!("Connection received on {}", path.display());
            }
            if let SessionEnd::LingerExpired = run_session(NetConn::Unix(stream), &engine).await {
                return Ok(ExitCode::SUCCESS);
            }
            if !cfg.keep_open {
                break;
            }
        }
        return Ok(ExitCode::SUCCESS);
    }

    let spec = cfg.port_spec.as_deref().expect("validated port spec");
    let port = ports::single_port(spec, cfg.kind)?;

    // Rebuild the listening socket for every accepted peer, like the
    // original: one inbound connection at a time, strictly sequential.
    loop {
        let addrs =
            resolver::resolve(cfg.host.as_deref(), port, cfg.family, cfg.numeric, true).await?;
        let listener = establish::local_listen(&addrs, cfg.kind, &cfg.sockopts)?;

        let conn = match listener {
            Listener::Tcp(listener) => {
                if cfg.verbose {
                    eprintln!("Listening on {}", listener.local_addr()?);
                }
                let (stream, peer) = listener.accept().await?;
                if cfg.verbose {
                    eprintln!("Connection received on {peer}");
                }
                NetConn::Tcp(stream)
            }
            Listener::Udp(socket) => {
                if cfg.verbose {
                    eprintln!("Bound on {}", socket.local_addr()?);
                }
                let peer = establish::udp_latch(&socket, chunk_size(cfg)).await?;
                if cfg.verbose {
                    eprintln!("Connection received from {peer}");
                }
                NetConn::Udp(socket)
            }
        };

        if let SessionEnd::LingerExpired = run_session(conn, &engine).await {
            return Ok(ExitCode::SUCCESS);
        }
        if !cfg.keep_open {
            break;
        }
    }

    Ok(ExitCode::SUCCESS)
}

async fn run_session(conn: NetConn, engine: &RelayEngine) -> SessionEnd {
    let mut stdin = tokio::io::stdin();
    let mut stdout = tokio::io::stdout();
    let end = match conn {
        NetConn::Tcp(mut stream) => engine.run(&mut stream, &mut stdin, &mut stdout).await,
        NetConn::Unix(mut stream) => engine.run(&mut stream, &mut stdin, &mut stdout).await,
        NetConn::Udp(socket) => {
            let mut stream = DatagramStream(socket);
            engine.run(&mut stream, &mut stdin, &mut stdout).await
        }
    };
    if let SessionEnd::Error(e) = &end {
        debug!("session ended: {e}");
    }
    end
}

fn report_success(cfg: &Config, host: &str, port: u16) {
    let proto = cfg.kind.proto_name();
    let service = if cfg.numeric {
        None
    } else {
        ports::service_name(port, proto)
    };
    eprintln!(
        "Connection to {host} {port} port [{proto}/{}] succeeded!",
        service.as_deref().unwrap_or("*")
    );
}
