//! Bidirectional relay engine
//!
//! Pumps bytes between an established network connection and the local
//! standard streams. The session is modeled as two half-duplex channels,
//! network-to-local and local-to-network, each independently `Open`,
//! `HalfClosed` or `Closed`. A single task multiplexes both directions
//! with `select!`, the async equivalent of the original poll loop.
//!
//! Network EOF closes only the network read half; the local-to-network
//! direction keeps pumping until stdin also reaches EOF. Stdin EOF either
//! half-closes the network write side immediately or, with a linger
//! configured, arms a deadline after which the session reports
//! [`SessionEnd::LingerExpired`] so the caller can exit successfully.

use std::io;
use std::time::Duration;

use async_trait::async_trait;
use log::warn;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::UdpSocket;
use tokio::time::Instant;

use crate::telnet::Negotiator;

/// Default relay chunk size
pub const CHUNK_SIZE: usize = 1024;
/// Chunk size in jumbo mode
pub const JUMBO_CHUNK_SIZE: usize = 8192;

/// The network side of a relay session.
///
/// Stream sockets get this for free via the blanket impl; connected
/// datagram sockets are adapted by [`DatagramStream`]. Writes are
/// all-or-nothing: a short write is an error, never a partial success.
#[async_trait]
pub trait NetStream: Send {
    async fn recv(&mut self, buf: &mut [u8]) -> io::Result<usize>;
    async fn send_all(&mut self, buf: &[u8]) -> io::Result<()>;
    /// Half-close the sending direction, where the transport has one.
    async fn shutdown_send(&mut self) -> io::Result<()>;
}

#[async_trait]
impl<T> NetStream for T
where
    T: AsyncRead + AsyncWrite + Unpin + Send,
{
    async fn recv(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.read(buf).await
    }

    async fn send_all(&mut self, buf: &[u8]) -> io::Result<()> {
        self.write_all(buf).await
    }

    async fn shutdown_send(&mut self) -> io::Result<()> {
        AsyncWriteExt::shutdown(self).await
    }
}

/// Adapter running the relay over a connected UDP socket.
pub struct DatagramStream(pub UdpSocket);

#[async_trait]
impl NetStream for DatagramStream {
    async fn recv(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.0.recv(buf).await
    }

    async fn send_all(&mut self, buf: &[u8]) -> io::Result<()> {
        self.0.send(buf).await.map(|_| ())
    }

    async fn shutdown_send(&mut self) -> io::Result<()> {
        // Datagram sockets have no half-close.
        Ok(())
    }
}

/// Per-session relay settings
#[derive(Debug, Clone)]
pub struct RelaySettings {
    /// Rewrite a trailing LF to CRLF on transmission
    pub crlf: bool,
    /// Answer telnet option negotiation, consuming the triplets
    pub telnet: bool,
    /// Read chunk size
    pub chunk_size: usize,
    /// Sleep this long before each wait (interactive pacing)
    pub interval: Option<Duration>,
    /// A wait with no ready channel for this long ends the session
    pub idle_timeout: Option<Duration>,
    /// Keep relaying this long after stdin EOF, then quit successfully
    pub linger: Option<Duration>,
    /// Never poll local input
    pub detach_stdin: bool,
}

impl Default for RelaySettings {
    fn default() -> Self {
        Self {
            crlf: false,
            telnet: false,
            chunk_size: CHUNK_SIZE,
            interval: None,
            idle_timeout: None,
            linger: None,
            detach_stdin: false,
        }
    }
}

/// Why a relay session ended
#[derive(Debug)]
pub enum SessionEnd {
    /// Both directions reached EOF
    Eof,
    /// No channel became ready within the idle timeout
    IdleTimeout,
    /// The post-EOF linger elapsed; the caller should exit 0
    LingerExpired,
    /// A read or write failed; ends the session, not the process
    Error(io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChannelState {
    Open,
    HalfClosed,
    Closed,
}

enum Event {
    Net(io::Result<usize>),
    Local(io::Result<usize>),
    LingerElapsed,
    IdleElapsed,
}

/// The relay loop itself
pub struct RelayEngine {
    settings: RelaySettings,
}

impl RelayEngine {
    pub fn new(settings: RelaySettings) -> Self {
        Self { settings }
    }

    /// Run one session to completion.
    ///
    /// Returns only when the session is over; the connection is still
    /// owned by the caller and is closed by dropping it.
    pub async fn run<S, I, O>(&self, net: &mut S, local_in: &mut I, local_out: &mut O) -> SessionEnd
    where
        S: NetStream + ?Sized,
        I: AsyncRead + Unpin,
        O: AsyncWrite + Unpin,
    {
        let mut net_buf = vec![0u8; self.settings.chunk_size];
        let mut local_buf = vec![0u8; self.settings.chunk_size];
        let mut negotiator = Negotiator::new();

        let mut net_read = ChannelState::Open;
        // A detached stdin never participates; treat it as already drained.
        let mut local_in_state = if self.settings.detach_stdin {
            ChannelState::Closed
        } else {
            ChannelState::Open
        };
        let mut linger_at: Option<Instant> = None;

        loop {
            if net_read != ChannelState::Open && local_in_state != ChannelState::Open {
                return SessionEnd::Eof;
            }

            if let Some(interval) = self.settings.interval {
                tokio::time::sleep(interval).await;
            }

            let idle = self.settings.idle_timeout;
            let event = tokio::select! {
                r = net.recv(&mut net_buf), if net_read == ChannelState::Open => Event::Net(r),
                r = local_in.read(&mut local_buf), if local_in_state == ChannelState::Open => {
                    Event::Local(r)
                }
                // Disabled branches still evaluate their expression, so
                // feed a dummy value when the timer is not armed.
                _ = tokio::time::sleep_until(linger_at.unwrap_or_else(Instant::now)),
                    if linger_at.is_some() =>
                {
                    Event::LingerElapsed
                }
                _ = tokio::time::sleep(idle.unwrap_or(Duration::ZERO)), if idle.is_some() => {
                    Event::IdleElapsed
                }
            };

            match event {
                Event::IdleElapsed => return SessionEnd::IdleTimeout,
                Event::LingerElapsed => return SessionEnd::LingerExpired,

                Event::Net(Err(e)) => return SessionEnd::Error(e),
                Event::Net(Ok(0)) => {
                    // Peer finished sending. Half-close: stop polling the
                    // network for reads but leave local output open.
                    net_read = ChannelState::Closed;
                }
                Event::Net(Ok(n)) => {
                    let result = if self.settings.telnet {
                        let (data, replies) = negotiator.feed(&net_buf[..n]);
                        if !replies.is_empty() {
                            // Refusal replies are best-effort: a failed
                            // write leaves the option unanswered; only
                            // data-path write failures end the session.
                            if let Err(e) = net.send_all(&replies).await {
                                warn!("telnet reply write failed: {e}");
                            }
                        }
                        forward(local_out, &data).await
                    } else {
                        forward(local_out, &net_buf[..n]).await
                    };
                    if let Err(e) = result {
                        return SessionEnd::Error(e);
                    }
                }

                Event::Local(Err(e)) => return SessionEnd::Error(e),
                Event::Local(Ok(0)) => {
                    local_in_state = ChannelState::HalfClosed;
                    match self.settings.linger {
                        Some(linger) => linger_at = Some(Instant::now() + linger),
                        None => {
                            if let Err(e) = net.shutdown_send().await {
                                warn!("network shutdown failed: {e}");
                            }
                        }
                    }
                }
                Event::Local(Ok(n)) => {
                    let result = if self.settings.crlf && local_buf[n - 1] == b'\n' {
                        send_with_crlf(net, &local_buf[..n]).await
                    } else {
                        net.send_all(&local_buf[..n]).await
                    };
                    if let Err(e) = result {
                        return SessionEnd::Error(e);
                    }
                }
            }
        }
    }
}

async fn forward<O: AsyncWrite + Unpin>(out: &mut O, data: &[u8]) -> io::Result<()> {
    if data.is_empty() {
        return Ok(());
    }
    out.write_all(data).await?;
    out.flush().await
}

/// Transmit a chunk whose final byte is LF, replacing it with CRLF.
async fn send_with_crlf<S: NetStream + ?Sized>(net: &mut S, buf: &[u8]) -> io::Result<()> {
    if buf.len() > 1 {
        net.send_all(&buf[..buf.len() - 1]).await?;
    }
    net.send_all(b"\r\n").await
}
