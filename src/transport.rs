//! Transport Layer
//!
//! Per-transport capabilities shared by the relay core: reading, writing and
//! half-closing a stream endpoint, dialing targets (optionally over TLS) and
//! socket options.

use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use socket2::{SockRef, TcpKeepalive};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{lookup_host, TcpStream, UdpSocket};
#[cfg(unix)]
use tokio::net::UnixStream;
use tokio::time::timeout;
use tokio_rustls::client::TlsStream;
use tracing::{debug, warn};

use crate::config::{Address, Protocol, SessionSettings};
use crate::error::ProxyError;
use crate::tls::TlsConnector;

/// A connected stream endpoint of a session
#[derive(Debug)]
pub enum ProxyStream {
    Tcp(TcpStream),
    /// TCP target dialed with TLS.
    Tls(Box<TlsStream<TcpStream>>),
    #[cfg(unix)]
    Unix(UnixStream),
}

impl ProxyStream {
    pub fn protocol(&self) -> Protocol {
        match self {
            ProxyStream::Tcp(_) | ProxyStream::Tls(_) => Protocol::Tcp,
            #[cfg(unix)]
            ProxyStream::Unix(_) => Protocol::Unix,
        }
    }

    /// Human readable remote end, for logs
    pub fn peer_label(&self) -> String {
        match self {
            ProxyStream::Tcp(stream) => tcp_peer_label(stream),
            ProxyStream::Tls(stream) => format!("tls:{}", tcp_peer_label(stream.get_ref().0)),
            #[cfg(unix)]
            ProxyStream::Unix(stream) => stream
                .peer_addr()
                .ok()
                .and_then(|addr| addr.as_pathname().map(|p| p.display().to_string()))
                .unwrap_or_else(|| "unix:unnamed".to_string()),
        }
    }

    /// Abort the connection so the peer observes a reset rather than a
    /// clean close.
    pub fn reset(self) {
        match self {
            ProxyStream::Tcp(stream) => set_reset_on_close(&stream),
            ProxyStream::Tls(stream) => set_reset_on_close(stream.get_ref().0),
            #[cfg(unix)]
            ProxyStream::Unix(_) => {}
        }
    }
}

fn tcp_peer_label(stream: &TcpStream) -> String {
    stream
        .peer_addr()
        .map(|addr| addr.to_string())
        .unwrap_or_else(|_| "tcp:unknown".to_string())
}

fn set_reset_on_close(stream: &TcpStream) {
    if let Err(e) = SockRef::from(stream).set_linger(Some(Duration::ZERO)) {
        debug!("Failed to set SO_LINGER before reset: {}", e);
    }
}

impl AsyncRead for ProxyStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            ProxyStream::Tcp(stream) => Pin::new(stream).poll_read(cx, buf),
            ProxyStream::Tls(stream) => Pin::new(stream).poll_read(cx, buf),
            #[cfg(unix)]
            ProxyStream::Unix(stream) => Pin::new(stream).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for ProxyStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            ProxyStream::Tcp(stream) => Pin::new(stream).poll_write(cx, buf),
            ProxyStream::Tls(stream) => Pin::new(stream).poll_write(cx, buf),
            #[cfg(unix)]
            ProxyStream::Unix(stream) => Pin::new(stream).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            ProxyStream::Tcp(stream) => Pin::new(stream).poll_flush(cx),
            ProxyStream::Tls(stream) => Pin::new(stream).poll_flush(cx),
            #[cfg(unix)]
            ProxyStream::Unix(stream) => Pin::new(stream).poll_flush(cx),
        }
    }

    /// Half-close: shuts down the write direction only.
    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            ProxyStream::Tcp(stream) => Pin::new(stream).poll_shutdown(cx),
            ProxyStream::Tls(stream) => Pin::new(stream).poll_shutdown(cx),
            #[cfg(unix)]
            ProxyStream::Unix(stream) => Pin::new(stream).poll_shutdown(cx),
        }
    }
}

/// Apply proxy socket options to a TCP stream
pub fn configure_tcp(stream: &TcpStream, settings: &SessionSettings) -> io::Result<()> {
    stream.set_nodelay(true)?;
    if settings.keepalive {
        let keepalive = TcpKeepalive::new().with_time(settings.keepalive_interval);
        SockRef::from(stream).set_tcp_keepalive(&keepalive)?;
    }
    Ok(())
}

/// Dial the target of a stream rule, bounded by the dial timeout.
///
/// With `tls` set, the TLS handshake is part of the dial and shares its
/// timeout.
pub async fn dial(
    protocol: Protocol,
    target: &Address,
    settings: &SessionSettings,
    tls: Option<&TlsConnector>,
) -> Result<ProxyStream, ProxyError> {
    let label = target.to_string();
    let dial_timeout = settings.dial_timeout;

    let connect = connect_stream(protocol, target, settings, tls);

    match timeout(dial_timeout, connect).await {
        Ok(Ok(stream)) => {
            debug!("Connected to target {}", label);
            Ok(stream)
        }
        Ok(Err(source)) => Err(ProxyError::Dial {
            target: label,
            source,
        }),
        Err(_) => Err(ProxyError::DialTimeout {
            target: label,
            timeout: dial_timeout,
        }),
    }
}

async fn connect_stream(
    protocol: Protocol,
    target: &Address,
    settings: &SessionSettings,
    tls: Option<&TlsConnector>,
) -> io::Result<ProxyStream> {
    match (protocol, target) {
        (Protocol::Tcp, Address::Socket(addr)) => {
            let stream = TcpStream::connect(addr).await?;
            finish_tcp(stream, target, settings, tls).await
        }
        (Protocol::Tcp, Address::Host { host, port }) => {
            let stream = TcpStream::connect((host.as_str(), *port)).await?;
            finish_tcp(stream, target, settings, tls).await
        }
        #[cfg(unix)]
        (Protocol::Unix, Address::Unix(path)) => {
            UnixStream::connect(path).await.map(ProxyStream::Unix)
        }
        _ => Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("cannot dial {} over {}", target, protocol),
        )),
    }
}

/// Apply socket options to a dialed TCP stream and run the TLS handshake
/// when the rule asks for it
async fn finish_tcp(
    stream: TcpStream,
    target: &Address,
    settings: &SessionSettings,
    tls: Option<&TlsConnector>,
) -> io::Result<ProxyStream> {
    if let Err(e) = configure_tcp(&stream, settings) {
        warn!("Failed to configure outbound socket to {}: {}", target, e);
    }

    match tls {
        Some(connector) => {
            let stream = connector.connect(target, stream).await?;
            Ok(ProxyStream::Tls(Box::new(stream)))
        }
        None => Ok(ProxyStream::Tcp(stream)),
    }
}

/// Resolve a datagram target to a single socket address
pub async fn resolve_udp_target(
    target: &Address,
    dial_timeout: Duration,
) -> Result<SocketAddr, ProxyError> {
    let label = target.to_string();
    match target {
        Address::Socket(addr) => Ok(*addr),
        Address::Host { host, port } => {
            match timeout(dial_timeout, lookup_host((host.as_str(), *port))).await {
                Ok(Ok(mut addrs)) => addrs.next().ok_or_else(|| ProxyError::Dial {
                    target: label,
                    source: io::Error::new(io::ErrorKind::NotFound, "no addresses resolved"),
                }),
                Ok(Err(source)) => Err(ProxyError::Dial { target: label, source }),
                Err(_) => Err(ProxyError::DialTimeout {
                    target: label,
                    timeout: dial_timeout,
                }),
            }
        }
        Address::Unix(_) => Err(ProxyError::Dial {
            target: label,
            source: io::Error::new(io::ErrorKind::InvalidInput, "udp cannot target a unix path"),
        }),
    }
}

/// Open an outbound datagram socket connected to `target`
pub async fn dial_udp(target: SocketAddr) -> Result<UdpSocket, ProxyError> {
    let local = match target.ip() {
        IpAddr::V4(_) => SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0),
        IpAddr::V6(_) => SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), 0),
    };
    let dial_error = |source| ProxyError::Dial {
        target: target.to_string(),
        source,
    };

    let socket = UdpSocket::bind(local).await.map_err(dial_error)?;
    socket.connect(target).await.map_err(dial_error)?;
    Ok(socket)
}
