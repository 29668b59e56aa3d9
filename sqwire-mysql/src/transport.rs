//! Byte transports the packet framer runs on
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
#[cfg(unix)]
use tokio::net::UnixStream;
use tokio_rustls::TlsConnector;
use tokio_rustls::rustls::pki_types::ServerName;

use crate::dsn::{Config, lookup_dial};
use crate::error::{ErrorKind, Result};

/// A byte stream that can back a connection.
///
/// Implemented for every `AsyncRead + AsyncWrite` stream; custom dial
/// functions registered with [crate::register_dial] return one of these.
pub trait AsyncStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> AsyncStream for T {}

/// The transport under a connection, either plain or upgraded to TLS
pub(crate) enum Transport {
    Tcp(TcpStream),
    #[cfg(unix)]
    Unix(UnixStream),
    Custom(Box<dyn AsyncStream>),
    Tls(Box<tokio_rustls::client::TlsStream<Box<dyn AsyncStream>>>),
    /// Connection torn down; all I/O fails
    Closed,
}

impl Transport {
    /// Dial the address in the config.
    ///
    /// A dial function registered for the config's network takes
    /// precedence; otherwise `tcp` and `unix` are handled here. The dial
    /// timeout only applies to the built-in networks, registered dialers
    /// manage their own.
    pub(crate) async fn dial(cfg: &Config) -> Result<Transport> {
        if let Some(dial) = lookup_dial(&cfg.net) {
            tracing::debug!(net = %cfg.net, addr = %cfg.addr, "dialing via registered dial function");
            return Ok(Transport::Custom(dial(&cfg.addr).await?));
        }
        match cfg.net.as_str() {
            "tcp" => {
                let stream = with_timeout(cfg.timeout, TcpStream::connect(cfg.addr.as_str())).await?;
                // Keepalives match the behavior of most native clients and
                // surface dead peers on long-lived idle connections.
                socket2::SockRef::from(&stream).set_keepalive(true)?;
                Ok(Transport::Tcp(stream))
            }
            #[cfg(unix)]
            "unix" => {
                let stream = with_timeout(cfg.timeout, UnixStream::connect(cfg.addr.as_str())).await?;
                Ok(Transport::Unix(stream))
            }
            _ => Err(ErrorKind::InvalidDsn(format!("unknown network '{}'", cfg.net)).into()),
        }
    }

    pub(crate) fn is_closed(&self) -> bool {
        matches!(self, Transport::Closed)
    }

    /// Upgrade the current stream to TLS, replacing it in place
    pub(crate) async fn upgrade_tls(
        &mut self,
        connector: TlsConnector,
        server_name: ServerName<'static>,
    ) -> Result<()> {
        let plain: Box<dyn AsyncStream> = match std::mem::replace(self, Transport::Closed) {
            Transport::Tcp(s) => Box::new(s),
            #[cfg(unix)]
            Transport::Unix(s) => Box::new(s),
            Transport::Custom(s) => s,
            Transport::Tls(_) | Transport::Closed => {
                return Err(ErrorKind::InvalidConn.into());
            }
        };
        let tls = connector.connect(server_name, plain).await?;
        *self = Transport::Tls(Box::new(tls));
        Ok(())
    }
}

async fn with_timeout<T>(
    timeout: Duration,
    fut: impl std::future::Future<Output = io::Result<T>>,
) -> Result<T> {
    if timeout.is_zero() {
        return Ok(fut.await?);
    }
    match tokio::time::timeout(timeout, fut).await {
        Ok(res) => Ok(res?),
        Err(_) => Err(ErrorKind::Io(io::Error::new(io::ErrorKind::TimedOut, "dial timeout")).into()),
    }
}

fn closed_err() -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, "connection is closed")
}

impl AsyncRead for Transport {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Transport::Tcp(s) => Pin::new(s).poll_read(cx, buf),
            #[cfg(unix)]
            Transport::Unix(s) => Pin::new(s).poll_read(cx, buf),
            Transport::Custom(s) => Pin::new(s).poll_read(cx, buf),
            Transport::Tls(s) => Pin::new(s).poll_read(cx, buf),
            Transport::Closed => Poll::Ready(Err(closed_err())),
        }
    }
}

impl AsyncWrite for Transport {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            Transport::Tcp(s) => Pin::new(s).poll_write(cx, buf),
            #[cfg(unix)]
            Transport::Unix(s) => Pin::new(s).poll_write(cx, buf),
            Transport::Custom(s) => Pin::new(s).poll_write(cx, buf),
            Transport::Tls(s) => Pin::new(s).poll_write(cx, buf),
            Transport::Closed => Poll::Ready(Err(closed_err())),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Transport::Tcp(s) => Pin::new(s).poll_flush(cx),
            #[cfg(unix)]
            Transport::Unix(s) => Pin::new(s).poll_flush(cx),
            Transport::Custom(s) => Pin::new(s).poll_flush(cx),
            Transport::Tls(s) => Pin::new(s).poll_flush(cx),
            Transport::Closed => Poll::Ready(Err(closed_err())),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Transport::Tcp(s) => Pin::new(s).poll_shutdown(cx),
            #[cfg(unix)]
            Transport::Unix(s) => Pin::new(s).poll_shutdown(cx),
            Transport::Custom(s) => Pin::new(s).poll_shutdown(cx),
            Transport::Tls(s) => Pin::new(s).poll_shutdown(cx),
            Transport::Closed => Poll::Ready(Ok(())),
        }
    }
}
