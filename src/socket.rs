//! Origin-facing connection
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;

/// A connection to an origin, plain until [`Socket::upgrade`] wraps it in TLS.
///
/// Writes made through the inherent methods are bounded by the write
/// timeout. The read timeout is only carried: the reader decides what a
/// whole read is.
#[derive(Debug)]
pub struct Socket {
  transport: Transport,
  peer_addr: SocketAddr,
  read_timeout: Option<Duration>,
  write_timeout: Option<Duration>,
}

#[derive(Debug)]
enum Transport {
  Plain(TcpStream),
  Tls(Box<TlsStream<TcpStream>>),
}

// both arms expose the same tokio traits
macro_rules! on_transport {
  ($self:ident, $stream:ident => $e:expr) => {
    match &mut $self.get_mut().transport {
      Transport::Plain($stream) => {
        let $stream = Pin::new($stream);
        $e
      }
      Transport::Tls($stream) => {
        let $stream = Pin::new($stream.as_mut());
        $e
      }
    }
  };
}

impl Socket {
  pub(crate) fn new(
    stream: TcpStream,
    read_timeout: Option<Duration>,
    write_timeout: Option<Duration>,
  ) -> io::Result<Self> {
    Ok(Self {
      peer_addr: stream.peer_addr()?,
      transport: Transport::Plain(stream),
      read_timeout,
      write_timeout,
    })
  }

  /// Run `handshake` over the TCP stream. Already upgraded sockets are
  /// returned unchanged.
  pub(crate) async fn upgrade<F, Fut>(self, handshake: F) -> io::Result<Self>
  where
    F: FnOnce(TcpStream) -> Fut,
    Fut: Future<Output = io::Result<TlsStream<TcpStream>>>,
  {
    let transport = match self.transport {
      Transport::Plain(tcp) => Transport::Tls(Box::new(handshake(tcp).await?)),
      tls => tls,
    };
    Ok(Self { transport, ..self })
  }

  /// The origin address this socket is connected to.
  pub fn peer_addr(&self) -> SocketAddr {
    self.peer_addr
  }

  /// The deadline for reading one response off this socket.
  pub fn read_timeout(&self) -> Option<Duration> {
    self.read_timeout
  }

  /// Whether TLS was negotiated on this socket.
  pub fn is_tls(&self) -> bool {
    matches!(self.transport, Transport::Tls(_))
  }

  /// ALPN protocol the origin picked, if any.
  pub fn alpn_protocol(&self) -> Option<&[u8]> {
    match &self.transport {
      Transport::Plain(_) => None,
      Transport::Tls(tls) => tls.get_ref().1.alpn_protocol(),
    }
  }

  /// Write all of `buf`.
  pub async fn write_all(&mut self, buf: &[u8]) -> io::Result<()> {
    let timeout = self.write_timeout;
    let op = AsyncWriteExt::write_all(&mut *self, buf);
    match timeout {
      None => op.await,
      Some(t) => tokio::time::timeout(t, op).await?,
    }
  }

  /// Flush buffered bytes, TLS records included.
  pub async fn flush(&mut self) -> io::Result<()> {
    let timeout = self.write_timeout;
    let op = AsyncWriteExt::flush(&mut *self);
    match timeout {
      None => op.await,
      Some(t) => tokio::time::timeout(t, op).await?,
    }
  }

  /// Close the write side; for TLS this sends `close_notify` first.
  pub async fn shutdown(&mut self) -> io::Result<()> {
    let timeout = self.write_timeout;
    let op = AsyncWriteExt::shutdown(&mut *self);
    match timeout {
      None => op.await,
      Some(t) => tokio::time::timeout(t, op).await?,
    }
  }
}

impl AsyncRead for Socket {
  fn poll_read(
    self: Pin<&mut Self>,
    cx: &mut Context<'_>,
    buf: &mut ReadBuf<'_>,
  ) -> Poll<io::Result<()>> {
    on_transport!(self, s => s.poll_read(cx, buf))
  }
}

impl AsyncWrite for Socket {
  fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
    on_transport!(self, s => s.poll_write(cx, buf))
  }

  fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
    on_transport!(self, s => s.poll_flush(cx))
  }

  fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
    on_transport!(self, s => s.poll_shutdown(cx))
  }
}
