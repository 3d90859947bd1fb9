use crate::errors::{new_io_error, Error, Result};
use crate::socket::Socket;
use socket2::Socket as RawSocket;
use socket2::{Domain, Protocol, Type};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpSocket;
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::rustls::ClientConfig;
use tokio_rustls::TlsConnector;

/// Options for dialing origins.
#[derive(Clone, Debug)]
pub struct ConnectorBuilder {
  read_timeout: Option<Duration>,
  write_timeout: Option<Duration>,
  connect_timeout: Option<Duration>,
  nodelay: bool,
  keepalive: bool,
}

impl Default for ConnectorBuilder {
  fn default() -> Self {
    Self {
      read_timeout: Some(Duration::from_secs(30)),
      write_timeout: Some(Duration::from_secs(30)),
      connect_timeout: Some(Duration::from_secs(10)),
      nodelay: false,
      keepalive: false,
    }
  }
}

impl ConnectorBuilder {
  /// `TCP_NODELAY` on origin sockets, off by default.
  pub fn nodelay(mut self, value: bool) -> ConnectorBuilder {
    self.nodelay = value;
    self
  }
  /// `SO_KEEPALIVE` on origin sockets, off by default.
  pub fn keepalive(mut self, value: bool) -> ConnectorBuilder {
    self.keepalive = value;
    self
  }
  /// Deadline for reading one whole response from the origin.
  ///
  /// Default is 30 seconds.
  pub fn read_timeout(mut self, timeout: Option<Duration>) -> ConnectorBuilder {
    self.read_timeout = timeout;
    self
  }
  /// Deadline for each write to the origin, 30 seconds by default.
  pub fn write_timeout(mut self, timeout: Option<Duration>) -> ConnectorBuilder {
    self.write_timeout = timeout;
    self
  }
  /// Deadline for resolving and connecting, and for the TLS handshake.
  /// 10 seconds by default.
  pub fn connect_timeout(mut self, timeout: Option<Duration>) -> ConnectorBuilder {
    self.connect_timeout = timeout;
    self
  }
  /// Freeze the options.
  pub fn build(&self) -> Connector {
    Connector {
      connect_timeout: self.connect_timeout,
      nodelay: self.nodelay,
      keepalive: self.keepalive,
      read_timeout: self.read_timeout,
      write_timeout: self.write_timeout,
    }
  }
}

/// Dials origins over TCP and optionally upgrades to TLS.
#[derive(Clone, Debug)]
pub struct Connector {
  connect_timeout: Option<Duration>,
  nodelay: bool,
  keepalive: bool,
  read_timeout: Option<Duration>,
  write_timeout: Option<Duration>,
}

impl Connector {
  /// Dial one address.
  pub async fn connect_with_addr<S: Into<SocketAddr>>(&self, addr: S) -> Result<Socket> {
    let addr = addr.into();
    let raw_socket = RawSocket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    raw_socket.set_nonblocking(true)?;
    let socket = TcpSocket::from_std_stream(raw_socket.into());
    if self.nodelay {
      socket.set_nodelay(self.nodelay)?;
    }
    if self.keepalive {
      socket.set_keepalive(self.keepalive)?;
    }
    let s = match self.connect_timeout {
      None => socket.connect(addr).await?,
      Some(timeout) => tokio::time::timeout(timeout, socket.connect(addr))
        .await
        .map_err(|x| new_io_error(std::io::ErrorKind::TimedOut, &x.to_string()))??,
    };
    Ok(Socket::new(s, self.read_timeout, self.write_timeout)?)
  }
  /// Resolve `host` and connect to the first address that answers.
  pub async fn connect(&self, host: &str, port: u16) -> Result<Socket> {
    let resolve = tokio::net::lookup_host((host, port));
    let addrs: Vec<SocketAddr> = match self.connect_timeout {
      None => resolve.await?.collect(),
      Some(timeout) => tokio::time::timeout(timeout, resolve)
        .await
        .map_err(|x| new_io_error(std::io::ErrorKind::TimedOut, &x.to_string()))??
        .collect(),
    };
    let mut last_error = None;
    for addr in addrs {
      match self.connect_with_addr(addr).await {
        Ok(socket) => return Ok(socket),
        Err(e) => {
          tracing::debug!("connect {} failed: {}", addr, e);
          last_error = Some(e);
        }
      }
    }
    Err(last_error.unwrap_or_else(|| {
      new_io_error(
        std::io::ErrorKind::NotFound,
        &format!("no address for {}", host),
      )
    }))
  }
  /// Run a TLS client handshake on `stream`, presenting `domain` as SNI.
  pub async fn upgrade_to_tls(
    &self,
    stream: Socket,
    domain: &str,
    config: Arc<ClientConfig>,
  ) -> Result<Socket> {
    let domain = ServerName::try_from(domain.to_owned())
      .map_err(|e| Error::handshake(format!("invalid server name {}: {}", domain, e)))?;
    let this = TlsConnector::from(config);
    let handshake = stream.upgrade(move |t| async move { this.connect(domain, t).await });
    let tls = match self.connect_timeout {
      None => handshake.await,
      Some(timeout) => tokio::time::timeout(timeout, handshake).await?,
    };
    tls.map_err(|e| Error::handshake(format!("origin handshake: {}", e)))
  }
}

impl Default for Connector {
  fn default() -> Self {
    ConnectorBuilder::default().build()
  }
}
