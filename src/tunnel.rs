//! `CONNECT` tunnel interception
//!
//! A tunnel moves through [`TunnelState`] once: the client is told the
//! tunnel is up, both TLS sessions are established, plaintext is relayed
//! in both directions while being captured, and when both directions are
//! done the captures are parsed and stored as one request/response pair.
//!
//! Only the first request and response of a tunnel are recorded.
use crate::ca::CertificateAuthority;
use crate::errors::{Error, Result};
use crate::record::{CapturedRequest, CapturedResponse};
use crate::relay::{relay, CaptureBuffer, RelayOutcome};
use crate::storage::Storage;
use crate::tls::{Target, TlsResolver};
use crate::wire;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};

/// Written to the client once the origin is reachable.
pub const CONNECTION_ESTABLISHED: &[u8] = b"HTTP/1.1 200 Connection Established\r\n\r\n";
/// Written to the client when the origin cannot be reached.
pub const SERVICE_UNAVAILABLE: &[u8] =
  b"HTTP/1.1 503 Service Unavailable\r\ncontent-length: 0\r\nconnection: close\r\n\r\n";

/// Where a tunnel is in its life.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelState {
  /// `CONNECT` parsed
  Received,
  /// `200` written, TLS handshakes running
  ClientHandshaking,
  /// both TLS sessions are up
  OriginConnected,
  /// relay tasks running
  Relaying,
  /// both relays joined, captures being parsed
  Parsing,
  /// pair stored
  Persisted,
  /// gave up
  Failed,
}

impl fmt::Display for TunnelState {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    fmt::Debug::fmt(self, f)
  }
}

struct Tunnel {
  target: Target,
  state: TunnelState,
}

impl Tunnel {
  fn new(target: Target) -> Self {
    tracing::debug!("[{}] {}", target, TunnelState::Received);
    Tunnel {
      target,
      state: TunnelState::Received,
    }
  }

  fn transition(&mut self, next: TunnelState) {
    tracing::debug!("[{}] {} -> {}", self.target, self.state, next);
    self.state = next;
  }

  fn fail(&mut self, error: &Error) {
    tracing::warn!("[{}] failed while {}: {}", self.target, self.state, error);
    self.state = TunnelState::Failed;
  }
}

/// Intercepts `CONNECT` tunnels and records what goes through them.
#[derive(Clone)]
pub struct TunnelInterceptor {
  ca: Arc<CertificateAuthority>,
  storage: Arc<dyn Storage>,
  resolver: TlsResolver,
  idle_timeout: Duration,
}

impl fmt::Debug for TunnelInterceptor {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("TunnelInterceptor")
      .field("resolver", &self.resolver)
      .field("idle_timeout", &self.idle_timeout)
      .finish()
  }
}

impl TunnelInterceptor {
  /// `idle_timeout` bounds every single relay read and write.
  pub fn new(
    ca: Arc<CertificateAuthority>,
    storage: Arc<dyn Storage>,
    resolver: TlsResolver,
    idle_timeout: Duration,
  ) -> Self {
    TunnelInterceptor {
      ca,
      storage,
      resolver,
      idle_timeout,
    }
  }

  /// Take over `client`, whose `CONNECT` for `target` was just read.
  ///
  /// Returns the ID the captured pair was stored under.
  pub async fn intercept<IO>(&self, client: IO, target: Target) -> Result<u64>
  where
    IO: AsyncRead + AsyncWrite + Unpin + Send + 'static,
  {
    let mut tunnel = Tunnel::new(target);
    match self.run(&mut tunnel, client).await {
      Ok(id) => Ok(id),
      Err(e) => {
        tunnel.fail(&e);
        Err(e)
      }
    }
  }

  async fn run<IO>(&self, tunnel: &mut Tunnel, mut client: IO) -> Result<u64>
  where
    IO: AsyncRead + AsyncWrite + Unpin + Send + 'static,
  {
    let target = tunnel.target.clone();
    let origin_tcp = match self
      .resolver
      .connector()
      .connect(&target.host, target.port)
      .await
    {
      Ok(socket) => socket,
      Err(e) => {
        client.write_all(SERVICE_UNAVAILABLE).await?;
        client.shutdown().await?;
        return Err(Error::handshake(format!("origin {} unreachable: {}", target, e)));
      }
    };
    client.write_all(CONNECTION_ESTABLISHED).await?;
    client.flush().await?;
    tunnel.transition(TunnelState::ClientHandshaking);

    let resolved = self
      .resolver
      .accept(client, origin_tcp, &target, &self.ca)
      .await?;
    tunnel.transition(TunnelState::OriginConnected);

    let (client_read, client_write) = tokio::io::split(resolved.client);
    let (origin_read, origin_write) = tokio::io::split(resolved.origin);
    let request_capture = CaptureBuffer::new();
    let response_capture = CaptureBuffer::new();
    let upstream = tokio::spawn(relay(
      client_read,
      origin_write,
      request_capture.clone(),
      self.idle_timeout,
    ));
    let downstream = tokio::spawn(relay(
      origin_read,
      client_write,
      response_capture.clone(),
      self.idle_timeout,
    ));
    tunnel.transition(TunnelState::Relaying);
    let (upstream, downstream) = tokio::join!(upstream, downstream);
    log_outcome(&target, "client -> origin", upstream);
    log_outcome(&target, "origin -> client", downstream);
    tunnel.transition(TunnelState::Parsing);

    let request_bytes = request_capture.contents().await;
    let response_bytes = response_capture.contents().await;
    let raw_request = wire::read_request(&mut &request_bytes[..]).await?;
    let raw_response = wire::read_response(&mut &response_bytes[..], &raw_request.method).await?;
    let mut request = CapturedRequest::from_raw(raw_request, true)?;
    request.scheme = "https".to_string();
    request.port = target.port.to_string();
    if request.host.is_empty() {
      request.host = resolved.server_name;
    }
    let mut response = CapturedResponse::from_raw(raw_response)?;

    let id = self.storage.save_request(&mut request).await?;
    self.storage.save_response(&mut response, id).await?;
    tunnel.transition(TunnelState::Persisted);
    tracing::info!("[{}] {} {} -> {}", target, request.method, request.path, response.status_line);
    Ok(id)
  }
}

fn log_outcome(
  target: &Target,
  direction: &str,
  joined: std::result::Result<RelayOutcome, tokio::task::JoinError>,
) {
  match joined {
    Ok(outcome) => tracing::debug!(
      "[{}] {} relayed {} bytes, ended by {:?}",
      target,
      direction,
      outcome.bytes,
      outcome.end
    ),
    Err(e) => tracing::warn!("[{}] {} relay task failed: {}", target, direction, e),
  }
}
