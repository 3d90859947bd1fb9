//! Proxy listener
//!
//! One task per client connection. A `CONNECT` hands the connection to the
//! [`TunnelInterceptor`]; anything else is forwarded by the [`OriginClient`]
//! and recorded, and the connection is kept for the next request.
use crate::client::{connection_close, OriginClient};
use crate::errors::{Error, Result};
use crate::record::CapturedRequest;
use crate::storage::Storage;
use crate::tls::Target;
use crate::tunnel::TunnelInterceptor;
use crate::wire::{self, RawRequest};
use http::header::{CONNECTION, CONTENT_LENGTH, CONTENT_TYPE};
use http::{HeaderMap, HeaderValue, Method, StatusCode, Version};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};

/// Accepts proxy clients.
#[derive(Clone)]
pub struct ProxyServer {
  client: OriginClient,
  tunnels: TunnelInterceptor,
  storage: Arc<dyn Storage>,
  read_timeout: Duration,
}

impl ProxyServer {
  /// Create a new proxy server
  pub fn new(
    client: OriginClient,
    tunnels: TunnelInterceptor,
    storage: Arc<dyn Storage>,
    read_timeout: Duration,
  ) -> Self {
    ProxyServer {
      client,
      tunnels,
      storage,
      read_timeout,
    }
  }

  /// Bind `addr` and serve forever.
  pub async fn run(&self, addr: SocketAddr) -> Result<()> {
    let listener = TcpListener::bind(addr).await?;
    tracing::info!("proxy listening on {}", listener.local_addr()?);
    self.serve(listener).await
  }

  /// Serve connections from an already bound listener.
  pub async fn serve(&self, listener: TcpListener) -> Result<()> {
    loop {
      match listener.accept().await {
        Ok((stream, peer_addr)) => {
          let server = self.clone();
          tokio::spawn(async move {
            if let Err(e) = server.handle_connection(stream, peer_addr).await {
              tracing::debug!("[{}] connection ended: {}", peer_addr, e);
            }
          });
        }
        Err(e) => {
          tracing::error!("failed to accept connection: {}", e);
        }
      }
    }
  }

  /// Handle a client connection
  async fn handle_connection(&self, stream: TcpStream, peer_addr: SocketAddr) -> Result<()> {
    let mut reader = BufReader::new(stream);
    loop {
      let head = match tokio::time::timeout(self.read_timeout, wire::read_request_head(&mut reader))
        .await
      {
        Err(_) => {
          tracing::debug!("[{}] idle client", peer_addr);
          return Ok(());
        }
        Ok(Ok(None)) => return Ok(()),
        Ok(Ok(Some(head))) => head,
        Ok(Err(e)) => {
          write_simple(&mut reader, StatusCode::BAD_REQUEST, "Malformed request").await?;
          return Err(e);
        }
      };
      let (method, target, version, headers) = head;

      if method == Method::CONNECT {
        let target = match Target::parse(&target) {
          Ok(target) => target,
          Err(e) => {
            write_simple(&mut reader, StatusCode::BAD_REQUEST, "Malformed CONNECT target").await?;
            return Err(e);
          }
        };
        // bytes the client sent ahead of the 200 stay in the reader's buffer
        self.tunnels.intercept(reader, target).await?;
        return Ok(());
      }

      let body = match tokio::time::timeout(
        self.read_timeout,
        wire::read_request_body(&mut reader, &headers),
      )
      .await
      {
        Ok(body) => body,
        Err(e) => Err(Error::from(e)),
      };
      let body = match body {
        Ok(body) => body,
        Err(e) => {
          write_simple(&mut reader, StatusCode::BAD_REQUEST, "Malformed request body").await?;
          return Err(e);
        }
      };
      let close = version != Version::HTTP_11 || connection_close(&headers);
      let raw = RawRequest {
        method,
        target,
        version,
        headers,
        body,
      };
      let close = self.forward(&mut reader, raw, close, peer_addr).await? || close;
      if close {
        reader.get_mut().shutdown().await?;
        return Ok(());
      }
    }
  }

  /// Forward one plain request and record it. Returns whether the client
  /// connection must be closed afterwards.
  async fn forward(
    &self,
    reader: &mut BufReader<TcpStream>,
    raw: RawRequest,
    close: bool,
    peer_addr: SocketAddr,
  ) -> Result<bool> {
    // the origin connection is gone after one response, but the client one is kept
    let request = match CapturedRequest::from_raw(raw, false) {
      Ok(request) => request,
      Err(e) => {
        tracing::debug!("[{}] unusable request: {}", peer_addr, e);
        write_simple(reader, StatusCode::BAD_REQUEST, "Malformed request").await?;
        return Ok(true);
      }
    };
    let response = match self.client.send(&request).await {
      Ok(response) => response,
      Err(e) => {
        tracing::warn!("[{}] {} {}: {}", peer_addr, request.method, request.url(), e);
        write_simple(
          reader,
          StatusCode::INTERNAL_SERVER_ERROR,
          "Failed to send request",
        )
        .await?;
        return Ok(true);
      }
    };
    let close = close || response.wants_close();
    reader
      .get_mut()
      .write_all(&response.to_client_bytes(close))
      .await?;
    reader.get_mut().flush().await?;
    tracing::info!("{} {} -> {}", request.method, request.url(), response);
    self.persist(request, &response).await;
    Ok(close)
  }

  async fn persist(&self, mut request: CapturedRequest, response: &crate::client::OriginResponse) {
    let mut captured = match response.capture() {
      Ok(captured) => captured,
      Err(e) => {
        tracing::error!("not recording {}: {}", request.url(), e);
        return;
      }
    };
    let id = match self.storage.save_request(&mut request).await {
      Ok(id) => id,
      Err(e) => {
        tracing::error!("saving request {}: {}", request.url(), e);
        return;
      }
    };
    if let Err(e) = self.storage.save_response(&mut captured, id).await {
      tracing::error!("saving response {}: {}", id, e);
    }
  }
}

/// Write a small text response that closes the exchange.
pub(crate) async fn write_simple(
  reader: &mut BufReader<TcpStream>,
  status: StatusCode,
  body: &str,
) -> Result<()> {
  let bytes = simple_response(status, "text/plain; charset=utf-8", body.as_bytes(), true);
  reader.get_mut().write_all(&bytes).await?;
  reader.get_mut().flush().await?;
  Ok(())
}

pub(crate) fn simple_response(
  status: StatusCode,
  content_type: &'static str,
  body: &[u8],
  close: bool,
) -> Vec<u8> {
  let mut headers = HeaderMap::new();
  headers.insert(CONTENT_TYPE, HeaderValue::from_static(content_type));
  headers.insert(CONTENT_LENGTH, HeaderValue::from(body.len()));
  if close {
    headers.insert(CONNECTION, HeaderValue::from_static("close"));
  }
  wire::serialize_response(
    Version::HTTP_11,
    status,
    status.canonical_reason().unwrap_or_default(),
    &headers,
    body,
  )
}
