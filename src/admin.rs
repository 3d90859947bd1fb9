//! Administrative HTTP API over captured traffic
//!
//! | route | action |
//! |---|---|
//! | `GET /api/requests` | list all captured requests |
//! | `GET /api/requests/{id}` | one request |
//! | `GET /api/responses/{id}` | one response |
//! | `GET /api/repeat/{id}` | send a captured request again |
//! | `GET /api/scan/{id}` | not implemented |
//! | `GET /api/ca` | root certificate PEM |
use crate::ca::CertificateAuthority;
use crate::client::OriginClient;
use crate::errors::{Error, Result};
use crate::record::{CapturedRequest, CapturedResponse};
use crate::server::simple_response;
use crate::storage::Storage;
use crate::wire;
use http::{Method, StatusCode};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};

const JSON: &str = "application/json";
const PEM: &str = "application/x-pem-file";

/// The operations behind the admin routes.
#[derive(Clone)]
pub struct AdminApi {
  storage: Arc<dyn Storage>,
  client: OriginClient,
  ca: Arc<CertificateAuthority>,
}

/// A routed answer: status, content type, body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdminResponse {
  /// status code
  pub status: StatusCode,
  /// `Content-Type`
  pub content_type: &'static str,
  /// body bytes
  pub body: Vec<u8>,
}

impl AdminResponse {
  fn json<T: serde::Serialize>(value: &T) -> Self {
    match serde_json::to_vec(value) {
      Ok(body) => AdminResponse {
        status: StatusCode::OK,
        content_type: JSON,
        body,
      },
      Err(e) => Self::error(&Error::from(e)),
    }
  }

  fn error(error: &Error) -> Self {
    Self::message(status_for(error), &error.to_string())
  }

  fn message(status: StatusCode, message: &str) -> Self {
    AdminResponse {
      status,
      content_type: JSON,
      body: serde_json::json!({ "error": message }).to_string().into_bytes(),
    }
  }
}

/// HTTP status for an API error.
pub fn status_for(error: &Error) -> StatusCode {
  match error {
    Error::NotFound(_) => StatusCode::NOT_FOUND,
    Error::Unimplemented(_) => StatusCode::NOT_IMPLEMENTED,
    _ => StatusCode::INTERNAL_SERVER_ERROR,
  }
}

impl AdminApi {
  /// Create the API over `storage`, replaying through `client`.
  pub fn new(
    storage: Arc<dyn Storage>,
    client: OriginClient,
    ca: Arc<CertificateAuthority>,
  ) -> Self {
    AdminApi {
      storage,
      client,
      ca,
    }
  }

  /// Every captured request.
  pub async fn list_requests(&self) -> Result<Vec<CapturedRequest>> {
    self.storage.list_requests().await
  }

  /// One captured request.
  pub async fn get_request(&self, id: u64) -> Result<CapturedRequest> {
    self.storage.get_request(id).await
  }

  /// The response captured for request `id`.
  pub async fn get_response(&self, id: u64) -> Result<CapturedResponse> {
    self.storage.get_response(id).await
  }

  /// Send request `id` again and return what the origin answers now.
  /// The fresh exchange is not stored.
  pub async fn repeat(&self, id: u64) -> Result<CapturedResponse> {
    let request = self.storage.get_request(id).await?;
    let response = self.client.send(&request).await?;
    response.capture()
  }

  /// Active scanning of a captured request.
  pub async fn scan(&self, id: u64) -> Result<CapturedResponse> {
    Err(Error::Unimplemented(format!("scan of request {}", id)))
  }

  /// The root certificate clients need to trust.
  pub fn ca_pem(&self) -> String {
    self.ca.root_pem().to_string()
  }

  /// Dispatch one API call.
  pub async fn route(&self, method: &Method, target: &str) -> AdminResponse {
    if method != Method::GET {
      return AdminResponse::message(StatusCode::METHOD_NOT_ALLOWED, "only GET is supported");
    }
    let path = target.split('?').next().unwrap_or_default();
    let segments: Vec<&str> = path.trim_matches('/').split('/').collect();
    match segments.as_slice() {
      ["api", "requests"] => respond(self.list_requests().await),
      ["api", "ca"] => AdminResponse {
        status: StatusCode::OK,
        content_type: PEM,
        body: self.ca_pem().into_bytes(),
      },
      ["api", action, id] => {
        let Ok(id) = id.parse::<u64>() else {
          return AdminResponse::message(StatusCode::BAD_REQUEST, "id must be a number");
        };
        match *action {
          "requests" => respond(self.get_request(id).await),
          "responses" => respond(self.get_response(id).await),
          "repeat" => respond(self.repeat(id).await),
          "scan" => respond(self.scan(id).await),
          _ => AdminResponse::message(StatusCode::NOT_FOUND, "no such route"),
        }
      }
      _ => AdminResponse::message(StatusCode::NOT_FOUND, "no such route"),
    }
  }
}

fn respond<T: serde::Serialize>(result: Result<T>) -> AdminResponse {
  match result {
    Ok(value) => AdminResponse::json(&value),
    Err(e) => AdminResponse::error(&e),
  }
}

/// Serves [`AdminApi`] over HTTP/1.1, one request per connection.
#[derive(Clone)]
pub struct AdminServer {
  api: AdminApi,
  read_timeout: Duration,
}

impl AdminServer {
  /// Create the listener for `api`.
  pub fn new(api: AdminApi, read_timeout: Duration) -> Self {
    AdminServer { api, read_timeout }
  }

  /// Bind `addr` and serve forever.
  pub async fn run(&self, addr: SocketAddr) -> Result<()> {
    let listener = TcpListener::bind(addr).await?;
    tracing::info!("admin API listening on {}", listener.local_addr()?);
    self.serve(listener).await
  }

  /// Serve connections from an already bound listener.
  pub async fn serve(&self, listener: TcpListener) -> Result<()> {
    loop {
      match listener.accept().await {
        Ok((stream, peer_addr)) => {
          let server = self.clone();
          tokio::spawn(async move {
            if let Err(e) = server.handle_connection(stream).await {
              tracing::debug!("[{}] admin connection: {}", peer_addr, e);
            }
          });
        }
        Err(e) => tracing::error!("admin accept: {}", e),
      }
    }
  }

  async fn handle_connection(&self, stream: TcpStream) -> Result<()> {
    let mut reader = BufReader::new(stream);
    let request = tokio::time::timeout(self.read_timeout, wire::read_request(&mut reader)).await;
    let response = match request {
      Ok(Ok(request)) => {
        let response = self.api.route(&request.method, &request.target).await;
        tracing::debug!("admin {} {} -> {}", request.method, request.target, response.status);
        response
      }
      Ok(Err(e)) => AdminResponse::message(StatusCode::BAD_REQUEST, &e.to_string()),
      Err(e) => return Err(Error::from(e)),
    };
    let bytes = simple_response(
      response.status,
      response.content_type,
      &response.body,
      true,
    );
    let stream = reader.get_mut();
    stream.write_all(&bytes).await?;
    stream.shutdown().await?;
    Ok(())
  }
}
