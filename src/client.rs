//! Forwards captured plain-path requests to their origin
use crate::cookies;
use crate::errors::Result;
use crate::record::{CapturedRequest, CapturedResponse};
use crate::tls::TlsResolver;
use crate::wire::{self, RawResponse};
use crate::{COLON_SPACE, CR_LF, SPACE};
use http::header::{CONNECTION, CONTENT_LENGTH, COOKIE, HOST, TRANSFER_ENCODING};
use http::{HeaderMap, HeaderValue, Method};
use tokio::io::BufReader;

/// Hop-by-hop headers the proxy rewrites on the way back to its client.
const KEEP_ALIVE: &str = "keep-alive";

/// Sends captured requests to their origin.
///
/// One connection per request, redirects are never followed. `https`
/// requests get a fresh TLS client configuration every time.
#[derive(Clone, Debug)]
pub struct OriginClient {
  resolver: TlsResolver,
}

/// What the origin answered, framing removed but otherwise untouched.
#[derive(Debug, Clone)]
pub struct OriginResponse {
  /// the method of the request this answers
  pub method: Method,
  /// the response as read
  pub raw: RawResponse,
}

impl OriginClient {
  /// A client dialing through `resolver`.
  pub fn new(resolver: TlsResolver) -> Self {
    OriginClient { resolver }
  }

  /// Send `request` to `scheme://host:port` and read the whole response.
  pub async fn send(&self, request: &CapturedRequest) -> Result<OriginResponse> {
    let port = request.port_u16()?;
    let mut socket = self.resolver.connector().connect(&request.host, port).await?;
    if request.scheme == "https" {
      socket = self.resolver.upgrade_origin(socket, &request.host).await?;
    }
    tracing::debug!("{} {}", request.method, request.url());
    socket.write_all(&outbound_bytes(request)).await?;
    socket.flush().await?;
    let read_timeout = socket.read_timeout();
    let mut reader = BufReader::new(socket);
    let read = wire::read_response(&mut reader, &request.method);
    let raw = match read_timeout {
      None => read.await?,
      Some(t) => tokio::time::timeout(t, read).await??,
    };
    Ok(OriginResponse {
      method: request.method.clone(),
      raw,
    })
  }
}

impl OriginResponse {
  /// Whether the origin asked to close the connection.
  pub fn wants_close(&self) -> bool {
    connection_close(&self.raw.headers)
  }

  /// The response as it is written back to the proxy's client: body as
  /// received, `Content-Length` recomputed, connection headers replaced.
  pub fn to_client_bytes(&self, close: bool) -> Vec<u8> {
    let mut headers = self.raw.headers.clone();
    let chunked = headers.remove(TRANSFER_ENCODING).is_some();
    headers.remove(CONNECTION);
    headers.remove(KEEP_ALIVE);
    // a HEAD answer keeps the length the origin declared
    if chunked || !(self.method == Method::HEAD && headers.contains_key(CONTENT_LENGTH)) {
      headers.insert(CONTENT_LENGTH, HeaderValue::from(self.raw.body.len()));
    }
    if close {
      headers.insert(CONNECTION, HeaderValue::from_static("close"));
    }
    wire::serialize_response(
      self.raw.version,
      self.raw.status,
      &self.raw.reason,
      &headers,
      &self.raw.body,
    )
  }

  /// Canonicalize for storage.
  pub fn capture(&self) -> Result<CapturedResponse> {
    CapturedResponse::from_raw(self.raw.clone())
  }
}

/// Whether a `Connection` header asks for `close`.
pub(crate) fn connection_close(headers: &HeaderMap) -> bool {
  headers
    .get_all(CONNECTION)
    .iter()
    .filter_map(|v| v.to_str().ok())
    .flat_map(|v| v.split(','))
    .any(|v| v.trim().eq_ignore_ascii_case("close"))
}

/// Origin-form request bytes: original headers, regenerated `Cookie`,
/// recomputed length, body from the POST parameters when there are any.
fn outbound_bytes(request: &CapturedRequest) -> Vec<u8> {
  let body = request.outbound_body();
  let mut headers = request.headers.clone();
  headers.remove(COOKIE);
  headers.remove(CONTENT_LENGTH);
  headers.remove(TRANSFER_ENCODING);
  if let Some(cookie) = cookies::cookie_header(&request.cookies) {
    headers.insert(COOKIE, cookie);
  }
  if !body.is_empty()
    || request.method == Method::POST
    || request.method == Method::PUT
    || request.method == Method::PATCH
  {
    headers.insert(CONTENT_LENGTH, HeaderValue::from(body.len()));
  }
  if !headers.contains_key(HOST) {
    let default = crate::record::default_port(&request.scheme);
    let host = if request.port == default {
      request.host.clone()
    } else {
      request.authority()
    };
    if let Ok(host) = HeaderValue::from_str(&host) {
      headers.insert(HOST, host);
    }
  }
  let mut http_requests = Vec::new();
  http_requests.extend(request.method.as_str().as_bytes());
  http_requests.extend(SPACE);
  http_requests.extend(request.outbound_target().as_bytes());
  http_requests.extend(SPACE);
  http_requests.extend(b"HTTP/1.1");
  http_requests.extend(CR_LF);
  for (k, v) in headers.iter() {
    http_requests.extend(k.as_str().as_bytes());
    http_requests.extend(COLON_SPACE);
    http_requests.extend(v.as_bytes());
    http_requests.extend(CR_LF);
  }
  http_requests.extend(CR_LF);
  http_requests.extend(&body[..]);
  http_requests
}

impl std::fmt::Display for OriginResponse {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(f, "{} {}", self.raw.status.as_u16(), self.raw.reason)
  }
}
