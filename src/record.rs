//! Canonical request/response records
//!
//! Raw messages from [`crate::wire`] are turned into records that can be
//! stored as JSON, listed and sent again.

use crate::body::Body;
use crate::cookies::{self, CapturedCookie};
use crate::errors::{Error, Result};
use crate::wire::{RawRequest, RawResponse};
use crate::{COLON_SPACE, CR_LF, SPACE};
use bytes::Bytes;
use encoding_rs::{Encoding, UTF_8};
use flate2::read::MultiGzDecoder;
use http::header::{CONTENT_ENCODING, CONTENT_TYPE, HOST};
use http::{HeaderMap, Method, StatusCode};
use mime::Mime;
use std::collections::BTreeMap;
use std::io::Read;

/// Multi-valued parameters, keyed by name.
pub type Params = BTreeMap<String, Vec<String>>;

const PROXY_CONNECTION: &str = "proxy-connection";

/// A request as intercepted, split into its parts.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct CapturedRequest {
  /// ID assigned by storage
  pub id: Option<u64>,
  /// protocol version, `HTTP/1.1`
  pub proto: String,
  /// request method
  #[serde(with = "http_serde::method")]
  pub method: Method,
  /// `http` or `https`
  pub scheme: String,
  /// host without port
  pub host: String,
  /// port as text
  pub port: String,
  /// path, still percent-encoded
  pub path: String,
  /// query string as received, without the `?`
  #[serde(default)]
  pub query: String,
  /// request headers, `Proxy-Connection` removed
  #[serde(with = "http_serde::header_map")]
  pub headers: HeaderMap,
  /// parameters of a form-encoded body
  pub post_params: Params,
  /// parameters of the query string
  pub get_params: Params,
  /// cookies from the `Cookie` headers
  pub cookies: Vec<CapturedCookie>,
  /// body bytes, de-framed
  pub body: Body,
}

impl CapturedRequest {
  /// Canonicalize a raw request. `tls` tells whether it arrived inside a
  /// TLS session.
  pub fn from_raw(raw: RawRequest, tls: bool) -> Result<Self> {
    let RawRequest {
      method,
      target,
      version,
      headers,
      body,
    } = raw;
    let target = RequestTarget::parse(&target, &method)?;
    let authority = match target.authority {
      Some(authority) => authority,
      None => headers
        .get(HOST)
        .and_then(|h| h.to_str().ok())
        .unwrap_or_default()
        .to_string(),
    };
    let (host, explicit_port) = split_authority(&authority);
    let scheme = match target.scheme {
      Some(scheme) => scheme,
      None if tls || explicit_port == Some("443") => "https".to_string(),
      None => "http".to_string(),
    };
    let port = explicit_port
      .map(str::to_string)
      .unwrap_or_else(|| default_port(&scheme).to_string());
    let host = host.to_string();

    let headers = without_proxy_connection(&headers);

    let get_params = parse_params(target.query.as_bytes());
    let post_params = if carries_form(&method, &headers) {
      parse_params(&body)
    } else {
      Params::new()
    };
    let cookies = cookies::parse_request_cookies(&headers);

    Ok(CapturedRequest {
      id: None,
      proto: format!("{:?}", version),
      method,
      scheme,
      host,
      port,
      path: target.path,
      query: target.query,
      headers,
      post_params,
      get_params,
      cookies,
      body: Body::from(body),
    })
  }

  /// `host:port`, bracketing IPv6 literals.
  pub fn authority(&self) -> String {
    if self.host.contains(':') {
      format!("[{}]:{}", self.host, self.port)
    } else {
      format!("{}:{}", self.host, self.port)
    }
  }

  /// Numeric port, if it is one.
  pub fn port_u16(&self) -> Result<u16> {
    self
      .port
      .parse::<u16>()
      .map_err(|_| Error::parse(format!("invalid port: {}", self.port)))
  }

  /// Query string rebuilt from the GET parameters.
  pub fn outbound_query(&self) -> String {
    encode_params(&self.get_params)
  }

  /// Path plus the rebuilt query, as sent upstream.
  pub fn outbound_target(&self) -> String {
    let path = if self.path.is_empty() { "/" } else { &self.path };
    let query = self.outbound_query();
    if query.is_empty() {
      path.to_string()
    } else {
      format!("{}?{}", path, query)
    }
  }

  /// `scheme://host:port/path?query`
  pub fn url(&self) -> String {
    format!("{}://{}{}", self.scheme, self.authority(), self.outbound_target())
  }

  /// Form-encoded POST parameters when present, else the raw body.
  pub fn outbound_body(&self) -> Bytes {
    if self.post_params.is_empty() {
      self.body.clone().into_bytes()
    } else {
      Bytes::from(encode_params(&self.post_params))
    }
  }

  /// Serialize back to HTTP/1.x bytes in origin-form.
  pub fn to_raw(&self) -> Bytes {
    let mut http_requests = Vec::new();
    http_requests.extend(self.method.as_str().as_bytes());
    http_requests.extend(SPACE);
    let path = if self.path.is_empty() { "/" } else { &self.path };
    http_requests.extend(path.as_bytes());
    if !self.query.is_empty() {
      http_requests.push(b'?');
      http_requests.extend(self.query.as_bytes());
    }
    http_requests.extend(SPACE);
    http_requests.extend(self.proto.as_bytes());
    http_requests.extend(CR_LF);
    for (k, v) in self.headers.iter() {
      http_requests.extend(k.as_str().as_bytes());
      http_requests.extend(COLON_SPACE);
      http_requests.extend(v.as_bytes());
      http_requests.extend(CR_LF);
    }
    http_requests.extend(CR_LF);
    http_requests.extend(self.body.as_bytes());
    Bytes::from(http_requests)
  }
}

/// A response as intercepted. The body is stored decompressed.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct CapturedResponse {
  /// ID of the paired request
  pub id: Option<u64>,
  /// status code
  #[serde(with = "http_serde::status_code")]
  pub status: StatusCode,
  /// status line without the version, `200 OK`
  pub status_line: String,
  /// protocol version, `HTTP/1.1`
  pub proto: String,
  /// response headers
  #[serde(with = "http_serde::header_map")]
  pub headers: HeaderMap,
  /// cookies from the `Set-Cookie` headers
  #[serde(default)]
  pub cookies: Vec<CapturedCookie>,
  /// decoded body bytes
  #[serde(rename = "raw_body")]
  pub body: Body,
  /// body as text
  #[serde(rename = "body")]
  pub text: String,
}

impl CapturedResponse {
  /// Canonicalize a raw response, undoing gzip content coding.
  pub fn from_raw(raw: RawResponse) -> Result<Self> {
    let RawResponse {
      version,
      status,
      reason,
      headers,
      body,
    } = raw;
    let body = if is_gzip(&headers) && !body.is_empty() {
      let mut gzip_body = Vec::new();
      MultiGzDecoder::new(&body[..])
        .read_to_end(&mut gzip_body)
        .map_err(|e| Error::decode(format!("corrupt gzip body: {}", e)))?;
      Bytes::from(gzip_body)
    } else {
      body
    };
    let text = decode_text(&headers, &body);
    let cookies = cookies::parse_response_cookies(&headers);
    Ok(CapturedResponse {
      id: None,
      status,
      status_line: format!("{} {}", status.as_u16(), reason),
      proto: format!("{:?}", version),
      headers,
      cookies,
      body: Body::from(body),
      text,
    })
  }
}

struct RequestTarget {
  scheme: Option<String>,
  authority: Option<String>,
  path: String,
  query: String,
}

impl RequestTarget {
  fn parse(target: &str, method: &Method) -> Result<Self> {
    let lower = target.get(..8).unwrap_or(target).to_ascii_lowercase();
    if lower.starts_with("http://") || lower.starts_with("https://") {
      let uri = target
        .parse::<http::Uri>()
        .map_err(|e| Error::parse(format!("invalid request target {}: {}", target, e)))?;
      let (path, query) = split_path_query(
        uri
          .path_and_query()
          .map(|pq| pq.as_str())
          .unwrap_or_default(),
      );
      return Ok(RequestTarget {
        scheme: uri.scheme_str().map(str::to_ascii_lowercase),
        authority: uri.authority().map(|a| a.as_str().to_string()),
        path,
        query,
      });
    }
    if method == Method::CONNECT {
      return Ok(RequestTarget {
        scheme: None,
        authority: Some(target.to_string()),
        path: String::new(),
        query: String::new(),
      });
    }
    let (path, query) = split_path_query(target);
    Ok(RequestTarget {
      scheme: None,
      authority: None,
      path,
      query,
    })
  }
}

fn split_path_query(pq: &str) -> (String, String) {
  // fragments never reach the server, drop any that slipped through
  let pq = pq.split('#').next().unwrap_or_default();
  match pq.split_once('?') {
    Some((path, query)) => (path.to_string(), query.to_string()),
    None => (pq.to_string(), String::new()),
  }
}

/// Split `host[:port]` once, keeping IPv6 literals intact.
pub(crate) fn split_authority(authority: &str) -> (&str, Option<&str>) {
  // userinfo is not part of the host
  let authority = authority.rsplit('@').next().unwrap_or(authority);
  if let Some(rest) = authority.strip_prefix('[') {
    if let Some((host, after)) = rest.split_once(']') {
      let port = after.strip_prefix(':').filter(|p| !p.is_empty());
      return (host, port);
    }
  }
  match authority.split_once(':') {
    Some((host, port)) if !port.is_empty() => (host, Some(port)),
    Some((host, _)) => (host, None),
    None => (authority, None),
  }
}

pub(crate) fn default_port(scheme: &str) -> &'static str {
  if scheme == "https" {
    "443"
  } else {
    "80"
  }
}

// HeaderMap::remove does not keep the order of the remaining headers
fn without_proxy_connection(headers: &HeaderMap) -> HeaderMap {
  let mut kept = HeaderMap::with_capacity(headers.len());
  for (k, v) in headers.iter() {
    if k != PROXY_CONNECTION {
      kept.append(k.clone(), v.clone());
    }
  }
  kept
}

fn carries_form(method: &Method, headers: &HeaderMap) -> bool {
  if !(method == Method::POST || method == Method::PUT || method == Method::PATCH) {
    return false;
  }
  headers
    .get(CONTENT_TYPE)
    .and_then(|value| value.to_str().ok())
    .and_then(|value| value.parse::<Mime>().ok())
    .is_some_and(|mime| mime.essence_str() == mime::APPLICATION_WWW_FORM_URLENCODED.essence_str())
}

fn parse_params(input: &[u8]) -> Params {
  let mut params = Params::new();
  for (k, v) in form_urlencoded::parse(input) {
    params.entry(k.into_owned()).or_default().push(v.into_owned());
  }
  params
}

fn encode_params(params: &Params) -> String {
  let mut serializer = form_urlencoded::Serializer::new(String::new());
  for (k, values) in params {
    for v in values {
      serializer.append_pair(k, v);
    }
  }
  serializer.finish()
}

fn is_gzip(headers: &HeaderMap) -> bool {
  headers
    .get_all(CONTENT_ENCODING)
    .iter()
    .filter_map(|value| value.to_str().ok())
    .flat_map(|value| value.split(','))
    .any(|coding| {
      let coding = coding.trim();
      coding.eq_ignore_ascii_case("gzip") || coding.eq_ignore_ascii_case("x-gzip")
    })
}

/// Best-effort text: charset from `Content-Type`, UTF-8 otherwise, lossy.
fn decode_text(headers: &HeaderMap, body: &[u8]) -> String {
  let content_type = headers
    .get(CONTENT_TYPE)
    .and_then(|value| value.to_str().ok())
    .and_then(|value| value.parse::<Mime>().ok());
  let encoding = content_type
    .as_ref()
    .and_then(|mime| mime.get_param("charset"))
    .and_then(|charset| Encoding::for_label(charset.as_str().as_bytes()))
    .unwrap_or(UTF_8);
  let (text, _, _) = encoding.decode(body);
  text.into_owned()
}
