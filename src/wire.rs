//! HTTP/1.x message reader
//!
//! Parses exactly one request or response off any buffered async reader.
//! Used on live client and origin sockets as well as on the in-memory
//! capture buffers of a finished tunnel.

use crate::errors::{Error, Result};
use crate::{COLON_SPACE, CR_LF, SPACE};
use bytes::Bytes;
use http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode, Version};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt};

/// Upper bound for a start line plus headers.
const MAX_HEAD_SIZE: usize = 64 * 1024;
/// Upper bound for a de-framed body.
const MAX_BODY_SIZE: usize = 64 * 1024 * 1024;
/// Upper bound for a chunk-size line, extensions included.
const MAX_CHUNK_LINE: usize = 4 * 1024;

/// A request exactly as it came off the wire, with the body de-framed.
#[derive(Debug, Clone)]
pub struct RawRequest {
  /// request method
  pub method: Method,
  /// request target, origin-form (`/a?b`) or absolute-form (`http://h/a?b`)
  pub target: String,
  /// protocol version
  pub version: Version,
  /// headers in arrival order, duplicates kept
  pub headers: HeaderMap,
  /// body after `Content-Length` or chunked framing was removed
  pub body: Bytes,
}

/// A response exactly as it came off the wire, with the body de-framed but
/// still content-encoded.
#[derive(Debug, Clone)]
pub struct RawResponse {
  /// protocol version
  pub version: Version,
  /// status code
  pub status: StatusCode,
  /// reason phrase as sent by the origin
  pub reason: String,
  /// headers in arrival order, duplicates kept
  pub headers: HeaderMap,
  /// body after framing was removed
  pub body: Bytes,
}

/// How the body of a message is delimited.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Framing {
  Empty,
  Length(u64),
  Chunked,
  UntilEof,
}

/// Read the start line and headers of a request.
///
/// Returns `Ok(None)` when the stream ends before the first byte, which is
/// how a keep-alive client says goodbye.
pub async fn read_request_head<R>(
  reader: &mut R,
) -> Result<Option<(Method, String, Version, HeaderMap)>>
where
  R: AsyncBufRead + Unpin,
{
  let mut line = Vec::new();
  let mut consumed = 0;
  loop {
    line.clear();
    let n = read_line_capped(reader, &mut line, MAX_HEAD_SIZE - consumed).await?;
    if n == 0 {
      return Ok(None);
    }
    consumed += n;
    // tolerate stray CRLF between pipelined messages
    if line != CR_LF && line != b"\n" {
      break;
    }
  }
  let (method, target, version) = parse_request_line(&line)?;
  let headers = read_headers(reader, consumed).await?;
  Ok(Some((method, target, version, headers)))
}

/// Read one complete request.
pub async fn read_request<R>(reader: &mut R) -> Result<RawRequest>
where
  R: AsyncBufRead + Unpin,
{
  let (method, target, version, headers) = read_request_head(reader)
    .await?
    .ok_or_else(|| Error::parse("empty request stream"))?;
  let body = read_request_body(reader, &headers).await?;
  Ok(RawRequest {
    method,
    target,
    version,
    headers,
    body,
  })
}

/// Read the body of a request whose head was already consumed.
pub async fn read_request_body<R>(reader: &mut R, headers: &HeaderMap) -> Result<Bytes>
where
  R: AsyncBufRead + Unpin,
{
  // a request with neither Content-Length nor chunked coding has no body
  let framing = match framing_from_headers(headers)? {
    Framing::UntilEof => Framing::Empty,
    f => f,
  };
  read_body(reader, framing).await
}

/// Read one complete response to a request made with `method`.
pub async fn read_response<R>(reader: &mut R, method: &Method) -> Result<RawResponse>
where
  R: AsyncBufRead + Unpin,
{
  let mut line = Vec::new();
  if read_line_capped(reader, &mut line, MAX_HEAD_SIZE).await? == 0 {
    return Err(Error::parse("empty response stream"));
  }
  let (version, status, reason) = parse_status_line(&line)?;
  let headers = read_headers(reader, line.len()).await?;
  let framing = if method == Method::HEAD
    || status.is_informational()
    || status == StatusCode::NO_CONTENT
    || status == StatusCode::NOT_MODIFIED
  {
    Framing::Empty
  } else {
    framing_from_headers(&headers)?
  };
  let body = read_body(reader, framing).await?;
  Ok(RawResponse {
    version,
    status,
    reason,
    headers,
    body,
  })
}

fn parse_version(v: &[u8]) -> Result<Version> {
  match v {
    b"HTTP/0.9" => Ok(Version::HTTP_09),
    b"HTTP/1.0" => Ok(Version::HTTP_10),
    b"HTTP/1.1" => Ok(Version::HTTP_11),
    b"HTTP/2.0" | b"HTTP/2" => Ok(Version::HTTP_2),
    b"HTTP/3.0" | b"HTTP/3" => Ok(Version::HTTP_3),
    _ => Err(Error::parse(format!(
      "invalid http version: {}",
      v.escape_ascii()
    ))),
  }
}

fn parse_request_line(line: &[u8]) -> Result<(Method, String, Version)> {
  let line = trim_line(line);
  let mut parts = line.split(|b| b == &b' ').filter(|p| !p.is_empty());
  let (Some(method), Some(target), Some(version), None) =
    (parts.next(), parts.next(), parts.next(), parts.next())
  else {
    return Err(Error::parse(format!(
      "invalid request line: {}",
      line.escape_ascii()
    )));
  };
  let method =
    Method::from_bytes(method).map_err(|e| Error::parse(format!("invalid method: {}", e)))?;
  let target = std::str::from_utf8(target)
    .map_err(|_| Error::parse("request target is not utf-8"))?
    .to_string();
  Ok((method, target, parse_version(version)?))
}

fn parse_status_line(line: &[u8]) -> Result<(Version, StatusCode, String)> {
  let line = trim_line(line);
  let mut parts = line.splitn(3, |b| b == &b' ');
  let version = parse_version(parts.next().unwrap_or_default())?;
  let status = parts
    .next()
    .ok_or_else(|| Error::parse("missing status code"))
    .and_then(|code| {
      StatusCode::from_bytes(code).map_err(|e| Error::parse(format!("invalid status code: {}", e)))
    })?;
  let reason = parts
    .next()
    .map(|r| String::from_utf8_lossy(r).trim().to_string())
    .filter(|r| !r.is_empty())
    .unwrap_or_else(|| status.canonical_reason().unwrap_or_default().to_string());
  Ok((version, status, reason))
}

async fn read_headers<R>(reader: &mut R, mut consumed: usize) -> Result<HeaderMap>
where
  R: AsyncBufRead + Unpin,
{
  let mut headers = HeaderMap::new();
  let mut header_line = Vec::new();
  loop {
    header_line.clear();
    let length = read_line_capped(reader, &mut header_line, MAX_HEAD_SIZE - consumed).await?;
    if length == 0 {
      return Err(Error::parse("headers ended early"));
    }
    consumed += length;
    if header_line == CR_LF || header_line == b"\n" {
      break;
    }
    let (k, v) = parser_headers(&header_line)?;
    headers.append(k, v);
  }
  Ok(headers)
}

/// `read_until` a newline, reading at most `limit` bytes.
async fn read_line_capped<R>(reader: &mut R, line: &mut Vec<u8>, limit: usize) -> Result<usize>
where
  R: AsyncBufRead + Unpin,
{
  let n = (&mut *reader)
    .take(limit as u64)
    .read_until(b'\n', line)
    .await?;
  if n == limit && !line.ends_with(b"\n") {
    return Err(Error::parse(format!(
      "line exceeds the {} bytes left for it",
      limit
    )));
  }
  Ok(n)
}

pub(crate) fn parser_headers(buffer: &[u8]) -> Result<(HeaderName, HeaderValue)> {
  let buffer = trim_line(buffer);
  let mut split = buffer.splitn(2, |s| s == &b':');
  let name = split.next().unwrap_or_default();
  let value = split
    .next()
    .ok_or_else(|| Error::parse(format!("header without colon: {}", buffer.escape_ascii())))?;
  let name = HeaderName::from_bytes(name.trim_ascii())?;
  let value = HeaderValue::from_bytes(value.trim_ascii())?;
  Ok((name, value))
}

fn framing_from_headers(headers: &HeaderMap) -> Result<Framing> {
  let chunked = headers
    .get_all(http::header::TRANSFER_ENCODING)
    .iter()
    .filter_map(|te| te.to_str().ok())
    .flat_map(|te| te.split(','))
    .any(|te| te.trim().eq_ignore_ascii_case("chunked"));
  if chunked {
    return Ok(Framing::Chunked);
  }
  match headers.get(http::header::CONTENT_LENGTH) {
    Some(cl) => {
      let length = cl
        .to_str()
        .ok()
        .and_then(|cl| cl.trim().parse::<u64>().ok())
        .ok_or_else(|| Error::parse("invalid content-length"))?;
      Ok(if length == 0 {
        Framing::Empty
      } else {
        Framing::Length(length)
      })
    }
    None => Ok(Framing::UntilEof),
  }
}

async fn read_body<R>(reader: &mut R, framing: Framing) -> Result<Bytes>
where
  R: AsyncBufRead + Unpin,
{
  let mut body = Vec::new();
  match framing {
    Framing::Empty => {}
    Framing::Length(length) => {
      if length > MAX_BODY_SIZE as u64 {
        return Err(Error::parse(format!("declared body of {} bytes is too large", length)));
      }
      (&mut *reader).take(length).read_to_end(&mut body).await?;
      if (body.len() as u64) < length {
        return Err(Error::parse(format!(
          "body ended after {} of {} declared bytes",
          body.len(),
          length
        )));
      }
    }
    Framing::Chunked => body = read_chunked_body(reader).await?,
    Framing::UntilEof => {
      (&mut *reader)
        .take(MAX_BODY_SIZE as u64 + 1)
        .read_to_end(&mut body)
        .await?;
      if body.len() > MAX_BODY_SIZE {
        return Err(Error::parse("body exceeds maximum allowed size"));
      }
    }
  }
  Ok(Bytes::from(body))
}

async fn read_chunked_body<R>(reader: &mut R) -> Result<Vec<u8>>
where
  R: AsyncBufRead + Unpin,
{
  let mut body: Vec<u8> = Vec::new();
  let mut line = Vec::new();
  loop {
    line.clear();
    if read_line_capped(reader, &mut line, MAX_CHUNK_LINE).await? == 0 {
      return Err(Error::parse("chunked body ended before last chunk"));
    }
    let size = trim_line(&line);
    // chunk extensions follow a ';'
    let size = size.split(|b| b == &b';').next().unwrap_or_default();
    let size = std::str::from_utf8(size.trim_ascii())
      .ok()
      .and_then(|s| u64::from_str_radix(s, 16).ok())
      .ok_or_else(|| Error::parse(format!("invalid chunk size: {}", line.escape_ascii())))?;
    if size == 0 {
      break;
    }
    if size > (MAX_BODY_SIZE - body.len()) as u64 {
      return Err(Error::parse(format!(
        "chunk of {} bytes takes the body past {} bytes",
        size, MAX_BODY_SIZE
      )));
    }
    let read = (&mut *reader).take(size).read_to_end(&mut body).await?;
    if (read as u64) < size {
      return Err(Error::parse(format!("chunk ended after {} of {} bytes", read, size)));
    }
    line.clear();
    read_line_capped(reader, &mut line, MAX_CHUNK_LINE).await?;
  }
  // trailers, up to the empty line
  let mut consumed = 0;
  loop {
    line.clear();
    let n = read_line_capped(reader, &mut line, MAX_HEAD_SIZE - consumed).await?;
    consumed += n;
    if n == 0 || line == CR_LF || line == b"\n" {
      break;
    }
  }
  Ok(body)
}

fn trim_line(line: &[u8]) -> &[u8] {
  let line = line.strip_suffix(b"\n").unwrap_or(line);
  line.strip_suffix(b"\r").unwrap_or(line)
}

/// Serialize a status line, headers and body.
pub(crate) fn serialize_response(
  version: Version,
  status: StatusCode,
  reason: &str,
  headers: &HeaderMap,
  body: &[u8],
) -> Vec<u8> {
  let mut http_response = Vec::new();
  http_response.extend(format!("{:?}", version).as_bytes());
  http_response.extend(SPACE);
  http_response.extend(status.as_str().as_bytes());
  http_response.extend(SPACE);
  http_response.extend(reason.as_bytes());
  http_response.extend(CR_LF);
  for (k, v) in headers.iter() {
    http_response.extend(k.as_str().as_bytes());
    http_response.extend(COLON_SPACE);
    http_response.extend(v.as_bytes());
    http_response.extend(CR_LF);
  }
  http_response.extend(CR_LF);
  http_response.extend(body);
  http_response
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::io::Cursor;
  use tokio::io::BufReader;

  fn reader(raw: &[u8]) -> BufReader<Cursor<Vec<u8>>> {
    BufReader::new(Cursor::new(raw.to_vec()))
  }

  #[tokio::test]
  async fn request_with_content_length() {
    let mut r = reader(b"POST /submit HTTP/1.1\r\nHost: a.test\r\nContent-Length: 5\r\n\r\nhelloEXTRA");
    let req = read_request(&mut r).await.unwrap();
    assert_eq!(req.method, Method::POST);
    assert_eq!(req.target, "/submit");
    assert_eq!(req.version, Version::HTTP_11);
    assert_eq!(req.headers["host"], "a.test");
    assert_eq!(&req.body[..], b"hello");
  }

  #[tokio::test]
  async fn request_without_length_has_empty_body() {
    let mut r = reader(b"GET / HTTP/1.1\r\nHost: a.test\r\n\r\ntrailing");
    let req = read_request(&mut r).await.unwrap();
    assert!(req.body.is_empty());
  }

  #[tokio::test]
  async fn duplicate_headers_are_kept() {
    let mut r = reader(b"GET / HTTP/1.1\r\nX-A: 1\r\nX-A: 2\r\n\r\n");
    let req = read_request(&mut r).await.unwrap();
    let values: Vec<_> = req.headers.get_all("x-a").iter().collect();
    assert_eq!(values, vec!["1", "2"]);
  }

  #[tokio::test]
  async fn chunked_response_is_dechunked() {
    let mut r = reader(
      b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n5;ext=1\r\nhello\r\n6\r\n world\r\n0\r\nX-Trailer: t\r\n\r\n",
    );
    let resp = read_response(&mut r, &Method::GET).await.unwrap();
    assert_eq!(resp.status, StatusCode::OK);
    assert_eq!(resp.reason, "OK");
    assert_eq!(&resp.body[..], b"hello world");
  }

  #[tokio::test]
  async fn response_without_length_reads_to_eof() {
    let mut r = reader(b"HTTP/1.0 200 Fine\r\nContent-Type: text/plain\r\n\r\nall of it");
    let resp = read_response(&mut r, &Method::GET).await.unwrap();
    assert_eq!(resp.version, Version::HTTP_10);
    assert_eq!(resp.reason, "Fine");
    assert_eq!(&resp.body[..], b"all of it");
  }

  #[tokio::test]
  async fn head_response_has_no_body() {
    let mut r = reader(b"HTTP/1.1 200 OK\r\nContent-Length: 10\r\n\r\n");
    let resp = read_response(&mut r, &Method::HEAD).await.unwrap();
    assert!(resp.body.is_empty());
  }

  #[tokio::test]
  async fn truncated_body_is_an_error() {
    let mut r = reader(b"HTTP/1.1 200 OK\r\nContent-Length: 10\r\n\r\nshort");
    let err = read_response(&mut r, &Method::GET).await.unwrap_err();
    assert!(matches!(err, Error::Parse(_)));
  }

  #[tokio::test]
  async fn garbage_is_rejected() {
    let mut r = reader(b"\x16\x03\x01 not http\r\n\r\n");
    assert!(read_request(&mut r).await.is_err());
    let mut r = reader(b"");
    assert!(read_request(&mut r).await.is_err());
  }

  #[tokio::test]
  async fn clean_eof_yields_no_head() {
    let mut r = reader(b"");
    assert!(read_request_head(&mut r).await.unwrap().is_none());
  }

  #[tokio::test]
  async fn huge_chunk_size_is_rejected() {
    for size in ["ffffffffffffffff", "fffffffffffff", "fffffffffffffffffff"] {
      let raw = format!(
        "POST / HTTP/1.1\r\nHost: a.test\r\nTransfer-Encoding: chunked\r\n\r\n{}\r\nabc\r\n0\r\n\r\n",
        size
      );
      let mut r = reader(raw.as_bytes());
      let err = read_request(&mut r).await.unwrap_err();
      assert!(matches!(err, Error::Parse(_)), "{}: {:?}", size, err);
    }
  }

  #[tokio::test]
  async fn short_chunk_is_an_error() {
    let mut r = reader(b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\na\r\nabc");
    let err = read_response(&mut r, &Method::GET).await.unwrap_err();
    assert!(matches!(err, Error::Parse(_)));
  }

  #[tokio::test]
  async fn oversized_request_line_is_rejected() {
    let mut raw = b"GET /".to_vec();
    raw.extend(std::iter::repeat(b'a').take(MAX_HEAD_SIZE + 1));
    raw.extend(b" HTTP/1.1\r\n\r\n");
    let mut r = reader(&raw);
    let err = read_request_head(&mut r).await.unwrap_err();
    assert!(matches!(err, Error::Parse(_)));
  }

  #[tokio::test]
  async fn oversized_header_line_is_rejected() {
    let mut raw = b"GET / HTTP/1.1\r\nX-Big: ".to_vec();
    raw.extend(std::iter::repeat(b'a').take(MAX_HEAD_SIZE));
    raw.extend(b"\r\n\r\n");
    let mut r = reader(&raw);
    let err = read_request_head(&mut r).await.unwrap_err();
    assert!(matches!(err, Error::Parse(_)));
  }

  #[tokio::test]
  async fn head_ending_early_is_an_error() {
    let mut r = reader(b"GET / HTTP/1.1\r\nHost: a.test\r\n");
    let err = read_request(&mut r).await.unwrap_err();
    assert!(matches!(err, Error::Parse(_)));
  }

  #[test]
  fn status_line_without_reason_uses_canonical() {
    let (_, status, reason) = parse_status_line(b"HTTP/1.1 404\r\n").unwrap();
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(reason, "Not Found");
  }
}
