use bytes::Bytes;
use http::header::{COOKIE, SET_COOKIE};
use http::{HeaderMap, HeaderValue};

/// One cookie as seen on the wire.
///
/// Request cookies only carry a name and a value; the attributes are filled
/// for cookies parsed out of `Set-Cookie`.
#[derive(Debug, Clone, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
pub struct CapturedCookie {
  /// cookie name
  pub name: String,
  /// cookie value, as sent
  pub value: String,
  /// `Path` attribute
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub path: Option<String>,
  /// `Domain` attribute
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub domain: Option<String>,
  /// `Max-Age` attribute in seconds
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub max_age: Option<i64>,
  /// `Secure` attribute
  #[serde(default)]
  pub secure: bool,
  /// `HttpOnly` attribute
  #[serde(default)]
  pub http_only: bool,
}

impl CapturedCookie {
  /// A bare name/value cookie.
  pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
    CapturedCookie {
      name: name.into(),
      value: value.into(),
      ..Default::default()
    }
  }
}

impl From<&cookie::Cookie<'_>> for CapturedCookie {
  fn from(c: &cookie::Cookie<'_>) -> Self {
    CapturedCookie {
      name: c.name().to_string(),
      value: c.value().to_string(),
      path: c.path().map(str::to_string),
      domain: c.domain().map(str::to_string),
      max_age: c.max_age().map(|d| d.whole_seconds()),
      secure: c.secure().unwrap_or(false),
      http_only: c.http_only().unwrap_or(false),
    }
  }
}

/// Every cookie carried by the `Cookie` headers of a request, in order.
///
/// Malformed pairs are skipped.
pub fn parse_request_cookies(headers: &HeaderMap) -> Vec<CapturedCookie> {
  headers
    .get_all(COOKIE)
    .iter()
    .filter_map(|value| value.to_str().ok())
    .flat_map(cookie::Cookie::split_parse)
    .filter_map(|c| c.ok())
    .map(|c| CapturedCookie::from(&c))
    .collect()
}

/// Every cookie set by the `Set-Cookie` headers of a response.
pub fn parse_response_cookies(headers: &HeaderMap) -> Vec<CapturedCookie> {
  headers
    .get_all(SET_COOKIE)
    .iter()
    .filter_map(|value| value.to_str().ok())
    .filter_map(|value| cookie::Cookie::parse(value).ok())
    .map(|c| CapturedCookie::from(&c))
    .collect()
}

/// Builds a single `Cookie` request header out of captured cookies.
pub fn cookie_header(cookies: &[CapturedCookie]) -> Option<HeaderValue> {
  let s = cookies
    .iter()
    .map(|c| format!("{}={}", c.name, c.value))
    .collect::<Vec<_>>()
    .join("; ");
  if s.is_empty() {
    return None;
  }
  HeaderValue::from_maybe_shared(Bytes::from(s)).ok()
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn request_cookies_keep_order_across_headers() {
    let mut headers = HeaderMap::new();
    headers.append(COOKIE, HeaderValue::from_static("a=b; c=d"));
    headers.append(COOKIE, HeaderValue::from_static("e=f"));
    let cookies = parse_request_cookies(&headers);
    let pairs: Vec<_> = cookies
      .iter()
      .map(|c| (c.name.as_str(), c.value.as_str()))
      .collect();
    assert_eq!(pairs, vec![("a", "b"), ("c", "d"), ("e", "f")]);
  }

  #[test]
  fn set_cookie_attributes_are_kept() {
    let mut headers = HeaderMap::new();
    headers.append(
      SET_COOKIE,
      HeaderValue::from_static("sid=42; Path=/app; Max-Age=60; Secure; HttpOnly"),
    );
    let cookies = parse_response_cookies(&headers);
    assert_eq!(cookies.len(), 1);
    let c = &cookies[0];
    assert_eq!(c.name, "sid");
    assert_eq!(c.path.as_deref(), Some("/app"));
    assert_eq!(c.max_age, Some(60));
    assert!(c.secure);
    assert!(c.http_only);
  }

  #[test]
  fn header_is_rebuilt_from_pairs() {
    let cookies = vec![CapturedCookie::new("a", "b"), CapturedCookie::new("c", "d")];
    assert_eq!(cookie_header(&cookies).unwrap(), "a=b; c=d");
    assert!(cookie_header(&[]).is_none());
  }
}
