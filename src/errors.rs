//! engine error
use std::io::ErrorKind;
use thiserror::Error as ThisError;
/// A `Result` alias where the `Err` case is `snare::Error`.
pub type Result<T> = std::result::Result<T, Error>;
/// The Errors that may occur while intercepting, recording or replaying traffic.
#[derive(ThisError, Debug)]
pub enum Error {
  /// File or network read/write failure
  #[error(transparent)]
  Io(#[from] std::io::Error),
  /// PEM, DER or gzip payload is malformed
  #[error("decode error: {0}")]
  Decode(String),
  /// Certificate or raw HTTP stream could not be parsed
  #[error("parse error: {0}")]
  Parse(String),
  /// TLS negotiation with the client or the origin failed
  #[error("handshake error: {0}")]
  Handshake(String),
  /// The storage collaborator failed
  #[error("persistence error: {0}")]
  Persistence(String),
  /// Lookup miss in storage
  #[error("not found: {0}")]
  NotFound(String),
  /// Key pair generation for a forged certificate failed
  #[error("key generation error: {0}")]
  KeyGen(String),
  /// Signing a forged certificate failed
  #[error("sign error: {0}")]
  Sign(String),
  /// A read or write did not finish in time
  #[error("timed out: {0}")]
  Timeout(String),
  /// http::Error
  #[error(transparent)]
  Http(http::Error),
  /// serde_json::Error
  #[error(transparent)]
  Json(#[from] serde_json::Error),
  /// The operation exists but does nothing yet
  #[error("not implemented: {0}")]
  Unimplemented(String),
}

impl Error {
  /// Create a decode error and log it
  pub fn decode(msg: impl Into<String>) -> Self {
    let error = Error::Decode(msg.into());
    tracing::error!("{}", error);
    error
  }

  /// Create a parse error and log it
  pub fn parse(msg: impl Into<String>) -> Self {
    let error = Error::Parse(msg.into());
    tracing::debug!("{}", error);
    error
  }

  /// Create a handshake error and log it
  pub fn handshake(msg: impl Into<String>) -> Self {
    let error = Error::Handshake(msg.into());
    tracing::error!("{}", error);
    error
  }

  /// Create a persistence error and log it
  pub fn persistence(msg: impl Into<String>) -> Self {
    let error = Error::Persistence(msg.into());
    tracing::error!("{}", error);
    error
  }

  /// Create a not found error
  pub fn not_found(msg: impl Into<String>) -> Self {
    Error::NotFound(msg.into())
  }

  /// Create a key generation error and log it
  pub fn key_gen(msg: impl Into<String>) -> Self {
    let error = Error::KeyGen(msg.into());
    tracing::error!("{}", error);
    error
  }

  /// Create a signing error and log it
  pub fn sign(msg: impl Into<String>) -> Self {
    let error = Error::Sign(msg.into());
    tracing::error!("{}", error);
    error
  }

  /// Whether this error is a lookup miss
  pub fn is_not_found(&self) -> bool {
    matches!(self, Error::NotFound(_))
  }
}

impl From<http::Error> for Error {
  fn from(value: http::Error) -> Self {
    Error::Http(value)
  }
}

impl From<http::header::InvalidHeaderValue> for Error {
  fn from(value: http::header::InvalidHeaderValue) -> Self {
    Error::Http(http::Error::from(value))
  }
}

impl From<http::header::InvalidHeaderName> for Error {
  fn from(value: http::header::InvalidHeaderName) -> Self {
    Error::Http(http::Error::from(value))
  }
}

impl From<tokio::time::error::Elapsed> for Error {
  fn from(value: tokio::time::error::Elapsed) -> Self {
    Error::Timeout(value.to_string())
  }
}

pub(crate) fn new_io_error(error_kind: ErrorKind, msg: &str) -> Error {
  Error::Io(std::io::Error::new(error_kind, msg))
}
