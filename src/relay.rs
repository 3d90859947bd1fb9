//! One-directional byte relay that keeps a copy of everything it forwards.
//!
//! A tunnel runs two of these, one per direction, each with its own
//! [`CaptureBuffer`].
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;

/// Size of a single relay read.
pub const RELAY_CHUNK_SIZE: usize = 10 * 1024;

/// Growable byte accumulator shared between a relay task and its owner.
///
/// Every append and the final read go through the same lock.
#[derive(Debug, Clone, Default)]
pub struct CaptureBuffer {
  inner: Arc<Mutex<Vec<u8>>>,
}

impl CaptureBuffer {
  /// An empty buffer.
  pub fn new() -> Self {
    Self::default()
  }
  /// Append one chunk.
  pub async fn append(&self, chunk: &[u8]) {
    self.inner.lock().await.extend_from_slice(chunk);
  }
  /// Copy out everything captured so far.
  pub async fn contents(&self) -> Vec<u8> {
    self.inner.lock().await.clone()
  }
  /// Number of bytes captured so far.
  pub async fn len(&self) -> usize {
    self.inner.lock().await.len()
  }
  /// Whether nothing was captured yet.
  pub async fn is_empty(&self) -> bool {
    self.len().await == 0
  }
}

/// Why a relay stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayEnd {
  /// the source reached end of stream
  Eof,
  /// reading the source failed
  ReadError,
  /// writing the destination failed
  WriteError,
  /// a single read or write took longer than the idle timeout
  IdleTimeout,
}

/// Result of one finished relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelayOutcome {
  /// bytes forwarded (and captured)
  pub bytes: u64,
  /// why it stopped
  pub end: RelayEnd,
}

/// Copy `source` into `destination`, appending every chunk to `capture`
/// before it is written. The destination's write side is shut down when the
/// copy ends, whatever the reason.
pub async fn relay<R, W>(
  mut source: R,
  mut destination: W,
  capture: CaptureBuffer,
  idle_timeout: Duration,
) -> RelayOutcome
where
  R: AsyncRead + Unpin,
  W: AsyncWrite + Unpin,
{
  let mut buffer = vec![0u8; RELAY_CHUNK_SIZE];
  let mut bytes = 0u64;
  let end = loop {
    let n = match tokio::time::timeout(idle_timeout, source.read(&mut buffer)).await {
      Ok(Ok(0)) => break RelayEnd::Eof,
      Ok(Ok(n)) => n,
      Ok(Err(e)) => {
        tracing::debug!("relay read: {}", e);
        break RelayEnd::ReadError;
      }
      Err(_) => break RelayEnd::IdleTimeout,
    };
    capture.append(&buffer[..n]).await;
    match tokio::time::timeout(idle_timeout, destination.write_all(&buffer[..n])).await {
      Ok(Ok(())) => bytes += n as u64,
      Ok(Err(e)) => {
        tracing::warn!("relay write: {}", e);
        break RelayEnd::WriteError;
      }
      Err(_) => break RelayEnd::IdleTimeout,
    }
  };
  match tokio::time::timeout(idle_timeout, destination.shutdown()).await {
    Ok(Err(e)) => tracing::debug!("relay shutdown: {}", e),
    Err(_) => tracing::debug!("relay shutdown timed out"),
    Ok(Ok(())) => {}
  }
  RelayOutcome { bytes, end }
}
