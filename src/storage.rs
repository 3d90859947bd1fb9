//! Persistence of captured traffic
//!
//! The proxy only talks to the [`Storage`] trait. [`MemoryStorage`] keeps
//! records as JSON payloads under `request_{id}` / `response_{id}` keys with
//! an atomic ID counter, the same layout a key-value store would use.
use crate::errors::{Error, Result};
use crate::record::{CapturedRequest, CapturedResponse};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::RwLock;

/// Where captured requests and responses go.
#[async_trait]
pub trait Storage: Send + Sync {
  /// Persist `request` under a fresh ID, set the ID on it and return it.
  ///
  /// IDs increase monotonically from 1 and are never reused.
  async fn save_request(&self, request: &mut CapturedRequest) -> Result<u64>;
  /// Persist `response` as the answer to request `id`.
  async fn save_response(&self, response: &mut CapturedResponse, id: u64) -> Result<()>;
  /// The request saved under `id`.
  async fn get_request(&self, id: u64) -> Result<CapturedRequest>;
  /// The response saved for request `id`.
  async fn get_response(&self, id: u64) -> Result<CapturedResponse>;
  /// Every request in ID order. One undecodable record fails the call.
  async fn list_requests(&self) -> Result<Vec<CapturedRequest>>;
}

/// In-process key-value storage.
#[derive(Debug, Default)]
pub struct MemoryStorage {
  last_id: AtomicU64,
  entries: RwLock<HashMap<String, String>>,
}

fn request_key(id: u64) -> String {
  format!("request_{}", id)
}

fn response_key(id: u64) -> String {
  format!("response_{}", id)
}

impl MemoryStorage {
  /// An empty store.
  pub fn new() -> Self {
    Self::default()
  }

  /// The highest ID handed out so far.
  pub fn last_id(&self) -> u64 {
    self.last_id.load(Ordering::SeqCst)
  }

  async fn put<T: serde::Serialize>(&self, key: String, value: &T) -> Result<()> {
    let payload = serde_json::to_string(value)
      .map_err(|e| Error::persistence(format!("encoding {}: {}", key, e)))?;
    self.entries.write().await.insert(key, payload);
    Ok(())
  }

  async fn fetch<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
    let entries = self.entries.read().await;
    match entries.get(key) {
      None => Ok(None),
      Some(payload) => serde_json::from_str(payload)
        .map(Some)
        .map_err(|e| Error::persistence(format!("decoding {}: {}", key, e))),
    }
  }

  #[cfg(test)]
  pub(crate) async fn put_raw(&self, key: &str, payload: &str) {
    self
      .entries
      .write()
      .await
      .insert(key.to_string(), payload.to_string());
  }
}

#[async_trait]
impl Storage for MemoryStorage {
  async fn save_request(&self, request: &mut CapturedRequest) -> Result<u64> {
    let id = self.last_id.fetch_add(1, Ordering::SeqCst) + 1;
    request.id = Some(id);
    self.put(request_key(id), request).await?;
    Ok(id)
  }

  async fn save_response(&self, response: &mut CapturedResponse, id: u64) -> Result<()> {
    if !self.entries.read().await.contains_key(&request_key(id)) {
      return Err(Error::not_found(format!("request {}", id)));
    }
    response.id = Some(id);
    self.put(response_key(id), response).await
  }

  async fn get_request(&self, id: u64) -> Result<CapturedRequest> {
    self
      .fetch(&request_key(id))
      .await?
      .ok_or_else(|| Error::not_found(format!("request {}", id)))
  }

  async fn get_response(&self, id: u64) -> Result<CapturedResponse> {
    self
      .fetch(&response_key(id))
      .await?
      .ok_or_else(|| Error::not_found(format!("response {}", id)))
  }

  async fn list_requests(&self) -> Result<Vec<CapturedRequest>> {
    let mut requests = Vec::new();
    for id in 1..=self.last_id() {
      // an ID may be allocated before its payload lands
      if let Some(request) = self.fetch(&request_key(id)).await? {
        requests.push(request);
      }
    }
    Ok(requests)
  }
}
