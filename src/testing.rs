//! Test doubles shared by the unit tests.

use async_trait::async_trait;
use color_eyre::{eyre::eyre, Result};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use url::Url;

use crate::cache::{CachedResponse, RequestKey, ResponseStore};
use crate::net::{Delivery, Fetcher, Request, Response};
use crate::queue::{EntityKind, PendingRecord};

/// Fetcher answering from a fixed table; any other URL is a network failure.
#[derive(Default)]
pub struct ScriptedFetcher {
  responses: HashMap<Url, Response>,
  /// URLs whose request never completes
  hanging: HashSet<Url>,
  calls: AtomicUsize,
}

impl ScriptedFetcher {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn respond(mut self, url: Url, response: Response) -> Self {
    self.responses.insert(url, response);
    self
  }

  pub fn hang(mut self, url: Url) -> Self {
    self.hanging.insert(url);
    self
  }

  pub fn calls(&self) -> usize {
    self.calls.load(Ordering::SeqCst)
  }
}

#[async_trait]
impl Fetcher for ScriptedFetcher {
  async fn fetch(&self, request: &Request) -> Result<Response> {
    self.calls.fetch_add(1, Ordering::SeqCst);
    if self.hanging.contains(&request.url) {
      std::future::pending::<()>().await;
    }
    self
      .responses
      .get(&request.url)
      .cloned()
      .ok_or_else(|| eyre!("network unreachable: {}", request.url))
  }
}

/// Delivery that records what it acknowledged and rejects chosen ids.
#[derive(Default)]
pub struct RecordingDelivery {
  reject: HashSet<String>,
  delivered: Mutex<Vec<(EntityKind, String)>>,
}

impl RecordingDelivery {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn rejecting(ids: &[&str]) -> Self {
    Self {
      reject: ids.iter().map(|id| id.to_string()).collect(),
      ..Self::default()
    }
  }

  pub fn delivered(&self) -> Vec<(EntityKind, String)> {
    self.delivered.lock().unwrap().clone()
  }
}

#[async_trait]
impl Delivery for RecordingDelivery {
  async fn deliver(&self, kind: EntityKind, record: &PendingRecord) -> Result<()> {
    if self.reject.contains(&record.id) {
      return Err(eyre!("remote rejected {}", record.id));
    }
    self
      .delivered
      .lock()
      .unwrap()
      .push((kind, record.id.clone()));
    Ok(())
  }
}

/// Storage whose every operation fails.
pub struct FailingStorage;

impl ResponseStore for FailingStorage {
  fn get(&self, _partition: &str, _key: &RequestKey) -> Result<Option<CachedResponse>> {
    Err(eyre!("disk I/O error"))
  }

  fn match_any(&self, _key: &RequestKey) -> Result<Option<CachedResponse>> {
    Err(eyre!("disk I/O error"))
  }

  fn put(&self, _partition: &str, _key: &RequestKey, _response: &CachedResponse) -> Result<()> {
    Err(eyre!("disk I/O error"))
  }

  fn put_all(&self, _partition: &str, _entries: &[(RequestKey, CachedResponse)]) -> Result<()> {
    Err(eyre!("disk I/O error"))
  }

  fn keys(&self, _partition: &str) -> Result<Vec<RequestKey>> {
    Err(eyre!("disk I/O error"))
  }

  fn partitions(&self) -> Result<Vec<String>> {
    Err(eyre!("disk I/O error"))
  }

  fn delete_partition(&self, _partition: &str) -> Result<bool> {
    Err(eyre!("disk I/O error"))
  }

  fn activated_version(&self) -> Result<Option<u32>> {
    Err(eyre!("disk I/O error"))
  }

  fn set_activated_version(&self, _version: u32) -> Result<()> {
    Err(eyre!("disk I/O error"))
  }
}
