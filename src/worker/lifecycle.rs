//! Install and activation of a worker version.

use color_eyre::{eyre::eyre, Result};
use futures::future::join_all;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use tracing::{error, info};
use url::Url;

use crate::cache::{CachedResponse, RequestKey, ResponseStore};
use crate::config::CacheConfig;
use crate::net::{Fetcher, Request};

use super::outbox::{Outbound, Outbox};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LifecycleState {
  /// Nothing attempted yet
  Parsed,
  Installing,
  /// Static partition is populated; waiting to activate
  Installed,
  Activating,
  /// Handling requests
  Active,
  /// Install failed; this version will never activate
  Redundant,
}

impl fmt::Display for LifecycleState {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let s = match self {
      Self::Parsed => "parsed",
      Self::Installing => "installing",
      Self::Installed => "installed",
      Self::Activating => "activating",
      Self::Active => "active",
      Self::Redundant => "redundant",
    };
    write!(f, "{}", s)
  }
}

pub struct LifecycleManager {
  storage: Arc<dyn ResponseStore>,
  fetcher: Arc<dyn Fetcher>,
  outbox: Outbox,
  origin: Url,
  cache: CacheConfig,
  state: LifecycleState,
  skip_waiting: bool,
}

impl LifecycleManager {
  pub fn new(
    storage: Arc<dyn ResponseStore>,
    fetcher: Arc<dyn Fetcher>,
    outbox: Outbox,
    origin: Url,
    cache: CacheConfig,
    skip_waiting: bool,
  ) -> Self {
    Self {
      storage,
      fetcher,
      outbox,
      origin,
      cache,
      state: LifecycleState::Parsed,
      skip_waiting,
    }
  }

  pub fn state(&self) -> LifecycleState {
    self.state
  }

  pub fn is_active(&self) -> bool {
    self.state == LifecycleState::Active
  }

  pub fn version_name(&self) -> String {
    self.cache.version_name()
  }

  /// Whether a successful install should activate without waiting.
  pub fn skips_waiting(&self) -> bool {
    self.skip_waiting
  }

  /// Request immediate activation. Returns true if the worker is installed and
  /// can activate right away.
  pub fn skip_waiting(&mut self) -> bool {
    self.skip_waiting = true;
    self.state == LifecycleState::Installed
  }

  /// Pick up where a previous run of this version left off.
  ///
  /// Active if this version was activated and its static partition is still
  /// present, installed if only the static partition exists, otherwise parsed.
  pub fn resume(&mut self) -> Result<LifecycleState> {
    if !self.storage.has_partition(&self.cache.static_tag())? {
      return Ok(self.state);
    }

    if self.storage.activated_version()? == Some(self.cache.version) {
      info!(version = %self.version_name(), "Resuming active worker");
      self.transition(LifecycleState::Active, None);
    } else {
      info!(version = %self.version_name(), "Found installed version awaiting activation");
      self.transition(LifecycleState::Installed, None);
    }
    Ok(self.state)
  }

  /// Pre-cache the asset manifest into the static partition.
  ///
  /// Every entry must fetch with a 2xx status, otherwise nothing is stored and
  /// this version becomes redundant.
  pub async fn install(&mut self) -> Result<()> {
    match self.state {
      LifecycleState::Parsed | LifecycleState::Redundant => {}
      other => return Err(eyre!("Cannot install from state {}", other)),
    }
    self.transition(LifecycleState::Installing, None);

    match self.precache().await {
      Ok(count) => {
        info!(version = %self.version_name(), assets = count, "Installed");
        self.transition(LifecycleState::Installed, None);
        Ok(())
      }
      Err(e) => {
        error!(version = %self.version_name(), error = %e, "Install failed");
        self.transition(LifecycleState::Redundant, Some(e.to_string()));
        Err(e)
      }
    }
  }

  async fn precache(&self) -> Result<usize> {
    let requests = self
      .cache
      .manifest
      .iter()
      .map(|entry| Request::resolve(None, entry, &self.origin))
      .collect::<Result<Vec<_>>>()?;

    let fetcher = &self.fetcher;
    let responses = join_all(requests.iter().map(|request| fetcher.fetch(request))).await;

    let mut entries = Vec::with_capacity(requests.len());
    for (request, response) in requests.iter().zip(responses) {
      let response =
        response.map_err(|e| eyre!("Failed to fetch manifest asset {}: {}", request.url, e))?;
      let cached = CachedResponse::from_response(&response).ok_or_else(|| {
        eyre!(
          "Manifest asset {} returned status {}",
          request.url,
          response.status
        )
      })?;
      entries.push((RequestKey::new(request.url.clone()), cached));
    }

    self.storage.put_all(&self.cache.static_tag(), &entries)?;
    Ok(entries.len())
  }

  /// Drop every partition that is not this version's, then take control.
  pub fn activate(&mut self) -> Result<Vec<String>> {
    if self.state != LifecycleState::Installed {
      return Err(eyre!("Cannot activate from state {}", self.state));
    }
    self.transition(LifecycleState::Activating, None);

    let static_tag = self.cache.static_tag();
    let dynamic_tag = self.cache.dynamic_tag();
    let result = self
      .storage
      .delete_partitions_except(&[static_tag.as_str(), dynamic_tag.as_str()])
      .and_then(|deleted| {
        self.storage.set_activated_version(self.cache.version)?;
        Ok(deleted)
      });

    match result {
      Ok(deleted) => {
        for partition in &deleted {
          info!(partition = %partition, "Deleted stale cache partition");
        }
        self.transition(LifecycleState::Active, None);
        self.outbox.send(Outbound::ClientsClaimed {
          version: self.version_name(),
        });
        Ok(deleted)
      }
      Err(e) => {
        error!(version = %self.version_name(), error = %e, "Activation failed");
        self.transition(LifecycleState::Installed, Some(e.to_string()));
        Err(e)
      }
    }
  }

  fn transition(&mut self, state: LifecycleState, error: Option<String>) {
    self.state = state;
    self.outbox.send(Outbound::Lifecycle {
      state,
      version: self.version_name(),
      error,
    });
  }
}
