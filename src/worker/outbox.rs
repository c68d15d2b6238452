//! Everything the worker tells the outside world goes through the outbox.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tracing::debug;

use crate::cache::CacheSource;
use crate::net::BodyEncoding;

use super::lifecycle::LifecycleState;
use super::notify::Notification;
use super::sync::SyncReport;

/// Output produced by the worker, written one JSON object per line.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Outbound {
  /// Answer to an intercepted or passed-through fetch
  Response {
    #[serde(skip_serializing_if = "Option::is_none")]
    request_id: Option<String>,
    url: String,
    status: u16,
    status_text: String,
    /// None when the request bypassed interception
    #[serde(skip_serializing_if = "Option::is_none")]
    source: Option<CacheSource>,
    /// When the served copy was stored, for cached responses
    #[serde(skip_serializing_if = "Option::is_none")]
    cached_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    content_type: Option<String>,
    body: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    encoding: Option<BodyEncoding>,
  },
  /// A passed-through request that failed at the network
  FetchFailed {
    #[serde(skip_serializing_if = "Option::is_none")]
    request_id: Option<String>,
    url: String,
    error: String,
  },
  /// Reply to a message that asked for one
  Reply {
    #[serde(skip_serializing_if = "Option::is_none")]
    reply_to: Option<String>,
    body: Value,
  },
  ShowNotification {
    id: String,
    notification: Notification,
  },
  CloseNotification {
    id: String,
  },
  OpenWindow {
    url: String,
  },
  Lifecycle {
    state: LifecycleState,
    version: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
  },
  /// The worker now controls all open clients
  ClientsClaimed {
    version: String,
  },
  SyncCompleted {
    report: SyncReport,
  },
}

/// Notifications tracked as on screen; the oldest is forgotten beyond this.
const MAX_SHOWN: usize = 64;

/// Handle for emitting outputs; also tracks which notifications are on screen.
#[derive(Clone)]
pub struct Outbox {
  tx: mpsc::UnboundedSender<Outbound>,
  /// Displayed notifications by id, in display order
  shown: Arc<Mutex<Vec<(String, Notification)>>>,
  next_untagged: Arc<AtomicU64>,
}

impl Outbox {
  pub fn new() -> (Self, mpsc::UnboundedReceiver<Outbound>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let outbox = Self {
      tx,
      shown: Arc::new(Mutex::new(Vec::new())),
      next_untagged: Arc::new(AtomicU64::new(1)),
    };
    (outbox, rx)
  }

  pub fn send(&self, outbound: Outbound) {
    // Receiver is gone during shutdown
    if self.tx.send(outbound).is_err() {
      debug!("Output channel closed, dropping output");
    }
  }

  /// Show a notification. A notification with the same tag replaces the old one.
  pub fn notify(&self, notification: Notification) -> String {
    let id = match &notification.tag {
      Some(tag) => tag.clone(),
      None => format!(
        "untagged-{}",
        self.next_untagged.fetch_add(1, Ordering::Relaxed)
      ),
    };

    {
      let mut shown = self.shown.lock().unwrap_or_else(|e| e.into_inner());
      shown.retain(|(existing, _)| existing != &id);
      shown.push((id.clone(), notification.clone()));
      if shown.len() > MAX_SHOWN {
        let excess = shown.len() - MAX_SHOWN;
        shown.drain(..excess);
      }
    }

    self.send(Outbound::ShowNotification {
      id: id.clone(),
      notification,
    });
    id
  }

  /// Close one notification. Returns false if it was not showing.
  pub fn close_notification(&self, id: &str) -> bool {
    let removed = {
      let mut shown = self.shown.lock().unwrap_or_else(|e| e.into_inner());
      let before = shown.len();
      shown.retain(|(existing, _)| existing != id);
      shown.len() != before
    };

    if removed {
      self.send(Outbound::CloseNotification { id: id.to_string() });
    }
    removed
  }

  /// The platform dismissed a notification on its own; stop tracking it.
  pub fn forget_notification(&self, id: &str) -> bool {
    let mut shown = self.shown.lock().unwrap_or_else(|e| e.into_inner());
    let before = shown.len();
    shown.retain(|(existing, _)| existing != id);
    shown.len() != before
  }

  /// Close every displayed notification, returning how many were closed.
  pub fn clear_notifications(&self) -> usize {
    let drained: Vec<(String, Notification)> = {
      let mut shown = self.shown.lock().unwrap_or_else(|e| e.into_inner());
      shown.drain(..).collect()
    };

    for (id, _) in &drained {
      self.send(Outbound::CloseNotification { id: id.clone() });
    }
    drained.len()
  }

  #[cfg(test)]
  pub fn shown(&self) -> Vec<(String, Notification)> {
    self
      .shown
      .lock()
      .unwrap_or_else(|e| e.into_inner())
      .clone()
  }
}
