use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use serde_json::Value;
use std::time::Duration;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::net::Destination;
use crate::queue::EntityKind;

/// Tag of the recurring due-reminder check
pub const REMINDER_CHECK_TAG: &str = "reminder-check";

/// Platform events, one JSON object per input line tagged by `event`
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum Event {
  /// Pre-cache the asset manifest
  Install,
  /// Take over from the previous version
  Activate,
  /// An outgoing request from a client page
  Fetch {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    method: Option<String>,
    /// Absolute, or relative to the configured origin
    url: String,
    #[serde(default)]
    destination: Destination,
    #[serde(default)]
    body: Option<String>,
  },
  /// A message posted by a client page
  Message {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    data: Value,
  },
  Push {
    #[serde(default)]
    data: Option<Value>,
  },
  NotificationClick {
    /// Id of the clicked notification
    #[serde(default)]
    notification: Option<String>,
    #[serde(default)]
    action: Option<String>,
    #[serde(default)]
    data: Value,
  },
  /// A notification dismissed without a click
  NotificationClose { notification: String },
  /// One-off background sync, tagged per entity type
  Sync { tag: String },
  /// Recurring background trigger
  PeriodicSync { tag: String },
  Connectivity { online: bool },
  /// The UI could not deliver a record and wants it queued
  Enqueue { entity: EntityKind, record: Value },
  #[serde(other)]
  Unknown,
}

impl Event {
  /// Parse one input line. Blank lines yield `None`.
  pub fn parse_line(line: &str) -> Result<Option<Self>> {
    let line = line.trim();
    if line.is_empty() {
      return Ok(None);
    }
    serde_json::from_str(line)
      .map(Some)
      .map_err(|e| eyre!("Invalid event '{}': {}", line, e))
  }

  pub fn reminder_check() -> Self {
    Event::PeriodicSync {
      tag: REMINDER_CHECK_TAG.to_string(),
    }
  }
}

/// Event handler that produces events from line-delimited input and an optional
/// reminder-check timer
pub struct EventHandler {
  rx: mpsc::UnboundedReceiver<Event>,
}

impl EventHandler {
  /// Read events from stdin
  pub fn new(check_interval: Option<Duration>) -> Self {
    Self::from_reader(BufReader::new(tokio::io::stdin()), check_interval)
  }

  pub fn from_reader<R>(reader: R, check_interval: Option<Duration>) -> Self
  where
    R: AsyncBufRead + Unpin + Send + 'static,
  {
    let (tx, rx) = mpsc::unbounded_channel();

    // The timer only holds a weak sender so the channel closes with the input
    if let Some(interval) = check_interval {
      let weak = tx.downgrade();
      tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        // First tick completes immediately
        ticker.tick().await;
        loop {
          ticker.tick().await;
          let Some(tx) = weak.upgrade() else {
            break;
          };
          if tx.send(Event::reminder_check()).is_err() {
            break;
          }
        }
      });
    }

    // Spawn input reader
    tokio::spawn(async move {
      let mut lines = reader.lines();
      loop {
        match lines.next_line().await {
          Ok(Some(line)) => match Event::parse_line(&line) {
            Ok(Some(event)) => {
              if tx.send(event).is_err() {
                break;
              }
            }
            Ok(None) => {}
            Err(e) => warn!(error = %e, "Skipping malformed event"),
          },
          Ok(None) => {
            debug!("Input closed");
            break;
          }
          Err(e) => {
            warn!(error = %e, "Failed to read input");
            break;
          }
        }
      }
    });

    Self { rx }
  }

  /// Receive the next event; `None` once the input is exhausted
  pub async fn next(&mut self) -> Option<Event> {
    self.rx.recv().await
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  #[test]
  fn test_parse_events() {
    assert_eq!(
      Event::parse_line(r#"{"event":"sync","tag":"sync-sales"}"#).unwrap(),
      Some(Event::Sync {
        tag: "sync-sales".to_string()
      })
    );
    assert_eq!(
      Event::parse_line(r#"{"event":"connectivity","online":false}"#).unwrap(),
      Some(Event::Connectivity { online: false })
    );
    assert_eq!(
      Event::parse_line(r#"{"event":"enqueue","entity":"sale","record":{"id":"s_1"}}"#).unwrap(),
      Some(Event::Enqueue {
        entity: EntityKind::Sale,
        record: json!({"id": "s_1"}),
      })
    );
    assert_eq!(
      Event::parse_line(r#"{"event":"fetch","url":"/index.html","destination":"document"}"#)
        .unwrap(),
      Some(Event::Fetch {
        id: None,
        method: None,
        url: "/index.html".to_string(),
        destination: Destination::Document,
        body: None,
      })
    );
    assert_eq!(
      Event::parse_line(r#"{"event":"notification_close","notification":"untagged-3"}"#)
        .unwrap(),
      Some(Event::NotificationClose {
        notification: "untagged-3".to_string()
      })
    );
    assert_eq!(Event::parse_line("   ").unwrap(), None);
  }

  #[test]
  fn test_unknown_and_invalid() {
    assert_eq!(
      Event::parse_line(r#"{"event":"beforeinstallprompt"}"#).unwrap(),
      Some(Event::Unknown)
    );
    assert!(Event::parse_line("not json").is_err());
    assert!(Event::parse_line(r#"{"event":"enqueue","entity":"invoice","record":{}}"#).is_err());
  }

  #[tokio::test]
  async fn test_reader_skips_bad_lines_and_closes() {
    let input: &'static [u8] =
      b"{\"event\":\"install\"}\ngarbage\n\n{\"event\":\"push\"}\n";
    let mut events = EventHandler::from_reader(input, None);

    assert_eq!(events.next().await, Some(Event::Install));
    assert_eq!(events.next().await, Some(Event::Push { data: None }));
    assert_eq!(events.next().await, None);
  }

  #[tokio::test(start_paused = true)]
  async fn test_timer_emits_reminder_checks() {
    let (client, server) = tokio::io::duplex(64);
    let mut events =
      EventHandler::from_reader(BufReader::new(server), Some(Duration::from_secs(60)));

    assert_eq!(events.next().await, Some(Event::reminder_check()));
    assert_eq!(events.next().await, Some(Event::reminder_check()));
    drop(client);
  }
}
