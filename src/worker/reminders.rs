//! Reminder alerts: one-shot alarms at the due time and urgent alerts from
//! periodic due checks.
//!
//! Reminders are cached by the UI as JSON documents in the dynamic partition and
//! are read-only here.

use chrono::{DateTime, NaiveDateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use url::Url;

use crate::cache::{CachedResponse, RequestKey, ResponseStore};

use super::notify::{Action, Notification};
use super::outbox::Outbox;

const DUE_DEFAULT_BODY: &str = "زمان انجام این کار فرا رسیده است";
const URGENT_DEFAULT_BODY: &str = "این یادآوری باید همین حالا انجام شود";
const URGENT_VIBRATE: &[u32] = &[200, 100, 200, 100, 200];

/// Cache key prefix marking a cached reminder document
const KEY_PREFIX: &str = "reminder-";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReminderStatus {
  #[default]
  Active,
  Completed,
  Snoozed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReminderRecord {
  pub id: String,
  pub title: String,
  pub notes: Option<String>,
  pub when: DateTime<Utc>,
  pub status: ReminderStatus,
}

#[derive(Deserialize)]
struct RawReminder {
  id: Value,
  #[serde(default)]
  title: String,
  notes: Option<String>,
  when: Value,
  #[serde(default)]
  status: ReminderStatus,
}

impl ReminderRecord {
  pub fn from_value(value: Value) -> Result<Self> {
    let raw: RawReminder =
      serde_json::from_value(value).map_err(|e| eyre!("Invalid reminder: {}", e))?;

    let id = match raw.id {
      Value::String(s) if !s.is_empty() => s,
      Value::Number(n) => n.to_string(),
      other => return Err(eyre!("Invalid reminder id: {}", other)),
    };
    let when = parse_when(&raw.when).map_err(|e| eyre!("Reminder {}: {}", id, e))?;

    Ok(Self {
      id,
      title: raw.title,
      notes: raw.notes.filter(|n| !n.is_empty()),
      when,
      status: raw.status,
    })
  }

  pub fn is_active(&self) -> bool {
    self.status == ReminderStatus::Active
  }
}

/// Accepts RFC 3339, a naive `YYYY-MM-DDTHH:MM[:SS]` taken as UTC, or epoch millis.
fn parse_when(value: &Value) -> Result<DateTime<Utc>> {
  match value {
    Value::String(s) => {
      if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Ok(dt.with_timezone(&Utc));
      }
      ["%Y-%m-%dT%H:%M:%S", "%Y-%m-%dT%H:%M"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(s, fmt).ok())
        .map(|naive| naive.and_utc())
        .ok_or_else(|| eyre!("Unparsable due time '{}'", s))
    }
    Value::Number(n) => n
      .as_i64()
      .and_then(DateTime::<Utc>::from_timestamp_millis)
      .ok_or_else(|| eyre!("Due time out of range: {}", n)),
    other => Err(eyre!("Missing or invalid due time: {}", other)),
  }
}

/// A one-shot alarm the scheduler would arm.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedAlarm {
  pub reminder: ReminderRecord,
  pub delay: Duration,
}

type AlarmRegistry = Arc<Mutex<HashMap<(String, DateTime<Utc>), JoinHandle<()>>>>;

pub struct ReminderScheduler {
  storage: Arc<dyn ResponseStore>,
  partition: String,
  origin: Url,
  outbox: Outbox,
  urgent_window: chrono::Duration,
  alarms: AlarmRegistry,
}

impl ReminderScheduler {
  pub fn new(
    storage: Arc<dyn ResponseStore>,
    partition: impl Into<String>,
    origin: Url,
    outbox: Outbox,
    urgent_window: chrono::Duration,
  ) -> Self {
    Self {
      storage,
      partition: partition.into(),
      origin,
      outbox,
      urgent_window,
      alarms: Arc::new(Mutex::new(HashMap::new())),
    }
  }

  /// Store a reminder document so it can be alerted on while offline.
  pub fn cache_reminder(&self, reminder: Value) -> Result<ReminderRecord> {
    let record = ReminderRecord::from_value(reminder.clone())?;
    let url = self
      .origin
      .join(&format!("/{}{}", KEY_PREFIX, record.id))
      .map_err(|e| eyre!("Invalid reminder id '{}': {}", record.id, e))?;

    self
      .storage
      .put(&self.partition, &RequestKey::new(url), &CachedResponse::json(&reminder)?)?;
    debug!(id = %record.id, "Cached reminder");
    Ok(record)
  }

  /// Read every cached reminder. Unreadable entries are logged and skipped.
  pub fn scan(&self) -> Result<Vec<ReminderRecord>> {
    let mut reminders = Vec::new();

    for key in self.storage.keys(&self.partition)? {
      let is_reminder = key
        .url()
        .path_segments()
        .and_then(|mut segments| segments.next_back())
        .map(|last| last.starts_with(KEY_PREFIX))
        .unwrap_or(false);
      if !is_reminder {
        continue;
      }

      let cached = match self.storage.get(&self.partition, &key) {
        Ok(Some(cached)) => cached,
        Ok(None) => continue,
        Err(e) => {
          warn!(key = %key, error = %e, "Failed to read cached reminder");
          continue;
        }
      };

      let parsed = serde_json::from_slice::<Value>(cached.body())
        .map_err(|e| eyre!("Invalid JSON: {}", e))
        .and_then(ReminderRecord::from_value);
      match parsed {
        Ok(reminder) => reminders.push(reminder),
        Err(e) => warn!(key = %key, error = %e, "Skipping malformed reminder"),
      }
    }

    Ok(reminders)
  }

  /// Alarms for active reminders due after `now`.
  pub fn plan(reminders: &[ReminderRecord], now: DateTime<Utc>) -> Vec<PlannedAlarm> {
    reminders
      .iter()
      .filter(|r| r.is_active() && r.when > now)
      .filter_map(|r| {
        let delay = (r.when - now).to_std().ok()?;
        Some(PlannedAlarm {
          reminder: r.clone(),
          delay,
        })
      })
      .collect()
  }

  /// Scan the cache and arm a one-shot alarm for every future active reminder.
  ///
  /// Re-arming an identical (id, due time) alarm is a no-op. An edited reminder
  /// gets a new alarm; the previous one is left armed.
  pub fn schedule_all(&self, now: DateTime<Utc>) -> Result<usize> {
    let planned = Self::plan(&self.scan()?, now);
    let mut armed = 0;

    let mut alarms = self.alarms.lock().map_err(|e| eyre!("Lock poisoned: {}", e))?;
    alarms.retain(|_, handle| !handle.is_finished());

    for PlannedAlarm { reminder, delay } in planned {
      let slot = (reminder.id.clone(), reminder.when);
      if alarms.contains_key(&slot) {
        continue;
      }

      debug!(id = %reminder.id, delay_secs = delay.as_secs(), "Arming reminder alarm");
      let outbox = self.outbox.clone();
      let registry = Arc::clone(&self.alarms);
      let fired = slot.clone();
      let handle = tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        info!(id = %reminder.id, "Reminder due");
        outbox.notify(due_notification(&reminder));
        if let Ok(mut alarms) = registry.lock() {
          alarms.remove(&fired);
        }
      });
      alarms.insert(slot, handle);
      armed += 1;
    }

    Ok(armed)
  }

  /// Arm alarms after `delay`, giving the rest of the worker time to settle.
  pub fn start(self: &Arc<Self>, delay: Duration) -> JoinHandle<()> {
    let scheduler = Arc::clone(self);
    tokio::spawn(async move {
      tokio::time::sleep(delay).await;
      match scheduler.schedule_all(Utc::now()) {
        Ok(armed) => info!(armed, "Reminder alarms scheduled"),
        Err(e) => warn!(error = %e, "Failed to schedule reminder alarms"),
      }
    })
  }

  /// Raise an urgent alert for every active reminder due within the window of `now`.
  pub fn check_due(&self, now: DateTime<Utc>) -> Result<Vec<String>> {
    let mut alerted = Vec::new();

    for reminder in self.scan()? {
      if !reminder.is_active() {
        continue;
      }
      let until = reminder.when - now;
      if until <= self.urgent_window && until >= -self.urgent_window {
        self.outbox.notify(urgent_notification(&reminder));
        alerted.push(reminder.id);
      }
    }

    if !alerted.is_empty() {
      info!(count = alerted.len(), "Urgent reminder alerts raised");
    }
    Ok(alerted)
  }

  /// Disarm every alarm for a reminder. Returns how many were pending.
  #[allow(dead_code)]
  pub fn cancel(&self, id: &str) -> Result<usize> {
    let mut alarms = self.alarms.lock().map_err(|e| eyre!("Lock poisoned: {}", e))?;
    let before = alarms.len();
    alarms.retain(|(alarm_id, _), handle| {
      if alarm_id == id {
        handle.abort();
        false
      } else {
        true
      }
    });
    Ok(before - alarms.len())
  }

  #[cfg(test)]
  pub(crate) fn armed(&self) -> usize {
    self
      .alarms
      .lock()
      .map(|alarms| alarms.values().filter(|h| !h.is_finished()).count())
      .unwrap_or(0)
  }
}

fn due_notification(reminder: &ReminderRecord) -> Notification {
  Notification::new(
    format!("یادآوری: {}", reminder.title),
    reminder.notes.as_deref().unwrap_or(DUE_DEFAULT_BODY),
  )
  .with_tag(format!("reminder-{}", reminder.id))
  .with_data(json!({ "reminderId": reminder.id }))
  .with_actions(&[Action::Complete, Action::Snooze])
  .requiring_interaction()
}

fn urgent_notification(reminder: &ReminderRecord) -> Notification {
  Notification::new(
    format!("یادآوری فوری: {}", reminder.title),
    reminder.notes.as_deref().unwrap_or(URGENT_DEFAULT_BODY),
  )
  .with_tag(format!("urgent-reminder-{}", reminder.id))
  .with_data(json!({ "reminderId": reminder.id, "urgent": true }))
  .with_vibrate(URGENT_VIBRATE)
  .urgent()
}
