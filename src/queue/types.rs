use color_eyre::{eyre::eyre, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

/// Entity types that can be written while offline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityKind {
  Customer,
  Sale,
  Reminder,
}

impl EntityKind {
  pub const ALL: [EntityKind; 3] = [EntityKind::Customer, EntityKind::Sale, EntityKind::Reminder];

  pub fn as_str(&self) -> &'static str {
    match self {
      Self::Customer => "customer",
      Self::Sale => "sale",
      Self::Reminder => "reminder",
    }
  }

  /// Plural name, used for remote collection paths.
  pub fn collection(&self) -> &'static str {
    match self {
      Self::Customer => "customers",
      Self::Sale => "sales",
      Self::Reminder => "reminders",
    }
  }

  /// Background-sync tag that drains this queue.
  pub fn sync_tag(&self) -> &'static str {
    match self {
      Self::Customer => "sync-customers",
      Self::Sale => "sync-sales",
      Self::Reminder => "sync-reminders",
    }
  }

  pub fn from_sync_tag(tag: &str) -> Option<Self> {
    Self::ALL.into_iter().find(|kind| kind.sync_tag() == tag)
  }
}

impl FromStr for EntityKind {
  type Err = String;

  /// Accepts the singular or plural name.
  fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
    Self::ALL
      .into_iter()
      .find(|kind| kind.as_str() == s || kind.collection() == s)
      .ok_or_else(|| format!("unknown entity type '{}' (customer, sale, reminder)", s))
  }
}

impl fmt::Display for EntityKind {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

/// A write captured locally because the remote system was unreachable.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingRecord {
  pub id: String,
  pub payload: Value,
}

impl PendingRecord {
  /// Wrap a JSON object, taking its identity from the required `id` field.
  ///
  /// Numeric ids are accepted and kept in their decimal form.
  pub fn from_value(payload: Value) -> Result<Self> {
    let id = match payload.get("id") {
      Some(Value::String(s)) if !s.is_empty() => s.clone(),
      Some(Value::Number(n)) => n.to_string(),
      Some(other) => return Err(eyre!("Record id must be a string or number, got {}", other)),
      None => return Err(eyre!("Record is missing the required 'id' field")),
    };
    Ok(Self { id, payload })
  }

  /// String field of the payload, if present.
  pub fn field(&self, name: &str) -> Option<String> {
    match self.payload.get(name)? {
      Value::String(s) => Some(s.clone()),
      Value::Null => None,
      other => Some(other.to_string()),
    }
  }
}
