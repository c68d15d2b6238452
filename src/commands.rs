/// Commands accepted at the message boundary
use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

/// A message from a client page, tagged by its `type` field.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Command {
  /// Activate as soon as install completes
  SkipWaiting,
  /// Reply with the worker version
  GetVersion,
  /// Store a reminder for offline alerting
  CacheReminder { reminder: Value },
  /// Close every displayed notification
  ClearNotifications,
  /// Anything else; ignored
  #[serde(other)]
  Unknown,
}

impl Command {
  /// Decode a message payload. Payloads that are not a recognizable command
  /// (no `type`, wrong shape) become `Unknown`.
  pub fn parse(data: &Value) -> Self {
    match Command::deserialize(data) {
      Ok(command) => command,
      Err(e) => {
        debug!(error = %e, "Unrecognized message");
        Command::Unknown
      }
    }
  }

  pub fn name(&self) -> &'static str {
    match self {
      Command::SkipWaiting => "SKIP_WAITING",
      Command::GetVersion => "GET_VERSION",
      Command::CacheReminder { .. } => "CACHE_REMINDER",
      Command::ClearNotifications => "CLEAR_NOTIFICATIONS",
      Command::Unknown => "UNKNOWN",
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  #[test]
  fn test_known_commands() {
    assert_eq!(Command::parse(&json!({"type": "SKIP_WAITING"})), Command::SkipWaiting);
    assert_eq!(Command::parse(&json!({"type": "GET_VERSION"})), Command::GetVersion);
    assert_eq!(
      Command::parse(&json!({"type": "CLEAR_NOTIFICATIONS"})),
      Command::ClearNotifications
    );
  }

  #[test]
  fn test_cache_reminder_carries_payload() {
    let reminder = json!({"id": "r_1", "title": "تماس با مشتری", "when": "2026-03-20T09:30:00Z"});
    let command = Command::parse(&json!({"type": "CACHE_REMINDER", "reminder": reminder}));
    assert_eq!(command, Command::CacheReminder { reminder });
  }

  #[test]
  fn test_unknown_and_malformed() {
    assert_eq!(Command::parse(&json!({"type": "REFRESH_ALL"})), Command::Unknown);
    assert_eq!(Command::parse(&json!({"kind": "GET_VERSION"})), Command::Unknown);
    assert_eq!(Command::parse(&json!("GET_VERSION")), Command::Unknown);
    assert_eq!(Command::parse(&Value::Null), Command::Unknown);
    // Known tag with a missing field
    assert_eq!(Command::parse(&json!({"type": "CACHE_REMINDER"})), Command::Unknown);
  }
}
