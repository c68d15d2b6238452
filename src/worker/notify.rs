//! User-visible notifications: the alerts the worker raises and how
//! interactions with them are routed.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{json, Map, Value};

const ICON: &str = "/resources/user-avatar.jpg";
const APP_TITLE: &str = "CRM فارسی";
const PUSH_DEFAULT_BODY: &str = "یادآوری جدید برای شما ارسال شده است";

/// Page opened by the "view details" action
pub const REMINDERS_VIEW: &str = "/reminders.html";
/// Application root, opened for unrecognized actions
pub const APP_ROOT: &str = "/";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Urgency {
  #[default]
  Normal,
  /// Must be acknowledged; presented more insistently
  Urgent,
}

/// Buttons offered on a notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
  /// View details
  Explore,
  /// Dismiss
  Close,
  /// Mark the reminder complete
  Complete,
  Snooze,
}

impl Action {
  pub fn parse(action: &str) -> Option<Self> {
    match action {
      "explore" => Some(Self::Explore),
      "close" => Some(Self::Close),
      "complete" => Some(Self::Complete),
      "snooze" => Some(Self::Snooze),
      _ => None,
    }
  }

  pub fn title(&self) -> &'static str {
    match self {
      Self::Explore => "مشاهده جزئیات",
      Self::Close => "بستن",
      Self::Complete => "تکمیل شد",
      Self::Snooze => "به بعد موکول شود",
    }
  }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NotificationAction {
  pub action: Action,
  pub title: &'static str,
  pub icon: &'static str,
}

impl From<Action> for NotificationAction {
  fn from(action: Action) -> Self {
    Self {
      action,
      title: action.title(),
      icon: ICON,
    }
  }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Notification {
  pub title: String,
  pub body: String,
  /// Notifications sharing a tag replace each other
  #[serde(skip_serializing_if = "Option::is_none")]
  pub tag: Option<String>,
  pub icon: &'static str,
  pub badge: &'static str,
  pub data: Value,
  pub urgency: Urgency,
  pub require_interaction: bool,
  #[serde(skip_serializing_if = "Vec::is_empty")]
  pub actions: Vec<NotificationAction>,
  #[serde(skip_serializing_if = "Vec::is_empty")]
  pub vibrate: Vec<u32>,
}

impl Notification {
  pub fn new(title: impl Into<String>, body: impl Into<String>) -> Self {
    Self {
      title: title.into(),
      body: body.into(),
      tag: None,
      icon: ICON,
      badge: ICON,
      data: Value::Object(Map::new()),
      urgency: Urgency::Normal,
      require_interaction: false,
      actions: Vec::new(),
      vibrate: Vec::new(),
    }
  }

  pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
    self.tag = Some(tag.into());
    self
  }

  pub fn with_data(mut self, data: Value) -> Self {
    self.data = data;
    self
  }

  pub fn with_actions(mut self, actions: &[Action]) -> Self {
    self.actions = actions.iter().copied().map(NotificationAction::from).collect();
    self
  }

  pub fn with_vibrate(mut self, pattern: &[u32]) -> Self {
    self.vibrate = pattern.to_vec();
    self
  }

  pub fn requiring_interaction(mut self) -> Self {
    self.require_interaction = true;
    self
  }

  pub fn urgent(mut self) -> Self {
    self.urgency = Urgency::Urgent;
    self.require_interaction = true;
    self
  }
}

/// Build the alert for an inbound push message.
///
/// `title` and `body` come from the payload when present; every payload field is
/// merged into the notification data.
pub fn push_notification(payload: Option<&Value>, now: DateTime<Utc>) -> Notification {
  let mut data = Map::new();
  data.insert("dateOfArrival".to_string(), json!(now.timestamp_millis()));
  data.insert("primaryKey".to_string(), json!(1));

  let mut title = APP_TITLE.to_string();
  let mut body = PUSH_DEFAULT_BODY.to_string();

  if let Some(Value::Object(fields)) = payload {
    if let Some(Value::String(t)) = fields.get("title") {
      if !t.is_empty() {
        title = t.clone();
      }
    }
    if let Some(Value::String(b)) = fields.get("body") {
      if !b.is_empty() {
        body = b.clone();
      }
    }
    for (k, v) in fields {
      data.insert(k.clone(), v.clone());
    }
  }

  Notification::new(title, body)
    .with_data(Value::Object(data))
    .with_actions(&[Action::Explore, Action::Close])
    .with_vibrate(&[100, 50, 100])
}

/// What to do after the user interacts with a notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClickOutcome {
  /// Open (or focus) the application at this path
  Open(String),
  /// Just close the notification
  Close,
}

/// Route a notification interaction.
///
/// Complete and snooze open the reminders view on the reminder; the UI owns
/// the actual mutation. Anything unrecognized opens the application root.
pub fn click_outcome(action: Option<&str>, data: &Value) -> ClickOutcome {
  match action.and_then(Action::parse) {
    Some(Action::Explore) => ClickOutcome::Open(REMINDERS_VIEW.to_string()),
    Some(Action::Close) => ClickOutcome::Close,
    Some(Action::Complete) | Some(Action::Snooze) => {
      let target = match data.get("reminderId") {
        Some(Value::String(id)) => format!("{}#reminder-{}", REMINDERS_VIEW, id),
        Some(Value::Number(id)) => format!("{}#reminder-{}", REMINDERS_VIEW, id),
        _ => REMINDERS_VIEW.to_string(),
      };
      ClickOutcome::Open(target)
    }
    None => ClickOutcome::Open(APP_ROOT.to_string()),
  }
}
