//! The worker core: lifecycle, request interception, background sync and
//! reminder alerts, driven one platform event at a time.

pub mod fetch;
pub mod lifecycle;
pub mod notify;
pub mod outbox;
pub mod reminders;
pub mod sync;

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info, warn};
use url::Url;

use crate::cache::{CacheLayer, CacheSource, RequestKey, ResponseStore};
use crate::commands::Command;
use crate::config::Config;
use crate::event::{Event, REMINDER_CHECK_TAG};
use crate::net::{Delivery, Destination, Fetcher, Request, Response};
use crate::queue::{EntityKind, PendingRecord, PendingStore};

pub use lifecycle::LifecycleState;
pub use outbox::{Outbound, Outbox};

use fetch::FetchInterceptor;
use lifecycle::LifecycleManager;
use reminders::ReminderScheduler;
use sync::SyncCoordinator;

use notify::ClickOutcome;

/// Shared state and capabilities handed to the worker at construction.
pub struct Context {
  pub config: Config,
  pub storage: Arc<dyn ResponseStore>,
  pub queue: Arc<dyn PendingStore>,
  pub fetcher: Arc<dyn Fetcher>,
  pub delivery: Arc<dyn Delivery>,
  pub outbox: Outbox,
}

/// Handles platform events in order. Network-bound work (fetches and sync runs)
/// is spawned and reports through the outbox, so a slow request only delays its
/// own answer.
pub struct Worker {
  lifecycle: LifecycleManager,
  interceptor: Arc<FetchInterceptor>,
  sync: Arc<SyncCoordinator>,
  reminders: Arc<ReminderScheduler>,
  queue: Arc<dyn PendingStore>,
  fetcher: Arc<dyn Fetcher>,
  outbox: Outbox,
  origin: Url,
  startup_delay: Duration,
  /// Last connectivity state reported by the platform
  online: bool,
  reminder_start: Option<JoinHandle<()>>,
  /// Fetches and sync runs still in flight
  tasks: JoinSet<()>,
}

impl Worker {
  pub fn new(ctx: Context) -> Result<Self> {
    let Context {
      config,
      storage,
      queue,
      fetcher,
      delivery,
      outbox,
    } = ctx;

    let origin = config.origin.clone();
    let offline_document = origin
      .join(&config.cache.offline_document)
      .map_err(|e| eyre!("Invalid offline document '{}': {}", config.cache.offline_document, e))?;
    let dynamic_tag = config.cache.dynamic_tag();

    let layer = CacheLayer::new(
      Arc::clone(&storage),
      dynamic_tag.clone(),
      RequestKey::new(offline_document),
    );
    let interceptor = Arc::new(FetchInterceptor::new(
      layer,
      Arc::clone(&fetcher),
      origin.clone(),
      config.cache.trusted_hosts.clone(),
    ));
    let reminders = Arc::new(ReminderScheduler::new(
      Arc::clone(&storage),
      dynamic_tag,
      origin.clone(),
      outbox.clone(),
      config.reminders.urgent_window(),
    ));
    let sync = Arc::new(SyncCoordinator::new(
      Arc::clone(&queue),
      delivery,
      outbox.clone(),
    ));
    let lifecycle = LifecycleManager::new(
      storage,
      Arc::clone(&fetcher),
      outbox.clone(),
      origin.clone(),
      config.cache.clone(),
      config.lifecycle.skip_waiting,
    );

    Ok(Self {
      lifecycle,
      interceptor,
      sync,
      reminders,
      queue,
      fetcher,
      outbox,
      origin,
      startup_delay: config.reminders.startup_delay(),
      online: true,
      reminder_start: None,
      tasks: JoinSet::new(),
    })
  }

  pub fn lifecycle(&self) -> &LifecycleManager {
    &self.lifecycle
  }

  /// Restore the lifecycle state of a previous run without installing or
  /// arming reminder alarms.
  pub fn resume(&mut self) -> Result<LifecycleState> {
    self.lifecycle.resume()
  }

  /// Bring the worker to the furthest state it can reach on its own: resume a
  /// previous activation, otherwise install (and activate when not waiting).
  pub async fn boot(&mut self) -> Result<LifecycleState> {
    match self.lifecycle.resume()? {
      LifecycleState::Active => self.start_reminders(),
      LifecycleState::Installed => {
        if self.lifecycle.skips_waiting() {
          self.activate()?;
        }
      }
      _ => self.install().await?,
    }
    Ok(self.lifecycle.state())
  }

  /// Wait for every spawned fetch and sync run to finish.
  pub async fn settle(&mut self) {
    while let Some(joined) = self.tasks.join_next().await {
      log_task_failure(joined);
    }
  }

  /// Dispatch one platform event.
  pub async fn handle(&mut self, event: Event) -> Result<()> {
    while let Some(joined) = self.tasks.try_join_next() {
      log_task_failure(joined);
    }

    match event {
      Event::Install => self.install().await,
      Event::Activate => self.activate(),
      Event::Fetch {
        id,
        method,
        url,
        destination,
        body,
      } => self.fetch(id, method, url, destination, body),
      Event::Message { id, data } => self.message(id, Command::parse(&data)).await,
      Event::Push { data } => {
        self
          .outbox
          .notify(notify::push_notification(data.as_ref(), Utc::now()));
        Ok(())
      }
      Event::NotificationClick {
        notification,
        action,
        data,
      } => {
        if let Some(id) = notification {
          self.outbox.close_notification(&id);
        }
        match notify::click_outcome(action.as_deref(), &data) {
          ClickOutcome::Open(path) => self.open_window(&path),
          ClickOutcome::Close => Ok(()),
        }
      }
      Event::NotificationClose { notification } => {
        self.outbox.forget_notification(&notification);
        Ok(())
      }
      Event::Sync { tag } => match EntityKind::from_sync_tag(&tag) {
        Some(kind) => {
          self.sync(kind);
          Ok(())
        }
        None => {
          warn!(tag = %tag, "Ignoring unknown sync tag");
          Ok(())
        }
      },
      Event::PeriodicSync { tag } => {
        if tag == REMINDER_CHECK_TAG {
          self.reminders.check_due(Utc::now())?;
        } else {
          warn!(tag = %tag, "Ignoring unknown periodic sync tag");
        }
        Ok(())
      }
      Event::Connectivity { online } => {
        self.connectivity(online);
        Ok(())
      }
      Event::Enqueue { entity, record } => {
        let record = PendingRecord::from_value(record)?;
        self.queue.enqueue(entity, &record)?;
        info!(entity = %entity, id = %record.id, "Queued pending write");
        Ok(())
      }
      Event::Unknown => {
        debug!("Ignoring unknown event");
        Ok(())
      }
    }
  }

  async fn install(&mut self) -> Result<()> {
    self.lifecycle.install().await?;
    if self.lifecycle.skips_waiting() {
      self.activate()?;
    }
    Ok(())
  }

  fn activate(&mut self) -> Result<()> {
    self.lifecycle.activate()?;
    self.start_reminders();
    Ok(())
  }

  fn start_reminders(&mut self) {
    if let Some(previous) = self.reminder_start.take() {
      previous.abort();
    }
    self.reminder_start = Some(self.reminders.start(self.startup_delay));
  }

  fn fetch(
    &mut self,
    id: Option<String>,
    method: Option<String>,
    url: String,
    destination: Destination,
    body: Option<String>,
  ) -> Result<()> {
    let mut request = Request::resolve(method.as_deref(), &url, &self.origin)?
      .with_destination(destination);
    request.body = body.map(String::into_bytes);

    // Requests are only intercepted once this version controls the clients
    let intercept = self.lifecycle.is_active();
    let interceptor = Arc::clone(&self.interceptor);
    let fetcher = Arc::clone(&self.fetcher);
    let outbox = self.outbox.clone();

    self.tasks.spawn(async move {
      if intercept {
        if let Some(served) = interceptor.intercept(&request).await {
          outbox.send(response_output(
            id,
            &request,
            &served.data,
            Some(served.source),
            served.cached_at,
          ));
          return;
        }
      }

      match fetcher.fetch(&request).await {
        Ok(response) => outbox.send(response_output(id, &request, &response, None, None)),
        Err(e) => outbox.send(Outbound::FetchFailed {
          request_id: id,
          url: request.url.to_string(),
          error: e.to_string(),
        }),
      }
    });
    Ok(())
  }

  async fn message(&mut self, id: Option<String>, command: Command) -> Result<()> {
    debug!(command = command.name(), "Message received");
    match command {
      Command::SkipWaiting => {
        if self.lifecycle.skip_waiting() {
          self.activate()?;
        }
      }
      Command::GetVersion => self.outbox.send(Outbound::Reply {
        reply_to: id,
        body: json!({ "version": self.lifecycle.version_name() }),
      }),
      Command::CacheReminder { reminder } => {
        let record = self.reminders.cache_reminder(reminder)?;
        info!(id = %record.id, "Reminder cached for offline alerts");
        if self.lifecycle.is_active() {
          self.reminders.schedule_all(Utc::now())?;
        }
      }
      Command::ClearNotifications => {
        let closed = self.outbox.clear_notifications();
        debug!(closed, "Cleared notifications");
      }
      Command::Unknown => debug!("Ignoring unknown message"),
    }
    Ok(())
  }

  fn sync(&mut self, kind: EntityKind) {
    if !self.online {
      info!(entity = %kind, "Offline, skipping sync until connectivity returns");
      return;
    }
    self.spawn_sync(kind);
  }

  fn spawn_sync(&mut self, kind: EntityKind) {
    let sync = Arc::clone(&self.sync);
    self.tasks.spawn(async move {
      if let Err(e) = sync.sync(kind).await {
        warn!(entity = %kind, error = %e, "Sync failed");
      }
    });
  }

  /// Going back online drains every queue, which covers triggers skipped while offline.
  fn connectivity(&mut self, online: bool) {
    let restored = online && !self.online;
    self.online = online;
    if !restored {
      debug!(online, "Connectivity unchanged or lost");
      return;
    }

    info!("Connectivity restored, syncing pending writes");
    for kind in EntityKind::ALL {
      self.spawn_sync(kind);
    }
  }

  fn open_window(&self, path: &str) -> Result<()> {
    let url = self
      .origin
      .join(path)
      .map_err(|e| eyre!("Invalid window path '{}': {}", path, e))?;
    self.outbox.send(Outbound::OpenWindow {
      url: url.to_string(),
    });
    Ok(())
  }
}

fn response_output(
  request_id: Option<String>,
  request: &Request,
  response: &Response,
  source: Option<CacheSource>,
  cached_at: Option<DateTime<Utc>>,
) -> Outbound {
  let (body, encoding) = response.encoded_body();
  Outbound::Response {
    request_id,
    url: request.url.to_string(),
    status: response.status,
    status_text: response.status_text.clone(),
    source,
    cached_at,
    content_type: response.content_type().map(str::to_string),
    body,
    encoding,
  }
}

fn log_task_failure(joined: std::result::Result<(), tokio::task::JoinError>) {
  if let Err(e) = joined {
    if !e.is_cancelled() {
      warn!(error = %e, "Background task failed");
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::{MemoryStorage, SqliteStorage};
  use crate::db::Database;
  use crate::net::BodyEncoding;
  use crate::queue::{MemoryQueue, SqliteQueue};
  use crate::testing::{RecordingDelivery, ScriptedFetcher};
  use base64::{engine::general_purpose::STANDARD, Engine as _};
  use tokio::sync::mpsc::UnboundedReceiver;

  const CONFIG: &str = "origin: https://crm.example.ir\n\
                        cache:\n  manifest: [/index.html, /main.js]\n";

  struct Harness {
    worker: Worker,
    rx: UnboundedReceiver<Outbound>,
    storage: Arc<MemoryStorage>,
    queue: Arc<MemoryQueue>,
    delivery: Arc<RecordingDelivery>,
    fetcher: Arc<ScriptedFetcher>,
  }

  impl Harness {
    fn new(fetcher: ScriptedFetcher) -> Self {
      let storage = Arc::new(MemoryStorage::new());
      let queue = Arc::new(MemoryQueue::new());
      let delivery = Arc::new(RecordingDelivery::new());
      let fetcher = Arc::new(fetcher);
      let (outbox, rx) = Outbox::new();
      let worker = Worker::new(Context {
        config: Config::parse(CONFIG).unwrap(),
        storage: storage.clone(),
        queue: queue.clone(),
        fetcher: fetcher.clone(),
        delivery: delivery.clone(),
        outbox,
      })
      .unwrap();
      Self {
        worker,
        rx,
        storage,
        queue,
        delivery,
        fetcher,
      }
    }

    /// Handle an event and wait for any work it spawned.
    async fn send(&mut self, line: &str) {
      self.worker.handle(event(line)).await.unwrap();
      self.worker.settle().await;
    }

    fn drain(&mut self) -> Vec<Outbound> {
      std::iter::from_fn(|| self.rx.try_recv().ok()).collect()
    }
  }

  fn site() -> ScriptedFetcher {
    let origin = Url::parse("https://crm.example.ir/").unwrap();
    ScriptedFetcher::new()
      .respond(
        origin.join("/index.html").unwrap(),
        Response::new(200, "OK")
          .with_header("Content-Type", "text/html")
          .with_body(&b"<html>crm</html>"[..]),
      )
      .respond(
        origin.join("/main.js").unwrap(),
        Response::new(200, "OK").with_body(&b"app()"[..]),
      )
  }

  fn event(line: &str) -> Event {
    Event::parse_line(line).unwrap().unwrap()
  }

  #[tokio::test]
  async fn test_get_version_reply() {
    let mut h = Harness::new(ScriptedFetcher::new());
    h.send(r#"{"event":"message","id":"port-1","data":{"type":"GET_VERSION"}}"#).await;

    match h.drain().as_slice() {
      [Outbound::Reply { reply_to, body }] => {
        assert_eq!(reply_to.as_deref(), Some("port-1"));
        assert_eq!(body["version"], "persian-crm-v1");
      }
      other => panic!("unexpected outputs: {:?}", other),
    }
  }

  #[tokio::test]
  async fn test_unknown_message_is_ignored() {
    let mut h = Harness::new(ScriptedFetcher::new());
    h.send(r#"{"event":"message","data":{"type":"PING"}}"#).await;
    assert!(h.drain().is_empty());
  }

  #[tokio::test]
  async fn test_boot_installs_activates_and_serves_from_cache() {
    let mut h = Harness::new(site());
    assert_eq!(h.worker.boot().await.unwrap(), LifecycleState::Active);
    assert_eq!(h.fetcher.calls(), 2);
    h.drain();

    h.send(r#"{"event":"fetch","id":"f1","url":"/main.js"}"#).await;
    match h.drain().as_slice() {
      [Outbound::Response {
        request_id,
        source,
        body,
        ..
      }] => {
        assert_eq!(request_id.as_deref(), Some("f1"));
        assert_eq!(*source, Some(CacheSource::Cache));
        assert_eq!(body, "app()");
      }
      other => panic!("unexpected outputs: {:?}", other),
    }
    assert_eq!(h.fetcher.calls(), 2);
  }

  #[tokio::test]
  async fn test_fetch_passes_through_until_active() {
    let mut h = Harness::new(site());
    h.send(r#"{"event":"fetch","url":"/main.js"}"#).await;

    match h.drain().as_slice() {
      [Outbound::Response { source, .. }] => assert_eq!(*source, None),
      other => panic!("unexpected outputs: {:?}", other),
    }
    assert!(h.storage.partitions().unwrap().is_empty());

    h.send(r#"{"event":"fetch","url":"/reports.html"}"#).await;
    assert!(matches!(h.drain().as_slice(), [Outbound::FetchFailed { .. }]));
  }

  #[tokio::test]
  async fn test_offline_document_after_install() {
    let mut h = Harness::new(site());
    h.worker.boot().await.unwrap();
    h.drain();

    h.send(r#"{"event":"fetch","url":"/reports.html","destination":"document"}"#).await;
    match h.drain().as_slice() {
      [Outbound::Response { source, body, .. }] => {
        assert_eq!(*source, Some(CacheSource::Offline));
        assert_eq!(body, "<html>crm</html>");
      }
      other => panic!("unexpected outputs: {:?}", other),
    }
  }

  #[tokio::test]
  async fn test_sync_waits_for_connectivity() {
    let mut h = Harness::new(ScriptedFetcher::new());
    h.send(r#"{"event":"connectivity","online":false}"#).await;
    h.send(r#"{"event":"enqueue","entity":"sale","record":{"id":"s_1001","total":250000}}"#).await;
    h.send(r#"{"event":"sync","tag":"sync-sales"}"#).await;

    assert!(h.delivery.delivered().is_empty());
    assert_eq!(h.queue.count(EntityKind::Sale).unwrap(), 1);

    h.send(r#"{"event":"connectivity","online":true}"#).await;

    assert_eq!(
      h.delivery.delivered(),
      vec![(EntityKind::Sale, "s_1001".to_string())]
    );
    assert_eq!(h.queue.count(EntityKind::Sale).unwrap(), 0);
    let announced = h.drain().into_iter().any(|out| {
      matches!(out, Outbound::ShowNotification { ref notification, .. }
        if notification.data["saleId"] == "s_1001")
    });
    assert!(announced);
  }

  #[tokio::test]
  async fn test_unknown_sync_tag_is_ignored() {
    let mut h = Harness::new(ScriptedFetcher::new());
    h.send(r#"{"event":"sync","tag":"sync-invoices"}"#).await;
    assert!(h.drain().is_empty());
  }

  #[tokio::test]
  async fn test_notification_click_closes_then_opens() {
    let mut h = Harness::new(ScriptedFetcher::new());
    h.send(r#"{"event":"push","data":{"title":"جلسه"}}"#).await;
    let id = match h.drain().as_slice() {
      [Outbound::ShowNotification { id, .. }] => id.clone(),
      other => panic!("unexpected outputs: {:?}", other),
    };

    let click = json!({
      "event": "notification_click",
      "notification": id,
      "action": "complete",
      "data": {"reminderId": "r_9"}
    });
    h.send(&click.to_string()).await;

    match h.drain().as_slice() {
      [Outbound::CloseNotification { id: closed }, Outbound::OpenWindow { url }] => {
        assert_eq!(closed, &id);
        assert_eq!(url, "https://crm.example.ir/reminders.html#reminder-r_9");
      }
      other => panic!("unexpected outputs: {:?}", other),
    }
  }

  #[tokio::test]
  async fn test_periodic_check_raises_urgent_alert() {
    let mut h = Harness::new(ScriptedFetcher::new());
    let when = (Utc::now() + chrono::Duration::minutes(3)).to_rfc3339();
    let message = json!({
      "event": "message",
      "data": {"type": "CACHE_REMINDER", "reminder": {"id": "r_1", "title": "تماس", "when": when}}
    });
    h.send(&message.to_string()).await;
    h.worker.handle(Event::reminder_check()).await.unwrap();

    let urgent = h.drain().into_iter().any(|out| {
      matches!(out, Outbound::ShowNotification { ref id, .. } if id == "urgent-reminder-r_1")
    });
    assert!(urgent);
  }

  #[tokio::test]
  async fn test_binary_body_survives_as_base64() {
    let jpeg: &[u8] = &[0xFF, 0xD8, 0xFF, 0xE0, 0x00, 0x10, 0x4A, 0x46];
    let image = Url::parse("https://crm.example.ir/resources/hero-bg.jpg").unwrap();
    let mut h = Harness::new(site().respond(
      image,
      Response::new(200, "OK")
        .with_header("Content-Type", "image/jpeg")
        .with_body(jpeg),
    ));
    h.worker.boot().await.unwrap();
    h.drain();

    // Network on the first request, cache on the second
    for expected in [CacheSource::Network, CacheSource::Cache] {
      h.send(r#"{"event":"fetch","url":"/resources/hero-bg.jpg","destination":"image"}"#)
        .await;
      match h.drain().as_slice() {
        [Outbound::Response {
          source,
          body,
          encoding,
          ..
        }] => {
          assert_eq!(*source, Some(expected));
          assert_eq!(*encoding, Some(BodyEncoding::Base64));
          assert_eq!(STANDARD.decode(body).unwrap(), jpeg);
        }
        other => panic!("unexpected outputs: {:?}", other),
      }
    }
  }

  #[tokio::test]
  async fn test_connectivity_restore_reports_every_queue() {
    let mut h = Harness::new(ScriptedFetcher::new());
    h.send(r#"{"event":"connectivity","online":false}"#).await;
    h.send(r#"{"event":"connectivity","online":true}"#).await;

    let mut reported: Vec<EntityKind> = h
      .drain()
      .into_iter()
      .filter_map(|out| match out {
        Outbound::SyncCompleted { report } => report.entity,
        _ => None,
      })
      .collect();
    reported.sort();
    assert_eq!(reported, EntityKind::ALL.to_vec());
  }

  #[tokio::test]
  async fn test_dismissed_notification_is_forgotten() {
    let mut h = Harness::new(ScriptedFetcher::new());
    h.send(r#"{"event":"push"}"#).await;
    let id = match h.drain().as_slice() {
      [Outbound::ShowNotification { id, .. }] => id.clone(),
      other => panic!("unexpected outputs: {:?}", other),
    };

    h.send(&json!({"event": "notification_close", "notification": id}).to_string())
      .await;
    assert!(h.drain().is_empty());

    // Nothing left to close
    h.send(r#"{"event":"message","data":{"type":"CLEAR_NOTIFICATIONS"}}"#)
      .await;
    assert!(h.drain().is_empty());
  }

  #[tokio::test(start_paused = true)]
  async fn test_restart_rearms_cached_reminders_after_startup_delay() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("worker.db");
    let open = || {
      let db = Database::open(Some(path.as_path())).unwrap();
      let (outbox, rx) = Outbox::new();
      let worker = Worker::new(Context {
        config: Config::parse("origin: https://crm.example.ir\ncache:\n  manifest: []\n").unwrap(),
        storage: Arc::new(SqliteStorage::new(db.clone())),
        queue: Arc::new(SqliteQueue::new(db)),
        fetcher: Arc::new(ScriptedFetcher::new()),
        delivery: Arc::new(RecordingDelivery::new()),
        outbox,
      })
      .unwrap();
      (worker, rx)
    };

    let (mut first, _first_rx) = open();
    assert_eq!(first.boot().await.unwrap(), LifecycleState::Active);
    let when = (Utc::now() + chrono::Duration::minutes(2)).to_rfc3339();
    let message = json!({
      "event": "message",
      "data": {"type": "CACHE_REMINDER", "reminder": {"id": "r_1", "title": "تماس با مشتری", "when": when}}
    });
    first.handle(event(&message.to_string())).await.unwrap();
    drop(first);

    let (mut second, mut rx) = open();
    assert_eq!(second.boot().await.unwrap(), LifecycleState::Active);
    while rx.try_recv().is_ok() {}

    tokio::time::sleep(Duration::from_secs(4)).await;
    assert_eq!(second.reminders.armed(), 0);

    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(second.reminders.armed(), 1);

    tokio::time::sleep(Duration::from_secs(60)).await;
    assert!(rx.try_recv().is_err());

    tokio::time::sleep(Duration::from_secs(70)).await;
    match rx.try_recv().unwrap() {
      Outbound::ShowNotification { id, notification } => {
        assert_eq!(id, "reminder-r_1");
        assert_eq!(notification.title, "یادآوری: تماس با مشتری");
      }
      other => panic!("expected due alert, got {:?}", other),
    }
  }
}
