//! Draining pending-write queues once the remote system is reachable.

use color_eyre::{eyre::WrapErr, Result};
use serde::Serialize;
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::net::Delivery;
use crate::queue::{EntityKind, PendingRecord, PendingStore};

use super::notify::Notification;
use super::outbox::{Outbound, Outbox};

/// Outcome of one sync run for one entity type.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SyncReport {
  pub entity: Option<EntityKind>,
  /// Delivered and removed from the queue
  pub delivered: Vec<String>,
  /// Still queued for the next attempt
  pub failed: Vec<String>,
}

pub struct SyncCoordinator {
  queue: Arc<dyn PendingStore>,
  delivery: Arc<dyn Delivery>,
  outbox: Outbox,
  /// One run per entity type at a time, so a record is never delivered twice
  runs: HashMap<EntityKind, Mutex<()>>,
}

impl SyncCoordinator {
  pub fn new(queue: Arc<dyn PendingStore>, delivery: Arc<dyn Delivery>, outbox: Outbox) -> Self {
    Self {
      queue,
      delivery,
      outbox,
      runs: EntityKind::ALL.iter().map(|&kind| (kind, Mutex::new(()))).collect(),
    }
  }

  /// Deliver every queued record of `kind`.
  ///
  /// A record leaves the queue only after the remote acknowledged it. Failures are
  /// logged, the record stays queued and the batch carries on.
  pub async fn sync(&self, kind: EntityKind) -> Result<SyncReport> {
    let _running = match self.runs.get(&kind) {
      Some(run) => Some(run.lock().await),
      None => None,
    };

    let pending = self
      .queue
      .list(kind)
      .wrap_err_with(|| format!("Failed to list pending {} records", kind))?;

    let mut report = SyncReport {
      entity: Some(kind),
      ..SyncReport::default()
    };

    if pending.is_empty() {
      debug!(entity = %kind, "Nothing to sync");
    } else {
      info!(entity = %kind, count = pending.len(), "Syncing pending records");
    }

    for record in pending {
      if let Err(e) = self.delivery.deliver(kind, &record).await {
        warn!(entity = %kind, id = %record.id, error = %e, "Delivery failed, keeping record queued");
        report.failed.push(record.id);
        continue;
      }

      // Delivered but still queued means it will be sent again next time
      match self.queue.remove(kind, &record.id) {
        Ok(_) => {
          self.outbox.notify(completion_notification(kind, &record));
          report.delivered.push(record.id);
        }
        Err(e) => {
          warn!(entity = %kind, id = %record.id, error = %e, "Delivered but could not dequeue");
          report.failed.push(record.id);
        }
      }
    }

    info!(
      entity = %kind,
      delivered = report.delivered.len(),
      failed = report.failed.len(),
      "Sync finished"
    );
    self.outbox.send(Outbound::SyncCompleted {
      report: report.clone(),
    });
    Ok(report)
  }
}

/// Localized "synced" notification for a delivered record.
fn completion_notification(kind: EntityKind, record: &PendingRecord) -> Notification {
  let id = &record.id;
  match kind {
    EntityKind::Customer => {
      let name = [record.field("firstName"), record.field("lastName")]
        .into_iter()
        .flatten()
        .collect::<Vec<_>>()
        .join(" ");
      let name = if name.is_empty() { id.clone() } else { name };
      Notification::new(
        "همگام‌سازی مشتریان",
        format!("مشتری {} با موفقیت همگام‌سازی شد", name),
      )
      .with_tag("customer-sync")
      .with_data(json!({ "customerId": id }))
    }
    EntityKind::Sale => {
      let body = match record.field("total") {
        Some(total) => format!("فروش {} با مبلغ {} تومان همگام‌سازی شد", id, total),
        None => format!("فروش {} همگام‌سازی شد", id),
      };
      Notification::new("همگام‌سازی فروش‌ها", body)
        .with_tag("sale-sync")
        .with_data(json!({ "saleId": id }))
    }
    EntityKind::Reminder => {
      let title = record.field("title").unwrap_or_else(|| id.clone());
      Notification::new(
        "همگام‌سازی یادآوری‌ها",
        format!("یادآوری {} همگام‌سازی شد", title),
      )
      .with_tag("reminder-sync")
      .with_data(json!({ "reminderId": id }))
    }
  }
}
