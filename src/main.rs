mod app;
mod cache;
mod commands;
mod config;
mod db;
mod event;
mod net;
mod queue;
#[cfg(test)]
mod testing;
mod worker;

use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use cache::{MemoryStorage, ResponseStore, SqliteStorage};
use config::{Config, LoggingConfig};
use event::{Event, EventHandler};
use net::{Delivery, Destination, DryRunDelivery, HttpDelivery, HttpFetcher};
use queue::{EntityKind, MemoryQueue, PendingStore, SqliteQueue};
use worker::{Context, LifecycleState, Outbound, Outbox, Worker};

#[derive(Parser, Debug)]
#[command(name = "pcrm-worker")]
#[command(about = "Offline cache, background sync and reminder alerts for the Persian CRM")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/pcrm-worker/config.yaml)
  #[arg(short, long, global = true)]
  config: Option<PathBuf>,

  /// Keep cache and queue in memory instead of the database
  #[arg(long, global = true)]
  ephemeral: bool,

  #[command(subcommand)]
  command: Option<Cmd>,
}

#[derive(Subcommand, Debug)]
enum Cmd {
  /// Process newline-delimited JSON events from stdin (default)
  Run {
    /// Keep reminder alarms running after stdin closes, until interrupted
    #[arg(long)]
    keep_alive: bool,
  },
  /// Pre-cache the asset manifest (and activate unless waiting is configured)
  Install,
  /// Activate an installed version, dropping stale cache partitions
  Activate,
  /// Fetch a URL through the interceptor
  Fetch {
    /// Absolute URL or path relative to the origin
    url: String,
    /// Treat the request as a page navigation
    #[arg(long)]
    document: bool,
  },
  /// Queue a write for later delivery
  Enqueue {
    entity: EntityKind,
    /// JSON object with an `id` field
    record: String,
  },
  /// List queued writes
  Pending { entity: Option<EntityKind> },
  /// Deliver queued writes now
  Sync { entity: Option<EntityKind> },
  /// Raise urgent alerts for reminders due within the window
  CheckReminders,
  /// Print the worker version name
  Version,
}

/// Initialize the tracing subscriber for logging.
///
/// stdout carries the event protocol, so logs go to stderr or a daily log file.
/// RUST_LOG overrides the configured filter.
fn init_tracing(logging: &LoggingConfig) -> Result<Option<WorkerGuard>> {
  let filter = EnvFilter::try_from_default_env()
    .or_else(|_| EnvFilter::try_new(&logging.filter))
    .map_err(|e| eyre!("Invalid log filter '{}': {}", logging.filter, e))?;

  match &logging.directory {
    Some(directory) => {
      let appender = tracing_appender::rolling::daily(directory, "pcrm-worker.log");
      let (writer, guard) = tracing_appender::non_blocking(appender);
      tracing_subscriber::registry()
        .with(fmt::layer().with_writer(writer).with_ansi(false))
        .with(filter)
        .init();
      Ok(Some(guard))
    }
    None => {
      tracing_subscriber::registry()
        .with(fmt::layer().with_writer(io::stderr))
        .with(filter)
        .init();
      Ok(None)
    }
  }
}

/// Wire storage and capabilities into a worker context.
fn build_context(
  config: Config,
  ephemeral: bool,
) -> Result<(Context, mpsc::UnboundedReceiver<Outbound>)> {
  let (storage, queue): (Arc<dyn ResponseStore>, Arc<dyn PendingStore>) = if ephemeral {
    (Arc::new(MemoryStorage::new()), Arc::new(MemoryQueue::new()))
  } else {
    let db = db::Database::open(config.database.as_deref())?;
    (
      Arc::new(SqliteStorage::new(db.clone())),
      Arc::new(SqliteQueue::new(db)),
    )
  };

  let delivery: Arc<dyn Delivery> = match &config.remote {
    Some(remote) => Arc::new(HttpDelivery::new(remote.url.clone(), Config::remote_token())?),
    None => {
      info!("No remote configured, pending writes are acknowledged locally");
      Arc::new(DryRunDelivery)
    }
  };

  let (outbox, outputs) = Outbox::new();
  let ctx = Context {
    config,
    storage,
    queue,
    fetcher: Arc::new(HttpFetcher::new()?),
    delivery,
    outbox,
  };
  Ok((ctx, outputs))
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();

  // Load configuration
  let config = Config::load(args.config.as_deref())?;
  let _log_guard = init_tracing(&config.logging)?;

  let command = args.command.unwrap_or(Cmd::Run { keep_alive: false });
  if let Cmd::Version = command {
    println!("{}", config.cache.version_name());
    return Ok(());
  }

  let check_interval = config.reminders.check_interval();
  let (ctx, outputs) = build_context(config, args.ephemeral)?;

  if let Cmd::Pending { entity } = command {
    let kinds = entity.map(|k| vec![k]).unwrap_or_else(|| EntityKind::ALL.to_vec());
    for kind in kinds {
      for record in ctx.queue.list(kind)? {
        let line = serde_json::json!({ "entity": kind, "id": record.id, "record": record.payload });
        println!("{}", line);
      }
    }
    return Ok(());
  }

  let worker = Worker::new(ctx)?;
  let mut app = app::App::new(worker, outputs, io::stdout());

  let events = match command {
    Cmd::Run { keep_alive } => {
      return app.run(EventHandler::new(check_interval), keep_alive).await;
    }
    Cmd::Install => {
      app.run_events(vec![Event::Install]).await?;
      return match app.worker_mut().lifecycle().state() {
        LifecycleState::Installed | LifecycleState::Active => Ok(()),
        state => Err(eyre!("Install did not complete (state: {})", state)),
      };
    }
    Cmd::Activate => vec![Event::Activate],
    Cmd::Fetch { url, document } => vec![Event::Fetch {
      id: None,
      method: None,
      url,
      destination: if document {
        Destination::Document
      } else {
        Destination::Empty
      },
      body: None,
    }],
    Cmd::Enqueue { entity, record } => {
      let record = serde_json::from_str(&record).map_err(|e| eyre!("Invalid record JSON: {}", e))?;
      vec![Event::Enqueue { entity, record }]
    }
    Cmd::Sync { entity } => entity
      .map(|k| vec![k])
      .unwrap_or_else(|| EntityKind::ALL.to_vec())
      .into_iter()
      .map(|kind| Event::Sync {
        tag: kind.sync_tag().to_string(),
      })
      .collect(),
    Cmd::CheckReminders => vec![Event::reminder_check()],
    Cmd::Pending { .. } | Cmd::Version => Vec::new(),
  };

  // One-shot commands act on the state left by previous runs
  app.worker_mut().resume()?;
  app.run_events(events).await
}
