use crate::event::{Event, EventHandler};
use crate::worker::{Outbound, Worker};
use color_eyre::{eyre::eyre, Result};
use std::io::Write;
use tokio::sync::mpsc;
use tracing::{info, warn};

/// Main application: feeds platform events to the worker and writes its
/// outputs as newline-delimited JSON
pub struct App<W: Write> {
  worker: Worker,

  /// Outputs produced by the worker and its timers
  outputs: mpsc::UnboundedReceiver<Outbound>,

  /// Protocol channel, stdout in production
  out: W,
}

impl<W: Write> App<W> {
  pub fn new(worker: Worker, outputs: mpsc::UnboundedReceiver<Outbound>, out: W) -> Self {
    Self {
      worker,
      outputs,
      out,
    }
  }

  /// Run until the input is exhausted. With `keep_alive`, keep emitting timer
  /// outputs (reminder alarms) until interrupted.
  pub async fn run(&mut self, mut events: EventHandler, keep_alive: bool) -> Result<()> {
    match self.worker.boot().await {
      Ok(state) => info!(state = %state, version = %self.worker.lifecycle().version_name(), "Worker ready"),
      // Already reported as a lifecycle output; a later install event can retry
      Err(e) => warn!(error = %e, "Worker did not reach the active state"),
    }
    self.flush()?;

    loop {
      tokio::select! {
        event = events.next() => match event {
          Some(event) => {
            self.dispatch(event).await;
            self.flush()?;
          }
          None => break,
        },
        Some(output) = self.outputs.recv() => self.write(&output)?,
      }
    }

    // Let in-flight fetches and sync runs answer before leaving
    loop {
      tokio::select! {
        _ = self.worker.settle() => break,
        Some(output) = self.outputs.recv() => self.write(&output)?,
      }
    }
    self.flush()?;

    if keep_alive {
      info!("Input closed, waiting for timers until interrupted");
      loop {
        tokio::select! {
          _ = tokio::signal::ctrl_c() => break,
          Some(output) = self.outputs.recv() => self.write(&output)?,
        }
      }
    }

    self.flush()
  }

  /// Handle a fixed sequence of events, for one-shot commands.
  pub async fn run_events(&mut self, events: Vec<Event>) -> Result<()> {
    for event in events {
      self.dispatch(event).await;
      self.flush()?;
    }
    self.worker.settle().await;
    self.flush()
  }

  pub fn worker_mut(&mut self) -> &mut Worker {
    &mut self.worker
  }

  async fn dispatch(&mut self, event: Event) {
    if let Err(e) = self.worker.handle(event).await {
      warn!(error = %e, "Event handling failed");
    }
  }

  /// Write every output produced so far.
  fn flush(&mut self) -> Result<()> {
    while let Ok(output) = self.outputs.try_recv() {
      self.write(&output)?;
    }
    Ok(())
  }

  fn write(&mut self, output: &Outbound) -> Result<()> {
    let line =
      serde_json::to_string(output).map_err(|e| eyre!("Failed to serialize output: {}", e))?;
    writeln!(self.out, "{}", line).map_err(|e| eyre!("Failed to write output: {}", e))?;
    self
      .out
      .flush()
      .map_err(|e| eyre!("Failed to write output: {}", e))
  }
}
