//! Delivery of pending writes to the remote CRM backend.

use async_trait::async_trait;
use color_eyre::{eyre::eyre, Result};
use tracing::info;
use url::Url;

use crate::queue::{EntityKind, PendingRecord};

/// Hands a pending record to the remote system.
///
/// `Ok` means the remote acknowledged the write and the record may be dequeued.
#[async_trait]
pub trait Delivery: Send + Sync {
  async fn deliver(&self, kind: EntityKind, record: &PendingRecord) -> Result<()>;
}

/// Maximum length for error response bodies in error messages
const MAX_ERROR_BODY_LENGTH: usize = 500;

/// POSTs each record as JSON to `<base>/<collection>`.
#[derive(Clone)]
pub struct HttpDelivery {
  client: reqwest::Client,
  base_url: Url,
  token: Option<String>,
}

impl HttpDelivery {
  pub fn new(base_url: Url, token: Option<String>) -> Result<Self> {
    let client = reqwest::Client::builder()
      .user_agent(concat!("pcrm-worker/", env!("CARGO_PKG_VERSION")))
      .timeout(std::time::Duration::from_secs(super::REQUEST_TIMEOUT_SECS))
      .build()
      .map_err(|e| eyre!("Failed to create HTTP client: {}", e))?;

    Ok(Self {
      client,
      base_url,
      token,
    })
  }

  fn endpoint(&self, kind: EntityKind) -> Result<Url> {
    // Keep any path prefix on the base URL
    let mut base = self.base_url.clone();
    if !base.path().ends_with('/') {
      base.set_path(&format!("{}/", base.path()));
    }
    base
      .join(kind.collection())
      .map_err(|e| eyre!("Invalid delivery endpoint for {}: {}", kind, e))
  }
}

#[async_trait]
impl Delivery for HttpDelivery {
  async fn deliver(&self, kind: EntityKind, record: &PendingRecord) -> Result<()> {
    let url = self.endpoint(kind)?;
    let mut builder = self.client.post(url.clone()).json(&record.payload);
    if let Some(token) = &self.token {
      builder = builder.bearer_auth(token);
    }

    let resp = builder
      .send()
      .await
      .map_err(|e| eyre!("Failed to deliver {} {}: {}", kind, record.id, e))?;

    let status = resp.status();
    if status.is_success() {
      return Ok(());
    }

    let body = resp.text().await.unwrap_or_default();
    let body: String = body.chars().take(MAX_ERROR_BODY_LENGTH).collect();
    Err(eyre!(
      "Remote rejected {} {} with status {}: {}",
      kind,
      record.id,
      status,
      body
    ))
  }
}

/// Acknowledges every record without contacting anything.
///
/// Used when no remote endpoint is configured.
#[derive(Debug, Clone, Copy, Default)]
pub struct DryRunDelivery;

#[async_trait]
impl Delivery for DryRunDelivery {
  async fn deliver(&self, kind: EntityKind, record: &PendingRecord) -> Result<()> {
    info!(entity = %kind, id = %record.id, "No remote configured, acknowledging locally");
    Ok(())
  }
}
