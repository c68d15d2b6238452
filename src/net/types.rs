use base64::{engine::general_purpose::STANDARD, Engine as _};
use color_eyre::{eyre::eyre, Result};
use serde::{Deserialize, Serialize};
#[cfg(test)]
use std::borrow::Cow;
use url::Url;

/// What the requester intends to do with the response.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Destination {
  /// Top-level navigation
  Document,
  Script,
  Style,
  Image,
  Font,
  /// fetch()/XHR and anything unclassified
  #[default]
  #[serde(other)]
  Empty,
}

/// An outgoing request seen at the interception boundary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
  pub method: String,
  pub url: Url,
  pub destination: Destination,
  pub headers: Vec<(String, String)>,
  pub body: Option<Vec<u8>>,
}

impl Request {
  /// A plain GET for an absolute URL.
  pub fn get(url: Url) -> Self {
    Self {
      method: "GET".to_string(),
      url,
      destination: Destination::Empty,
      headers: Vec::new(),
      body: None,
    }
  }

  /// Build a request from wire fields, resolving `url` against `base` when relative.
  pub fn resolve(method: Option<&str>, url: &str, base: &Url) -> Result<Self> {
    let url = base
      .join(url)
      .map_err(|e| eyre!("Invalid request URL '{}': {}", url, e))?;
    Ok(Self {
      method: method.unwrap_or("GET").to_ascii_uppercase(),
      ..Self::get(url)
    })
  }

  pub fn with_destination(mut self, destination: Destination) -> Self {
    self.destination = destination;
    self
  }

  pub fn is_get(&self) -> bool {
    self.method.eq_ignore_ascii_case("GET")
  }
}

/// Transfer encoding of a body carried in a JSON output. Absent means UTF-8 text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BodyEncoding {
  Base64,
}

/// A response as delivered to the requester.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Response {
  pub status: u16,
  pub status_text: String,
  pub headers: Vec<(String, String)>,
  #[serde(default)]
  pub body: Vec<u8>,
}

const OFFLINE_DOCUMENT: &str = r#"<!DOCTYPE html>
<html lang="fa" dir="rtl">
<head><meta charset="utf-8"><title>آفلاین</title></head>
<body><h1>اتصال برقرار نیست</h1><p>محتوا در حالت آفلاین در دسترس نیست.</p></body>
</html>
"#;

impl Response {
  pub fn new(status: u16, status_text: impl Into<String>) -> Self {
    Self {
      status,
      status_text: status_text.into(),
      headers: Vec::new(),
      body: Vec::new(),
    }
  }

  pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
    self.headers.push((name.into(), value.into()));
    self
  }

  pub fn with_body(mut self, body: impl Into<Vec<u8>>) -> Self {
    self.body = body.into();
    self
  }

  /// Synthetic 503 carrying a short offline message.
  pub fn offline_text(message: &str) -> Self {
    Self::new(503, "Service Unavailable")
      .with_header("Content-Type", "text/plain; charset=utf-8")
      .with_body(message.as_bytes())
  }

  /// Built-in offline page, used when no offline document is cached.
  pub fn offline_document() -> Self {
    Self::new(503, "Service Unavailable")
      .with_header("Content-Type", "text/html; charset=utf-8")
      .with_body(OFFLINE_DOCUMENT.as_bytes())
  }

  /// 2xx
  pub fn is_success(&self) -> bool {
    (200..300).contains(&self.status)
  }

  /// Case-insensitive header lookup.
  pub fn header(&self, name: &str) -> Option<&str> {
    self
      .headers
      .iter()
      .find(|(k, _)| k.eq_ignore_ascii_case(name))
      .map(|(_, v)| v.as_str())
  }

  pub fn content_type(&self) -> Option<&str> {
    self.header("Content-Type")
  }

  #[cfg(test)]
  pub fn text(&self) -> Cow<'_, str> {
    String::from_utf8_lossy(&self.body)
  }

  /// Body as it travels over the text protocol: UTF-8 bodies verbatim, anything
  /// else base64 so images and fonts arrive byte-exact.
  pub fn encoded_body(&self) -> (String, Option<BodyEncoding>) {
    match std::str::from_utf8(&self.body) {
      Ok(text) => (text.to_string(), None),
      Err(_) => (STANDARD.encode(&self.body), Some(BodyEncoding::Base64)),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_resolve_relative_url() {
    let base = Url::parse("https://crm.example.ir/").unwrap();
    let req = Request::resolve(None, "/sales.html", &base).unwrap();
    assert_eq!(req.url.as_str(), "https://crm.example.ir/sales.html");
    assert!(req.is_get());

    let req = Request::resolve(Some("post"), "https://api.example.com/x", &base).unwrap();
    assert_eq!(req.method, "POST");
    assert!(!req.is_get());
  }

  #[test]
  fn test_offline_text_is_503_plain_text() {
    let resp = Response::offline_text("Offline");
    assert_eq!(resp.status, 503);
    assert!(!resp.is_success());
    assert_eq!(resp.content_type(), Some("text/plain; charset=utf-8"));
    assert_eq!(resp.text(), "Offline");
  }

  #[test]
  fn test_binary_body_is_base64() {
    let jpeg = Response::new(200, "OK")
      .with_header("Content-Type", "image/jpeg")
      .with_body(vec![0xFF, 0xD8, 0xFF, 0xE0, 0x00, 0x10]);
    let (body, encoding) = jpeg.encoded_body();
    assert_eq!(encoding, Some(BodyEncoding::Base64));
    assert_eq!(STANDARD.decode(body).unwrap(), jpeg.body);

    let page = Response::new(200, "OK").with_body("<p>سلام</p>".as_bytes());
    assert_eq!(page.encoded_body(), ("<p>سلام</p>".to_string(), None));
  }

  #[test]
  fn test_unknown_destination_is_empty() {
    let d: Destination = serde_json::from_str("\"audioworklet\"").unwrap();
    assert_eq!(d, Destination::Empty);
    let d: Destination = serde_json::from_str("\"document\"").unwrap();
    assert_eq!(d, Destination::Document);
  }
}
