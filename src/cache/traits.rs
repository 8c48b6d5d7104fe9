//! Core types for the offline cache: requests, response snapshots and the network seam.

use chrono::{DateTime, Utc};
use color_eyre::Result;
use reqwest::Method;
use sha2::{Digest, Sha256};
use std::future::Future;
use url::Url;

/// Whether a request loads a full document or a sub-resource.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RequestMode {
  /// Top-level document load
  Navigate,
  /// Script, stylesheet, image, XHR...
  #[default]
  Subresource,
}

/// An outbound request from a governed client.
#[derive(Debug, Clone)]
pub struct Request {
  pub method: Method,
  pub url: Url,
  pub mode: RequestMode,
  pub headers: Vec<(String, String)>,
}

impl Request {
  /// A sub-resource `GET` request.
  pub fn get(url: Url) -> Self {
    Self {
      method: Method::GET,
      url,
      mode: RequestMode::Subresource,
      headers: Vec::new(),
    }
  }

  /// A navigation `GET` request.
  pub fn navigate(url: Url) -> Self {
    Self {
      mode: RequestMode::Navigate,
      ..Self::get(url)
    }
  }

  pub fn with_method(mut self, method: Method) -> Self {
    self.method = method;
    self
  }

  pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
    self.headers.push((name.into(), value.into()));
    self
  }

  pub fn is_navigation(&self) -> bool {
    self.mode == RequestMode::Navigate
  }

  /// Normalized identity of this request in a cache generation.
  pub fn cache_key(&self) -> RequestKey {
    RequestKey::new(&self.method, &self.url)
  }
}

/// Normalized request identity: method plus URL without fragment.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RequestKey {
  description: String,
}

impl RequestKey {
  pub fn new(method: &Method, url: &Url) -> Self {
    let mut url = url.clone();
    url.set_fragment(None);
    Self {
      description: format!("{} {}", method.as_str().to_uppercase(), url),
    }
  }

  /// Human-readable form, e.g. `GET https://host/app.js`.
  pub fn description(&self) -> &str {
    &self.description
  }

  /// SHA256 hash for stable, fixed-length storage keys.
  pub fn digest(&self) -> String {
    let mut hasher = Sha256::new();
    hasher.update(self.description.as_bytes());
    hex::encode(hasher.finalize())
  }
}

/// Immutable copy of a response: status, headers and body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseSnapshot {
  pub status: u16,
  pub headers: Vec<(String, String)>,
  pub body: Vec<u8>,
}

impl ResponseSnapshot {
  pub fn new(status: u16, body: impl Into<Vec<u8>>) -> Self {
    Self {
      status,
      headers: Vec::new(),
      body: body.into(),
    }
  }

  pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
    self.headers.push((name.into(), value.into()));
    self
  }

  /// 2xx status.
  pub fn is_ok(&self) -> bool {
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

  /// The response served when neither network nor cache can answer.
  pub fn offline() -> Self {
    Self::new(503, "Offline").with_header("Content-Type", "text/plain")
  }
}

/// A snapshot read back from a cache generation.
#[derive(Debug, Clone)]
pub struct CachedSnapshot {
  pub snapshot: ResponseSnapshot,
  /// Generation the entry was found in
  pub generation: String,
  pub cached_at: DateTime<Utc>,
}

/// Where an intercepted response came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResponseSource {
  /// Fresh response from the network
  Network,
  /// Network failed, served a cached snapshot
  Cache { generation: String },
  /// Network failed on a navigation, served the offline page
  OfflinePage,
  /// Nothing available, synthesized 503
  Unavailable,
}

/// The answer to an intercepted request.
#[derive(Debug, Clone)]
pub struct FetchResponse {
  pub snapshot: ResponseSnapshot,
  pub source: ResponseSource,
}

/// Network seam used by the cache manager.
///
/// Any resolved HTTP response (including 4xx/5xx) is `Ok`; `Err` means the
/// request never produced a response (offline, DNS failure, timeout).
pub trait Fetcher: Send + Sync {
  fn fetch(&self, request: &Request) -> impl Future<Output = Result<ResponseSnapshot>> + Send;
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_cache_key_strips_fragment() {
    let a = Url::parse("https://example.com/app.js#top").unwrap();
    let b = Url::parse("https://example.com/app.js").unwrap();
    assert_eq!(
      RequestKey::new(&Method::GET, &a),
      RequestKey::new(&Method::GET, &b)
    );
  }

  #[test]
  fn test_cache_key_keeps_query() {
    let a = Url::parse("https://example.com/app.js?v=1").unwrap();
    let b = Url::parse("https://example.com/app.js?v=2").unwrap();
    assert_ne!(
      RequestKey::new(&Method::GET, &a).digest(),
      RequestKey::new(&Method::GET, &b).digest()
    );
  }

  #[test]
  fn test_cache_key_description() {
    let url = Url::parse("https://example.com/offline.html").unwrap();
    let key = Request::get(url).cache_key();
    assert_eq!(key.description(), "GET https://example.com/offline.html");
    assert_eq!(key.digest().len(), 64);
  }

  #[test]
  fn test_offline_snapshot() {
    let snapshot = ResponseSnapshot::offline();
    assert_eq!(snapshot.status, 503);
    assert_eq!(snapshot.body, b"Offline");
    assert_eq!(snapshot.header("content-type"), Some("text/plain"));
    assert!(!snapshot.is_ok());
  }

  #[test]
  fn test_is_ok_range() {
    assert!(ResponseSnapshot::new(200, "").is_ok());
    assert!(ResponseSnapshot::new(204, "").is_ok());
    assert!(!ResponseSnapshot::new(304, "").is_ok());
    assert!(!ResponseSnapshot::new(404, "").is_ok());
  }
}
