//! Which requests the cache manager governs and which responses it keeps.

use reqwest::Method;
use url::Url;

use super::traits::Request;

/// Extensions cached opportunistically when no list is configured.
pub const DEFAULT_ASSET_EXTENSIONS: &[&str] = &["js", "css", "png", "jpg", "svg", "woff", "woff2"];

/// Request eligibility and static-asset matching rules.
#[derive(Debug, Clone)]
pub struct AssetPolicy {
  extensions: Vec<String>,
}

impl Default for AssetPolicy {
  fn default() -> Self {
    Self::new(DEFAULT_ASSET_EXTENSIONS.iter().map(|e| e.to_string()))
  }
}

impl AssetPolicy {
  /// Leading dots are ignored, so `".js"` and `"js"` are the same rule.
  pub fn new(extensions: impl IntoIterator<Item = String>) -> Self {
    Self {
      extensions: extensions
        .into_iter()
        .map(|e| e.trim_start_matches('.').to_string())
        .filter(|e| !e.is_empty())
        .collect(),
    }
  }

  /// Only `GET` over http(s) is intercepted; everything else is left alone.
  pub fn is_eligible(&self, request: &Request) -> bool {
    request.method == Method::GET && matches!(request.url.scheme(), "http" | "https")
  }

  /// Case-sensitive extension match on the URL path, query excluded.
  pub fn is_static_asset(&self, url: &Url) -> bool {
    let path = url.path();
    let file = path.rsplit('/').next().unwrap_or(path);
    match file.rsplit_once('.') {
      Some((stem, ext)) if !stem.is_empty() => self.extensions.iter().any(|e| e == ext),
      _ => false,
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn url(s: &str) -> Url {
    Url::parse(s).unwrap()
  }

  #[test]
  fn test_default_extensions_match() {
    let policy = AssetPolicy::default();
    for path in [
      "/app.js",
      "/styles/main.css",
      "/icons/icon.png",
      "/photo.jpg",
      "/logo.svg",
      "/fonts/a.woff",
      "/fonts/a.woff2",
    ] {
      assert!(
        policy.is_static_asset(&url(&format!("https://example.com{}", path))),
        "{} should be an asset",
        path
      );
    }
  }

  #[test]
  fn test_non_assets() {
    let policy = AssetPolicy::default();
    assert!(!policy.is_static_asset(&url("https://example.com/api/data")));
    assert!(!policy.is_static_asset(&url("https://example.com/index.html")));
    assert!(!policy.is_static_asset(&url("https://example.com/")));
    assert!(!policy.is_static_asset(&url("https://example.com/js/")));
    assert!(!policy.is_static_asset(&url("https://example.com/.js")));
  }

  #[test]
  fn test_query_is_ignored() {
    let policy = AssetPolicy::default();
    assert!(policy.is_static_asset(&url("https://example.com/app.js?v=3")));
    assert!(!policy.is_static_asset(&url("https://example.com/api?file=a.js")));
  }

  #[test]
  fn test_match_is_case_sensitive() {
    let policy = AssetPolicy::default();
    assert!(!policy.is_static_asset(&url("https://example.com/APP.JS")));
    assert!(!policy.is_static_asset(&url("https://example.com/photo.JPG")));
  }

  #[test]
  fn test_custom_extensions() {
    let policy = AssetPolicy::new(vec![".wasm".to_string(), String::new()]);
    assert_eq!(policy.extensions, vec!["wasm".to_string()]);
    assert!(policy.is_static_asset(&url("https://example.com/pkg/app.wasm")));
    assert!(!policy.is_static_asset(&url("https://example.com/app.js")));
  }

  #[test]
  fn test_eligibility() {
    let policy = AssetPolicy::default();
    let get = Request::get(url("https://example.com/app.js"));
    assert!(policy.is_eligible(&get));
    assert!(policy.is_eligible(&Request::navigate(url("http://example.com/"))));
    assert!(!policy.is_eligible(&get.clone().with_method(Method::POST)));
    assert!(!policy.is_eligible(&get.clone().with_method(Method::DELETE)));
    assert!(!policy.is_eligible(&Request::get(url("file:///tmp/app.js"))));
    assert!(!policy.is_eligible(&Request::get(url("data:text/plain,hi"))));
  }
}
