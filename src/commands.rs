//! CLI subcommands and their handlers

use clap::Subcommand;
use color_eyre::{eyre::eyre, Result};
use reqwest::Method;
use std::io::Write;
use std::path::PathBuf;
use url::Url;

use crate::cache::{
  CacheStore, FetchResponse, Fetcher, OfflineCacheManager, Request, ResponseSource,
};
use crate::net::HttpClient;

#[derive(Subcommand, Debug)]
pub enum Command {
  /// Pre-cache the offline manifest into the current cache generation
  Install,
  /// Put the installed current generation in control and delete the others
  Activate,
  /// Install, then activate right away unless skip_waiting is off
  Update,
  /// Fetch a URL (or origin-relative path) through the offline cache
  Fetch {
    /// Absolute URL or path relative to the origin
    target: String,

    /// HTTP method
    #[arg(short = 'X', long, default_value = "GET")]
    method: String,

    /// Treat the request as a full-page navigation
    #[arg(long)]
    navigate: bool,

    /// Extra request header, as `Name: value` (repeatable)
    #[arg(short = 'H', long = "header")]
    headers: Vec<String>,

    /// Write the body here instead of stdout
    #[arg(short, long)]
    output: Option<PathBuf>,
  },
  /// List cache generations with their state and entry counts
  Status,
}

pub async fn run<S: CacheStore + 'static>(
  command: Command,
  manager: &OfflineCacheManager<S, HttpClient>,
  client: &HttpClient,
  store: &S,
) -> Result<()> {
  match command {
    Command::Install => install(manager).await.map(|_| ()),
    Command::Activate => activate(manager),
    Command::Update => {
      let skip_waiting = install(manager).await?;
      if skip_waiting {
        activate(manager)
      } else {
        println!(
          "{} is waiting; run `activate` to take over",
          manager.settings().version()
        );
        Ok(())
      }
    }
    Command::Fetch {
      target,
      method,
      navigate,
      headers,
      output,
    } => {
      let request = build_request(manager.settings().origin(), &target, &method, navigate, &headers)?;
      let response = fetch(manager, client, &request).await;
      // Let opportunistic writes land before the process exits
      manager.settle().await;
      write_response(&response?, output)
    }
    Command::Status => status(manager, store),
  }
}

async fn install<S: CacheStore + 'static, F: Fetcher>(
  manager: &OfflineCacheManager<S, F>,
) -> Result<bool> {
  let report = manager.install().await?;
  println!("Installed {}:", report.generation);
  for url in &report.cached {
    println!("  {}", url);
  }
  Ok(report.skip_waiting)
}

fn activate<S: CacheStore + 'static, F: Fetcher>(manager: &OfflineCacheManager<S, F>) -> Result<()> {
  let report = manager.activate()?;
  if report.deleted.is_empty() {
    println!("Activated {} (nothing to clean up)", report.generation);
  } else {
    println!(
      "Activated {}, deleted: {}",
      report.generation,
      report.deleted.join(", ")
    );
  }
  Ok(())
}

/// Intercepted requests never fail; bypassed ones go straight to the network.
async fn fetch<S: CacheStore + 'static>(
  manager: &OfflineCacheManager<S, HttpClient>,
  client: &HttpClient,
  request: &Request,
) -> Result<FetchResponse> {
  if let Some(response) = manager.handle_fetch(request).await {
    return Ok(response);
  }

  let snapshot = client.send(request).await?;
  Ok(FetchResponse {
    snapshot,
    source: ResponseSource::Network,
  })
}

fn status<S: CacheStore + 'static, F: Fetcher>(
  manager: &OfflineCacheManager<S, F>,
  store: &S,
) -> Result<()> {
  let configured = manager.settings().version();
  let active = store.active_generation()?;
  let generations = store.generations()?;

  if generations.is_empty() {
    println!("No cache generations");
    return Ok(());
  }

  for name in generations {
    let state = generation_state(
      active.as_deref() == Some(name.as_str()),
      store.is_installed(&name)?,
    );
    let marker = if name == configured { "*" } else { " " };
    println!(
      "{} {} [{}] ({} entries)",
      marker,
      name,
      state,
      store.entry_count(&name)?
    );
  }
  Ok(())
}

fn generation_state(active: bool, installed: bool) -> &'static str {
  match (active, installed) {
    (true, _) => "active",
    (false, true) => "waiting",
    (false, false) => "not installed",
  }
}

fn write_response(response: &FetchResponse, output: Option<PathBuf>) -> Result<()> {
  eprintln!(
    "{} ({}) {}",
    response.snapshot.status,
    describe_source(&response.source),
    response.snapshot.header("content-type").unwrap_or("-")
  );

  match output {
    Some(path) => std::fs::write(&path, &response.snapshot.body)
      .map_err(|e| eyre!("Failed to write {}: {}", path.display(), e)),
    None => {
      let mut stdout = std::io::stdout().lock();
      stdout.write_all(&response.snapshot.body)?;
      stdout.flush()?;
      Ok(())
    }
  }
}

fn describe_source(source: &ResponseSource) -> String {
  match source {
    ResponseSource::Network => "network".to_string(),
    ResponseSource::Cache { generation } => format!("cache {}", generation),
    ResponseSource::OfflinePage => "offline page".to_string(),
    ResponseSource::Unavailable => "offline".to_string(),
  }
}

fn build_request(
  origin: &Url,
  target: &str,
  method: &str,
  navigate: bool,
  headers: &[String],
) -> Result<Request> {
  let url = Url::parse(target)
    .or_else(|_| origin.join(target))
    .map_err(|e| eyre!("Invalid URL '{}': {}", target, e))?;

  let method = Method::from_bytes(method.to_uppercase().as_bytes())
    .map_err(|e| eyre!("Invalid method '{}': {}", method, e))?;

  let mut request = if navigate {
    Request::navigate(url)
  } else {
    Request::get(url)
  }
  .with_method(method);

  for header in headers {
    let (name, value) = header
      .split_once(':')
      .ok_or_else(|| eyre!("Invalid header '{}', expected `Name: value`", header))?;
    request = request.with_header(name.trim(), value.trim());
  }

  Ok(request)
}

#[cfg(test)]
mod tests {
  use super::*;

  fn origin() -> Url {
    Url::parse("https://contracts.example.com").unwrap()
  }

  #[test]
  fn test_relative_target_uses_origin() {
    let request = build_request(&origin(), "/app.js", "get", false, &[]).unwrap();
    assert_eq!(request.url.as_str(), "https://contracts.example.com/app.js");
    assert_eq!(request.method, Method::GET);
    assert!(!request.is_navigation());
  }

  #[test]
  fn test_absolute_target() {
    let request =
      build_request(&origin(), "https://cdn.example.com/font.woff2", "GET", true, &[]).unwrap();
    assert_eq!(request.url.host_str(), Some("cdn.example.com"));
    assert!(request.is_navigation());
  }

  #[test]
  fn test_headers_and_method() {
    let headers = vec!["Accept: text/html".to_string(), "X-Trace:abc".to_string()];
    let request = build_request(&origin(), "/contracts", "post", false, &headers).unwrap();
    assert_eq!(request.method, Method::POST);
    assert_eq!(
      request.headers,
      vec![
        ("Accept".to_string(), "text/html".to_string()),
        ("X-Trace".to_string(), "abc".to_string()),
      ]
    );
  }

  #[test]
  fn test_invalid_header() {
    let headers = vec!["no-colon".to_string()];
    assert!(build_request(&origin(), "/", "GET", false, &headers).is_err());
  }

  #[test]
  fn test_generation_state() {
    assert_eq!(generation_state(true, true), "active");
    assert_eq!(generation_state(false, true), "waiting");
    assert_eq!(generation_state(false, false), "not installed");
  }

  #[test]
  fn test_describe_source() {
    assert_eq!(describe_source(&ResponseSource::Network), "network");
    assert_eq!(
      describe_source(&ResponseSource::Cache {
        generation: "v2".to_string()
      }),
      "cache v2"
    );
    assert_eq!(describe_source(&ResponseSource::Unavailable), "offline");
  }
}
