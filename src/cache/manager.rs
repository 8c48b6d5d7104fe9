//! Offline cache manager: install, activation and network-first interception.

use color_eyre::{eyre::eyre, Result};
use futures::future::try_join_all;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};
use url::Url;

use super::policy::AssetPolicy;
use super::storage::CacheStore;
use super::traits::{
  CachedSnapshot, FetchResponse, Fetcher, Request, RequestKey, ResponseSnapshot, ResponseSource,
};

/// Static configuration of a cache manager instance.
#[derive(Debug, Clone)]
pub struct ManagerSettings {
  version: String,
  origin: Url,
  offline_page: Url,
  manifest: Vec<Url>,
  policy: AssetPolicy,
  skip_waiting: bool,
}

impl ManagerSettings {
  /// Resolve the offline page and manifest paths against `origin`.
  pub fn new(
    version: impl Into<String>,
    origin: Url,
    offline_page: &str,
    manifest: &[String],
  ) -> Result<Self> {
    let version = version.into();
    if version.trim().is_empty() {
      return Err(eyre!("Cache version must not be empty"));
    }

    let resolve = |path: &str| {
      origin
        .join(path)
        .map_err(|e| eyre!("Invalid path '{}' for origin {}: {}", path, origin, e))
    };

    let offline_page = resolve(offline_page)?;
    let manifest = manifest
      .iter()
      .map(|p| resolve(p))
      .collect::<Result<Vec<_>>>()?;

    Ok(Self {
      version,
      origin,
      offline_page,
      manifest,
      policy: AssetPolicy::default(),
      skip_waiting: true,
    })
  }

  pub fn with_policy(mut self, policy: AssetPolicy) -> Self {
    self.policy = policy;
    self
  }

  pub fn with_skip_waiting(mut self, skip_waiting: bool) -> Self {
    self.skip_waiting = skip_waiting;
    self
  }

  /// Name of the current cache generation.
  pub fn version(&self) -> &str {
    &self.version
  }

  pub fn origin(&self) -> &Url {
    &self.origin
  }

  pub fn skip_waiting(&self) -> bool {
    self.skip_waiting
  }
}

/// Outcome of a successful install phase.
#[derive(Debug, Clone)]
pub struct InstallReport {
  pub generation: String,
  /// Manifest URLs now held by the generation
  pub cached: Vec<Url>,
  /// Whether the new version takes over without waiting for old clients
  pub skip_waiting: bool,
}

/// Outcome of an activation phase.
#[derive(Debug, Clone)]
pub struct ActivationReport {
  pub generation: String,
  /// Stale generations removed
  pub deleted: Vec<String>,
}

/// Network-first cache manager with versioned cache generations.
///
/// Sits between a client and the network: every eligible request goes to
/// the network first, successful static assets are copied into the active
/// generation in the background, and failures degrade to cached snapshots,
/// the offline page, or a synthesized 503.
pub struct OfflineCacheManager<S: CacheStore + 'static, F: Fetcher> {
  store: Arc<S>,
  fetcher: Arc<F>,
  settings: Arc<ManagerSettings>,
  writes: Arc<Mutex<JoinSet<()>>>,
}

impl<S: CacheStore + 'static, F: Fetcher> OfflineCacheManager<S, F> {
  pub fn new(store: Arc<S>, fetcher: Arc<F>, settings: ManagerSettings) -> Self {
    Self {
      store,
      fetcher,
      settings: Arc::new(settings),
      writes: Arc::new(Mutex::new(JoinSet::new())),
    }
  }

  pub fn settings(&self) -> &ManagerSettings {
    &self.settings
  }

  /// Pre-cache the offline manifest into the current generation.
  ///
  /// All-or-nothing: if any entry fails to fetch or answers with a non-2xx
  /// status, nothing from the manifest is stored and the install fails.
  pub async fn install(&self) -> Result<InstallReport> {
    let generation = self.settings.version.as_str();
    self.store.open(generation)?;

    let fetches = self.settings.manifest.iter().map(|url| async move {
      let request = Request::get(url.clone());
      let snapshot = self
        .fetcher
        .fetch(&request)
        .await
        .map_err(|e| eyre!("Failed to fetch manifest entry {}: {}", url, e))?;

      if !snapshot.is_ok() {
        return Err(eyre!(
          "Manifest entry {} returned status {}",
          url,
          snapshot.status
        ));
      }

      Ok((request.cache_key(), snapshot))
    });

    let entries = try_join_all(fetches).await?;
    self.store.install_manifest(generation, &entries)?;

    info!(
      generation,
      entries = entries.len(),
      "Installed offline manifest"
    );

    Ok(InstallReport {
      generation: generation.to_string(),
      cached: self.settings.manifest.clone(),
      skip_waiting: self.settings.skip_waiting,
    })
  }

  /// Put the current generation in control and delete every other one.
  ///
  /// Refused, with nothing deleted, unless the current generation finished an
  /// install. A failed delete is logged and skipped; the generation is retried
  /// on the next activation.
  pub fn activate(&self) -> Result<ActivationReport> {
    let current = self.settings.version.as_str();
    if !self.store.is_installed(current)? {
      return Err(eyre!(
        "Cache generation {} is not installed; run install first",
        current
      ));
    }

    self.store.set_active(current)?;
    let mut deleted = Vec::new();

    for name in self.store.generations()? {
      if name == current {
        continue;
      }
      match self.store.delete(&name) {
        Ok(_) => deleted.push(name),
        Err(e) => warn!(generation = %name, error = %e, "Failed to delete stale cache generation"),
      }
    }

    info!(generation = current, deleted = deleted.len(), "Activated");

    Ok(ActivationReport {
      generation: current.to_string(),
      deleted,
    })
  }

  /// Intercept a request.
  ///
  /// Returns `None` when the request is not governed by the cache (non-GET or
  /// non-http(s)); the caller handles it as if no cache were present.
  /// Otherwise always resolves to a response: network, cache, offline page
  /// or a 503.
  pub async fn handle_fetch(&self, request: &Request) -> Option<FetchResponse> {
    if !self.settings.policy.is_eligible(request) {
      debug!(method = %request.method, url = %request.url, "Not intercepted");
      return None;
    }

    match self.fetcher.fetch(request).await {
      Ok(snapshot) => {
        if snapshot.is_ok() && self.settings.policy.is_static_asset(&request.url) {
          self.cache_in_background(request.cache_key(), snapshot.clone());
        }
        Some(FetchResponse {
          snapshot,
          source: ResponseSource::Network,
        })
      }
      Err(e) => {
        debug!(url = %request.url, error = %e, "Network failed, falling back to cache");
        Some(self.fallback(request).await)
      }
    }
  }

  /// Wait for every pending background cache write.
  pub async fn settle(&self) {
    let mut pending = std::mem::take(
      &mut *self
        .writes
        .lock()
        .unwrap_or_else(PoisonError::into_inner),
    );

    while let Some(result) = pending.join_next().await {
      if let Err(e) = result {
        warn!(error = %e, "Background cache write did not complete");
      }
    }
  }

  /// Cache lookups run on the blocking pool, next to the background writes.
  async fn fallback(&self, request: &Request) -> FetchResponse {
    let store = Arc::clone(&self.store);
    let version = self.settings.version.clone();
    let key = request.cache_key();
    let offline_key = request
      .is_navigation()
      .then(|| Request::get(self.settings.offline_page.clone()).cache_key());

    let found = tokio::task::spawn_blocking(move || {
      let generation = serving_generation(&*store, &version);
      if let Some(cached) = lookup(&*store, &generation, &key) {
        return Some((cached, false));
      }
      offline_key
        .and_then(|k| lookup(&*store, &generation, &k))
        .map(|cached| (cached, true))
    })
    .await
    .unwrap_or_else(|e| {
      warn!(error = %e, "Cache lookup did not complete");
      None
    });

    match found {
      Some((cached, false)) => {
        debug!(
          url = %request.url,
          generation = %cached.generation,
          cached_at = %cached.cached_at,
          "Serving cached snapshot"
        );
        FetchResponse {
          snapshot: cached.snapshot,
          source: ResponseSource::Cache {
            generation: cached.generation,
          },
        }
      }
      Some((cached, true)) => FetchResponse {
        snapshot: cached.snapshot,
        source: ResponseSource::OfflinePage,
      },
      None => {
        if request.is_navigation() {
          warn!(page = %self.settings.offline_page, "Offline page is not cached");
        }
        FetchResponse {
          snapshot: ResponseSnapshot::offline(),
          source: ResponseSource::Unavailable,
        }
      }
    }
  }

  fn cache_in_background(&self, key: RequestKey, snapshot: ResponseSnapshot) {
    let store = Arc::clone(&self.store);
    let version = self.settings.version.clone();

    let mut writes = self.writes.lock().unwrap_or_else(PoisonError::into_inner);

    // Reap finished writes so the set stays small
    while writes.try_join_next().is_some() {}

    writes.spawn_blocking(move || {
      let generation = serving_generation(&*store, &version);
      match store.put(&generation, &key, &snapshot) {
        Ok(()) => debug!(request = key.description(), generation = %generation, "Cached response"),
        Err(e) => warn!(request = key.description(), error = %e, "Failed to cache response"),
      }
    });
  }
}

/// The generation requests are served from: the active one, or `version`
/// while nothing has been activated yet. A newer installed version that has
/// not been activated is waiting and does not serve.
fn serving_generation<S: CacheStore>(store: &S, version: &str) -> String {
  match store.active_generation() {
    Ok(Some(active)) => active,
    Ok(None) => version.to_string(),
    Err(e) => {
      warn!(error = %e, "Failed to read active generation");
      version.to_string()
    }
  }
}

/// Serving generation first, then any other generation.
fn lookup<S: CacheStore>(store: &S, generation: &str, key: &RequestKey) -> Option<CachedSnapshot> {
  let found = store
    .match_in(generation, key)
    .and_then(|hit| match hit {
      Some(cached) => Ok(Some(cached)),
      None => store.match_any(key),
    });

  match found {
    Ok(cached) => cached,
    Err(e) => {
      warn!(request = key.description(), error = %e, "Cache lookup failed");
      None
    }
  }
}

impl<S: CacheStore + 'static, F: Fetcher> Clone for OfflineCacheManager<S, F> {
  fn clone(&self) -> Self {
    Self {
      store: Arc::clone(&self.store),
      fetcher: Arc::clone(&self.fetcher),
      settings: Arc::clone(&self.settings),
      writes: Arc::clone(&self.writes),
    }
  }
}
