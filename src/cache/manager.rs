//! Cache manager that reacts to the install, fetch and activate lifecycle events.

use color_eyre::{eyre::eyre, Result};
use futures::future::{join_all, try_join_all};
use std::sync::Arc;
use tracing::{debug, info, warn};
use url::Url;

use super::storage::{CacheStorage, CachedResponse};
use super::traits::{CacheResult, Destination, Request, Response};
use crate::assets::{ASSETS, CACHE_NAME};
use crate::network::Network;

/// Outcome of a successful install.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InstallReport {
  pub cache_name: String,
  /// Assets fetched over the network and stored
  pub fetched: usize,
  /// Assets that were already in the current generation
  pub already_cached: usize,
}

/// Outcome of an activation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ActivateReport {
  /// Stale generations that were removed
  pub deleted: Vec<String>,
  /// Stale generations that could not be removed, with the reason
  pub failed: Vec<(String, String)>,
}

/// Turn an origin into a base URL for relative asset paths.
///
/// A missing trailing slash is added so `./index.html` resolves inside the
/// origin's path (`/app/index.html`) rather than next to it.
pub fn origin_base(mut origin: Url) -> Url {
  if !origin.cannot_be_a_base() && !origin.path().ends_with('/') {
    let path = format!("{}/", origin.path());
    origin.set_path(&path);
  }
  origin
}

/// Cache manager that sits between the page and the network.
///
/// Owns one cache generation (the current one) and an asset list. Install
/// fills the generation, activate removes every other generation, and fetch
/// decides per request whether to answer from cache or network.
pub struct CacheManager<S: CacheStorage, N: Network> {
  storage: Arc<S>,
  network: Arc<N>,
  origin: Url,
  cache_name: String,
  assets: Vec<String>,
}

impl<S: CacheStorage, N: Network> CacheManager<S, N> {
  /// Create a manager for the built-in generation and asset list.
  ///
  /// Relative asset paths are resolved against `origin`.
  pub fn new(storage: S, network: N, origin: Url) -> Self {
    Self::shared(Arc::new(storage), Arc::new(network), origin)
  }

  /// Create a manager over a store and transport that are also used elsewhere.
  pub fn shared(storage: Arc<S>, network: Arc<N>, origin: Url) -> Self {
    Self {
      storage,
      network,
      origin: origin_base(origin),
      cache_name: CACHE_NAME.to_string(),
      assets: ASSETS.iter().map(|a| a.to_string()).collect(),
    }
  }

  /// Replace the generation name and asset list.
  pub fn with_generation(mut self, cache_name: &str, assets: &[&str]) -> Self {
    self.cache_name = cache_name.to_string();
    self.assets = assets.iter().map(|a| a.to_string()).collect();
    self
  }

  pub fn cache_name(&self) -> &str {
    &self.cache_name
  }

  pub fn storage(&self) -> &S {
    &self.storage
  }

  pub fn network(&self) -> &N {
    &self.network
  }

  /// Resolve an origin-relative path into a request, guessing its destination.
  pub fn request_for(&self, path: &str) -> Result<Request> {
    let url = self
      .origin
      .join(path)
      .map_err(|e| eyre!("Invalid asset path {}: {}", path, e))?;
    let destination = Destination::guess(&url);
    Ok(Request::get(url).with_destination(destination))
  }

  /// Open the current generation and store every listed asset in it.
  ///
  /// Assets already present in the generation are not fetched again. The
  /// remaining ones are fetched concurrently and written in a single batch
  /// once all of them succeeded; any transport failure or non-2xx status
  /// fails the whole install and writes nothing.
  pub async fn install(&self) -> Result<InstallReport> {
    self.storage.open(&self.cache_name)?;
    info!(cache = %self.cache_name, "Cache opened");

    let mut missing = Vec::new();
    let mut already_cached = 0;
    for path in &self.assets {
      let request = self.request_for(path)?;
      if self.storage.match_in(&self.cache_name, &request)?.is_some() {
        already_cached += 1;
      } else {
        missing.push(request);
      }
    }

    let fetched = try_join_all(missing.into_iter().map(|request| async move {
      let response = self
        .network
        .fetch(&request)
        .await
        .map_err(|e| eyre!("Failed to cache {}: {}", request.url, e))?;

      if !response.is_ok() {
        return Err(eyre!(
          "Failed to cache {}: server responded with status {}",
          request.url,
          response.status
        ));
      }

      debug!(url = %request.url, status = response.status, "Fetched asset");
      Ok::<_, color_eyre::Report>((request, response))
    }))
    .await?;

    self.storage.put_all(&self.cache_name, &fetched)?;

    info!(
      cache = %self.cache_name,
      fetched = fetched.len(),
      already_cached,
      "Install complete"
    );

    Ok(InstallReport {
      cache_name: self.cache_name.clone(),
      fetched: fetched.len(),
      already_cached,
    })
  }

  /// Answer a request from cache or network.
  ///
  /// 1. Look the request up in the cache (current generation first)
  /// 2. Documents: try the network, fall back to the cached copy on failure
  /// 3. Everything else: serve the cached copy, else pass through to the network
  ///
  /// Network responses are never written back to the cache here.
  pub async fn fetch(&self, request: &Request) -> Result<CacheResult<Response>> {
    let cached = self.lookup(request);

    if request.is_document() {
      return match self.network.fetch(request).await {
        Ok(response) => Ok(CacheResult::from_network(response)),
        Err(err) => match cached {
          Some(hit) => {
            warn!(url = %request.url, error = %err, "Network failed, serving cached document");
            Ok(CacheResult::offline(
              hit.response,
              hit.cache_name,
              hit.cached_at,
            ))
          }
          None => Err(err),
        },
      };
    }

    if let Some(hit) = cached {
      debug!(url = %request.url, cache = %hit.cache_name, "Cache hit");
      return Ok(CacheResult::from_cache(
        hit.response,
        hit.cache_name,
        hit.cached_at,
      ));
    }

    debug!(url = %request.url, "Cache miss, passing through");
    let response = self.network.fetch(request).await?;
    Ok(CacheResult::from_network(response))
  }

  /// Find a cached response, preferring the current generation over any
  /// older one still around. Store errors count as a miss.
  fn lookup(&self, request: &Request) -> Option<CachedResponse> {
    let found = match self.storage.match_in(&self.cache_name, request) {
      Ok(Some(hit)) => Ok(Some(hit)),
      Ok(None) => self.storage.match_any(request),
      Err(err) => Err(err),
    };

    found.unwrap_or_else(|err| {
      warn!(url = %request.url, error = %err, "Cache lookup failed");
      None
    })
  }

  /// Delete every generation other than the current one.
  ///
  /// Deletions run independently; one failing does not stop the others and
  /// does not fail activation. Failures are logged and reported.
  pub async fn activate(&self) -> Result<ActivateReport> {
    let stale: Vec<String> = self
      .storage
      .keys()?
      .into_iter()
      .filter(|name| *name != self.cache_name)
      .collect();

    let results = join_all(stale.into_iter().map(|name| async move {
      info!(cache = %name, "Deleting old cache");
      let result = self.storage.delete(&name);
      (name, result)
    }))
    .await;

    let mut report = ActivateReport::default();
    for (name, result) in results {
      match result {
        Ok(_) => report.deleted.push(name),
        Err(err) => {
          warn!(cache = %name, error = %err, "Failed to delete old cache");
          report.failed.push((name, err.to_string()));
        }
      }
    }

    Ok(report)
  }
}

impl<S: CacheStorage, N: Network> Clone for CacheManager<S, N> {
  fn clone(&self) -> Self {
    Self {
      storage: Arc::clone(&self.storage),
      network: Arc::clone(&self.network),
      origin: self.origin.clone(),
      cache_name: self.cache_name.clone(),
      assets: self.assets.clone(),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::{CacheSource, MemoryStorage, SqliteStorage};
  use crate::network::ScriptedNetwork;

  const ORIGIN: &str = "https://salus.test/app/";

  fn origin() -> Url {
    Url::parse(ORIGIN).unwrap()
  }

  fn url(path: &str) -> Url {
    origin().join(path).unwrap()
  }

  /// Network that serves every built-in asset.
  fn full_network() -> ScriptedNetwork {
    ASSETS
      .iter()
      .fold(ScriptedNetwork::new(), |net, asset| {
        net.serve(&url(asset), 200, &format!("net:{}", asset))
      })
  }

  fn seed(storage: &dyn CacheStorage, cache: &str, path: &str, body: &str) {
    let request = Request::get(url(path));
    let response = Response::new(&request.url, 200, body);
    storage.put_all(cache, &[(request, response)]).unwrap();
  }

  /// Storage whose deletes fail for one named cache.
  struct StickyStorage {
    inner: MemoryStorage,
    sticky: &'static str,
  }

  impl CacheStorage for StickyStorage {
    fn open(&self, name: &str) -> Result<()> {
      self.inner.open(name)
    }
    fn put_all(&self, name: &str, entries: &[(Request, Response)]) -> Result<()> {
      self.inner.put_all(name, entries)
    }
    fn match_in(&self, name: &str, request: &Request) -> Result<Option<CachedResponse>> {
      self.inner.match_in(name, request)
    }
    fn match_any(&self, request: &Request) -> Result<Option<CachedResponse>> {
      self.inner.match_any(request)
    }
    fn keys(&self) -> Result<Vec<String>> {
      self.inner.keys()
    }
    fn delete(&self, name: &str) -> Result<bool> {
      if name == self.sticky {
        return Err(eyre!("cache {} is locked", name));
      }
      self.inner.delete(name)
    }
    fn entry_count(&self, name: &str) -> Result<Option<usize>> {
      self.inner.entry_count(name)
    }
  }

  #[tokio::test]
  async fn test_install_stores_every_asset() {
    let manager = CacheManager::new(MemoryStorage::new(), full_network(), origin());

    let report = manager.install().await.unwrap();
    assert_eq!(report.cache_name, CACHE_NAME);
    assert_eq!(report.fetched, ASSETS.len());
    assert_eq!(report.already_cached, 0);

    for asset in ASSETS {
      let request = manager.request_for(asset).unwrap();
      let hit = manager
        .storage()
        .match_in(CACHE_NAME, &request)
        .unwrap()
        .unwrap_or_else(|| panic!("{} not cached", asset));
      assert_eq!(hit.response.body, format!("net:{}", asset).into_bytes());
    }
  }

  #[tokio::test]
  async fn test_install_skips_assets_already_cached() {
    let storage = Arc::new(MemoryStorage::new());
    seed(storage.as_ref(), CACHE_NAME, "./index.html", "cached");
    let network = Arc::new(full_network());
    let manager = CacheManager::shared(storage.clone(), network.clone(), origin());

    let report = manager.install().await.unwrap();
    assert_eq!(report.fetched, ASSETS.len() - 1);
    assert_eq!(report.already_cached, 1);
    assert!(!network.calls().contains(&url("./index.html").to_string()));
  }

  #[tokio::test]
  async fn test_install_fails_when_one_asset_is_unreachable() {
    let network = ScriptedNetwork::new()
      .serve(&url("./"), 200, "root")
      .serve(&url("./index.html"), 200, "index");
    let manager = CacheManager::new(MemoryStorage::new(), network, origin());

    let err = manager.install().await.unwrap_err();
    assert!(err.to_string().contains("Failed to cache"));
    // Nothing from the failed batch was written
    assert_eq!(manager.storage().entry_count(CACHE_NAME).unwrap(), Some(0));
  }

  #[tokio::test]
  async fn test_install_fails_on_error_status() {
    let network = full_network().serve(&url("./profit.png"), 404, "not found");
    let manager = CacheManager::new(MemoryStorage::new(), network, origin());

    let err = manager.install().await.unwrap_err();
    assert!(err.to_string().contains("404"));
  }

  #[tokio::test]
  async fn test_install_writes_only_to_current_generation() {
    let storage = SqliteStorage::open_in_memory().unwrap();
    let manager = CacheManager::new(storage, full_network(), origin());
    manager.install().await.unwrap();

    let storage = manager.storage();
    storage.open("salus-calculator-v2").unwrap();
    assert_eq!(storage.entry_count("salus-calculator-v2").unwrap(), Some(0));
    assert_eq!(
      storage.entry_count(CACHE_NAME).unwrap(),
      Some(ASSETS.len())
    );

    let request = manager.request_for("./index.html").unwrap();
    assert!(storage
      .match_in("salus-calculator-v2", &request)
      .unwrap()
      .is_none());
  }

  #[tokio::test]
  async fn test_activate_prunes_old_generations() {
    let storage = MemoryStorage::new();
    seed(&storage, "salus-calculator-v1", "./index.html", "v1");
    seed(&storage, "salus-calculator-v2", "./index.html", "v2");
    seed(&storage, "salus-calculator-v3", "./index.html", "v3");
    let manager = CacheManager::new(storage, ScriptedNetwork::new(), origin());

    let report = manager.activate().await.unwrap();
    assert_eq!(
      report.deleted,
      vec!["salus-calculator-v1", "salus-calculator-v2"]
    );
    assert!(report.failed.is_empty());
    assert_eq!(manager.storage().keys().unwrap(), vec!["salus-calculator-v3"]);
  }

  #[tokio::test]
  async fn test_activate_reports_failed_deletions() {
    let storage = StickyStorage {
      inner: MemoryStorage::new(),
      sticky: "salus-calculator-v1",
    };
    seed(&storage, "salus-calculator-v1", "./", "v1");
    seed(&storage, "salus-calculator-v2", "./", "v2");
    let manager = CacheManager::new(storage, ScriptedNetwork::new(), origin());

    let report = manager.activate().await.unwrap();
    assert_eq!(report.deleted, vec!["salus-calculator-v2"]);
    assert_eq!(report.failed.len(), 1);
    assert_eq!(report.failed[0].0, "salus-calculator-v1");
    assert_eq!(manager.storage().keys().unwrap(), vec!["salus-calculator-v1"]);
  }

  #[tokio::test]
  async fn test_document_prefers_network() {
    let storage = MemoryStorage::new();
    seed(&storage, CACHE_NAME, "./index.html", "cached page");
    let network = ScriptedNetwork::new().serve(&url("./index.html"), 200, "fresh page");
    let manager = CacheManager::new(storage, network, origin());

    let result = manager
      .fetch(&Request::document(url("./index.html")))
      .await
      .unwrap();
    assert_eq!(result.source, CacheSource::Network);
    assert_eq!(result.data.body, b"fresh page");
  }

  #[tokio::test]
  async fn test_document_error_status_is_still_served_from_network() {
    let storage = MemoryStorage::new();
    seed(&storage, CACHE_NAME, "./index.html", "cached page");
    let network = ScriptedNetwork::new().serve(&url("./index.html"), 503, "maintenance");
    let manager = CacheManager::new(storage, network, origin());

    let result = manager
      .fetch(&Request::document(url("./index.html")))
      .await
      .unwrap();
    assert_eq!(result.source, CacheSource::Network);
    assert_eq!(result.data.status, 503);
  }

  #[tokio::test]
  async fn test_document_falls_back_to_cache_when_offline() {
    let storage = MemoryStorage::new();
    seed(&storage, CACHE_NAME, "./index.html", "cached page");
    let manager = CacheManager::new(storage, ScriptedNetwork::new(), origin());

    let result = manager
      .fetch(&Request::document(url("./index.html")))
      .await
      .unwrap();
    assert_eq!(result.source, CacheSource::Offline);
    assert_eq!(result.cache_name.as_deref(), Some(CACHE_NAME));
    assert!(result.cached_at.is_some());
    assert_eq!(result.data.body, b"cached page");
  }

  #[tokio::test]
  async fn test_document_total_miss_propagates_failure() {
    let manager = CacheManager::new(MemoryStorage::new(), ScriptedNetwork::new(), origin());

    let result = manager.fetch(&Request::document(url("./index.html"))).await;
    assert!(result.is_err());
  }

  #[tokio::test]
  async fn test_asset_cache_hit_skips_network() {
    let storage = MemoryStorage::new();
    seed(&storage, CACHE_NAME, "./profit.png", "cached png");
    let network = Arc::new(ScriptedNetwork::new().serve(&url("./profit.png"), 200, "net png"));
    let manager = CacheManager::shared(Arc::new(storage), network.clone(), origin());

    let request = Request::get(url("./profit.png")).with_destination(Destination::Image);
    let result = manager.fetch(&request).await.unwrap();
    assert_eq!(result.source, CacheSource::Cache);
    assert_eq!(result.data.body, b"cached png");
    assert!(network.calls().is_empty());
  }

  #[tokio::test]
  async fn test_asset_cache_miss_passes_through_without_storing() {
    let storage = Arc::new(MemoryStorage::new());
    storage.open(CACHE_NAME).unwrap();
    let network = Arc::new(ScriptedNetwork::new().serve(&url("./rates.json"), 200, "{}"));
    let manager = CacheManager::shared(storage.clone(), network.clone(), origin());

    let request = Request::get(url("./rates.json"));
    let result = manager.fetch(&request).await.unwrap();
    assert_eq!(result.source, CacheSource::Network);
    assert_eq!(result.data.body, b"{}");
    assert_eq!(network.calls(), vec![url("./rates.json").to_string()]);
    assert!(storage.match_any(&request).unwrap().is_none());
    assert_eq!(storage.entry_count(CACHE_NAME).unwrap(), Some(0));
  }

  #[tokio::test]
  async fn test_asset_cache_miss_offline_propagates_failure() {
    let manager = CacheManager::new(MemoryStorage::new(), ScriptedNetwork::new(), origin());

    let request = Request::get(url("./icon.webp")).with_destination(Destination::Image);
    assert!(manager.fetch(&request).await.is_err());
  }

  #[tokio::test]
  async fn test_lookup_prefers_current_generation() {
    let storage = MemoryStorage::new();
    seed(&storage, "salus-calculator-v2", "./icon.webp", "old icon");
    seed(&storage, CACHE_NAME, "./icon.webp", "new icon");
    let manager = CacheManager::new(storage, ScriptedNetwork::new(), origin());

    let result = manager.fetch(&Request::get(url("./icon.webp"))).await.unwrap();
    assert_eq!(result.data.body, b"new icon");
    assert_eq!(result.cache_name.as_deref(), Some(CACHE_NAME));
  }

  #[tokio::test]
  async fn test_lookup_falls_back_to_older_generation() {
    let storage = MemoryStorage::new();
    seed(&storage, "salus-calculator-v2", "./icon.webp", "old icon");
    let manager = CacheManager::new(storage, ScriptedNetwork::new(), origin());

    let result = manager.fetch(&Request::get(url("./icon.webp"))).await.unwrap();
    assert_eq!(result.source, CacheSource::Cache);
    assert_eq!(result.cache_name.as_deref(), Some("salus-calculator-v2"));
  }

  #[tokio::test]
  async fn test_non_get_always_goes_to_network() {
    let storage = MemoryStorage::new();
    seed(&storage, CACHE_NAME, "./index.html", "cached");
    let network = Arc::new(ScriptedNetwork::new());
    let manager = CacheManager::shared(Arc::new(storage), network.clone(), origin());

    let request = Request::get(url("./index.html")).with_method("POST");
    assert!(manager.fetch(&request).await.is_err());
    assert_eq!(network.calls().len(), 1);
  }

  #[tokio::test]
  async fn test_origin_without_trailing_slash_keeps_its_path() {
    let bare = Url::parse("https://salus.test/app").unwrap();
    let network = ScriptedNetwork::new().serve(&url("./only.css"), 200, "body{}");
    let manager = CacheManager::new(MemoryStorage::new(), network, bare)
      .with_generation("salus-calculator-v4", &["./only.css"]);

    let request = manager.request_for("./index.html").unwrap();
    assert_eq!(request.url.as_str(), "https://salus.test/app/index.html");
    manager.install().await.unwrap();
  }

  #[test]
  fn test_origin_base() {
    let base = origin_base(Url::parse("https://salus.test/app/").unwrap());
    assert_eq!(base.as_str(), "https://salus.test/app/");
    let base = origin_base(Url::parse("https://salus.test").unwrap());
    assert_eq!(base.as_str(), "https://salus.test/");
  }

  #[tokio::test]
  async fn test_custom_generation() {
    let network = ScriptedNetwork::new().serve(&url("./only.css"), 200, "body{}");
    let manager = CacheManager::new(MemoryStorage::new(), network, origin())
      .with_generation("salus-calculator-v4", &["./only.css"]);

    let report = manager.install().await.unwrap();
    assert_eq!(report.cache_name, "salus-calculator-v4");
    assert_eq!(report.fetched, 1);
    assert_eq!(manager.cache_name(), "salus-calculator-v4");
  }
}
