//! Core request/response types for the caching system.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use url::Url;

/// What kind of resource a request is loading.
///
/// Mirrors the fetch `destination` a browser attaches to every request.
/// Only `Document` changes how a request is served.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum Destination {
  /// Top-level HTML page
  Document,
  Image,
  Manifest,
  Script,
  Style,
  Font,
  /// No specific destination (e.g. a plain `fetch()` call)
  #[default]
  Empty,
}

impl Destination {
  /// Guess the destination from a URL path, the way a page would load it.
  pub fn guess(url: &Url) -> Self {
    let path = url.path();
    if path.ends_with('/') {
      return Destination::Document;
    }

    let file = path.rsplit('/').next().unwrap_or(path);
    let ext = file.rsplit_once('.').map(|(_, ext)| ext.to_lowercase());

    match ext.as_deref() {
      Some("html") | Some("htm") => Destination::Document,
      Some("png") | Some("jpg") | Some("jpeg") | Some("gif") | Some("webp") | Some("svg")
      | Some("ico") => Destination::Image,
      Some("json") | Some("webmanifest") => Destination::Manifest,
      Some("js") | Some("mjs") => Destination::Script,
      Some("css") => Destination::Style,
      Some("woff") | Some("woff2") | Some("ttf") | Some("otf") => Destination::Font,
      _ => Destination::Empty,
    }
  }
}

/// An outgoing resource request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
  pub method: String,
  pub url: Url,
  pub destination: Destination,
}

impl Request {
  /// Create a GET request with no particular destination.
  pub fn get(url: Url) -> Self {
    Self {
      method: "GET".to_string(),
      url,
      destination: Destination::Empty,
    }
  }

  /// Create a GET request for a top-level document.
  pub fn document(url: Url) -> Self {
    Self::get(url).with_destination(Destination::Document)
  }

  pub fn with_destination(mut self, destination: Destination) -> Self {
    self.destination = destination;
    self
  }

  pub fn with_method(mut self, method: &str) -> Self {
    self.method = method.to_uppercase();
    self
  }

  pub fn is_document(&self) -> bool {
    self.destination == Destination::Document
  }

  /// Only GET requests are ever matched against or written to the store.
  pub fn is_cacheable(&self) -> bool {
    self.method == "GET"
  }
}

/// A captured response: status, headers and body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Response {
  /// Final URL the response was served from
  pub url: String,
  pub status: u16,
  pub headers: Vec<(String, String)>,
  pub body: Vec<u8>,
}

impl Response {
  pub fn new(url: &Url, status: u16, body: impl Into<Vec<u8>>) -> Self {
    Self {
      url: url.to_string(),
      status,
      headers: Vec::new(),
      body: body.into(),
    }
  }

  pub fn with_header(mut self, name: &str, value: &str) -> Self {
    self.headers.push((name.to_lowercase(), value.to_string()));
    self
  }

  /// Look up a header value by case-insensitive name.
  pub fn header(&self, name: &str) -> Option<&str> {
    let name = name.to_lowercase();
    self
      .headers
      .iter()
      .find(|(k, _)| *k == name)
      .map(|(_, v)| v.as_str())
  }

  /// True for 2xx statuses.
  pub fn is_ok(&self) -> bool {
    (200..300).contains(&self.status)
  }
}

/// Result of a fetch-intercept, including the response and where it came from.
#[derive(Debug, Clone)]
pub struct CacheResult<T> {
  /// The actual data
  pub data: T,
  /// Where the data came from
  pub source: CacheSource,
  /// Generation the data was read from (if from cache)
  pub cache_name: Option<String>,
  /// When the data was cached (if from cache)
  pub cached_at: Option<DateTime<Utc>>,
}

impl<T> CacheResult<T> {
  /// Create a new cache result from live network data.
  pub fn from_network(data: T) -> Self {
    Self {
      data,
      source: CacheSource::Network,
      cache_name: None,
      cached_at: None,
    }
  }

  /// Create a new cache result from a cache hit.
  pub fn from_cache(data: T, cache_name: String, cached_at: DateTime<Utc>) -> Self {
    Self {
      data,
      source: CacheSource::Cache,
      cache_name: Some(cache_name),
      cached_at: Some(cached_at),
    }
  }

  /// Create a new cache result for offline mode.
  pub fn offline(data: T, cache_name: String, cached_at: DateTime<Utc>) -> Self {
    Self {
      data,
      source: CacheSource::Offline,
      cache_name: Some(cache_name),
      cached_at: Some(cached_at),
    }
  }
}

/// Indicates where a served response came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheSource {
  /// Live response from the network
  Network,
  /// Served from cache without touching the network
  Cache,
  /// Network failed, serving the cached copy
  Offline,
}

impl std::fmt::Display for CacheSource {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    let s = match self {
      CacheSource::Network => "network",
      CacheSource::Cache => "cache",
      CacheSource::Offline => "offline",
    };
    f.write_str(s)
  }
}
