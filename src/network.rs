//! Network transport used to fill the cache and to serve live responses.

use async_trait::async_trait;
use color_eyre::{eyre::eyre, Result};
use reqwest::Method;

use crate::cache::{Request, Response};

/// Performs a request over the network.
///
/// Only transport-level failures (offline, DNS, refused connection) are
/// errors. A 404 or 500 is a successful fetch of an unsuccessful response.
#[async_trait]
pub trait Network: Send + Sync {
  async fn fetch(&self, request: &Request) -> Result<Response>;
}

/// HTTP transport backed by reqwest.
#[derive(Clone, Default)]
pub struct HttpNetwork {
  client: reqwest::Client,
}

impl HttpNetwork {
  pub fn new() -> Result<Self> {
    let client = reqwest::Client::builder()
      .user_agent(concat!("salus-offline/", env!("CARGO_PKG_VERSION")))
      .build()
      .map_err(|e| eyre!("Failed to create HTTP client: {}", e))?;

    Ok(Self { client })
  }
}

#[async_trait]
impl Network for HttpNetwork {
  async fn fetch(&self, request: &Request) -> Result<Response> {
    let method = Method::from_bytes(request.method.as_bytes())
      .map_err(|e| eyre!("Invalid method {}: {}", request.method, e))?;

    let resp = self
      .client
      .request(method, request.url.clone())
      .send()
      .await
      .map_err(|e| eyre!("Failed to fetch {}: {}", request.url, e))?;

    let url = resp.url().to_string();
    let status = resp.status().as_u16();
    let headers = resp
      .headers()
      .iter()
      .map(|(name, value)| {
        let value = String::from_utf8_lossy(value.as_bytes()).into_owned();
        (name.as_str().to_string(), value)
      })
      .collect();

    let body = resp
      .bytes()
      .await
      .map_err(|e| eyre!("Failed to read body of {}: {}", request.url, e))?
      .to_vec();

    Ok(Response {
      url,
      status,
      headers,
      body,
    })
  }
}

/// Network double for tests: serves canned responses by URL and records
/// every request it sees. Unknown URLs fail like an offline transport.
#[cfg(test)]
#[derive(Default)]
pub(crate) struct ScriptedNetwork {
  routes: std::sync::Mutex<std::collections::HashMap<String, Response>>,
  calls: std::sync::Mutex<Vec<String>>,
}

#[cfg(test)]
impl ScriptedNetwork {
  pub(crate) fn new() -> Self {
    Self::default()
  }

  pub(crate) fn serve(self, url: &url::Url, status: u16, body: &str) -> Self {
    self
      .routes
      .lock()
      .unwrap()
      .insert(url.to_string(), Response::new(url, status, body));
    self
  }

  pub(crate) fn calls(&self) -> Vec<String> {
    self.calls.lock().unwrap().clone()
  }
}

#[cfg(test)]
#[async_trait]
impl Network for ScriptedNetwork {
  async fn fetch(&self, request: &Request) -> Result<Response> {
    self.calls.lock().unwrap().push(request.url.to_string());
    self
      .routes
      .lock()
      .unwrap()
      .get(request.url.as_str())
      .cloned()
      .ok_or_else(|| eyre!("Failed to fetch {}: network unreachable", request.url))
  }
}
