use crate::cache::{Fetcher, Request, ResponseSnapshot};
use color_eyre::{eyre::eyre, Result};
use std::future::Future;

/// HTTP client used as the network behind the offline cache
#[derive(Clone)]
pub struct HttpClient {
  client: reqwest::Client,
}

impl HttpClient {
  pub fn new() -> Result<Self> {
    let client = reqwest::Client::builder()
      .user_agent(concat!("offline-cache/", env!("CARGO_PKG_VERSION")))
      .build()
      .map_err(|e| eyre!("Failed to create HTTP client: {}", e))?;

    Ok(Self { client })
  }

  /// Send a request and snapshot whatever comes back, whatever the status
  pub async fn send(&self, request: &Request) -> Result<ResponseSnapshot> {
    let mut builder = self
      .client
      .request(request.method.clone(), request.url.clone());

    for (name, value) in &request.headers {
      builder = builder.header(name.as_str(), value.as_str());
    }

    if request.is_navigation() {
      builder = builder.header("Sec-Fetch-Mode", "navigate");
    }

    let response = builder
      .send()
      .await
      .map_err(|e| eyre!("Request to {} failed: {}", request.url, e))?;

    let status = response.status().as_u16();
    let headers = response
      .headers()
      .iter()
      .filter_map(|(name, value)| {
        value
          .to_str()
          .ok()
          .map(|v| (name.as_str().to_string(), v.to_string()))
      })
      .collect();

    let body = response
      .bytes()
      .await
      .map_err(|e| eyre!("Failed to read response body from {}: {}", request.url, e))?
      .to_vec();

    Ok(ResponseSnapshot {
      status,
      headers,
      body,
    })
  }
}

impl Fetcher for HttpClient {
  fn fetch(&self, request: &Request) -> impl Future<Output = Result<ResponseSnapshot>> + Send {
    self.send(request)
  }
}
