//! reqwest-backed network access.

use async_trait::async_trait;
use color_eyre::{eyre::eyre, Result};
use url::Url;

use super::types::{Request, Response, ResponseKind};
use super::Network;

/// HTTP client for the hosting application's origin.
///
/// Relative locators such as `./map.html` are resolved against `base`, and
/// responses whose final URL shares its origin are reported as `basic`.
#[derive(Clone)]
pub struct HttpNetwork {
  client: reqwest::Client,
  base: Url,
  /// Fail every fetch as if there were no connectivity
  offline: bool,
}

impl HttpNetwork {
  pub fn new(base_url: &str) -> Result<Self> {
    let base =
      Url::parse(base_url).map_err(|e| eyre!("Invalid base URL '{}': {}", base_url, e))?;

    let client = reqwest::Client::builder()
      .user_agent(concat!("offline-agent/", env!("CARGO_PKG_VERSION")))
      .build()
      .map_err(|e| eyre!("Failed to create HTTP client: {}", e))?;

    Ok(Self {
      client,
      base,
      offline: false,
    })
  }

  pub fn with_offline(mut self, offline: bool) -> Self {
    self.offline = offline;
    self
  }

  fn classify(&self, url: &Url) -> ResponseKind {
    if url.origin() == self.base.origin() {
      ResponseKind::Basic
    } else {
      ResponseKind::Cors
    }
  }
}

#[async_trait]
impl Network for HttpNetwork {
  async fn fetch(&self, request: &Request) -> Result<Response> {
    if self.offline {
      return Err(eyre!("Failed to fetch {}: network is offline", request.url));
    }

    let url = Url::parse(&request.url)
      .or_else(|_| self.base.join(&request.url))
      .map_err(|e| eyre!("Invalid request URL '{}': {}", request.url, e))?;

    let method = reqwest::Method::from_bytes(request.method.as_str().as_bytes())
      .map_err(|e| eyre!("Unsupported method {}: {}", request.method, e))?;

    let mut builder = self.client.request(method, url.clone());
    for (name, value) in &request.headers {
      builder = builder.header(name.as_str(), value.as_str());
    }

    let response = builder
      .send()
      .await
      .map_err(|e| eyre!("Failed to fetch {}: {}", url, e))?;

    let status = response.status().as_u16();
    let kind = self.classify(response.url());
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
      .map_err(|e| eyre!("Failed to read response body from {}: {}", url, e))?;

    Ok(Response::new(status, kind, body).with_headers(headers))
  }

  fn resolve(&self, locator: &str) -> Result<String> {
    self
      .base
      .join(locator)
      .map(String::from)
      .map_err(|e| eyre!("Failed to resolve '{}' against {}: {}", locator, self.base, e))
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_resolve_relative_locator() {
    let network = HttpNetwork::new("http://localhost:8000/maps/index.html").unwrap();
    assert_eq!(
      network.resolve("./gobojango_map.html").unwrap(),
      "http://localhost:8000/maps/gobojango_map.html"
    );
  }

  #[test]
  fn test_resolve_keeps_absolute_locator() {
    let network = HttpNetwork::new("http://localhost:8000/").unwrap();
    assert_eq!(
      network.resolve("https://tile.openstreetmap.org/1/2/3.png").unwrap(),
      "https://tile.openstreetmap.org/1/2/3.png"
    );
  }

  #[test]
  fn test_classify_by_origin() {
    let network = HttpNetwork::new("http://localhost:8000/").unwrap();
    let same = Url::parse("http://localhost:8000/a.json").unwrap();
    let other = Url::parse("https://server.arcgisonline.com/tile/1").unwrap();

    assert_eq!(network.classify(&same), ResponseKind::Basic);
    assert_eq!(network.classify(&other), ResponseKind::Cors);
  }

  #[tokio::test]
  async fn test_offline_fails_without_connecting() {
    let network = HttpNetwork::new("http://localhost:8000/")
      .unwrap()
      .with_offline(true);
    assert!(network.fetch(&Request::get("./a.html")).await.is_err());
  }

  #[test]
  fn test_rejects_invalid_base() {
    assert!(HttpNetwork::new("not a url").is_err());
  }
}
