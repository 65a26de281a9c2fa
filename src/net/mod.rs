//! Network capability consumed by the caching agent.

pub mod client;
#[cfg(test)]
pub mod stub;
pub mod types;

use async_trait::async_trait;
use color_eyre::Result;

pub use client::HttpNetwork;
pub use types::{Method, Request, Response, ResponseKind};

/// Anything that can perform a request and hand back a response.
#[async_trait]
pub trait Network: Send + Sync + 'static {
  /// Perform the request. Fails when the resource is unreachable.
  async fn fetch(&self, request: &Request) -> Result<Response>;

  /// Turn a locator (possibly relative) into the URL requests are issued for.
  fn resolve(&self, locator: &str) -> Result<String> {
    Ok(locator.to_string())
  }
}
