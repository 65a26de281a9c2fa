//! Scripted network for tests.

use async_trait::async_trait;
use bytes::Bytes;
use color_eyre::{eyre::eyre, Result};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use super::types::{Request, Response, ResponseKind};
use super::Network;

/// Network that answers from a fixed route table and counts every call.
#[derive(Default)]
pub struct StubNetwork {
  routes: Mutex<HashMap<String, (u16, ResponseKind, Bytes)>>,
  calls: Mutex<HashMap<String, usize>>,
  offline: AtomicBool,
}

impl StubNetwork {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn with_route(self, url: &str, status: u16, kind: ResponseKind, body: &str) -> Self {
    self.route(url, status, kind, body);
    self
  }

  pub fn route(&self, url: &str, status: u16, kind: ResponseKind, body: &str) {
    self
      .routes
      .lock()
      .unwrap()
      .insert(url.to_string(), (status, kind, Bytes::from(body.to_string())));
  }

  pub fn set_offline(&self, offline: bool) {
    self.offline.store(offline, Ordering::SeqCst);
  }

  pub fn calls(&self, url: &str) -> usize {
    self.calls.lock().unwrap().get(url).copied().unwrap_or(0)
  }

  pub fn total_calls(&self) -> usize {
    self.calls.lock().unwrap().values().sum()
  }
}

#[async_trait]
impl Network for StubNetwork {
  async fn fetch(&self, request: &Request) -> Result<Response> {
    *self
      .calls
      .lock()
      .unwrap()
      .entry(request.url.clone())
      .or_default() += 1;

    if self.offline.load(Ordering::SeqCst) {
      return Err(eyre!("Failed to fetch {}: network unreachable", request.url));
    }

    let routes = self.routes.lock().unwrap();
    match routes.get(&request.url) {
      Some((status, kind, body)) => Ok(Response::new(*status, *kind, body.clone())),
      None => Err(eyre!("Failed to fetch {}: connection refused", request.url)),
    }
  }
}
