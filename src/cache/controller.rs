//! Lifecycle controller: provisioning, interception and reconciliation.

use color_eyre::{eyre::eyre, Report, Result};
use futures::future::{join_all, try_join_all};
use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::policy::CachePolicy;
use super::traits::{CacheHandle, CacheStore, Intercepted};
use crate::host::HostControl;
use crate::net::{Network, Request, Response};

/// Drives one agent instance through its lifecycle phases.
///
/// Sits between the host runtime and the network, serving stored responses
/// first and falling back to the store again when the network is down.
pub struct LifecycleController<S: CacheStore, N: Network> {
  store: Arc<S>,
  network: Arc<N>,
  policy: CachePolicy,
  seed_resources: Vec<String>,
  /// Opportunistic store writes still in flight
  writes: Mutex<Vec<JoinHandle<()>>>,
  /// Failures of background writes, drained by `flush`
  failures: Arc<Mutex<Vec<Report>>>,
}

impl<S: CacheStore, N: Network> LifecycleController<S, N> {
  pub fn new(
    store: Arc<S>,
    network: Arc<N>,
    policy: CachePolicy,
    seed_resources: Vec<String>,
  ) -> Self {
    Self {
      store,
      network,
      policy,
      seed_resources,
      writes: Mutex::new(Vec::new()),
      failures: Arc::new(Mutex::new(Vec::new())),
    }
  }

  pub fn policy(&self) -> &CachePolicy {
    &self.policy
  }

  /// Provisioning: store every seed resource in the current generation.
  ///
  /// All seeds are fetched before the generation is opened; one failed fetch
  /// or non-2xx status fails the whole install and nothing is stored. A
  /// generation created by a failed write is removed again.
  pub async fn install(&self, host: &dyn HostControl) -> Result<()> {
    let name = self.policy.generation_identifier();

    info!(generation = %name, count = self.seed_resources.len(), "Caching files");
    let entries = self.fetch_seeds().await?;

    let existed = self.store.keys().await?.contains(&name);
    let cache = self.store.open(&name).await?;
    if let Err(e) = cache.put_all(entries).await {
      if !existed {
        if let Err(cleanup) = self.store.delete(cache.name()).await {
          warn!(generation = %name, error = %cleanup, "Failed to remove unprovisioned generation");
        }
      }
      return Err(e.wrap_err(format!("Failed to provision generation {}", name)));
    }

    host.skip_waiting();
    Ok(())
  }

  async fn fetch_seeds(&self) -> Result<Vec<(Request, Response)>> {
    let mut seen = HashSet::new();
    let mut requests = Vec::with_capacity(self.seed_resources.len());
    for locator in &self.seed_resources {
      let request = Request::get(self.network.resolve(locator)?);
      if !seen.insert(request.cache_url().to_string()) {
        return Err(eyre!("Duplicate seed resource: {}", locator));
      }
      requests.push(request);
    }

    try_join_all(requests.into_iter().map(|request| async move {
      let response = self
        .network
        .fetch(&request)
        .await
        .map_err(|e| e.wrap_err(format!("Failed to fetch seed resource {}", request.url)))?;

      if !response.is_ok() {
        return Err(eyre!(
          "Seed resource {} returned status {}",
          request.url,
          response.status()
        ));
      }
      Ok::<_, Report>((request, response))
    }))
    .await
  }

  /// Interception: cache first, then network, then the store once more.
  ///
  /// A storage-eligible network response is duplicated; the duplicate is
  /// written in the background and the original goes back to the caller.
  pub async fn handle_fetch(&self, request: Request) -> Result<Intercepted> {
    if let Some(response) = self.store.match_request(&request).await? {
      debug!(url = %request.url, "Serving from cache");
      return Ok(Intercepted::from_cache(response));
    }

    match self.network.fetch(&request).await {
      Ok(response) => {
        if !self.policy.is_storage_eligible(&response, &request.url) {
          debug!(
            url = %request.url,
            status = response.status(),
            kind = %response.kind(),
            "Passing through without storing"
          );
          return Ok(Intercepted::from_network(response));
        }

        let (response, copy) = response.tee();
        self.spawn_write(request, copy);
        Ok(Intercepted::from_network(response))
      }
      Err(err) => match self.store.match_request(&request).await? {
        Some(response) => {
          debug!(url = %request.url, error = %err, "Network failed, serving from cache");
          Ok(Intercepted::offline(response))
        }
        None => Err(err.wrap_err(format!(
          "Failed to fetch {} and no cached copy is available",
          request.url
        ))),
      },
    }
  }

  /// Write a response into the current generation without blocking the caller.
  fn spawn_write(&self, request: Request, response: Response) {
    let store = Arc::clone(&self.store);
    let failures = Arc::clone(&self.failures);
    let name = self.policy.generation_identifier();

    let task = tokio::spawn(async move {
      let result: Result<()> = async {
        let cache = store.open(&name).await?;
        cache.put(&request, response).await
      }
      .await;

      match result {
        Ok(()) => debug!(url = %request.url, generation = %name, "Stored response"),
        Err(e) => {
          warn!(url = %request.url, generation = %name, error = %e, "Failed to store response");
          failures
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(e.wrap_err(format!("Failed to store {}", request.url)));
        }
      }
    });

    let mut writes = self.writes.lock().unwrap_or_else(PoisonError::into_inner);
    writes.retain(|handle| !handle.is_finished());
    writes.push(task);
  }

  /// Wait for every background write spawned so far and drain their failures.
  pub async fn flush(&self) -> Vec<Report> {
    let pending = std::mem::take(&mut *self.writes.lock().unwrap_or_else(PoisonError::into_inner));

    let mut failures = Vec::new();
    for result in join_all(pending).await {
      if let Err(e) = result {
        failures.push(eyre!("Background write panicked: {}", e));
      }
    }

    failures.append(&mut self.failures.lock().unwrap_or_else(PoisonError::into_inner));
    failures
  }

  /// Reconciliation: delete every generation other than the current one.
  ///
  /// Deletions are independent; a failure is logged and leaves that
  /// generation behind without stopping the others. Returns the names
  /// actually deleted.
  pub async fn activate(&self, host: &dyn HostControl) -> Result<Vec<String>> {
    let current = self.policy.generation_identifier();
    let names = match self.store.keys().await {
      Ok(names) => names,
      Err(e) => {
        // Interception must not depend on cleanup succeeding
        host.claim_clients();
        return Err(e.wrap_err("Failed to list generations for cleanup"));
      }
    };
    let stale: Vec<String> = names.into_iter().filter(|name| *name != current).collect();

    let results = join_all(stale.iter().map(|name| self.store.delete(name))).await;

    let mut deleted = Vec::new();
    for (name, result) in stale.into_iter().zip(results) {
      match result {
        Ok(true) => {
          info!(generation = %name, "Deleted stale generation");
          deleted.push(name);
        }
        Ok(false) => debug!(generation = %name, "Stale generation already gone"),
        Err(e) => warn!(generation = %name, error = %e, "Failed to delete stale generation"),
      }
    }

    host.claim_clients();
    Ok(deleted)
  }
}
