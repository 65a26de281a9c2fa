//! Host runtime side of the agent: lifecycle state and control signals.

use color_eyre::{eyre::eyre, Result};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, info, warn};

use crate::cache::{CacheStore, Intercepted, LifecycleController};
use crate::net::{Network, Request};

/// Signals an agent sends back to the host runtime.
pub trait HostControl: Send + Sync {
  /// Make the installed agent eligible to activate without waiting for
  /// clients of the previous agent to close.
  fn skip_waiting(&self);

  /// Start controlling every open client right away.
  fn claim_clients(&self);
}

/// Where an agent is in its registration lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentState {
  Parsed,
  Installing,
  Installed,
  Activating,
  Activated,
  /// Install failed; the previous agent stays in charge
  Redundant,
}

/// Hosts one agent instance and routes client fetches through it once it
/// controls them.
pub struct AgentHost<S: CacheStore, N: Network> {
  controller: LifecycleController<S, N>,
  network: Arc<N>,
  state: Mutex<AgentState>,
  skip_waiting: AtomicBool,
  controlling: AtomicBool,
  /// Clients still held by the agent being replaced
  waiting_clients: AtomicUsize,
}

impl<S: CacheStore, N: Network> AgentHost<S, N> {
  pub fn new(controller: LifecycleController<S, N>, network: Arc<N>) -> Self {
    Self {
      controller,
      network,
      state: Mutex::new(AgentState::Parsed),
      skip_waiting: AtomicBool::new(false),
      controlling: AtomicBool::new(false),
      waiting_clients: AtomicUsize::new(0),
    }
  }

  /// Host an agent installed by an earlier run.
  ///
  /// Fails unless the store already holds the agent's generation.
  pub async fn restore(
    controller: LifecycleController<S, N>,
    network: Arc<N>,
    store: &S,
    state: AgentState,
  ) -> Result<Self> {
    let current = controller.policy().generation_identifier();
    if !store.keys().await?.contains(&current) {
      return Err(eyre!(
        "Generation {} is not installed; run install first",
        current
      ));
    }

    let host = Self::new(controller, network);
    host.set_state(state);
    host
      .controlling
      .store(state == AgentState::Activated, Ordering::SeqCst);
    Ok(host)
  }

  /// The new agent replaces one that still has open clients.
  pub fn replacing(self, open_clients: usize) -> Self {
    self.waiting_clients.store(open_clients, Ordering::SeqCst);
    self
  }

  pub fn controller(&self) -> &LifecycleController<S, N> {
    &self.controller
  }

  pub fn state(&self) -> AgentState {
    *self.state.lock().unwrap_or_else(PoisonError::into_inner)
  }

  fn set_state(&self, state: AgentState) {
    debug!(?state, "Agent state changed");
    *self.state.lock().unwrap_or_else(PoisonError::into_inner) = state;
  }

  fn transition(&self, from: AgentState, to: AgentState) -> Result<()> {
    let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
    if *state != from {
      return Err(eyre!("Agent is {:?}, expected {:?}", *state, from));
    }
    *state = to;
    debug!(state = ?to, "Agent state changed");
    Ok(())
  }

  pub fn is_controlling(&self) -> bool {
    self.controlling.load(Ordering::SeqCst)
  }

  /// Whether an installed agent may activate now.
  pub fn can_activate(&self) -> bool {
    self.state() == AgentState::Installed
      && (self.skip_waiting.load(Ordering::SeqCst)
        || self.waiting_clients.load(Ordering::SeqCst) == 0)
  }

  /// Run the provisioning phase.
  pub async fn install(&self) -> Result<()> {
    self.transition(AgentState::Parsed, AgentState::Installing)?;

    match self.controller.install(self).await {
      Ok(()) => {
        self.set_state(AgentState::Installed);
        info!(
          generation = %self.controller.policy().generation_identifier(),
          "Agent installed"
        );
        Ok(())
      }
      Err(e) => {
        self.set_state(AgentState::Redundant);
        warn!(error = %e, "Agent install failed");
        Err(e)
      }
    }
  }

  /// Run the reconciliation phase.
  pub async fn activate(&self) -> Result<()> {
    if self.state() == AgentState::Installed && !self.can_activate() {
      return Err(eyre!(
        "Waiting for {} client(s) of the previous agent to close",
        self.waiting_clients.load(Ordering::SeqCst)
      ));
    }
    self.transition(AgentState::Installed, AgentState::Activating)?;

    let result = self.controller.activate(self).await;
    self.set_state(AgentState::Activated);

    let deleted = result?;
    info!(deleted = deleted.len(), "Agent activated");
    Ok(())
  }

  /// Dispatch a client fetch: intercepted when controlled, direct otherwise.
  pub async fn fetch(&self, request: Request) -> Result<Intercepted> {
    if self.is_controlling() {
      return self.controller.handle_fetch(request).await;
    }

    let response = self.network.fetch(&request).await?;
    Ok(Intercepted::from_network(response))
  }
}

impl<S: CacheStore, N: Network> HostControl for AgentHost<S, N> {
  fn skip_waiting(&self) {
    self.skip_waiting.store(true, Ordering::SeqCst);
  }

  fn claim_clients(&self) {
    self.controlling.store(true, Ordering::SeqCst);
    self.waiting_clients.store(0, Ordering::SeqCst);
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::{CachePolicy, CacheSource, Generation, SqliteStore};
  use crate::net::stub::StubNetwork;
  use crate::net::ResponseKind;

  fn host(store: Arc<SqliteStore>, network: Arc<StubNetwork>) -> AgentHost<SqliteStore, StubNetwork> {
    let controller = LifecycleController::new(
      store,
      Arc::clone(&network),
      CachePolicy::with_default_exclusions(Generation::new("map", 1)),
      vec!["./map.html".to_string()],
    );
    AgentHost::new(controller, network)
  }

  fn network() -> Arc<StubNetwork> {
    Arc::new(StubNetwork::new().with_route("./map.html", 200, ResponseKind::Basic, "map"))
  }

  #[tokio::test]
  async fn test_skip_waiting_allows_takeover() {
    let store = Arc::new(SqliteStore::open_in_memory().unwrap());
    let host = host(store, network()).replacing(2);
    assert!(!host.can_activate());

    host.install().await.unwrap();
    assert!(host.can_activate());
    host.activate().await.unwrap();
    assert_eq!(host.state(), AgentState::Activated);
    assert!(host.is_controlling());
  }

  #[tokio::test]
  async fn test_failed_install_is_redundant() {
    let store = Arc::new(SqliteStore::open_in_memory().unwrap());
    let host = host(store, Arc::new(StubNetwork::new()));

    assert!(host.install().await.is_err());
    assert_eq!(host.state(), AgentState::Redundant);
    assert!(!host.is_controlling());
    assert!(host.activate().await.is_err());
  }

  #[tokio::test]
  async fn test_install_only_runs_once() {
    let store = Arc::new(SqliteStore::open_in_memory().unwrap());
    let host = host(store, network());

    host.install().await.unwrap();
    assert_eq!(host.state(), AgentState::Installed);
    assert!(host.install().await.is_err());
  }

  #[tokio::test]
  async fn test_uncontrolled_fetch_bypasses_store() {
    let store = Arc::new(SqliteStore::open_in_memory().unwrap());
    let network = network();
    let host = host(store, Arc::clone(&network));

    host.install().await.unwrap();
    let result = host.fetch(Request::get("./map.html")).await.unwrap();
    assert_eq!(result.source, CacheSource::Network);

    host.activate().await.unwrap();
    let result = host.fetch(Request::get("./map.html")).await.unwrap();
    assert_eq!(result.source, CacheSource::Cache);
    assert_eq!(network.calls("./map.html"), 2);
  }

  #[tokio::test]
  async fn test_restore_requires_installed_generation() {
    let store = Arc::new(SqliteStore::open_in_memory().unwrap());
    let network = network();
    let controller = || {
      LifecycleController::new(
        Arc::clone(&store),
        Arc::clone(&network),
        CachePolicy::with_default_exclusions(Generation::new("map", 1)),
        Vec::new(),
      )
    };

    let restored =
      AgentHost::restore(controller(), Arc::clone(&network), &*store, AgentState::Activated).await;
    assert!(restored.is_err());

    store.open("map-v1").await.unwrap();
    let host =
      AgentHost::restore(controller(), Arc::clone(&network), &*store, AgentState::Activated)
        .await
        .unwrap();
    assert!(host.is_controlling());
    assert_eq!(host.state(), AgentState::Activated);
  }

  #[tokio::test]
  async fn test_waits_for_previous_clients_without_skip_waiting() {
    let store = Arc::new(SqliteStore::open_in_memory().unwrap());
    let host = host(store, network()).replacing(1);

    // Installed by hand, so skip_waiting was never signalled
    host.set_state(AgentState::Installed);
    assert!(!host.can_activate());
    assert!(host.activate().await.is_err());
    assert_eq!(host.state(), AgentState::Installed);
  }

  #[tokio::test]
  async fn test_failed_upgrade_keeps_previous_generation() {
    let store = Arc::new(SqliteStore::open_in_memory().unwrap());
    let network = network();
    let v1 = host(Arc::clone(&store), Arc::clone(&network));
    v1.install().await.unwrap();
    v1.activate().await.unwrap();

    // The next generation lists a seed the network cannot serve
    let upgrade = || {
      LifecycleController::new(
        Arc::clone(&store),
        Arc::clone(&network),
        CachePolicy::with_default_exclusions(Generation::new("map", 2)),
        vec!["./map.html".to_string(), "./missing.json".to_string()],
      )
    };
    let v2 = AgentHost::new(upgrade(), Arc::clone(&network)).replacing(1);
    assert!(v2.install().await.is_err());
    assert_eq!(store.keys().await.unwrap(), vec!["map-v1"]);

    // A later invocation must not take the failed generation for installed
    let restored =
      AgentHost::restore(upgrade(), Arc::clone(&network), &*store, AgentState::Installed).await;
    assert!(restored.is_err());

    let result = v1.fetch(Request::get("./map.html")).await.unwrap();
    assert_eq!(result.source, CacheSource::Cache);
    assert_eq!(store.keys().await.unwrap(), vec!["map-v1"]);
  }
}
