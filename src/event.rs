use color_eyre::{eyre::eyre, Result};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

use crate::cache::{CacheStore, Intercepted};
use crate::host::AgentHost;
use crate::net::{Network, Request};

/// Lifecycle events delivered by the host runtime
#[derive(Debug)]
pub enum Event {
  /// Provision the agent's generation
  Install(oneshot::Sender<Result<()>>),
  /// Reconcile generations and take control of clients
  Activate(oneshot::Sender<Result<()>>),
  /// A client issued a request
  Fetch(Request, oneshot::Sender<Result<Intercepted>>),
}

/// Sends events to a spawned dispatch loop and waits for each to complete.
///
/// Lifecycle events run one at a time in arrival order; fetch events are
/// spawned so several can be in flight at once.
#[derive(Clone)]
pub struct EventDispatcher {
  tx: mpsc::UnboundedSender<Event>,
}

impl EventDispatcher {
  /// Wire the host's handlers to a new dispatch loop
  pub fn spawn<S: CacheStore, N: Network>(host: Arc<AgentHost<S, N>>) -> Self {
    let (tx, mut rx) = mpsc::unbounded_channel();

    tokio::spawn(async move {
      while let Some(event) = rx.recv().await {
        match event {
          Event::Install(reply) => {
            let _ = reply.send(host.install().await);
          }
          Event::Activate(reply) => {
            let _ = reply.send(host.activate().await);
          }
          Event::Fetch(request, reply) => {
            let host = Arc::clone(&host);
            tokio::spawn(async move {
              let _ = reply.send(host.fetch(request).await);
            });
          }
        }
      }
      debug!("Event loop stopped");
    });

    Self { tx }
  }

  fn send(&self, event: Event) -> Result<()> {
    self
      .tx
      .send(event)
      .map_err(|_| eyre!("Event loop has stopped"))
  }

  pub async fn install(&self) -> Result<()> {
    let (tx, rx) = oneshot::channel();
    self.send(Event::Install(tx))?;
    rx.await.map_err(|_| eyre!("Install event was dropped"))?
  }

  pub async fn activate(&self) -> Result<()> {
    let (tx, rx) = oneshot::channel();
    self.send(Event::Activate(tx))?;
    rx.await.map_err(|_| eyre!("Activate event was dropped"))?
  }

  pub async fn fetch(&self, request: Request) -> Result<Intercepted> {
    let (tx, rx) = oneshot::channel();
    self.send(Event::Fetch(request, tx))?;
    rx.await.map_err(|_| eyre!("Fetch event was dropped"))?
  }
}
