//! Store capability traits and interception result types.

use async_trait::async_trait;
use color_eyre::Result;

use crate::net::{Request, Response};

/// A persistent store of named cache generations.
///
/// Lookups through the store itself search every generation; writes go
/// through a [`CacheHandle`] obtained from [`CacheStore::open`].
#[async_trait]
pub trait CacheStore: Send + Sync + 'static {
  type Handle: CacheHandle;

  /// Open the generation with this name, creating it if needed.
  async fn open(&self, name: &str) -> Result<Self::Handle>;

  /// Find a stored response for the request in any generation.
  async fn match_request(&self, request: &Request) -> Result<Option<Response>>;

  /// Names of every generation present, oldest first.
  async fn keys(&self) -> Result<Vec<String>>;

  /// Delete a generation and everything stored in it.
  ///
  /// Returns false when no generation had that name.
  async fn delete(&self, name: &str) -> Result<bool>;
}

/// An open cache generation.
#[async_trait]
pub trait CacheHandle: Send + Sync + 'static {
  /// Name of the generation this handle writes to.
  fn name(&self) -> &str;

  /// Store a response for the request, replacing any previous entry.
  async fn put(&self, request: &Request, response: Response) -> Result<()>;

  /// Store every entry, or none of them.
  async fn put_all(&self, entries: Vec<(Request, Response)>) -> Result<()>;

  /// URLs of every request stored in this generation.
  async fn keys(&self) -> Result<Vec<String>>;
}

/// Result of an interception, including where the response came from.
#[derive(Debug)]
pub struct Intercepted {
  /// The response handed back to the caller
  pub response: Response,
  /// Where the response came from
  pub source: CacheSource,
}

impl Intercepted {
  /// Response served straight from the store.
  pub fn from_cache(response: Response) -> Self {
    Self {
      response,
      source: CacheSource::Cache,
    }
  }

  /// Response freshly fetched from the network.
  pub fn from_network(response: Response) -> Self {
    Self {
      response,
      source: CacheSource::Network,
    }
  }

  /// Response served from the store after the network failed.
  pub fn offline(response: Response) -> Self {
    Self {
      response,
      source: CacheSource::Offline,
    }
  }
}

/// Indicates where an intercepted response came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheSource {
  /// Found in the store before touching the network
  Cache,
  /// Fetched from the network
  Network,
  /// Network unavailable, served from the store
  Offline,
}

impl CacheSource {
  pub fn as_str(&self) -> &'static str {
    match self {
      Self::Cache => "cache",
      Self::Network => "network",
      Self::Offline => "offline",
    }
  }
}
