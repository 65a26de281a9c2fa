//! Decides which responses may be stored and under which generation.

use super::generation::Generation;
use crate::net::{Response, ResponseKind};

/// Locator substrings that mark map-tile imagery, which is never stored.
pub const DEFAULT_EXCLUSIONS: &[&str] = &["tile", "arcgis", "openstreetmap"];

/// Pure storage policy for one agent instance.
#[derive(Debug, Clone)]
pub struct CachePolicy {
  generation: Generation,
  exclusions: Vec<String>,
}

impl CachePolicy {
  pub fn new(generation: Generation, exclusions: Vec<String>) -> Self {
    Self {
      generation,
      exclusions,
    }
  }

  /// Policy with the default tile exclusions.
  pub fn with_default_exclusions(generation: Generation) -> Self {
    Self::new(
      generation,
      DEFAULT_EXCLUSIONS.iter().map(|s| s.to_string()).collect(),
    )
  }

  /// Identifier of the one generation this instance considers current.
  pub fn generation_identifier(&self) -> String {
    self.generation.identifier()
  }

  /// A plain 200 from the same origin, the only kind safe to replay offline.
  pub fn is_replayable(&self, response: &Response) -> bool {
    response.status() == 200 && response.kind() == ResponseKind::Basic
  }

  /// Whether the locator contains any exclusion substring.
  ///
  /// This is a literal substring test against the whole locator, so a
  /// first-party path such as `/tiles-legend.json` is excluded too.
  pub fn is_excluded(&self, locator: &str) -> bool {
    self
      .exclusions
      .iter()
      .any(|pattern| locator.contains(pattern.as_str()))
  }

  pub fn is_storage_eligible(&self, response: &Response, locator: &str) -> bool {
    self.is_replayable(response) && !self.is_excluded(locator)
  }
}
