//! Versioned cache generation identifiers.

use serde::Deserialize;
use std::fmt;

/// A named, versioned bucket of stored responses.
///
/// Rendered as `<name>-v<version>`, e.g. `gobojango_map-v1`. Bumping the
/// version is what retires every response stored under the previous one.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Deserialize)]
pub struct Generation {
  pub name: String,
  pub version: u32,
}

impl Generation {
  pub fn new(name: impl Into<String>, version: u32) -> Self {
    Self {
      name: name.into(),
      version,
    }
  }

  /// The identifier the store keys this generation by.
  pub fn identifier(&self) -> String {
    self.to_string()
  }

  /// Parse an identifier produced by [`Generation::identifier`].
  ///
  /// Returns None for names that were not written by this agent.
  pub fn parse(identifier: &str) -> Option<Self> {
    let (name, version) = identifier.rsplit_once("-v")?;
    if name.is_empty() {
      return None;
    }
    let version = version.parse().ok()?;
    Some(Self::new(name, version))
  }
}

impl fmt::Display for Generation {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}-v{}", self.name, self.version)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_identifier_format() {
    assert_eq!(Generation::new("gobojango_map", 1).identifier(), "gobojango_map-v1");
  }

  #[test]
  fn test_parse_identifier() {
    assert_eq!(
      Generation::parse("lehututu_map-v12"),
      Some(Generation::new("lehututu_map", 12))
    );
    // Names may themselves contain the separator
    assert_eq!(
      Generation::parse("map-v2-v3"),
      Some(Generation::new("map-v2", 3))
    );
  }

  #[test]
  fn test_parse_rejects_foreign_names() {
    assert_eq!(Generation::parse("workbox-precache"), None);
    assert_eq!(Generation::parse("map-vx"), None);
    assert_eq!(Generation::parse("-v1"), None);
  }
}
