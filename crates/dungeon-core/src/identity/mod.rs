//! Identifiers for characters and locations.
//!
//! Both are opaque strings. The engine never interprets them beyond using
//! them as map keys, so any non-empty name the game hands over is accepted.

use std::borrow::Borrow;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum IdError {
    #[error("identifier cannot be empty")]
    Empty,
}

/// Name of a character whose conversation state is tracked.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityId(String);

impl EntityId {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_inner(self) -> String {
        self.0
    }
}

impl std::str::FromStr for EntityId {
    type Err = IdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.trim().is_empty() {
            return Err(IdError::Empty);
        }
        Ok(Self(s.to_string()))
    }
}

impl From<&str> for EntityId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for EntityId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl AsRef<str> for EntityId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl Borrow<str> for EntityId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for EntityId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Location key for the shared context pool, e.g. `world/town/tavern`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LocationId(String);

impl LocationId {
    pub fn new(path: impl Into<String>) -> Self {
        Self(path.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::str::FromStr for LocationId {
    type Err = IdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.trim().is_empty() {
            return Err(IdError::Empty);
        }
        Ok(Self(s.to_string()))
    }
}

impl From<&str> for LocationId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for LocationId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl AsRef<str> for LocationId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl Borrow<str> for LocationId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for LocationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    #[test]
    fn entity_id_parses_non_empty_name() {
        let id: EntityId = "Old Tom".parse().unwrap();
        assert_eq!(id.as_str(), "Old Tom");
        assert_eq!(id.to_string(), "Old Tom");
    }

    #[test]
    fn entity_id_rejects_blank_name() {
        assert_eq!("   ".parse::<EntityId>(), Err(IdError::Empty));
        assert_eq!("".parse::<LocationId>(), Err(IdError::Empty));
    }

    #[test]
    fn ids_can_be_looked_up_by_str() {
        let mut limits: HashMap<EntityId, usize> = HashMap::new();
        limits.insert(EntityId::from("blacksmith"), 2000);
        assert_eq!(limits.get("blacksmith"), Some(&2000));
    }

    #[test]
    fn ids_serialize_as_plain_strings() {
        let json = serde_json::to_value(LocationId::new("world/town")).unwrap();
        assert_eq!(json, serde_json::json!("world/town"));

        let back: EntityId = serde_json::from_value(serde_json::json!("innkeeper")).unwrap();
        assert_eq!(back, EntityId::new("innkeeper"));
    }
}
