//! Entity kinds recorded in the mapping store.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{ImportError, Result};

/// Kind of target entity an original id is mapped to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
    User,
    UserEmail,
    Group,
    Category,
    Tag,
    Topic,
    Post,
}

impl EntityType {
    /// Every entity type, in declaration order.
    pub const ALL: [EntityType; 7] = [
        EntityType::User,
        EntityType::UserEmail,
        EntityType::Group,
        EntityType::Category,
        EntityType::Tag,
        EntityType::Topic,
        EntityType::Post,
    ];

    /// Stable name stored in the mapping store.
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityType::User => "user",
            EntityType::UserEmail => "user_email",
            EntityType::Group => "group",
            EntityType::Category => "category",
            EntityType::Tag => "tag",
            EntityType::Topic => "topic",
            EntityType::Post => "post",
        }
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntityType {
    type Err = ImportError;

    fn from_str(s: &str) -> Result<Self> {
        EntityType::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| ImportError::Config(format!("Invalid entity type: {}", s)))
    }
}

/// Kind of name recorded in the secondary name index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NameKind {
    Username,
    GroupName,
}

impl NameKind {
    /// Stable name stored in the mapping store.
    pub fn as_str(&self) -> &'static str {
        match self {
            NameKind::Username => "username",
            NameKind::GroupName => "group_name",
        }
    }
}

impl fmt::Display for NameKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Normalize a name for case-insensitive lookups.
pub fn normalize_name(name: &str) -> String {
    name.trim().to_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entity_type_roundtrip() {
        for t in EntityType::ALL {
            assert_eq!(t.as_str().parse::<EntityType>().unwrap(), t);
        }
    }

    #[test]
    fn test_invalid_entity_type() {
        assert!("forum".parse::<EntityType>().is_err());
    }

    #[test]
    fn test_normalize_name() {
        assert_eq!(normalize_name("  Alice "), "alice");
    }
}
