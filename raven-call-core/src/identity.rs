//! User identity
//!
//! Chat users are addressed by the backend's user id (typically an email-like
//! string). The same id is used as the calling SDK's `fromNumber`/`toNumber`.

use serde::{Deserialize, Serialize};
use std::fmt::{Debug, Display};

/// Identifier of a chat user taking part in calls
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(pub String);

impl UserId {
    /// Create a new user id
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    /// Get the inner string
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether the id is empty (never a valid call party)
    pub fn is_empty(&self) -> bool {
        self.0.trim().is_empty()
    }
}

impl Display for UserId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for UserId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for UserId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Identity of the local user as returned with the call credentials
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalUser {
    /// Backend user id
    pub user_id: UserId,
    /// Display name shown to peers, if known
    pub full_name: Option<String>,
}

impl LocalUser {
    /// Create a local user without a display name
    pub fn new(user_id: impl Into<UserId>) -> Self {
        Self {
            user_id: user_id.into(),
            full_name: None,
        }
    }

    /// Name to present to peers, falling back to the user id
    pub fn display_name(&self) -> String {
        self.full_name
            .clone()
            .filter(|n| !n.trim().is_empty())
            .unwrap_or_else(|| self.user_id.to_string())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_user_id_display() {
        let id = UserId::new("alice@example.com");
        assert_eq!(id.to_string(), "alice@example.com");
        assert_eq!(id.as_str(), "alice@example.com");
        assert!(!id.is_empty());
        assert!(UserId::new("  ").is_empty());
    }

    #[test]
    fn test_user_id_serializes_as_plain_string() {
        let id = UserId::new("bob");
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"bob\"");
        let back: UserId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
    }

    #[test]
    fn test_local_user_display_name_fallback() {
        let mut me = LocalUser::new("carol");
        assert_eq!(me.display_name(), "carol");
        me.full_name = Some("Carol Danvers".to_string());
        assert_eq!(me.display_name(), "Carol Danvers");
    }
}
