//! Account model representing a connected mailbox

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Database primary key of an account
pub type AccountId = i64;

/// Whether the engine may still act on behalf of an account
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthState {
    /// Tokens are present and the provider accepted the last refresh
    Active,
    /// The refresh token was revoked; the user must re-authenticate
    Unauthenticated,
}

impl AuthState {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuthState::Active => "active",
            AuthState::Unauthenticated => "unauthenticated",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "unauthenticated" => AuthState::Unauthenticated,
            _ => AuthState::Active,
        }
    }
}

/// A registered mailbox account
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Account {
    /// Unique integer identifier (database primary key)
    pub id: AccountId,
    /// Provider identity: the mailbox address (unique)
    pub email: String,
    /// Provider identity: display name
    pub display_name: Option<String>,
    /// Authentication health
    pub auth_state: AuthState,
    /// When the last sync cycle committed
    pub last_sync_at: Option<DateTime<Utc>>,
    /// Opaque provider cursor (Gmail historyId)
    pub sync_cursor: Option<String>,
    /// Message of the last failed sync cycle, cleared on success
    pub last_error: Option<String>,
    /// When `last_error` was recorded
    pub last_error_at: Option<DateTime<Utc>>,
    /// When the account was added
    pub added_at: DateTime<Utc>,
}

impl Account {
    /// Create a new account (id will be assigned by database)
    pub fn new(email: impl Into<String>) -> Self {
        Self {
            id: 0,
            email: email.into(),
            display_name: None,
            auth_state: AuthState::Active,
            last_sync_at: None,
            sync_cursor: None,
            last_error: None,
            last_error_at: None,
            added_at: Utc::now(),
        }
    }

    /// Set display name
    pub fn with_display_name(mut self, name: impl Into<String>) -> Self {
        self.display_name = Some(name.into());
        self
    }

    /// True once a first full listing has committed a cursor
    pub fn has_synced(&self) -> bool {
        self.sync_cursor.is_some()
    }

    pub fn is_authenticated(&self) -> bool {
        self.auth_state == AuthState::Active
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_account_new() {
        let account = Account::new("test@example.com");
        assert_eq!(account.id, 0);
        assert_eq!(account.email, "test@example.com");
        assert!(account.is_authenticated());
        assert!(!account.has_synced());
    }

    #[test]
    fn test_auth_state_parse() {
        assert_eq!(AuthState::parse("active"), AuthState::Active);
        assert_eq!(
            AuthState::parse(AuthState::Unauthenticated.as_str()),
            AuthState::Unauthenticated
        );
        assert_eq!(AuthState::parse("garbage"), AuthState::Active);
    }
}
