//! Per-account OAuth tokens: encrypted storage and refresh
//!
//! `get_valid_token` is the only way the engine obtains a bearer token.
//! Refreshes for one account are serialized by a per-account mutex, so
//! concurrent callers never race a refresh; the second caller finds the
//! freshly stored token.

mod cipher;

pub use cipher::{CipherError, TokenCipher};

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::models::{AccountId, AuthState};
use crate::provider::api::TokenGrant;
use crate::provider::{MailProvider, ProviderError};
use crate::storage::SqliteMailStore;

/// Lifetime assumed when the token endpoint omits `expires_in`
const DEFAULT_TOKEN_LIFETIME_SECS: i64 = 3600;

#[derive(Debug, Error)]
pub enum AuthError {
    /// The provider rejected the refresh token; the user must sign in again
    #[error("refresh denied: {0}")]
    RefreshDenied(String),

    #[error("token refresh failed: {0}")]
    Transient(String),

    #[error("no credential stored for account {0}")]
    MissingCredential(AccountId),

    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

/// What is sealed into `accounts.credential`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct StoredToken {
    access_token: String,
    refresh_token: Option<String>,
    expires_at: DateTime<Utc>,
}

impl StoredToken {
    fn is_fresh(&self, now: DateTime<Utc>, skew: Duration) -> bool {
        self.expires_at
            .checked_sub_signed(skew)
            .is_some_and(|refresh_at| refresh_at > now)
    }
}

pub struct CredentialStore {
    store: Arc<SqliteMailStore>,
    cipher: TokenCipher,
    provider: Arc<dyn MailProvider>,
    skew: Duration,
    refresh_locks: Mutex<HashMap<AccountId, Arc<Mutex<()>>>>,
}

impl CredentialStore {
    pub fn new(
        store: Arc<SqliteMailStore>,
        cipher: TokenCipher,
        provider: Arc<dyn MailProvider>,
        skew: Duration,
    ) -> Self {
        Self {
            store,
            cipher,
            provider,
            skew,
            refresh_locks: Mutex::new(HashMap::new()),
        }
    }

    /// Persist tokens from a completed OAuth handshake
    ///
    /// Also marks the account active again. A grant without a refresh token
    /// keeps the one already stored.
    pub fn store_token(&self, account_id: AccountId, grant: &TokenGrant) -> Result<(), AuthError> {
        let previous = self.load(account_id).ok().flatten();
        let token = StoredToken {
            access_token: grant.access_token.clone(),
            refresh_token: grant
                .refresh_token
                .clone()
                .or_else(|| previous.and_then(|p| p.refresh_token)),
            expires_at: expiry(grant, Utc::now()),
        };
        self.save(account_id, &token)?;
        self.store.set_auth_state(account_id, AuthState::Active)?;
        log::info!("[AUTH] Stored tokens for account {}", account_id);
        Ok(())
    }

    /// A bearer token valid for at least the configured skew
    pub fn get_valid_token(&self, account_id: AccountId) -> Result<String, AuthError> {
        let account = self
            .store
            .get_account(account_id)?
            .ok_or(AuthError::MissingCredential(account_id))?;
        if account.auth_state == AuthState::Unauthenticated {
            return Err(AuthError::RefreshDenied(
                "account requires re-authentication".to_string(),
            ));
        }

        let lock = self.refresh_lock(account_id)?;
        let _guard = lock
            .lock()
            .map_err(|_| anyhow::anyhow!("refresh lock poisoned"))?;

        let token = self
            .load(account_id)?
            .ok_or(AuthError::MissingCredential(account_id))?;
        let now = Utc::now();
        if token.is_fresh(now, self.skew) {
            return Ok(token.access_token);
        }

        let refresh_token = token
            .refresh_token
            .clone()
            .ok_or(AuthError::MissingCredential(account_id))?;

        log::debug!("[AUTH] Refreshing access token for account {}", account_id);
        match self.provider.refresh_token(&refresh_token) {
            Ok(grant) => {
                let refreshed = StoredToken {
                    access_token: grant.access_token.clone(),
                    refresh_token: grant.refresh_token.clone().or(Some(refresh_token)),
                    expires_at: expiry(&grant, now),
                };
                self.save(account_id, &refreshed)?;
                Ok(refreshed.access_token)
            }
            Err(ProviderError::RefreshDenied(reason)) => self.deny(account_id, reason),
            Err(ProviderError::Unauthorized) => {
                self.deny(account_id, "refresh token rejected".to_string())
            }
            Err(e) => {
                log::warn!("[AUTH] Refresh for account {} failed: {}", account_id, e);
                Err(AuthError::Transient(e.to_string()))
            }
        }
    }

    /// Force a refresh on the next `get_valid_token`, after the provider
    /// rejected a token we still considered valid
    pub fn invalidate(&self, account_id: AccountId) -> Result<(), AuthError> {
        let lock = self.refresh_lock(account_id)?;
        let _guard = lock
            .lock()
            .map_err(|_| anyhow::anyhow!("refresh lock poisoned"))?;
        if let Some(mut token) = self.load(account_id)? {
            token.expires_at = Utc::now();
            self.save(account_id, &token)?;
        }
        Ok(())
    }

    fn deny(&self, account_id: AccountId, reason: String) -> Result<String, AuthError> {
        log::warn!(
            "[AUTH] Refresh denied for account {}, marking unauthenticated: {}",
            account_id,
            reason
        );
        self.store
            .set_auth_state(account_id, AuthState::Unauthenticated)?;
        Err(AuthError::RefreshDenied(reason))
    }

    fn refresh_lock(&self, account_id: AccountId) -> Result<Arc<Mutex<()>>, AuthError> {
        let mut locks = self
            .refresh_locks
            .lock()
            .map_err(|_| anyhow::anyhow!("refresh lock map poisoned"))?;
        Ok(locks.entry(account_id).or_default().clone())
    }

    fn load(&self, account_id: AccountId) -> Result<Option<StoredToken>, AuthError> {
        let Some(sealed) = self.store.load_credential(account_id)? else {
            return Ok(None);
        };
        let plaintext = self
            .cipher
            .open(&sealed)
            .map_err(|e| anyhow::anyhow!("Failed to open credential: {}", e))?;
        let token = serde_json::from_slice(&plaintext)
            .map_err(|e| anyhow::anyhow!("Corrupt credential: {}", e))?;
        Ok(Some(token))
    }

    fn save(&self, account_id: AccountId, token: &StoredToken) -> Result<(), AuthError> {
        let json = serde_json::to_vec(token).map_err(anyhow::Error::from)?;
        let sealed = self
            .cipher
            .seal(&json)
            .map_err(|e| anyhow::anyhow!("Failed to seal credential: {}", e))?;
        self.store.save_credential(account_id, &sealed)?;
        Ok(())
    }
}

/// Absolute expiry of a grant; lifetimes that do not fit fall back to the default
fn expiry(grant: &TokenGrant, now: DateTime<Utc>) -> DateTime<Utc> {
    let default = now + Duration::seconds(DEFAULT_TOKEN_LIFETIME_SECS);
    grant
        .expires_in
        .and_then(|secs| i64::try_from(secs).ok())
        .and_then(Duration::try_seconds)
        .and_then(|lifetime| now.checked_add_signed(lifetime))
        .unwrap_or(default)
}
