//! One sync cycle for one account
//!
//! A cycle is: obtain a token, push pending local edits, pull changes since
//! the stored cursor, apply them in one transaction. The cursor only moves
//! when the apply commits, so a cycle that fails anywhere is simply retried.

use std::sync::Arc;
use std::time::{Duration, Instant};

use thiserror::Error;

use super::delta::DeltaFetcher;
use crate::credentials::{AuthError, CredentialStore};
use crate::events::{EventBus, MailEvent};
use crate::models::{AccountId, labels};
use crate::provider::{MailProvider, ProviderError};
use crate::storage::{AppliedSummary, PendingFlag, PendingMutation, SqliteMailStore};

#[derive(Debug, Error)]
pub enum SyncError {
    /// The account needs to sign in again; not retried
    #[error("account is not authenticated: {0}")]
    Unauthenticated(String),

    #[error("rate limited by provider")]
    RateLimited { retry_after: Option<Duration> },

    #[error("transient failure: {0}")]
    Transient(String),

    /// The provider rejected a request outright; the cycle is abandoned
    #[error("provider error: {0}")]
    Permanent(String),

    #[error(transparent)]
    Local(#[from] anyhow::Error),
}

impl SyncError {
    /// Whether the scheduler should back off and retry
    pub fn is_retryable(&self) -> bool {
        matches!(self, SyncError::RateLimited { .. } | SyncError::Transient(_))
    }

    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            SyncError::RateLimited { retry_after } => *retry_after,
            _ => None,
        }
    }
}

impl From<ProviderError> for SyncError {
    fn from(e: ProviderError) -> Self {
        match e {
            ProviderError::RateLimited { retry_after } => SyncError::RateLimited { retry_after },
            ProviderError::RefreshDenied(reason) => SyncError::Unauthenticated(reason),
            ProviderError::Unauthorized | ProviderError::CursorInvalid => {
                SyncError::Transient(e.to_string())
            }
            ProviderError::Transient(reason) => SyncError::Transient(reason),
            ProviderError::NotFound => SyncError::Permanent(e.to_string()),
            ProviderError::Permanent(reason) => SyncError::Permanent(reason),
        }
    }
}

impl From<AuthError> for SyncError {
    fn from(e: AuthError) -> Self {
        match e {
            AuthError::RefreshDenied(reason) => SyncError::Unauthenticated(reason),
            AuthError::MissingCredential(_) => SyncError::Unauthenticated(e.to_string()),
            AuthError::Transient(reason) => SyncError::Transient(reason),
            AuthError::Storage(e) => SyncError::Local(e),
        }
    }
}

/// Statistics from one sync cycle
#[derive(Debug, Clone, Default)]
pub struct SyncReport {
    pub summary: AppliedSummary,
    /// The cycle listed the whole mailbox
    pub full_resync: bool,
    /// Emails whose pending edits were pushed
    pub pushed: usize,
    pub duration_ms: u64,
}

/// Runs sync cycles; the scheduler's seam for tests
pub trait SyncRunner: Send + Sync {
    fn run_cycle(&self, account_id: AccountId, full: bool) -> Result<SyncReport, SyncError>;
}

pub struct SyncEngine {
    store: Arc<SqliteMailStore>,
    credentials: Arc<CredentialStore>,
    provider: Arc<dyn MailProvider>,
    fetcher: DeltaFetcher,
    events: Arc<EventBus>,
}

impl SyncEngine {
    pub fn new(
        store: Arc<SqliteMailStore>,
        credentials: Arc<CredentialStore>,
        provider: Arc<dyn MailProvider>,
        fetcher: DeltaFetcher,
        events: Arc<EventBus>,
    ) -> Self {
        Self {
            store,
            credentials,
            provider,
            fetcher,
            events,
        }
    }

    /// Map a provider failure, dropping a token the provider refused
    fn provider_failure(&self, account_id: AccountId, e: ProviderError) -> SyncError {
        if e == ProviderError::Unauthorized {
            log::warn!(
                "[SYNC] Token rejected for account {}, forcing refresh",
                account_id
            );
            if let Err(err) = self.credentials.invalidate(account_id) {
                log::error!("[SYNC] Failed to invalidate token: {}", err);
            }
        }
        SyncError::from(e)
    }

    /// Push every pending local edit of an account
    ///
    /// Confirmation arrives through the provider's own change feed; here we
    /// only clear edits the provider can never accept.
    fn push_pending(&self, token: &str, account_id: AccountId) -> Result<usize, SyncError> {
        let pending = self.store.list_pending_mutations(account_id)?;
        let mut pushed = 0;

        for mutation in pending {
            match self.push_one(token, &mutation) {
                Ok(()) => pushed += 1,
                Err(e @ (ProviderError::NotFound | ProviderError::Permanent(_))) => {
                    log::warn!(
                        "[SYNC] Dropping pending edit on {}: {}",
                        mutation.remote_id,
                        e
                    );
                    self.drop_pending(&mutation)?;
                }
                Err(e) => return Err(self.provider_failure(account_id, e)),
            }
        }

        if pushed > 0 {
            log::info!(
                "[SYNC] Pushed {} pending edits for account {}",
                pushed,
                account_id
            );
        }
        Ok(pushed)
    }

    fn push_one(&self, token: &str, mutation: &PendingMutation) -> Result<(), ProviderError> {
        let mut add = mutation.add_labels.clone();
        let mut remove = mutation.remove_labels.clone();
        match mutation.read {
            Some(true) => remove.push(labels::UNREAD.to_string()),
            Some(false) => add.push(labels::UNREAD.to_string()),
            None => {}
        }
        match mutation.starred {
            Some(true) => add.push(labels::STARRED.to_string()),
            Some(false) => remove.push(labels::STARRED.to_string()),
            None => {}
        }
        if mutation.trash == Some(false) {
            remove.push(labels::TRASH.to_string());
        }

        if !add.is_empty() || !remove.is_empty() {
            self.provider
                .modify_labels(token, &mutation.remote_id, &add, &remove)?;
        }
        if mutation.trash == Some(true) {
            self.provider.trash_message(token, &mutation.remote_id)?;
        }
        Ok(())
    }

    fn drop_pending(&self, mutation: &PendingMutation) -> anyhow::Result<()> {
        let flags = [
            (PendingFlag::Read, mutation.read),
            (PendingFlag::Starred, mutation.starred),
            (PendingFlag::Trash, mutation.trash),
        ];
        for (flag, value) in flags {
            if let Some(value) = value {
                self.store
                    .clear_pending_flag(mutation.email_id, flag, value)?;
            }
        }
        for label in &mutation.add_labels {
            self.store.clear_pending_label_op(
                mutation.email_id,
                label,
                crate::storage::LabelOp::Add,
            )?;
        }
        for label in &mutation.remove_labels {
            self.store.clear_pending_label_op(
                mutation.email_id,
                label,
                crate::storage::LabelOp::Remove,
            )?;
        }
        Ok(())
    }
}

impl SyncRunner for SyncEngine {
    fn run_cycle(&self, account_id: AccountId, full: bool) -> Result<SyncReport, SyncError> {
        let start = Instant::now();
        let token = self.credentials.get_valid_token(account_id)?;

        let pushed = self.push_pending(&token, account_id)?;

        let cursor = self.store.get_sync_cursor(account_id)?;
        let batch = self
            .fetcher
            .fetch_changes(&token, cursor.as_deref(), full)
            .map_err(|e| self.provider_failure(account_id, e))?;

        let summary = if batch.full_resync {
            self.store.apply_full_listing(
                account_id,
                &batch.changes,
                &batch.new_cursor,
                batch.complete,
            )?
        } else {
            self.store
                .apply_changes(account_id, &batch.changes, &batch.new_cursor)?
        };

        if summary.has_changes() {
            self.events.emit(MailEvent::EmailsChanged { account_id });
        }

        let report = SyncReport {
            summary,
            full_resync: batch.full_resync,
            pushed,
            duration_ms: start.elapsed().as_millis() as u64,
        };
        log::info!(
            "[SYNC] Account {} synced in {}ms: +{} ~{} -{}{}",
            account_id,
            report.duration_ms,
            summary.added,
            summary.updated,
            summary.deleted,
            if batch.full_resync { " (full)" } else { "" }
        );
        Ok(report)
    }
}
