//! Mailbox synchronization and local cache engine
//!
//! This crate keeps a local SQLite replica of remote mailboxes:
//! - Domain models (Email, Account, Category, due items)
//! - Gmail provider client and OAuth token management
//! - Incremental, idempotent sync with a per-account scheduler
//! - Derived indexes (sender groups, topics, newsletters) and rule-based
//!   categorization maintained at ingest time
//! - Query API and local-first mutations for UI consumption
//! - Background workers for scheduled sends and reminders
//!
//! The crate has no UI dependencies; consumers subscribe to `MailEvent`s.

pub mod actions;
pub mod categorize;
pub mod config;
pub mod credentials;
pub mod derived;
pub mod events;
pub mod models;
pub mod provider;
pub mod query;
pub mod service;
pub mod storage;
pub mod sync;
pub mod workers;

#[cfg(test)]
mod testing;

pub use actions::ActionHandler;
pub use config::{EngineConfig, OAuthClientCredentials};
pub use credentials::{AuthError, CredentialStore, TokenCipher};
pub use events::{EventBus, EventListener, MailEvent};
pub use models::{
    Account, AccountId, AuthState, CategorizationRule, Category, CategoryId, ChangeEvent, Email,
    EmailAddress, EmailBody, EmailId, NewRule, NewScheduledEmail, NewsletterSender, Reminder,
    RemoteEmail, RuleMatch, ScheduledEmail, SenderGroup, Topic,
};
pub use provider::{GmailClient, MailProvider, OutboundSender, ProviderError};
pub use query::{EmailFilter, Page, TimeBucket};
pub use service::Engine;
pub use storage::{AppliedSummary, SqliteMailStore};
pub use sync::{AccountStatus, AccountSyncState, SyncError, SyncRequest, SyncScheduler};
