//! Derived aggregates maintained alongside the email table

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::AccountId;

/// Emails grouped by normalized sender address
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SenderGroup {
    pub account_id: AccountId,
    pub sender_email: String,
    pub display_name: Option<String>,
    pub message_count: u64,
    pub last_seen_at: DateTime<Utc>,
}

/// Emails grouped by normalized subject
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Topic {
    pub account_id: AccountId,
    /// Subject with reply/forward prefixes stripped, lowercased
    pub normalized_subject: String,
    /// Subject as first seen, prefixes stripped but case kept
    pub display_subject: String,
    pub message_count: u64,
    pub last_seen_at: DateTime<Utc>,
}

/// A sender detected as sending bulk mail
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewsletterSender {
    pub account_id: AccountId,
    pub sender_email: String,
    pub display_name: Option<String>,
    pub email_count: u64,
    pub is_muted: bool,
    pub last_seen_at: DateTime<Utc>,
}
