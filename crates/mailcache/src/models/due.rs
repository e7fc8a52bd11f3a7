//! User-created due items: scheduled emails and reminders

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{AccountId, EmailAddress, EmailId};

/// Lifecycle of a due item row
///
/// Fired items are deleted, so there is no terminal "done" state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DueStatus {
    Pending,
    /// Claimed by a poller; the side effect is running
    Processing,
    /// Gave up after repeated failures or a crashed claim
    Failed,
}

impl DueStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DueStatus::Pending => "pending",
            DueStatus::Processing => "processing",
            DueStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "processing" => DueStatus::Processing,
            "failed" => DueStatus::Failed,
            _ => DueStatus::Pending,
        }
    }
}

/// An outgoing email queued for a future send time
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduledEmail {
    pub id: i64,
    pub account_id: AccountId,
    pub to: Vec<EmailAddress>,
    pub cc: Vec<EmailAddress>,
    pub subject: String,
    pub body: String,
    pub send_at: DateTime<Utc>,
    pub status: DueStatus,
    pub attempts: u32,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Input for scheduling an email
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewScheduledEmail {
    pub account_id: AccountId,
    pub to: Vec<EmailAddress>,
    pub cc: Vec<EmailAddress>,
    pub subject: String,
    pub body: String,
    pub send_at: DateTime<Utc>,
}

/// A reminder to resurface an email (or a free-form note) later
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reminder {
    pub id: i64,
    pub account_id: AccountId,
    pub email_id: Option<EmailId>,
    pub note: String,
    pub remind_at: DateTime<Utc>,
    pub status: DueStatus,
    pub created_at: DateTime<Utc>,
}
