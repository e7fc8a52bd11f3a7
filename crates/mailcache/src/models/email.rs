//! Email model: the local row and the provider-side view it is built from

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::attachment::AttachmentMeta;
use super::category::CategoryId;
use super::label::{is_flag_label, labels};
use super::AccountId;

/// Local identifier of a cached email (database primary key)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EmailId(pub i64);

impl EmailId {
    pub fn new(id: i64) -> Self {
        Self(id)
    }

    pub fn get(&self) -> i64 {
        self.0
    }
}

impl From<i64> for EmailId {
    fn from(id: i64) -> Self {
        Self(id)
    }
}

/// An email address with optional display name
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmailAddress {
    /// Display name (e.g., "John Doe")
    pub name: Option<String>,
    /// Email address (e.g., "john@example.com")
    pub email: String,
}

impl EmailAddress {
    /// Create a new email address with just the email
    pub fn new(email: impl Into<String>) -> Self {
        Self {
            name: None,
            email: email.into(),
        }
    }

    /// Create a new email address with a display name
    pub fn with_name(name: impl Into<String>, email: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            email: email.into(),
        }
    }

    /// Parse a single header address: `Name <addr>`, `"Last, First" <addr>`
    /// or a bare address
    pub fn parse(s: &str) -> Self {
        let s = s.trim();
        let bracketed = s
            .rfind('<')
            .and_then(|open| s[open..].find('>').map(|len| (open, open + len)));

        match bracketed {
            Some((open, close)) => {
                let name = s[..open].trim().trim_matches('"').trim();
                Self {
                    name: (!name.is_empty()).then(|| name.to_string()),
                    email: s[open + 1..close].trim().to_string(),
                }
            }
            None => Self::new(s),
        }
    }

    /// Lowercased address, the key used by sender aggregates
    pub fn normalized(&self) -> String {
        self.email.trim().to_lowercase()
    }

    /// Lowercased domain part, if the address has one
    pub fn domain(&self) -> Option<String> {
        let (_, domain) = self.email.trim().rsplit_once('@')?;
        if domain.is_empty() {
            None
        } else {
            Some(domain.to_lowercase())
        }
    }

    /// Format the email address for display
    pub fn display(&self) -> String {
        match &self.name {
            Some(name) => format!("{} <{}>", name, self.email),
            None => self.email.clone(),
        }
    }
}

/// Parse a comma-separated address header
///
/// Commas inside quoted display names do not split.
pub fn parse_address_list(s: &str) -> Vec<EmailAddress> {
    let mut addrs = Vec::new();
    let mut in_quotes = false;
    let mut start = 0;

    for (i, c) in s.char_indices() {
        match c {
            '"' => in_quotes = !in_quotes,
            ',' if !in_quotes => {
                addrs.push(&s[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    addrs.push(&s[start..]);

    addrs
        .into_iter()
        .map(str::trim)
        .filter(|addr| !addr.is_empty())
        .map(EmailAddress::parse)
        .collect()
}

/// Full content of an email, fetched lazily
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EmailBody {
    pub text: Option<String>,
    pub html: Option<String>,
}

impl EmailBody {
    pub fn is_empty(&self) -> bool {
        self.text.is_none() && self.html.is_none()
    }
}

/// A cached email as read back from the local store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Email {
    pub id: EmailId,
    pub account_id: AccountId,
    /// Provider message id, unique per account
    pub remote_id: String,
    pub thread_id: String,
    pub from: EmailAddress,
    pub to: Vec<EmailAddress>,
    pub cc: Vec<EmailAddress>,
    pub subject: String,
    pub snippet: String,
    pub received_at: DateTime<Utc>,
    pub is_read: bool,
    pub is_starred: bool,
    pub is_trashed: bool,
    /// Non-flag labels (flags live in the boolean columns)
    pub label_ids: Vec<String>,
    pub has_attachments: bool,
    pub category_id: Option<CategoryId>,
    /// Set when the user picked the category by hand
    pub category_override: bool,
    /// Whether the full body has been fetched and cached
    pub has_body: bool,
}

impl Email {
    /// Labels including the provider flag labels derived from local state
    pub fn effective_labels(&self) -> Vec<String> {
        let mut all = self.label_ids.clone();
        if !self.is_read {
            all.push(labels::UNREAD.to_string());
        }
        if self.is_starred {
            all.push(labels::STARRED.to_string());
        }
        if self.is_trashed {
            all.push(labels::TRASH.to_string());
        }
        all
    }
}

/// Provider-side view of a message, produced by normalization
///
/// This is what `Added`/`Changed` change events carry. It holds only
/// provider-sourced fields; local-only state never appears here.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteEmail {
    pub remote_id: String,
    pub thread_id: String,
    pub from: EmailAddress,
    pub to: Vec<EmailAddress>,
    pub cc: Vec<EmailAddress>,
    pub subject: String,
    pub snippet: String,
    pub received_at: DateTime<Utc>,
    /// Full provider label set, flags included
    pub label_ids: Vec<String>,
    pub attachments: Vec<AttachmentMeta>,
    /// A List-Unsubscribe header was present
    pub has_list_unsubscribe: bool,
    /// Precedence: bulk/list or a List-Id header was present
    pub is_bulk: bool,
    /// Present only when the message was fetched in full format
    pub body: Option<EmailBody>,
}

impl RemoteEmail {
    /// Create a new builder
    pub fn builder(remote_id: impl Into<String>, thread_id: impl Into<String>) -> RemoteEmailBuilder {
        RemoteEmailBuilder::new(remote_id.into(), thread_id.into())
    }

    pub fn is_read(&self) -> bool {
        !self.has_label(labels::UNREAD)
    }

    pub fn is_starred(&self) -> bool {
        self.has_label(labels::STARRED)
    }

    pub fn is_trashed(&self) -> bool {
        self.has_label(labels::TRASH)
    }

    pub fn has_label(&self, label: &str) -> bool {
        self.label_ids.iter().any(|l| l == label)
    }

    /// Labels without the ones mapped onto boolean columns
    pub fn plain_labels(&self) -> Vec<String> {
        self.label_ids
            .iter()
            .filter(|l| !is_flag_label(l))
            .cloned()
            .collect()
    }
}

/// Builder for creating RemoteEmail instances
pub struct RemoteEmailBuilder {
    remote_id: String,
    thread_id: String,
    from: Option<EmailAddress>,
    to: Vec<EmailAddress>,
    cc: Vec<EmailAddress>,
    subject: String,
    snippet: String,
    received_at: Option<DateTime<Utc>>,
    label_ids: Vec<String>,
    attachments: Vec<AttachmentMeta>,
    has_list_unsubscribe: bool,
    is_bulk: bool,
    body: Option<EmailBody>,
}

impl RemoteEmailBuilder {
    fn new(remote_id: String, thread_id: String) -> Self {
        Self {
            remote_id,
            thread_id,
            from: None,
            to: Vec::new(),
            cc: Vec::new(),
            subject: String::new(),
            snippet: String::new(),
            received_at: None,
            label_ids: Vec::new(),
            attachments: Vec::new(),
            has_list_unsubscribe: false,
            is_bulk: false,
            body: None,
        }
    }

    pub fn from(mut self, from: EmailAddress) -> Self {
        self.from = Some(from);
        self
    }

    pub fn to(mut self, to: Vec<EmailAddress>) -> Self {
        self.to = to;
        self
    }

    pub fn cc(mut self, cc: Vec<EmailAddress>) -> Self {
        self.cc = cc;
        self
    }

    pub fn subject(mut self, subject: impl Into<String>) -> Self {
        self.subject = subject.into();
        self
    }

    pub fn snippet(mut self, snippet: impl Into<String>) -> Self {
        self.snippet = snippet.into();
        self
    }

    pub fn received_at(mut self, received_at: DateTime<Utc>) -> Self {
        self.received_at = Some(received_at);
        self
    }

    pub fn label_ids(mut self, label_ids: Vec<String>) -> Self {
        self.label_ids = label_ids;
        self
    }

    pub fn labels(self, labels: &[&str]) -> Self {
        self.label_ids(labels.iter().map(|l| l.to_string()).collect())
    }

    pub fn attachments(mut self, attachments: Vec<AttachmentMeta>) -> Self {
        self.attachments = attachments;
        self
    }

    pub fn list_unsubscribe(mut self, present: bool) -> Self {
        self.has_list_unsubscribe = present;
        self
    }

    pub fn bulk(mut self, is_bulk: bool) -> Self {
        self.is_bulk = is_bulk;
        self
    }

    pub fn body(mut self, body: Option<EmailBody>) -> Self {
        self.body = body;
        self
    }

    pub fn build(self) -> RemoteEmail {
        RemoteEmail {
            remote_id: self.remote_id,
            thread_id: self.thread_id,
            from: self
                .from
                .unwrap_or_else(|| EmailAddress::new("unknown@unknown.com")),
            to: self.to,
            cc: self.cc,
            subject: self.subject,
            snippet: self.snippet,
            received_at: self.received_at.unwrap_or_else(Utc::now),
            label_ids: self.label_ids,
            attachments: self.attachments,
            has_list_unsubscribe: self.has_list_unsubscribe,
            is_bulk: self.is_bulk,
            body: self.body,
        }
    }
}
