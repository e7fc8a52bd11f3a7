//! Remote mailbox provider integration
//!
//! This module provides:
//! - The `MailProvider` seam the sync engine talks through
//! - A Gmail REST implementation (`GmailClient`)
//! - Response normalization to domain models
//! - The provider error taxonomy

mod client;
mod error;
mod normalize;

pub use client::GmailClient;
pub use error::ProviderError;
pub use normalize::normalize_message;

use api::{
    GmailMessage, HistoryResponse, ListLabelsResponse, ListMessagesResponse, ProfileResponse,
    TokenGrant,
};

/// How much of a message to fetch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageFormat {
    /// Headers, labels and snippet only; used by sync listings
    Metadata,
    /// Everything including bodies; used by lazy detail fetch
    Full,
}

impl MessageFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageFormat::Metadata => "metadata",
            MessageFormat::Full => "full",
        }
    }
}

/// Operations the engine consumes from the remote mailbox provider
///
/// Every call except `refresh_token` takes a bearer token obtained from the
/// credential store. Implementations are blocking.
pub trait MailProvider: Send + Sync {
    /// Mailbox identity and the current history marker
    fn get_profile(&self, token: &str) -> Result<ProfileResponse, ProviderError>;

    /// One page of message ids, newest first
    fn list_messages(
        &self,
        token: &str,
        max_results: usize,
        page_token: Option<&str>,
    ) -> Result<ListMessagesResponse, ProviderError>;

    /// One message in the requested format
    fn get_message(
        &self,
        token: &str,
        remote_id: &str,
        format: MessageFormat,
    ) -> Result<GmailMessage, ProviderError>;

    /// One page of changes since `start_history_id`
    ///
    /// Returns `ProviderError::CursorInvalid` when the provider can no longer
    /// resolve the start marker.
    fn list_history(
        &self,
        token: &str,
        start_history_id: &str,
        page_token: Option<&str>,
    ) -> Result<HistoryResponse, ProviderError>;

    /// All labels in the mailbox
    fn list_labels(&self, token: &str) -> Result<ListLabelsResponse, ProviderError>;

    /// Add and remove labels on one message
    fn modify_labels(
        &self,
        token: &str,
        remote_id: &str,
        add: &[String],
        remove: &[String],
    ) -> Result<(), ProviderError>;

    /// Move one message to the provider's trash
    fn trash_message(&self, token: &str, remote_id: &str) -> Result<(), ProviderError>;

    /// Exchange a refresh token for a new access token
    fn refresh_token(&self, refresh_token: &str) -> Result<TokenGrant, ProviderError>;
}

/// Outbound transport used by the scheduled-send worker
pub trait OutboundSender: Send + Sync {
    /// Submit an RFC 5322 message for delivery
    fn send_raw(&self, token: &str, raw_message: &[u8]) -> Result<(), ProviderError>;
}

/// Gmail API response types
pub mod api {
    use serde::{Deserialize, Serialize};

    /// Mailbox profile
    #[derive(Debug, Clone, Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub struct ProfileResponse {
        pub email_address: String,
        pub messages_total: Option<u64>,
        pub history_id: String,
    }

    /// Response from listing messages
    #[derive(Debug, Clone, Default, Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub struct ListMessagesResponse {
        pub messages: Option<Vec<MessageRef>>,
        pub next_page_token: Option<String>,
        pub result_size_estimate: Option<u32>,
    }

    /// Reference to a message (just ID and thread ID)
    #[derive(Debug, Clone, Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub struct MessageRef {
        pub id: String,
        pub thread_id: Option<String>,
    }

    /// Message from the Gmail API (metadata or full format)
    #[derive(Debug, Clone, Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub struct GmailMessage {
        pub id: String,
        pub thread_id: String,
        pub label_ids: Option<Vec<String>>,
        #[serde(default)]
        pub snippet: String,
        pub history_id: Option<String>,
        pub internal_date: Option<String>,
        pub payload: Option<MessagePayload>,
    }

    /// Message payload containing headers and body
    #[derive(Debug, Clone, Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub struct MessagePayload {
        pub headers: Option<Vec<Header>>,
        pub body: Option<MessageBody>,
        pub parts: Option<Vec<MessagePart>>,
        pub mime_type: Option<String>,
        pub filename: Option<String>,
    }

    /// Email header (name-value pair)
    #[derive(Debug, Clone, Deserialize, Serialize)]
    pub struct Header {
        pub name: String,
        pub value: String,
    }

    /// Message body (may be base64 encoded)
    #[derive(Debug, Clone, Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub struct MessageBody {
        pub size: Option<u64>,
        pub data: Option<String>,
        pub attachment_id: Option<String>,
    }

    /// Message part (for multipart messages)
    #[derive(Debug, Clone, Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub struct MessagePart {
        pub part_id: Option<String>,
        pub mime_type: Option<String>,
        pub filename: Option<String>,
        pub headers: Option<Vec<Header>>,
        pub body: Option<MessageBody>,
        pub parts: Option<Vec<MessagePart>>,
    }

    /// Response from the history endpoint
    #[derive(Debug, Clone, Default, Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub struct HistoryResponse {
        pub history: Option<Vec<HistoryRecord>>,
        pub next_page_token: Option<String>,
        pub history_id: Option<String>,
    }

    /// One history entry; each list is optional
    #[derive(Debug, Clone, Default, Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub struct HistoryRecord {
        pub id: String,
        pub messages_added: Option<Vec<HistoryMessage>>,
        pub messages_deleted: Option<Vec<HistoryMessage>>,
        pub labels_added: Option<Vec<HistoryLabelChange>>,
        pub labels_removed: Option<Vec<HistoryLabelChange>>,
    }

    /// Message reference inside a history entry
    #[derive(Debug, Clone, Deserialize)]
    pub struct HistoryMessage {
        pub message: MessageRef,
    }

    /// Label change inside a history entry
    #[derive(Debug, Clone, Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub struct HistoryLabelChange {
        pub message: MessageRef,
        pub label_ids: Option<Vec<String>>,
    }

    /// Response from listing labels
    #[derive(Debug, Clone, Default, Deserialize)]
    pub struct ListLabelsResponse {
        pub labels: Option<Vec<GmailLabel>>,
    }

    /// Label resource
    #[derive(Debug, Clone, Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub struct GmailLabel {
        pub id: String,
        pub name: String,
        #[serde(rename = "type")]
        pub label_type: Option<String>,
    }

    /// Token endpoint response
    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct TokenGrant {
        pub access_token: String,
        pub refresh_token: Option<String>,
        /// Lifetime in seconds
        pub expires_in: Option<u64>,
    }
}
