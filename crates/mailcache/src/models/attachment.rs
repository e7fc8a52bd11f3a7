//! Attachment metadata (bytes are fetched on demand, never cached here)

use serde::{Deserialize, Serialize};

use super::EmailId;

/// Attachment description as reported by the provider
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttachmentMeta {
    pub filename: String,
    pub mime_type: String,
    /// Size in bytes
    pub size: u64,
    /// Provider attachment id, used to fetch the bytes
    pub remote_attachment_id: String,
}

/// A stored attachment row
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    pub id: i64,
    pub email_id: EmailId,
    pub filename: String,
    pub mime_type: String,
    pub size: u64,
    pub remote_attachment_id: String,
}
