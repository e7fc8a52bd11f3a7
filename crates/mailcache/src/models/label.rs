//! Well-known provider label ids

/// Gmail system labels the engine interprets
pub mod labels {
    pub const INBOX: &str = "INBOX";
    pub const SENT: &str = "SENT";
    pub const DRAFT: &str = "DRAFT";
    pub const TRASH: &str = "TRASH";
    pub const SPAM: &str = "SPAM";
    pub const STARRED: &str = "STARRED";
    pub const IMPORTANT: &str = "IMPORTANT";
    pub const UNREAD: &str = "UNREAD";
}

/// A mail label (folder) as reported by the provider
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Label {
    /// Label ID (e.g., "INBOX", "SENT", "Label_123")
    pub id: String,
    /// Display name
    pub name: String,
    /// Whether this is a system label
    pub is_system: bool,
}

/// Flags that are carried as labels on the provider side.
///
/// These are stored in dedicated columns locally, so they are filtered out of
/// the label set before it is persisted.
pub fn is_flag_label(label: &str) -> bool {
    matches!(label, labels::UNREAD | labels::STARRED | labels::TRASH)
}
