//! Change events produced by the delta fetcher

use serde::{Deserialize, Serialize};

use super::RemoteEmail;

/// One remote-side change to apply to the local store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ChangeEvent {
    /// A message the local store may not have seen yet
    Added(RemoteEmail),
    /// A known message whose labels or flags changed remotely
    Changed(RemoteEmail),
    /// A message removed from the remote mailbox, by provider id
    Deleted(String),
}

impl ChangeEvent {
    pub fn remote_id(&self) -> &str {
        match self {
            ChangeEvent::Added(email) | ChangeEvent::Changed(email) => &email.remote_id,
            ChangeEvent::Deleted(remote_id) => remote_id,
        }
    }
}
