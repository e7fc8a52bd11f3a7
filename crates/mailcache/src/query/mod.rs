//! Query API for UI consumption
//!
//! Read-only functions over the local cache. Nothing here talks to the
//! provider except `fetch_body`, which fills the cache on first access.

mod body;
mod emails;
mod parser;
mod search;

pub use body::fetch_body;
pub use emails::{EmailFilter, Page, TimeBucket, count_unread, get_email, list_emails};
pub use parser::{ParsedQuery, parse_query};
pub use search::search_emails;
