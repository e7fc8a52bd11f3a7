//! Durable local cache
//!
//! A single SQLite database holds accounts, emails, derived indexes and due
//! items. `SqliteMailStore` is split across files by concern; every method
//! takes the connection lock, so writes are serialized.

mod aggregates;
mod apply;
mod categories;
mod due;
mod emails;
mod maintenance;
mod pending;
mod schema;
mod sqlite;

pub use apply::AppliedSummary;
pub use maintenance::OrphanReport;
pub use pending::{LabelOp, PendingFlag, PendingMutation};
pub use sqlite::SqliteMailStore;

pub(crate) use emails::{EMAIL_COLUMNS, email_from_row, load_email_children};
pub(crate) use sqlite::{from_millis, to_millis};
