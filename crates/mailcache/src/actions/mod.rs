//! Email actions module
//!
//! Provides high-level action handlers for common email operations
//! like archive, star, and read/unread status changes.

mod handler;

pub use handler::ActionHandler;
