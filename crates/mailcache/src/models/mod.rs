//! Domain models for mail entities

mod account;
mod aggregates;
mod attachment;
mod category;
mod change;
mod due;
mod email;
mod label;

pub use account::{Account, AccountId, AuthState};
pub use aggregates::{NewsletterSender, SenderGroup, Topic};
pub use attachment::{Attachment, AttachmentMeta};
pub use category::{
    CategorizationRule, Category, CategoryId, NewRule, RuleError, RuleMatch,
};
pub use change::ChangeEvent;
pub use due::{DueStatus, NewScheduledEmail, Reminder, ScheduledEmail};
pub use email::{
    Email, EmailAddress, EmailBody, EmailId, RemoteEmail, RemoteEmailBuilder,
    parse_address_list,
};
pub use label::{Label, is_flag_label, labels};
