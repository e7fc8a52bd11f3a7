//! Action handler for email operations
//!
//! Mutations are local-first: the cache changes immediately and the edit is
//! queued as pending. The next sync cycle pushes it to the provider, and the
//! pending marker is cleared only once the provider reports the same state.

use anyhow::{Result, bail};
use log::info;
use std::sync::Arc;

use crate::events::{EventBus, MailEvent};
use crate::models::{AccountId, CategoryId, EmailId, labels};
use crate::storage::{LabelOp, PendingFlag, SqliteMailStore};

pub struct ActionHandler {
    store: Arc<SqliteMailStore>,
    events: Arc<EventBus>,
}

impl ActionHandler {
    pub fn new(store: Arc<SqliteMailStore>, events: Arc<EventBus>) -> Self {
        Self { store, events }
    }

    /// Mark an email read or unread
    pub fn mark_read(&self, email_id: EmailId, read: bool) -> Result<()> {
        self.set_flag(email_id, PendingFlag::Read, read)
    }

    /// Flip the starred flag; returns the new value
    pub fn toggle_star(&self, email_id: EmailId) -> Result<bool> {
        let Some(starred) = self.store.get_flag(email_id, PendingFlag::Starred)? else {
            bail!("Email {} not found", email_id.0);
        };
        self.set_flag(email_id, PendingFlag::Starred, !starred)?;
        Ok(!starred)
    }

    /// Move an email to trash; it stays cached until the provider deletes it
    pub fn trash(&self, email_id: EmailId) -> Result<()> {
        self.set_flag(email_id, PendingFlag::Trash, true)
    }

    pub fn untrash(&self, email_id: EmailId) -> Result<()> {
        self.set_flag(email_id, PendingFlag::Trash, false)
    }

    /// Trash several emails; unknown ids are skipped. Returns how many were
    /// trashed.
    pub fn batch_trash(&self, email_ids: &[EmailId]) -> Result<usize> {
        let mut accounts: Vec<AccountId> = Vec::new();
        let mut trashed = 0;
        for &email_id in email_ids {
            let Some((account_id, _)) = self.store.email_remote_ref(email_id)? else {
                continue;
            };
            if self.store.set_flag(email_id, PendingFlag::Trash, true)? {
                trashed += 1;
                if !accounts.contains(&account_id) {
                    accounts.push(account_id);
                }
            }
        }

        info!("Trashed {} of {} emails", trashed, email_ids.len());
        for account_id in accounts {
            self.events.emit(MailEvent::EmailsChanged { account_id });
        }
        Ok(trashed)
    }

    /// Archive: remove from the inbox
    pub fn archive(&self, email_id: EmailId) -> Result<()> {
        self.remove_label(email_id, labels::INBOX)
    }

    /// Add a label. Flag labels are routed to their flag.
    pub fn add_label(&self, email_id: EmailId, label: &str) -> Result<()> {
        match flag_for(label) {
            Some((flag, set_means)) => self.set_flag(email_id, flag, set_means),
            None => self.edit_label(email_id, label, LabelOp::Add),
        }
    }

    pub fn remove_label(&self, email_id: EmailId, label: &str) -> Result<()> {
        match flag_for(label) {
            Some((flag, set_means)) => self.set_flag(email_id, flag, !set_means),
            None => self.edit_label(email_id, label, LabelOp::Remove),
        }
    }

    /// Pin an email to a category of its own account
    pub fn set_category_override(&self, email_id: EmailId, category_id: CategoryId) -> Result<()> {
        let account_id = self.account_of(email_id)?;
        if !self.store.set_category_override(email_id, category_id)? {
            bail!(
                "Category {} does not belong to the account of email {}",
                category_id,
                email_id.0
            );
        }
        self.events.emit(MailEvent::EmailsChanged { account_id });
        Ok(())
    }

    pub fn clear_category_override(&self, email_id: EmailId) -> Result<()> {
        let account_id = self.account_of(email_id)?;
        self.store.clear_category_override(email_id)?;
        self.events.emit(MailEvent::EmailsChanged { account_id });
        Ok(())
    }

    fn set_flag(&self, email_id: EmailId, flag: PendingFlag, value: bool) -> Result<()> {
        let account_id = self.account_of(email_id)?;
        if !self.store.set_flag(email_id, flag, value)? {
            bail!("Email {} not found", email_id.0);
        }
        info!("Set {:?}={} on email {}", flag, value, email_id.0);
        self.events.emit(MailEvent::EmailsChanged { account_id });
        Ok(())
    }

    fn edit_label(&self, email_id: EmailId, label: &str, op: LabelOp) -> Result<()> {
        let account_id = self.account_of(email_id)?;
        if !self.store.edit_label(email_id, label, op)? {
            bail!("Email {} not found", email_id.0);
        }
        info!("{} label {} on email {}", op.as_str(), label, email_id.0);
        self.events.emit(MailEvent::EmailsChanged { account_id });
        Ok(())
    }

    fn account_of(&self, email_id: EmailId) -> Result<AccountId> {
        match self.store.email_remote_ref(email_id)? {
            Some((account_id, _)) => Ok(account_id),
            None => bail!("Email {} not found", email_id.0),
        }
    }
}

/// The flag a provider label stands for, and the flag value that adding the
/// label means
fn flag_for(label: &str) -> Option<(PendingFlag, bool)> {
    match label {
        labels::UNREAD => Some((PendingFlag::Read, false)),
        labels::STARRED => Some((PendingFlag::Starred, true)),
        labels::TRASH => Some((PendingFlag::Trash, true)),
        _ => None,
    }
}
