//! Read side of the derived indexes, plus newsletter user actions

use anyhow::Result;
use rusqlite::params;

use super::sqlite::{SqliteMailStore, from_millis};
use crate::models::{AccountId, NewsletterSender, SenderGroup, Topic};

impl SqliteMailStore {
    /// Sender groups, most recently active first
    pub fn list_sender_groups(&self, account_id: AccountId) -> Result<Vec<SenderGroup>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT account_id, sender_email, display_name, message_count, last_seen_at
             FROM sender_groups
             WHERE account_id = ?
             ORDER BY last_seen_at DESC, sender_email",
        )?;
        let groups = stmt
            .query_map([account_id], |row| {
                Ok(SenderGroup {
                    account_id: row.get(0)?,
                    sender_email: row.get(1)?,
                    display_name: row.get(2)?,
                    message_count: row.get::<_, i64>(3)?.max(0) as u64,
                    last_seen_at: from_millis(row.get(4)?),
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(groups)
    }

    /// Topics, most recently active first
    pub fn list_topics(&self, account_id: AccountId) -> Result<Vec<Topic>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT account_id, normalized_subject, display_subject, message_count, last_seen_at
             FROM topics
             WHERE account_id = ?
             ORDER BY last_seen_at DESC, normalized_subject",
        )?;
        let topics = stmt
            .query_map([account_id], |row| {
                Ok(Topic {
                    account_id: row.get(0)?,
                    normalized_subject: row.get(1)?,
                    display_subject: row.get(2)?,
                    message_count: row.get::<_, i64>(3)?.max(0) as u64,
                    last_seen_at: from_millis(row.get(4)?),
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(topics)
    }

    /// Detected newsletter senders with mail in the window, dismissed ones excluded
    pub fn list_newsletter_senders(&self, account_id: AccountId) -> Result<Vec<NewsletterSender>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT account_id, sender_email, display_name, email_count, is_muted, last_seen_at
             FROM newsletter_senders
             WHERE account_id = ? AND is_dismissed = 0 AND email_count > 0
             ORDER BY email_count DESC, sender_email",
        )?;
        let senders = stmt
            .query_map([account_id], |row| {
                Ok(NewsletterSender {
                    account_id: row.get(0)?,
                    sender_email: row.get(1)?,
                    display_name: row.get(2)?,
                    email_count: row.get::<_, i64>(3)?.max(0) as u64,
                    is_muted: row.get(4)?,
                    last_seen_at: from_millis(row.get(5)?),
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(senders)
    }

    pub fn mute_newsletter(&self, account_id: AccountId, sender_email: &str) -> Result<bool> {
        self.set_newsletter_column(account_id, sender_email, "is_muted", true)
    }

    pub fn unmute_newsletter(&self, account_id: AccountId, sender_email: &str) -> Result<bool> {
        self.set_newsletter_column(account_id, sender_email, "is_muted", false)
    }

    /// Hide a sender from the newsletter list; later scans keep it hidden
    pub fn remove_newsletter(&self, account_id: AccountId, sender_email: &str) -> Result<bool> {
        self.set_newsletter_column(account_id, sender_email, "is_dismissed", true)
    }

    fn set_newsletter_column(
        &self,
        account_id: AccountId,
        sender_email: &str,
        column: &str,
        value: bool,
    ) -> Result<bool> {
        let conn = self.lock()?;
        let updated = conn.execute(
            &format!(
                "UPDATE newsletter_senders SET {} = ? WHERE account_id = ? AND sender_email = ?",
                column
            ),
            params![value, account_id, sender_email.trim().to_lowercase()],
        )?;
        Ok(updated > 0)
    }
}
