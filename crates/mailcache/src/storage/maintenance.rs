//! Housekeeping: orphan cleanup, retention and vacuum
//!
//! With foreign keys enforced, cascades keep the tables consistent and the
//! orphan sweep should find nothing. It stays as a compensating control for
//! databases written with enforcement off.

use anyhow::{Result, bail};
use chrono::{DateTime, Duration, Utc};

use super::apply::delete_by_remote_id;
use super::sqlite::{SqliteMailStore, to_millis};
use crate::models::AccountId;

/// Rows removed by `delete_orphaned_records`, per table
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OrphanReport {
    pub emails: usize,
    pub recipients: usize,
    pub labels: usize,
    pub attachments: usize,
    pub label_ops: usize,
    pub sender_groups: usize,
    pub topics: usize,
    pub newsletter_senders: usize,
    pub categories: usize,
    pub rules: usize,
    pub scheduled_emails: usize,
    pub reminders: usize,
}

impl OrphanReport {
    pub fn total(&self) -> usize {
        self.emails
            + self.recipients
            + self.labels
            + self.attachments
            + self.label_ops
            + self.sender_groups
            + self.topics
            + self.newsletter_senders
            + self.categories
            + self.rules
            + self.scheduled_emails
            + self.reminders
    }
}

const NO_ACCOUNT: &str = "account_id NOT IN (SELECT id FROM accounts)";
const NO_EMAIL: &str = "email_id NOT IN (SELECT id FROM emails)";

impl SqliteMailStore {
    /// Remove rows whose owner no longer exists
    pub fn delete_orphaned_records(&self) -> Result<OrphanReport> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let sweep = |table: &str, predicate: &str| -> Result<usize> {
            Ok(tx.execute(&format!("DELETE FROM {} WHERE {}", table, predicate), [])?)
        };

        // Parents first so their children are caught in the same pass
        let mut report = OrphanReport {
            emails: sweep("emails", NO_ACCOUNT)?,
            categories: sweep("categories", NO_ACCOUNT)?,
            ..Default::default()
        };
        report.recipients = sweep("email_recipients", NO_EMAIL)?;
        report.labels = sweep("email_labels", NO_EMAIL)?;
        report.attachments = sweep("attachments", NO_EMAIL)?;
        report.label_ops = sweep("pending_label_ops", NO_EMAIL)?;
        report.sender_groups = sweep("sender_groups", NO_ACCOUNT)?;
        report.topics = sweep("topics", NO_ACCOUNT)?;
        report.newsletter_senders = sweep("newsletter_senders", NO_ACCOUNT)?;
        report.rules = sweep(
            "categorization_rules",
            "account_id NOT IN (SELECT id FROM accounts)
             OR category_id NOT IN (SELECT id FROM categories)",
        )?;
        report.scheduled_emails = sweep("scheduled_emails", NO_ACCOUNT)?;
        report.reminders = sweep("reminders", NO_ACCOUNT)?;

        tx.commit()?;
        if report.total() > 0 {
            log::warn!("[STORE] Removed {} orphaned rows: {:?}", report.total(), report);
        }
        Ok(report)
    }

    /// Delete an account's emails received more than `days` before `now`
    ///
    /// Derived indexes are decremented in the same transaction.
    pub fn delete_emails_older_than(
        &self,
        account_id: AccountId,
        days: i64,
        now: DateTime<Utc>,
    ) -> Result<usize> {
        if days < 0 {
            bail!("Retention period must not be negative (got {} days)", days);
        }
        // A period reaching past the earliest representable date keeps everything
        let cutoff = Duration::try_days(days)
            .and_then(|period| now.checked_sub_signed(period))
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;

        let remote_ids: Vec<String> = {
            let mut stmt =
                tx.prepare("SELECT remote_id FROM emails WHERE account_id = ? AND received_at < ?")?;
            stmt.query_map(rusqlite::params![account_id, to_millis(cutoff)], |row| row.get(0))?
                .collect::<Result<Vec<_>, _>>()?
        };

        let mut deleted = 0;
        for remote_id in &remote_ids {
            if delete_by_remote_id(&tx, account_id, remote_id)? {
                deleted += 1;
            }
        }

        tx.commit()?;
        log::info!(
            "[STORE] Retention removed {} emails older than {} days for account {}",
            deleted,
            days,
            account_id
        );
        Ok(deleted)
    }

    /// Reclaim free pages
    pub fn vacuum(&self) -> Result<()> {
        let conn = self.lock()?;
        conn.execute_batch("VACUUM;")?;
        Ok(())
    }
}
