//! Due items: scheduled emails and reminders
//!
//! Pollers claim an item with a conditional status flip before running its
//! side effect. Only the caller whose claim changed a row may fire it, so an
//! item fires at most once even with overlapping polls.

use anyhow::{Context, Result, bail};
use chrono::{DateTime, Utc};
use rusqlite::{OptionalExtension, params};

use super::sqlite::{SqliteMailStore, from_millis, to_millis};
use crate::models::{
    AccountId, DueStatus, EmailAddress, EmailId, NewScheduledEmail, Reminder, ScheduledEmail,
};

const SCHEDULED_SELECT: &str = "SELECT id, account_id, to_addrs, cc_addrs, subject, body, send_at,
        status, attempts, last_error, created_at
 FROM scheduled_emails";

const REMINDER_SELECT: &str = "SELECT id, account_id, email_id, note, remind_at, status, created_at
 FROM reminders";

fn scheduled_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<ScheduledEmail> {
    let to: String = row.get(2)?;
    let cc: String = row.get(3)?;
    let status: String = row.get(7)?;
    Ok(ScheduledEmail {
        id: row.get(0)?,
        account_id: row.get(1)?,
        to: decode_addresses(&to),
        cc: decode_addresses(&cc),
        subject: row.get(4)?,
        body: row.get(5)?,
        send_at: from_millis(row.get(6)?),
        status: DueStatus::parse(&status),
        attempts: row.get(8)?,
        last_error: row.get(9)?,
        created_at: from_millis(row.get(10)?),
    })
}

fn reminder_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Reminder> {
    let status: String = row.get(5)?;
    Ok(Reminder {
        id: row.get(0)?,
        account_id: row.get(1)?,
        email_id: row.get::<_, Option<i64>>(2)?.map(EmailId),
        note: row.get(3)?,
        remind_at: from_millis(row.get(4)?),
        status: DueStatus::parse(&status),
        created_at: from_millis(row.get(6)?),
    })
}

fn decode_addresses(json: &str) -> Vec<EmailAddress> {
    serde_json::from_str(json).unwrap_or_else(|e| {
        log::warn!("[DUE] Unreadable address list {:?}: {}", json, e);
        Vec::new()
    })
}

impl SqliteMailStore {
    // === Scheduled emails ===

    pub fn schedule_email(&self, email: &NewScheduledEmail) -> Result<ScheduledEmail> {
        if email.to.is_empty() {
            bail!("A scheduled email needs at least one recipient");
        }

        let to = serde_json::to_string(&email.to)?;
        let cc = serde_json::to_string(&email.cc)?;
        let now = Utc::now();

        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO scheduled_emails
                (account_id, to_addrs, cc_addrs, subject, body, send_at, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?)",
            params![
                email.account_id,
                to,
                cc,
                email.subject,
                email.body,
                to_millis(email.send_at),
                to_millis(now)
            ],
        )
        .context("Failed to schedule email")?;

        let id = conn.last_insert_rowid();
        conn.query_row(
            &format!("{} WHERE id = ?", SCHEDULED_SELECT),
            [id],
            scheduled_from_row,
        )
        .context("Scheduled email vanished after insert")
    }

    /// Cancel a scheduled email that has not started sending
    pub fn cancel_scheduled_email(&self, id: i64) -> Result<bool> {
        let conn = self.lock()?;
        let deleted = conn.execute(
            "DELETE FROM scheduled_emails WHERE id = ? AND status != 'processing'",
            [id],
        )?;
        Ok(deleted > 0)
    }

    pub fn get_scheduled_email(&self, id: i64) -> Result<Option<ScheduledEmail>> {
        let conn = self.lock()?;
        let email = conn
            .query_row(
                &format!("{} WHERE id = ?", SCHEDULED_SELECT),
                [id],
                scheduled_from_row,
            )
            .optional()?;
        Ok(email)
    }

    pub fn list_scheduled_emails(&self, account_id: AccountId) -> Result<Vec<ScheduledEmail>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(&format!(
            "{} WHERE account_id = ? ORDER BY send_at, id",
            SCHEDULED_SELECT
        ))?;
        let emails = stmt
            .query_map([account_id], scheduled_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(emails)
    }

    /// Pending scheduled emails whose send time has passed
    pub fn find_due_scheduled(&self, now: DateTime<Utc>) -> Result<Vec<ScheduledEmail>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(&format!(
            "{} WHERE status = 'pending' AND send_at <= ? ORDER BY send_at, id",
            SCHEDULED_SELECT
        ))?;
        let emails = stmt
            .query_map([to_millis(now)], scheduled_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(emails)
    }

    /// Atomically move a pending item to processing; `true` means the
    /// caller owns it
    pub fn claim_scheduled(&self, id: i64, now: DateTime<Utc>) -> Result<bool> {
        let conn = self.lock()?;
        let claimed = conn.execute(
            "UPDATE scheduled_emails SET status = 'processing', claimed_at = ?
             WHERE id = ? AND status = 'pending'",
            params![to_millis(now), id],
        )?;
        Ok(claimed == 1)
    }

    /// Sent: the row is done
    pub fn complete_scheduled(&self, id: i64) -> Result<()> {
        let conn = self.lock()?;
        conn.execute("DELETE FROM scheduled_emails WHERE id = ?", [id])?;
        Ok(())
    }

    /// Send failed: count the attempt and either retry later or give up
    pub fn release_scheduled(&self, id: i64, error: &str, max_attempts: u32) -> Result<DueStatus> {
        let conn = self.lock()?;
        let status: Option<String> = conn
            .query_row(
                "UPDATE scheduled_emails SET
                    attempts = attempts + 1,
                    last_error = ?1,
                    claimed_at = NULL,
                    status = CASE WHEN attempts + 1 >= ?2 THEN 'failed' ELSE 'pending' END
                 WHERE id = ?3 AND status = 'processing'
                 RETURNING status",
                params![error, max_attempts, id],
                |row| row.get(0),
            )
            .optional()?;
        status
            .map(|s| DueStatus::parse(&s))
            .with_context(|| format!("Scheduled email {} was not claimed", id))
    }

    /// Mark claims older than `older_than` as failed
    ///
    /// A crashed send may or may not have reached the provider, so these are
    /// never retried automatically.
    pub fn recover_stale_scheduled(&self, older_than: DateTime<Utc>) -> Result<usize> {
        let conn = self.lock()?;
        let recovered = conn.execute(
            "UPDATE scheduled_emails SET
                status = 'failed',
                last_error = 'Interrupted while sending',
                claimed_at = NULL
             WHERE status = 'processing' AND claimed_at < ?",
            [to_millis(older_than)],
        )?;
        if recovered > 0 {
            log::warn!("[DUE] Marked {} interrupted scheduled sends as failed", recovered);
        }
        Ok(recovered)
    }

    // === Reminders ===

    pub fn create_reminder(
        &self,
        account_id: AccountId,
        email_id: Option<EmailId>,
        note: &str,
        remind_at: DateTime<Utc>,
    ) -> Result<Reminder> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO reminders (account_id, email_id, note, remind_at, created_at)
             VALUES (?, ?, ?, ?, ?)",
            params![
                account_id,
                email_id.map(|id| id.0),
                note,
                to_millis(remind_at),
                to_millis(Utc::now())
            ],
        )
        .context("Failed to create reminder")?;

        let id = conn.last_insert_rowid();
        conn.query_row(
            &format!("{} WHERE id = ?", REMINDER_SELECT),
            [id],
            reminder_from_row,
        )
        .context("Reminder vanished after insert")
    }

    pub fn cancel_reminder(&self, id: i64) -> Result<bool> {
        let conn = self.lock()?;
        let deleted = conn.execute(
            "DELETE FROM reminders WHERE id = ? AND status = 'pending'",
            [id],
        )?;
        Ok(deleted > 0)
    }

    pub fn list_reminders(&self, account_id: AccountId) -> Result<Vec<Reminder>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(&format!(
            "{} WHERE account_id = ? ORDER BY remind_at, id",
            REMINDER_SELECT
        ))?;
        let reminders = stmt
            .query_map([account_id], reminder_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(reminders)
    }

    pub fn find_due_reminders(&self, now: DateTime<Utc>) -> Result<Vec<Reminder>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(&format!(
            "{} WHERE status = 'pending' AND remind_at <= ? ORDER BY remind_at, id",
            REMINDER_SELECT
        ))?;
        let reminders = stmt
            .query_map([to_millis(now)], reminder_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(reminders)
    }

    pub fn claim_reminder(&self, id: i64, now: DateTime<Utc>) -> Result<bool> {
        let conn = self.lock()?;
        let claimed = conn.execute(
            "UPDATE reminders SET status = 'processing', claimed_at = ?
             WHERE id = ? AND status = 'pending'",
            params![to_millis(now), id],
        )?;
        Ok(claimed == 1)
    }

    pub fn complete_reminder(&self, id: i64) -> Result<()> {
        let conn = self.lock()?;
        conn.execute("DELETE FROM reminders WHERE id = ?", [id])?;
        Ok(())
    }

    /// Remove reminders whose claim is older than `older_than`
    ///
    /// They are returned so the caller can surface them once more before
    /// they disappear.
    pub fn recover_stale_reminders(&self, older_than: DateTime<Utc>) -> Result<Vec<Reminder>> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let stale = {
            let mut stmt = tx.prepare(&format!(
                "{} WHERE status = 'processing' AND claimed_at < ? ORDER BY id",
                REMINDER_SELECT
            ))?;
            stmt.query_map([to_millis(older_than)], reminder_from_row)?
                .collect::<Result<Vec<_>, _>>()?
        };
        for reminder in &stale {
            tx.execute("DELETE FROM reminders WHERE id = ?", [reminder.id])?;
        }
        tx.commit()?;
        Ok(stale)
    }
}
