//! Local edits awaiting provider confirmation
//!
//! A user mutation is written to the email row immediately and recorded in
//! the matching `pending_*` column (or `pending_label_ops`). The sync cycle
//! pushes pending edits first; apply keeps the local value until the
//! provider reports the same state.

use anyhow::{Result, bail};
use rusqlite::{Connection, OptionalExtension, params};

use super::categories::recategorize_email;
use super::emails::load_labels;
use super::sqlite::SqliteMailStore;
use crate::models::{AccountId, EmailId, is_flag_label};

/// A boolean email state mirrored by a provider flag label
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PendingFlag {
    Read,
    Starred,
    Trash,
}

impl PendingFlag {
    fn columns(&self) -> (&'static str, &'static str) {
        match self {
            PendingFlag::Read => ("is_read", "pending_read"),
            PendingFlag::Starred => ("is_starred", "pending_starred"),
            PendingFlag::Trash => ("is_trashed", "pending_trash"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LabelOp {
    Add,
    Remove,
}

impl LabelOp {
    pub fn as_str(&self) -> &'static str {
        match self {
            LabelOp::Add => "add",
            LabelOp::Remove => "remove",
        }
    }
}

/// Everything pending for one email, ready to push
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingMutation {
    pub email_id: EmailId,
    pub remote_id: String,
    pub read: Option<bool>,
    pub starred: Option<bool>,
    pub trash: Option<bool>,
    pub add_labels: Vec<String>,
    pub remove_labels: Vec<String>,
}

impl PendingMutation {
    pub fn is_empty(&self) -> bool {
        self.read.is_none()
            && self.starred.is_none()
            && self.trash.is_none()
            && self.add_labels.is_empty()
            && self.remove_labels.is_empty()
    }
}

impl SqliteMailStore {
    /// Set a flag locally and queue it for the provider
    ///
    /// Returns `false` if the email does not exist.
    pub fn set_flag(&self, email_id: EmailId, flag: PendingFlag, value: bool) -> Result<bool> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let (column, pending) = flag.columns();
        let updated = tx.execute(
            &format!("UPDATE emails SET {column} = ?1, {pending} = ?1 WHERE id = ?2"),
            params![value, email_id.0],
        )?;
        if updated == 0 {
            return Ok(false);
        }
        recategorize_email(&tx, email_id)?;
        tx.commit()?;
        Ok(true)
    }

    /// Current value of a flag, `None` if the email does not exist
    pub fn get_flag(&self, email_id: EmailId, flag: PendingFlag) -> Result<Option<bool>> {
        let conn = self.lock()?;
        let (column, _) = flag.columns();
        let value = conn
            .query_row(
                &format!("SELECT {column} FROM emails WHERE id = ?"),
                [email_id.0],
                |row| row.get(0),
            )
            .optional()?;
        Ok(value)
    }

    /// Add or remove a non-flag label locally and queue the edit
    ///
    /// Flag labels (UNREAD, STARRED, TRASH) go through `set_flag`.
    pub fn edit_label(&self, email_id: EmailId, label: &str, op: LabelOp) -> Result<bool> {
        if is_flag_label(label) {
            bail!("{} is a flag label; use the flag mutation instead", label);
        }
        if label.trim().is_empty() {
            bail!("Label id must not be empty");
        }

        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        if !email_exists(&tx, email_id)? {
            return Ok(false);
        }

        match op {
            LabelOp::Add => tx.execute(
                "INSERT OR IGNORE INTO email_labels (email_id, label_id) VALUES (?, ?)",
                params![email_id.0, label],
            )?,
            LabelOp::Remove => tx.execute(
                "DELETE FROM email_labels WHERE email_id = ? AND label_id = ?",
                params![email_id.0, label],
            )?,
        };
        tx.execute(
            "INSERT INTO pending_label_ops (email_id, label_id, op) VALUES (?, ?, ?)
             ON CONFLICT(email_id, label_id) DO UPDATE SET op = excluded.op",
            params![email_id.0, label, op.as_str()],
        )?;

        recategorize_email(&tx, email_id)?;
        tx.commit()?;
        Ok(true)
    }

    /// Labels currently stored for an email
    pub fn get_labels(&self, email_id: EmailId) -> Result<Vec<String>> {
        let conn = self.lock()?;
        load_labels(&conn, email_id)
    }

    /// All emails of an account with unpushed local edits
    pub fn list_pending_mutations(&self, account_id: AccountId) -> Result<Vec<PendingMutation>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT e.id, e.remote_id, e.pending_read, e.pending_starred, e.pending_trash
             FROM emails e
             WHERE e.account_id = ?
               AND (e.pending_read IS NOT NULL
                    OR e.pending_starred IS NOT NULL
                    OR e.pending_trash IS NOT NULL
                    OR EXISTS (SELECT 1 FROM pending_label_ops p WHERE p.email_id = e.id))
             ORDER BY e.id",
        )?;
        let mut mutations = stmt
            .query_map([account_id], |row| {
                Ok(PendingMutation {
                    email_id: EmailId(row.get(0)?),
                    remote_id: row.get(1)?,
                    read: row.get(2)?,
                    starred: row.get(3)?,
                    trash: row.get(4)?,
                    add_labels: Vec::new(),
                    remove_labels: Vec::new(),
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;

        let mut ops_stmt = conn.prepare_cached(
            "SELECT label_id, op FROM pending_label_ops WHERE email_id = ? ORDER BY label_id",
        )?;
        for mutation in &mut mutations {
            let ops = ops_stmt
                .query_map([mutation.email_id.0], |row| {
                    Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
                })?
                .collect::<Result<Vec<_>, _>>()?;
            for (label, op) in ops {
                if op == LabelOp::Add.as_str() {
                    mutation.add_labels.push(label);
                } else {
                    mutation.remove_labels.push(label);
                }
            }
        }

        Ok(mutations)
    }

    /// Drop a pending flag, but only if it still holds `expected`
    ///
    /// A newer local edit made while the push was in flight is kept.
    pub fn clear_pending_flag(
        &self,
        email_id: EmailId,
        flag: PendingFlag,
        expected: bool,
    ) -> Result<bool> {
        let conn = self.lock()?;
        let (_, pending) = flag.columns();
        let cleared = conn.execute(
            &format!("UPDATE emails SET {pending} = NULL WHERE id = ? AND {pending} = ?"),
            params![email_id.0, expected],
        )?;
        Ok(cleared > 0)
    }

    /// Drop a pending label op if it is still the same op
    pub fn clear_pending_label_op(&self, email_id: EmailId, label: &str, op: LabelOp) -> Result<bool> {
        let conn = self.lock()?;
        let cleared = conn.execute(
            "DELETE FROM pending_label_ops WHERE email_id = ? AND label_id = ? AND op = ?",
            params![email_id.0, label, op.as_str()],
        )?;
        Ok(cleared > 0)
    }
}

fn email_exists(conn: &Connection, email_id: EmailId) -> Result<bool> {
    let found: Option<i64> = conn
        .query_row("SELECT 1 FROM emails WHERE id = ?", [email_id.0], |row| row.get(0))
        .optional()?;
    Ok(found.is_some())
}
