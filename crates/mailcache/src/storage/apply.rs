//! Atomic application of a sync batch
//!
//! Everything a sync cycle writes happens in one transaction: email upserts
//! and deletes, child rows, categorization, derived indexes and the cursor
//! advance. If any step fails the transaction is dropped, the old cursor
//! stays in place and the next cycle re-fetches the same range.

use std::collections::{BTreeSet, HashSet};

use anyhow::{Result, anyhow, bail};
use chrono::Utc;
use rusqlite::{Connection, OptionalExtension, params};

use super::emails::{load_labels, load_recipients, replace_children, write_body};
use super::sqlite::{SqliteMailStore, from_millis, to_millis};
use crate::categorize::{self, EmailAttributes};
use crate::derived::{self, DerivedKey};
use crate::models::{
    AccountId, CategorizationRule, ChangeEvent, EmailId, RemoteEmail, labels,
};

/// Counts of what a batch did, for logging and tests
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AppliedSummary {
    pub added: usize,
    pub updated: usize,
    pub deleted: usize,
    /// Events that matched the stored row exactly
    pub unchanged: usize,
}

impl AppliedSummary {
    /// Whether any row was written
    pub fn has_changes(&self) -> bool {
        self.added + self.updated + self.deleted > 0
    }
}

enum Upserted {
    Inserted,
    Updated,
    Unchanged,
}

/// Stored state of an email that a provider update is reconciled against
struct ExistingRow {
    id: EmailId,
    key: DerivedKey,
    thread_id: String,
    subject: String,
    snippet: String,
    received_at: i64,
    is_read: bool,
    is_starred: bool,
    is_trashed: bool,
    has_list_unsubscribe: bool,
    is_bulk: bool,
    attachment_count: usize,
    pending_read: Option<bool>,
    pending_starred: Option<bool>,
    pending_trash: Option<bool>,
    category_override: bool,
}

/// A provider flag reconciled with a pending local edit
///
/// A pending value wins until the provider reports the same value, which
/// confirms the edit and clears it.
fn resolve_flag(remote: bool, pending: Option<bool>) -> (bool, Option<bool>) {
    match pending {
        Some(local) if local == remote => (remote, None),
        Some(local) => (local, Some(local)),
        None => (remote, None),
    }
}

impl SqliteMailStore {
    /// Apply an incremental batch and advance the cursor
    pub fn apply_changes(
        &self,
        account_id: AccountId,
        changes: &[ChangeEvent],
        new_cursor: &str,
    ) -> Result<AppliedSummary> {
        self.apply_batch(account_id, changes, new_cursor, false, false)
    }

    /// Apply a full listing; with `prune_unlisted`, local emails the listing
    /// did not mention are deleted
    ///
    /// Only prune when the listing was complete (not truncated by the cap),
    /// otherwise older mail beyond the cap would be dropped.
    pub fn apply_full_listing(
        &self,
        account_id: AccountId,
        changes: &[ChangeEvent],
        new_cursor: &str,
        prune_unlisted: bool,
    ) -> Result<AppliedSummary> {
        self.apply_batch(account_id, changes, new_cursor, prune_unlisted, false)
    }

    /// Run a batch to the point of commit, then abort
    ///
    /// Simulates a crash mid-cycle; nothing from the batch is persisted.
    #[doc(hidden)]
    pub fn apply_changes_with_fault(
        &self,
        account_id: AccountId,
        changes: &[ChangeEvent],
        new_cursor: &str,
    ) -> Result<AppliedSummary> {
        self.apply_batch(account_id, changes, new_cursor, false, true)
    }

    fn apply_batch(
        &self,
        account_id: AccountId,
        changes: &[ChangeEvent],
        new_cursor: &str,
        prune_unlisted: bool,
        fail_before_commit: bool,
    ) -> Result<AppliedSummary> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;

        // A broken rule table must not block ingest
        let rules = categorize::load_rules(&tx, account_id).unwrap_or_else(|e| {
            log::warn!("[STORE] Failed to load rules for account {}: {:#}", account_id, e);
            Vec::new()
        });

        let mut summary = AppliedSummary::default();
        for change in changes {
            match change {
                ChangeEvent::Added(remote) | ChangeEvent::Changed(remote) => {
                    match upsert_remote(&tx, account_id, remote, &rules)? {
                        Upserted::Inserted => summary.added += 1,
                        Upserted::Updated => summary.updated += 1,
                        Upserted::Unchanged => summary.unchanged += 1,
                    }
                }
                ChangeEvent::Deleted(remote_id) => {
                    if delete_by_remote_id(&tx, account_id, remote_id)? {
                        summary.deleted += 1;
                    }
                }
            }
        }

        if prune_unlisted {
            summary.deleted += prune_unlisted_emails(&tx, account_id, changes)?;
        }

        let advanced = tx.execute(
            "UPDATE accounts SET sync_cursor = ?, last_sync_at = ?,
                last_error = NULL, last_error_at = NULL
             WHERE id = ?",
            params![new_cursor, to_millis(Utc::now()), account_id],
        )?;
        if advanced == 0 {
            bail!("Account {} no longer exists", account_id);
        }

        if fail_before_commit {
            return Err(anyhow!("Injected fault before commit"));
        }

        tx.commit()?;
        log::debug!(
            "[STORE] Applied batch for account {}: {:?}",
            account_id,
            summary
        );
        Ok(summary)
    }
}

fn load_existing(
    conn: &Connection,
    account_id: AccountId,
    remote_id: &str,
) -> Result<Option<ExistingRow>> {
    let row = conn
        .query_row(
            "SELECT e.id, e.from_email, e.from_name, e.thread_id, e.subject, e.snippet,
                    e.received_at, e.is_read, e.is_starred, e.is_trashed,
                    e.has_list_unsubscribe, e.is_bulk,
                    (SELECT COUNT(*) FROM attachments a WHERE a.email_id = e.id),
                    e.pending_read, e.pending_starred, e.pending_trash, e.category_override
             FROM emails e WHERE e.account_id = ? AND e.remote_id = ?",
            params![account_id, remote_id],
            |row| {
                let from_email: String = row.get(1)?;
                let from_name: Option<String> = row.get(2)?;
                let subject: String = row.get(4)?;
                let received_at: i64 = row.get(6)?;
                Ok(ExistingRow {
                    id: EmailId(row.get(0)?),
                    key: DerivedKey::new(&from_email, from_name, &subject, from_millis(received_at)),
                    thread_id: row.get(3)?,
                    subject,
                    snippet: row.get(5)?,
                    received_at,
                    is_read: row.get(7)?,
                    is_starred: row.get(8)?,
                    is_trashed: row.get(9)?,
                    has_list_unsubscribe: row.get(10)?,
                    is_bulk: row.get(11)?,
                    attachment_count: row.get::<_, i64>(12)? as usize,
                    pending_read: row.get(13)?,
                    pending_starred: row.get(14)?,
                    pending_trash: row.get(15)?,
                    category_override: row.get(16)?,
                })
            },
        )
        .optional()?;
    Ok(row)
}

/// Provider labels with pending local label edits applied on top
///
/// Ops the provider already reflects are confirmed and removed.
fn reconcile_labels(conn: &Connection, email_id: EmailId, remote: &RemoteEmail) -> Result<Vec<String>> {
    let mut labels: BTreeSet<String> = remote.plain_labels().into_iter().collect();

    let ops = {
        let mut stmt =
            conn.prepare_cached("SELECT label_id, op FROM pending_label_ops WHERE email_id = ?")?;
        stmt.query_map([email_id.0], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?
        .collect::<Result<Vec<_>, _>>()?
    };

    for (label, op) in ops {
        let on_remote = remote.has_label(&label);
        let confirmed = match op.as_str() {
            "add" => on_remote,
            _ => !on_remote,
        };
        if confirmed {
            conn.execute(
                "DELETE FROM pending_label_ops WHERE email_id = ? AND label_id = ?",
                params![email_id.0, label],
            )?;
        } else if op == "add" {
            labels.insert(label);
        } else {
            labels.remove(&label);
        }
    }

    Ok(labels.into_iter().collect())
}

fn upsert_remote(
    conn: &Connection,
    account_id: AccountId,
    remote: &RemoteEmail,
    rules: &[CategorizationRule],
) -> Result<Upserted> {
    let existing = load_existing(conn, account_id, &remote.remote_id)?;

    let pending = existing
        .as_ref()
        .map(|e| (e.pending_read, e.pending_starred, e.pending_trash))
        .unwrap_or_default();
    let (is_read, pending_read) = resolve_flag(remote.is_read(), pending.0);
    let (is_starred, pending_starred) = resolve_flag(remote.is_starred(), pending.1);
    let (is_trashed, pending_trash) = resolve_flag(remote.is_trashed(), pending.2);

    let labels = match &existing {
        Some(row) => reconcile_labels(conn, row.id, remote)?,
        None => remote.plain_labels(),
    };

    let key = DerivedKey::new(
        &remote.from.email,
        remote.from.name.clone(),
        &remote.subject,
        remote.received_at,
    );
    let received_at = to_millis(remote.received_at);

    if let Some(row) = &existing {
        let unchanged = row.key.sender_email == key.sender_email
            && row.key.sender_name == key.sender_name
            && row.thread_id == remote.thread_id
            && row.subject == remote.subject
            && row.snippet == remote.snippet
            && row.received_at == received_at
            && row.is_read == is_read
            && row.is_starred == is_starred
            && row.is_trashed == is_trashed
            && row.pending_read == pending_read
            && row.pending_starred == pending_starred
            && row.pending_trash == pending_trash
            && row.has_list_unsubscribe == remote.has_list_unsubscribe
            && row.is_bulk == remote.is_bulk
            && row.attachment_count == remote.attachments.len()
            && load_labels(conn, row.id)? == labels
            && load_recipients(conn, row.id, "to")? == remote.to
            && load_recipients(conn, row.id, "cc")? == remote.cc;
        if unchanged && remote.body.is_none() {
            return Ok(Upserted::Unchanged);
        }
    }

    // Local-only columns (body, category override) are left alone on conflict
    conn.execute(
        "INSERT INTO emails
            (account_id, remote_id, thread_id, from_name, from_email, subject,
             normalized_subject, snippet, received_at, is_read, is_starred, is_trashed,
             has_attachments, has_list_unsubscribe, is_bulk,
             pending_read, pending_starred, pending_trash)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
         ON CONFLICT(account_id, remote_id) DO UPDATE SET
            thread_id = excluded.thread_id,
            from_name = excluded.from_name,
            from_email = excluded.from_email,
            subject = excluded.subject,
            normalized_subject = excluded.normalized_subject,
            snippet = excluded.snippet,
            received_at = excluded.received_at,
            is_read = excluded.is_read,
            is_starred = excluded.is_starred,
            is_trashed = excluded.is_trashed,
            has_attachments = excluded.has_attachments,
            has_list_unsubscribe = excluded.has_list_unsubscribe,
            is_bulk = excluded.is_bulk,
            pending_read = excluded.pending_read,
            pending_starred = excluded.pending_starred,
            pending_trash = excluded.pending_trash",
        params![
            account_id,
            remote.remote_id,
            remote.thread_id,
            remote.from.name,
            key.sender_email,
            remote.subject,
            key.normalized_subject,
            remote.snippet,
            received_at,
            is_read,
            is_starred,
            is_trashed,
            !remote.attachments.is_empty(),
            remote.has_list_unsubscribe,
            remote.is_bulk,
            pending_read,
            pending_starred,
            pending_trash,
        ],
    )?;

    let email_id = match &existing {
        Some(row) => row.id,
        None => EmailId(conn.query_row(
            "SELECT id FROM emails WHERE account_id = ? AND remote_id = ?",
            params![account_id, remote.remote_id],
            |row| row.get(0),
        )?),
    };

    replace_children(conn, email_id, remote, &labels)?;

    if let Some(body) = &remote.body {
        write_body(conn, email_id, body)?;
    }

    let category_override = existing.as_ref().is_some_and(|row| row.category_override);
    if !category_override {
        let mut effective = labels.clone();
        if !is_read {
            effective.push(labels::UNREAD.to_string());
        }
        if is_starred {
            effective.push(labels::STARRED.to_string());
        }
        if is_trashed {
            effective.push(labels::TRASH.to_string());
        }
        let category = categorize::categorize(
            &EmailAttributes {
                sender_email: &key.sender_email,
                subject: &remote.subject,
                labels: &effective,
            },
            rules,
        );
        conn.execute(
            "UPDATE emails SET category_id = ? WHERE id = ?",
            params![category, email_id.0],
        )?;
    }

    derived::on_ingest(conn, account_id, existing.as_ref().map(|row| &row.key), &key)?;

    Ok(if existing.is_some() {
        Upserted::Updated
    } else {
        Upserted::Inserted
    })
}

/// Hard-delete one email and decrement its derived aggregates
pub(crate) fn delete_by_remote_id(
    conn: &Connection,
    account_id: AccountId,
    remote_id: &str,
) -> Result<bool> {
    let row: Option<(i64, String, Option<String>, String, i64)> = conn
        .query_row(
            "SELECT id, from_email, from_name, subject, received_at
             FROM emails WHERE account_id = ? AND remote_id = ?",
            params![account_id, remote_id],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?)),
        )
        .optional()?;

    let Some((id, from_email, from_name, subject, received_at)) = row else {
        return Ok(false);
    };

    conn.execute("DELETE FROM emails WHERE id = ?", [id])?;
    let key = DerivedKey::new(&from_email, from_name, &subject, from_millis(received_at));
    derived::on_delete(conn, account_id, &key)?;
    Ok(true)
}

fn prune_unlisted_emails(
    conn: &Connection,
    account_id: AccountId,
    changes: &[ChangeEvent],
) -> Result<usize> {
    let listed: HashSet<&str> = changes.iter().map(ChangeEvent::remote_id).collect();

    let known: Vec<String> = {
        let mut stmt = conn.prepare("SELECT remote_id FROM emails WHERE account_id = ?")?;
        stmt.query_map([account_id], |row| row.get(0))?
            .collect::<Result<Vec<_>, _>>()?
    };

    let mut pruned = 0;
    for remote_id in known.iter().filter(|id| !listed.contains(id.as_str())) {
        if delete_by_remote_id(conn, account_id, remote_id)? {
            pruned += 1;
        }
    }
    if pruned > 0 {
        log::info!(
            "[STORE] Full resync pruned {} emails for account {}",
            pruned,
            account_id
        );
    }
    Ok(pruned)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::EmailAddress;
    use chrono::{Duration, TimeZone};

    fn remote(id: &str, subject: &str, labels: &[&str]) -> RemoteEmail {
        RemoteEmail::builder(id, format!("thread-{}", id))
            .from(EmailAddress::with_name("Alice", "alice@example.com"))
            .to(vec![EmailAddress::new("me@example.com")])
            .subject(subject)
            .snippet("snippet")
            .received_at(Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap())
            .labels(labels)
            .build()
    }

    fn setup() -> (SqliteMailStore, AccountId) {
        let store = SqliteMailStore::open_in_memory().unwrap();
        let account = store.create_account("me@example.com", None).unwrap();
        (store, account.id)
    }

    #[test]
    fn test_resolve_flag() {
        assert_eq!(resolve_flag(true, None), (true, None));
        assert_eq!(resolve_flag(false, Some(true)), (true, Some(true)));
        assert_eq!(resolve_flag(true, Some(true)), (true, None));
    }

    #[test]
    fn test_idempotent_ingest() {
        let (store, account_id) = setup();
        let change = ChangeEvent::Added(remote("m1", "Hello", &["INBOX", "UNREAD"]));

        let first = store.apply_changes(account_id, &[change.clone()], "10").unwrap();
        let second = store.apply_changes(account_id, &[change], "11").unwrap();

        assert_eq!(first.added, 1);
        assert_eq!(second.added, 0);
        assert_eq!(second.unchanged, 1);
        assert_eq!(store.count_emails(account_id).unwrap(), 1);
        assert_eq!(store.list_sender_groups(account_id).unwrap()[0].message_count, 1);
        assert_eq!(store.get_sync_cursor(account_id).unwrap().as_deref(), Some("11"));
    }

    #[test]
    fn test_changed_updates_flags_and_labels() {
        let (store, account_id) = setup();
        store
            .apply_changes(account_id, &[ChangeEvent::Added(remote("m1", "Hi", &["INBOX", "UNREAD"]))], "1")
            .unwrap();
        let summary = store
            .apply_changes(
                account_id,
                &[ChangeEvent::Changed(remote("m1", "Hi", &["Label_9", "STARRED"]))],
                "2",
            )
            .unwrap();
        assert_eq!(summary.updated, 1);

        let id = store.find_email_id(account_id, "m1").unwrap().unwrap();
        let email = store.get_email(id).unwrap().unwrap();
        assert!(email.is_read);
        assert!(email.is_starred);
        assert_eq!(email.label_ids, vec!["Label_9"]);
    }

    #[test]
    fn test_delete_decrements_aggregates() {
        let (store, account_id) = setup();
        store
            .apply_changes(
                account_id,
                &[
                    ChangeEvent::Added(remote("m1", "Project X", &[])),
                    ChangeEvent::Added(remote("m2", "Re: Project X", &[])),
                ],
                "1",
            )
            .unwrap();
        assert_eq!(store.list_topics(account_id).unwrap()[0].message_count, 2);

        let summary = store
            .apply_changes(
                account_id,
                &[
                    ChangeEvent::Deleted("m1".into()),
                    ChangeEvent::Deleted("unknown".into()),
                ],
                "2",
            )
            .unwrap();
        assert_eq!(summary.deleted, 1);
        assert_eq!(store.list_topics(account_id).unwrap()[0].message_count, 1);

        store
            .apply_changes(account_id, &[ChangeEvent::Deleted("m2".into())], "3")
            .unwrap();
        assert!(store.list_topics(account_id).unwrap().is_empty());
        assert!(store.list_sender_groups(account_id).unwrap().is_empty());
    }

    #[test]
    fn test_sender_change_moves_aggregate() {
        let (store, account_id) = setup();
        store
            .apply_changes(account_id, &[ChangeEvent::Added(remote("m1", "Hi", &[]))], "1")
            .unwrap();

        let mut moved = remote("m1", "Hi", &[]);
        moved.from = EmailAddress::new("bob@example.com");
        store
            .apply_changes(account_id, &[ChangeEvent::Changed(moved)], "2")
            .unwrap();

        let groups = store.list_sender_groups(account_id).unwrap();
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].sender_email, "bob@example.com");
    }

    #[test]
    fn test_last_seen_recomputed_on_delete() {
        let (store, account_id) = setup();
        let base = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let mut older = remote("m1", "A", &[]);
        older.received_at = base;
        let mut newer = remote("m2", "B", &[]);
        newer.received_at = base + Duration::days(3);
        store
            .apply_changes(
                account_id,
                &[ChangeEvent::Added(older), ChangeEvent::Added(newer)],
                "1",
            )
            .unwrap();
        assert_eq!(
            store.list_sender_groups(account_id).unwrap()[0].last_seen_at,
            base + Duration::days(3)
        );

        store
            .apply_changes(account_id, &[ChangeEvent::Deleted("m2".into())], "2")
            .unwrap();
        assert_eq!(store.list_sender_groups(account_id).unwrap()[0].last_seen_at, base);
    }

    #[test]
    fn test_fault_leaves_old_cursor() {
        let (store, account_id) = setup();
        store
            .apply_changes(account_id, &[ChangeEvent::Added(remote("m1", "A", &[]))], "5")
            .unwrap();

        let batch = vec![
            ChangeEvent::Added(remote("m2", "B", &[])),
            ChangeEvent::Deleted("m1".into()),
        ];
        assert!(store.apply_changes_with_fault(account_id, &batch, "6").is_err());
        assert_eq!(store.get_sync_cursor(account_id).unwrap().as_deref(), Some("5"));
        assert_eq!(store.count_emails(account_id).unwrap(), 1);

        // Re-applying the same range lands exactly once
        store.apply_changes(account_id, &batch, "6").unwrap();
        store.apply_changes(account_id, &batch, "6").unwrap();
        assert_eq!(store.count_emails(account_id).unwrap(), 1);
        assert!(store.find_email_id(account_id, "m2").unwrap().is_some());
    }

    #[test]
    fn test_full_listing_prunes_only_when_complete() {
        let (store, account_id) = setup();
        store
            .apply_changes(
                account_id,
                &[
                    ChangeEvent::Added(remote("m1", "A", &[])),
                    ChangeEvent::Added(remote("m2", "B", &[])),
                ],
                "1",
            )
            .unwrap();

        let listing = vec![ChangeEvent::Added(remote("m2", "B", &[]))];
        store
            .apply_full_listing(account_id, &listing, "2", false)
            .unwrap();
        assert_eq!(store.count_emails(account_id).unwrap(), 2);

        let summary = store
            .apply_full_listing(account_id, &listing, "3", true)
            .unwrap();
        assert_eq!(summary.deleted, 1);
        assert_eq!(store.count_emails(account_id).unwrap(), 1);
    }

    #[test]
    fn test_unknown_account_rolls_back() {
        let (store, _) = setup();
        let result = store.apply_changes(42, &[], "1");
        assert!(result.is_err());
    }
}
