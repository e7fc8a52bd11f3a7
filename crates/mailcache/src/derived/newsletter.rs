//! Newsletter sender detection
//!
//! Runs periodically over recent mail rather than per message: whether a
//! sender is a newsletter depends on aggregate behaviour.

use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use rusqlite::{Connection, params};

use crate::config::EngineConfig;
use crate::models::AccountId;
use crate::storage::{SqliteMailStore, to_millis};

/// Thresholds for the detection pass
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NewsletterPolicy {
    /// Only mail received in the last `window_days` is considered
    pub window_days: i64,
    /// A sender needs at least this many emails in the window
    pub min_messages: u32,
    /// Fraction of those emails that must carry list signals
    pub bulk_ratio: f64,
}

impl From<&EngineConfig> for NewsletterPolicy {
    fn from(config: &EngineConfig) -> Self {
        Self {
            window_days: config.newsletter_window_days,
            min_messages: config.newsletter_min_messages,
            bulk_ratio: config.newsletter_bulk_ratio,
        }
    }
}

struct Candidate {
    sender_email: String,
    display_name: Option<String>,
    total: u32,
    with_signals: u32,
    last_seen_at: i64,
}

/// Scan one account and rebuild its newsletter rows
///
/// Qualifying senders are upserted. Senders that no longer qualify are
/// dropped, except muted or dismissed ones: those keep their row with a
/// zero count so the user's choice survives. Returns the number of
/// senders that qualified.
pub fn detect_newsletters(
    store: &SqliteMailStore,
    account_id: AccountId,
    now: DateTime<Utc>,
    policy: &NewsletterPolicy,
) -> Result<usize> {
    let since = Duration::try_days(policy.window_days.max(0))
        .and_then(|window| now.checked_sub_signed(window))
        .unwrap_or(DateTime::<Utc>::MIN_UTC);
    let mut conn = store.lock()?;
    let tx = conn.transaction()?;

    tx.execute(
        "UPDATE newsletter_senders SET email_count = 0 WHERE account_id = ?",
        [account_id],
    )?;

    let candidates = {
        let mut stmt = tx.prepare(
            "SELECT from_email, MAX(from_name), COUNT(*),
                    SUM(CASE WHEN has_list_unsubscribe = 1 OR is_bulk = 1 THEN 1 ELSE 0 END),
                    MAX(received_at)
             FROM emails
             WHERE account_id = ? AND received_at >= ?
             GROUP BY from_email
             HAVING COUNT(*) >= ?",
        )?;
        stmt.query_map(
            params![account_id, to_millis(since), policy.min_messages],
            |row| {
                Ok(Candidate {
                    sender_email: row.get(0)?,
                    display_name: row.get(1)?,
                    total: row.get(2)?,
                    with_signals: row.get(3)?,
                    last_seen_at: row.get(4)?,
                })
            },
        )?
        .collect::<Result<Vec<_>, _>>()?
    };

    let mut detected = 0;
    for candidate in candidates {
        if candidate.total == 0
            || f64::from(candidate.with_signals) / f64::from(candidate.total) < policy.bulk_ratio
        {
            continue;
        }

        tx.execute(
            "INSERT INTO newsletter_senders
                (account_id, sender_email, display_name, email_count, last_seen_at)
             VALUES (?, ?, ?, ?, ?)
             ON CONFLICT(account_id, sender_email) DO UPDATE SET
                display_name = COALESCE(excluded.display_name, display_name),
                email_count = excluded.email_count,
                last_seen_at = excluded.last_seen_at",
            params![
                account_id,
                candidate.sender_email,
                candidate.display_name,
                candidate.total,
                candidate.last_seen_at
            ],
        )?;
        detected += 1;
    }

    let dropped = prune_unqualified(&tx, account_id, None)?;
    tx.commit()?;
    log::debug!(
        "[DERIVED] Newsletter pass for account {} (since {}): {} senders, {} dropped",
        account_id,
        since.format("%Y-%m-%d"),
        detected,
        dropped
    );
    Ok(detected)
}

/// Shrink a sender's row after some of their mail was deleted
///
/// The count is capped at the mail that is left; the next detection pass
/// restores the windowed figure.
pub(crate) fn on_sender_mail_removed(
    conn: &Connection,
    account_id: AccountId,
    sender_email: &str,
) -> Result<()> {
    conn.execute(
        "UPDATE newsletter_senders SET
            email_count = MIN(email_count,
                (SELECT COUNT(*) FROM emails WHERE account_id = ?1 AND from_email = ?2)),
            last_seen_at = COALESCE(
                (SELECT MAX(received_at) FROM emails WHERE account_id = ?1 AND from_email = ?2),
                last_seen_at)
         WHERE account_id = ?1 AND sender_email = ?2",
        params![account_id, sender_email],
    )?;
    prune_unqualified(conn, account_id, Some(sender_email))?;
    Ok(())
}

/// Delete zero-count rows the user never acted on
fn prune_unqualified(
    conn: &Connection,
    account_id: AccountId,
    sender_email: Option<&str>,
) -> Result<usize> {
    let removed = conn.execute(
        "DELETE FROM newsletter_senders
         WHERE account_id = ?1 AND (?2 IS NULL OR sender_email = ?2)
           AND email_count <= 0 AND is_muted = 0 AND is_dismissed = 0",
        params![account_id, sender_email],
    )?;
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ChangeEvent, RemoteEmail};

    fn email(id: &str, from: &str, bulk: bool, received_at: DateTime<Utc>) -> ChangeEvent {
        ChangeEvent::Added(
            RemoteEmail::builder(id, id)
                .from(crate::models::EmailAddress::with_name("Digest", from))
                .subject(format!("Issue {}", id))
                .received_at(received_at)
                .list_unsubscribe(bulk)
                .build(),
        )
    }

    fn policy() -> NewsletterPolicy {
        NewsletterPolicy {
            window_days: 90,
            min_messages: 3,
            bulk_ratio: 0.6,
        }
    }

    #[test]
    fn test_detects_bulk_sender() {
        let store = SqliteMailStore::open_in_memory().unwrap();
        let account = store.create_account("me@example.com", None).unwrap();
        let now = Utc::now();
        let changes = vec![
            email("n1", "news@letter.com", true, now),
            email("n2", "news@letter.com", true, now),
            email("n3", "news@letter.com", false, now),
            // Only two emails: below min_messages
            email("p1", "friend@example.com", true, now),
            email("p2", "friend@example.com", true, now),
            // Enough emails but no list signals
            email("w1", "boss@work.com", false, now),
            email("w2", "boss@work.com", false, now),
            email("w3", "boss@work.com", false, now),
        ];
        store.apply_changes(account.id, &changes, "1").unwrap();

        let found = detect_newsletters(&store, account.id, now, &policy()).unwrap();
        assert_eq!(found, 1);

        let senders = store.list_newsletter_senders(account.id).unwrap();
        assert_eq!(senders.len(), 1);
        assert_eq!(senders[0].sender_email, "news@letter.com");
        assert_eq!(senders[0].email_count, 3);
    }

    #[test]
    fn test_window_excludes_old_mail() {
        let store = SqliteMailStore::open_in_memory().unwrap();
        let account = store.create_account("me@example.com", None).unwrap();
        let now = Utc::now();
        let old = now - Duration::days(200);
        let changes = vec![
            email("n1", "news@letter.com", true, old),
            email("n2", "news@letter.com", true, old),
            email("n3", "news@letter.com", true, now),
        ];
        store.apply_changes(account.id, &changes, "1").unwrap();

        assert_eq!(detect_newsletters(&store, account.id, now, &policy()).unwrap(), 0);
    }

    #[test]
    fn test_preserves_mute_and_dismiss() {
        let store = SqliteMailStore::open_in_memory().unwrap();
        let account = store.create_account("me@example.com", None).unwrap();
        let now = Utc::now();
        let changes: Vec<_> = (0..3)
            .map(|i| email(&format!("n{}", i), "news@letter.com", true, now))
            .collect();
        store.apply_changes(account.id, &changes, "1").unwrap();

        detect_newsletters(&store, account.id, now, &policy()).unwrap();
        store.mute_newsletter(account.id, "news@letter.com").unwrap();
        detect_newsletters(&store, account.id, now, &policy()).unwrap();
        assert!(store.list_newsletter_senders(account.id).unwrap()[0].is_muted);

        store.remove_newsletter(account.id, "news@letter.com").unwrap();
        detect_newsletters(&store, account.id, now, &policy()).unwrap();
        assert!(store.list_newsletter_senders(account.id).unwrap().is_empty());
    }

    fn stored_rows(store: &SqliteMailStore, account_id: AccountId) -> Vec<(String, i64, bool)> {
        let conn = store.lock().unwrap();
        let mut stmt = conn
            .prepare(
                "SELECT sender_email, email_count, is_dismissed FROM newsletter_senders
                 WHERE account_id = ? ORDER BY sender_email",
            )
            .unwrap();
        stmt.query_map([account_id], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)))
            .unwrap()
            .collect::<Result<Vec<_>, _>>()
            .unwrap()
    }

    fn deleted(ids: &[&str]) -> Vec<ChangeEvent> {
        ids.iter().map(|id| ChangeEvent::Deleted(id.to_string())).collect()
    }

    #[test]
    fn test_deleted_mail_leaves_no_sender_row() {
        let store = SqliteMailStore::open_in_memory().unwrap();
        let account = store.create_account("me@example.com", None).unwrap();
        let now = Utc::now();
        let changes: Vec<_> = (0..3)
            .map(|i| email(&format!("n{}", i), "news@letter.com", true, now))
            .collect();
        store.apply_changes(account.id, &changes, "1").unwrap();
        assert_eq!(detect_newsletters(&store, account.id, now, &policy()).unwrap(), 1);

        store.apply_changes(account.id, &deleted(&["n0"]), "2").unwrap();
        assert_eq!(stored_rows(&store, account.id), vec![("news@letter.com".to_string(), 2, false)]);

        store.apply_changes(account.id, &deleted(&["n1", "n2"]), "3").unwrap();
        assert!(stored_rows(&store, account.id).is_empty());

        assert_eq!(detect_newsletters(&store, account.id, now, &policy()).unwrap(), 0);
        assert!(stored_rows(&store, account.id).is_empty());
    }

    #[test]
    fn test_rescan_drops_sender_that_stopped_qualifying() {
        let store = SqliteMailStore::open_in_memory().unwrap();
        let account = store.create_account("me@example.com", None).unwrap();
        let now = Utc::now();
        let changes: Vec<_> = (0..3)
            .map(|i| email(&format!("n{}", i), "news@letter.com", true, now))
            .collect();
        store.apply_changes(account.id, &changes, "1").unwrap();
        detect_newsletters(&store, account.id, now, &policy()).unwrap();

        // Same mail, but the window has moved past it
        let later = now + Duration::days(120);
        assert_eq!(detect_newsletters(&store, account.id, later, &policy()).unwrap(), 0);
        assert!(stored_rows(&store, account.id).is_empty());
    }

    #[test]
    fn test_dismissed_sender_kept_as_tombstone() {
        let store = SqliteMailStore::open_in_memory().unwrap();
        let account = store.create_account("me@example.com", None).unwrap();
        let now = Utc::now();
        let changes: Vec<_> = (0..3)
            .map(|i| email(&format!("n{}", i), "news@letter.com", true, now))
            .collect();
        store.apply_changes(account.id, &changes, "1").unwrap();
        detect_newsletters(&store, account.id, now, &policy()).unwrap();
        store.remove_newsletter(account.id, "news@letter.com").unwrap();

        store.apply_changes(account.id, &deleted(&["n0", "n1", "n2"]), "2").unwrap();
        detect_newsletters(&store, account.id, now, &policy()).unwrap();
        assert_eq!(stored_rows(&store, account.id), vec![("news@letter.com".to_string(), 0, true)]);

        // New mail brings the count back, still hidden
        let changes: Vec<_> = (3..6)
            .map(|i| email(&format!("n{}", i), "news@letter.com", true, now))
            .collect();
        store.apply_changes(account.id, &changes, "3").unwrap();
        detect_newsletters(&store, account.id, now, &policy()).unwrap();
        assert_eq!(stored_rows(&store, account.id), vec![("news@letter.com".to_string(), 3, true)]);
        assert!(store.list_newsletter_senders(account.id).unwrap().is_empty());
    }

    #[test]
    fn test_retention_shrinks_newsletter_count() {
        let store = SqliteMailStore::open_in_memory().unwrap();
        let account = store.create_account("me@example.com", None).unwrap();
        let now = Utc::now();
        let changes = vec![
            email("n1", "news@letter.com", true, now - Duration::days(60)),
            email("n2", "news@letter.com", true, now),
            email("n3", "news@letter.com", true, now),
        ];
        store.apply_changes(account.id, &changes, "1").unwrap();
        detect_newsletters(&store, account.id, now, &policy()).unwrap();

        assert_eq!(store.delete_emails_older_than(account.id, 30, now).unwrap(), 1);
        let senders = store.list_newsletter_senders(account.id).unwrap();
        assert_eq!(senders[0].email_count, 2);
    }

    #[test]
    fn test_oversized_window_covers_everything() {
        let store = SqliteMailStore::open_in_memory().unwrap();
        let account = store.create_account("me@example.com", None).unwrap();
        let now = Utc::now();
        let changes: Vec<_> = (0..3)
            .map(|i| email(&format!("n{}", i), "news@letter.com", true, now - Duration::days(i * 400)))
            .collect();
        store.apply_changes(account.id, &changes, "1").unwrap();

        let policy = NewsletterPolicy {
            window_days: i64::MAX,
            ..policy()
        };
        assert_eq!(detect_newsletters(&store, account.id, now, &policy).unwrap(), 1);
    }
}
