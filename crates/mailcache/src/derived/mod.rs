//! Incrementally maintained secondary indexes
//!
//! Sender groups and topics are updated inside the same transaction that
//! writes the email row, so an aggregate never disagrees with the rows it
//! counts. Callers must write (or delete) the email row *before* calling
//! into this module: `last_seen_at` is recomputed from the emails table.
//!
//! Newsletter detection is a separate periodic pass, see [`newsletter`];
//! deletions still shrink its rows right away.

pub mod newsletter;

use anyhow::Result;
use chrono::{DateTime, Utc};
use rusqlite::{Connection, params};

use crate::models::AccountId;
use crate::storage::to_millis;

/// Reply/forward prefixes stripped from subjects, compared case-insensitively
const REPLY_PREFIXES: &[&str] = &[
    "re", "fw", "fwd", "aw", "wg", "sv", "vs", "antw", "tr", "rif", "r", "res", "enc", "odp",
    "pd", "回复", "转发", "답장", "전달",
];

/// Subject with every leading reply/forward prefix removed, case preserved
///
/// Handles stacked prefixes (`RE: Fwd: x`), bracketed counters (`Re[2]: x`)
/// and full-width colons.
pub fn strip_subject_prefixes(subject: &str) -> String {
    let mut rest = subject.trim();
    while let Some(stripped) = strip_one_prefix(rest) {
        rest = stripped.trim_start();
    }
    rest.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Topic key for a subject: prefixes stripped, whitespace collapsed, lowercased
pub fn normalize_subject(subject: &str) -> String {
    strip_subject_prefixes(subject).to_lowercase()
}

fn strip_one_prefix(s: &str) -> Option<&str> {
    let colon = s.find([':', '：'])?;
    let head = s[..colon].trim_end();

    // Optional bracketed counter: "Re[2]" / "RE(3)"
    let word = match head.find(['[', '(']) {
        Some(open) => {
            let counter = &head[open + 1..];
            let counter = counter.strip_suffix([']', ')'])?;
            if counter.is_empty() || !counter.chars().all(|c| c.is_ascii_digit()) {
                return None;
            }
            head[..open].trim_end()
        }
        None => head,
    };

    let word = word.to_lowercase();
    if REPLY_PREFIXES.contains(&word.as_str()) {
        let colon_len = s[colon..].chars().next().map_or(1, char::len_utf8);
        Some(&s[colon + colon_len..])
    } else {
        None
    }
}

/// The aggregate keys one email contributes to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DerivedKey {
    /// Lowercased sender address
    pub sender_email: String,
    pub sender_name: Option<String>,
    /// Empty for subject-less mail, which joins no topic
    pub normalized_subject: String,
    pub display_subject: String,
    pub received_at: DateTime<Utc>,
}

impl DerivedKey {
    pub fn new(
        sender_email: &str,
        sender_name: Option<String>,
        subject: &str,
        received_at: DateTime<Utc>,
    ) -> Self {
        let display_subject = strip_subject_prefixes(subject);
        Self {
            sender_email: sender_email.trim().to_lowercase(),
            sender_name,
            normalized_subject: display_subject.to_lowercase(),
            display_subject,
            received_at,
        }
    }
}

/// Account for an email that was inserted or rewritten
///
/// `previous` is the key the row had before this write, if it existed.
pub fn on_ingest(
    conn: &Connection,
    account_id: AccountId,
    previous: Option<&DerivedKey>,
    current: &DerivedKey,
) -> Result<()> {
    match previous {
        Some(prev) if prev.sender_email == current.sender_email => {
            refresh_sender(conn, account_id, current)?;
        }
        Some(prev) => {
            decrement_sender(conn, account_id, &prev.sender_email)?;
            increment_sender(conn, account_id, current)?;
        }
        None => increment_sender(conn, account_id, current)?,
    }

    match previous {
        Some(prev) if prev.normalized_subject == current.normalized_subject => {
            refresh_topic(conn, account_id, &current.normalized_subject)?;
        }
        Some(prev) => {
            decrement_topic(conn, account_id, &prev.normalized_subject)?;
            increment_topic(conn, account_id, current)?;
        }
        None => increment_topic(conn, account_id, current)?,
    }

    Ok(())
}

/// Account for an email row that was deleted
pub fn on_delete(conn: &Connection, account_id: AccountId, key: &DerivedKey) -> Result<()> {
    decrement_sender(conn, account_id, &key.sender_email)?;
    decrement_topic(conn, account_id, &key.normalized_subject)?;
    newsletter::on_sender_mail_removed(conn, account_id, &key.sender_email)
}

fn increment_sender(conn: &Connection, account_id: AccountId, key: &DerivedKey) -> Result<()> {
    conn.execute(
        "INSERT INTO sender_groups (account_id, sender_email, display_name, message_count, last_seen_at)
         VALUES (?, ?, ?, 1, ?)
         ON CONFLICT(account_id, sender_email) DO UPDATE SET
            message_count = message_count + 1,
            display_name = CASE WHEN excluded.last_seen_at >= last_seen_at
                                THEN COALESCE(excluded.display_name, display_name)
                                ELSE display_name END,
            last_seen_at = MAX(last_seen_at, excluded.last_seen_at)",
        params![
            account_id,
            key.sender_email,
            key.sender_name,
            to_millis(key.received_at)
        ],
    )?;
    Ok(())
}

/// Same sender, rewritten row: only the name and timestamp can move
fn refresh_sender(conn: &Connection, account_id: AccountId, key: &DerivedKey) -> Result<()> {
    conn.execute(
        "UPDATE sender_groups SET display_name = COALESCE(?, display_name)
         WHERE account_id = ? AND sender_email = ?",
        params![key.sender_name, account_id, key.sender_email],
    )?;
    recompute_sender_last_seen(conn, account_id, &key.sender_email)
}

fn decrement_sender(conn: &Connection, account_id: AccountId, sender_email: &str) -> Result<()> {
    conn.execute(
        "UPDATE sender_groups SET message_count = message_count - 1
         WHERE account_id = ? AND sender_email = ?",
        params![account_id, sender_email],
    )?;
    conn.execute(
        "DELETE FROM sender_groups
         WHERE account_id = ? AND sender_email = ? AND message_count <= 0",
        params![account_id, sender_email],
    )?;
    recompute_sender_last_seen(conn, account_id, sender_email)
}

fn recompute_sender_last_seen(
    conn: &Connection,
    account_id: AccountId,
    sender_email: &str,
) -> Result<()> {
    conn.execute(
        "UPDATE sender_groups SET last_seen_at = COALESCE(
            (SELECT MAX(received_at) FROM emails WHERE account_id = ?1 AND from_email = ?2),
            last_seen_at)
         WHERE account_id = ?1 AND sender_email = ?2",
        params![account_id, sender_email],
    )?;
    Ok(())
}

fn increment_topic(conn: &Connection, account_id: AccountId, key: &DerivedKey) -> Result<()> {
    if key.normalized_subject.is_empty() {
        return Ok(());
    }
    conn.execute(
        "INSERT INTO topics (account_id, normalized_subject, display_subject, message_count, last_seen_at)
         VALUES (?, ?, ?, 1, ?)
         ON CONFLICT(account_id, normalized_subject) DO UPDATE SET
            message_count = message_count + 1,
            last_seen_at = MAX(last_seen_at, excluded.last_seen_at)",
        params![
            account_id,
            key.normalized_subject,
            key.display_subject,
            to_millis(key.received_at)
        ],
    )?;
    Ok(())
}

fn refresh_topic(conn: &Connection, account_id: AccountId, normalized_subject: &str) -> Result<()> {
    if normalized_subject.is_empty() {
        return Ok(());
    }
    recompute_topic_last_seen(conn, account_id, normalized_subject)
}

fn decrement_topic(conn: &Connection, account_id: AccountId, normalized_subject: &str) -> Result<()> {
    if normalized_subject.is_empty() {
        return Ok(());
    }
    conn.execute(
        "UPDATE topics SET message_count = message_count - 1
         WHERE account_id = ? AND normalized_subject = ?",
        params![account_id, normalized_subject],
    )?;
    conn.execute(
        "DELETE FROM topics
         WHERE account_id = ? AND normalized_subject = ? AND message_count <= 0",
        params![account_id, normalized_subject],
    )?;
    recompute_topic_last_seen(conn, account_id, normalized_subject)
}

fn recompute_topic_last_seen(
    conn: &Connection,
    account_id: AccountId,
    normalized_subject: &str,
) -> Result<()> {
    conn.execute(
        "UPDATE topics SET last_seen_at = COALESCE(
            (SELECT MAX(received_at) FROM emails
             WHERE account_id = ?1 AND normalized_subject = ?2),
            last_seen_at)
         WHERE account_id = ?1 AND normalized_subject = ?2",
        params![account_id, normalized_subject],
    )?;
    Ok(())
}
