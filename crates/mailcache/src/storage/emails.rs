//! Email rows: loading, bodies and child records

use anyhow::{Context, Result};
use rusqlite::{Connection, OptionalExtension, params};

use super::sqlite::{SqliteMailStore, from_millis};
use crate::models::{
    AccountId, Attachment, Email, EmailAddress, EmailBody, EmailId, RemoteEmail,
};

/// Columns selected for an `Email`, in `email_from_row` order
pub(crate) const EMAIL_COLUMNS: &str = "e.id, e.account_id, e.remote_id, e.thread_id, e.from_name,
        e.from_email, e.subject, e.snippet, e.received_at, e.is_read, e.is_starred,
        e.is_trashed, e.has_attachments, e.category_id, e.category_override, e.has_body";

/// Map a row selected with `EMAIL_COLUMNS`; recipients and labels are
/// filled in by `load_email_children`
pub(crate) fn email_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Email> {
    Ok(Email {
        id: EmailId(row.get(0)?),
        account_id: row.get(1)?,
        remote_id: row.get(2)?,
        thread_id: row.get(3)?,
        from: EmailAddress {
            name: row.get(4)?,
            email: row.get(5)?,
        },
        to: Vec::new(),
        cc: Vec::new(),
        subject: row.get(6)?,
        snippet: row.get(7)?,
        received_at: from_millis(row.get(8)?),
        is_read: row.get(9)?,
        is_starred: row.get(10)?,
        is_trashed: row.get(11)?,
        label_ids: Vec::new(),
        has_attachments: row.get(12)?,
        category_id: row.get(13)?,
        category_override: row.get(14)?,
        has_body: row.get(15)?,
    })
}

/// Fill recipients and labels for emails loaded with `email_from_row`
pub(crate) fn load_email_children(conn: &Connection, email: &mut Email) -> Result<()> {
    email.to = load_recipients(conn, email.id, "to")?;
    email.cc = load_recipients(conn, email.id, "cc")?;
    email.label_ids = load_labels(conn, email.id)?;
    Ok(())
}

pub(crate) fn load_recipients(
    conn: &Connection,
    email_id: EmailId,
    kind: &str,
) -> Result<Vec<EmailAddress>> {
    let mut stmt = conn.prepare_cached(
        "SELECT name, email FROM email_recipients
         WHERE email_id = ? AND kind = ?
         ORDER BY position",
    )?;

    let recipients = stmt
        .query_map(params![email_id.0, kind], |row| {
            Ok(EmailAddress {
                name: row.get(0)?,
                email: row.get(1)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;

    Ok(recipients)
}

pub(crate) fn load_labels(conn: &Connection, email_id: EmailId) -> Result<Vec<String>> {
    let mut stmt = conn
        .prepare_cached("SELECT label_id FROM email_labels WHERE email_id = ? ORDER BY label_id")?;
    let labels = stmt
        .query_map([email_id.0], |row| row.get(0))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(labels)
}

/// Replace recipients, labels and attachments of an email
pub(crate) fn replace_children(
    conn: &Connection,
    email_id: EmailId,
    remote: &RemoteEmail,
    labels: &[String],
) -> Result<()> {
    conn.execute("DELETE FROM email_recipients WHERE email_id = ?", [email_id.0])?;
    conn.execute("DELETE FROM email_labels WHERE email_id = ?", [email_id.0])?;
    conn.execute("DELETE FROM attachments WHERE email_id = ?", [email_id.0])?;

    let mut recipient_stmt = conn.prepare_cached(
        "INSERT INTO email_recipients (email_id, kind, name, email, position)
         VALUES (?, ?, ?, ?, ?)",
    )?;
    for (kind, list) in [("to", &remote.to), ("cc", &remote.cc)] {
        for (i, addr) in list.iter().enumerate() {
            recipient_stmt.execute(params![email_id.0, kind, addr.name, addr.email, i as i64])?;
        }
    }

    let mut label_stmt =
        conn.prepare_cached("INSERT OR IGNORE INTO email_labels (email_id, label_id) VALUES (?, ?)")?;
    for label in labels {
        label_stmt.execute(params![email_id.0, label])?;
    }

    let mut attachment_stmt = conn.prepare_cached(
        "INSERT INTO attachments (email_id, filename, mime_type, size, remote_attachment_id)
         VALUES (?, ?, ?, ?, ?)",
    )?;
    for attachment in &remote.attachments {
        attachment_stmt.execute(params![
            email_id.0,
            attachment.filename,
            attachment.mime_type,
            i64::try_from(attachment.size).unwrap_or(i64::MAX),
            attachment.remote_attachment_id,
        ])?;
    }

    Ok(())
}

/// Compress and store a fetched body
pub(crate) fn write_body(conn: &Connection, email_id: EmailId, body: &EmailBody) -> Result<()> {
    // Level 3 is zstd's default speed/ratio balance
    let text = body
        .text
        .as_ref()
        .map(|text| zstd::encode_all(text.as_bytes(), 3))
        .transpose()
        .context("Failed to compress body_text")?;
    let html = body
        .html
        .as_ref()
        .map(|html| zstd::encode_all(html.as_bytes(), 3))
        .transpose()
        .context("Failed to compress body_html")?;

    conn.execute(
        "UPDATE emails SET body_text = ?, body_html = ?, has_body = 1 WHERE id = ?",
        params![text, html, email_id.0],
    )?;
    Ok(())
}

fn decompress(data: Option<Vec<u8>>, what: &str) -> Result<Option<String>> {
    data.map(|data| {
        zstd::decode_all(data.as_slice())
            .with_context(|| format!("Failed to decompress {}", what))
            .map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
    })
    .transpose()
}

impl SqliteMailStore {
    /// Load one email with recipients and labels
    pub fn get_email(&self, email_id: EmailId) -> Result<Option<Email>> {
        let conn = self.lock()?;
        let email = conn
            .query_row(
                &format!("SELECT {} FROM emails e WHERE e.id = ?", EMAIL_COLUMNS),
                [email_id.0],
                email_from_row,
            )
            .optional()?;

        let Some(mut email) = email else {
            return Ok(None);
        };
        load_email_children(&conn, &mut email)?;
        Ok(Some(email))
    }

    /// Look up the local id for a provider message id
    pub fn find_email_id(&self, account_id: AccountId, remote_id: &str) -> Result<Option<EmailId>> {
        let conn = self.lock()?;
        let id = conn
            .query_row(
                "SELECT id FROM emails WHERE account_id = ? AND remote_id = ?",
                params![account_id, remote_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(id.map(EmailId))
    }

    /// Owning account and provider id of an email
    pub fn email_remote_ref(&self, email_id: EmailId) -> Result<Option<(AccountId, String)>> {
        let conn = self.lock()?;
        let row = conn
            .query_row(
                "SELECT account_id, remote_id FROM emails WHERE id = ?",
                [email_id.0],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        Ok(row)
    }

    /// Cached body, or `None` if it has not been fetched yet
    pub fn get_body(&self, email_id: EmailId) -> Result<Option<EmailBody>> {
        let conn = self.lock()?;
        let row: Option<(bool, Option<Vec<u8>>, Option<Vec<u8>>)> = conn
            .query_row(
                "SELECT has_body, body_text, body_html FROM emails WHERE id = ?",
                [email_id.0],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()?;

        match row {
            Some((true, text, html)) => Ok(Some(EmailBody {
                text: decompress(text, "body_text")?,
                html: decompress(html, "body_html")?,
            })),
            _ => Ok(None),
        }
    }

    /// Store a body fetched on demand
    pub fn store_body(&self, email_id: EmailId, body: &EmailBody) -> Result<()> {
        let conn = self.lock()?;
        write_body(&conn, email_id, body)
    }

    pub fn list_attachments(&self, email_id: EmailId) -> Result<Vec<Attachment>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT id, email_id, filename, mime_type, size, remote_attachment_id
             FROM attachments WHERE email_id = ? ORDER BY id",
        )?;
        let attachments = stmt
            .query_map([email_id.0], |row| {
                Ok(Attachment {
                    id: row.get(0)?,
                    email_id: EmailId(row.get(1)?),
                    filename: row.get(2)?,
                    mime_type: row.get(3)?,
                    size: row.get::<_, i64>(4)?.max(0) as u64,
                    remote_attachment_id: row.get(5)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(attachments)
    }

    /// Number of cached emails for an account
    pub fn count_emails(&self, account_id: AccountId) -> Result<usize> {
        let conn = self.lock()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM emails WHERE account_id = ?",
            [account_id],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{AttachmentMeta, ChangeEvent};

    #[test]
    fn test_body_round_trip_compressed() {
        let store = SqliteMailStore::open_in_memory().unwrap();
        let account = store.create_account("me@example.com", None).unwrap();
        let remote = RemoteEmail::builder("m1", "t1")
            .from(EmailAddress::new("a@b.com"))
            .subject("Hi")
            .attachments(vec![AttachmentMeta {
                filename: "a.pdf".into(),
                mime_type: "application/pdf".into(),
                size: 10,
                remote_attachment_id: "att".into(),
            }])
            .build();
        store
            .apply_changes(account.id, &[ChangeEvent::Added(remote)], "1")
            .unwrap();

        let id = store.find_email_id(account.id, "m1").unwrap().unwrap();
        assert_eq!(store.get_body(id).unwrap(), None);

        let body = EmailBody {
            text: Some("hello ".repeat(100)),
            html: None,
        };
        store.store_body(id, &body).unwrap();
        assert_eq!(store.get_body(id).unwrap(), Some(body));

        let email = store.get_email(id).unwrap().unwrap();
        assert!(email.has_body);
        assert!(email.has_attachments);
        assert_eq!(store.list_attachments(id).unwrap()[0].filename, "a.pdf");
    }
}
