//! Search over cached emails
//!
//! Operators become SQL conditions. Free-text terms must each appear in the
//! subject, snippet, sender or cached body; bodies are compressed, so body
//! matching happens after the SQL pass.

use anyhow::Result;
use rusqlite::types::Value;

use super::emails::{Page, SqlFilter};
use super::parser::{ParsedQuery, parse_query};
use crate::models::{AccountId, Email, labels};
use crate::storage::SqliteMailStore;

/// Emails of `account_id` matching a Gmail-style `query`, newest first
pub fn search_emails(
    store: &SqliteMailStore,
    account_id: AccountId,
    query: &str,
    page: Page,
) -> Result<Vec<Email>> {
    let parsed = parse_query(query);
    let sql = to_sql(account_id, &parsed);

    if parsed.terms.is_empty() {
        return sql.select(store, Some(page));
    }

    let terms: Vec<String> = parsed.terms.iter().map(|t| t.to_lowercase()).collect();
    let mut matched = Vec::new();
    let mut skipped = 0;
    for email in sql.select(store, None)? {
        if matched.len() >= page.limit {
            break;
        }
        if !matches_terms(store, &email, &terms)? {
            continue;
        }
        if skipped < page.offset {
            skipped += 1;
            continue;
        }
        matched.push(email);
    }
    Ok(matched)
}

fn to_sql(account_id: AccountId, query: &ParsedQuery) -> SqlFilter {
    let mut sql = SqlFilter::for_account(account_id);

    let mut trash_visible = query.anywhere;
    for label in &query.labels {
        match label.as_str() {
            labels::TRASH => {
                trash_visible = true;
                sql.push("e.is_trashed = 1", []);
            }
            labels::UNREAD => sql.push("e.is_read = 0", []),
            labels::STARRED => sql.push("e.is_starred = 1", []),
            other => sql.push_label(other),
        }
    }
    if !trash_visible {
        sql.push("e.is_trashed = 0", []);
    }

    for from in &query.from {
        sql.push_contains(&["e.from_email", "e.from_name"], from);
    }
    for to in &query.to {
        let pattern = format!("%{}%", to.to_lowercase());
        sql.push_clause(
            "EXISTS (SELECT 1 FROM email_recipients r WHERE r.email_id = e.id
                AND (LOWER(r.email) LIKE ? OR LOWER(r.name) LIKE ?))"
                .to_string(),
            vec![Value::Text(pattern.clone()), Value::Text(pattern)],
        );
    }
    for subject in &query.subject {
        sql.push_contains(&["e.subject"], subject);
    }

    if let Some(unread) = query.is_unread {
        sql.push("e.is_read = ?", [Value::Integer(i64::from(!unread))]);
    }
    if let Some(starred) = query.is_starred {
        sql.push("e.is_starred = ?", [Value::Integer(i64::from(starred))]);
    }
    if let Some(has) = query.has_attachment {
        sql.push("e.has_attachments = ?", [Value::Integer(i64::from(has))]);
    }
    sql.push_range(query.after, query.before);
    sql
}

fn matches_terms(store: &SqliteMailStore, email: &Email, terms: &[String]) -> Result<bool> {
    let header = format!(
        "{}\n{}\n{}\n{}",
        email.subject,
        email.snippet,
        email.from.email,
        email.from.name.as_deref().unwrap_or_default()
    )
    .to_lowercase();

    let mut body: Option<String> = None;
    for term in terms {
        if header.contains(term.as_str()) {
            continue;
        }
        if !email.has_body {
            return Ok(false);
        }
        if body.is_none() {
            let cached = store.get_body(email.id)?.unwrap_or_default();
            body = Some(
                format!(
                    "{}\n{}",
                    cached.text.unwrap_or_default(),
                    cached.html.unwrap_or_default()
                )
                .to_lowercase(),
            );
        }
        if !body.as_deref().is_some_and(|b| b.contains(term.as_str())) {
            return Ok(false);
        }
    }
    Ok(true)
}
