//! Rule-based categorization
//!
//! `categorize` is a pure function of the email's attributes and the rule
//! set. Rules run in ascending priority (ties broken by rule id) and the
//! first match wins. Loading rules from storage is tolerant: a malformed
//! stored rule is logged and skipped so ingest never fails because of one.

use anyhow::Result;
use rusqlite::{Connection, params};

use crate::models::{AccountId, CategorizationRule, CategoryId, RuleMatch};

/// The parts of an email rules look at
#[derive(Debug, Clone, Copy)]
pub struct EmailAttributes<'a> {
    pub sender_email: &'a str,
    pub subject: &'a str,
    /// Full effective label set, flag labels included
    pub labels: &'a [String],
}

/// Resolve the category for an email, or `None` if no rule matches
pub fn categorize(email: &EmailAttributes<'_>, rules: &[CategorizationRule]) -> Option<CategoryId> {
    let sender = email.sender_email.trim().to_lowercase();
    let domain = sender.rsplit_once('@').map(|(_, d)| d).unwrap_or("");
    let subject = email.subject.to_lowercase();

    let mut ordered: Vec<&CategorizationRule> = rules.iter().collect();
    ordered.sort_by_key(|rule| (rule.priority, rule.id));

    ordered
        .into_iter()
        .find(|rule| match &rule.matcher {
            RuleMatch::SenderDomain(d) => domain_matches(domain, d),
            RuleMatch::SenderEmail(e) => sender == *e,
            RuleMatch::SubjectKeyword(k) => subject.contains(k.as_str()),
            RuleMatch::Label(l) => email.labels.iter().any(|label| label == l),
        })
        .map(|rule| rule.category_id)
}

/// Suffix match on label boundaries: `example.com` matches `mail.example.com`
/// but not `badexample.com`
fn domain_matches(domain: &str, rule_domain: &str) -> bool {
    if domain.is_empty() || rule_domain.is_empty() {
        return false;
    }
    domain == rule_domain
        || domain
            .strip_suffix(rule_domain)
            .is_some_and(|head| head.ends_with('.'))
}

/// Load an account's stored rules, skipping (and logging) malformed rows
pub(crate) fn load_rules(conn: &Connection, account_id: AccountId) -> Result<Vec<CategorizationRule>> {
    let mut stmt = conn.prepare(
        "SELECT id, kind, value, category_id, priority
         FROM categorization_rules
         WHERE account_id = ?
         ORDER BY priority, id",
    )?;

    let rows = stmt
        .query_map(params![account_id], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, CategoryId>(3)?,
                row.get::<_, i64>(4)?,
            ))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    let mut rules = Vec::with_capacity(rows.len());
    for (id, kind, value, category_id, priority) in rows {
        match RuleMatch::from_parts(&kind, &value) {
            Ok(matcher) => rules.push(CategorizationRule {
                id,
                account_id,
                matcher,
                category_id,
                priority,
            }),
            Err(e) => log::warn!("[CATEGORIZE] Skipping rule {}: {}", id, e),
        }
    }

    Ok(rules)
}
