//! Categories, rules, and re-running categorization

use anyhow::{Context, Result, bail};
use rusqlite::{Connection, OptionalExtension, params};

use super::sqlite::SqliteMailStore;
use crate::categorize::{self, EmailAttributes};
use crate::models::{
    AccountId, CategorizationRule, Category, CategoryId, EmailId, NewRule, RuleError, labels,
};

impl SqliteMailStore {
    pub fn create_category(
        &self,
        account_id: AccountId,
        name: &str,
        color: Option<&str>,
        icon: Option<&str>,
    ) -> Result<Category> {
        let name = name.trim();
        if name.is_empty() {
            bail!("Category name must not be empty");
        }

        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO categories (account_id, name, color, icon) VALUES (?, ?, ?, ?)",
            params![account_id, name, color, icon],
        )
        .with_context(|| format!("Failed to create category {:?}", name))?;

        Ok(Category {
            id: conn.last_insert_rowid(),
            account_id,
            name: name.to_string(),
            color: color.map(str::to_string),
            icon: icon.map(str::to_string),
            is_system: false,
        })
    }

    pub fn list_categories(&self, account_id: AccountId) -> Result<Vec<Category>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT id, account_id, name, color, icon, is_system
             FROM categories WHERE account_id = ? ORDER BY name",
        )?;
        let categories = stmt
            .query_map([account_id], |row| {
                Ok(Category {
                    id: row.get(0)?,
                    account_id: row.get(1)?,
                    name: row.get(2)?,
                    color: row.get(3)?,
                    icon: row.get(4)?,
                    is_system: row.get(5)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(categories)
    }

    /// Delete a category; its rules go with it and its emails become
    /// uncategorized
    pub fn delete_category(&self, category_id: CategoryId) -> Result<bool> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        tx.execute(
            "UPDATE emails SET category_override = 0 WHERE category_id = ?",
            [category_id],
        )?;
        let deleted = tx.execute("DELETE FROM categories WHERE id = ?", [category_id])?;
        tx.commit()?;
        Ok(deleted > 0)
    }

    /// Store a validated rule; the category must belong to the same account
    pub fn add_rule(&self, account_id: AccountId, rule: &NewRule) -> Result<CategorizationRule> {
        let conn = self.lock()?;
        let owner: Option<AccountId> = conn
            .query_row(
                "SELECT account_id FROM categories WHERE id = ?",
                [rule.category_id],
                |row| row.get(0),
            )
            .optional()?;
        if owner != Some(account_id) {
            return Err(anyhow::Error::new(RuleError::MissingCategory)
                .context(format!("Category {} not found for account", rule.category_id)));
        }

        conn.execute(
            "INSERT INTO categorization_rules (account_id, kind, value, category_id, priority)
             VALUES (?, ?, ?, ?, ?)",
            params![
                account_id,
                rule.matcher.kind(),
                rule.matcher.value(),
                rule.category_id,
                rule.priority
            ],
        )?;

        Ok(CategorizationRule {
            id: conn.last_insert_rowid(),
            account_id,
            matcher: rule.matcher.clone(),
            category_id: rule.category_id,
            priority: rule.priority,
        })
    }

    /// Validate and store rules from a settings blob
    ///
    /// Invalid entries are rejected and reported, valid ones are stored.
    pub fn import_rules(
        &self,
        account_id: AccountId,
        values: &[serde_json::Value],
    ) -> Result<(Vec<CategorizationRule>, Vec<RuleError>)> {
        let (rules, errors) = NewRule::parse_all(values);
        for error in &errors {
            log::warn!("[CATEGORIZE] Rejected rule from settings: {}", error);
        }

        let stored = rules
            .iter()
            .map(|rule| self.add_rule(account_id, rule))
            .collect::<Result<Vec<_>>>()?;
        Ok((stored, errors))
    }

    pub fn list_rules(&self, account_id: AccountId) -> Result<Vec<CategorizationRule>> {
        let conn = self.lock()?;
        categorize::load_rules(&conn, account_id)
    }

    pub fn delete_rule(&self, rule_id: i64) -> Result<bool> {
        let conn = self.lock()?;
        let deleted = conn.execute("DELETE FROM categorization_rules WHERE id = ?", [rule_id])?;
        Ok(deleted > 0)
    }

    /// Re-run the rules over every email of an account
    ///
    /// Emails with a manual category are left alone. Returns how many emails
    /// changed category; a second run with the same rules returns 0.
    pub fn recategorize_all(&self, account_id: AccountId) -> Result<usize> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let rules = categorize::load_rules(&tx, account_id)?;

        let ids: Vec<i64> = {
            let mut stmt = tx.prepare(
                "SELECT id FROM emails WHERE account_id = ? AND category_override = 0",
            )?;
            stmt.query_map([account_id], |row| row.get(0))?
                .collect::<Result<Vec<_>, _>>()?
        };

        let mut changed = 0;
        for id in ids {
            if apply_rules(&tx, EmailId(id), &rules)? {
                changed += 1;
            }
        }

        tx.commit()?;
        log::info!(
            "[CATEGORIZE] Recategorized account {}: {} emails changed",
            account_id,
            changed
        );
        Ok(changed)
    }

    /// Pin an email to a category chosen by the user
    pub fn set_category_override(&self, email_id: EmailId, category_id: CategoryId) -> Result<bool> {
        let conn = self.lock()?;
        let updated = conn.execute(
            "UPDATE emails SET category_id = ?, category_override = 1
             WHERE id = ?
               AND account_id = (SELECT account_id FROM categories WHERE id = ?)",
            params![category_id, email_id.0, category_id],
        )?;
        Ok(updated > 0)
    }

    /// Drop a manual category and let the rules decide again
    pub fn clear_category_override(&self, email_id: EmailId) -> Result<bool> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let updated = tx.execute(
            "UPDATE emails SET category_override = 0 WHERE id = ?",
            [email_id.0],
        )?;
        if updated == 0 {
            return Ok(false);
        }
        recategorize_email(&tx, email_id)?;
        tx.commit()?;
        Ok(true)
    }
}

/// Recompute one email's category from the stored rules
///
/// No-op for emails with a manual category.
pub(crate) fn recategorize_email(conn: &Connection, email_id: EmailId) -> Result<()> {
    let account_id: Option<(AccountId, bool)> = conn
        .query_row(
            "SELECT account_id, category_override FROM emails WHERE id = ?",
            [email_id.0],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()?;
    let Some((account_id, false)) = account_id else {
        return Ok(());
    };

    let rules = categorize::load_rules(conn, account_id).unwrap_or_else(|e| {
        log::warn!("[CATEGORIZE] Failed to load rules for account {}: {:#}", account_id, e);
        Vec::new()
    });
    apply_rules(conn, email_id, &rules)?;
    Ok(())
}

/// Evaluate rules for a stored email; returns whether the category changed
fn apply_rules(conn: &Connection, email_id: EmailId, rules: &[CategorizationRule]) -> Result<bool> {
    let (sender, subject, is_read, is_starred, is_trashed, current): (
        String,
        String,
        bool,
        bool,
        bool,
        Option<CategoryId>,
    ) = conn.query_row(
        "SELECT from_email, subject, is_read, is_starred, is_trashed, category_id
         FROM emails WHERE id = ?",
        [email_id.0],
        |row| {
            Ok((
                row.get(0)?,
                row.get(1)?,
                row.get(2)?,
                row.get(3)?,
                row.get(4)?,
                row.get(5)?,
            ))
        },
    )?;

    let mut effective = super::emails::load_labels(conn, email_id)?;
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
            sender_email: &sender,
            subject: &subject,
            labels: &effective,
        },
        rules,
    );
    if category == current {
        return Ok(false);
    }

    conn.execute(
        "UPDATE emails SET category_id = ? WHERE id = ?",
        params![category, email_id.0],
    )?;
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ChangeEvent, EmailAddress, RemoteEmail, RuleMatch};
    use serde_json::json;

    fn ingest(store: &SqliteMailStore, account_id: AccountId, id: &str, from: &str, subject: &str) -> EmailId {
        let remote = RemoteEmail::builder(id, id)
            .from(EmailAddress::new(from))
            .subject(subject)
            .build();
        store
            .apply_changes(account_id, &[ChangeEvent::Added(remote)], id)
            .unwrap();
        store.find_email_id(account_id, id).unwrap().unwrap()
    }

    fn category_of(store: &SqliteMailStore, id: EmailId) -> Option<CategoryId> {
        store.get_email(id).unwrap().unwrap().category_id
    }

    #[test]
    fn test_rule_priority_on_ingest() {
        let store = SqliteMailStore::open_in_memory().unwrap();
        let account = store.create_account("me@example.com", None).unwrap();
        let finance = store.create_category(account.id, "Finance", None, None).unwrap();
        let work = store.create_category(account.id, "Work", None, None).unwrap();

        store
            .add_rule(
                account.id,
                &NewRule {
                    matcher: RuleMatch::SubjectKeyword("invoice".into()),
                    category_id: finance.id,
                    priority: 2,
                },
            )
            .unwrap();
        store
            .add_rule(
                account.id,
                &NewRule {
                    matcher: RuleMatch::SenderDomain("example.com".into()),
                    category_id: work.id,
                    priority: 1,
                },
            )
            .unwrap();

        let id = ingest(&store, account.id, "m1", "billing@example.com", "Invoice #42");
        assert_eq!(category_of(&store, id), Some(work.id));
    }

    #[test]
    fn test_recategorize_is_idempotent_and_respects_override() {
        let store = SqliteMailStore::open_in_memory().unwrap();
        let account = store.create_account("me@example.com", None).unwrap();
        let news = store.create_category(account.id, "News", None, None).unwrap();
        let keep = store.create_category(account.id, "Keep", None, None).unwrap();

        let a = ingest(&store, account.id, "m1", "digest@news.com", "Daily");
        let b = ingest(&store, account.id, "m2", "digest@news.com", "Weekly");
        assert!(store.set_category_override(b, keep.id).unwrap());

        let (stored, errors) = store
            .import_rules(
                account.id,
                &[
                    json!({"type": "sender_domain", "value": "news.com", "category_id": news.id}),
                    json!({"type": "bogus", "value": "x", "category_id": news.id}),
                ],
            )
            .unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(errors.len(), 1);

        assert_eq!(store.recategorize_all(account.id).unwrap(), 1);
        assert_eq!(store.recategorize_all(account.id).unwrap(), 0);
        assert_eq!(category_of(&store, a), Some(news.id));
        assert_eq!(category_of(&store, b), Some(keep.id));

        store.clear_category_override(b).unwrap();
        assert_eq!(category_of(&store, b), Some(news.id));
    }

    #[test]
    fn test_override_survives_provider_update() {
        let store = SqliteMailStore::open_in_memory().unwrap();
        let account = store.create_account("me@example.com", None).unwrap();
        let keep = store.create_category(account.id, "Keep", None, None).unwrap();
        let id = ingest(&store, account.id, "m1", "a@b.com", "One");
        store.set_category_override(id, keep.id).unwrap();

        ingest(&store, account.id, "m1", "a@b.com", "One, edited");
        assert_eq!(category_of(&store, id), Some(keep.id));
    }

    #[test]
    fn test_rule_requires_own_category() {
        let store = SqliteMailStore::open_in_memory().unwrap();
        let me = store.create_account("me@example.com", None).unwrap();
        let other = store.create_account("other@example.com", None).unwrap();
        let theirs = store.create_category(other.id, "Theirs", None, None).unwrap();

        let rule = NewRule {
            matcher: RuleMatch::Label("INBOX".into()),
            category_id: theirs.id,
            priority: 0,
        };
        assert!(store.add_rule(me.id, &rule).is_err());
    }

    #[test]
    fn test_delete_category_uncategorizes() {
        let store = SqliteMailStore::open_in_memory().unwrap();
        let account = store.create_account("me@example.com", None).unwrap();
        let cat = store.create_category(account.id, "Tmp", None, None).unwrap();
        let id = ingest(&store, account.id, "m1", "a@b.com", "One");
        store.set_category_override(id, cat.id).unwrap();

        assert!(store.delete_category(cat.id).unwrap());
        let email = store.get_email(id).unwrap().unwrap();
        assert_eq!(email.category_id, None);
        assert!(!email.category_override);
        assert!(store.list_rules(account.id).unwrap().is_empty());
    }
}
