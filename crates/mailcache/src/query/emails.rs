//! Email list queries

use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use rusqlite::params_from_iter;
use rusqlite::types::Value;
use serde::{Deserialize, Serialize};

use crate::derived::normalize_subject;
use crate::models::{AccountId, CategoryId, Email, EmailId, labels};
use crate::storage::{EMAIL_COLUMNS, SqliteMailStore, email_from_row, load_email_children, to_millis};

/// Page of results, newest first
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Page {
    pub limit: usize,
    pub offset: usize,
}

impl Default for Page {
    fn default() -> Self {
        Self {
            limit: 50,
            offset: 0,
        }
    }
}

impl Page {
    pub fn new(limit: usize, offset: usize) -> Self {
        Self { limit, offset }
    }
}

/// Received-time buckets, measured back from the start of today (UTC)
///
/// Buckets do not overlap: `ThisWeek` excludes today and yesterday.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeBucket {
    Today,
    Yesterday,
    /// Two to seven days ago
    ThisWeek,
    /// Eight to thirty days ago
    ThisMonth,
    Older,
}

impl TimeBucket {
    /// `[from, until)` bounds relative to `now`
    pub fn range(&self, now: DateTime<Utc>) -> (Option<DateTime<Utc>>, Option<DateTime<Utc>>) {
        let today = now
            .date_naive()
            .and_hms_opt(0, 0, 0)
            .map_or(now, |midnight| midnight.and_utc());
        let days_back = |days: i64| today - Duration::days(days);
        match self {
            TimeBucket::Today => (Some(today), None),
            TimeBucket::Yesterday => (Some(days_back(1)), Some(today)),
            TimeBucket::ThisWeek => (Some(days_back(7)), Some(days_back(1))),
            TimeBucket::ThisMonth => (Some(days_back(30)), Some(days_back(7))),
            TimeBucket::Older => (None, Some(days_back(30))),
        }
    }
}

/// Which emails of an account to list
///
/// Trashed emails are hidden unless `include_trashed` is set or the label
/// filter is `TRASH`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EmailFilter {
    pub account_id: AccountId,
    pub label: Option<String>,
    pub category_id: Option<CategoryId>,
    pub sender: Option<String>,
    /// Topic key as listed by `list_topics`, or any subject of the topic
    pub topic: Option<String>,
    pub bucket: Option<TimeBucket>,
    pub include_trashed: bool,
}

impl EmailFilter {
    pub fn account(account_id: AccountId) -> Self {
        Self {
            account_id,
            ..Default::default()
        }
    }

    pub fn label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    pub fn category(mut self, category_id: CategoryId) -> Self {
        self.category_id = Some(category_id);
        self
    }

    pub fn sender(mut self, sender: impl Into<String>) -> Self {
        self.sender = Some(sender.into());
        self
    }

    pub fn topic(mut self, topic: impl Into<String>) -> Self {
        self.topic = Some(topic.into());
        self
    }

    pub fn bucket(mut self, bucket: TimeBucket) -> Self {
        self.bucket = Some(bucket);
        self
    }

    fn to_sql(&self, now: DateTime<Utc>) -> SqlFilter {
        let mut sql = SqlFilter::for_account(self.account_id);
        let mut trash_visible = self.include_trashed;

        if let Some(label) = &self.label {
            match label.as_str() {
                labels::UNREAD => sql.push("e.is_read = 0", []),
                labels::STARRED => sql.push("e.is_starred = 1", []),
                labels::TRASH => {
                    trash_visible = true;
                    sql.push("e.is_trashed = 1", []);
                }
                other => sql.push_label(other),
            }
        }
        if !trash_visible {
            sql.push("e.is_trashed = 0", []);
        }
        if let Some(category_id) = self.category_id {
            sql.push("e.category_id = ?", [Value::Integer(category_id)]);
        }
        if let Some(sender) = &self.sender {
            sql.push("e.from_email = ?", [Value::Text(sender.trim().to_lowercase())]);
        }
        if let Some(topic) = &self.topic {
            sql.push("e.normalized_subject = ?", [Value::Text(normalize_subject(topic))]);
        }
        if let Some(bucket) = self.bucket {
            let (from, until) = bucket.range(now);
            sql.push_range(from, until);
        }
        sql
    }
}

/// WHERE clauses with their positional parameters, ANDed together
pub(super) struct SqlFilter {
    clauses: Vec<String>,
    params: Vec<Value>,
}

impl SqlFilter {
    pub(super) fn for_account(account_id: AccountId) -> Self {
        Self {
            clauses: vec!["e.account_id = ?".to_string()],
            params: vec![Value::Integer(account_id)],
        }
    }

    pub(super) fn push<const N: usize>(&mut self, clause: &str, params: [Value; N]) {
        self.clauses.push(clause.to_string());
        self.params.extend(params);
    }

    pub(super) fn push_label(&mut self, label: &str) {
        self.push(
            "EXISTS (SELECT 1 FROM email_labels l WHERE l.email_id = e.id AND l.label_id = ?)",
            [Value::Text(label.to_string())],
        );
    }

    pub(super) fn push_range(&mut self, from: Option<DateTime<Utc>>, until: Option<DateTime<Utc>>) {
        if let Some(from) = from {
            self.push("e.received_at >= ?", [Value::Integer(to_millis(from))]);
        }
        if let Some(until) = until {
            self.push("e.received_at < ?", [Value::Integer(to_millis(until))]);
        }
    }

    /// Case-insensitive substring match on any of `columns`
    pub(super) fn push_contains(&mut self, columns: &[&str], needle: &str) {
        let pattern = format!("%{}%", escape_like(&needle.to_lowercase()));
        let clause = columns
            .iter()
            .map(|column| format!("LOWER({}) LIKE ? ESCAPE '\\'", column))
            .collect::<Vec<_>>()
            .join(" OR ");
        self.clauses.push(format!("({})", clause));
        self.params
            .extend(columns.iter().map(|_| Value::Text(pattern.clone())));
    }

    pub(super) fn push_clause(&mut self, clause: String, params: Vec<Value>) {
        self.clauses.push(clause);
        self.params.extend(params);
    }

    fn where_clause(&self) -> String {
        self.clauses.join(" AND ")
    }

    /// Matching emails, newest first, children loaded
    pub(super) fn select(&self, store: &SqliteMailStore, page: Option<Page>) -> Result<Vec<Email>> {
        let conn = store.lock()?;
        let mut query = format!(
            "SELECT {} FROM emails e WHERE {} ORDER BY e.received_at DESC, e.id DESC",
            EMAIL_COLUMNS,
            self.where_clause()
        );
        if let Some(page) = page {
            query.push_str(&format!(" LIMIT {} OFFSET {}", page.limit, page.offset));
        }

        let mut stmt = conn.prepare(&query)?;
        let mut emails = stmt
            .query_map(params_from_iter(self.params.iter()), email_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        for email in &mut emails {
            load_email_children(&conn, email)?;
        }
        Ok(emails)
    }

    fn count(&self, store: &SqliteMailStore) -> Result<usize> {
        let conn = store.lock()?;
        let count: i64 = conn.query_row(
            &format!("SELECT COUNT(*) FROM emails e WHERE {}", self.where_clause()),
            params_from_iter(self.params.iter()),
            |row| row.get(0),
        )?;
        Ok(count.max(0) as usize)
    }
}

fn escape_like(s: &str) -> String {
    s.replace('\\', "\\\\").replace('%', "\\%").replace('_', "\\_")
}

/// Emails matching `filter`, newest first
pub fn list_emails(store: &SqliteMailStore, filter: &EmailFilter, page: Page) -> Result<Vec<Email>> {
    filter.to_sql(Utc::now()).select(store, Some(page))
}

/// Unread emails matching `filter`
pub fn count_unread(store: &SqliteMailStore, filter: &EmailFilter) -> Result<usize> {
    let mut sql = filter.to_sql(Utc::now());
    sql.push("e.is_read = 0", []);
    sql.count(store)
}

pub fn get_email(store: &SqliteMailStore, email_id: EmailId) -> Result<Option<Email>> {
    store.get_email(email_id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ChangeEvent, EmailAddress, RemoteEmail};

    fn seed(store: &SqliteMailStore, account_id: AccountId, now: DateTime<Utc>) {
        let email = |id: &str, from: &str, subject: &str, labels: &[&str], age_days: i64| {
            ChangeEvent::Added(
                RemoteEmail::builder(id, id)
                    .from(EmailAddress::new(from))
                    .subject(subject)
                    .received_at(now - Duration::days(age_days))
                    .labels(labels)
                    .build(),
            )
        };
        let changes = vec![
            email("m1", "alice@a.com", "Project X", &["INBOX", "UNREAD"], 0),
            email("m2", "alice@a.com", "Re: Project X", &["INBOX"], 1),
            email("m3", "Bob@B.com", "Invoice", &["INBOX", "UNREAD", "Label_1"], 3),
            email("m4", "carol@c.com", "Old news", &["TRASH", "UNREAD"], 5),
            email("m5", "dave@d.com", "Archive", &["STARRED"], 60),
        ];
        store.apply_changes(account_id, &changes, "10").unwrap();
    }

    fn ids(emails: &[Email]) -> Vec<String> {
        emails.iter().map(|e| e.remote_id.clone()).collect()
    }

    fn setup() -> (SqliteMailStore, AccountId) {
        let store = SqliteMailStore::open_in_memory().unwrap();
        let account = store.create_account("me@example.com", None).unwrap();
        seed(&store, account.id, Utc::now());
        (store, account.id)
    }

    #[test]
    fn test_list_newest_first_hides_trash() {
        let (store, id) = setup();
        let emails = list_emails(&store, &EmailFilter::account(id), Page::default()).unwrap();
        assert_eq!(ids(&emails), vec!["m1", "m2", "m3", "m5"]);
        assert_eq!(emails[0].to.len(), 0);
    }

    #[test]
    fn test_pagination() {
        let (store, id) = setup();
        let emails = list_emails(&store, &EmailFilter::account(id), Page::new(2, 1)).unwrap();
        assert_eq!(ids(&emails), vec!["m2", "m3"]);
    }

    #[test]
    fn test_label_filters() {
        let (store, id) = setup();
        let list = |label: &str| {
            ids(&list_emails(&store, &EmailFilter::account(id).label(label), Page::default()).unwrap())
        };
        assert_eq!(list("INBOX"), vec!["m1", "m2", "m3"]);
        assert_eq!(list("Label_1"), vec!["m3"]);
        assert_eq!(list("UNREAD"), vec!["m1", "m3"]);
        assert_eq!(list("STARRED"), vec!["m5"]);
        assert_eq!(list("TRASH"), vec!["m4"]);
    }

    #[test]
    fn test_sender_and_topic_filters() {
        let (store, id) = setup();
        let by_sender =
            list_emails(&store, &EmailFilter::account(id).sender("BOB@b.com"), Page::default())
                .unwrap();
        assert_eq!(ids(&by_sender), vec!["m3"]);

        let by_topic =
            list_emails(&store, &EmailFilter::account(id).topic("RE: project x"), Page::default())
                .unwrap();
        assert_eq!(ids(&by_topic), vec!["m1", "m2"]);
    }

    #[test]
    fn test_time_buckets() {
        let (store, id) = setup();
        let list = |bucket| {
            ids(&list_emails(&store, &EmailFilter::account(id).bucket(bucket), Page::default())
                .unwrap())
        };
        assert_eq!(list(TimeBucket::Today), vec!["m1"]);
        assert_eq!(list(TimeBucket::ThisWeek), vec!["m3"]);
        assert_eq!(list(TimeBucket::Older), vec!["m5"]);
    }

    #[test]
    fn test_count_unread() {
        let (store, id) = setup();
        assert_eq!(count_unread(&store, &EmailFilter::account(id)).unwrap(), 2);
        assert_eq!(
            count_unread(&store, &EmailFilter::account(id).label("Label_1")).unwrap(),
            1
        );
    }

    #[test]
    fn test_bucket_ranges_are_contiguous() {
        let now = Utc::now();
        let order = [
            TimeBucket::Older,
            TimeBucket::ThisMonth,
            TimeBucket::ThisWeek,
            TimeBucket::Yesterday,
            TimeBucket::Today,
        ];
        for pair in order.windows(2) {
            assert_eq!(pair[0].range(now).1, pair[1].range(now).0);
        }
    }
}
