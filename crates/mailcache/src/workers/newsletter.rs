//! Periodic newsletter detection over every account

use std::sync::Arc;

use anyhow::Result;
use chrono::{DateTime, Utc};

use crate::derived::newsletter::{NewsletterPolicy, detect_newsletters};
use crate::storage::SqliteMailStore;

pub struct NewsletterScanner {
    store: Arc<SqliteMailStore>,
    policy: NewsletterPolicy,
}

impl NewsletterScanner {
    pub fn new(store: Arc<SqliteMailStore>, policy: NewsletterPolicy) -> Self {
        Self { store, policy }
    }

    /// Scan all accounts; one failing account does not stop the others
    pub fn run(&self, now: DateTime<Utc>) -> Result<usize> {
        let mut detected = 0;
        for account in self.store.list_accounts()? {
            match detect_newsletters(&self.store, account.id, now, &self.policy) {
                Ok(n) => detected += n,
                Err(e) => log::warn!(
                    "[DUE] Newsletter scan of account {} failed: {:#}",
                    account.id,
                    e
                ),
            }
        }
        Ok(detected)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ChangeEvent, EmailAddress, RemoteEmail};

    #[test]
    fn test_scans_every_account() {
        let store = Arc::new(SqliteMailStore::open_in_memory().unwrap());
        let now = Utc::now();
        for email in ["a@example.com", "b@example.com"] {
            let account = store.create_account(email, None).unwrap();
            let changes: Vec<ChangeEvent> = (0..3)
                .map(|i| {
                    ChangeEvent::Added(
                        RemoteEmail::builder(format!("m{}", i), format!("t{}", i))
                            .from(EmailAddress::new("news@shop.com"))
                            .subject("Deals")
                            .received_at(now)
                            .list_unsubscribe(true)
                            .build(),
                    )
                })
                .collect();
            store.apply_changes(account.id, &changes, "1").unwrap();
        }

        let scanner = NewsletterScanner::new(
            store.clone(),
            NewsletterPolicy {
                window_days: 30,
                min_messages: 3,
                bulk_ratio: 0.5,
            },
        );
        assert_eq!(scanner.run(now).unwrap(), 2);
    }
}
