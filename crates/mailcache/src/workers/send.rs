//! Sending scheduled emails once their time has come

use std::sync::Arc;
use std::time::SystemTime;

use anyhow::{Context, Result, anyhow};
use chrono::{DateTime, Duration, Utc};
use lettre::Message;
use lettre::message::Mailbox;
use lettre::message::header::ContentType;

use crate::credentials::CredentialStore;
use crate::events::{EventBus, MailEvent};
use crate::models::{Account, EmailAddress, ScheduledEmail};
use crate::provider::OutboundSender;
use crate::storage::SqliteMailStore;

pub struct ScheduledSendWorker {
    store: Arc<SqliteMailStore>,
    credentials: Arc<CredentialStore>,
    sender: Arc<dyn OutboundSender>,
    events: Arc<EventBus>,
    max_attempts: u32,
    stale_after: Duration,
}

impl ScheduledSendWorker {
    pub fn new(
        store: Arc<SqliteMailStore>,
        credentials: Arc<CredentialStore>,
        sender: Arc<dyn OutboundSender>,
        events: Arc<EventBus>,
        max_attempts: u32,
        stale_after: Duration,
    ) -> Self {
        Self {
            store,
            credentials,
            sender,
            events,
            max_attempts: max_attempts.max(1),
            stale_after,
        }
    }

    /// One pass: recover abandoned claims, then send everything due
    ///
    /// Returns the number of emails sent.
    pub fn run_due(&self, now: DateTime<Utc>) -> Result<usize> {
        self.store.recover_stale_scheduled(super::stale_cutoff(now, self.stale_after))?;

        let mut sent = 0;
        for item in self.store.find_due_scheduled(now)? {
            // Another worker got there first
            if !self.store.claim_scheduled(item.id, now)? {
                continue;
            }

            match self.send(&item) {
                Ok(()) => {
                    self.store.complete_scheduled(item.id)?;
                    log::info!("[DUE] Sent scheduled email {}", item.id);
                    self.events.emit(MailEvent::ScheduledEmailSent {
                        account_id: item.account_id,
                        scheduled_id: item.id,
                    });
                    sent += 1;
                }
                Err(e) => {
                    let status =
                        self.store
                            .release_scheduled(item.id, &format!("{:#}", e), self.max_attempts)?;
                    log::warn!(
                        "[DUE] Scheduled email {} failed (now {}): {:#}",
                        item.id,
                        status.as_str(),
                        e
                    );
                }
            }
        }
        Ok(sent)
    }

    fn send(&self, item: &ScheduledEmail) -> Result<()> {
        let account = self
            .store
            .get_account(item.account_id)?
            .ok_or_else(|| anyhow!("Account {} not found", item.account_id))?;
        let raw = build_message(&account, item)?;
        let token = self.credentials.get_valid_token(account.id)?;
        self.sender.send_raw(&token, &raw)?;
        Ok(())
    }
}

/// Render a scheduled email as an RFC 5322 message from `account`
pub fn build_message(account: &Account, item: &ScheduledEmail) -> Result<Vec<u8>> {
    let from = Mailbox::new(
        account.display_name.clone(),
        account
            .email
            .parse()
            .with_context(|| format!("Invalid sender address: {}", account.email))?,
    );

    let mut builder = Message::builder()
        .from(from)
        .subject(item.subject.clone())
        .date(SystemTime::from(item.send_at))
        .header(ContentType::TEXT_PLAIN);
    for to in &item.to {
        builder = builder.to(mailbox(to)?);
    }
    for cc in &item.cc {
        builder = builder.cc(mailbox(cc)?);
    }

    let message = builder
        .body(item.body.clone())
        .context("Failed to build message")?;
    Ok(message.formatted())
}

fn mailbox(address: &EmailAddress) -> Result<Mailbox> {
    let parsed = address
        .email
        .parse()
        .with_context(|| format!("Invalid recipient address: {}", address.email))?;
    Ok(Mailbox::new(address.name.clone(), parsed))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::TokenCipher;
    use crate::models::{DueStatus, NewScheduledEmail};
    use crate::provider::ProviderError;
    use crate::provider::api::TokenGrant;
    use crate::testing::FakeProvider;

    struct Fixture {
        provider: Arc<FakeProvider>,
        store: Arc<SqliteMailStore>,
        worker: ScheduledSendWorker,
        account_id: i64,
    }

    fn fixture() -> Fixture {
        let provider = Arc::new(FakeProvider::new());
        let store = Arc::new(SqliteMailStore::open_in_memory().unwrap());
        let account = store.create_account("me@example.com", Some("Me")).unwrap();
        let credentials = Arc::new(CredentialStore::new(
            store.clone(),
            TokenCipher::from_bytes([1; 32]),
            provider.clone(),
            Duration::seconds(300),
        ));
        credentials
            .store_token(
                account.id,
                &TokenGrant {
                    access_token: "token".into(),
                    refresh_token: Some("refresh".into()),
                    expires_in: Some(3600),
                },
            )
            .unwrap();
        let worker = ScheduledSendWorker::new(
            store.clone(),
            credentials,
            provider.clone(),
            Arc::new(EventBus::new()),
            2,
            Duration::minutes(15),
        );
        Fixture {
            provider,
            store,
            worker,
            account_id: account.id,
        }
    }

    fn schedule(f: &Fixture, send_at: DateTime<Utc>) -> ScheduledEmail {
        f.store
            .schedule_email(&NewScheduledEmail {
                account_id: f.account_id,
                to: vec![EmailAddress::with_name("Bob", "bob@example.com")],
                cc: vec![],
                subject: "Later".to_string(),
                body: "See you".to_string(),
                send_at,
            })
            .unwrap()
    }

    #[test]
    fn test_due_email_is_sent_once() {
        let f = fixture();
        let now = Utc::now();
        let item = schedule(&f, now - Duration::minutes(1));
        schedule(&f, now + Duration::hours(1));

        assert_eq!(f.worker.run_due(now).unwrap(), 1);
        assert_eq!(f.worker.run_due(now).unwrap(), 0);

        let sent = f.provider.sent();
        assert_eq!(sent.len(), 1);
        let text = String::from_utf8(sent[0].clone()).unwrap();
        assert!(text.contains("Subject: Later"));
        assert!(text.contains("bob@example.com"));
        assert!(f.store.get_scheduled_email(item.id).unwrap().is_none());
    }

    #[test]
    fn test_racing_workers_send_exactly_once() {
        let f = fixture();
        let now = Utc::now();
        for _ in 0..5 {
            schedule(&f, now - Duration::seconds(1));
        }

        let second = ScheduledSendWorker::new(
            f.store.clone(),
            f.worker.credentials.clone(),
            f.provider.clone(),
            Arc::new(EventBus::new()),
            2,
            Duration::minutes(15),
        );
        let total: usize = std::thread::scope(|s| {
            let a = s.spawn(|| f.worker.run_due(now).unwrap());
            let b = s.spawn(|| second.run_due(now).unwrap());
            a.join().unwrap() + b.join().unwrap()
        });

        assert_eq!(total, 5);
        assert_eq!(f.provider.sent().len(), 5);
    }

    #[test]
    fn test_failures_retry_then_give_up() {
        let f = fixture();
        let now = Utc::now();
        let item = schedule(&f, now - Duration::seconds(1));

        f.provider
            .inject_error(ProviderError::Transient("503".to_string()));
        assert_eq!(f.worker.run_due(now).unwrap(), 0);
        let stored = f.store.get_scheduled_email(item.id).unwrap().unwrap();
        assert_eq!(stored.status, DueStatus::Pending);
        assert_eq!(stored.attempts, 1);

        f.provider
            .inject_error(ProviderError::Transient("503".to_string()));
        f.worker.run_due(now).unwrap();
        let stored = f.store.get_scheduled_email(item.id).unwrap().unwrap();
        assert_eq!(stored.status, DueStatus::Failed);
        assert!(stored.last_error.is_some());

        // Failed items are not picked up again
        assert_eq!(f.worker.run_due(now).unwrap(), 0);
        assert!(f.provider.sent().is_empty());
    }

    #[test]
    fn test_stale_claim_is_failed_not_resent() {
        let f = fixture();
        let now = Utc::now();
        let item = schedule(&f, now - Duration::hours(2));
        assert!(f.store.claim_scheduled(item.id, now - Duration::hours(1)).unwrap());

        f.worker.run_due(now).unwrap();
        let stored = f.store.get_scheduled_email(item.id).unwrap().unwrap();
        assert_eq!(stored.status, DueStatus::Failed);
        assert!(f.provider.sent().is_empty());
    }

    #[test]
    fn test_build_message_rejects_bad_address() {
        let f = fixture();
        let mut item = schedule(&f, Utc::now());
        item.to = vec![EmailAddress::new("not an address")];
        let account = f.store.get_account(f.account_id).unwrap().unwrap();
        assert!(build_message(&account, &item).is_err());
    }
}
