//! Pulling changes from the provider
//!
//! With a cursor, the history feed is read from that point. Without one (or
//! when a full resync is forced, or the provider has expired the cursor) the
//! mailbox is listed from scratch. Either way the result is a flat list of
//! change events plus the cursor to store once they are applied.

use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::sync::Arc;
use std::time::Duration;

use crate::config::EngineConfig;
use crate::models::{ChangeEvent, RemoteEmail};
use crate::provider::{MailProvider, MessageFormat, ProviderError, normalize_message};

/// Attempts per message before a transient error fails the batch
const FETCH_ATTEMPTS: u32 = 3;

/// Changes since the last cursor
#[derive(Debug, Clone)]
pub struct DeltaBatch {
    pub changes: Vec<ChangeEvent>,
    pub new_cursor: String,
    /// The batch is a full listing rather than a history delta
    pub full_resync: bool,
    /// A full listing reached the end of the mailbox (was not capped), so
    /// local emails missing from it can be pruned
    pub complete: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Pending {
    Added,
    Changed,
    Deleted,
}

pub struct DeltaFetcher {
    provider: Arc<dyn MailProvider>,
    page_size: usize,
    max_initial_messages: usize,
    retry_delay: Duration,
}

impl DeltaFetcher {
    pub fn new(provider: Arc<dyn MailProvider>, config: &EngineConfig) -> Self {
        Self {
            provider,
            page_size: config.page_size.max(1),
            max_initial_messages: config.max_initial_messages,
            retry_delay: Duration::from_millis(100),
        }
    }

    /// Base delay between per-message retries
    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    pub fn fetch_changes(
        &self,
        token: &str,
        cursor: Option<&str>,
        full: bool,
    ) -> Result<DeltaBatch, ProviderError> {
        match cursor {
            Some(cursor) if !full => match self.incremental(token, cursor) {
                Err(ProviderError::CursorInvalid) => {
                    log::warn!(
                        "[SYNC] Cursor {} no longer valid, falling back to full listing",
                        cursor
                    );
                    self.full_listing(token)
                }
                result => result,
            },
            _ => self.full_listing(token),
        }
    }

    fn full_listing(&self, token: &str) -> Result<DeltaBatch, ProviderError> {
        // Captured before listing so mail arriving meanwhile is picked up by
        // the next incremental cycle
        let profile = self.provider.get_profile(token)?;

        let mut ids: Vec<String> = Vec::new();
        let mut page_token: Option<String> = None;
        let mut complete = false;
        while ids.len() < self.max_initial_messages {
            let remaining = self.max_initial_messages - ids.len();
            let page = self.provider.list_messages(
                token,
                self.page_size.min(remaining),
                page_token.as_deref(),
            )?;
            ids.extend(page.messages.unwrap_or_default().into_iter().map(|m| m.id));

            match page.next_page_token {
                Some(next) => page_token = Some(next),
                None => {
                    complete = true;
                    break;
                }
            }
        }
        ids.truncate(self.max_initial_messages);

        log::info!(
            "[SYNC] Full listing: {} messages{}",
            ids.len(),
            if complete { "" } else { " (capped)" }
        );

        let mut changes = Vec::with_capacity(ids.len());
        for id in &ids {
            // Gone between listing and fetch: not part of the mailbox any more
            if let Some(remote) = self.fetch_metadata(token, id)? {
                changes.push(ChangeEvent::Added(remote));
            }
        }

        Ok(DeltaBatch {
            changes,
            new_cursor: profile.history_id,
            full_resync: true,
            complete,
        })
    }

    fn incremental(&self, token: &str, cursor: &str) -> Result<DeltaBatch, ProviderError> {
        let mut order: Vec<String> = Vec::new();
        let mut pending: HashMap<String, Pending> = HashMap::new();
        let mut note = |id: &str, kind: Pending| {
            let entry = pending.entry(id.to_string());
            match entry {
                Entry::Occupied(mut e) => {
                    // A label change on a message added in this batch is still an add
                    let merged = match (*e.get(), kind) {
                        (Pending::Added, Pending::Changed) => Pending::Added,
                        (_, later) => later,
                    };
                    e.insert(merged);
                }
                Entry::Vacant(e) => {
                    order.push(id.to_string());
                    e.insert(kind);
                }
            }
        };

        let mut new_cursor = cursor.to_string();
        let mut page_token: Option<String> = None;
        loop {
            let page = self
                .provider
                .list_history(token, cursor, page_token.as_deref())?;

            for record in page.history.unwrap_or_default() {
                for added in record.messages_added.unwrap_or_default() {
                    note(&added.message.id, Pending::Added);
                }
                for change in record
                    .labels_added
                    .unwrap_or_default()
                    .into_iter()
                    .chain(record.labels_removed.unwrap_or_default())
                {
                    note(&change.message.id, Pending::Changed);
                }
                for deleted in record.messages_deleted.unwrap_or_default() {
                    note(&deleted.message.id, Pending::Deleted);
                }
            }

            if let Some(history_id) = page.history_id {
                new_cursor = history_id;
            }
            match page.next_page_token {
                Some(next) => page_token = Some(next),
                None => break,
            }
        }

        let mut changes = Vec::with_capacity(order.len());
        for id in order {
            let kind = pending.get(&id).copied().unwrap_or(Pending::Changed);
            let event = match kind {
                Pending::Deleted => ChangeEvent::Deleted(id),
                Pending::Added | Pending::Changed => match self.fetch_metadata(token, &id)? {
                    Some(remote) if kind == Pending::Added => ChangeEvent::Added(remote),
                    Some(remote) => ChangeEvent::Changed(remote),
                    None => ChangeEvent::Deleted(id),
                },
            };
            changes.push(event);
        }

        log::debug!(
            "[SYNC] History {} -> {}: {} changes",
            cursor,
            new_cursor,
            changes.len()
        );

        Ok(DeltaBatch {
            changes,
            new_cursor,
            full_resync: false,
            complete: false,
        })
    }

    /// Metadata for one message, `None` if the provider no longer has it
    ///
    /// Transient errors are retried with jittered exponential backoff.
    fn fetch_metadata(&self, token: &str, id: &str) -> Result<Option<RemoteEmail>, ProviderError> {
        let mut delay = self.retry_delay;
        let mut attempt = 1;
        let message = loop {
            match self.provider.get_message(token, id, MessageFormat::Metadata) {
                Ok(message) => break message,
                Err(ProviderError::NotFound) => return Ok(None),
                Err(ProviderError::Transient(reason)) if attempt < FETCH_ATTEMPTS => {
                    log::debug!(
                        "[SYNC] Fetch of {} failed (attempt {}): {}",
                        id,
                        attempt,
                        reason
                    );
                    std::thread::sleep(delay + Duration::from_millis(rand_jitter()));
                    delay *= 2;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        };

        match normalize_message(message) {
            Ok(remote) => Ok(Some(remote)),
            Err(e) => {
                log::warn!("[SYNC] Skipping message {}: {:#}", id, e);
                Ok(None)
            }
        }
    }
}

/// Generate a random jitter value (0-100ms)
fn rand_jitter() -> u64 {
    use std::collections::hash_map::RandomState;
    use std::hash::{BuildHasher, Hasher};

    let hasher = RandomState::new().build_hasher();
    hasher.finish() % 100
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeProvider;

    fn fetcher(provider: Arc<FakeProvider>, max: usize) -> DeltaFetcher {
        let config = EngineConfig {
            page_size: 2,
            max_initial_messages: max,
            ..Default::default()
        };
        DeltaFetcher::new(provider, &config).with_retry_delay(Duration::from_millis(1))
    }

    fn ids(batch: &DeltaBatch) -> Vec<(&'static str, String)> {
        batch
            .changes
            .iter()
            .map(|c| match c {
                ChangeEvent::Added(r) => ("added", r.remote_id.clone()),
                ChangeEvent::Changed(r) => ("changed", r.remote_id.clone()),
                ChangeEvent::Deleted(id) => ("deleted", id.clone()),
            })
            .collect()
    }

    #[test]
    fn test_full_listing_pages_and_captures_cursor() {
        let provider = Arc::new(FakeProvider::new());
        for i in 0..5 {
            provider.add_message(&format!("m{}", i), "a@b.com", "Hi", &["INBOX"]);
        }

        let batch = fetcher(provider.clone(), 100).fetch_changes("t", None, false).unwrap();
        assert_eq!(batch.changes.len(), 5);
        assert!(batch.full_resync);
        assert!(batch.complete);
        assert_eq!(batch.new_cursor, "105");
    }

    #[test]
    fn test_full_listing_respects_cap() {
        let provider = Arc::new(FakeProvider::new());
        for i in 0..5 {
            provider.add_message(&format!("m{}", i), "a@b.com", "Hi", &[]);
        }

        let batch = fetcher(provider, 3).fetch_changes("t", None, false).unwrap();
        assert_eq!(batch.changes.len(), 3);
        assert!(!batch.complete);
    }

    #[test]
    fn test_incremental_collapses_duplicates() {
        let provider = Arc::new(FakeProvider::new());
        provider.add_message("old", "a@b.com", "Old", &["INBOX"]);
        let cursor = "101";

        provider.add_message("m1", "a@b.com", "New", &["INBOX", "UNREAD"]);
        provider.set_labels("m1", &["INBOX"]);
        provider.set_labels("old", &["INBOX", "STARRED"]);
        provider.add_message("gone", "a@b.com", "Short-lived", &[]);
        provider.delete_message("gone");

        let batch = fetcher(provider, 100)
            .fetch_changes("t", Some(cursor), false)
            .unwrap();
        assert!(!batch.full_resync);
        assert_eq!(batch.new_cursor, "106");
        assert_eq!(
            ids(&batch),
            vec![
                ("added", "m1".to_string()),
                ("changed", "old".to_string()),
                ("deleted", "gone".to_string()),
            ]
        );
    }

    #[test]
    fn test_missing_message_becomes_deleted() {
        let provider = Arc::new(FakeProvider::new());
        // History mentions a message the provider no longer has
        provider.set_labels("ghost", &["INBOX"]);

        let batch = fetcher(provider, 100).fetch_changes("t", Some("100"), false).unwrap();
        assert_eq!(ids(&batch), vec![("deleted", "ghost".to_string())]);
    }

    #[test]
    fn test_invalid_cursor_falls_back_to_full_listing() {
        let provider = Arc::new(FakeProvider::new());
        provider.add_message("m1", "a@b.com", "Hi", &[]);
        provider.expire_history();

        let batch = fetcher(provider, 100).fetch_changes("t", Some("100"), false).unwrap();
        assert!(batch.full_resync);
        assert_eq!(ids(&batch), vec![("added", "m1".to_string())]);
    }

    #[test]
    fn test_transient_fetch_is_retried() {
        let provider = Arc::new(FakeProvider::new());
        provider.add_message("m1", "a@b.com", "Hi", &[]);
        provider.fail_once("m1");

        let batch = fetcher(provider.clone(), 100).fetch_changes("t", None, false).unwrap();
        assert_eq!(batch.changes.len(), 1);
        assert_eq!(provider.get_message_calls(), 2);
    }

    #[test]
    fn test_rate_limit_propagates() {
        let provider = Arc::new(FakeProvider::new());
        provider.inject_error(ProviderError::RateLimited {
            retry_after: Some(Duration::from_secs(30)),
        });

        let result = fetcher(provider, 100).fetch_changes("t", Some("100"), false);
        assert_eq!(
            result.unwrap_err(),
            ProviderError::RateLimited {
                retry_after: Some(Duration::from_secs(30))
            }
        );
    }
}
