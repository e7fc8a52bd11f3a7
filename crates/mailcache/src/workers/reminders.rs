//! Surfacing reminders when they come due

use std::sync::Arc;

use anyhow::Result;
use chrono::{DateTime, Duration, Utc};

use crate::events::{EventBus, MailEvent};
use crate::models::Reminder;
use crate::storage::SqliteMailStore;

/// Where due reminders go
pub trait ReminderSink: Send + Sync {
    fn surface(&self, reminder: &Reminder) -> Result<()>;
}

/// Publishes reminders as `MailEvent::ReminderDue`
pub struct EventReminderSink {
    events: Arc<EventBus>,
}

impl EventReminderSink {
    pub fn new(events: Arc<EventBus>) -> Self {
        Self { events }
    }
}

impl ReminderSink for EventReminderSink {
    fn surface(&self, reminder: &Reminder) -> Result<()> {
        self.events.emit(MailEvent::ReminderDue(reminder.clone()));
        Ok(())
    }
}

pub struct ReminderWorker {
    store: Arc<SqliteMailStore>,
    sink: Arc<dyn ReminderSink>,
    stale_after: Duration,
}

impl ReminderWorker {
    pub fn new(store: Arc<SqliteMailStore>, sink: Arc<dyn ReminderSink>, stale_after: Duration) -> Self {
        Self {
            store,
            sink,
            stale_after,
        }
    }

    /// One pass; returns the number of reminders surfaced
    pub fn run_due(&self, now: DateTime<Utc>) -> Result<usize> {
        let mut surfaced = 0;

        // Claimed by a pass that never finished: surface once more, then drop
        let cutoff = super::stale_cutoff(now, self.stale_after);
        for reminder in self.store.recover_stale_reminders(cutoff)? {
            match self.sink.surface(&reminder) {
                Ok(()) => surfaced += 1,
                Err(e) => log::warn!("[DUE] Dropping stale reminder {}: {:#}", reminder.id, e),
            }
        }

        for reminder in self.store.find_due_reminders(now)? {
            if !self.store.claim_reminder(reminder.id, now)? {
                continue;
            }
            match self.sink.surface(&reminder) {
                Ok(()) => {
                    self.store.complete_reminder(reminder.id)?;
                    surfaced += 1;
                }
                // Left claimed; stale recovery picks it up
                Err(e) => log::warn!("[DUE] Reminder {} not surfaced: {:#}", reminder.id, e),
            }
        }
        Ok(surfaced)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingSink {
        seen: Mutex<Vec<i64>>,
        fail: Mutex<bool>,
    }

    impl ReminderSink for RecordingSink {
        fn surface(&self, reminder: &Reminder) -> Result<()> {
            if *self.fail.lock().unwrap() {
                anyhow::bail!("sink offline");
            }
            self.seen.lock().unwrap().push(reminder.id);
            Ok(())
        }
    }

    fn setup() -> (Arc<SqliteMailStore>, Arc<RecordingSink>, ReminderWorker, i64) {
        let store = Arc::new(SqliteMailStore::open_in_memory().unwrap());
        let account = store.create_account("me@example.com", None).unwrap();
        let sink = Arc::new(RecordingSink::default());
        let worker = ReminderWorker::new(store.clone(), sink.clone(), Duration::minutes(15));
        (store, sink, worker, account.id)
    }

    #[test]
    fn test_due_reminders_fire_once() {
        let (store, sink, worker, account_id) = setup();
        let now = Utc::now();
        let due = store
            .create_reminder(account_id, None, "call back", now - Duration::minutes(1))
            .unwrap();
        store
            .create_reminder(account_id, None, "later", now + Duration::hours(1))
            .unwrap();

        assert_eq!(worker.run_due(now).unwrap(), 1);
        assert_eq!(worker.run_due(now).unwrap(), 0);
        assert_eq!(*sink.seen.lock().unwrap(), vec![due.id]);
        assert_eq!(store.list_reminders(account_id).unwrap().len(), 1);
    }

    #[test]
    fn test_failed_surface_is_recovered_later() {
        let (store, sink, worker, account_id) = setup();
        let now = Utc::now();
        let reminder = store
            .create_reminder(account_id, None, "note", now - Duration::minutes(1))
            .unwrap();

        *sink.fail.lock().unwrap() = true;
        assert_eq!(worker.run_due(now).unwrap(), 0);
        *sink.fail.lock().unwrap() = false;

        // Not yet stale
        assert_eq!(worker.run_due(now + Duration::minutes(1)).unwrap(), 0);
        assert_eq!(worker.run_due(now + Duration::minutes(30)).unwrap(), 1);
        assert_eq!(*sink.seen.lock().unwrap(), vec![reminder.id]);
        assert!(store.list_reminders(account_id).unwrap().is_empty());
    }

    #[test]
    fn test_event_sink_emits() {
        let events = Arc::new(EventBus::new());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let recorder = seen.clone();
        events.subscribe(move |event: &MailEvent| recorder.lock().unwrap().push(event.clone()));

        let store = Arc::new(SqliteMailStore::open_in_memory().unwrap());
        let account = store.create_account("me@example.com", None).unwrap();
        let now = Utc::now();
        let reminder = store
            .create_reminder(account.id, None, "ping", now - Duration::seconds(1))
            .unwrap();
        let worker = ReminderWorker::new(
            store,
            Arc::new(EventReminderSink::new(events)),
            Duration::minutes(15),
        );

        worker.run_due(now).unwrap();
        let seen = seen.lock().unwrap();
        assert!(matches!(&seen[..], [MailEvent::ReminderDue(r)] if r.id == reminder.id));
    }
}
