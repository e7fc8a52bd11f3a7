//! Change notifications for whatever sits on top of the engine
//!
//! The engine never depends on a UI type; consumers subscribe a listener and
//! re-read the store when something they show has changed.

use std::sync::{Arc, RwLock};

use crate::models::{AccountId, Reminder};
use crate::sync::AccountSyncState;

/// Something a consumer may want to refresh for
#[derive(Debug, Clone, PartialEq)]
pub enum MailEvent {
    /// Emails of an account were added, updated or removed
    EmailsChanged { account_id: AccountId },
    /// The scheduler moved an account to a new state
    AccountStatusChanged {
        account_id: AccountId,
        state: AccountSyncState,
        last_error: Option<String>,
    },
    ReminderDue(Reminder),
    ScheduledEmailSent { account_id: AccountId, scheduled_id: i64 },
}

/// Receives engine events; called on the thread that produced the event
pub trait EventListener: Send + Sync {
    fn on_event(&self, event: &MailEvent);
}

impl<F> EventListener for F
where
    F: Fn(&MailEvent) + Send + Sync,
{
    fn on_event(&self, event: &MailEvent) {
        self(event)
    }
}

#[derive(Default)]
pub struct EventBus {
    listeners: RwLock<Vec<Arc<dyn EventListener>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, listener: impl EventListener + 'static) {
        match self.listeners.write() {
            Ok(mut listeners) => listeners.push(Arc::new(listener)),
            Err(_) => log::error!("[EVENTS] Listener registry poisoned, subscription dropped"),
        }
    }

    pub fn emit(&self, event: MailEvent) {
        // Snapshot so a listener may subscribe without deadlocking
        let listeners = match self.listeners.read() {
            Ok(listeners) => listeners.clone(),
            Err(_) => return,
        };
        for listener in listeners {
            listener.on_event(&event);
        }
    }
}
