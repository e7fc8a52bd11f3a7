//! Engine facade
//!
//! Wires storage, credentials, the sync scheduler and the background
//! workers together and exposes the operations a client needs. Consumers
//! learn about changes through `subscribe` and read back through the query
//! methods; the engine never calls into a UI.

use std::sync::{Arc, Mutex};

use anyhow::{Result, anyhow};
use chrono::{DateTime, Utc};
use tokio::runtime::Handle;
use tokio::task::JoinHandle;

use crate::actions::ActionHandler;
use crate::config::EngineConfig;
use crate::credentials::{CredentialStore, TokenCipher};
use crate::derived::newsletter::NewsletterPolicy;
use crate::events::{EventBus, EventListener};
use crate::models::{
    Account, AccountId, CategorizationRule, Category, CategoryId, Email, EmailBody, EmailId,
    NewRule, NewScheduledEmail, NewsletterSender, Reminder, RuleError, ScheduledEmail,
    SenderGroup, Topic,
};
use crate::provider::api::TokenGrant;
use crate::provider::{MailProvider, OutboundSender};
use crate::query::{self, EmailFilter, Page};
use crate::storage::{OrphanReport, SqliteMailStore};
use crate::sync::{
    AccountStatus, BackoffPolicy, DeltaFetcher, SyncEngine, SyncRequest, SyncScheduler,
};
use crate::workers::{
    EventReminderSink, NewsletterScanner, ReminderSink, ReminderWorker, ScheduledSendWorker,
    spawn_poller,
};

pub struct Engine {
    config: EngineConfig,
    store: Arc<SqliteMailStore>,
    provider: Arc<dyn MailProvider>,
    credentials: Arc<CredentialStore>,
    events: Arc<EventBus>,
    scheduler: SyncScheduler,
    actions: ActionHandler,
    send_worker: Arc<ScheduledSendWorker>,
    reminder_worker: Arc<ReminderWorker>,
    newsletter_scanner: Arc<NewsletterScanner>,
    runtime: Handle,
    background: Mutex<Vec<JoinHandle<()>>>,
}

impl Engine {
    /// Build an engine around one client that both reads and sends mail
    ///
    /// Nothing runs until `start` is called.
    pub fn new<P>(
        config: EngineConfig,
        store: Arc<SqliteMailStore>,
        cipher: TokenCipher,
        client: Arc<P>,
        runtime: Handle,
    ) -> Self
    where
        P: MailProvider + OutboundSender + 'static,
    {
        let events = Arc::new(EventBus::new());
        let sink: Arc<dyn ReminderSink> = Arc::new(EventReminderSink::new(events.clone()));
        Self::with_reminder_sink(config, store, cipher, client, runtime, events, sink)
    }

    /// Like `new`, delivering due reminders to `sink` instead of the event bus
    pub fn with_reminder_sink<P>(
        config: EngineConfig,
        store: Arc<SqliteMailStore>,
        cipher: TokenCipher,
        client: Arc<P>,
        runtime: Handle,
        events: Arc<EventBus>,
        sink: Arc<dyn ReminderSink>,
    ) -> Self
    where
        P: MailProvider + OutboundSender + 'static,
    {
        let provider: Arc<dyn MailProvider> = client.clone();
        let sender: Arc<dyn OutboundSender> = client;

        let credentials = Arc::new(CredentialStore::new(
            store.clone(),
            cipher,
            provider.clone(),
            config.token_refresh_skew(),
        ));
        let engine = SyncEngine::new(
            store.clone(),
            credentials.clone(),
            provider.clone(),
            DeltaFetcher::new(provider.clone(), &config),
            events.clone(),
        );
        let scheduler = SyncScheduler::new(
            Arc::new(engine),
            store.clone(),
            events.clone(),
            BackoffPolicy::from(&config),
            config.sync_interval(),
            runtime.clone(),
        );

        let send_worker = Arc::new(ScheduledSendWorker::new(
            store.clone(),
            credentials.clone(),
            sender,
            events.clone(),
            config.scheduled_send_max_attempts,
            config.stale_claim_age(),
        ));
        let reminder_worker = Arc::new(ReminderWorker::new(
            store.clone(),
            sink,
            config.stale_claim_age(),
        ));
        let newsletter_scanner = Arc::new(NewsletterScanner::new(
            store.clone(),
            NewsletterPolicy::from(&config),
        ));

        Self {
            actions: ActionHandler::new(store.clone(), events.clone()),
            config,
            store,
            provider,
            credentials,
            events,
            scheduler,
            send_worker,
            reminder_worker,
            newsletter_scanner,
            runtime,
            background: Mutex::new(Vec::new()),
        }
    }

    /// Register every stored account and start the periodic loops
    pub fn start(&self) -> Result<()> {
        for account in self.store.list_accounts()? {
            self.scheduler.register_account(account.id)?;
        }

        let send_worker = self.send_worker.clone();
        let reminder_worker = self.reminder_worker.clone();
        let newsletter_scanner = self.newsletter_scanner.clone();
        let handles = vec![
            self.scheduler.start_periodic(),
            spawn_poller(
                &self.runtime,
                "scheduled-send",
                self.config.due_poll_interval(),
                move || send_worker.run_due(Utc::now()),
            ),
            spawn_poller(
                &self.runtime,
                "reminders",
                self.config.due_poll_interval(),
                move || reminder_worker.run_due(Utc::now()),
            ),
            spawn_poller(
                &self.runtime,
                "newsletters",
                self.config.newsletter_scan_interval(),
                move || newsletter_scanner.run(Utc::now()),
            ),
        ];

        self.background
            .lock()
            .map_err(|_| anyhow!("Background task list poisoned"))?
            .extend(handles);
        log::info!("[SCHED] Engine started");
        Ok(())
    }

    /// Stop the periodic loops; in-flight sync cycles still commit
    pub fn shutdown(&self) {
        if let Ok(mut handles) = self.background.lock() {
            for handle in handles.drain(..) {
                handle.abort();
            }
        }
        log::info!("[SCHED] Engine stopped");
    }

    pub fn subscribe(&self, listener: impl EventListener + 'static) {
        self.events.subscribe(listener);
    }

    pub fn store(&self) -> &Arc<SqliteMailStore> {
        &self.store
    }

    pub fn actions(&self) -> &ActionHandler {
        &self.actions
    }

    // ========================================================================
    // Accounts
    // ========================================================================

    /// Add (or re-add) an account after a completed OAuth handshake and
    /// start its first sync
    pub fn add_account(
        &self,
        email: &str,
        display_name: Option<&str>,
        grant: &TokenGrant,
    ) -> Result<Account> {
        let account = self.store.create_account(email, display_name)?;
        self.credentials.store_token(account.id, grant)?;
        self.scheduler.register_account(account.id)?;
        self.scheduler.reauthenticated(account.id)?;
        Ok(account)
    }

    /// Store fresh tokens for an account that lost authorization
    pub fn reauthenticate(&self, account_id: AccountId, grant: &TokenGrant) -> Result<SyncRequest> {
        self.credentials.store_token(account_id, grant)?;
        self.scheduler.register_account(account_id)?;
        self.scheduler.reauthenticated(account_id)
    }

    pub fn list_accounts(&self) -> Result<Vec<Account>> {
        self.store.list_accounts()
    }

    /// Stop syncing an account and delete everything it owns
    pub fn remove_account(&self, account_id: AccountId) -> Result<bool> {
        self.scheduler.remove_account(account_id)?;
        self.store.delete_account(account_id)
    }

    // ========================================================================
    // Sync
    // ========================================================================

    pub fn sync(&self, account_id: AccountId, full: bool) -> Result<SyncRequest> {
        self.scheduler.request_sync(account_id, full)
    }

    pub fn status(&self, account_id: AccountId) -> Result<Option<AccountStatus>> {
        self.scheduler.status(account_id)
    }

    pub fn statuses(&self) -> Result<Vec<AccountStatus>> {
        self.scheduler.statuses()
    }

    // ========================================================================
    // Queries
    // ========================================================================

    pub fn list_emails(&self, filter: &EmailFilter, page: Page) -> Result<Vec<Email>> {
        query::list_emails(&self.store, filter, page)
    }

    pub fn search_emails(&self, account_id: AccountId, query: &str, page: Page) -> Result<Vec<Email>> {
        query::search_emails(&self.store, account_id, query, page)
    }

    pub fn get_email(&self, email_id: EmailId) -> Result<Option<Email>> {
        query::get_email(&self.store, email_id)
    }

    /// Blocking: may call the provider on first access
    pub fn fetch_body(&self, email_id: EmailId) -> Result<EmailBody> {
        query::fetch_body(&self.store, &self.credentials, self.provider.as_ref(), email_id)
    }

    pub fn count_unread(&self, filter: &EmailFilter) -> Result<usize> {
        query::count_unread(&self.store, filter)
    }

    pub fn list_sender_groups(&self, account_id: AccountId) -> Result<Vec<SenderGroup>> {
        self.store.list_sender_groups(account_id)
    }

    pub fn list_topics(&self, account_id: AccountId) -> Result<Vec<Topic>> {
        self.store.list_topics(account_id)
    }

    pub fn list_newsletter_senders(&self, account_id: AccountId) -> Result<Vec<NewsletterSender>> {
        self.store.list_newsletter_senders(account_id)
    }

    // ========================================================================
    // Newsletters
    // ========================================================================

    pub fn mute_newsletter(&self, account_id: AccountId, sender_email: &str) -> Result<bool> {
        self.store.mute_newsletter(account_id, sender_email)
    }

    pub fn unmute_newsletter(&self, account_id: AccountId, sender_email: &str) -> Result<bool> {
        self.store.unmute_newsletter(account_id, sender_email)
    }

    pub fn remove_newsletter(&self, account_id: AccountId, sender_email: &str) -> Result<bool> {
        self.store.remove_newsletter(account_id, sender_email)
    }

    // ========================================================================
    // Categories
    // ========================================================================

    pub fn list_categories(&self, account_id: AccountId) -> Result<Vec<Category>> {
        self.store.list_categories(account_id)
    }

    pub fn create_category(
        &self,
        account_id: AccountId,
        name: &str,
        color: Option<&str>,
        icon: Option<&str>,
    ) -> Result<Category> {
        self.store.create_category(account_id, name, color, icon)
    }

    pub fn delete_category(&self, category_id: CategoryId) -> Result<bool> {
        self.store.delete_category(category_id)
    }

    /// Add a rule and re-evaluate existing mail against the new rule set
    pub fn add_rule(&self, account_id: AccountId, rule: &NewRule) -> Result<CategorizationRule> {
        let rule = self.store.add_rule(account_id, rule)?;
        self.store.recategorize_all(account_id)?;
        Ok(rule)
    }

    /// Import rules from settings JSON; invalid entries are returned, not stored
    pub fn import_rules(
        &self,
        account_id: AccountId,
        values: &[serde_json::Value],
    ) -> Result<(Vec<CategorizationRule>, Vec<RuleError>)> {
        let imported = self.store.import_rules(account_id, values)?;
        self.store.recategorize_all(account_id)?;
        Ok(imported)
    }

    pub fn delete_rule(&self, account_id: AccountId, rule_id: i64) -> Result<bool> {
        let deleted = self.store.delete_rule(rule_id)?;
        if deleted {
            self.store.recategorize_all(account_id)?;
        }
        Ok(deleted)
    }

    // ========================================================================
    // Scheduled emails and reminders
    // ========================================================================

    pub fn schedule_email(&self, email: &NewScheduledEmail) -> Result<ScheduledEmail> {
        self.store.schedule_email(email)
    }

    pub fn cancel_scheduled_email(&self, id: i64) -> Result<bool> {
        self.store.cancel_scheduled_email(id)
    }

    pub fn list_scheduled_emails(&self, account_id: AccountId) -> Result<Vec<ScheduledEmail>> {
        self.store.list_scheduled_emails(account_id)
    }

    pub fn create_reminder(
        &self,
        account_id: AccountId,
        email_id: Option<EmailId>,
        note: &str,
        remind_at: DateTime<Utc>,
    ) -> Result<Reminder> {
        self.store.create_reminder(account_id, email_id, note, remind_at)
    }

    pub fn cancel_reminder(&self, id: i64) -> Result<bool> {
        self.store.cancel_reminder(id)
    }

    pub fn list_reminders(&self, account_id: AccountId) -> Result<Vec<Reminder>> {
        self.store.list_reminders(account_id)
    }

    // ========================================================================
    // Maintenance
    // ========================================================================

    pub fn vacuum(&self) -> Result<()> {
        self.store.vacuum()
    }

    pub fn delete_orphaned_records(&self) -> Result<OrphanReport> {
        self.store.delete_orphaned_records()
    }

    pub fn delete_emails_older_than(&self, account_id: AccountId, days: i64) -> Result<usize> {
        self.store
            .delete_emails_older_than(account_id, days, Utc::now())
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.shutdown();
    }
}
