//! Per-account sync state machine
//!
//! Every registered account has a slot in the registry. A slot moves
//! `Idle -> Syncing -> Idle` on success, `Syncing -> Backoff -> Idle` after a
//! retryable failure and `Syncing -> Unauthenticated` when the refresh token
//! is gone. Only an `Idle` slot starts a cycle, which is what keeps cycles
//! for one account strictly sequential.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use anyhow::{Result, anyhow};
use chrono::{DateTime, Utc};
use tokio::runtime::Handle;
use tokio::task::JoinHandle;

use super::backoff::BackoffPolicy;
use super::engine::{SyncError, SyncReport, SyncRunner};
use crate::events::{EventBus, MailEvent};
use crate::models::{AccountId, AuthState};
use crate::storage::SqliteMailStore;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AccountSyncState {
    Idle,
    Syncing,
    /// Waiting out a failure; requests before `until` are deferred
    Backoff { until: DateTime<Utc>, attempt: u32 },
    /// Terminal until the user signs in again
    Unauthenticated,
}

/// Outcome of `request_sync`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncRequest {
    Started,
    /// A cycle is already running; this request adds nothing
    Coalesced,
    Deferred { until: DateTime<Utc> },
    Unauthenticated,
    UnknownAccount,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AccountStatus {
    pub account_id: AccountId,
    pub state: AccountSyncState,
    pub last_error: Option<String>,
}

struct AccountSlot {
    state: AccountSyncState,
    /// Consecutive failed cycles
    failures: u32,
    last_error: Option<String>,
}

impl AccountSlot {
    fn new(state: AccountSyncState) -> Self {
        Self {
            state,
            failures: 0,
            last_error: None,
        }
    }
}

struct Inner {
    runner: Arc<dyn SyncRunner>,
    store: Arc<SqliteMailStore>,
    events: Arc<EventBus>,
    backoff: BackoffPolicy,
    interval: Duration,
    runtime: Handle,
    registry: Mutex<HashMap<AccountId, AccountSlot>>,
}

/// Schedules sync cycles; cheap to clone
#[derive(Clone)]
pub struct SyncScheduler {
    inner: Arc<Inner>,
}

impl SyncScheduler {
    pub fn new(
        runner: Arc<dyn SyncRunner>,
        store: Arc<SqliteMailStore>,
        events: Arc<EventBus>,
        backoff: BackoffPolicy,
        interval: Duration,
        runtime: Handle,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                runner,
                store,
                events,
                backoff,
                interval,
                runtime,
                registry: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Add an account to the registry; an already registered account is left alone
    pub fn register_account(&self, account_id: AccountId) -> Result<()> {
        let account = self
            .inner
            .store
            .get_account(account_id)?
            .ok_or_else(|| anyhow!("Account {} not found", account_id))?;
        let state = match account.auth_state {
            AuthState::Active => AccountSyncState::Idle,
            AuthState::Unauthenticated => AccountSyncState::Unauthenticated,
        };

        let mut registry = self.inner.lock()?;
        registry.entry(account_id).or_insert_with(|| {
            log::debug!("[SCHED] Registered account {} ({:?})", account_id, state);
            AccountSlot::new(state)
        });
        Ok(())
    }

    /// Stop scheduling an account. A cycle already running still commits.
    pub fn remove_account(&self, account_id: AccountId) -> Result<bool> {
        let removed = self.inner.lock()?.remove(&account_id).is_some();
        if removed {
            log::info!("[SCHED] Removed account {}", account_id);
        }
        Ok(removed)
    }

    pub fn request_sync(&self, account_id: AccountId, full: bool) -> Result<SyncRequest> {
        Inner::request(&self.inner, account_id, full)
    }

    /// Leave the terminal state after new tokens were stored, and sync
    pub fn reauthenticated(&self, account_id: AccountId) -> Result<SyncRequest> {
        {
            let mut registry = self.inner.lock()?;
            let Some(slot) = registry.get_mut(&account_id) else {
                return Ok(SyncRequest::UnknownAccount);
            };
            if slot.state == AccountSyncState::Unauthenticated {
                *slot = AccountSlot::new(AccountSyncState::Idle);
            }
        }
        self.request_sync(account_id, false)
    }

    pub fn status(&self, account_id: AccountId) -> Result<Option<AccountStatus>> {
        let registry = self.inner.lock()?;
        Ok(registry.get(&account_id).map(|slot| AccountStatus {
            account_id,
            state: slot.state.clone(),
            last_error: slot.last_error.clone(),
        }))
    }

    pub fn statuses(&self) -> Result<Vec<AccountStatus>> {
        let registry = self.inner.lock()?;
        let mut statuses: Vec<AccountStatus> = registry
            .iter()
            .map(|(account_id, slot)| AccountStatus {
                account_id: *account_id,
                state: slot.state.clone(),
                last_error: slot.last_error.clone(),
            })
            .collect();
        statuses.sort_by_key(|s| s.account_id);
        Ok(statuses)
    }

    /// Request an incremental sync of every idle account on each tick,
    /// starting immediately
    pub fn start_periodic(&self) -> JoinHandle<()> {
        let inner = self.inner.clone();
        self.inner.runtime.spawn(async move {
            let period = inner.interval.max(Duration::from_millis(1));
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                let idle: Vec<AccountId> = match inner.lock() {
                    Ok(registry) => registry
                        .iter()
                        .filter(|(_, slot)| slot.state == AccountSyncState::Idle)
                        .map(|(id, _)| *id)
                        .collect(),
                    Err(e) => {
                        log::error!("[SCHED] {}", e);
                        continue;
                    }
                };
                for account_id in idle {
                    if let Err(e) = Inner::request(&inner, account_id, false) {
                        log::error!("[SCHED] Periodic sync of {} failed: {}", account_id, e);
                    }
                }
            }
        })
    }
}

impl Inner {
    fn lock(&self) -> Result<MutexGuard<'_, HashMap<AccountId, AccountSlot>>> {
        self.registry
            .lock()
            .map_err(|_| anyhow!("Scheduler registry lock poisoned"))
    }

    fn request(inner: &Arc<Inner>, account_id: AccountId, full: bool) -> Result<SyncRequest> {
        let mut registry = inner.lock()?;
        let Some(slot) = registry.get_mut(&account_id) else {
            return Ok(SyncRequest::UnknownAccount);
        };

        let request = match &slot.state {
            AccountSyncState::Syncing => SyncRequest::Coalesced,
            AccountSyncState::Backoff { until, .. } => SyncRequest::Deferred { until: *until },
            AccountSyncState::Unauthenticated => SyncRequest::Unauthenticated,
            AccountSyncState::Idle => {
                slot.state = AccountSyncState::Syncing;
                SyncRequest::Started
            }
        };
        let last_error = slot.last_error.clone();
        drop(registry);

        if request == SyncRequest::Started {
            inner.events.emit(MailEvent::AccountStatusChanged {
                account_id,
                state: AccountSyncState::Syncing,
                last_error,
            });
            Inner::spawn_cycle(inner, account_id, full);
        } else {
            log::debug!("[SCHED] Sync of account {}: {:?}", account_id, request);
        }
        Ok(request)
    }

    fn spawn_cycle(inner: &Arc<Inner>, account_id: AccountId, full: bool) {
        let inner = inner.clone();
        let runtime = inner.runtime.clone();
        runtime.spawn(async move {
            let runner = inner.runner.clone();
            let result =
                match tokio::task::spawn_blocking(move || runner.run_cycle(account_id, full)).await
                {
                    Ok(result) => result,
                    Err(e) => Err(SyncError::Local(anyhow!("Sync task failed: {}", e))),
                };
            Inner::finish(&inner, account_id, result);
        });
    }

    fn finish(inner: &Arc<Inner>, account_id: AccountId, result: Result<SyncReport, SyncError>) {
        if let Err(e) = &result {
            log::warn!("[SCHED] Sync of account {} failed: {}", account_id, e);
            if let Err(store_err) = inner
                .store
                .record_sync_error(account_id, &e.to_string(), Utc::now())
            {
                log::error!("[SCHED] Failed to record sync error: {}", store_err);
            }
        }

        let mut registry = match inner.lock() {
            Ok(registry) => registry,
            Err(e) => {
                log::error!("[SCHED] {}", e);
                return;
            }
        };
        let Some(slot) = registry.get_mut(&account_id) else {
            log::debug!("[SCHED] Account {} removed during sync", account_id);
            return;
        };

        let mut retry_in = None;
        match &result {
            Ok(_) => {
                slot.failures = 0;
                slot.last_error = None;
                slot.state = AccountSyncState::Idle;
            }
            Err(e) => {
                slot.last_error = Some(e.to_string());
                if matches!(e, SyncError::Unauthenticated(_)) {
                    slot.state = AccountSyncState::Unauthenticated;
                } else if e.is_retryable() {
                    slot.failures += 1;
                    let delay = inner.backoff.delay(slot.failures, e.retry_after());
                    let until = chrono::Duration::from_std(delay)
                        .ok()
                        .and_then(|d| Utc::now().checked_add_signed(d))
                        .unwrap_or(DateTime::<Utc>::MAX_UTC);
                    slot.state = AccountSyncState::Backoff {
                        until,
                        attempt: slot.failures,
                    };
                    retry_in = Some((delay, until));
                    log::info!(
                        "[SCHED] Account {} backing off for {:?} (attempt {})",
                        account_id,
                        delay,
                        slot.failures
                    );
                } else {
                    slot.state = AccountSyncState::Idle;
                }
            }
        }
        let state = slot.state.clone();
        let last_error = slot.last_error.clone();
        drop(registry);

        inner.events.emit(MailEvent::AccountStatusChanged {
            account_id,
            state,
            last_error,
        });

        if let Some((delay, until)) = retry_in {
            Inner::spawn_retry(inner, account_id, delay, until);
        }
    }

    fn spawn_retry(inner: &Arc<Inner>, account_id: AccountId, delay: Duration, until: DateTime<Utc>) {
        let inner = inner.clone();
        let runtime = inner.runtime.clone();
        runtime.spawn(async move {
            tokio::time::sleep(delay).await;

            let resumed = match inner.lock() {
                Ok(mut registry) => match registry.get_mut(&account_id) {
                    // A removal or re-registration in between owns the slot now
                    Some(slot) if matches!(slot.state, AccountSyncState::Backoff { until: u, .. } if u == until) => {
                        slot.state = AccountSyncState::Idle;
                        true
                    }
                    _ => false,
                },
                Err(e) => {
                    log::error!("[SCHED] {}", e);
                    false
                }
            };

            if resumed && let Err(e) = Inner::request(&inner, account_id, false) {
                log::error!("[SCHED] Retry of account {} failed: {}", account_id, e);
            }
        });
    }
}
