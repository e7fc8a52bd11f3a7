//! Background pollers for due items and periodic scans
//!
//! Each worker exposes a blocking `run_due(now)` that does one pass; the
//! poller loop only decides when to call it.

mod newsletter;
mod reminders;
mod send;

pub use newsletter::NewsletterScanner;
pub use reminders::{EventReminderSink, ReminderSink, ReminderWorker};
pub use send::{ScheduledSendWorker, build_message};

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, TimeDelta, Utc};
use tokio::runtime::Handle;
use tokio::task::JoinHandle;

/// Shortest poll period; `tokio::time::interval` rejects zero
const MIN_POLL_INTERVAL: Duration = Duration::from_millis(1);

/// Claims made before this instant count as abandoned
pub(crate) fn stale_cutoff(now: DateTime<Utc>, stale_after: TimeDelta) -> DateTime<Utc> {
    now.checked_sub_signed(stale_after)
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

/// Run `tick` on the blocking pool every `interval`, starting immediately
///
/// A failing pass is logged and the loop carries on.
pub fn spawn_poller<F>(
    runtime: &Handle,
    name: &'static str,
    interval: Duration,
    tick: F,
) -> JoinHandle<()>
where
    F: Fn() -> Result<usize> + Send + Sync + 'static,
{
    let tick = Arc::new(tick);
    runtime.spawn(async move {
        let mut ticker = tokio::time::interval(interval.max(MIN_POLL_INTERVAL));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let pass = tick.clone();
            match tokio::task::spawn_blocking(move || pass()).await {
                Ok(Ok(0)) => {}
                Ok(Ok(n)) => log::info!("[DUE] {}: processed {} items", name, n),
                Ok(Err(e)) => log::error!("[DUE] {} pass failed: {:#}", name, e),
                Err(e) => log::error!("[DUE] {} task failed: {}", name, e),
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn test_poller_survives_failing_pass() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let handle = spawn_poller(&Handle::current(), "test", Duration::from_millis(10), move || {
            let n = counter.fetch_add(1, Ordering::SeqCst);
            if n == 0 {
                anyhow::bail!("first pass fails");
            }
            Ok(1)
        });

        for _ in 0..100 {
            if calls.load(Ordering::SeqCst) >= 3 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        handle.abort();
        assert!(calls.load(Ordering::SeqCst) >= 3);
    }

    #[tokio::test]
    async fn test_zero_interval_still_polls() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let handle = spawn_poller(&Handle::current(), "test", Duration::ZERO, move || {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(0)
        });

        for _ in 0..100 {
            if calls.load(Ordering::SeqCst) >= 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(!handle.is_finished());
        handle.abort();
        assert!(calls.load(Ordering::SeqCst) >= 2);
    }

    #[test]
    fn test_stale_cutoff_saturates() {
        let now = Utc::now();
        assert_eq!(stale_cutoff(now, TimeDelta::MAX), DateTime::<Utc>::MIN_UTC);
        assert_eq!(stale_cutoff(now, TimeDelta::seconds(60)), now - TimeDelta::seconds(60));
    }
}
