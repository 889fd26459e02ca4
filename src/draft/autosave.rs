// SPDX-License-Identifier: MIT

//! Debounced save trigger
//!
//! Holds at most one delayed task. Re-arming aborts the previous timer; once
//! a timer elapses its action runs on a detached task, so re-arming or
//! cancelling never aborts a save that already started.

use std::future::Future;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;

pub struct AutosaveScheduler {
    debounce: Duration,
    timer: Mutex<Option<JoinHandle<()>>>,
}

impl AutosaveScheduler {
    pub fn new(debounce: Duration) -> Self {
        Self {
            debounce,
            timer: Mutex::new(None),
        }
    }

    pub fn debounce(&self) -> Duration {
        self.debounce
    }

    fn timer(&self) -> MutexGuard<'_, Option<JoinHandle<()>>> {
        self.timer.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Run `action` after the debounce window, replacing any pending timer
    pub fn schedule_debounced<F, Fut>(&self, action: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.schedule(self.debounce, action);
    }

    /// Run `action` after `delay`, replacing any pending timer
    ///
    /// Must be called from within a Tokio runtime.
    pub fn schedule<F, Fut>(&self, delay: Duration, action: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            tokio::spawn(action());
        });
        if let Some(previous) = self.timer().replace(handle) {
            previous.abort();
        }
    }

    /// Drop the pending timer; returns whether one was armed
    pub fn cancel(&self) -> bool {
        match self.timer().take() {
            Some(handle) => {
                let armed = !handle.is_finished();
                handle.abort();
                armed
            }
            None => false,
        }
    }

    /// Whether a timer is armed and has not fired yet
    pub fn is_pending(&self) -> bool {
        self.timer()
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }
}

impl Drop for AutosaveScheduler {
    fn drop(&mut self) {
        self.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn counting_action(counter: &Arc<AtomicUsize>) -> impl FnOnce() -> std::future::Ready<()> {
        let counter = counter.clone();
        move || {
            counter.fetch_add(1, Ordering::SeqCst);
            std::future::ready(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_rearming_fires_once() {
        let scheduler = AutosaveScheduler::new(Duration::from_millis(1_500));
        let fired = Arc::new(AtomicUsize::new(0));

        scheduler.schedule_debounced(counting_action(&fired));
        tokio::time::sleep(Duration::from_millis(1_000)).await;
        scheduler.schedule_debounced(counting_action(&fired));
        tokio::time::sleep(Duration::from_millis(1_000)).await;
        // First timer was replaced before it elapsed
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        assert!(scheduler.is_pending());

        tokio::time::sleep(Duration::from_millis(600)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(!scheduler.is_pending());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel() {
        let scheduler = AutosaveScheduler::new(Duration::from_millis(100));
        let fired = Arc::new(AtomicUsize::new(0));

        scheduler.schedule_debounced(counting_action(&fired));
        assert!(scheduler.cancel());
        assert!(!scheduler.cancel());

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rearm_does_not_abort_running_action() {
        let scheduler = AutosaveScheduler::new(Duration::from_millis(100));
        let finished = Arc::new(AtomicUsize::new(0));

        let done = finished.clone();
        scheduler.schedule_debounced(move || async move {
            tokio::time::sleep(Duration::from_secs(5)).await;
            done.fetch_add(1, Ordering::SeqCst);
        });
        // Timer fires, the slow action starts
        tokio::time::sleep(Duration::from_millis(200)).await;

        scheduler.schedule_debounced(|| async {});
        scheduler.cancel();

        tokio::time::sleep(Duration::from_secs(6)).await;
        assert_eq!(finished.load(Ordering::SeqCst), 1);
    }
}
