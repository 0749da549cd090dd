//! `OnceSignal<T>` — a multi-waiter, fire-once signal backing the lifecycle
//! futures used throughout this workspace (`once_connected`, `once_closed`,
//! `once_listening`, `once_shutdown`, `once_ready`, `once_stopped`). Firing
//! is idempotent: a second `fire()` call (e.g. a re-entrant disconnect
//! event) is silently ignored, so each signal fulfills exactly once.

use tokio::sync::{Mutex, Notify};

pub struct OnceSignal<T> {
    state: Mutex<Option<T>>,
    notify: Notify,
}

impl<T> Default for OnceSignal<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone + Send + 'static> OnceSignal<T> {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(None),
            notify: Notify::new(),
        }
    }

    /// Fulfill the signal. Returns `true` if this call fired it, `false`
    /// if it had already been fired.
    pub async fn fire(&self, value: T) -> bool {
        let mut guard = self.state.lock().await;
        if guard.is_some() {
            return false;
        }
        *guard = Some(value);
        drop(guard);
        self.notify.notify_waiters();
        true
    }

    /// Wait for the signal to be fulfilled, returning the fired value. If
    /// it has already fired, returns immediately.
    pub async fn wait(&self) -> T {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            // Register as a waiter *before* checking state, per tokio's
            // documented notify-one-value pattern — otherwise a `fire()`
            // landing between the state check and the `.await` below fires
            // into zero registered waiters and is lost (`notify_waiters`
            // stores no permit, unlike `notify_one`).
            notified.as_mut().enable();

            {
                let guard = self.state.lock().await;
                if let Some(v) = guard.as_ref() {
                    return v.clone();
                }
            }
            notified.await;
        }
    }

    pub async fn is_fired(&self) -> bool {
        self.state.lock().await.is_some()
    }

    pub async fn get(&self) -> Option<T> {
        self.state.lock().await.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn fires_exactly_once() {
        let sig: OnceSignal<u32> = OnceSignal::new();
        assert!(sig.fire(1).await);
        assert!(!sig.fire(2).await);
        assert_eq!(sig.wait().await, 1);
    }

    #[tokio::test]
    async fn multiple_waiters_all_observe_the_fired_value() {
        let sig = Arc::new(OnceSignal::<u32>::new());
        let a = tokio::spawn({
            let sig = sig.clone();
            async move { sig.wait().await }
        });
        let b = tokio::spawn({
            let sig = sig.clone();
            async move { sig.wait().await }
        });
        tokio::task::yield_now().await;
        sig.fire(7).await;
        assert_eq!(a.await.unwrap(), 7);
        assert_eq!(b.await.unwrap(), 7);
    }

    #[tokio::test]
    async fn wait_after_fire_returns_immediately() {
        let sig: OnceSignal<&'static str> = OnceSignal::new();
        sig.fire("done").await;
        assert_eq!(sig.wait().await, "done");
    }
}
