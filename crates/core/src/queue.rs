//! `HandlerQueue<T, R>` — the single concurrency primitive the rest of this
//! workspace builds on. It turns a push-style event source (a socket's
//! `onData`, a data channel's `onMessage`, an acceptor's `onConnection`)
//! into a pull-style awaitable stream, with a pluggable permanent or
//! one-shot consumer.
//!
//! The queue is explicitly single-consumer: installing a second permanent
//! handler while one is active is rejected rather than silently replacing
//! it, and there is no broadcast/multi-subscriber mode.

use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use tokio::sync::{oneshot, Mutex, Notify};

use crate::error::{CoreError, Result};

type BoxFuture<R> = Pin<Box<dyn Future<Output = R> + Send>>;
type PermanentHandler<T, R> = Arc<dyn Fn(T) -> BoxFuture<R> + Send + Sync>;
type OneShotHandler<T, R> = Box<dyn FnOnce(T) -> BoxFuture<R> + Send>;

enum Installed<T, R> {
    None,
    Permanent(PermanentHandler<T, R>),
    /// Holds the handler plus the future the installer is waiting on.
    OneShot(OneShotHandler<T, R>, oneshot::Sender<R>),
}

struct State<T, R> {
    queue: VecDeque<(T, oneshot::Sender<R>)>,
    installed: Installed<T, R>,
    /// Bumped on every install/detach so a running permanent-handler pump
    /// loop knows to stop once it is no longer the active handler.
    generation: u64,
}

struct Shared<T, R> {
    state: Mutex<State<T, R>>,
    notify: Notify,
}

/// A bounded-by-memory FIFO of items of type `T` coupled to a pluggable
/// handler that produces results of type `R`.
pub struct HandlerQueue<T, R> {
    shared: Arc<Shared<T, R>>,
}

impl<T, R> Clone for HandlerQueue<T, R> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<T, R> Default for HandlerQueue<T, R>
where
    T: Send + 'static,
    R: Clone + Send + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<T, R> HandlerQueue<T, R>
where
    T: Send + 'static,
    R: Clone + Send + 'static,
{
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(State {
                    queue: VecDeque::new(),
                    installed: Installed::None,
                    generation: 0,
                }),
                notify: Notify::new(),
            }),
        }
    }

    /// Enqueue `item`; resolves once it has been processed by whichever
    /// handler is (or becomes) installed. Resolves to `Err(QueueClosed)` if
    /// the queue is cleared before that happens.
    pub async fn handle(&self, item: T) -> Result<R> {
        let (tx, rx) = oneshot::channel();
        self.push_and_dispatch(item, tx).await;
        rx.await.map_err(|_| CoreError::QueueClosed)
    }

    async fn push_and_dispatch(&self, item: T, tx: oneshot::Sender<R>) {
        let mut state = self.shared.state.lock().await;
        let is_permanent = matches!(state.installed, Installed::Permanent(_));
        let is_one_shot = matches!(state.installed, Installed::OneShot(..));

        if is_one_shot {
            let prev = std::mem::replace(&mut state.installed, Installed::None);
            drop(state);
            if let Installed::OneShot(handler, waiter) = prev {
                Self::run_once(handler, waiter, item, tx);
            }
            return;
        }

        state.queue.push_back((item, tx));
        drop(state);
        if is_permanent {
            self.shared.notify.notify_one();
        }
    }

    fn run_once(handler: OneShotHandler<T, R>, waiter: oneshot::Sender<R>, item: T, producer: oneshot::Sender<R>) {
        tokio::spawn(async move {
            let result = handler(item).await;
            let _ = waiter.send(result.clone());
            let _ = producer.send(result);
        });
    }

    /// Install a permanent handler. Any items already queued are drained in
    /// order before any item enqueued after this call. Fails if a handler
    /// (permanent or one-shot) is already installed — the queue is
    /// single-consumer.
    pub async fn set_sync_handler<F, Fut>(&self, f: F) -> Result<()>
    where
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = R> + Send + 'static,
    {
        let handler: PermanentHandler<T, R> = Arc::new(move |item| Box::pin(f(item)));
        let generation = {
            let mut state = self.shared.state.lock().await;
            if !matches!(state.installed, Installed::None) {
                return Err(CoreError::HandlerAlreadyInstalled);
            }
            state.installed = Installed::Permanent(handler);
            state.generation += 1;
            state.generation
        };
        self.spawn_pump(generation);
        Ok(())
    }

    fn spawn_pump(&self, generation: u64) {
        let shared = self.shared.clone();
        tokio::spawn(async move {
            loop {
                let (item, tx, handler) = loop {
                    let mut state = shared.state.lock().await;
                    if state.generation != generation {
                        return;
                    }
                    let handler = match &state.installed {
                        Installed::Permanent(h) => h.clone(),
                        _ => return,
                    };
                    if let Some((item, tx)) = state.queue.pop_front() {
                        break (item, tx, handler);
                    }
                    drop(state);
                    shared.notify.notified().await;
                };
                let result = handler(item).await;
                let _ = tx.send(result);
            }
        });
    }

    /// Install a one-shot handler that consumes exactly the next item
    /// (already queued, or the first to arrive), then uninstalls itself.
    /// Fails if a handler is already installed.
    pub async fn set_sync_next_handler<F, Fut>(&self, f: F) -> Result<NextHandlerFuture<R>>
    where
        F: FnOnce(T) -> Fut + Send + 'static,
        Fut: Future<Output = R> + Send + 'static,
    {
        let handler: OneShotHandler<T, R> = Box::new(move |item| Box::pin(f(item)));
        let (waiter_tx, waiter_rx) = oneshot::channel();

        let mut state = self.shared.state.lock().await;
        if !matches!(state.installed, Installed::None) {
            return Err(CoreError::HandlerAlreadyInstalled);
        }
        if let Some((item, producer)) = state.queue.pop_front() {
            drop(state);
            Self::run_once(handler, waiter_tx, item, producer);
        } else {
            state.installed = Installed::OneShot(handler, waiter_tx);
        }
        Ok(NextHandlerFuture { rx: waiter_rx })
    }

    /// Detach any installed handler. Subsequent items queue until a new
    /// handler is installed.
    pub async fn stop_handling(&self) {
        let mut state = self.shared.state.lock().await;
        state.installed = Installed::None;
        state.generation += 1;
    }

    /// Drop all queued items, failing their pending `handle()` futures.
    pub async fn clear(&self) {
        let mut state = self.shared.state.lock().await;
        state.queue.clear();
    }

    pub async fn len(&self) -> usize {
        self.shared.state.lock().await.queue.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

/// The future returned by `set_sync_next_handler`.
pub struct NextHandlerFuture<R> {
    rx: oneshot::Receiver<R>,
}

impl<R> Future for NextHandlerFuture<R> {
    type Output = Result<R>;

    fn poll(
        mut self: Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|r| r.map_err(|_| CoreError::QueueClosed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn queue_without_handler_accumulates() {
        let q: HandlerQueue<u32, u32> = HandlerQueue::new();
        let _f1 = tokio::spawn({
            let q = q.clone();
            async move { q.handle(1).await }
        });
        let _f2 = tokio::spawn({
            let q = q.clone();
            async move { q.handle(2).await }
        });
        tokio::task::yield_now().await;
        assert_eq!(q.len().await, 2);
    }

    #[tokio::test]
    async fn permanent_handler_drains_queued_items_in_order_then_later_items() {
        let q: HandlerQueue<u32, u32> = HandlerQueue::new();
        let order = Arc::new(tokio::sync::Mutex::new(Vec::new()));

        let h1 = tokio::spawn({
            let q = q.clone();
            async move { q.handle(1).await.unwrap() }
        });
        let h2 = tokio::spawn({
            let q = q.clone();
            async move { q.handle(2).await.unwrap() }
        });
        tokio::task::yield_now().await;

        let order_clone = order.clone();
        q.set_sync_handler(move |item: u32| {
            let order = order_clone.clone();
            async move {
                order.lock().await.push(item);
                item * 10
            }
        })
        .await
        .unwrap();

        let h3 = tokio::spawn({
            let q = q.clone();
            async move { q.handle(3).await.unwrap() }
        });

        assert_eq!(h1.await.unwrap(), 10);
        assert_eq!(h2.await.unwrap(), 20);
        assert_eq!(h3.await.unwrap(), 30);
        assert_eq!(*order.lock().await, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn installing_permanent_handler_twice_is_rejected() {
        let q: HandlerQueue<u32, u32> = HandlerQueue::new();
        q.set_sync_handler(|x| async move { x }).await.unwrap();
        let err = q.set_sync_handler(|x| async move { x }).await.unwrap_err();
        assert!(matches!(err, CoreError::HandlerAlreadyInstalled));
    }

    #[tokio::test]
    async fn stop_handling_detaches_and_items_accumulate_again() {
        let q: HandlerQueue<u32, u32> = HandlerQueue::new();
        q.set_sync_handler(|x| async move { x }).await.unwrap();
        q.stop_handling().await;
        let _f = tokio::spawn({
            let q = q.clone();
            async move { q.handle(7).await }
        });
        tokio::task::yield_now().await;
        assert_eq!(q.len().await, 1);
    }

    #[tokio::test]
    async fn set_sync_next_handler_consumes_already_queued_item() {
        let q: HandlerQueue<u32, u32> = HandlerQueue::new();
        let _producer = tokio::spawn({
            let q = q.clone();
            async move { q.handle(9).await }
        });
        tokio::task::yield_now().await;

        let next = q.set_sync_next_handler(|x: u32| async move { x + 1 }).await.unwrap();
        assert_eq!(next.await.unwrap(), 10);
    }

    #[tokio::test]
    async fn set_sync_next_handler_consumes_first_arriving_item() {
        let q: HandlerQueue<u32, u32> = HandlerQueue::new();
        let next = q.set_sync_next_handler(|x: u32| async move { x + 1 }).await.unwrap();

        let producer_result = tokio::spawn({
            let q = q.clone();
            async move { q.handle(41).await }
        });

        assert_eq!(next.await.unwrap(), 42);
        assert_eq!(producer_result.await.unwrap().unwrap(), 42);
    }

    #[tokio::test]
    async fn one_shot_handler_only_consumes_a_single_item() {
        let q: HandlerQueue<u32, u32> = HandlerQueue::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = calls.clone();
        let next = q
            .set_sync_next_handler(move |x: u32| {
                calls_clone.fetch_add(1, Ordering::SeqCst);
                async move { x }
            })
            .await
            .unwrap();

        let _ = tokio::spawn({
            let q = q.clone();
            async move { q.handle(1).await }
        });
        assert_eq!(next.await.unwrap(), 1);

        let _f2 = tokio::spawn({
            let q = q.clone();
            async move { q.handle(2).await }
        });
        tokio::task::yield_now().await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(q.len().await, 1);
    }

    #[tokio::test]
    async fn clear_fails_pending_handle_futures() {
        let q: HandlerQueue<u32, u32> = HandlerQueue::new();
        let f = tokio::spawn({
            let q = q.clone();
            async move { q.handle(1).await }
        });
        tokio::task::yield_now().await;
        q.clear().await;
        assert!(f.await.unwrap().is_err());
    }
}
