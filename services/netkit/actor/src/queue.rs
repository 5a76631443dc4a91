//! Ordered publish/subscribe queue with a single consumer per box.
//!
//! Every [`MessageBox`] owns one worker task. Items are delivered to the
//! subscribers in enqueue order, one item at a time, so callbacks for a given
//! box never run concurrently. A failing subscriber (error return or panic) is
//! reported to its own error handler and never interrupts delivery.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, Notify};
use tracing::{debug, trace, warn};

use crate::error::SubscriberError;

/// Callback observing every delivered item
pub type ItemHandler<T> = Box<dyn Fn(&T) -> anyhow::Result<()> + Send + Sync>;
/// Callback receiving a subscriber's own failures
pub type ErrorHandler = Box<dyn Fn(&anyhow::Error) + Send + Sync>;
/// Filter deciding whether a subscriber sees an item
pub type Predicate<T> = Box<dyn Fn(&T) -> bool + Send + Sync>;

struct Subscriber<T> {
    id: u64,
    on_item: ItemHandler<T>,
    on_error: Option<ErrorHandler>,
    predicate: Option<Predicate<T>>,
}

struct Shared<T> {
    name: String,
    subscribers: RwLock<Vec<Arc<Subscriber<T>>>>,
    pending: AtomicU64,
    processed: AtomicU64,
    closed: AtomicBool,
    next_subscriber: AtomicU64,
    idle: Notify,
}

impl<T> Shared<T> {
    fn snapshot(&self) -> Vec<Arc<Subscriber<T>>> {
        self.subscribers
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    fn remove(&self, id: u64) {
        self.subscribers
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .retain(|s| s.id != id);
    }

    fn clear(&self) {
        self.subscribers
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clear();
    }

    fn deliver(&self, item: &T) {
        for subscriber in self.snapshot() {
            let outcome = catch_unwind(AssertUnwindSafe(|| {
                if let Some(predicate) = &subscriber.predicate {
                    if !predicate(item) {
                        return Ok(());
                    }
                }
                (subscriber.on_item)(item)
            }));

            let failure = match outcome {
                Ok(Ok(())) => continue,
                Ok(Err(e)) => e,
                Err(panic) => anyhow::Error::new(SubscriberError::from_panic(panic.as_ref())),
            };
            self.report(&subscriber, failure);
        }
    }

    fn report(&self, subscriber: &Subscriber<T>, failure: anyhow::Error) {
        match &subscriber.on_error {
            Some(on_error) => {
                if catch_unwind(AssertUnwindSafe(|| on_error(&failure))).is_err() {
                    warn!(
                        "Error handler of subscriber {} on {} panicked",
                        subscriber.id, self.name
                    );
                }
            }
            None => debug!(
                "Subscriber {} on {} failed: {}",
                subscriber.id, self.name, failure
            ),
        }
    }
}

struct Inner<T> {
    tx: RwLock<Option<mpsc::UnboundedSender<T>>>,
    shared: Arc<Shared<T>>,
}

/// FIFO publish/subscribe channel served by one worker task.
///
/// Cloning yields another handle to the same box. The worker ends once the box
/// is closed (after draining what was already enqueued) or every handle is
/// dropped. Must be created inside a Tokio runtime.
pub struct MessageBox<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for MessageBox<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T> std::fmt::Debug for MessageBox<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageBox")
            .field("name", &self.inner.shared.name)
            .field("pending", &self.pending())
            .field("processed", &self.processed())
            .finish()
    }
}

impl<T> MessageBox<T> {
    /// Number of enqueued items not yet seen by every subscriber
    pub fn pending(&self) -> u64 {
        self.inner.shared.pending.load(Ordering::SeqCst)
    }

    /// Number of items fully delivered
    pub fn processed(&self) -> u64 {
        self.inner.shared.processed.load(Ordering::SeqCst)
    }
}

impl<T: Send + Sync + 'static> MessageBox<T> {
    /// Create a box and spawn its worker
    pub fn new(name: impl Into<String>) -> Self {
        let shared = Arc::new(Shared {
            name: name.into(),
            subscribers: RwLock::new(Vec::new()),
            pending: AtomicU64::new(0),
            processed: AtomicU64::new(0),
            closed: AtomicBool::new(false),
            next_subscriber: AtomicU64::new(1),
            idle: Notify::new(),
        });

        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(run_worker(shared.clone(), rx));

        Self {
            inner: Arc::new(Inner {
                tx: RwLock::new(Some(tx)),
                shared,
            }),
        }
    }

    /// Queue an item for delivery; returns `false` once the box is closed
    pub fn enqueue(&self, item: T) -> bool {
        let guard = self
            .inner
            .tx
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let Some(tx) = guard.as_ref() else {
            return false;
        };

        let shared = &self.inner.shared;
        shared.pending.fetch_add(1, Ordering::SeqCst);
        if tx.send(item).is_err() {
            shared.pending.fetch_sub(1, Ordering::SeqCst);
            return false;
        }
        true
    }

    /// Observe every item
    pub fn subscribe<F>(&self, on_item: F) -> Subscription
    where
        F: Fn(&T) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.subscribe_full(Box::new(on_item), None, None)
    }

    /// Observe every item, routing failures to `on_error`
    pub fn subscribe_with<F, E>(&self, on_item: F, on_error: E) -> Subscription
    where
        F: Fn(&T) -> anyhow::Result<()> + Send + Sync + 'static,
        E: Fn(&anyhow::Error) + Send + Sync + 'static,
    {
        self.subscribe_full(Box::new(on_item), Some(Box::new(on_error)), None)
    }

    /// Observe the items accepted by `predicate`
    pub fn subscribe_filtered<P, F>(&self, predicate: P, on_item: F) -> Subscription
    where
        P: Fn(&T) -> bool + Send + Sync + 'static,
        F: Fn(&T) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.subscribe_full(Box::new(on_item), None, Some(Box::new(predicate)))
    }

    /// Register a subscriber with every option spelled out
    pub fn subscribe_full(
        &self,
        on_item: ItemHandler<T>,
        on_error: Option<ErrorHandler>,
        predicate: Option<Predicate<T>>,
    ) -> Subscription {
        let shared = &self.inner.shared;
        let id = shared.next_subscriber.fetch_add(1, Ordering::Relaxed);
        shared
            .subscribers
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(Arc::new(Subscriber {
                id,
                on_item,
                on_error,
                predicate,
            }));
        trace!("Subscriber {} attached to {}", id, shared.name);

        let weak: Weak<Shared<T>> = Arc::downgrade(shared);
        Subscription {
            id,
            cancel: Some(Box::new(move || {
                if let Some(shared) = weak.upgrade() {
                    shared.remove(id);
                }
            })),
        }
    }

    /// Number of attached subscribers
    pub fn subscriber_count(&self) -> usize {
        self.inner.shared.snapshot().len()
    }

    /// Name given at construction
    pub fn name(&self) -> &str {
        &self.inner.shared.name
    }

    /// Whether `close` was called
    pub fn is_closed(&self) -> bool {
        self.inner.shared.closed.load(Ordering::SeqCst)
    }

    /// Wait until nothing is pending; returns `false` on timeout
    pub async fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        let shared = &self.inner.shared;
        loop {
            let notified = shared.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if shared.pending.load(Ordering::SeqCst) == 0 {
                return true;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return shared.pending.load(Ordering::SeqCst) == 0;
            }
        }
    }

    /// Refuse further items; already queued items are still delivered
    pub fn close(&self) {
        let shared = &self.inner.shared;
        if shared.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.inner
            .tx
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        debug!("Message box {} closed", shared.name);
    }
}

async fn run_worker<T>(shared: Arc<Shared<T>>, mut rx: mpsc::UnboundedReceiver<T>) {
    while let Some(item) = rx.recv().await {
        shared.deliver(&item);
        drop(item);
        shared.processed.fetch_add(1, Ordering::SeqCst);
        if shared.pending.fetch_sub(1, Ordering::SeqCst) == 1 {
            shared.idle.notify_waiters();
        }
    }
    shared.clear();
    shared.idle.notify_waiters();
    trace!("Message box {} worker finished", shared.name);
}

/// Handle returned by `subscribe`; dropping it keeps the subscription alive
pub struct Subscription {
    id: u64,
    cancel: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl Subscription {
    /// Subscriber id, unique within its box
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Detach the subscriber; items already being delivered may still reach it
    pub fn unsubscribe(mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription").field("id", &self.id).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn collector() -> (Arc<Mutex<Vec<u32>>>, impl Fn(&u32) -> anyhow::Result<()> + Send + Sync) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        (seen, move |item: &u32| {
            sink.lock().unwrap().push(*item);
            Ok(())
        })
    }

    #[tokio::test]
    async fn test_subscribers_see_enqueue_order() {
        let mailbox = MessageBox::new("order");
        let (first, on_first) = collector();
        let (second, on_second) = collector();
        let _a = mailbox.subscribe(on_first);
        let _b = mailbox.subscribe(on_second);

        for i in 0..100u32 {
            assert!(mailbox.enqueue(i));
        }
        assert!(mailbox.wait_idle(Duration::from_secs(5)).await);

        let expected: Vec<u32> = (0..100).collect();
        assert_eq!(*first.lock().unwrap(), expected);
        assert_eq!(*second.lock().unwrap(), expected);
        assert_eq!(mailbox.processed(), 100);
        assert_eq!(mailbox.pending(), 0);
    }

    #[tokio::test]
    async fn test_failing_subscriber_is_isolated() {
        let mailbox = MessageBox::new("isolation");
        let errors = Arc::new(Mutex::new(Vec::new()));
        let errors_sink = errors.clone();

        let _panicky = mailbox.subscribe(|item: &u32| {
            if *item == 2 {
                panic!("subscriber blew up");
            }
            Ok(())
        });
        let _failing = mailbox.subscribe_with(
            |item: &u32| {
                if item % 2 == 1 {
                    anyhow::bail!("odd item {}", item);
                }
                Ok(())
            },
            move |err| errors_sink.lock().unwrap().push(err.to_string()),
        );
        let (seen, on_item) = collector();
        let _healthy = mailbox.subscribe(on_item);

        for i in 0..5u32 {
            mailbox.enqueue(i);
        }
        assert!(mailbox.wait_idle(Duration::from_secs(5)).await);

        assert_eq!(*seen.lock().unwrap(), vec![0, 1, 2, 3, 4]);
        assert_eq!(
            *errors.lock().unwrap(),
            vec!["odd item 1".to_string(), "odd item 3".to_string()]
        );
    }

    #[tokio::test]
    async fn test_panic_routed_to_error_handler() {
        let mailbox = MessageBox::new("panic");
        let errors = Arc::new(Mutex::new(Vec::new()));
        let sink = errors.clone();
        let _sub = mailbox.subscribe_with(
            |_: &u32| panic!("kaboom"),
            move |err| sink.lock().unwrap().push(err.to_string()),
        );

        mailbox.enqueue(1);
        assert!(mailbox.wait_idle(Duration::from_secs(5)).await);
        let errors = errors.lock().unwrap();
        assert_eq!(errors.len(), 1);
        assert!(errors[0].contains("kaboom"));
    }

    #[tokio::test]
    async fn test_predicate_filters_without_consuming() {
        let mailbox = MessageBox::new("filter");
        let (even, on_even) = collector();
        let (all, on_all) = collector();
        let _even = mailbox.subscribe_filtered(|i: &u32| i % 2 == 0, on_even);
        let _all = mailbox.subscribe(on_all);

        for i in 0..6u32 {
            mailbox.enqueue(i);
        }
        assert!(mailbox.wait_idle(Duration::from_secs(5)).await);
        assert_eq!(*even.lock().unwrap(), vec![0, 2, 4]);
        assert_eq!(all.lock().unwrap().len(), 6);
    }

    #[tokio::test]
    async fn test_callbacks_never_overlap() {
        let mailbox = MessageBox::new("serial");
        let busy = Arc::new(AtomicBool::new(false));
        let overlaps = Arc::new(AtomicU64::new(0));

        for _ in 0..3 {
            let busy = busy.clone();
            let overlaps = overlaps.clone();
            let _ = mailbox.subscribe(move |_: &u32| {
                if busy.swap(true, Ordering::SeqCst) {
                    overlaps.fetch_add(1, Ordering::SeqCst);
                }
                std::thread::yield_now();
                busy.store(false, Ordering::SeqCst);
                Ok(())
            });
        }

        let producers: Vec<_> = (0..4)
            .map(|p| {
                let mailbox = mailbox.clone();
                tokio::spawn(async move {
                    for i in 0..50u32 {
                        mailbox.enqueue(p * 100 + i);
                    }
                })
            })
            .collect();
        for producer in producers {
            producer.await.unwrap();
        }

        assert!(mailbox.wait_idle(Duration::from_secs(5)).await);
        assert_eq!(overlaps.load(Ordering::SeqCst), 0);
        assert_eq!(mailbox.processed(), 200);
    }

    #[tokio::test]
    async fn test_unsubscribe_stops_delivery() {
        let mailbox = MessageBox::new("unsubscribe");
        let (seen, on_item) = collector();
        let sub = mailbox.subscribe(on_item);
        mailbox.enqueue(1);
        assert!(mailbox.wait_idle(Duration::from_secs(5)).await);

        sub.unsubscribe();
        assert_eq!(mailbox.subscriber_count(), 0);
        mailbox.enqueue(2);
        assert!(mailbox.wait_idle(Duration::from_secs(5)).await);
        assert_eq!(*seen.lock().unwrap(), vec![1]);
    }

    #[tokio::test]
    async fn test_closed_box_ignores_enqueue() {
        let mailbox = MessageBox::new("closed");
        let (seen, on_item) = collector();
        let _sub = mailbox.subscribe(on_item);
        mailbox.enqueue(1);
        mailbox.close();

        assert!(mailbox.is_closed());
        assert!(!mailbox.enqueue(2));
        assert!(mailbox.wait_idle(Duration::from_secs(5)).await);
        assert_eq!(*seen.lock().unwrap(), vec![1]);
    }

    #[tokio::test]
    async fn test_debug_shows_counters() {
        let mailbox: MessageBox<u32> = MessageBox::new("debug");
        let (_seen, on_item) = collector();
        let _sub = mailbox.subscribe(on_item);
        mailbox.enqueue(7);
        assert!(mailbox.wait_idle(Duration::from_secs(5)).await);

        let rendered = format!("{:?}", mailbox);
        assert!(rendered.contains("name: \"debug\""));
        assert!(rendered.contains("pending: 0"));
        assert!(rendered.contains("processed: 1"));
    }
}
