//! Message filter bus: a side channel for raw response events.
//!
//! Subscribers register a predicate under a queue name. Every event the
//! conversation loop decodes is offered to every predicate, and matching events
//! are queued for that name. Consumers drain queues at their own pace through
//! [`FilterBus::consume`] or a cancellable task from
//! [`FilterBus::spawn_consumer`].
//!
//! ```rust,no_run
//! use aichat::FilterBus;
//! use futures::StreamExt;
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example() {
//! let bus = FilterBus::new();
//! bus.register("finish", |event| Ok(event["choices"][0]["finish_reason"].is_string()));
//!
//! let token = CancellationToken::new();
//! let handle = bus.spawn_consumer("finish", token.clone(), |event| async move {
//!     println!("finished: {}", event);
//! });
//!
//! // ... run conversations ...
//! token.cancel();
//! handle.await.ok();
//! # }
//! ```

use futures::stream::{self, Stream, StreamExt};
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// How long an empty queue's consumer sleeps before checking again
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Predicate deciding whether an event belongs in a queue.
///
/// An `Err` is logged and counts as "no match".
pub type Predicate = Arc<dyn Fn(&Value) -> anyhow::Result<bool> + Send + Sync>;

#[derive(Default)]
struct State {
    filters: HashMap<String, Predicate>,
    queues: HashMap<String, VecDeque<Value>>,
}

/// Named predicate queues. Cloning shares the same queues.
#[derive(Clone)]
pub struct FilterBus {
    state: Arc<Mutex<State>>,
    poll_interval: Duration,
}

impl Default for FilterBus {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for FilterBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.lock();
        f.debug_struct("FilterBus")
            .field("filters", &state.filters.keys().collect::<Vec<_>>())
            .field("poll_interval", &self.poll_interval)
            .finish()
    }
}

impl FilterBus {
    pub fn new() -> Self {
        Self::with_poll_interval(DEFAULT_POLL_INTERVAL)
    }

    pub fn with_poll_interval(poll_interval: Duration) -> Self {
        Self {
            state: Arc::new(Mutex::new(State::default())),
            poll_interval,
        }
    }

    // Critical sections never leave the state half-updated, so a poisoned
    // lock is still usable.
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Registers `predicate` for `queue`, replacing any previous one.
    pub fn register<F>(&self, queue: impl Into<String>, predicate: F) -> &Self
    where
        F: Fn(&Value) -> anyhow::Result<bool> + Send + Sync + 'static,
    {
        self.lock().filters.insert(queue.into(), Arc::new(predicate));
        self
    }

    /// Offers `event` to every registered predicate.
    pub fn publish(&self, event: &Value) {
        // Predicates run without the lock so they may use the bus themselves.
        let filters: Vec<(String, Predicate)> = self
            .lock()
            .filters
            .iter()
            .map(|(name, predicate)| (name.clone(), predicate.clone()))
            .collect();

        let matched: Vec<String> = filters
            .into_iter()
            .filter_map(|(name, predicate)| match predicate(event) {
                Ok(true) => Some(name),
                Ok(false) => None,
                Err(e) => {
                    tracing::error!(queue = %name, error = %e, "filter predicate failed");
                    None
                }
            })
            .collect();

        if matched.is_empty() {
            return;
        }
        let mut state = self.lock();
        for name in matched {
            state.queues.entry(name).or_default().push_back(event.clone());
        }
    }

    /// Number of events waiting in `queue`
    pub fn pending(&self, queue: &str) -> usize {
        self.lock().queues.get(queue).map_or(0, VecDeque::len)
    }

    /// Removes and returns the oldest event in `queue`, if any.
    pub fn try_pop(&self, queue: &str) -> Option<Value> {
        self.lock().queues.get_mut(queue)?.pop_front()
    }

    /// An endless FIFO stream over `queue`.
    ///
    /// When the queue is empty the stream sleeps for the poll interval and
    /// checks again. It never ends by itself; drop it or wrap it in a
    /// cancellation (see [`FilterBus::spawn_consumer`]).
    pub fn consume(&self, queue: impl Into<String>) -> impl Stream<Item = Value> + Send + 'static {
        let bus = self.clone();
        let queue = queue.into();
        stream::unfold((bus, queue), |(bus, queue)| async move {
            loop {
                if let Some(event) = bus.try_pop(&queue) {
                    return Some((event, (bus, queue)));
                }
                tokio::time::sleep(bus.poll_interval).await;
            }
        })
    }

    /// Runs `handler` for every event of `queue` on a background task until
    /// `token` is cancelled.
    pub fn spawn_consumer<F, Fut>(
        &self,
        queue: impl Into<String>,
        token: CancellationToken,
        mut handler: F,
    ) -> JoinHandle<()>
    where
        F: FnMut(Value) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let queue = queue.into();
        let events = self.consume(queue.clone());
        tokio::spawn(async move {
            let mut events = Box::pin(events.take_until(token.cancelled_owned()));
            while let Some(event) = events.next().await {
                handler(event).await;
            }
            tracing::debug!(queue = %queue, "filter consumer stopped");
        })
    }
}
