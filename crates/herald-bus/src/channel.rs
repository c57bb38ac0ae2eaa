//! Bounded publish/subscribe channel with a single dispatch loop.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use herald_core::config::BusConfig;
use herald_core::events::DomainEvent;
use herald_core::types::Timestamp;
use herald_core::Event;
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::error::BusError;
use crate::handler::EventHandler;
use crate::topic::{topic_matches, validate_pattern, validate_topic};

/// Handle returned by [`EventChannel::subscribe`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct SubscriptionId(pub u64);

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

struct Subscription {
    id: SubscriptionId,
    pattern: String,
    handler: Arc<dyn EventHandler>,
}

#[derive(Default)]
struct Counters {
    published: AtomicU64,
    delivered: AtomicU64,
    failed: AtomicU64,
    discarded: AtomicU64,
}

/// Point-in-time view of the channel.
#[derive(Debug, Clone, Serialize)]
pub struct ChannelStats {
    pub queue_depth: usize,
    pub capacity: usize,
    pub running: bool,
    pub closed: bool,
    pub published: u64,
    pub delivered: u64,
    pub failed: u64,
    pub discarded: u64,
    /// Number of subscriptions per pattern.
    pub subscriptions: BTreeMap<String, usize>,
}

/// Topic-based event channel backed by a bounded queue.
///
/// `publish` enqueues and returns without waiting for subscribers; when the
/// queue is full it suspends until the dispatch loop frees a slot. Events
/// are delivered one at a time; for one event, matching handlers run in
/// subscription order.
///
/// Handlers that publish back onto the channel should not hold the dispatch
/// loop for long work: spawn it instead, otherwise a full queue can stall
/// the loop waiting on itself.
pub struct EventChannel {
    tx: mpsc::Sender<Event>,
    rx: Mutex<Option<mpsc::Receiver<Event>>>,
    capacity: usize,
    dispatcher: Arc<Dispatcher>,
    next_id: AtomicU64,
    closed: AtomicBool,
    control: Mutex<Option<(oneshot::Sender<bool>, JoinHandle<()>)>>,
}

impl EventChannel {
    /// Create a channel holding at most `capacity` queued events.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (tx, rx) = mpsc::channel(capacity);
        Self {
            tx,
            rx: Mutex::new(Some(rx)),
            capacity,
            dispatcher: Arc::new(Dispatcher::default()),
            next_id: AtomicU64::new(1),
            closed: AtomicBool::new(false),
            control: Mutex::new(None),
        }
    }

    pub fn from_config(config: &BusConfig) -> Self {
        Self::new(config.queue_capacity)
    }

    /// Register `handler` for every topic matching `pattern`.
    pub fn subscribe(
        &self,
        pattern: &str,
        handler: Arc<dyn EventHandler>,
    ) -> Result<SubscriptionId, BusError> {
        validate_pattern(pattern)?;
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::SeqCst));
        debug!(%id, pattern, handler = handler.name(), "Subscribed");
        write_lock(&self.dispatcher.subscriptions).push(Subscription {
            id,
            pattern: pattern.to_string(),
            handler,
        });
        Ok(id)
    }

    /// Remove a subscription. Returns false if it was not registered.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut subs = write_lock(&self.dispatcher.subscriptions);
        let before = subs.len();
        subs.retain(|s| s.id != id);
        subs.len() != before
    }

    /// Enqueue an event, suspending while the queue is full.
    pub async fn publish(
        &self,
        topic: &str,
        payload: serde_json::Value,
    ) -> Result<(), BusError> {
        validate_topic(topic)?;
        self.send(Event::new(topic, payload)).await
    }

    /// Publish a domain event on its own topic.
    pub async fn publish_event(&self, event: &DomainEvent) -> Result<(), BusError> {
        let event = event.to_event()?;
        validate_topic(&event.topic)?;
        self.send(event).await
    }

    /// Enqueue without waiting. Returns [`BusError::Full`] at capacity.
    pub fn try_publish(&self, topic: &str, payload: serde_json::Value) -> Result<(), BusError> {
        validate_topic(topic)?;
        if self.closed.load(Ordering::SeqCst) {
            return Err(BusError::Closed);
        }
        match self.tx.try_send(Event::new(topic, payload)) {
            Ok(()) => {
                self.dispatcher.counters.published.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(mpsc::error::TrySendError::Full(_)) => Err(BusError::Full(self.capacity)),
            Err(mpsc::error::TrySendError::Closed(_)) => Err(BusError::Closed),
        }
    }

    async fn send(&self, event: Event) -> Result<(), BusError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(BusError::Closed);
        }
        self.tx.send(event).await.map_err(|_| BusError::Closed)?;
        self.dispatcher.counters.published.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Spawn the dispatch loop. Events published before `start` are kept
    /// in the queue and delivered once it runs.
    pub fn start(&self) -> Result<(), BusError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(BusError::Closed);
        }
        let mut rx = lock(&self.rx).take().ok_or(BusError::AlreadyRunning)?;
        let (stop_tx, mut stop_rx) = oneshot::channel::<bool>();
        let dispatcher = Arc::clone(&self.dispatcher);

        let handle = tokio::spawn(async move {
            info!("Event channel dispatch loop started");
            let mut control_open = true;
            loop {
                tokio::select! {
                    biased;
                    stop = &mut stop_rx, if control_open => match stop {
                        Ok(drain) => {
                            rx.close();
                            dispatcher.finish(&mut rx, drain).await;
                            break;
                        }
                        Err(_) => control_open = false,
                    },
                    next = rx.recv() => match next {
                        Some(event) => dispatcher.dispatch(event).await,
                        None => break,
                    },
                }
            }
            info!("Event channel dispatch loop stopped");
        });

        *lock(&self.control) = Some((stop_tx, handle));
        Ok(())
    }

    /// Stop accepting events, then deliver (`drain = true`) or discard
    /// whatever is still queued, and wait for the loop to exit.
    pub async fn shutdown(&self, drain: bool) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        info!(drain, "Shutting down event channel");
        let control = lock(&self.control).take();
        match control {
            Some((stop_tx, handle)) => {
                let _ = stop_tx.send(drain);
                if let Err(e) = handle.await {
                    error!(error = %e, "Dispatch loop ended abnormally");
                }
            }
            None => {
                // Never started: settle the queue here.
                let rx = lock(&self.rx).take();
                if let Some(mut rx) = rx {
                    rx.close();
                    self.dispatcher.finish(&mut rx, drain).await;
                }
            }
        }
    }

    pub fn is_running(&self) -> bool {
        lock(&self.control).is_some()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn stats(&self) -> ChannelStats {
        let counters = &self.dispatcher.counters;
        let mut subscriptions = BTreeMap::new();
        for sub in read_lock(&self.dispatcher.subscriptions).iter() {
            *subscriptions.entry(sub.pattern.clone()).or_insert(0) += 1;
        }
        ChannelStats {
            queue_depth: self.capacity.saturating_sub(self.tx.capacity()),
            capacity: self.capacity,
            running: self.is_running(),
            closed: self.closed.load(Ordering::SeqCst),
            published: counters.published.load(Ordering::Relaxed),
            delivered: counters.delivered.load(Ordering::Relaxed),
            failed: counters.failed.load(Ordering::Relaxed),
            discarded: counters.discarded.load(Ordering::Relaxed),
            subscriptions,
        }
    }
}

// =============================================================================
// Dispatch
// =============================================================================

#[derive(Default)]
struct Dispatcher {
    subscriptions: RwLock<Vec<Subscription>>,
    counters: Counters,
}

impl Dispatcher {
    fn matching(&self, topic: &str) -> Vec<Arc<dyn EventHandler>> {
        read_lock(&self.subscriptions)
            .iter()
            .filter(|s| topic_matches(&s.pattern, topic))
            .map(|s| Arc::clone(&s.handler))
            .collect()
    }

    async fn dispatch(&self, event: Event) {
        let handlers = self.matching(&event.topic);
        if handlers.is_empty() {
            debug!(topic = %event.topic, "No subscribers for event");
            return;
        }
        for handler in handlers {
            let name = handler.name().to_string();
            match run_isolated(handler, event.clone()).await {
                Ok(()) => {
                    self.counters.delivered.fetch_add(1, Ordering::Relaxed);
                }
                Err(reason) => {
                    self.counters.failed.fetch_add(1, Ordering::Relaxed);
                    warn!(handler = %name, topic = %event.topic, error = %reason, "Event handler failed");
                    self.report_failure(&name, &event, reason).await;
                }
            }
        }
    }

    /// Deliver a `handler_failed` event inline to `<component>.error`
    /// subscribers. Failures while handling an error event are only logged.
    async fn report_failure(&self, handler: &str, event: &Event, reason: String) {
        if event.topic.ends_with(".error") {
            error!(handler, topic = %event.topic, error = %reason, "Error handler failed");
            return;
        }
        let failure = DomainEvent::HandlerFailed {
            handler: handler.to_string(),
            topic: event.topic.clone(),
            payload: event.payload.clone(),
            error: reason,
            timestamp: Timestamp::now(),
        };
        let envelope = match failure.to_event() {
            Ok(envelope) => envelope,
            Err(e) => {
                error!(error = %e, "Failed to encode handler failure");
                return;
            }
        };
        for error_handler in self.matching(&envelope.topic) {
            let name = error_handler.name().to_string();
            if let Err(e) = run_isolated(error_handler, envelope.clone()).await {
                error!(handler = %name, topic = %envelope.topic, error = %e, "Error handler failed");
            }
        }
    }

    async fn finish(&self, rx: &mut mpsc::Receiver<Event>, drain: bool) {
        if drain {
            let mut drained = 0usize;
            while let Some(event) = rx.recv().await {
                self.dispatch(event).await;
                drained += 1;
            }
            info!(drained, "Event queue drained");
        } else {
            let mut discarded = 0u64;
            while rx.try_recv().is_ok() {
                discarded += 1;
            }
            self.counters.discarded.fetch_add(discarded, Ordering::Relaxed);
            info!(discarded, "Event queue discarded");
        }
    }
}

/// Run one handler in its own task so a panic cannot unwind the loop.
async fn run_isolated(handler: Arc<dyn EventHandler>, event: Event) -> Result<(), String> {
    let task = tokio::spawn(async move { handler.handle(&event).await });
    match task.await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(e.to_string()),
        Err(join_err) if join_err.is_panic() => {
            let panic = join_err.into_panic();
            let message = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            Err(format!("handler panicked: {}", message))
        }
        Err(join_err) => Err(format!("handler task cancelled: {}", join_err)),
    }
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn read_lock<T>(l: &RwLock<T>) -> std::sync::RwLockReadGuard<'_, T> {
    l.read().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn write_lock<T>(l: &RwLock<T>) -> std::sync::RwLockWriteGuard<'_, T> {
    l.write().unwrap_or_else(|poisoned| poisoned.into_inner())
}
