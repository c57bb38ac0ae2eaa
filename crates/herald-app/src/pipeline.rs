//! The assistant front door and its wiring.
//!
//! Owns one instance of every component and connects them through the event
//! channel: routed intents reach the capability dispatcher, capability
//! responses carrying message records are scored and offered to the
//! notification scheduler, and reactions feed the learning engine.

use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use herald_bus::{handler_fn, EventChannel};
use herald_coordinator::{BusExecutor, Coordinator};
use herald_core::config::HeraldConfig;
use herald_core::events::DomainEvent;
use herald_core::types::{Message, PriorityBand, PriorityScore, Reaction, SenderProfile, Timestamp};
use herald_core::{Event, HeraldError, Result};
use herald_notify::{Disposition, NotificationScheduler, NotifyError, SchedulerCore};
use herald_priority::{LearningEngine, LearningError, PriorityEngine, ProfileStore};
use herald_router::{
    CapabilityDispatcher, CapabilityRegistry, IntentClassifier, Router, TextGenerator,
};
use herald_storage::Persistence;
use serde::Serialize;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::capabilities::LocalCapability;

const TICK_PERIOD: Duration = Duration::from_secs(1);

/// How many prioritized message ids are remembered for de-duplication.
const SEEN_CAPACITY: usize = 10_000;

/// Outcome of prioritizing one inbound message.
#[derive(Debug, Clone, Serialize)]
pub struct Triaged {
    pub message_id: String,
    pub sender: String,
    pub score: f64,
    pub band: PriorityBand,
    pub disposition: Disposition,
}

/// Most recently prioritized message ids. At capacity the oldest id is
/// forgotten.
#[derive(Debug)]
struct SeenIds {
    capacity: usize,
    order: VecDeque<String>,
    ids: HashSet<String>,
}

impl SeenIds {
    fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            order: VecDeque::new(),
            ids: HashSet::new(),
        }
    }

    /// Remember `id`. Returns false if it is already remembered.
    fn insert(&mut self, id: &str) -> bool {
        if !self.ids.insert(id.to_string()) {
            return false;
        }
        self.order.push_back(id.to_string());
        while self.order.len() > self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.ids.remove(&oldest);
            }
        }
        true
    }
}

struct Background {
    stop: Vec<Arc<Notify>>,
    handles: Vec<JoinHandle<()>>,
}

pub struct Assistant {
    bus: Arc<EventChannel>,
    registry: Arc<CapabilityRegistry>,
    mail: Arc<LocalCapability>,
    chat: Arc<LocalCapability>,
    router: Router,
    coordinator: Coordinator,
    priority: PriorityEngine,
    learning: Arc<LearningEngine>,
    scheduler: Arc<NotificationScheduler>,
    high_threshold: f64,
    drain_on_shutdown: bool,
    seen: Mutex<SeenIds>,
    background: Mutex<Background>,
}

impl Assistant {
    /// Wire every component and start the event channel.
    pub async fn build(
        config: &HeraldConfig,
        store: Arc<dyn Persistence>,
        generator: Option<Arc<dyn TextGenerator>>,
    ) -> Result<Arc<Self>> {
        let bus = Arc::new(EventChannel::from_config(&config.bus));
        let namespace = config.router.capability_namespace.clone();

        // Capabilities
        let mail = Arc::new(LocalCapability::new("mail"));
        let chat = Arc::new(LocalCapability::new("chat"));
        let registry = Arc::new(CapabilityRegistry::new());
        registry.register(mail.clone());
        registry.register(chat.clone());
        let capability_timeout = Duration::from_secs(config.coordinator.capability_timeout_secs);
        CapabilityDispatcher::new(Arc::clone(&registry), &bus, capability_timeout)
            .attach(&namespace)?;

        // Routing
        let mut classifier = IntentClassifier::new(&config.router).with_history(Arc::clone(&store));
        if let Some(g) = &generator {
            classifier = classifier.with_generator(Arc::clone(g));
        }
        let router = Router::new(
            Arc::clone(&bus),
            Arc::clone(&registry),
            Arc::new(classifier),
            &config.router,
        );

        // Compound commands
        let executor = BusExecutor::new(Arc::clone(&bus), Arc::clone(&registry), namespace);
        executor.attach()?;
        let mut coordinator =
            Coordinator::new(config.coordinator.clone(), Arc::new(executor)).with_bus(Arc::clone(&bus));
        if let Some(g) = generator {
            coordinator = coordinator.with_generator(g);
        }

        // Prioritization and learning
        let learning = Arc::new(
            LearningEngine::new(config.learning.clone(), Arc::new(ProfileStore::new()), store)
                .with_bus(Arc::clone(&bus)),
        );
        match learning.hydrate().await {
            Ok(n) => info!(profiles = n, "Sender profiles loaded"),
            Err(e) => warn!(error = %e, "Starting with empty sender profiles"),
        }
        let priority = PriorityEngine::new(&config.priority, config.learning.cold_start_interactions);

        let core = SchedulerCore::new(&config.notifications, config.priority.urgent_threshold)?
            .with_local_time();
        let scheduler = Arc::new(NotificationScheduler::new(core, Arc::clone(&bus)));

        let assistant = Arc::new(Self {
            bus: Arc::clone(&bus),
            registry,
            mail,
            chat,
            router,
            coordinator,
            priority,
            learning,
            scheduler,
            high_threshold: config.notifications.high_threshold,
            drain_on_shutdown: config.bus.drain_on_shutdown,
            seen: Mutex::new(SeenIds::new(SEEN_CAPACITY)),
            background: Mutex::new(Background {
                stop: Vec::new(),
                handles: Vec::new(),
            }),
        });

        bus.subscribe("*.response", inbox_handler(Arc::downgrade(&assistant)))?;
        bus.start()?;
        info!(
            capabilities = ?assistant.registry.targets(),
            generator = assistant.router.classifier().generator().is_some(),
            "Assistant ready"
        );
        Ok(assistant)
    }

    pub fn bus(&self) -> &Arc<EventChannel> {
        &self.bus
    }

    /// Run the learning retry loop and the notification tick loop.
    pub fn start_background(&self) {
        let mut bg = self.background.lock().unwrap_or_else(|p| p.into_inner());
        if !bg.handles.is_empty() {
            return;
        }
        let stop = Arc::new(Notify::new());
        bg.handles.push(self.learning.spawn_retry_loop(Arc::clone(&stop)));
        bg.stop.push(stop);

        // One Notify per loop: notify_one keeps a permit for a loop that is
        // busy when shutdown starts.
        let stop = Arc::new(Notify::new());
        bg.handles
            .push(self.scheduler.spawn_tick_loop(TICK_PERIOD, Arc::clone(&stop)));
        bg.stop.push(stop);
    }

    /// Answer one user command.
    ///
    /// Compound commands go through the coordinator; everything else is
    /// classified and routed.
    pub async fn handle_command(&self, text: &str, context_id: &str) -> Result<String> {
        if self.coordinator.is_compound(text) {
            let report = self.coordinator.run(text, context_id).await?;
            Ok(report.summary())
        } else {
            let outcome = self.router.handle(text, context_id).await?;
            Ok(outcome.user_message())
        }
    }

    /// Accept an inbound message into the mail inbox and prioritize it.
    pub async fn ingest(&self, sender: &str, text: &str) -> Result<Triaged> {
        let message = Message::new(sender, text, Timestamp::now()).with_source("mail");
        self.mail.deliver(message.clone());
        let mut triaged = self.prioritize(vec![message]).await?;
        triaged
            .pop()
            .ok_or_else(|| HeraldError::Notification("message was already prioritized".into()))
    }

    /// Score and schedule messages not seen before.
    pub async fn prioritize(&self, messages: Vec<Message>) -> std::result::Result<Vec<Triaged>, NotifyError> {
        let mut out = Vec::new();
        for message in messages {
            let fresh = self
                .seen
                .lock()
                .unwrap_or_else(|p| p.into_inner())
                .insert(&message.id);
            if !fresh {
                continue;
            }
            let now = Timestamp::now();
            let profile = self.learning.effective_profile(&message.sender, now).await;
            let score = self.priority.score(&message, profile.as_ref(), now);
            let disposition = self.scheduler.submit_at(&message, &score, now).await?;
            out.push(self.triaged(&message, &score, disposition));
        }
        Ok(out)
    }

    fn triaged(&self, message: &Message, score: &PriorityScore, disposition: Disposition) -> Triaged {
        let band = self.priority.band(score, self.high_threshold);
        debug!(
            message_id = %message.id,
            score = score.value,
            band = %band,
            disposition = ?disposition,
            "Message triaged"
        );
        Triaged {
            message_id: message.id.clone(),
            sender: message.sender.clone(),
            score: score.value,
            band,
            disposition,
        }
    }

    pub async fn react(
        &self,
        sender: &str,
        reaction: Reaction,
    ) -> std::result::Result<SenderProfile, LearningError> {
        self.learning.learn(sender, reaction, Timestamp::now()).await
    }

    pub async fn stats(&self) -> serde_json::Value {
        serde_json::json!({
            "bus": self.bus.stats(),
            "capabilities": self.registry.targets(),
            "inbox": self.mail.inbox().len(),
            "outbox": {
                "mail": self.mail.outbox().len(),
                "chat": self.chat.outbox().len(),
            },
            "coordinator": self.coordinator.stats(),
            "learning": self.learning.stats(),
            "notifications": self.scheduler.stats().await,
            "top_senders": self.learning.profiles().top_senders(5).await,
        })
    }

    /// Stop background loops, flush buffered state and stop the channel.
    pub async fn shutdown(&self) {
        let (stop, handles) = {
            let mut bg = self.background.lock().unwrap_or_else(|p| p.into_inner());
            (std::mem::take(&mut bg.stop), std::mem::take(&mut bg.handles))
        };
        for s in &stop {
            s.notify_one();
        }
        for handle in handles {
            if let Err(e) = handle.await {
                warn!(error = %e, "Background task ended abnormally");
            }
        }

        if let Err(e) = self.scheduler.flush_all().await {
            warn!(error = %e, "Held notifications not delivered");
        }
        let flushed = self.learning.flush_pending().await;
        let pending = self.learning.pending_writes();
        if pending > 0 {
            warn!(flushed, pending, "Profile updates lost on shutdown");
        }
        self.bus.shutdown(self.drain_on_shutdown).await;
        info!("Assistant stopped");
    }
}

/// Message records carried in a capability response.
pub fn message_records(data: &serde_json::Value) -> Vec<Message> {
    data.get("records")
        .and_then(|r| r.as_array())
        .map(|records| {
            records
                .iter()
                .filter_map(|r| serde_json::from_value::<Message>(r.clone()).ok())
                .collect()
        })
        .unwrap_or_default()
}

fn inbox_handler(assistant: Weak<Assistant>) -> Arc<dyn herald_bus::EventHandler> {
    handler_fn("assistant-inbox", move |event: Event| {
        let assistant = assistant.clone();
        async move {
            let DomainEvent::CapabilityResponded {
                success: true, data, ..
            } = DomainEvent::from_event(&event)?
            else {
                return Ok(());
            };
            let messages = message_records(&data);
            if messages.is_empty() {
                return Ok(());
            }
            let Some(assistant) = assistant.upgrade() else {
                return Ok(());
            };
            // Scheduling publishes on the channel, so it must not run inside
            // the dispatch loop.
            tokio::spawn(async move {
                if let Err(e) = assistant.prioritize(messages).await {
                    warn!(error = %e, "Fetched messages not scheduled");
                }
            });
            Ok(())
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use herald_core::events::topics;
    use herald_core::types::Notification;
    use herald_storage::MemoryStore;
    use tokio::sync::mpsc;

    async fn assistant() -> Arc<Assistant> {
        let mut config = HeraldConfig::default();
        // Keep the quiet window empty so results do not depend on the clock.
        config.notifications.quiet_start = "00:00".into();
        config.notifications.quiet_end = "00:00".into();
        Assistant::build(&config, Arc::new(MemoryStore::new()), None)
            .await
            .unwrap()
    }

    fn notifications(a: &Assistant) -> mpsc::UnboundedReceiver<Notification> {
        let (tx, rx) = mpsc::unbounded_channel();
        a.bus()
            .subscribe(
                topics::NOTIFICATION_NEW,
                handler_fn("test-notifications", move |event: Event| {
                    let tx = tx.clone();
                    async move {
                        if let DomainEvent::NotificationReady { notification } =
                            DomainEvent::from_event(&event)?
                        {
                            tx.send(notification).map_err(|e| e.to_string())?;
                        }
                        Ok(())
                    }
                }),
            )
            .unwrap();
        rx
    }

    async fn next(rx: &mut mpsc::UnboundedReceiver<Notification>) -> Notification {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap()
    }

    #[test]
    fn test_message_records_skips_non_messages() {
        let msg = Message::new("alice", "hi", Timestamp(1));
        let data = serde_json::json!({
            "records": [serde_json::to_value(&msg).unwrap(), {"id": 3}],
            "count": 2
        });
        let found = message_records(&data);
        assert_eq!(found, vec![msg]);
        assert!(message_records(&serde_json::json!({"ok": true})).is_empty());
    }

    #[test]
    fn test_seen_ids_forget_oldest_at_capacity() {
        let mut seen = SeenIds::new(2);
        assert!(seen.insert("a"));
        assert!(seen.insert("b"));
        assert!(!seen.insert("a"));
        assert!(seen.insert("c"));
        assert_eq!(seen.ids.len(), 2);
        assert_eq!(seen.order, VecDeque::from(["b".to_string(), "c".to_string()]));
        // "a" was evicted, so it counts as new again.
        assert!(seen.insert("a"));
        assert!(!seen.insert("c"));
        assert!(!seen.ids.contains("b"));
    }

    #[tokio::test]
    async fn test_urgent_message_notifies_immediately() {
        let a = assistant().await;
        let mut rx = notifications(&a);
        let triaged = a
            .ingest("stranger@example.com", "URGENT: NEED THE CONTRACT SIGNED ASAP")
            .await
            .unwrap();
        assert_eq!(triaged.band, PriorityBand::Urgent);
        assert_eq!(triaged.disposition, Disposition::Delivered);
        let n = next(&mut rx).await;
        assert_eq!(n.items[0].message_id, triaged.message_id);
        a.shutdown().await;
    }

    #[tokio::test]
    async fn test_low_priority_batched_and_flushed_on_shutdown() {
        let a = assistant().await;
        let mut rx = notifications(&a);
        let first = a.ingest("bob", "lunch later?").await.unwrap();
        a.ingest("carol", "photos from the weekend").await.unwrap();
        assert_eq!(first.disposition, Disposition::Batched);

        a.shutdown().await;
        let n = next(&mut rx).await;
        assert_eq!(n.items.len(), 2);
    }

    #[tokio::test]
    async fn test_fetched_messages_are_prioritized_once() {
        let a = assistant().await;
        a.mail.deliver(Message::new("alice@example.com", "quarterly numbers", Timestamp::now()));

        let reply = a.handle_command("check my email", "ctx").await.unwrap();
        assert!(reply.starts_with("On it"), "reply was {}", reply);

        let mut batched = 0;
        for _ in 0..50 {
            batched = a.scheduler.stats().await.batched;
            if batched > 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(batched, 1);

        // A second fetch returns the same record, which is not scored again.
        a.handle_command("check my email", "ctx").await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(a.scheduler.stats().await.batched, 1);
        a.shutdown().await;
    }

    #[tokio::test]
    async fn test_unknown_service_is_rejected() {
        let a = assistant().await;
        let reply = a
            .handle_command("create a ticket in the tracker", "ctx")
            .await
            .unwrap();
        assert!(reply.contains("unknown service"), "reply was {}", reply);
        a.shutdown().await;
    }

    #[tokio::test]
    async fn test_compound_command_runs_through_coordinator() {
        let a = assistant().await;
        a.mail.deliver(Message::new("alice@example.com", "see attached", Timestamp::now()));
        let summary = a
            .handle_command("check my email from Alice then send a chat message to #team", "ctx")
            .await
            .unwrap();
        assert!(summary.to_lowercase().contains("completed"), "summary was {}", summary);
        assert_eq!(a.chat.outbox().len(), 1);
        assert_eq!(a.coordinator.stats().completed, 1);
        a.shutdown().await;
    }

    #[tokio::test]
    async fn test_reactions_update_profiles() {
        let a = assistant().await;
        let profile = a.react("alice@example.com", Reaction::PriorityMark).await.unwrap();
        assert_eq!(profile.priority_marks, 1);
        assert!(profile.weight > 50.0);
        let stats = a.stats().await;
        assert_eq!(stats["learning"]["updates"], 1);
        assert_eq!(stats["capabilities"], serde_json::json!(["chat", "mail"]));
        a.shutdown().await;
    }

    #[tokio::test]
    async fn test_quiet_digest_delivered_on_shutdown() {
        // A two-hour quiet window around the current local time.
        let local = chrono::Local::now().time();
        let mut config = HeraldConfig::default();
        config.notifications.quiet_start = (local - chrono::Duration::hours(1)).format("%H:%M").to_string();
        config.notifications.quiet_end = (local + chrono::Duration::hours(1)).format("%H:%M").to_string();
        let a = Assistant::build(&config, Arc::new(MemoryStore::new()), None)
            .await
            .unwrap();
        let mut rx = notifications(&a);

        let held = a.ingest("bob", "lunch later?").await.unwrap();
        assert_eq!(held.disposition, Disposition::QueuedQuiet);

        a.shutdown().await;
        let n = next(&mut rx).await;
        assert_eq!(n.kind, herald_core::types::NotificationKind::QuietDigest);
        assert_eq!(n.items[0].message_id, held.message_id);
    }

    #[tokio::test]
    async fn test_background_loops_stop_on_shutdown() {
        let a = assistant().await;
        let mut rx = notifications(&a);
        a.start_background();
        a.start_background();
        a.ingest("dana", "weekend plans").await.unwrap();
        a.shutdown().await;
        assert_eq!(next(&mut rx).await.items.len(), 1);
        assert!(!a.bus.is_running());
    }
}
