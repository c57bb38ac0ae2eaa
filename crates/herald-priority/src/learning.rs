//! Sender weight learning from user reactions.
//!
//! Each reaction moves the sender's weight by an exponential moving average
//! toward the reaction's signal. Updates are written through to persistence;
//! when that fails they wait in a bounded buffer for the retry loop, and the
//! caller never sees the failure.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use herald_bus::EventChannel;
use herald_core::config::LearningConfig;
use herald_core::events::DomainEvent;
use herald_core::types::{Reaction, SenderProfile, Timestamp, NEUTRAL_WEIGHT};
use herald_storage::{Persistence, StorageError};
use serde::Serialize;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::LearningError;
use crate::profiles::ProfileStore;

/// Key prefix of persisted profiles.
pub const PROFILE_KEY_PREFIX: &str = "profile:";

const SECS_PER_DAY: f64 = 86_400.0;

pub fn profile_key(sender: &str) -> String {
    format!("{}{}", PROFILE_KEY_PREFIX, sender)
}

/// Target weight a reaction pulls toward.
pub fn signal(reaction: Reaction) -> f64 {
    match reaction {
        Reaction::Reply => 85.0,
        Reaction::Ignore => -25.0,
        Reaction::Archive => 30.0,
        Reaction::PriorityMark => 100.0,
    }
}

// =============================================================================
// Write-behind buffer
// =============================================================================

/// Unpersisted profiles, one per sender. A newer write for a sender replaces
/// the older one; at capacity the oldest sender is evicted.
#[derive(Debug)]
struct PendingWrites {
    capacity: usize,
    order: VecDeque<String>,
    profiles: HashMap<String, SenderProfile>,
}

impl PendingWrites {
    fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            order: VecDeque::new(),
            profiles: HashMap::new(),
        }
    }

    /// Buffer `profile`, returning the sender evicted to make room.
    fn push(&mut self, profile: SenderProfile) -> Option<String> {
        let sender = profile.sender.clone();
        if self.profiles.insert(sender.clone(), profile).is_some() {
            self.order.retain(|s| s != &sender);
            self.order.push_back(sender);
            return None;
        }
        self.order.push_back(sender);
        if self.order.len() > self.capacity {
            let evicted = self.order.pop_front()?;
            self.profiles.remove(&evicted);
            return Some(evicted);
        }
        None
    }

    fn remove(&mut self, sender: &str) -> Option<SenderProfile> {
        let removed = self.profiles.remove(sender)?;
        self.order.retain(|s| s != sender);
        Some(removed)
    }

    fn drain(&mut self) -> Vec<SenderProfile> {
        let mut drained = Vec::with_capacity(self.order.len());
        while let Some(sender) = self.order.pop_front() {
            if let Some(p) = self.profiles.remove(&sender) {
                drained.push(p);
            }
        }
        drained
    }

    fn len(&self) -> usize {
        self.order.len()
    }
}

// =============================================================================
// Engine
// =============================================================================

/// Counters exposed for diagnostics.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct LearningStats {
    pub profiles: usize,
    pub pending_writes: usize,
    pub updates: u64,
    pub persisted: u64,
    pub buffered: u64,
    pub evicted: u64,
}

#[derive(Debug, Default)]
struct Counters {
    updates: AtomicU64,
    persisted: AtomicU64,
    buffered: AtomicU64,
    evicted: AtomicU64,
}

pub struct LearningEngine {
    config: LearningConfig,
    profiles: Arc<ProfileStore>,
    persistence: Arc<dyn Persistence>,
    bus: Option<Arc<EventChannel>>,
    pending: Mutex<PendingWrites>,
    counters: Counters,
}

impl LearningEngine {
    pub fn new(
        config: LearningConfig,
        profiles: Arc<ProfileStore>,
        persistence: Arc<dyn Persistence>,
    ) -> Self {
        let pending = Mutex::new(PendingWrites::new(config.buffer_capacity));
        Self {
            config,
            profiles,
            persistence,
            bus: None,
            pending,
            counters: Counters::default(),
        }
    }

    /// Publish a `profile_updated` event after every update.
    pub fn with_bus(mut self, bus: Arc<EventChannel>) -> Self {
        self.bus = Some(bus);
        self
    }

    pub fn profiles(&self) -> &Arc<ProfileStore> {
        &self.profiles
    }

    /// Record a reaction and return the updated profile.
    ///
    /// Only an empty sender is rejected. Persistence problems are buffered.
    pub async fn learn(
        &self,
        sender: &str,
        reaction: Reaction,
        now: Timestamp,
    ) -> Result<SenderProfile, LearningError> {
        let raw = sender;
        let sender = raw.trim();
        if sender.is_empty() {
            return Err(LearningError::InvalidSender(raw.to_string()));
        }
        // The sender stays locked until the write settles, so stored
        // profiles never go backwards.
        let mut profile = self.profiles.lock(sender, now).await;
        let pulled = neutral_pull(&profile, now, &self.config);
        let alpha = self.config.alpha;
        profile.set_weight(alpha * signal(reaction) + (1.0 - alpha) * pulled);
        match reaction {
            Reaction::Reply => profile.replies += 1,
            Reaction::Ignore => profile.ignores += 1,
            Reaction::Archive => profile.archives += 1,
            Reaction::PriorityMark => profile.priority_marks += 1,
        }
        profile.last_interaction = Some(now);
        let updated = (*profile).clone();
        self.counters.updates.fetch_add(1, Ordering::Relaxed);

        info!(
            sender,
            %reaction,
            weight = updated.weight,
            interactions = updated.interactions(),
            "Sender profile updated"
        );

        self.persist(&updated).await;
        drop(profile);
        self.announce(&updated, now).await;
        Ok(updated)
    }

    /// Profile as scoring should see it: stale opinions drift back toward
    /// neutral without the stored record being touched.
    pub async fn effective_profile(&self, sender: &str, now: Timestamp) -> Option<SenderProfile> {
        let mut profile = self.profiles.get(sender).await?;
        let pulled = neutral_pull(&profile, now, &self.config);
        profile.set_weight(pulled);
        Some(profile)
    }

    /// Whether a profile has enough interactions to be trusted.
    pub fn is_trusted(&self, profile: &SenderProfile) -> bool {
        profile.interactions() >= self.config.cold_start_interactions
    }

    async fn persist(&self, profile: &SenderProfile) {
        match self.write(profile).await {
            Ok(()) => {
                // A successful newer write supersedes anything buffered.
                self.pending_lock().remove(&profile.sender);
                self.counters.persisted.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                warn!(sender = %profile.sender, error = %e, "Profile not persisted, buffering for retry");
                self.buffer(profile.clone());
            }
        }
    }

    async fn write(&self, profile: &SenderProfile) -> Result<(), LearningError> {
        let value = serde_json::to_value(profile)?;
        let key = profile_key(&profile.sender);
        let timeout = Duration::from_millis(self.config.persist_timeout_ms);
        match tokio::time::timeout(timeout, self.persistence.set(&key, value)).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(StorageError::Timeout(self.config.persist_timeout_ms).into()),
        }
    }

    fn buffer(&self, profile: SenderProfile) {
        self.counters.buffered.fetch_add(1, Ordering::Relaxed);
        if let Some(evicted) = self.pending_lock().push(profile) {
            self.counters.evicted.fetch_add(1, Ordering::Relaxed);
            warn!(sender = %evicted, "Write-behind buffer full, dropped oldest pending profile");
        }
    }

    fn pending_lock(&self) -> std::sync::MutexGuard<'_, PendingWrites> {
        self.pending.lock().unwrap_or_else(|p| p.into_inner())
    }

    async fn announce(&self, profile: &SenderProfile, now: Timestamp) {
        let Some(bus) = &self.bus else {
            return;
        };
        let event = DomainEvent::ProfileUpdated {
            sender: profile.sender.clone(),
            weight: profile.weight,
            interactions: profile.interactions(),
            timestamp: now,
        };
        if let Err(e) = bus.publish_event(&event).await {
            debug!(error = %e, "Profile update not announced");
        }
    }

    pub fn pending_writes(&self) -> usize {
        self.pending_lock().len()
    }

    /// Retry every buffered write once. Returns how many were persisted.
    ///
    /// Each retry writes the sender's current profile under its lock rather
    /// than the buffered snapshot, which may be older than what memory holds.
    pub async fn flush_pending(&self) -> usize {
        let batch = self.pending_lock().drain();
        if batch.is_empty() {
            return 0;
        }
        let total = batch.len();
        let mut flushed = 0;
        for buffered in batch {
            let Some(profile) = self.profiles.lock_existing(&buffered.sender).await else {
                debug!(sender = %buffered.sender, "Dropping pending write for removed profile");
                continue;
            };
            match self.write(&profile).await {
                Ok(()) => {
                    flushed += 1;
                    self.counters.persisted.fetch_add(1, Ordering::Relaxed);
                    self.pending_lock().remove(&profile.sender);
                }
                Err(e) => {
                    debug!(sender = %profile.sender, error = %e, "Retry failed");
                    let mut pending = self.pending_lock();
                    if !pending.profiles.contains_key(&profile.sender) {
                        if let Some(evicted) = pending.push((*profile).clone()) {
                            self.counters.evicted.fetch_add(1, Ordering::Relaxed);
                            warn!(sender = %evicted, "Write-behind buffer full, dropped oldest pending profile");
                        }
                    }
                }
            }
        }
        info!(flushed, remaining = total - flushed, "Flushed pending profile writes");
        flushed
    }

    /// Periodically flush buffered writes until `shutdown` is notified, then
    /// make one last attempt.
    pub fn spawn_retry_loop(self: &Arc<Self>, shutdown: Arc<Notify>) -> JoinHandle<()> {
        let engine = Arc::clone(self);
        let period = Duration::from_secs(engine.config.retry_interval_secs.max(1));
        tokio::spawn(async move {
            info!(interval_secs = period.as_secs(), "Learning retry loop started");
            let mut interval = tokio::time::interval(period);
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        if engine.pending_writes() > 0 {
                            engine.flush_pending().await;
                        }
                    }
                    _ = shutdown.notified() => break,
                }
            }
            engine.flush_pending().await;
            info!("Learning retry loop stopped");
        })
    }

    /// Load persisted profiles into memory. Unreadable records are skipped.
    pub async fn hydrate(&self) -> Result<usize, LearningError> {
        let records = self.persistence.scan_prefix(PROFILE_KEY_PREFIX).await?;
        let mut loaded = 0;
        for (key, value) in records {
            match serde_json::from_value::<SenderProfile>(value) {
                Ok(profile) => {
                    self.profiles.insert(profile).await;
                    loaded += 1;
                }
                Err(e) => warn!(%key, error = %e, "Skipping unreadable profile"),
            }
        }
        info!(loaded, "Sender profiles hydrated");
        Ok(loaded)
    }

    /// Forget everything known about a sender, in memory and in storage.
    ///
    /// Waits for an in-flight update of the sender to finish writing, so the
    /// delete always lands after it.
    pub async fn revoke(&self, sender: &str) -> Result<bool, LearningError> {
        let held = self.profiles.lock_existing(sender).await;
        let buffered = self.pending_lock().remove(sender).is_some();
        let stored = self.persistence.delete(&profile_key(sender)).await;
        let in_memory = held.is_some();
        if let Some(guard) = held {
            self.profiles.retire(guard);
        }
        let stored = stored?;
        info!(sender, "Sender profile revoked");
        Ok(in_memory || buffered || stored)
    }

    pub fn stats(&self) -> LearningStats {
        LearningStats {
            profiles: self.profiles.len(),
            pending_writes: self.pending_writes(),
            updates: self.counters.updates.load(Ordering::Relaxed),
            persisted: self.counters.persisted.load(Ordering::Relaxed),
            buffered: self.counters.buffered.load(Ordering::Relaxed),
            evicted: self.counters.evicted.load(Ordering::Relaxed),
        }
    }
}

/// Weight after drifting toward neutral for the idle time beyond the
/// inactivity window, halving the distance every half-life.
fn neutral_pull(profile: &SenderProfile, now: Timestamp, config: &LearningConfig) -> f64 {
    let last = profile.last_interaction.unwrap_or(profile.first_seen);
    let idle_days = now.seconds_since(last) as f64 / SECS_PER_DAY;
    let excess = idle_days - f64::from(config.inactivity_days);
    if excess <= 0.0 || config.neutral_pull_half_life_days <= 0.0 {
        return profile.weight;
    }
    let factor = 0.5f64.powf(excess / config.neutral_pull_half_life_days);
    NEUTRAL_WEIGHT + (profile.weight - NEUTRAL_WEIGHT) * factor
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::PriorityEngine;
    use async_trait::async_trait;
    use herald_bus::handler_fn;
    use herald_core::config::PriorityConfig;
    use herald_core::events::topics;
    use herald_core::types::Message;
    use herald_core::Event;
    use herald_storage::{HistoryRecord, MemoryStore};
    use std::sync::atomic::AtomicBool;

    const DAY: i64 = 86_400;

    /// Delegates to a memory store but can be switched offline or made slow.
    /// `lag_first_reply` delays only the write of a one-reply profile.
    #[derive(Default)]
    struct FlakyStore {
        inner: MemoryStore,
        offline: AtomicBool,
        slow: AtomicBool,
        lag_first_reply: AtomicBool,
    }

    #[async_trait]
    impl Persistence for FlakyStore {
        async fn get(&self, key: &str) -> Result<Option<serde_json::Value>, StorageError> {
            self.inner.get(key).await
        }

        async fn set(&self, key: &str, value: serde_json::Value) -> Result<(), StorageError> {
            if self.slow.load(Ordering::SeqCst) {
                tokio::time::sleep(Duration::from_secs(10)).await;
            }
            if self.lag_first_reply.load(Ordering::SeqCst) && value["replies"] == 1 {
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
            if self.offline.load(Ordering::SeqCst) {
                return Err(StorageError::Unavailable("offline".into()));
            }
            self.inner.set(key, value).await
        }

        async fn delete(&self, key: &str) -> Result<bool, StorageError> {
            self.inner.delete(key).await
        }

        async fn scan_prefix(
            &self,
            prefix: &str,
        ) -> Result<Vec<(String, serde_json::Value)>, StorageError> {
            self.inner.scan_prefix(prefix).await
        }

        async fn append_history(
            &self,
            context_id: &str,
            record: HistoryRecord,
        ) -> Result<(), StorageError> {
            self.inner.append_history(context_id, record).await
        }

        async fn query_recent(
            &self,
            context_id: &str,
            limit: usize,
        ) -> Result<Vec<HistoryRecord>, StorageError> {
            self.inner.query_recent(context_id, limit).await
        }
    }

    fn engine_with(config: LearningConfig, store: Arc<FlakyStore>) -> LearningEngine {
        LearningEngine::new(config, Arc::new(ProfileStore::new()), store)
    }

    #[tokio::test]
    async fn test_five_replies_warm_up_sender() {
        let store = Arc::new(FlakyStore::default());
        let learning = engine_with(LearningConfig::default(), store);
        let priority = PriorityEngine::new(&PriorityConfig::default(), 5);
        let now = Timestamp(1_000);
        let msg = Message::new("alice@example.com", "quick question about lunch", now);
        let baseline = priority.score(&msg, None, now).value;

        let mut last_weight = NEUTRAL_WEIGHT;
        for n in 1..=5 {
            let p = learning
                .learn("alice@example.com", Reaction::Reply, now)
                .await
                .unwrap();
            assert!(p.weight > last_weight && p.weight < 85.0);
            last_weight = p.weight;

            let effective = learning.effective_profile("alice@example.com", now).await;
            let score = priority.score(&msg, effective.as_ref(), now);
            if n < 5 {
                assert!(score.breakdown.cold_start, "reply {} should not count yet", n);
                assert_eq!(score.value, baseline);
            } else {
                assert!(!score.breakdown.cold_start);
                assert!(score.value > baseline);
            }
            if n == 1 {
                assert!((p.weight - 60.5).abs() < 1e-9);
            }
            if n == 2 {
                assert!((p.weight - 67.85).abs() < 1e-9);
            }
        }
        assert!(learning.is_trusted(&learning.profiles().get("alice@example.com").await.unwrap()));
    }

    #[tokio::test]
    async fn test_weight_stays_clamped() {
        let learning = engine_with(
            LearningConfig {
                alpha: 1.0,
                ..Default::default()
            },
            Arc::new(FlakyStore::default()),
        );
        let p = learning.learn("spam", Reaction::Ignore, Timestamp(0)).await.unwrap();
        assert_eq!(p.weight, 0.0);
        for reaction in [Reaction::Ignore, Reaction::PriorityMark, Reaction::PriorityMark, Reaction::Archive] {
            let p = learning.learn("spam", reaction, Timestamp(0)).await.unwrap();
            assert!((0.0..=100.0).contains(&p.weight));
        }
        let p = learning.profiles().get("spam").await.unwrap();
        assert_eq!(p.ignores, 2);
        assert_eq!(p.priority_marks, 2);
        assert_eq!(p.archives, 1);
        assert_eq!(p.weight, 30.0);
    }

    #[tokio::test]
    async fn test_blank_sender_rejected() {
        let learning = engine_with(LearningConfig::default(), Arc::new(FlakyStore::default()));
        let err = learning.learn("   ", Reaction::Reply, Timestamp(0)).await.unwrap_err();
        assert!(matches!(err, LearningError::InvalidSender(_)));
        assert_eq!(learning.stats().updates, 0);
    }

    #[tokio::test]
    async fn test_writes_through_to_persistence() {
        let store = Arc::new(FlakyStore::default());
        let learning = engine_with(LearningConfig::default(), Arc::clone(&store));
        learning.learn("bob", Reaction::Reply, Timestamp(5)).await.unwrap();

        let stored = store.get("profile:bob").await.unwrap().unwrap();
        let profile: SenderProfile = serde_json::from_value(stored).unwrap();
        assert_eq!(profile.replies, 1);
        assert_eq!(learning.stats().persisted, 1);
        assert_eq!(learning.pending_writes(), 0);
    }

    #[tokio::test]
    async fn test_outage_buffers_then_flushes() {
        let store = Arc::new(FlakyStore::default());
        store.offline.store(true, Ordering::SeqCst);
        let learning = engine_with(LearningConfig::default(), Arc::clone(&store));

        for sender in ["a", "b", "c"] {
            learning.learn(sender, Reaction::Reply, Timestamp(0)).await.unwrap();
        }
        // Second write for "a" replaces the first.
        learning.learn("a", Reaction::Reply, Timestamp(1)).await.unwrap();
        assert_eq!(learning.pending_writes(), 3);
        assert_eq!(learning.flush_pending().await, 0);
        assert_eq!(learning.pending_writes(), 3);

        store.offline.store(false, Ordering::SeqCst);
        assert_eq!(learning.flush_pending().await, 3);
        assert_eq!(learning.pending_writes(), 0);

        let stored: SenderProfile =
            serde_json::from_value(store.get("profile:a").await.unwrap().unwrap()).unwrap();
        assert_eq!(stored.replies, 2);
    }

    #[tokio::test]
    async fn test_buffer_evicts_oldest_at_capacity() {
        let store = Arc::new(FlakyStore::default());
        store.offline.store(true, Ordering::SeqCst);
        let learning = engine_with(
            LearningConfig {
                buffer_capacity: 2,
                ..Default::default()
            },
            Arc::clone(&store),
        );
        for sender in ["first", "second", "third"] {
            learning.learn(sender, Reaction::Archive, Timestamp(0)).await.unwrap();
        }
        let stats = learning.stats();
        assert_eq!(stats.pending_writes, 2);
        assert_eq!(stats.evicted, 1);
        assert_eq!(stats.buffered, 3);

        store.offline.store(false, Ordering::SeqCst);
        learning.flush_pending().await;
        assert!(store.get("profile:first").await.unwrap().is_none());
        assert!(store.get("profile:third").await.unwrap().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_persistence_never_blocks_learning() {
        let store = Arc::new(FlakyStore::default());
        store.slow.store(true, Ordering::SeqCst);
        let learning = engine_with(
            LearningConfig {
                persist_timeout_ms: 50,
                ..Default::default()
            },
            store,
        );
        let started = tokio::time::Instant::now();
        let p = learning.learn("carol", Reaction::Reply, Timestamp(0)).await.unwrap();
        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(p.replies, 1);
        assert_eq!(learning.pending_writes(), 1);
    }

    #[tokio::test]
    async fn test_stale_profile_drifts_toward_neutral() {
        let learning = engine_with(LearningConfig::default(), Arc::new(FlakyStore::default()));
        let mut profile = SenderProfile::new("dave", Timestamp(0));
        profile.set_weight(90.0);
        profile.replies = 6;
        profile.last_interaction = Some(Timestamp(0));
        learning.profiles().insert(profile).await;

        let fresh = learning.effective_profile("dave", Timestamp(10 * DAY)).await.unwrap();
        assert_eq!(fresh.weight, 90.0);

        // 90 idle days: 60 beyond the window, two half-lives.
        let stale = learning.effective_profile("dave", Timestamp(90 * DAY)).await.unwrap();
        assert!((stale.weight - 60.0).abs() < 1e-9);
        // Stored record is untouched by reads.
        assert_eq!(learning.profiles().get("dave").await.unwrap().weight, 90.0);

        // The next update starts from the pulled weight.
        let p = learning.learn("dave", Reaction::Reply, Timestamp(90 * DAY)).await.unwrap();
        assert!((p.weight - (0.3 * 85.0 + 0.7 * 60.0)).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_hydrate_and_revoke() {
        let store = Arc::new(FlakyStore::default());
        let first = engine_with(LearningConfig::default(), Arc::clone(&store));
        first.learn("erin", Reaction::PriorityMark, Timestamp(0)).await.unwrap();
        store.set("profile:broken", serde_json::json!("nope")).await.unwrap();

        let second = engine_with(LearningConfig::default(), Arc::clone(&store));
        assert_eq!(second.hydrate().await.unwrap(), 1);
        assert_eq!(second.profiles().get("erin").await.unwrap().priority_marks, 1);

        assert!(second.revoke("erin").await.unwrap());
        assert!(second.profiles().get("erin").await.is_none());
        assert!(store.get("profile:erin").await.unwrap().is_none());
        assert!(!second.revoke("erin").await.unwrap());
    }

    #[tokio::test]
    async fn test_updates_are_announced() {
        let bus = Arc::new(EventChannel::new(16));
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        bus.subscribe(
            topics::LEARNING_PROFILE_UPDATED,
            handler_fn("test", move |event: Event| {
                let tx = tx.clone();
                async move {
                    tx.send(DomainEvent::from_event(&event)?)
                        .map_err(|e| e.to_string())?;
                    Ok(())
                }
            }),
        )
        .unwrap();
        bus.start().unwrap();

        let learning = engine_with(LearningConfig::default(), Arc::new(FlakyStore::default()))
            .with_bus(Arc::clone(&bus));
        learning.learn("frank", Reaction::Reply, Timestamp(3)).await.unwrap();

        let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        match event {
            DomainEvent::ProfileUpdated { sender, interactions, .. } => {
                assert_eq!(sender, "frank");
                assert_eq!(interactions, 1);
            }
            other => panic!("unexpected event {:?}", other),
        }
        bus.shutdown(true).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_loop_flushes_and_stops() {
        let store = Arc::new(FlakyStore::default());
        store.offline.store(true, Ordering::SeqCst);
        let learning = Arc::new(engine_with(
            LearningConfig {
                retry_interval_secs: 1,
                ..Default::default()
            },
            Arc::clone(&store),
        ));
        learning.learn("gina", Reaction::Reply, Timestamp(0)).await.unwrap();
        let shutdown = Arc::new(Notify::new());
        let handle = learning.spawn_retry_loop(Arc::clone(&shutdown));

        store.offline.store(false, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(learning.pending_writes(), 0);

        shutdown.notify_one();
        handle.await.unwrap();
        assert!(store.get("profile:gina").await.unwrap().is_some());
    }

    fn stored_profile(value: Option<serde_json::Value>) -> Option<SenderProfile> {
        value.map(|v| serde_json::from_value(v).unwrap())
    }

    #[tokio::test(start_paused = true)]
    async fn test_same_sender_writes_land_in_update_order() {
        let store = Arc::new(FlakyStore::default());
        store.lag_first_reply.store(true, Ordering::SeqCst);
        let learning = Arc::new(engine_with(LearningConfig::default(), Arc::clone(&store)));

        let first = {
            let learning = Arc::clone(&learning);
            tokio::spawn(async move { learning.learn("x", Reaction::Reply, Timestamp(0)).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        let second = {
            let learning = Arc::clone(&learning);
            tokio::spawn(async move { learning.learn("x", Reaction::Reply, Timestamp(1)).await })
        };
        first.await.unwrap().unwrap();
        second.await.unwrap().unwrap();

        let in_memory = learning.profiles().get("x").await.unwrap();
        let stored = stored_profile(store.get("profile:x").await.unwrap()).unwrap();
        assert_eq!(in_memory.replies, 2);
        assert_eq!(stored.replies, in_memory.replies);
        assert_eq!(stored.weight, in_memory.weight);
    }

    #[tokio::test]
    async fn test_flush_writes_current_profile_not_buffered_snapshot() {
        let store = Arc::new(FlakyStore::default());
        store.offline.store(true, Ordering::SeqCst);
        let learning = engine_with(LearningConfig::default(), Arc::clone(&store));
        learning.learn("hal", Reaction::Reply, Timestamp(0)).await.unwrap();
        assert_eq!(learning.pending_writes(), 1);

        // Memory moves on while the buffered snapshot still says one reply.
        learning
            .profiles()
            .update("hal", Timestamp(0), |p| p.replies = 7)
            .await;
        store.offline.store(false, Ordering::SeqCst);
        assert_eq!(learning.flush_pending().await, 1);

        let stored = stored_profile(store.get("profile:hal").await.unwrap()).unwrap();
        assert_eq!(stored.replies, 7);
    }

    #[tokio::test(start_paused = true)]
    async fn test_revoke_during_update_leaves_nothing_stored() {
        let store = Arc::new(FlakyStore::default());
        store.lag_first_reply.store(true, Ordering::SeqCst);
        let learning = Arc::new(engine_with(LearningConfig::default(), Arc::clone(&store)));

        let update = {
            let learning = Arc::clone(&learning);
            tokio::spawn(async move { learning.learn("ivy", Reaction::Reply, Timestamp(0)).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(learning.revoke("ivy").await.unwrap());
        update.await.unwrap().unwrap();

        assert!(store.get("profile:ivy").await.unwrap().is_none());
        assert!(learning.profiles().get("ivy").await.is_none());
        assert_eq!(learning.flush_pending().await, 0);

        let rehydrated = engine_with(LearningConfig::default(), Arc::clone(&store));
        assert_eq!(rehydrated.hydrate().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_revoke_drops_buffered_write() {
        let store = Arc::new(FlakyStore::default());
        store.offline.store(true, Ordering::SeqCst);
        let learning = engine_with(LearningConfig::default(), Arc::clone(&store));
        learning.learn("jo", Reaction::Archive, Timestamp(0)).await.unwrap();
        assert!(learning.revoke("jo").await.unwrap());

        store.offline.store(false, Ordering::SeqCst);
        assert_eq!(learning.flush_pending().await, 0);
        assert!(store.get("profile:jo").await.unwrap().is_none());
    }
}
