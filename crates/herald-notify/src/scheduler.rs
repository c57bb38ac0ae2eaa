//! Async scheduler publishing on the event channel.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use herald_bus::EventChannel;
use herald_core::events::DomainEvent;
use herald_core::types::{Message, Notification, PriorityScore, Timestamp};
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::engine::{Disposition, SchedulerCore, SchedulerStats};
use crate::error::NotifyError;

/// Drives a [`SchedulerCore`] from the wall clock and publishes what it
/// decides. Notifications the channel refuses stay queued, in order, and go
/// out ahead of anything newer on the next submit or tick.
pub struct NotificationScheduler {
    core: Mutex<SchedulerCore>,
    bus: Arc<EventChannel>,
    undelivered: Mutex<VecDeque<Notification>>,
}

impl NotificationScheduler {
    pub fn new(core: SchedulerCore, bus: Arc<EventChannel>) -> Self {
        Self {
            core: Mutex::new(core),
            bus,
            undelivered: Mutex::new(VecDeque::new()),
        }
    }

    pub async fn submit(
        &self,
        message: &Message,
        score: &PriorityScore,
    ) -> Result<Disposition, NotifyError> {
        self.submit_at(message, score, Timestamp::now()).await
    }

    pub async fn submit_at(
        &self,
        message: &Message,
        score: &PriorityScore,
        now: Timestamp,
    ) -> Result<Disposition, NotifyError> {
        let (disposition, due) = self.core.lock().await.offer(message, score, now);
        self.publish(due).await?;
        Ok(disposition)
    }

    pub async fn tick_at(&self, now: Timestamp) -> Result<usize, NotifyError> {
        let due = self.core.lock().await.tick(now);
        let sent = due.len();
        self.publish(due).await?;
        Ok(sent)
    }

    /// Send the open batch now, e.g. before shutdown.
    pub async fn flush_batch(&self) -> Result<bool, NotifyError> {
        let flushed = self.core.lock().await.flush_batch(Timestamp::now());
        let sent = flushed.is_some();
        self.publish(flushed.into_iter().collect()).await?;
        Ok(sent)
    }

    /// Send the open batch and any held quiet digest, e.g. before shutdown.
    /// Returns how many notifications were produced.
    pub async fn flush_all(&self) -> Result<usize, NotifyError> {
        let flushed: Vec<Notification> = {
            let mut core = self.core.lock().await;
            let now = Timestamp::now();
            core.flush_quiet(now).into_iter().chain(core.flush_batch(now)).collect()
        };
        let sent = flushed.len();
        self.publish(flushed).await?;
        Ok(sent)
    }

    async fn publish(&self, notifications: Vec<Notification>) -> Result<(), NotifyError> {
        let mut queue = self.undelivered.lock().await;
        queue.extend(notifications);
        while let Some(notification) = queue.front() {
            let event = DomainEvent::NotificationReady {
                notification: notification.clone(),
            };
            if let Err(e) = self.bus.publish_event(&event).await {
                warn!(error = %e, undelivered = queue.len(), "Notification not published, keeping it for the next attempt");
                return Err(e.into());
            }
            info!(
                kind = ?notification.kind,
                band = %notification.band,
                items = notification.items.len(),
                title = %notification.title,
                "Notification ready"
            );
            queue.pop_front();
        }
        Ok(())
    }

    /// Tick every `period` until `shutdown` is notified, then send whatever
    /// batch or digest is still held.
    pub fn spawn_tick_loop(self: &Arc<Self>, period: Duration, shutdown: Arc<Notify>) -> JoinHandle<()> {
        let scheduler = Arc::clone(self);
        tokio::spawn(async move {
            info!(period_ms = period.as_millis() as u64, "Notification tick loop started");
            let mut interval = tokio::time::interval(period);
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        if let Err(e) = scheduler.tick_at(Timestamp::now()).await {
                            warn!(error = %e, "Notification tick failed");
                        }
                    }
                    _ = shutdown.notified() => break,
                }
            }
            if let Err(e) = scheduler.flush_all().await {
                warn!(error = %e, "Final notifications not delivered");
            }
            info!("Notification tick loop stopped");
        })
    }

    pub async fn history(&self, limit: usize) -> Vec<Notification> {
        self.core.lock().await.history(limit)
    }

    pub async fn stats(&self) -> SchedulerStats {
        let mut stats = self.core.lock().await.stats();
        stats.pending_delivery = self.undelivered.lock().await.len();
        stats
    }
}
