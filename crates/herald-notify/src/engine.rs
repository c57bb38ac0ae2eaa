//! Delivery decisions driven by an explicit clock.

use std::collections::VecDeque;
use std::fmt;

use chrono::{FixedOffset, Local, NaiveTime, Offset, Utc};
use herald_core::config::NotificationConfig;
use herald_core::types::{
    Message, Notification, NotificationItem, NotificationKind, PriorityBand, PriorityScore,
    QuietHoursPolicy, Timestamp,
};
use serde::Serialize;
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::NotifyError;

const PREVIEW_CHARS: usize = 80;

/// What happened to an offered message.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Disposition {
    /// Delivered on its own right away.
    Delivered,
    /// Added to the rolling batch.
    Batched,
    /// Held until the quiet window ends.
    QueuedQuiet,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct SchedulerStats {
    pub delivered_immediately: u64,
    pub batched: u64,
    pub queued_quiet: u64,
    pub notifications_sent: u64,
    pub digests_sent: u64,
    pub pending_batch: usize,
    pub pending_quiet: usize,
    /// Decided notifications the channel has not accepted yet.
    pub pending_delivery: usize,
}

/// UTC offset in effect at a given instant.
struct Zone(Box<dyn Fn(Timestamp) -> FixedOffset + Send + Sync>);

impl fmt::Debug for Zone {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Zone")
    }
}

/// Quiet hours, batching and digest state.
///
/// Every method takes `now`, so the same inputs always produce the same
/// notifications. Quiet hours are evaluated in the offset the configured
/// zone reports for `now`, so a daylight-saving change moves the window on
/// the next call.
#[derive(Debug)]
pub struct SchedulerCore {
    policy: QuietHoursPolicy,
    zone: Zone,
    high_threshold: f64,
    urgent_threshold: f64,
    batch_window_secs: i64,
    batch: Vec<NotificationItem>,
    batch_opened: Option<Timestamp>,
    quiet_queue: Vec<NotificationItem>,
    history: VecDeque<Notification>,
    history_limit: usize,
    stats: SchedulerStats,
}

impl SchedulerCore {
    pub fn new(config: &NotificationConfig, urgent_threshold: f64) -> Result<Self, NotifyError> {
        let policy = config
            .policy()
            .map_err(|e| NotifyError::InvalidPolicy(e.to_string()))?;
        Ok(Self {
            policy,
            zone: Zone(Box::new(|_: Timestamp| Utc.fix())),
            high_threshold: config.high_threshold,
            urgent_threshold,
            batch_window_secs: i64::try_from(config.batch_window_secs).unwrap_or(i64::MAX),
            batch: Vec::new(),
            batch_opened: None,
            quiet_queue: Vec::new(),
            history: VecDeque::new(),
            history_limit: config.history_limit.max(1),
            stats: SchedulerStats::default(),
        })
    }

    /// Evaluate quiet hours in a fixed `offset` instead of UTC.
    pub fn with_offset(self, offset: FixedOffset) -> Self {
        self.with_zone(move |_| offset)
    }

    /// Evaluate quiet hours in the offset `zone` returns for each instant.
    pub fn with_zone<F>(mut self, zone: F) -> Self
    where
        F: Fn(Timestamp) -> FixedOffset + Send + Sync + 'static,
    {
        self.zone = Zone(Box::new(zone));
        self
    }

    /// Follow the host's local time zone, including daylight-saving changes.
    pub fn with_local_time(self) -> Self {
        self.with_zone(|now| now.to_datetime().with_timezone(&Local).offset().fix())
    }

    pub fn policy(&self) -> &QuietHoursPolicy {
        &self.policy
    }

    fn local_time(&self, now: Timestamp) -> NaiveTime {
        let offset = (self.zone.0)(now);
        now.to_datetime().with_timezone(&offset).time()
    }

    pub fn in_quiet_hours(&self, now: Timestamp) -> bool {
        self.policy.contains(self.local_time(now))
    }

    /// Urgent by score or by upstream classification.
    pub fn is_urgent(&self, score: &PriorityScore) -> bool {
        score.value >= self.urgent_threshold || score.breakdown.explicit_urgent
    }

    pub fn band(&self, score: &PriorityScore) -> PriorityBand {
        if score.breakdown.explicit_urgent {
            PriorityBand::Urgent
        } else {
            score.band(self.high_threshold, self.urgent_threshold)
        }
    }

    /// Decide what to do with a scored message. Returns the disposition and
    /// every notification that became due, oldest first.
    pub fn offer(
        &mut self,
        message: &Message,
        score: &PriorityScore,
        now: Timestamp,
    ) -> (Disposition, Vec<Notification>) {
        let mut due = self.tick(now);
        let item = notification_item(message, score, self.band(score));
        let urgent = self.is_urgent(score);

        let disposition = if self.in_quiet_hours(now) && !(urgent && self.policy.urgent_override) {
            info!(message_id = %item.message_id, score = item.score, "Quiet hours, holding message");
            self.quiet_queue.push(item);
            self.stats.queued_quiet += 1;
            Disposition::QueuedQuiet
        } else if urgent || score.value >= self.high_threshold {
            due.push(self.record(single(item, now)));
            self.stats.delivered_immediately += 1;
            Disposition::Delivered
        } else {
            if self.batch.is_empty() {
                self.batch_opened = Some(now);
            }
            debug!(message_id = %item.message_id, pending = self.batch.len() + 1, "Message batched");
            self.batch.push(item);
            self.stats.batched += 1;
            Disposition::Batched
        };
        self.refresh_pending();
        (disposition, due)
    }

    /// Advance the clock: flush the quiet digest once the window has ended
    /// and the batch once its window has elapsed.
    pub fn tick(&mut self, now: Timestamp) -> Vec<Notification> {
        let mut due = Vec::new();
        if self.in_quiet_hours(now) {
            // A batch opened before quiet hours waits for the digest.
            if !self.batch.is_empty() {
                self.quiet_queue.append(&mut self.batch);
                self.batch_opened = None;
            }
        } else {
            if !self.quiet_queue.is_empty() {
                let items = std::mem::take(&mut self.quiet_queue);
                info!(count = items.len(), "Quiet hours over, sending digest");
                due.push(self.record(digest(items, now)));
                self.stats.digests_sent += 1;
            }
            let window_elapsed = self
                .batch_opened
                .is_some_and(|opened| now.seconds_since(opened) >= self.batch_window_secs);
            if window_elapsed {
                due.extend(self.flush_batch(now));
            }
        }
        self.refresh_pending();
        due
    }

    /// Emit the open batch regardless of its age.
    pub fn flush_batch(&mut self, now: Timestamp) -> Option<Notification> {
        self.batch_opened = None;
        if self.batch.is_empty() {
            return None;
        }
        let items = std::mem::take(&mut self.batch);
        let notification = if items.len() == 1 {
            items.into_iter().next().map(|item| single(item, now))?
        } else {
            batch(items, now)
        };
        self.refresh_pending();
        Some(self.record(notification))
    }

    /// Emit the quiet digest now, even inside the window, e.g. before
    /// shutdown.
    pub fn flush_quiet(&mut self, now: Timestamp) -> Option<Notification> {
        if self.quiet_queue.is_empty() {
            return None;
        }
        let items = std::mem::take(&mut self.quiet_queue);
        info!(count = items.len(), "Sending quiet digest early");
        self.stats.digests_sent += 1;
        self.refresh_pending();
        Some(self.record(digest(items, now)))
    }

    fn record(&mut self, notification: Notification) -> Notification {
        self.stats.notifications_sent += 1;
        self.history.push_back(notification.clone());
        while self.history.len() > self.history_limit {
            self.history.pop_front();
        }
        notification
    }

    fn refresh_pending(&mut self) {
        self.stats.pending_batch = self.batch.len();
        self.stats.pending_quiet = self.quiet_queue.len();
    }

    /// The most recent `limit` notifications, oldest first.
    pub fn history(&self, limit: usize) -> Vec<Notification> {
        let skip = self.history.len().saturating_sub(limit);
        self.history.iter().skip(skip).cloned().collect()
    }

    pub fn stats(&self) -> SchedulerStats {
        self.stats.clone()
    }
}

/// Summarize a scored message for display.
pub fn notification_item(
    message: &Message,
    score: &PriorityScore,
    band: PriorityBand,
) -> NotificationItem {
    let text = message.subject.as_deref().filter(|s| !s.is_empty()).unwrap_or(&message.text);
    let flat = text.split_whitespace().collect::<Vec<_>>().join(" ");
    let preview = if flat.chars().count() > PREVIEW_CHARS {
        let cut: String = flat.chars().take(PREVIEW_CHARS - 3).collect();
        format!("{}...", cut)
    } else {
        flat
    };
    NotificationItem {
        message_id: message.id.clone(),
        sender: message.sender.clone(),
        preview,
        score: score.value,
        band,
    }
}

fn single(item: NotificationItem, now: Timestamp) -> Notification {
    let title = match item.band {
        PriorityBand::Urgent => format!("Urgent: {}", item.sender),
        PriorityBand::High => format!("Important: {}", item.sender),
        _ => format!("New message from {}", item.sender),
    };
    Notification {
        id: Uuid::new_v4(),
        kind: NotificationKind::Single,
        title,
        body: item.preview.clone(),
        band: item.band,
        items: vec![item],
        created_at: now,
    }
}

fn lines(items: &[NotificationItem]) -> String {
    items
        .iter()
        .map(|i| format!("{}: {}", i.sender, i.preview))
        .collect::<Vec<_>>()
        .join("\n")
}

fn highest_band(items: &[NotificationItem]) -> PriorityBand {
    items
        .iter()
        .map(|i| i.band)
        .max()
        .unwrap_or(PriorityBand::Low)
}

fn batch(items: Vec<NotificationItem>, now: Timestamp) -> Notification {
    Notification {
        id: Uuid::new_v4(),
        kind: NotificationKind::Batch,
        title: format!("{} new messages", items.len()),
        body: lines(&items),
        band: highest_band(&items),
        items,
        created_at: now,
    }
}

fn digest(mut items: Vec<NotificationItem>, now: Timestamp) -> Notification {
    items.sort_by(|a, b| b.score.total_cmp(&a.score));
    Notification {
        id: Uuid::new_v4(),
        kind: NotificationKind::QuietDigest,
        title: format!("Missed while quiet ({})", items.len()),
        body: lines(&items),
        band: highest_band(&items),
        items,
        created_at: now,
    }
}
