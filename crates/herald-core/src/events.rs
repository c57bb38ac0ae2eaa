use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::types::{Intent, Notification, Timestamp};

/// Topic naming shared with collaborators.
///
/// - `<capability>.<target>.<action>` for routed intents
/// - `<capability>.response` for capability results
/// - `notification.new` for scheduled output
/// - `<component>.error` for isolated failures
pub mod topics {
    pub const NOTIFICATION_NEW: &str = "notification.new";
    pub const ROUTER_CLARIFICATION: &str = "router.clarification";
    pub const ROUTER_ERROR: &str = "router.error";
    pub const COORDINATOR_COMPLETED: &str = "coordinator.completed";
    pub const COORDINATOR_FAILED: &str = "coordinator.failed";
    pub const COORDINATOR_ERROR: &str = "coordinator.error";
    pub const LEARNING_PROFILE_UPDATED: &str = "learning.profile_updated";

    pub fn routed(namespace: &str, target: &str, action: &str) -> String {
        format!("{}.{}.{}", namespace, target, action)
    }

    pub fn response(capability: &str) -> String {
        format!("{}.response", capability)
    }

    pub fn error(component: &str) -> String {
        format!("{}.error", component)
    }

    /// First dot-separated segment of a topic.
    pub fn component_of(topic: &str) -> &str {
        topic.split('.').next().unwrap_or(topic)
    }
}

/// Envelope carried by the event channel.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub id: Uuid,
    pub topic: String,
    pub payload: serde_json::Value,
    pub published_at: Timestamp,
}

impl Event {
    pub fn new(topic: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            topic: topic.into(),
            payload,
            published_at: Timestamp::now(),
        }
    }

    /// Deserialize the payload into a typed value.
    pub fn payload_as<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_value(self.payload.clone())
    }
}

/// All domain events that flow through the event channel.
///
/// Each variant knows the topic it is published on; the serialized variant
/// is the event payload.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
#[non_exhaustive]
pub enum DomainEvent {
    // =========================================================================
    // Routing
    // =========================================================================
    /// An intent passed the confidence threshold and was dispatched.
    IntentRouted {
        topic: String,
        intent: Intent,
        #[serde(default)]
        correlation_id: Option<Uuid>,
        timestamp: Timestamp,
    },

    /// Confidence was below threshold; the user is asked to rephrase.
    ClarificationRequested {
        raw_input: String,
        context_id: String,
        confidence: f64,
        message: String,
        timestamp: Timestamp,
    },

    /// The intent named a target with no registered capability.
    RoutingFailed {
        target: String,
        action: String,
        raw_input: String,
        message: String,
        timestamp: Timestamp,
    },

    /// A capability finished handling a routed intent.
    CapabilityResponded {
        capability: String,
        action: String,
        success: bool,
        data: serde_json::Value,
        error: Option<String>,
        retryable: bool,
        #[serde(default)]
        correlation_id: Option<Uuid>,
        #[serde(default)]
        intent: Option<Intent>,
        timestamp: Timestamp,
    },

    // =========================================================================
    // Multi-step commands
    // =========================================================================
    CommandCompleted {
        command_id: Uuid,
        original_text: String,
        completed_steps: Vec<String>,
        duration_ms: u64,
        timestamp: Timestamp,
    },

    /// One consolidated report naming the failing step and everything that
    /// completed before it.
    CommandFailed {
        command_id: Uuid,
        original_text: String,
        failing_step: Option<String>,
        error: String,
        completed_steps: Vec<String>,
        cancelled_steps: Vec<String>,
        timestamp: Timestamp,
    },

    // =========================================================================
    // Notifications and learning
    // =========================================================================
    NotificationReady {
        notification: Notification,
    },

    ProfileUpdated {
        sender: String,
        weight: f64,
        interactions: u32,
        timestamp: Timestamp,
    },

    // =========================================================================
    // Failures
    // =========================================================================
    /// A subscriber failed or panicked while handling an event.
    HandlerFailed {
        handler: String,
        topic: String,
        payload: serde_json::Value,
        error: String,
        timestamp: Timestamp,
    },
}

impl DomainEvent {
    /// Returns the timestamp of the event.
    pub fn timestamp(&self) -> Timestamp {
        match self {
            DomainEvent::IntentRouted { timestamp, .. }
            | DomainEvent::ClarificationRequested { timestamp, .. }
            | DomainEvent::RoutingFailed { timestamp, .. }
            | DomainEvent::CapabilityResponded { timestamp, .. }
            | DomainEvent::CommandCompleted { timestamp, .. }
            | DomainEvent::CommandFailed { timestamp, .. }
            | DomainEvent::ProfileUpdated { timestamp, .. }
            | DomainEvent::HandlerFailed { timestamp, .. } => *timestamp,
            DomainEvent::NotificationReady { notification } => notification.created_at,
        }
    }

    /// Returns a human-readable event name for logging.
    pub fn event_name(&self) -> &'static str {
        match self {
            DomainEvent::IntentRouted { .. } => "intent_routed",
            DomainEvent::ClarificationRequested { .. } => "clarification_requested",
            DomainEvent::RoutingFailed { .. } => "routing_failed",
            DomainEvent::CapabilityResponded { .. } => "capability_responded",
            DomainEvent::CommandCompleted { .. } => "command_completed",
            DomainEvent::CommandFailed { .. } => "command_failed",
            DomainEvent::NotificationReady { .. } => "notification_ready",
            DomainEvent::ProfileUpdated { .. } => "profile_updated",
            DomainEvent::HandlerFailed { .. } => "handler_failed",
        }
    }

    /// The topic this event is published on.
    pub fn topic(&self) -> String {
        match self {
            DomainEvent::IntentRouted { topic, .. } => topic.clone(),
            DomainEvent::ClarificationRequested { .. } => topics::ROUTER_CLARIFICATION.to_string(),
            DomainEvent::RoutingFailed { .. } => topics::ROUTER_ERROR.to_string(),
            DomainEvent::CapabilityResponded { capability, .. } => topics::response(capability),
            DomainEvent::CommandCompleted { .. } => topics::COORDINATOR_COMPLETED.to_string(),
            DomainEvent::CommandFailed { .. } => topics::COORDINATOR_FAILED.to_string(),
            DomainEvent::NotificationReady { .. } => topics::NOTIFICATION_NEW.to_string(),
            DomainEvent::ProfileUpdated { .. } => topics::LEARNING_PROFILE_UPDATED.to_string(),
            DomainEvent::HandlerFailed { topic, .. } => {
                topics::error(topics::component_of(topic))
            }
        }
    }

    /// Serialize into a channel envelope.
    pub fn to_event(&self) -> Result<Event, serde_json::Error> {
        Ok(Event::new(self.topic(), serde_json::to_value(self)?))
    }

    /// Parse a domain event back out of an envelope payload.
    pub fn from_event(event: &Event) -> Result<Self, serde_json::Error> {
        event.payload_as()
    }
}
